use std::path::Path;

use chrono::Weekday;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::time_block::MAX_SPAN_MINUTES;

const DEFAULT_WORKDAY_START: i16 = 9 * 60;
const DEFAULT_WORKDAY_END: i16 = 18 * 60;
const DEFAULT_GRANULARITY_MINUTES: i64 = 60;
const DEFAULT_HORIZON_DAYS: i64 = 7;
const DEFAULT_FLEXIBILITY_MINUTES: i64 = 60;
const DEFAULT_MIN_PATTERN_OCCURRENCES: usize = 3;
const DEFAULT_INTERRUPTION_THRESHOLD: f64 = 1.0;
const DEFAULT_SPLIT_THRESHOLD_MINUTES: i64 = 60;
const DEFAULT_COMPRESS_MIN_RATIO: f64 = 0.5;
const DEFAULT_MAX_RESOLUTION_ROUNDS: usize = 32;
const DEFAULT_MAX_ALTERNATIVES: usize = 3;
const DEFAULT_TIMEZONE: &str = "UTC";
const MAX_HORIZON_DAYS: i64 = 62;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoringWeights {
    pub priority: f64,
    pub time_preference: f64,
    pub focus_protection: f64,
    pub habit_preservation: f64,
    pub energy: f64,
    pub conflict_avoidance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            priority: 0.30,
            time_preference: 0.20,
            focus_protection: 0.20,
            habit_preservation: 0.15,
            energy: 0.10,
            conflict_avoidance: 0.05,
        }
    }
}

impl ScoringWeights {
    pub fn total(&self) -> f64 {
        self.priority
            + self.time_preference
            + self.focus_protection
            + self.habit_preservation
            + self.energy
            + self.conflict_avoidance
    }

    fn as_pairs(&self) -> [(&'static str, f64); 6] {
        [
            ("priority", self.priority),
            ("timePreference", self.time_preference),
            ("focusProtection", self.focus_protection),
            ("habitPreservation", self.habit_preservation),
            ("energy", self.energy),
            ("conflictAvoidance", self.conflict_avoidance),
        ]
    }
}

/// Tunables for one engine instance. Every field has a default, so partial files load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub workday_start_minute: i16,
    pub workday_end_minute: i16,
    pub working_weekdays: Vec<Weekday>,
    pub slot_granularity_minutes: i64,
    pub horizon_days: i64,
    pub default_flexibility_minutes: i64,
    pub min_pattern_occurrences: usize,
    pub interruption_threshold: f64,
    pub weights: ScoringWeights,
    pub split_threshold_minutes: i64,
    pub allow_compress: bool,
    pub compress_min_ratio: f64,
    pub protect_focus_time: bool,
    pub max_resolution_rounds: usize,
    pub max_alternatives: usize,
    pub default_timezone: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workday_start_minute: DEFAULT_WORKDAY_START,
            workday_end_minute: DEFAULT_WORKDAY_END,
            working_weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            slot_granularity_minutes: DEFAULT_GRANULARITY_MINUTES,
            horizon_days: DEFAULT_HORIZON_DAYS,
            default_flexibility_minutes: DEFAULT_FLEXIBILITY_MINUTES,
            min_pattern_occurrences: DEFAULT_MIN_PATTERN_OCCURRENCES,
            interruption_threshold: DEFAULT_INTERRUPTION_THRESHOLD,
            weights: ScoringWeights::default(),
            split_threshold_minutes: DEFAULT_SPLIT_THRESHOLD_MINUTES,
            allow_compress: false,
            compress_min_ratio: DEFAULT_COMPRESS_MIN_RATIO,
            protect_focus_time: true,
            max_resolution_rounds: DEFAULT_MAX_RESOLUTION_ROUNDS,
            max_alternatives: DEFAULT_MAX_ALTERNATIVES,
            default_timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

/// Partial update; `None` leaves the field unchanged.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettingsUpdate {
    pub workday_start_minute: Option<i16>,
    pub workday_end_minute: Option<i16>,
    pub working_weekdays: Option<Vec<Weekday>>,
    pub slot_granularity_minutes: Option<i64>,
    pub horizon_days: Option<i64>,
    pub weights: Option<ScoringWeights>,
    pub allow_compress: Option<bool>,
    pub protect_focus_time: Option<bool>,
    pub default_timezone: Option<String>,
}

impl EngineSettings {
    pub fn load_from_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let settings = if is_json {
            Self::from_json_str(&raw)?
        } else {
            Self::from_yaml_str(&raw)?
        };
        debug!(target: "app::settings", path = %path.display(), "engine settings loaded");
        Ok(settings)
    }

    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        let settings: EngineSettings = serde_yaml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_str(raw: &str) -> AppResult<Self> {
        let settings: EngineSettings = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        ensure_valid_minute(self.workday_start_minute)?;
        ensure_valid_minute(self.workday_end_minute)?;
        if self.workday_start_minute >= self.workday_end_minute {
            return Err(AppError::config("工作时间段无效：开始时间必须早于结束时间"));
        }
        if self.working_weekdays.is_empty() {
            return Err(AppError::config("至少需要一个工作日"));
        }
        if self.slot_granularity_minutes <= 0 || self.slot_granularity_minutes > 24 * 60 {
            return Err(AppError::config(format!(
                "排程粒度无效: {} 分钟",
                self.slot_granularity_minutes
            )));
        }
        if !(1..=MAX_HORIZON_DAYS).contains(&self.horizon_days) {
            return Err(AppError::config(format!(
                "规划范围必须在 1-{MAX_HORIZON_DAYS} 天之间"
            )));
        }
        if !(0..=MAX_SPAN_MINUTES).contains(&self.default_flexibility_minutes) {
            return Err(AppError::config(format!(
                "默认灵活度必须在 0-{MAX_SPAN_MINUTES} 分钟之间"
            )));
        }
        if self.min_pattern_occurrences == 0 {
            return Err(AppError::config("模式最少样本数必须大于 0"));
        }
        if !self.interruption_threshold.is_finite() || self.interruption_threshold < 0.0 {
            return Err(AppError::config("打断阈值无效"));
        }
        for (name, weight) in self.weights.as_pairs() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(AppError::config(format!("评分权重 {name} 无效")));
            }
        }
        if self.weights.total() <= 0.0 {
            return Err(AppError::config("评分权重之和必须大于 0"));
        }
        if self.split_threshold_minutes <= 0 {
            return Err(AppError::config("拆分阈值必须大于 0"));
        }
        if !(self.compress_min_ratio > 0.0 && self.compress_min_ratio <= 1.0) {
            return Err(AppError::config("压缩比例必须在 (0, 1] 之间"));
        }
        if self.max_resolution_rounds == 0 || self.max_alternatives == 0 {
            return Err(AppError::config("冲突解决轮数与备选数量必须大于 0"));
        }
        self.timezone()?;
        Ok(())
    }

    pub fn apply(&self, update: EngineSettingsUpdate) -> AppResult<Self> {
        let mut next = self.clone();
        if let Some(start) = update.workday_start_minute {
            ensure_valid_minute(start)?;
            next.workday_start_minute = start;
        }
        if let Some(end) = update.workday_end_minute {
            ensure_valid_minute(end)?;
            next.workday_end_minute = end;
        }
        if let Some(weekdays) = update.working_weekdays {
            next.working_weekdays = weekdays;
        }
        if let Some(granularity) = update.slot_granularity_minutes {
            next.slot_granularity_minutes = granularity;
        }
        if let Some(days) = update.horizon_days {
            next.horizon_days = days;
        }
        if let Some(weights) = update.weights {
            next.weights = weights;
        }
        if let Some(allow) = update.allow_compress {
            next.allow_compress = allow;
        }
        if let Some(protect) = update.protect_focus_time {
            next.protect_focus_time = protect;
        }
        if let Some(timezone) = update.default_timezone {
            let normalized = timezone.trim().to_string();
            if normalized.is_empty() {
                return Err(AppError::config("时区不能为空"));
            }
            next.default_timezone = normalized;
        }
        next.validate()?;
        Ok(next)
    }

    pub fn timezone(&self) -> AppResult<Tz> {
        parse_timezone(&self.default_timezone)
    }

    pub fn works_on(&self, weekday: Weekday) -> bool {
        self.working_weekdays.contains(&weekday)
    }
}

pub fn parse_timezone(name: &str) -> AppResult<Tz> {
    name.trim().parse::<Tz>().map_err(|err| {
        AppError::validation_with_details(
            "未知的时区",
            json!({"timezone": name, "error": err.to_string()}),
        )
    })
}

fn ensure_valid_minute(minute: i16) -> AppResult<()> {
    if !(0..=(24 * 60)).contains(&minute) {
        return Err(AppError::config(format!(
            "时间必须位于 0-1440 分钟之间，收到 {minute}"
        )));
    }
    Ok(())
}
