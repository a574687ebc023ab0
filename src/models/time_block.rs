use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::error::{AppError, AppResult};
use crate::models::pattern::EnergyLevel;

/// Longest duration or flexibility a single item may carry: the widest planning horizon.
pub const MAX_SPAN_MINUTES: i64 = 62 * 24 * 60;

/// Ordinal priority 1–5. Serialized as the bare ordinal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Minimal,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn ordinal(self) -> u8 {
        match self {
            Priority::Minimal => 1,
            Priority::Low => 2,
            Priority::Medium => 3,
            Priority::High => 4,
            Priority::Critical => 5,
        }
    }

    pub fn from_ordinal(value: u8) -> Option<Self> {
        match value {
            1 => Some(Priority::Minimal),
            2 => Some(Priority::Low),
            3 => Some(Priority::Medium),
            4 => Some(Priority::High),
            5 => Some(Priority::Critical),
            _ => None,
        }
    }

    /// Clamping variant used by derived rules.
    pub fn from_ordinal_clamped(value: i64) -> Self {
        Self::from_ordinal(value.clamp(1, 5) as u8).unwrap_or_default()
    }

    /// Ordering weight used by the placer.
    pub fn weight(self) -> f64 {
        match self {
            Priority::Critical => 1.2,
            Priority::High => 1.0,
            Priority::Medium => 0.7,
            Priority::Low => 0.4,
            Priority::Minimal => 0.2,
        }
    }

    pub fn normalized(self) -> f64 {
        self.ordinal() as f64 / 5.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::from_ordinal(value).ok_or_else(|| format!("优先级必须在 1-5 之间，收到 {value}"))
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.ordinal()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    DeepWork,
    Creative,
    Learning,
    Meeting,
    Communication,
    Administrative,
    Routine,
    Personal,
    #[default]
    #[serde(other)]
    Other,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::DeepWork => "deep_work",
            TaskType::Creative => "creative",
            TaskType::Learning => "learning",
            TaskType::Meeting => "meeting",
            TaskType::Communication => "communication",
            TaskType::Administrative => "administrative",
            TaskType::Routine => "routine",
            TaskType::Personal => "personal",
            TaskType::Other => "other",
        }
    }

    /// Energy the task type asks for; `None` means no preference.
    pub fn energy_demand(self) -> Option<EnergyLevel> {
        match self {
            TaskType::DeepWork | TaskType::Creative | TaskType::Learning => Some(EnergyLevel::High),
            TaskType::Meeting | TaskType::Communication => Some(EnergyLevel::Medium),
            TaskType::Administrative | TaskType::Routine => Some(EnergyLevel::Low),
            TaskType::Personal | TaskType::Other => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open interval `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn checked(start: DateTime<Utc>, end: DateTime<Utc>) -> AppResult<Self> {
        if end <= start {
            return Err(AppError::validation_with_details(
                "结束时间必须晚于开始时间",
                json!({"start": start.to_rfc3339(), "end": end.to_rfc3339()}),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeRange { start, end })
    }

    pub fn overlap_minutes(&self, other: &TimeRange) -> i64 {
        self.intersect(other)
            .map(|range| range.duration_minutes())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeBlock {
    pub id: String,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub duration_minutes: i64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub flexibility_minutes: i64,
    #[serde(default)]
    pub is_focus_time: bool,
    #[serde(default)]
    pub is_habit: bool,
    #[serde(default)]
    pub buffer_before_minutes: i64,
    #[serde(default)]
    pub buffer_after_minutes: i64,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

impl TimeBlock {
    /// Fixed block spanning `range`; used for external events and disruption placeholders.
    pub fn fixed(id: impl Into<String>, title: impl Into<String>, range: TimeRange) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            start_at: range.start,
            end_at: range.end,
            duration_minutes: range.duration_minutes(),
            priority: Priority::High,
            task_type: TaskType::Other,
            category: None,
            flexibility_minutes: 0,
            is_focus_time: false,
            is_habit: false,
            buffer_before_minutes: 0,
            buffer_after_minutes: 0,
            source: None,
            metadata: Map::new(),
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.id.trim().is_empty() {
            return Err(AppError::validation("时间块缺少 ID"));
        }
        if self.end_at <= self.start_at {
            return Err(AppError::validation_with_details(
                "时间块结束时间必须晚于开始时间",
                json!({"blockId": self.id, "startAt": self.start_at, "endAt": self.end_at}),
            ));
        }
        let actual = (self.end_at - self.start_at).num_minutes();
        if actual != self.duration_minutes {
            return Err(AppError::validation_with_details(
                "时间块时长与起止时间不一致",
                json!({"blockId": self.id, "durationMinutes": self.duration_minutes, "actual": actual}),
            ));
        }
        if self.flexibility_minutes < 0 {
            return Err(AppError::validation_with_details(
                "灵活度不能为负数",
                json!({"blockId": self.id, "flexibilityMinutes": self.flexibility_minutes}),
            ));
        }
        validate_span(&self.id, "durationMinutes", self.duration_minutes)?;
        validate_span(&self.id, "flexibilityMinutes", self.flexibility_minutes)?;
        validate_buffers(
            &self.id,
            self.buffer_before_minutes,
            self.buffer_after_minutes,
            self.duration_minutes,
        )
    }

    pub fn is_fixed(&self) -> bool {
        self.flexibility_minutes == 0 || self.is_habit
    }

    pub fn is_external(&self) -> bool {
        self.source.is_some()
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start_at, self.end_at)
    }

    /// Range including buffers on both sides.
    pub fn buffered_range(&self) -> TimeRange {
        TimeRange::new(
            offset_minutes(self.start_at, self.buffer_before_minutes.saturating_neg()),
            offset_minutes(self.end_at, self.buffer_after_minutes),
        )
    }

    pub fn overlaps(&self, other: &TimeBlock) -> bool {
        self.range().overlaps(&other.range())
    }

    /// Moves the block keeping its duration; identity and category are untouched.
    pub fn shift_to(&mut self, start: DateTime<Utc>) {
        self.start_at = start;
        self.end_at = offset_minutes(start, self.duration_minutes);
    }

    /// Re-times the block to `range`, shrinking buffers if they no longer fit.
    pub fn retime(&mut self, range: TimeRange) {
        self.start_at = range.start;
        self.end_at = range.end;
        self.duration_minutes = range.duration_minutes();
        let buffers = self.buffer_before_minutes + self.buffer_after_minutes;
        if buffers > self.duration_minutes && buffers > 0 {
            let ratio = self.duration_minutes as f64 / buffers as f64;
            self.buffer_before_minutes = (self.buffer_before_minutes as f64 * ratio).floor() as i64;
            self.buffer_after_minutes = (self.buffer_after_minutes as f64 * ratio).floor() as i64;
        }
    }

    pub fn category_or_type(&self) -> String {
        self.category
            .as_deref()
            .map(normalize_tag)
            .unwrap_or_else(|| self.task_type.as_str().to_string())
    }
}

/// `instant` shifted by `minutes`, saturating at the representable range.
pub fn offset_minutes(instant: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    Duration::try_minutes(minutes)
        .and_then(|delta| instant.checked_add_signed(delta))
        .unwrap_or(if minutes < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

pub(crate) fn validate_span(id: &str, field: &str, minutes: i64) -> AppResult<()> {
    if minutes > MAX_SPAN_MINUTES {
        return Err(AppError::validation_with_details(
            format!("{field} 超出上限 {MAX_SPAN_MINUTES} 分钟"),
            json!({"id": id, field: minutes, "maxMinutes": MAX_SPAN_MINUTES}),
        ));
    }
    Ok(())
}

pub(crate) fn validate_buffers(id: &str, before: i64, after: i64, duration: i64) -> AppResult<()> {
    if before < 0 || after < 0 {
        return Err(AppError::validation_with_details(
            "缓冲时间不能为负数",
            json!({"id": id, "bufferBeforeMinutes": before, "bufferAfterMinutes": after}),
        ));
    }
    if before > duration || after > duration || before + after > duration {
        return Err(AppError::validation_with_details(
            "缓冲时间不能超过时长",
            json!({
                "id": id,
                "bufferBeforeMinutes": before,
                "bufferAfterMinutes": after,
                "durationMinutes": duration,
            }),
        ));
    }
    Ok(())
}

pub(crate) fn normalize_tag(value: &str) -> String {
    value.trim().to_lowercase()
}
