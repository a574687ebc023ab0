use chrono::{Datelike, Duration, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::models::time_block::{normalize_tag, Priority, TimeRange};

const MINUTES_PER_DAY: u32 = 24 * 60;
const SOFT_PENALTY_SCALE: f64 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintKind {
    /// No block may touch `[startMinute, endMinute)` on the given weekday (every day if unset).
    TimeWindowExclusion {
        #[serde(default)]
        weekday: Option<Weekday>,
        #[serde(rename = "startMinute")]
        start_minute: u32,
        #[serde(rename = "endMinute")]
        end_minute: u32,
    },
    /// Caps scheduled minutes per day, optionally only for one category.
    DurationCap {
        #[serde(rename = "maxMinutesPerDay")]
        max_minutes_per_day: i64,
        #[serde(default)]
        category: Option<String>,
    },
    /// Requires `minPerWeek` blocks whose title or category matches `subject`.
    FrequencyMinimum {
        subject: String,
        #[serde(rename = "minPerWeek")]
        min_per_week: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConstraint {
    pub id: String,
    pub kind: ConstraintKind,
    #[serde(default)]
    pub priority: Priority,
    /// 0 = hard constraint; (0, 1] = soft, larger means more tolerant.
    #[serde(default)]
    pub flexibility_weight: f64,
}

impl ScheduleConstraint {
    pub fn validate(&self) -> AppResult<()> {
        if !(0.0..=1.0).contains(&self.flexibility_weight) {
            return Err(AppError::validation_with_details(
                "约束灵活权重必须在 0 到 1 之间",
                json!({"constraintId": self.id, "flexibilityWeight": self.flexibility_weight}),
            ));
        }
        match &self.kind {
            ConstraintKind::TimeWindowExclusion {
                start_minute,
                end_minute,
                ..
            } => {
                if start_minute >= end_minute || *end_minute > MINUTES_PER_DAY {
                    return Err(AppError::validation_with_details(
                        "排除时间窗口无效",
                        json!({"constraintId": self.id, "startMinute": start_minute, "endMinute": end_minute}),
                    ));
                }
            }
            ConstraintKind::DurationCap {
                max_minutes_per_day,
                ..
            } => {
                if *max_minutes_per_day <= 0 {
                    return Err(AppError::validation_with_details(
                        "每日时长上限必须大于 0",
                        json!({"constraintId": self.id, "maxMinutesPerDay": max_minutes_per_day}),
                    ));
                }
            }
            ConstraintKind::FrequencyMinimum {
                subject,
                min_per_week,
            } => {
                if subject.trim().is_empty() || *min_per_week == 0 {
                    return Err(AppError::validation_with_details(
                        "频率约束需要主题且每周至少一次",
                        json!({"constraintId": self.id, "subject": subject, "minPerWeek": min_per_week}),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn is_blocking(&self) -> bool {
        self.flexibility_weight <= 0.0
    }

    /// Score deduction applied when a soft constraint is violated.
    pub fn soft_penalty(&self) -> f64 {
        if self.is_blocking() {
            return 0.0;
        }
        SOFT_PENALTY_SCALE * (1.0 - self.flexibility_weight) * self.priority.normalized()
    }

    /// Whether `range` touches an excluded window. Other kinds never exclude.
    pub fn excludes(&self, range: &TimeRange) -> bool {
        let ConstraintKind::TimeWindowExclusion {
            weekday,
            start_minute,
            end_minute,
        } = &self.kind
        else {
            return false;
        };

        let mut day = range.start.date_naive();
        let last_day = range.end.date_naive();
        while day <= last_day {
            if weekday.map_or(true, |w| day.weekday() == w) {
                let midnight = day.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
                if let Some(midnight) = midnight {
                    let window = TimeRange::new(
                        midnight + Duration::minutes(*start_minute as i64),
                        midnight + Duration::minutes(*end_minute as i64),
                    );
                    if window.overlaps(range) {
                        return true;
                    }
                }
            }
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        false
    }

    /// Whether a block with this category falls under a duration cap.
    pub fn caps_category(&self, category: &str) -> bool {
        match &self.kind {
            ConstraintKind::DurationCap {
                category: Some(capped),
                ..
            } => normalize_tag(capped) == normalize_tag(category),
            ConstraintKind::DurationCap { category: None, .. } => true,
            _ => false,
        }
    }
}
