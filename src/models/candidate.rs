use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::error::{AppError, AppResult};
use crate::models::time_block::{
    normalize_tag, offset_minutes, validate_buffers, validate_span, Priority, TaskType, TimeBlock,
    TimeRange,
};

/// Normalized schedulable item handed in by the task layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateItem {
    pub id: String,
    pub title: String,
    pub duration_minutes: i64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub requires_focus: bool,
    #[serde(default)]
    pub is_habit: bool,
    #[serde(default)]
    pub preferred_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub flexibility_minutes: Option<i64>,
    #[serde(default)]
    pub buffer_before_minutes: i64,
    #[serde(default)]
    pub buffer_after_minutes: i64,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

/// Result of partitioning a candidate: seeded as-is, or handed to the placer.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedulable {
    Fixed(TimeBlock),
    Flexible(PlacementRequest),
}

impl CandidateItem {
    pub fn validate(&self) -> AppResult<()> {
        if self.id.trim().is_empty() {
            return Err(AppError::validation("候选任务缺少 ID"));
        }
        if self.duration_minutes <= 0 {
            return Err(AppError::validation_with_details(
                "任务时长必须大于 0",
                json!({"id": self.id, "durationMinutes": self.duration_minutes}),
            ));
        }
        validate_span(&self.id, "durationMinutes", self.duration_minutes)?;
        if let Some(flexibility) = self.flexibility_minutes {
            if flexibility < 0 {
                return Err(AppError::validation_with_details(
                    "灵活度不能为负数",
                    json!({"id": self.id, "flexibilityMinutes": flexibility}),
                ));
            }
            validate_span(&self.id, "flexibilityMinutes", flexibility)?;
        }
        validate_buffers(
            &self.id,
            self.buffer_before_minutes,
            self.buffer_after_minutes,
            self.duration_minutes,
        )
    }

    /// Validates and partitions the item. Habits with a start and zero-flexibility items are
    /// fixed; everything else is placed.
    pub fn into_schedulable(self, default_flexibility_minutes: i64) -> AppResult<Schedulable> {
        self.validate()?;
        let flexibility = self
            .flexibility_minutes
            .unwrap_or(default_flexibility_minutes);

        let fixed = flexibility == 0 || self.is_habit;
        match (fixed, self.preferred_start_time) {
            (true, Some(start)) => {
                let range =
                    TimeRange::checked(start, offset_minutes(start, self.duration_minutes))?;
                let block = TimeBlock {
                    id: self.id,
                    title: self.title,
                    start_at: range.start,
                    end_at: range.end,
                    duration_minutes: self.duration_minutes,
                    priority: self.priority,
                    task_type: self.task_type,
                    category: self.category,
                    flexibility_minutes: flexibility,
                    is_focus_time: self.requires_focus,
                    is_habit: self.is_habit,
                    buffer_before_minutes: self.buffer_before_minutes,
                    buffer_after_minutes: self.buffer_after_minutes,
                    source: None,
                    metadata: self.metadata,
                };
                Ok(Schedulable::Fixed(block))
            }
            (true, None) if !self.is_habit => Err(AppError::validation_with_details(
                "固定任务必须指定开始时间",
                json!({"id": self.id}),
            )),
            _ => Ok(Schedulable::Flexible(PlacementRequest {
                id: self.id,
                title: self.title,
                duration_minutes: self.duration_minutes,
                priority: self.priority,
                task_type: self.task_type,
                category: self.category,
                flexibility_minutes: flexibility,
                is_focus_time: self.requires_focus,
                is_habit: self.is_habit,
                buffer_before_minutes: self.buffer_before_minutes,
                buffer_after_minutes: self.buffer_after_minutes,
                preferred_start: self.preferred_start_time,
                earliest_start: None,
                excluded_starts: Vec::new(),
                metadata: self.metadata,
            })),
        }
    }
}

/// A block waiting for a start time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRequest {
    pub id: String,
    pub title: String,
    pub duration_minutes: i64,
    pub priority: Priority,
    pub task_type: TaskType,
    #[serde(default)]
    pub category: Option<String>,
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
    pub preferred_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub earliest_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub excluded_starts: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

impl PlacementRequest {
    /// Turns an already-placed block back into a request; the previous time is dropped.
    pub fn from_block(block: &TimeBlock) -> Self {
        Self {
            id: block.id.clone(),
            title: block.title.clone(),
            duration_minutes: block.duration_minutes,
            priority: block.priority,
            task_type: block.task_type,
            category: block.category.clone(),
            flexibility_minutes: block.flexibility_minutes,
            is_focus_time: block.is_focus_time,
            is_habit: block.is_habit,
            buffer_before_minutes: block.buffer_before_minutes,
            buffer_after_minutes: block.buffer_after_minutes,
            preferred_start: None,
            earliest_start: None,
            excluded_starts: Vec::new(),
            metadata: block.metadata.clone(),
        }
    }

    pub fn excluding(mut self, start: DateTime<Utc>) -> Self {
        if !self.excluded_starts.contains(&start) {
            self.excluded_starts.push(start);
        }
        self
    }

    pub fn not_before(mut self, start: DateTime<Utc>) -> Self {
        self.earliest_start = Some(match self.earliest_start {
            Some(current) if current > start => current,
            _ => start,
        });
        self
    }

    pub fn range_at(&self, start: DateTime<Utc>) -> TimeRange {
        TimeRange::new(start, offset_minutes(start, self.duration_minutes))
    }

    pub fn buffered_range_at(&self, start: DateTime<Utc>) -> TimeRange {
        TimeRange::new(
            offset_minutes(start, self.buffer_before_minutes.saturating_neg()),
            offset_minutes(
                offset_minutes(start, self.duration_minutes),
                self.buffer_after_minutes,
            ),
        )
    }

    pub fn category_or_type(&self) -> String {
        self.category
            .as_deref()
            .map(normalize_tag)
            .unwrap_or_else(|| self.task_type.as_str().to_string())
    }

    pub fn into_block(self, start: DateTime<Utc>) -> TimeBlock {
        let range = self.range_at(start);
        TimeBlock {
            id: self.id,
            title: self.title,
            start_at: range.start,
            end_at: range.end,
            duration_minutes: self.duration_minutes,
            priority: self.priority,
            task_type: self.task_type,
            category: self.category,
            flexibility_minutes: self.flexibility_minutes,
            is_focus_time: self.is_focus_time,
            is_habit: self.is_habit,
            buffer_before_minutes: self.buffer_before_minutes,
            buffer_after_minutes: self.buffer_after_minutes,
            source: None,
            metadata: self.metadata,
        }
    }
}
