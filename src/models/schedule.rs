use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::AppResult;
use crate::models::conflict::ScheduleConflict;
use crate::models::pattern::PatternSnapshot;
use crate::models::time_block::{TimeBlock, TimeRange};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HorizonKind {
    Day,
    Week,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleHorizon {
    pub kind: HorizonKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ScheduleHorizon {
    pub fn day(start: DateTime<Utc>) -> Self {
        Self {
            kind: HorizonKind::Day,
            start,
            end: start + Duration::days(1),
        }
    }

    pub fn week(start: DateTime<Utc>) -> Self {
        Self {
            kind: HorizonKind::Week,
            start,
            end: start + Duration::days(7),
        }
    }

    pub fn custom(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            kind: HorizonKind::Custom,
            start,
            end,
        }
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }

    pub fn validate(&self) -> AppResult<()> {
        TimeRange::checked(self.start, self.end).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    InvalidInput,
    Unplaceable,
    UnresolvableConflict,
    UpstreamDataUnavailable,
    ConstraintUnmet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleIssue {
    pub kind: IssueKind,
    #[serde(default)]
    pub subject_id: Option<String>,
    pub message: String,
}

impl ScheduleIssue {
    pub fn new(kind: IssueKind, subject_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject_id: subject_id.map(str::to_string),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnplacedReason {
    NoSufficientInterval,
    NoValidCandidate,
    Cancelled,
}

impl UnplacedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UnplacedReason::NoSufficientInterval => "no_sufficient_interval",
            UnplacedReason::NoValidCandidate => "no_valid_candidate",
            UnplacedReason::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnplacedBlock {
    pub id: String,
    pub title: String,
    pub duration_minutes: i64,
    pub reason: UnplacedReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedSchedule {
    pub id: String,
    pub owner_id: String,
    pub horizon: ScheduleHorizon,
    pub blocks: Vec<TimeBlock>,
    #[serde(default)]
    pub conflicts: Vec<ScheduleConflict>,
    #[serde(default)]
    pub unplaced: Vec<UnplacedBlock>,
    #[serde(default)]
    pub issues: Vec<ScheduleIssue>,
    pub optimization_score: f64,
    pub focus_time_protected: bool,
    pub habits_preserved: bool,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub revision: u32,
    /// Pattern data the schedule was planned against; revisions reuse it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patterns: Option<PatternSnapshot>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

impl GeneratedSchedule {
    pub fn block(&self, id: &str) -> Option<&TimeBlock> {
        self.blocks.iter().find(|block| block.id == id)
    }

    /// True when only explicitly accepted conflicts remain.
    pub fn is_stable(&self) -> bool {
        self.conflicts.iter().all(|conflict| conflict.accepted)
    }
}
