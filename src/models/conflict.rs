use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::time_block::TimeBlock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Overlap,
    ConstraintViolation,
    ResourceConflict,
}

impl ConflictType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::Overlap => "overlap",
            ConflictType::ConstraintViolation => "constraint_violation",
            ConflictType::ResourceConflict => "resource_conflict",
        }
    }
}

/// Parameterless tag of a [`ResolutionStrategy`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RescheduleLowerPriority,
    SplitTask,
    SuggestAlternative,
    DeferToNextDay,
    Compress,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ResolutionStrategy {
    RescheduleLowerPriority,
    SplitTask {
        #[serde(rename = "thresholdMinutes")]
        threshold_minutes: i64,
    },
    SuggestAlternative {
        #[serde(rename = "maxAlternatives")]
        max_alternatives: usize,
    },
    DeferToNextDay,
    Compress {
        #[serde(rename = "minRatio")]
        min_ratio: f64,
    },
}

impl ResolutionStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            ResolutionStrategy::RescheduleLowerPriority => StrategyKind::RescheduleLowerPriority,
            ResolutionStrategy::SplitTask { .. } => StrategyKind::SplitTask,
            ResolutionStrategy::SuggestAlternative { .. } => StrategyKind::SuggestAlternative,
            ResolutionStrategy::DeferToNextDay => StrategyKind::DeferToNextDay,
            ResolutionStrategy::Compress { .. } => StrategyKind::Compress,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConflict {
    pub id: String,
    pub conflict_type: ConflictType,
    pub severity: u8,
    pub blocks: Vec<TimeBlock>,
    #[serde(default)]
    pub suggested_resolutions: Vec<ResolutionStrategy>,
    pub message: String,
    /// Set once the resolver gives up on this conflict; it then stays in the schedule.
    #[serde(default)]
    pub accepted: bool,
}

impl ScheduleConflict {
    pub fn block_ids(&self) -> Vec<&str> {
        self.blocks.iter().map(|block| block.id.as_str()).collect()
    }

    pub fn involves(&self, block_id: &str) -> bool {
        self.blocks.iter().any(|block| block.id == block_id)
    }

    pub fn all_fixed(&self) -> bool {
        self.blocks.iter().all(TimeBlock::is_fixed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Detected,
    Resolved,
    StillConflicting,
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlternativeSlot {
    pub block_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOutcome {
    pub conflict_id: String,
    pub strategy: StrategyKind,
    pub state: ResolutionState,
    #[serde(default)]
    pub moved_block_ids: Vec<String>,
    #[serde(default)]
    pub created_block_ids: Vec<String>,
    #[serde(default)]
    pub alternatives: Vec<AlternativeSlot>,
    pub message: String,
}

impl ResolutionOutcome {
    pub(crate) fn new(
        conflict_id: &str,
        strategy: StrategyKind,
        state: ResolutionState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            conflict_id: conflict_id.to_string(),
            strategy,
            state,
            moved_block_ids: Vec::new(),
            created_block_ids: Vec::new(),
            alternatives: Vec::new(),
            message: message.into(),
        }
    }
}
