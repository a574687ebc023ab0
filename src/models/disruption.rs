use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::time_block::TimeRange;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisruptionKind {
    MeetingOverrun,
    UrgentTask,
    EnergyLevelChange,
    ExternalEvent,
}

impl DisruptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DisruptionKind::MeetingOverrun => "meeting_overrun",
            DisruptionKind::UrgentTask => "urgent_task",
            DisruptionKind::EnergyLevelChange => "energy_level_change",
            DisruptionKind::ExternalEvent => "external_event",
        }
    }
}

/// Runtime event invalidating part of a schedule.
///
/// Recognized metadata keys:
/// - `meeting_overrun`: `blockId` of the overrunning meeting (optional)
/// - `urgent_task`: `id`, `title`, `taskType` of the urgent work (all optional)
/// - `energy_level_change`: `energy` = `low` | `medium` | `high` (required)
/// - `external_event`: `event`, an external calendar event (optional)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Disruption {
    #[serde(rename = "type")]
    pub kind: DisruptionKind,
    pub time_range: TimeRange,
    #[serde(default)]
    pub metadata: JsonValue,
}
