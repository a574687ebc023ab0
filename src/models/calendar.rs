use serde::{Deserialize, Serialize};

/// Event as synced from an external calendar; times are raw ISO-8601 strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEvent {
    pub event_id: String,
    pub source: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub title: String,
    /// IANA zone for timestamps without an offset.
    #[serde(default)]
    pub timezone: Option<String>,
}

impl ExternalEvent {
    pub fn block_id(&self) -> String {
        format!("{}:{}", self.source.trim(), self.event_id.trim())
    }
}
