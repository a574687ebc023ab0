use std::collections::BTreeSet;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::models::calendar::ExternalEvent;
use crate::models::conflict::ScheduleConflict;
use crate::models::schedule::{IssueKind, ScheduleIssue};
use crate::models::time_block::{Priority, TaskType, TimeBlock, TimeRange};
use crate::services::conflict_detector::ConflictDetector;
use crate::services::schedule_utils;
use crate::services::settings_service::{parse_timezone, EngineSettings};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IntegratedCalendar {
    /// Normalized events sorted by start.
    pub timeline: Vec<TimeBlock>,
    pub conflicts: Vec<ScheduleConflict>,
    /// Working-hour time not covered by any event.
    pub free_intervals: Vec<TimeRange>,
    pub issues: Vec<ScheduleIssue>,
}

pub struct CalendarIntegrator<'a> {
    settings: &'a EngineSettings,
}

impl<'a> CalendarIntegrator<'a> {
    pub fn new(settings: &'a EngineSettings) -> Self {
        Self { settings }
    }

    pub fn integrate(&self, events: &[ExternalEvent], horizon: &TimeRange) -> IntegratedCalendar {
        let default_zone = self.settings.timezone().unwrap_or(chrono_tz::UTC);
        let mut seen = BTreeSet::new();
        let mut timeline = Vec::with_capacity(events.len());
        let mut issues = Vec::new();

        for event in events {
            let block_id = event.block_id();
            let mut block = match normalize_event(event, default_zone) {
                Ok(block) => block,
                Err(err) => {
                    warn!(
                        target: "app::scheduler::calendar",
                        event = %block_id,
                        error = %err,
                        "skipping malformed external event"
                    );
                    issues.push(ScheduleIssue::new(
                        IssueKind::InvalidInput,
                        Some(&block_id),
                        err.to_string(),
                    ));
                    continue;
                }
            };

            if !seen.insert(block.id.clone()) {
                issues.push(ScheduleIssue::new(
                    IssueKind::InvalidInput,
                    Some(&block.id),
                    format!("重复的外部事件: {}", block.id),
                ));
                continue;
            }
            let Some(visible) = block.range().intersect(horizon) else {
                debug!(
                    target: "app::scheduler::calendar",
                    event = %block.id,
                    "external event outside planning horizon"
                );
                continue;
            };
            if visible != block.range() {
                block.retime(visible);
                block.metadata.insert("clippedToHorizon".into(), json!(true));
            }
            timeline.push(block);
        }

        timeline.sort_by(|a, b| a.start_at.cmp(&b.start_at).then_with(|| a.id.cmp(&b.id)));
        let conflicts = ConflictDetector::new(self.settings).detect(&timeline, None);

        let windows = schedule_utils::working_windows(horizon, self.settings);
        let busy: Vec<TimeRange> = timeline.iter().map(TimeBlock::range).collect();
        let free_intervals = schedule_utils::free_intervals(&windows, &busy);

        debug!(
            target: "app::scheduler::calendar",
            events = timeline.len(),
            conflicts = conflicts.len(),
            free = free_intervals.len(),
            "external calendars integrated"
        );

        IntegratedCalendar {
            timeline,
            conflicts,
            free_intervals,
            issues,
        }
    }
}

/// Converts one external event into a fixed, source-tagged block in UTC.
pub fn normalize_event(event: &ExternalEvent, default_zone: Tz) -> AppResult<TimeBlock> {
    let source = event.source.trim();
    let event_id = event.event_id.trim();
    if source.is_empty() || event_id.is_empty() {
        return Err(AppError::validation_with_details(
            "外部事件缺少来源或 ID",
            json!({"source": event.source, "eventId": event.event_id}),
        ));
    }

    let zone = match event.timezone.as_deref() {
        Some(name) if !name.trim().is_empty() => parse_timezone(name)?,
        _ => default_zone,
    };
    let start = schedule_utils::parse_datetime_in(&event.start_time, zone)?;
    let end = schedule_utils::parse_datetime_in(&event.end_time, zone)?;
    let range = TimeRange::checked(start, end)?;

    let title = if event.title.trim().is_empty() {
        format!("{source} 日程")
    } else {
        event.title.trim().to_string()
    };

    let mut block = TimeBlock::fixed(event.block_id(), title, range);
    block.priority = Priority::High;
    block.task_type = TaskType::Meeting;
    block.source = Some(source.to_string());
    block
        .metadata
        .insert("eventId".into(), JsonValue::String(event_id.to_string()));
    block
        .metadata
        .insert("timezone".into(), JsonValue::String(zone.name().to_string()));
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::conflict::ConflictType;
    use chrono::{DateTime, TimeZone, Utc};

    fn dt(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, hour, minute, 0)
            .single()
            .expect("valid datetime")
    }

    fn event(source: &str, id: &str, start: &str, end: &str) -> ExternalEvent {
        ExternalEvent {
            event_id: id.into(),
            source: source.into(),
            start_time: start.into(),
            end_time: end.into(),
            title: format!("{source} {id}"),
            timezone: None,
        }
    }

    fn day() -> TimeRange {
        TimeRange::new(dt(0, 0), dt(0, 0) + chrono::Duration::days(1))
    }

    #[test]
    fn cross_source_overlap_is_a_resource_conflict() {
        let settings = EngineSettings::default();
        let calendar = CalendarIntegrator::new(&settings).integrate(
            &[
                event("google", "1", "2025-05-01T09:00:00Z", "2025-05-01T10:00:00Z"),
                event("outlook", "7", "2025-05-01T09:30:00Z", "2025-05-01T10:30:00Z"),
            ],
            &day(),
        );
        assert_eq!(calendar.timeline.len(), 2);
        assert_eq!(calendar.conflicts.len(), 1);
        assert_eq!(calendar.conflicts[0].conflict_type, ConflictType::ResourceConflict);
        assert_eq!(calendar.conflicts[0].severity, 4);
        assert!(calendar.conflicts[0].suggested_resolutions.is_empty());
    }

    #[test]
    fn invalid_events_are_reported_and_skipped() {
        let settings = EngineSettings::default();
        let calendar = CalendarIntegrator::new(&settings).integrate(
            &[
                event("google", "bad", "2025-05-01T11:00:00Z", "2025-05-01T10:00:00Z"),
                event("google", "garbled", "next tuesday", "2025-05-01T10:00:00Z"),
                event("google", "ok", "2025-05-01T13:00:00Z", "2025-05-01T14:00:00Z"),
                event("google", "ok", "2025-05-01T15:00:00Z", "2025-05-01T16:00:00Z"),
            ],
            &day(),
        );
        assert_eq!(calendar.timeline.len(), 1);
        assert_eq!(calendar.issues.len(), 3);
        assert!(calendar
            .issues
            .iter()
            .all(|issue| issue.kind == IssueKind::InvalidInput));
    }

    #[test]
    fn free_intervals_complement_events_within_working_hours() {
        let settings = EngineSettings::default();
        let calendar = CalendarIntegrator::new(&settings).integrate(
            &[event("google", "1", "2025-05-01T12:00:00Z", "2025-05-01T13:00:00Z")],
            &day(),
        );
        assert_eq!(
            calendar.free_intervals,
            vec![TimeRange::new(dt(9, 0), dt(12, 0)), TimeRange::new(dt(13, 0), dt(18, 0))]
        );
    }

    #[test]
    fn naive_times_use_event_timezone() -> AppResult<()> {
        let mut shanghai = event("feishu", "42", "2025-05-01T17:00:00", "2025-05-01T18:00:00");
        shanghai.timezone = Some("Asia/Shanghai".into());
        let block = normalize_event(&shanghai, chrono_tz::UTC)?;
        assert_eq!(block.start_at, dt(9, 0));
        assert_eq!(block.id, "feishu:42");
        assert!(block.is_fixed());
        assert_eq!(block.source.as_deref(), Some("feishu"));
        Ok(())
    }
}
