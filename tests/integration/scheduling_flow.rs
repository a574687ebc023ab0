use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use cognical_scheduling_lib::models::calendar::ExternalEvent;
use cognical_scheduling_lib::models::candidate::CandidateItem;
use cognical_scheduling_lib::models::conflict::ConflictType;
use cognical_scheduling_lib::models::pattern::{HistoricalRecord, PatternSnapshot};
use cognical_scheduling_lib::models::schedule::{IssueKind, ScheduleHorizon, UnplacedReason};
use cognical_scheduling_lib::models::time_block::{Priority, TaskType, TimeBlock, TimeRange};
use cognical_scheduling_lib::{
    CancellationSignal, EngineSettings, ScheduleRequest, SchedulingEngine,
};
use serde_json::Map;

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, day, hour, minute, 0)
        .single()
        .expect("valid datetime")
}

fn engine() -> SchedulingEngine {
    SchedulingEngine::new(EngineSettings {
        workday_end_minute: 17 * 60,
        ..EngineSettings::default()
    })
    .expect("valid settings")
}

fn candidate(id: &str, minutes: i64, priority: Priority) -> CandidateItem {
    CandidateItem {
        id: id.into(),
        title: id.into(),
        duration_minutes: minutes,
        priority,
        task_type: TaskType::Other,
        category: None,
        requires_focus: false,
        is_habit: false,
        preferred_start_time: None,
        flexibility_minutes: None,
        buffer_before_minutes: 0,
        buffer_after_minutes: 0,
        metadata: Map::new(),
    }
}

fn productive_patterns() -> PatternSnapshot {
    PatternSnapshot {
        productive_hours: vec![9, 10, 11, 14, 15],
        is_sufficient: true,
        ..Default::default()
    }
}

fn request(candidates: Vec<CandidateItem>) -> ScheduleRequest {
    ScheduleRequest {
        owner_id: "user-1".into(),
        horizon: ScheduleHorizon::day(at(1, 0, 0)),
        candidates,
        fixed_blocks: Vec::new(),
        external_events: Vec::new(),
        patterns: Some(productive_patterns()),
        history: Vec::new(),
        constraints: Vec::new(),
        resolution_policy: Default::default(),
    }
}

fn event(source: &str, id: &str, start: &str, end: &str) -> ExternalEvent {
    ExternalEvent {
        event_id: id.into(),
        source: source.into(),
        start_time: start.into(),
        end_time: end.into(),
        title: format!("{source} sync"),
        timezone: None,
    }
}

#[test]
fn overlapping_calendars_surface_one_resource_conflict() {
    let engine = engine();
    let mut req = request(Vec::new());
    req.external_events = vec![
        event("google", "standup", "2025-05-01T09:00:00Z", "2025-05-01T10:00:00Z"),
        event("outlook", "review", "2025-05-01T09:30:00Z", "2025-05-01T10:30:00Z"),
    ];

    let schedule = engine
        .generate(&req, &CancellationSignal::new())
        .expect("schedule generated");

    assert_eq!(schedule.conflicts.len(), 1);
    let conflict = &schedule.conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::ResourceConflict);
    assert_eq!(conflict.severity, 4);
    assert!(conflict.accepted);
    assert!(schedule.is_stable());
    assert!(conflict.involves("google:standup"));
    assert!(conflict.involves("outlook:review"));
}

#[test]
fn single_task_lands_in_first_productive_hour() {
    let engine = engine();
    let req = request(vec![candidate("write-report", 60, Priority::Critical)]);

    let schedule = engine
        .generate(&req, &CancellationSignal::new())
        .expect("schedule generated");

    let block = schedule.block("write-report").expect("task placed");
    assert_eq!(block.start_at, at(1, 9, 0));
    assert_eq!(block.end_at, at(1, 10, 0));
    assert!(schedule.unplaced.is_empty());
    assert!(schedule.conflicts.is_empty());
    assert!(schedule.optimization_score > 0.0 && schedule.optimization_score <= 1.0);
    assert!(!schedule.partial);
    assert_eq!(schedule.revision, 0);
}

#[test]
fn task_longer_than_any_gap_is_reported_unplaced() {
    let engine = engine();
    let mut req = request(vec![
        candidate("migration", 120, Priority::High),
        candidate("inbox", 60, Priority::Low),
    ]);
    req.fixed_blocks = vec![TimeBlock::fixed(
        "offsite",
        "Offsite",
        TimeRange::new(at(1, 9, 0), at(1, 15, 30)),
    )];

    let schedule = engine
        .generate(&req, &CancellationSignal::new())
        .expect("schedule generated");

    assert_eq!(schedule.unplaced.len(), 1);
    assert_eq!(schedule.unplaced[0].id, "migration");
    assert_eq!(schedule.unplaced[0].reason, UnplacedReason::NoSufficientInterval);
    assert!(schedule
        .issues
        .iter()
        .any(|issue| issue.kind == IssueKind::Unplaceable
            && issue.subject_id.as_deref() == Some("migration")));

    let offsite = schedule.block("offsite").expect("fixed block kept");
    assert_eq!(offsite.start_at, at(1, 9, 0));
    assert_eq!(offsite.end_at, at(1, 15, 30));
    let inbox = schedule.block("inbox").expect("short task placed");
    assert!(inbox.start_at >= at(1, 15, 30));
    assert!(inbox.end_at <= at(1, 17, 0));
}

#[test]
fn identical_requests_produce_identical_placements() {
    let engine = engine();
    let mut req = request(vec![
        candidate("a", 60, Priority::High),
        candidate("b", 90, Priority::Medium),
        candidate("c", 30, Priority::Medium),
        candidate("d", 45, Priority::Low),
    ]);
    req.fixed_blocks = vec![TimeBlock::fixed(
        "lunch",
        "Lunch",
        TimeRange::new(at(1, 12, 0), at(1, 13, 0)),
    )];

    let signal = CancellationSignal::new();
    let first = engine.generate(&req, &signal).expect("first run");
    let second = engine.generate(&req, &signal).expect("second run");

    assert_ne!(first.id, second.id);
    assert_eq!(first.blocks, second.blocks);
    assert_eq!(first.unplaced, second.unplaced);
    assert_eq!(first.conflicts, second.conflicts);
    assert_eq!(first.optimization_score, second.optimization_score);
}

#[test]
fn invalid_items_do_not_abort_the_batch() {
    let engine = engine();
    let mut broken = candidate("broken", 30, Priority::Medium);
    broken.buffer_before_minutes = 45;
    let mut req = request(vec![broken, candidate("fine", 60, Priority::Medium)]);
    req.external_events = vec![event(
        "google",
        "backwards",
        "2025-05-01T11:00:00Z",
        "2025-05-01T10:00:00Z",
    )];

    let schedule = engine
        .generate(&req, &CancellationSignal::new())
        .expect("schedule generated");

    assert!(schedule.block("fine").is_some());
    assert!(schedule.block("broken").is_none());
    let invalid: Vec<_> = schedule
        .issues
        .iter()
        .filter(|issue| issue.kind == IssueKind::InvalidInput)
        .filter_map(|issue| issue.subject_id.clone())
        .collect();
    assert!(invalid.contains(&"broken".to_string()));
    assert!(invalid.contains(&"google:backwards".to_string()));
}

#[test]
fn oversized_items_are_rejected_without_losing_the_batch() {
    let engine = engine();
    let huge = candidate("huge", 1_000_000_000_000, Priority::High);
    let mut loose = candidate("loose", 60, Priority::High);
    loose.flexibility_minutes = Some(i64::MAX);
    loose.preferred_start_time = Some(at(1, 10, 0));
    let mut req = request(vec![huge, loose, candidate("ok", 60, Priority::Medium)]);
    let mut endless = TimeBlock::fixed("endless", "Endless", TimeRange::new(at(1, 12, 0), at(1, 13, 0)));
    endless.buffer_after_minutes = i64::MAX;
    req.fixed_blocks = vec![endless];

    let schedule = engine
        .generate(&req, &CancellationSignal::new())
        .expect("schedule generated");

    assert!(schedule.block("ok").is_some());
    for id in ["huge", "loose", "endless"] {
        assert!(schedule.block(id).is_none(), "{id} should not be placed");
        assert!(
            schedule
                .issues
                .iter()
                .any(|issue| issue.kind == IssueKind::InvalidInput
                    && issue.subject_id.as_deref() == Some(id)),
            "{id} should be reported as invalid input"
        );
    }
}

#[test]
fn history_drives_focus_work_into_productive_afternoon() {
    let engine = engine();
    let mut history = Vec::new();
    for day in 21..=25 {
        for (hour, score) in [(9, 0.2), (10, 0.2), (14, 0.9), (15, 0.9)] {
            history.push(HistoricalRecord {
                timestamp: Utc
                    .with_ymd_and_hms(2025, 4, day, hour, 0, 0)
                    .single()
                    .expect("valid datetime"),
                productivity_score: score,
                duration_minutes: 60,
                activity_type: "deep_work".into(),
                interruption_count: 0,
                habit_name: None,
                completed: Some(true),
            });
        }
    }

    let mut deep = candidate("design-doc", 60, Priority::Medium);
    deep.requires_focus = true;
    deep.task_type = TaskType::DeepWork;
    let mut req = request(vec![deep]);
    req.patterns = None;
    req.history = history.clone();

    let patterns = engine.analyze_patterns(&history);
    assert!(patterns.is_sufficient);
    assert!(patterns.is_productive_hour(14));
    assert!(!patterns.is_productive_hour(9));

    let schedule = engine
        .generate(&req, &CancellationSignal::new())
        .expect("schedule generated");
    let block = schedule.block("design-doc").expect("focus task placed");
    assert_eq!(block.start_at.hour(), 14);
    assert!(schedule.focus_time_protected);
    assert!(!schedule
        .issues
        .iter()
        .any(|issue| issue.kind == IssueKind::UpstreamDataUnavailable));
}

#[test]
fn batch_generation_keeps_input_order() {
    let engine = engine();
    let mut second = request(vec![candidate("y", 60, Priority::Low)]);
    second.owner_id = "user-2".into();
    let mut broken = request(Vec::new());
    broken.owner_id = "user-3".into();
    broken.horizon = ScheduleHorizon::custom(at(2, 0, 0), at(2, 0, 0) - Duration::hours(1));

    let results = engine.generate_many(
        &[request(vec![candidate("x", 60, Priority::High)]), second, broken],
        &CancellationSignal::new(),
    );

    assert_eq!(results.len(), 3);
    let first = results[0].as_ref().expect("first schedule");
    assert_eq!(first.owner_id, "user-1");
    assert!(first.block("x").is_some());
    let second = results[1].as_ref().expect("second schedule");
    assert_eq!(second.owner_id, "user-2");
    assert!(second.block("y").is_some());
    let err = results[2].as_ref().expect_err("inverted horizon rejected");
    assert!(err.is_validation());
}
