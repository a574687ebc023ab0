use chrono::{DateTime, NaiveTime, TimeZone, Timelike, Utc};
use cognical_scheduling_lib::models::candidate::CandidateItem;
use cognical_scheduling_lib::models::disruption::{Disruption, DisruptionKind};
use cognical_scheduling_lib::models::pattern::{FocusQuality, FocusTimeBlock, PatternSnapshot};
use cognical_scheduling_lib::models::schedule::{GeneratedSchedule, IssueKind, ScheduleHorizon};
use cognical_scheduling_lib::models::time_block::{Priority, TaskType, TimeBlock, TimeRange};
use cognical_scheduling_lib::{
    CancellationSignal, EngineSettings, RescheduleRequest, ScheduleRequest, SchedulingEngine,
};
use serde_json::{json, Map, Value as JsonValue};

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 1, hour, minute, 0)
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

fn patterns() -> PatternSnapshot {
    PatternSnapshot {
        productive_hours: vec![9, 10, 11, 14, 15],
        is_sufficient: true,
        ..Default::default()
    }
}

fn candidate(id: &str, priority: Priority, task_type: TaskType) -> CandidateItem {
    CandidateItem {
        id: id.into(),
        title: id.into(),
        duration_minutes: 60,
        priority,
        task_type,
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

fn baseline(engine: &SchedulingEngine, candidates: Vec<CandidateItem>, fixed: Vec<TimeBlock>) -> GeneratedSchedule {
    let request = ScheduleRequest {
        owner_id: "user-1".into(),
        horizon: ScheduleHorizon::day(at(0, 0)),
        candidates,
        fixed_blocks: fixed,
        external_events: Vec::new(),
        patterns: Some(patterns()),
        history: Vec::new(),
        constraints: Vec::new(),
        resolution_policy: Default::default(),
    };
    engine
        .generate(&request, &CancellationSignal::new())
        .expect("baseline schedule")
}

fn revise(
    engine: &SchedulingEngine,
    schedule: &GeneratedSchedule,
    kind: DisruptionKind,
    range: TimeRange,
    metadata: JsonValue,
) -> cognical_scheduling_lib::AppResult<GeneratedSchedule> {
    engine.reschedule(
        RescheduleRequest {
            schedule: schedule.clone(),
            disruption: Disruption {
                kind,
                time_range: range,
                metadata,
            },
            patterns: Some(patterns()),
            constraints: Vec::new(),
            resolution_policy: Default::default(),
        },
        &CancellationSignal::new(),
    )
}

fn assert_no_overlaps(schedule: &GeneratedSchedule) {
    for (index, a) in schedule.blocks.iter().enumerate() {
        for b in &schedule.blocks[index + 1..] {
            assert!(!a.overlaps(b), "{} overlaps {}", a.id, b.id);
        }
    }
}

#[test]
fn urgent_task_displaces_only_the_overlapped_block() {
    let engine = engine();
    let schedule = baseline(
        &engine,
        vec![
            candidate("a", Priority::Medium, TaskType::Other),
            candidate("b", Priority::Low, TaskType::Other),
            candidate("c", Priority::High, TaskType::Other),
        ],
        Vec::new(),
    );
    assert_eq!(schedule.blocks.len(), 3);
    let before_a = schedule.block("a").expect("a placed").clone();

    let revised = revise(
        &engine,
        &schedule,
        DisruptionKind::UrgentTask,
        before_a.range(),
        json!({"id": "hotfix", "title": "Production hotfix"}),
    )
    .expect("revised schedule");

    let hotfix = revised.block("hotfix").expect("urgent block inserted");
    assert_eq!(hotfix.range(), before_a.range());
    assert_eq!(hotfix.priority, Priority::Critical);
    assert!(hotfix.is_fixed());

    let after_a = revised.block("a").expect("a re-placed");
    assert_ne!(after_a.start_at, before_a.start_at);
    assert!(after_a.start_at >= before_a.start_at);

    for id in ["b", "c"] {
        let before = schedule.block(id).expect("placed before");
        let after = revised.block(id).expect("still placed");
        assert_eq!(before.range(), after.range(), "{id} must stay put");
    }

    assert_no_overlaps(&revised);
    assert_eq!(revised.revision, schedule.revision + 1);
    assert_eq!(revised.metadata.get("parentScheduleId"), Some(&json!(schedule.id)));
    assert_eq!(revised.metadata.get("disruptionType"), Some(&json!("urgent_task")));
    assert_eq!(revised.metadata.get("affectedBlockIds"), Some(&json!(["a"])));
}

#[test]
fn urgent_task_reusing_an_existing_id_is_rejected() {
    let engine = engine();
    let schedule = baseline(&engine, vec![candidate("a", Priority::Medium, TaskType::Other)], Vec::new());

    let err = revise(
        &engine,
        &schedule,
        DisruptionKind::UrgentTask,
        TimeRange::new(at(13, 0), at(14, 0)),
        json!({"id": "a"}),
    )
    .expect_err("duplicate id rejected");
    assert!(err.is_validation());
}

#[test]
fn meeting_overrun_pushes_following_work_back() {
    let engine = engine();
    let meeting = TimeBlock::fixed("planning", "Sprint planning", TimeRange::new(at(9, 0), at(10, 0)));
    let schedule = baseline(
        &engine,
        vec![candidate("followup", Priority::High, TaskType::Other)],
        vec![meeting],
    );

    let revised = revise(
        &engine,
        &schedule,
        DisruptionKind::MeetingOverrun,
        TimeRange::new(at(10, 0), at(10, 30)),
        json!({"blockId": "planning"}),
    )
    .expect("revised schedule");

    let meeting = revised.block("planning").expect("meeting kept");
    assert_eq!(meeting.start_at, at(9, 0));
    assert_eq!(meeting.end_at, at(10, 30));
    assert_eq!(meeting.metadata.get("overrunMinutes"), Some(&json!(30)));

    let followup = revised.block("followup").expect("followup still placed");
    assert!(followup.start_at >= at(10, 30));
    assert_no_overlaps(&revised);
}

#[test]
fn low_energy_moves_demanding_work_out_of_the_window() {
    let engine = engine();
    let schedule = baseline(
        &engine,
        vec![candidate("analysis", Priority::Medium, TaskType::DeepWork)],
        Vec::new(),
    );
    let before = schedule.block("analysis").expect("placed");
    assert_eq!(before.start_at, at(9, 0));

    let revised = revise(
        &engine,
        &schedule,
        DisruptionKind::EnergyLevelChange,
        TimeRange::new(at(9, 0), at(12, 0)),
        json!({"energy": "low"}),
    )
    .expect("revised schedule");

    let after = revised.block("analysis").expect("re-placed");
    assert!(after.start_at.hour() >= 12, "still inside low-energy window: {}", after.start_at);
}

#[test]
fn energy_change_without_level_is_invalid() {
    let engine = engine();
    let schedule = baseline(&engine, vec![candidate("a", Priority::Medium, TaskType::Other)], Vec::new());

    let err = revise(
        &engine,
        &schedule,
        DisruptionKind::EnergyLevelChange,
        TimeRange::new(at(9, 0), at(12, 0)),
        json!({}),
    )
    .expect_err("missing energy rejected");
    assert!(err.is_validation());
}

#[test]
fn late_external_event_is_inserted_as_fixed_block() {
    let engine = engine();
    let schedule = baseline(&engine, vec![candidate("a", Priority::High, TaskType::Other)], Vec::new());
    let placed = schedule.block("a").expect("placed").range();

    let revised = revise(
        &engine,
        &schedule,
        DisruptionKind::ExternalEvent,
        placed,
        json!({
            "event": {
                "eventId": "late",
                "source": "google",
                "startTime": placed.start.to_rfc3339(),
                "endTime": placed.end.to_rfc3339(),
                "title": "Customer call"
            }
        }),
    )
    .expect("revised schedule");

    let call = revised.block("google:late").expect("external block inserted");
    assert!(call.is_fixed());
    assert_eq!(call.source.as_deref(), Some("google"));
    assert_eq!(call.range(), placed);
    let moved = revised.block("a").expect("a re-placed");
    assert!(!moved.overlaps(call));
    assert_no_overlaps(&revised);
}

fn protected_morning() -> PatternSnapshot {
    PatternSnapshot {
        focus_blocks: vec![FocusTimeBlock {
            start_time: NaiveTime::from_hms_opt(10, 0, 0).expect("valid time"),
            end_time: NaiveTime::from_hms_opt(12, 0, 0).expect("valid time"),
            duration_minutes: 120,
            quality: FocusQuality::Deep,
            protection_level: 5,
            buffer_minutes: 10,
            interruption_cost: 0.8,
            recovery_time_minutes: 20,
        }],
        ..patterns()
    }
}

#[test]
fn revision_keeps_the_patterns_the_schedule_was_planned_with() {
    let engine = engine();
    let mut deep = candidate("deep", Priority::Medium, TaskType::DeepWork);
    deep.requires_focus = true;
    let request = ScheduleRequest {
        owner_id: "user-1".into(),
        horizon: ScheduleHorizon::day(at(0, 0)),
        candidates: vec![candidate("email", Priority::High, TaskType::Other), deep],
        fixed_blocks: Vec::new(),
        external_events: Vec::new(),
        patterns: Some(protected_morning()),
        history: Vec::new(),
        constraints: Vec::new(),
        resolution_policy: Default::default(),
    };
    let schedule = engine
        .generate(&request, &CancellationSignal::new())
        .expect("baseline schedule");
    assert_eq!(schedule.patterns, Some(protected_morning()));
    let email = schedule.block("email").expect("email placed").range();

    let revised = engine
        .reschedule(
            RescheduleRequest {
                schedule: schedule.clone(),
                disruption: Disruption {
                    kind: DisruptionKind::UrgentTask,
                    time_range: email,
                    metadata: json!({"id": "incident"}),
                },
                patterns: None,
                constraints: Vec::new(),
                resolution_policy: Default::default(),
            },
            &CancellationSignal::new(),
        )
        .expect("revised schedule");

    assert!(!revised
        .issues
        .iter()
        .any(|issue| issue.kind == IssueKind::UpstreamDataUnavailable));
    assert_eq!(revised.patterns, schedule.patterns);
    assert!(revised.focus_time_protected);
    let focus = &protected_morning().focus_blocks[0];
    let moved = revised.block("email").expect("email re-placed");
    assert_ne!(moved.range(), email);
    assert_eq!(focus.overlap_minutes(&moved.range()), 0, "email landed in protected focus time");
    assert_no_overlaps(&revised);
}

#[test]
fn revision_without_any_patterns_reports_the_fallback() {
    let engine = engine();
    let mut schedule = baseline(&engine, vec![candidate("a", Priority::Medium, TaskType::Other)], Vec::new());
    schedule.patterns = None;
    let placed = schedule.block("a").expect("placed").range();

    let revised = engine
        .reschedule(
            RescheduleRequest {
                schedule,
                disruption: Disruption {
                    kind: DisruptionKind::UrgentTask,
                    time_range: placed,
                    metadata: json!({"id": "incident"}),
                },
                patterns: None,
                constraints: Vec::new(),
                resolution_policy: Default::default(),
            },
            &CancellationSignal::new(),
        )
        .expect("revised schedule");

    assert!(revised
        .issues
        .iter()
        .any(|issue| issue.kind == IssueKind::UpstreamDataUnavailable));
    assert!(revised.block("a").is_some());
}
