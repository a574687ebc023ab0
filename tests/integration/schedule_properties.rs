use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use cognical_scheduling_lib::models::calendar::ExternalEvent;
use cognical_scheduling_lib::models::candidate::CandidateItem;
use cognical_scheduling_lib::models::conflict::{ResolutionStrategy, ScheduleConflict};
use cognical_scheduling_lib::models::pattern::{FocusQuality, FocusTimeBlock, PatternSnapshot};
use cognical_scheduling_lib::models::schedule::{GeneratedSchedule, ScheduleHorizon, UnplacedReason};
use cognical_scheduling_lib::models::time_block::{Priority, TaskType, TimeBlock, TimeRange};
use cognical_scheduling_lib::services::conflict_detector::ConflictDetector;
use cognical_scheduling_lib::services::conflict_resolver::ConflictResolver;
use cognical_scheduling_lib::services::placer::{PlacementContext, Placer};
use cognical_scheduling_lib::services::schedule_utils;
use cognical_scheduling_lib::{
    CancellationSignal, EngineSettings, ScheduleRequest, SchedulingEngine,
};
use serde_json::Map;

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, day, hour, minute, 0)
        .single()
        .expect("valid datetime")
}

fn settings() -> EngineSettings {
    EngineSettings {
        workday_end_minute: 17 * 60,
        slot_granularity_minutes: 30,
        ..EngineSettings::default()
    }
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

fn focus_patterns() -> PatternSnapshot {
    PatternSnapshot {
        productive_hours: vec![9, 10, 14],
        focus_blocks: vec![FocusTimeBlock {
            start_time: NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"),
            end_time: NaiveTime::from_hms_opt(11, 0, 0).expect("valid time"),
            duration_minutes: 120,
            quality: FocusQuality::Deep,
            protection_level: 5,
            buffer_minutes: 10,
            interruption_cost: 0.8,
            recovery_time_minutes: 20,
        }],
        is_sufficient: true,
        ..Default::default()
    }
}

fn busy_week() -> ScheduleRequest {
    let priorities = [Priority::Critical, Priority::High, Priority::Medium, Priority::Low];
    let mut candidates: Vec<CandidateItem> = (0..16)
        .map(|index| {
            candidate(
                &format!("task-{index:02}"),
                30 + 15 * (index % 5) as i64,
                priorities[index % priorities.len()],
            )
        })
        .collect();
    let mut deep = candidate("deep-work", 90, Priority::High);
    deep.requires_focus = true;
    deep.task_type = TaskType::DeepWork;
    candidates.push(deep);

    let mut standup = TimeBlock::fixed("standup", "Standup", TimeRange::new(at(5, 11, 0), at(5, 11, 15)));
    standup.buffer_after_minutes = 5;

    ScheduleRequest {
        owner_id: "user-1".into(),
        horizon: ScheduleHorizon::week(at(5, 0, 0)),
        candidates,
        fixed_blocks: vec![standup],
        external_events: vec![
            ExternalEvent {
                event_id: "1".into(),
                source: "google".into(),
                start_time: "2025-05-06T13:00:00Z".into(),
                end_time: "2025-05-06T14:30:00Z".into(),
                title: "Design review".into(),
                timezone: None,
            },
            ExternalEvent {
                event_id: "2".into(),
                source: "outlook".into(),
                start_time: "2025-05-06T14:00:00Z".into(),
                end_time: "2025-05-06T15:00:00Z".into(),
                title: "Vendor call".into(),
                timezone: None,
            },
        ],
        patterns: Some(focus_patterns()),
        history: Vec::new(),
        constraints: Vec::new(),
        resolution_policy: Default::default(),
    }
}

fn reported(schedule: &GeneratedSchedule, a: &TimeBlock, b: &TimeBlock) -> Option<ScheduleConflict> {
    schedule
        .conflicts
        .iter()
        .find(|conflict| conflict.involves(&a.id) && conflict.involves(&b.id))
        .cloned()
}

#[test]
fn overlaps_only_exist_as_accepted_fixed_conflicts() {
    let engine = SchedulingEngine::new(settings()).expect("valid settings");
    let schedule = engine
        .generate(&busy_week(), &CancellationSignal::new())
        .expect("schedule generated");

    let mut overlapping_pairs = 0;
    for (index, a) in schedule.blocks.iter().enumerate() {
        for b in &schedule.blocks[index + 1..] {
            if !a.overlaps(b) {
                continue;
            }
            overlapping_pairs += 1;
            let conflict = reported(&schedule, a, b).expect("overlap reported as conflict");
            assert!(conflict.accepted);
            assert!(conflict.all_fixed());
        }
    }
    assert_eq!(overlapping_pairs, 1);
}

#[test]
fn flexible_blocks_respect_buffers_and_working_hours() {
    let settings = settings();
    let engine = SchedulingEngine::new(settings.clone()).expect("valid settings");
    let schedule = engine
        .generate(&busy_week(), &CancellationSignal::new())
        .expect("schedule generated");

    for block in schedule.blocks.iter().filter(|block| !block.is_fixed()) {
        let minute_of_day = schedule_utils::midnight_minutes_of(block.start_at);
        assert!(minute_of_day >= settings.workday_start_minute as i64, "{} starts early", block.id);
        assert!(
            minute_of_day + block.duration_minutes <= settings.workday_end_minute as i64,
            "{} ends late",
            block.id
        );
        for other in schedule.blocks.iter().filter(|other| other.id != block.id) {
            assert!(
                !block.buffered_range().overlaps(&other.buffered_range()),
                "{} crowds {}",
                block.id,
                other.id
            );
        }
    }
}

#[test]
fn protected_focus_windows_hold_only_focus_work() {
    let engine = SchedulingEngine::new(settings()).expect("valid settings");
    let schedule = engine
        .generate(&busy_week(), &CancellationSignal::new())
        .expect("schedule generated");
    assert!(schedule.focus_time_protected);

    let patterns = focus_patterns();
    let focus = &patterns.focus_blocks[0];
    for block in schedule.blocks.iter().filter(|block| !block.is_focus_time) {
        assert_eq!(focus.overlap_minutes(&block.range()), 0, "{} intrudes", block.id);
    }
    let deep = schedule.block("deep-work").expect("focus task placed");
    assert!(focus.overlap_minutes(&deep.range()) > 0);
}

#[test]
fn cancelled_run_returns_a_partial_but_consistent_schedule() {
    let engine = SchedulingEngine::new(settings()).expect("valid settings");
    let signal = CancellationSignal::new();
    signal.cancel();

    let schedule = engine.generate(&busy_week(), &signal).expect("schedule generated");
    assert!(schedule.partial);
    assert!(schedule
        .unplaced
        .iter()
        .all(|entry| entry.reason == UnplacedReason::Cancelled));
    assert!(schedule.block("standup").is_some());
    assert!(schedule.block("google:1").is_some());
}

#[test]
fn evaluation_budget_bounds_the_search() {
    let engine = SchedulingEngine::new(settings()).expect("valid settings");
    let signal = CancellationSignal::new().with_evaluation_budget(40);

    let schedule = engine.generate(&busy_week(), &signal).expect("schedule generated");
    assert!(schedule.partial);
    assert!(!schedule.unplaced.is_empty());
    for (index, a) in schedule.blocks.iter().enumerate() {
        for b in &schedule.blocks[index + 1..] {
            if a.overlaps(b) {
                assert!(a.is_fixed() && b.is_fixed());
            }
        }
    }
}

fn flexible(id: &str, start: DateTime<Utc>, minutes: i64, priority: Priority) -> TimeBlock {
    let mut block = TimeBlock::fixed(id, id, TimeRange::new(start, start + Duration::minutes(minutes)));
    block.flexibility_minutes = 60;
    block.priority = priority;
    block
}

fn pair_conflicts(settings: &EngineSettings, blocks: &[TimeBlock]) -> usize {
    ConflictDetector::new(settings)
        .detect(blocks, None)
        .iter()
        .filter(|conflict| conflict.involves("high") && conflict.involves("low"))
        .count()
}

#[test]
fn resolution_never_displaces_the_higher_priority_block() {
    let settings = EngineSettings {
        allow_compress: true,
        ..settings()
    };
    let horizon = TimeRange::new(at(1, 0, 0), at(3, 0, 0));
    let patterns = PatternSnapshot::default();
    let placer = Placer::new(PlacementContext::new(&settings, horizon, &patterns, &[]));
    let resolver = ConflictResolver::new(&placer);

    let strategies = [
        ResolutionStrategy::RescheduleLowerPriority,
        ResolutionStrategy::SplitTask { threshold_minutes: 60 },
        ResolutionStrategy::DeferToNextDay,
        ResolutionStrategy::SuggestAlternative { max_alternatives: 3 },
    ];

    for strategy in strategies {
        let high = flexible("high", at(1, 10, 0), 60, Priority::High);
        let low = flexible("low", at(1, 10, 30), 120, Priority::Low);
        let mut blocks = vec![high.clone(), low];
        let conflicts = ConflictDetector::new(&settings).detect(&blocks, None);
        assert_eq!(conflicts.len(), 1);
        let before = pair_conflicts(&settings, &blocks);

        let outcome = resolver.apply(&mut blocks, &conflicts[0], &strategy, &CancellationSignal::new());

        let kept = blocks
            .iter()
            .find(|block| block.id == "high")
            .expect("high-priority block kept");
        assert_eq!(kept.range(), high.range(), "{:?} moved the high block", strategy.kind());
        assert!(!outcome.moved_block_ids.contains(&"high".to_string()));
        assert!(
            pair_conflicts(&settings, &blocks) <= before,
            "{:?} increased conflicts",
            strategy.kind()
        );
    }
}

#[test]
fn two_fixed_blocks_are_never_auto_resolved() {
    let settings = settings();
    let horizon = TimeRange::new(at(1, 0, 0), at(2, 0, 0));
    let patterns = PatternSnapshot::default();
    let placer = Placer::new(PlacementContext::new(&settings, horizon, &patterns, &[]));

    let a = TimeBlock::fixed("a", "a", TimeRange::new(at(1, 9, 0), at(1, 10, 0)));
    let b = TimeBlock::fixed("b", "b", TimeRange::new(at(1, 9, 30), at(1, 10, 30)));
    let mut blocks = vec![a.clone(), b.clone()];

    let report = ConflictResolver::new(&placer).resolve_all(
        &mut blocks,
        &[],
        &Default::default(),
        &CancellationSignal::new(),
    );

    assert_eq!(blocks, vec![a, b]);
    assert_eq!(report.outstanding.len(), 1);
    assert!(report.outstanding[0].accepted);
    assert!(report.outcomes.is_empty());
}
