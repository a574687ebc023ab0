use std::collections::BTreeSet;

use chrono::Duration;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::calendar::ExternalEvent;
use crate::models::candidate::{CandidateItem, Schedulable};
use crate::models::conflict::ScheduleConflict;
use crate::models::constraint::{ConstraintKind, ScheduleConstraint};
use crate::models::pattern::{HistoricalRecord, PatternSnapshot};
use crate::models::schedule::{
    GeneratedSchedule, IssueKind, ScheduleHorizon, ScheduleIssue, UnplacedBlock,
};
use crate::models::time_block::{normalize_tag, TimeBlock};
use crate::services::calendar_integrator::CalendarIntegrator;
use crate::services::conflict_resolver::{ConflictResolver, ResolutionPolicy};
use crate::services::pattern_model::PatternModel;
use crate::services::placer::{sort_blocks, PlacementContext, Placer, PLACEMENT_SCORE_KEY};
use crate::services::rescheduler::{AutonomousRescheduler, RescheduleRequest};
use crate::services::settings_service::EngineSettings;
use crate::utils::cancellation::CancellationSignal;

pub(crate) const UNPLACED_HABITS_KEY: &str = "unplacedHabitIds";

/// Complete input snapshot for one scheduling invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub owner_id: String,
    pub horizon: ScheduleHorizon,
    #[serde(default)]
    pub candidates: Vec<CandidateItem>,
    #[serde(default)]
    pub fixed_blocks: Vec<TimeBlock>,
    #[serde(default)]
    pub external_events: Vec<ExternalEvent>,
    /// Precomputed patterns; when absent they are derived from `history`.
    #[serde(default)]
    pub patterns: Option<PatternSnapshot>,
    #[serde(default)]
    pub history: Vec<HistoricalRecord>,
    #[serde(default)]
    pub constraints: Vec<ScheduleConstraint>,
    #[serde(default)]
    pub resolution_policy: ResolutionPolicy,
}

/// Stateless entry point. Each call receives a full snapshot and returns a full schedule.
#[derive(Debug, Clone)]
pub struct SchedulingEngine {
    settings: EngineSettings,
}

impl SchedulingEngine {
    pub fn new(settings: EngineSettings) -> AppResult<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn analyze_patterns(&self, history: &[HistoricalRecord]) -> PatternSnapshot {
        PatternModel::from_settings(&self.settings).analyze(history)
    }

    pub fn generate(
        &self,
        request: &ScheduleRequest,
        signal: &CancellationSignal,
    ) -> AppResult<GeneratedSchedule> {
        if request.owner_id.trim().is_empty() {
            return Err(AppError::validation("排程请求缺少 ownerId"));
        }
        request.horizon.validate()?;

        let mut metadata = Map::new();
        let horizon = self.clamp_horizon(&request.horizon, &mut metadata);
        let horizon_range = horizon.range();
        let mut issues = Vec::new();

        let patterns = self.resolve_patterns(request, &mut issues);

        let mut constraints = Vec::with_capacity(request.constraints.len());
        for constraint in &request.constraints {
            match constraint.validate() {
                Ok(()) => constraints.push(constraint.clone()),
                Err(err) => issues.push(ScheduleIssue::new(
                    IssueKind::InvalidInput,
                    Some(&constraint.id),
                    err.to_string(),
                )),
            }
        }

        let calendar =
            CalendarIntegrator::new(&self.settings).integrate(&request.external_events, &horizon_range);
        issues.extend(calendar.issues);

        let mut seen: BTreeSet<String> = calendar.timeline.iter().map(|b| b.id.clone()).collect();
        let mut fixed = calendar.timeline;
        for block in &request.fixed_blocks {
            if let Err(err) = block.validate() {
                issues.push(ScheduleIssue::new(IssueKind::InvalidInput, Some(&block.id), err.to_string()));
                continue;
            }
            if !seen.insert(block.id.clone()) {
                issues.push(duplicate_issue(&block.id));
                continue;
            }
            fixed.push(block.clone());
        }

        let mut flexible = Vec::new();
        let mut habit_ids = BTreeSet::new();
        for candidate in &request.candidates {
            if !seen.insert(candidate.id.clone()) {
                issues.push(duplicate_issue(&candidate.id));
                continue;
            }
            match candidate
                .clone()
                .into_schedulable(self.settings.default_flexibility_minutes)
            {
                Ok(Schedulable::Fixed(block)) => fixed.push(block),
                Ok(Schedulable::Flexible(placement)) => {
                    if placement.is_habit {
                        habit_ids.insert(placement.id.clone());
                    }
                    flexible.push(placement);
                }
                Err(err) => issues.push(ScheduleIssue::new(
                    IssueKind::InvalidInput,
                    Some(&candidate.id),
                    err.to_string(),
                )),
            }
        }

        debug!(
            target: "app::scheduler",
            owner = %request.owner_id,
            fixed = fixed.len(),
            flexible = flexible.len(),
            issues = issues.len(),
            "inputs normalized"
        );

        let placer = Placer::new(PlacementContext::new(
            &self.settings,
            horizon_range,
            &patterns,
            &constraints,
        ));
        let outcome = placer.place(fixed, flexible, signal);
        issues.extend(unplaced_issues(&outcome.unplaced));

        let mut blocks = outcome.blocks;
        let report = ConflictResolver::new(&placer).resolve_all(
            &mut blocks,
            &placer.context().constraints,
            &request.resolution_policy,
            signal,
        );
        issues.extend(report.issues);
        if !report.outcomes.is_empty() {
            metadata.insert("resolutions".into(), serde_json::to_value(&report.outcomes)?);
        }

        let unplaced_habit_ids = outcome
            .unplaced
            .iter()
            .filter(|entry| habit_ids.contains(&entry.id))
            .map(|entry| entry.id.clone())
            .collect();

        Ok(build_schedule(ScheduleDraft {
            settings: &self.settings,
            owner_id: request.owner_id.clone(),
            horizon,
            blocks,
            conflicts: report.outstanding,
            unplaced: outcome.unplaced,
            unplaced_habit_ids,
            issues,
            patterns: &patterns,
            source_patterns: patterns.clone(),
            constraints: &placer.context().constraints,
            partial: outcome.partial || report.cancelled,
            revision: 0,
            metadata,
        }))
    }

    /// Runs independent requests in parallel; results keep the input order.
    pub fn generate_many(
        &self,
        requests: &[ScheduleRequest],
        signal: &CancellationSignal,
    ) -> Vec<AppResult<GeneratedSchedule>> {
        requests
            .par_iter()
            .map(|request| self.generate(request, signal))
            .collect()
    }

    pub fn reschedule(
        &self,
        request: RescheduleRequest,
        signal: &CancellationSignal,
    ) -> AppResult<GeneratedSchedule> {
        AutonomousRescheduler::new(&self.settings).reschedule(request, signal)
    }

    fn clamp_horizon(&self, horizon: &ScheduleHorizon, metadata: &mut Map<String, JsonValue>) -> ScheduleHorizon {
        let limit = horizon.start + Duration::days(self.settings.horizon_days);
        if horizon.end <= limit {
            return horizon.clone();
        }
        debug!(
            target: "app::scheduler",
            requested_end = %horizon.end,
            clamped_end = %limit,
            "planning horizon clamped"
        );
        metadata.insert("horizonClamped".into(), JsonValue::Bool(true));
        ScheduleHorizon {
            kind: horizon.kind,
            start: horizon.start,
            end: limit,
        }
    }

    fn resolve_patterns(&self, request: &ScheduleRequest, issues: &mut Vec<ScheduleIssue>) -> PatternSnapshot {
        let supplied = match &request.patterns {
            Some(patterns) => Some(patterns.clone()),
            None if !request.history.is_empty() => Some(self.analyze_patterns(&request.history)),
            None => None,
        };

        match supplied {
            Some(patterns)
                if patterns.is_sufficient
                    || !patterns.hourly.is_empty()
                    || !patterns.productive_hours.is_empty() =>
            {
                patterns
            }
            _ => default_patterns(&request.owner_id, request.history.len(), issues),
        }
    }
}

/// Default heuristics, recorded as an `UpstreamDataUnavailable` issue.
pub(crate) fn default_patterns(owner_id: &str, records: usize, issues: &mut Vec<ScheduleIssue>) -> PatternSnapshot {
    warn!(
        target: "app::scheduler::pattern",
        owner = %owner_id,
        records,
        "pattern data unavailable; using default heuristics"
    );
    issues.push(ScheduleIssue::new(
        IssueKind::UpstreamDataUnavailable,
        None,
        "历史数据不足，已使用默认时间偏好",
    ));
    PatternSnapshot::default_heuristics()
}

/// Everything needed to assemble a [`GeneratedSchedule`].
pub(crate) struct ScheduleDraft<'a> {
    pub settings: &'a EngineSettings,
    pub owner_id: String,
    pub horizon: ScheduleHorizon,
    pub blocks: Vec<TimeBlock>,
    pub conflicts: Vec<ScheduleConflict>,
    pub unplaced: Vec<UnplacedBlock>,
    pub unplaced_habit_ids: BTreeSet<String>,
    pub issues: Vec<ScheduleIssue>,
    pub patterns: &'a PatternSnapshot,
    /// Snapshot stored on the result, without per-revision overrides.
    pub source_patterns: PatternSnapshot,
    pub constraints: &'a [ScheduleConstraint],
    pub partial: bool,
    pub revision: u32,
    pub metadata: Map<String, JsonValue>,
}

pub(crate) fn build_schedule(draft: ScheduleDraft<'_>) -> GeneratedSchedule {
    let ScheduleDraft {
        settings,
        owner_id,
        horizon,
        mut blocks,
        conflicts,
        unplaced,
        unplaced_habit_ids,
        mut issues,
        patterns,
        source_patterns,
        constraints,
        partial,
        revision,
        mut metadata,
    } = draft;

    sort_blocks(&mut blocks);

    let focus_time_protected = !blocks
        .iter()
        .filter(|block| !block.is_focus_time)
        .any(|block| {
            patterns
                .protected_focus_blocks()
                .any(|focus| focus.overlap_minutes(&block.range()) > 0)
        });

    let horizon_days = horizon.range().duration_minutes() as f64 / (24.0 * 60.0);
    let frequency_issues = frequency_shortfalls(&blocks, &unplaced, patterns, constraints, horizon_days);
    let frequency_met = frequency_issues.is_empty();
    issues.extend(frequency_issues);

    let habit_conflict = conflicts
        .iter()
        .any(|conflict| conflict.blocks.iter().any(|block| block.is_habit));
    let habits_preserved = unplaced_habit_ids.is_empty() && !habit_conflict && frequency_met;

    let optimization_score = optimization_score(&blocks, unplaced.len());

    metadata.insert(
        UNPLACED_HABITS_KEY.into(),
        json!(unplaced_habit_ids.into_iter().collect::<Vec<_>>()),
    );
    metadata.insert("protectFocusTime".into(), json!(settings.protect_focus_time));

    let schedule = GeneratedSchedule {
        id: Uuid::new_v4().to_string(),
        owner_id,
        horizon,
        blocks,
        conflicts,
        unplaced,
        issues,
        optimization_score,
        focus_time_protected,
        habits_preserved,
        partial,
        revision,
        patterns: Some(source_patterns),
        metadata,
    };

    info!(
        target: "app::scheduler",
        schedule = %schedule.id,
        owner = %schedule.owner_id,
        revision = schedule.revision,
        blocks = schedule.blocks.len(),
        unplaced = schedule.unplaced.len(),
        conflicts = schedule.conflicts.len(),
        score = schedule.optimization_score,
        partial = schedule.partial,
        "schedule generated"
    );
    schedule
}

pub(crate) fn unplaced_issues(unplaced: &[UnplacedBlock]) -> Vec<ScheduleIssue> {
    unplaced
        .iter()
        .map(|entry| {
            ScheduleIssue::new(
                IssueKind::Unplaceable,
                Some(&entry.id),
                format!("无法安排 {}: {}", entry.title, entry.reason.as_str()),
            )
        })
        .collect()
}

fn duplicate_issue(id: &str) -> ScheduleIssue {
    ScheduleIssue::new(IssueKind::InvalidInput, Some(id), format!("重复的时间块 ID: {id}"))
}

/// Mean placement score of placed flexible blocks, scaled by the placed fraction.
fn optimization_score(blocks: &[TimeBlock], unplaced: usize) -> f64 {
    let scores: Vec<f64> = blocks
        .iter()
        .filter_map(|block| block.metadata.get(PLACEMENT_SCORE_KEY))
        .filter_map(|score| score.get("total").and_then(JsonValue::as_f64))
        .map(|total| total.clamp(0.0, 1.0))
        .collect();

    let attempted = scores.len() + unplaced;
    if attempted == 0 {
        return 1.0;
    }
    if scores.is_empty() {
        return 0.0;
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    mean * scores.len() as f64 / attempted as f64
}

fn matches_subject(subject: &str, title: &str, category: Option<&str>) -> bool {
    let subject = normalize_tag(subject);
    normalize_tag(title) == subject || category.map(normalize_tag).as_deref() == Some(subject.as_str())
}

/// Weekly minimums prorated to the horizon length.
fn frequency_shortfalls(
    blocks: &[TimeBlock],
    unplaced: &[UnplacedBlock],
    patterns: &PatternSnapshot,
    constraints: &[ScheduleConstraint],
    horizon_days: f64,
) -> Vec<ScheduleIssue> {
    let required = |per_week: u32| (per_week as f64 * horizon_days / 7.0).ceil() as usize;
    let mut issues = Vec::new();

    for constraint in constraints {
        let ConstraintKind::FrequencyMinimum {
            subject,
            min_per_week,
        } = &constraint.kind
        else {
            continue;
        };
        let count = blocks
            .iter()
            .filter(|block| matches_subject(subject, &block.title, block.category.as_deref()))
            .count();
        let needed = required(*min_per_week);
        if count < needed {
            issues.push(ScheduleIssue::new(
                IssueKind::ConstraintUnmet,
                Some(&constraint.id),
                format!("{subject} 仅安排 {count} 次，少于要求的 {needed} 次"),
            ));
        }
    }

    for rule in &patterns.habit_rules {
        let scheduled = blocks
            .iter()
            .filter(|block| rule.matches(&block.title, block.category.as_deref()))
            .count();
        let requested = scheduled
            + unplaced
                .iter()
                .filter(|entry| rule.matches(&entry.title, None))
                .count();
        if requested == 0 {
            continue;
        }
        let needed = required(rule.min_weekly_frequency);
        if scheduled < needed {
            issues.push(ScheduleIssue::new(
                IssueKind::ConstraintUnmet,
                Some(&rule.habit_name),
                format!(
                    "习惯 {} 仅安排 {scheduled} 次，少于每周最低频率对应的 {needed} 次",
                    rule.habit_name
                ),
            ));
        }
    }
    issues
}
