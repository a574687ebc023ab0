use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, trace};

use crate::models::candidate::PlacementRequest;
use crate::models::constraint::{ConstraintKind, ScheduleConstraint};
use crate::models::pattern::{EnergyLevel, PatternSnapshot};
use crate::models::schedule::{UnplacedBlock, UnplacedReason};
use crate::models::time_block::{offset_minutes, TimeBlock, TimeRange};
use crate::services::conflict_detector::cap_applies;
use crate::services::schedule_utils;
use crate::services::settings_service::EngineSettings;
use crate::utils::cancellation::CancellationSignal;

pub const PLACEMENT_SCORE_KEY: &str = "placementScore";

/// Everything the placer reads during one invocation.
#[derive(Debug, Clone)]
pub struct PlacementContext<'a> {
    pub settings: &'a EngineSettings,
    /// Search range for flexible blocks.
    pub horizon: TimeRange,
    pub patterns: &'a PatternSnapshot,
    /// Caller constraints followed by pattern-derived ones.
    pub constraints: Vec<ScheduleConstraint>,
}

impl<'a> PlacementContext<'a> {
    pub fn new(
        settings: &'a EngineSettings,
        horizon: TimeRange,
        patterns: &'a PatternSnapshot,
        constraints: &[ScheduleConstraint],
    ) -> Self {
        let mut all = constraints.to_vec();
        all.extend(patterns.derived_constraints.iter().cloned());
        Self {
            settings,
            horizon,
            patterns,
            constraints: all,
        }
    }

}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub priority: f64,
    pub time_preference: f64,
    pub focus_protection: f64,
    pub habit_preservation: f64,
    pub energy: f64,
    pub conflict_avoidance: f64,
    pub penalty: f64,
    pub total: f64,
}

impl ScoreBreakdown {
    /// Total clamped to `[0, 1]` for reporting.
    pub fn normalized_total(&self) -> f64 {
        self.total.clamp(0.0, 1.0)
    }

    pub fn to_json(&self) -> JsonValue {
        json!({
            "priority": self.priority,
            "timePreference": self.time_preference,
            "focusProtection": self.focus_protection,
            "habitPreservation": self.habit_preservation,
            "energy": self.energy,
            "conflictAvoidance": self.conflict_avoidance,
            "penalty": self.penalty,
            "total": self.total,
        })
    }
}

/// Weighted multi-factor score of one candidate start. Independent of the search strategy.
pub struct CandidateScorer<'c, 'a> {
    ctx: &'c PlacementContext<'a>,
}

impl<'c, 'a> CandidateScorer<'c, 'a> {
    pub fn new(ctx: &'c PlacementContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn score(
        &self,
        request: &PlacementRequest,
        start: DateTime<Utc>,
        placed: &[TimeBlock],
    ) -> ScoreBreakdown {
        let range = request.range_at(start);
        let weights = &self.ctx.settings.weights;

        let priority = self.priority_term(request, start);
        let time_preference = self.time_preference_term(request, start);
        let focus_protection = self.focus_term(request, &range);
        let habit_preservation = self.habit_term(request, start, &range);
        let energy = self.energy_term(request, start);
        let conflict_avoidance = 1.0;
        let penalty = self.soft_penalty(request, &range, placed);

        let weighted = weights.priority * priority
            + weights.time_preference * time_preference
            + weights.focus_protection * focus_protection
            + weights.habit_preservation * habit_preservation
            + weights.energy * energy
            + weights.conflict_avoidance * conflict_avoidance;
        let total = weighted / weights.total() - penalty;

        ScoreBreakdown {
            priority,
            time_preference,
            focus_protection,
            habit_preservation,
            energy,
            conflict_avoidance,
            penalty,
            total,
        }
    }

    /// Higher priorities lose more for every minute they are pushed back.
    fn priority_term(&self, request: &PlacementRequest, start: DateTime<Utc>) -> f64 {
        let span = self.ctx.horizon.duration_minutes().max(1) as f64;
        let offset = (start - self.ctx.horizon.start).num_minutes().max(0) as f64;
        (1.0 - request.priority.normalized() * (offset / span).min(1.0)).clamp(0.0, 1.0)
    }

    fn time_preference_term(&self, request: &PlacementRequest, start: DateTime<Utc>) -> f64 {
        if let Some(preferred) = request.preferred_start {
            let distance = (start - preferred).num_minutes().abs() as f64;
            let tolerance = request.flexibility_minutes.max(1) as f64;
            return (1.0 - distance / tolerance).clamp(0.0, 1.0);
        }

        let patterns = self.ctx.patterns;
        if patterns.hourly.is_empty() && patterns.productive_hours.is_empty() {
            return 0.5;
        }
        let hour = start.hour();
        if patterns.is_productive_hour(hour) {
            return 1.0;
        }
        match patterns.energy_at(hour) {
            Some(EnergyLevel::High) => 1.0,
            Some(EnergyLevel::Medium) => 0.6,
            Some(EnergyLevel::Low) => 0.3,
            None => 0.5,
        }
    }

    fn focus_term(&self, request: &PlacementRequest, range: &TimeRange) -> f64 {
        let focus_blocks = &self.ctx.patterns.focus_blocks;
        if request.is_focus_time {
            if focus_blocks.is_empty() {
                return 0.5;
            }
            let duration = range.duration_minutes().max(1) as f64;
            let best = focus_blocks
                .iter()
                .map(|focus| {
                    let coverage = focus.overlap_minutes(range) as f64 / duration;
                    coverage.min(1.0) * focus.quality.value()
                })
                .fold(0.0_f64, f64::max);
            return if best > 0.0 { best } else { 0.2 };
        }

        let touches = |protected_only: bool| {
            focus_blocks
                .iter()
                .filter(|focus| !protected_only || focus.is_protected())
                .any(|focus| focus.overlap_minutes(range) > 0)
        };
        if touches(true) {
            0.0
        } else if touches(false) {
            0.6
        } else {
            1.0
        }
    }

    fn habit_term(&self, request: &PlacementRequest, start: DateTime<Utc>, range: &TimeRange) -> f64 {
        let rules = &self.ctx.patterns.habit_rules;
        if request.is_habit {
            let rule = rules
                .iter()
                .find(|rule| rule.matches(&request.title, request.category.as_deref()));
            return match rule.and_then(|rule| {
                rule.distance_minutes(start)
                    .map(|distance| (rule, distance))
            }) {
                Some((rule, distance)) => {
                    let tolerance = rule.time_flexibility_minutes.max(60) as f64;
                    (1.0 - distance as f64 / tolerance).clamp(0.0, 1.0)
                }
                None => 0.5,
            };
        }

        let displaced = rules
            .iter()
            .filter(|rule| rule.alternatives_within(range))
            .map(|rule| rule.protection_strength)
            .fold(0.0_f64, f64::max);
        1.0 - 0.5 * displaced
    }

    fn energy_term(&self, request: &PlacementRequest, start: DateTime<Utc>) -> f64 {
        let demand = request.task_type.energy_demand();
        let available = self.ctx.patterns.energy_at(start.hour());
        match (demand, available) {
            (Some(demand), Some(available)) => match demand.rank() - available.rank() {
                gap if gap <= 0 => 1.0,
                1 => 0.6,
                _ => 0.2,
            },
            _ => 0.5,
        }
    }

    fn soft_penalty(&self, request: &PlacementRequest, range: &TimeRange, placed: &[TimeBlock]) -> f64 {
        let category = request.category_or_type();
        self.ctx
            .constraints
            .iter()
            .filter(|constraint| !constraint.is_blocking())
            .filter(|constraint| match &constraint.kind {
                ConstraintKind::TimeWindowExclusion { .. } => constraint.excludes(range),
                ConstraintKind::DurationCap {
                    max_minutes_per_day,
                    ..
                } => {
                    cap_applies(constraint, &category, false)
                        && capped_minutes_on(constraint, placed, range.start.date_naive())
                            + request.duration_minutes
                            > *max_minutes_per_day
                }
                ConstraintKind::FrequencyMinimum { .. } => false,
            })
            .map(ScheduleConstraint::soft_penalty)
            .sum()
    }
}

/// Result of running the placer over a batch of requests.
#[derive(Debug, Clone, Default)]
pub struct PlacementOutcome {
    /// Seeded and newly placed blocks, sorted by start.
    pub blocks: Vec<TimeBlock>,
    pub placed_ids: Vec<String>,
    pub unplaced: Vec<UnplacedBlock>,
    pub scores: BTreeMap<String, ScoreBreakdown>,
    pub partial: bool,
    pub evaluated_candidates: usize,
}

#[derive(Debug, Clone)]
pub enum PlaceAttempt {
    Placed(TimeBlock, ScoreBreakdown),
    Unplaced(UnplacedReason),
}

#[derive(Debug, Default)]
struct SearchResult {
    best: Option<(DateTime<Utc>, ScoreBreakdown)>,
    cancelled: bool,
}

/// Greedy constraint-satisfaction placer.
pub struct Placer<'a> {
    ctx: PlacementContext<'a>,
}

impl<'a> Placer<'a> {
    pub fn new(ctx: PlacementContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PlacementContext<'a> {
        &self.ctx
    }

    pub fn scorer(&self) -> CandidateScorer<'_, 'a> {
        CandidateScorer::new(&self.ctx)
    }

    /// Seeds `fixed` unchanged, then places `flexible` one at a time in priority order.
    pub fn place(
        &self,
        fixed: Vec<TimeBlock>,
        flexible: Vec<PlacementRequest>,
        signal: &CancellationSignal,
    ) -> PlacementOutcome {
        let mut outcome = PlacementOutcome {
            blocks: fixed,
            ..Default::default()
        };
        let windows = schedule_utils::working_windows(&self.ctx.horizon, self.ctx.settings);

        for request in self.order_requests(flexible) {
            if outcome.partial {
                outcome.unplaced.push(unplaced(&request, UnplacedReason::Cancelled));
                continue;
            }

            let search = self.search(
                &outcome.blocks,
                &request,
                &windows,
                signal,
                &mut outcome.evaluated_candidates,
            );
            if search.cancelled {
                outcome.partial = true;
                debug!(
                    target: "app::scheduler::placer",
                    block = %request.id,
                    evaluated = outcome.evaluated_candidates,
                    "placement cancelled; keeping best-so-far"
                );
            }

            match search.best {
                Some((start, breakdown)) => {
                    let block = into_scored_block(request, start, &breakdown);
                    outcome.placed_ids.push(block.id.clone());
                    outcome.scores.insert(block.id.clone(), breakdown);
                    outcome.blocks.push(block);
                }
                None => {
                    let reason = if search.cancelled {
                        UnplacedReason::Cancelled
                    } else {
                        self.unplaced_reason(&outcome.blocks, &request, &windows)
                    };
                    debug!(
                        target: "app::scheduler::placer",
                        block = %request.id,
                        reason = reason.as_str(),
                        "block left unplaced"
                    );
                    outcome.unplaced.push(unplaced(&request, reason));
                }
            }
        }

        sort_blocks(&mut outcome.blocks);
        debug!(
            target: "app::scheduler::placer",
            placed = outcome.placed_ids.len(),
            unplaced = outcome.unplaced.len(),
            evaluated = outcome.evaluated_candidates,
            partial = outcome.partial,
            "placement finished"
        );
        outcome
    }

    /// Places a single request against `existing` over the whole horizon.
    pub fn place_one(
        &self,
        existing: &[TimeBlock],
        request: &PlacementRequest,
        signal: &CancellationSignal,
    ) -> PlaceAttempt {
        self.place_within(existing, request, self.ctx.horizon, signal)
    }

    /// Places a single request against `existing`, searching only inside `window`.
    pub fn place_within(
        &self,
        existing: &[TimeBlock],
        request: &PlacementRequest,
        window: TimeRange,
        signal: &CancellationSignal,
    ) -> PlaceAttempt {
        let windows = schedule_utils::working_windows(&window, self.ctx.settings);
        let mut evaluated = 0;
        let search = self.search(existing, request, &windows, signal, &mut evaluated);
        match search.best {
            Some((start, breakdown)) => {
                PlaceAttempt::Placed(into_scored_block(request.clone(), start, &breakdown), breakdown)
            }
            None if search.cancelled => PlaceAttempt::Unplaced(UnplacedReason::Cancelled),
            None => PlaceAttempt::Unplaced(self.unplaced_reason(existing, request, &windows)),
        }
    }

    /// Best `limit` valid starts for `request`, highest score first.
    pub fn rank_candidates(
        &self,
        existing: &[TimeBlock],
        request: &PlacementRequest,
        limit: usize,
    ) -> Vec<(DateTime<Utc>, ScoreBreakdown)> {
        let windows = schedule_utils::working_windows(&self.ctx.horizon, self.ctx.settings);
        let scorer = self.scorer();
        let mut ranked: Vec<(DateTime<Utc>, ScoreBreakdown)> = self
            .candidate_starts(request, &windows)
            .into_iter()
            .filter(|start| self.is_valid(existing, request, *start, &windows))
            .map(|start| (start, scorer.score(request, start, existing)))
            .collect();
        ranked.sort_by(|(a_start, a), (b_start, b)| compare_scores(a, b).then_with(|| a_start.cmp(b_start)));
        ranked.truncate(limit);
        ranked
    }

    /// Priority weight scaled by category affinity, descending; ties by id.
    pub fn order_requests(&self, mut requests: Vec<PlacementRequest>) -> Vec<PlacementRequest> {
        let key = |request: &PlacementRequest| {
            request.priority.weight()
                * (1.0 + self.ctx.patterns.affinity(&request.category_or_type()))
        };
        requests.sort_by(|a, b| key(b).total_cmp(&key(a)).then_with(|| a.id.cmp(&b.id)));
        requests
    }

    fn search(
        &self,
        existing: &[TimeBlock],
        request: &PlacementRequest,
        windows: &[TimeRange],
        signal: &CancellationSignal,
        evaluated: &mut usize,
    ) -> SearchResult {
        let scorer = self.scorer();
        let mut result = SearchResult::default();

        for start in self.candidate_starts(request, windows) {
            if signal.should_stop(*evaluated) {
                result.cancelled = true;
                break;
            }
            *evaluated += 1;
            if !self.is_valid(existing, request, start, windows) {
                continue;
            }
            let breakdown = scorer.score(request, start, existing);
            trace!(
                target: "app::scheduler::placer",
                block = %request.id,
                start = %start,
                score = breakdown.total,
                "candidate scored"
            );
            let better = match &result.best {
                None => true,
                Some((best_start, best)) => match compare_scores(&breakdown, best) {
                    Ordering::Less => true,
                    Ordering::Equal => start < *best_start,
                    Ordering::Greater => false,
                },
            };
            if better {
                result.best = Some((start, breakdown));
            }
        }
        result
    }

    /// Grid starts inside each window, plus the preferred and earliest starts when they fit.
    fn candidate_starts(&self, request: &PlacementRequest, windows: &[TimeRange]) -> Vec<DateTime<Utc>> {
        let step = self.ctx.settings.slot_granularity_minutes.max(1);
        let mut starts = Vec::new();

        for window in windows {
            let mut cursor = align_up(window.start, self.ctx.settings.slot_granularity_minutes);
            while offset_minutes(cursor, request.duration_minutes) <= window.end {
                starts.push(cursor);
                cursor = offset_minutes(cursor, step);
            }
        }
        for extra in [request.preferred_start, request.earliest_start].into_iter().flatten() {
            let range = request.range_at(extra);
            if windows
                .iter()
                .any(|window| window.start <= range.start && range.end <= window.end)
            {
                starts.push(extra);
            }
        }

        if let Some(preferred) = request.preferred_start {
            let earliest = offset_minutes(preferred, request.flexibility_minutes.saturating_neg());
            let latest = offset_minutes(preferred, request.flexibility_minutes);
            starts.retain(|start| *start >= earliest && *start <= latest);
        }
        starts.sort_unstable();
        starts.dedup();
        starts
    }

    fn is_valid(
        &self,
        existing: &[TimeBlock],
        request: &PlacementRequest,
        start: DateTime<Utc>,
        windows: &[TimeRange],
    ) -> bool {
        let range = request.range_at(start);
        if !windows
            .iter()
            .any(|window| window.start <= range.start && range.end <= window.end)
        {
            return false;
        }
        if request.earliest_start.map_or(false, |earliest| start < earliest) {
            return false;
        }
        if request.excluded_starts.contains(&start) {
            return false;
        }

        let buffered = request.buffered_range_at(start);
        if existing
            .iter()
            .any(|block| block.buffered_range().overlaps(&buffered))
        {
            return false;
        }

        let category = request.category_or_type();
        for constraint in self.ctx.constraints.iter().filter(|c| c.is_blocking()) {
            match &constraint.kind {
                ConstraintKind::TimeWindowExclusion { .. } => {
                    if constraint.excludes(&range) {
                        return false;
                    }
                }
                ConstraintKind::DurationCap {
                    max_minutes_per_day,
                    ..
                } => {
                    if cap_applies(constraint, &category, false)
                        && capped_minutes_on(constraint, existing, start.date_naive())
                            + request.duration_minutes
                            > *max_minutes_per_day
                    {
                        return false;
                    }
                }
                ConstraintKind::FrequencyMinimum { .. } => {}
            }
        }

        if self.ctx.settings.protect_focus_time
            && !request.is_focus_time
            && self
                .ctx
                .patterns
                .protected_focus_blocks()
                .any(|focus| focus.overlap_minutes(&range) > 0)
        {
            return false;
        }
        true
    }

    fn unplaced_reason(
        &self,
        existing: &[TimeBlock],
        request: &PlacementRequest,
        windows: &[TimeRange],
    ) -> UnplacedReason {
        let busy: Vec<TimeRange> = existing.iter().map(TimeBlock::range).collect();
        let fits = schedule_utils::free_intervals(windows, &busy)
            .iter()
            .any(|interval| interval.duration_minutes() >= request.duration_minutes);
        if fits {
            UnplacedReason::NoValidCandidate
        } else {
            UnplacedReason::NoSufficientInterval
        }
    }
}

pub(crate) fn sort_blocks(blocks: &mut [TimeBlock]) {
    blocks.sort_by(|a, b| a.start_at.cmp(&b.start_at).then_with(|| a.id.cmp(&b.id)));
}

/// Descending by total; `Less` means `a` ranks ahead of `b`.
fn compare_scores(a: &ScoreBreakdown, b: &ScoreBreakdown) -> Ordering {
    b.total.total_cmp(&a.total)
}

fn capped_minutes_on(constraint: &ScheduleConstraint, blocks: &[TimeBlock], day: NaiveDate) -> i64 {
    blocks
        .iter()
        .filter(|block| block.start_at.date_naive() == day)
        .filter(|block| cap_applies(constraint, &block.category_or_type(), block.is_fixed()))
        .map(|block| block.duration_minutes)
        .sum()
}

fn align_up(instant: DateTime<Utc>, granularity_minutes: i64) -> DateTime<Utc> {
    let granularity = granularity_minutes.max(1);
    let day = schedule_utils::start_of_day(instant);
    let offset = (instant - day).num_seconds();
    let step = granularity * 60;
    let aligned = (offset + step - 1) / step * step;
    day + Duration::seconds(aligned)
}

fn into_scored_block(request: PlacementRequest, start: DateTime<Utc>, breakdown: &ScoreBreakdown) -> TimeBlock {
    let mut block = request.into_block(start);
    block
        .metadata
        .insert(PLACEMENT_SCORE_KEY.into(), breakdown.to_json());
    block
}

fn unplaced(request: &PlacementRequest, reason: UnplacedReason) -> UnplacedBlock {
    UnplacedBlock {
        id: request.id.clone(),
        title: request.title.clone(),
        duration_minutes: request.duration_minutes,
        reason,
    }
}
