use std::collections::BTreeSet;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::models::candidate::PlacementRequest;
use crate::models::conflict::{
    AlternativeSlot, ResolutionOutcome, ResolutionState, ResolutionStrategy, ScheduleConflict,
};
use crate::models::constraint::ScheduleConstraint;
use crate::models::schedule::{IssueKind, ScheduleIssue};
use crate::models::time_block::{offset_minutes, TimeBlock, TimeRange};
use crate::services::conflict_detector::ConflictDetector;
use crate::services::placer::{sort_blocks, PlaceAttempt, Placer};
use crate::services::schedule_utils;
use crate::services::settings_service::EngineSettings;
use crate::utils::cancellation::CancellationSignal;

/// Caller override for the order in which strategies are tried. Empty uses each conflict's
/// own suggestions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionPolicy {
    #[serde(default)]
    pub strategies: Vec<ResolutionStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReport {
    pub outcomes: Vec<ResolutionOutcome>,
    /// Conflicts left in the schedule; all of them are accepted.
    pub outstanding: Vec<ScheduleConflict>,
    pub issues: Vec<ScheduleIssue>,
    pub cancelled: bool,
}

/// Ranked strategies for a conflict among `blocks`. Empty when nothing can move.
pub fn suggest_strategies(
    blocks: &[TimeBlock],
    severity: u8,
    settings: &EngineSettings,
) -> Vec<ResolutionStrategy> {
    let movable: Vec<&TimeBlock> = blocks.iter().filter(|block| !block.is_fixed()).collect();
    if movable.is_empty() {
        return Vec::new();
    }

    let splittable = movable
        .iter()
        .any(|block| block.duration_minutes > settings.split_threshold_minutes);
    let compressible = settings.allow_compress && blocks.iter().all(is_compressible);

    let mut strategies = vec![ResolutionStrategy::RescheduleLowerPriority];
    if severity >= 6 {
        strategies.push(ResolutionStrategy::DeferToNextDay);
    }
    if splittable {
        strategies.push(ResolutionStrategy::SplitTask {
            threshold_minutes: settings.split_threshold_minutes,
        });
    }
    if compressible {
        strategies.push(ResolutionStrategy::Compress {
            min_ratio: settings.compress_min_ratio,
        });
    }
    if severity < 6 {
        strategies.push(ResolutionStrategy::DeferToNextDay);
    }
    strategies.push(ResolutionStrategy::SuggestAlternative {
        max_alternatives: settings.max_alternatives,
    });
    strategies
}

fn is_compressible(block: &TimeBlock) -> bool {
    !block.is_fixed() && !block.is_habit && !block.is_focus_time
}

/// Applies resolution strategies to a block list. Fixed blocks are never touched.
pub struct ConflictResolver<'p, 'a> {
    placer: &'p Placer<'a>,
    movable: Option<BTreeSet<String>>,
}

impl<'p, 'a> ConflictResolver<'p, 'a> {
    pub fn new(placer: &'p Placer<'a>) -> Self {
        Self {
            placer,
            movable: None,
        }
    }

    /// Only blocks with these ids may be moved.
    pub fn restricted_to(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.movable = Some(ids.into_iter().collect());
        self
    }

    fn settings(&self) -> &EngineSettings {
        self.placer.context().settings
    }

    fn can_move(&self, block: &TimeBlock) -> bool {
        !block.is_fixed()
            && self
                .movable
                .as_ref()
                .map_or(true, |ids| ids.contains(&block.id))
    }

    /// Current versions of the conflict's blocks that may move, lowest priority first, then
    /// later start, then id.
    fn victims(&self, blocks: &[TimeBlock], conflict: &ScheduleConflict) -> Vec<TimeBlock> {
        let mut victims: Vec<TimeBlock> = blocks
            .iter()
            .filter(|block| conflict.involves(&block.id) && self.can_move(block))
            .cloned()
            .collect();
        victims.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.start_at.cmp(&a.start_at))
                .then_with(|| b.id.cmp(&a.id))
        });
        victims
    }

    pub fn apply(
        &self,
        blocks: &mut Vec<TimeBlock>,
        conflict: &ScheduleConflict,
        strategy: &ResolutionStrategy,
        signal: &CancellationSignal,
    ) -> ResolutionOutcome {
        let kind = strategy.kind();
        let victims = self.victims(blocks, conflict);
        let Some(victim) = victims.first().cloned() else {
            return ResolutionOutcome::new(
                &conflict.id,
                kind,
                ResolutionState::StillConflicting,
                "冲突中的时间块均不可移动",
            );
        };

        let outcome = match strategy {
            ResolutionStrategy::RescheduleLowerPriority => {
                self.reschedule(blocks, conflict, victim, signal)
            }
            ResolutionStrategy::SplitTask { threshold_minutes } => {
                self.split(blocks, conflict, &victims, *threshold_minutes, signal)
            }
            ResolutionStrategy::SuggestAlternative { max_alternatives } => {
                self.suggest(blocks, conflict, victim, *max_alternatives)
            }
            ResolutionStrategy::DeferToNextDay => self.defer(blocks, conflict, victim, signal),
            ResolutionStrategy::Compress { min_ratio } => {
                self.compress(blocks, conflict, *min_ratio)
            }
        };

        debug!(
            target: "app::scheduler::resolver",
            conflict = %conflict.id,
            strategy = ?kind,
            state = ?outcome.state,
            "resolution strategy applied"
        );
        outcome
    }

    fn reschedule(
        &self,
        blocks: &mut Vec<TimeBlock>,
        conflict: &ScheduleConflict,
        victim: TimeBlock,
        signal: &CancellationSignal,
    ) -> ResolutionOutcome {
        let kind = ResolutionStrategy::RescheduleLowerPriority.kind();
        let rest = without(blocks, &victim.id);
        let request = PlacementRequest::from_block(&victim).excluding(victim.start_at);

        match self.placer.place_one(&rest, &request, signal) {
            PlaceAttempt::Placed(moved, _) => {
                let message = format!(
                    "已将 {} 移至 {}",
                    victim.id,
                    schedule_utils::format_datetime(moved.start_at)
                );
                replace(blocks, rest, vec![moved]);
                let mut outcome =
                    ResolutionOutcome::new(&conflict.id, kind, ResolutionState::Resolved, message);
                outcome.moved_block_ids.push(victim.id);
                outcome
            }
            PlaceAttempt::Unplaced(reason) => ResolutionOutcome::new(
                &conflict.id,
                kind,
                ResolutionState::StillConflicting,
                format!("无法为 {} 找到新位置: {}", victim.id, reason.as_str()),
            ),
        }
    }

    fn split(
        &self,
        blocks: &mut Vec<TimeBlock>,
        conflict: &ScheduleConflict,
        victims: &[TimeBlock],
        threshold_minutes: i64,
        signal: &CancellationSignal,
    ) -> ResolutionOutcome {
        let kind = ResolutionStrategy::SplitTask { threshold_minutes }.kind();
        let target = victims
            .iter()
            .filter(|block| !block.is_habit && block.duration_minutes > threshold_minutes)
            .max_by(|a, b| {
                a.duration_minutes
                    .cmp(&b.duration_minutes)
                    .then_with(|| b.priority.cmp(&a.priority))
                    .then_with(|| b.id.cmp(&a.id))
            });
        let Some(target) = target else {
            return ResolutionOutcome::new(
                &conflict.id,
                kind,
                ResolutionState::StillConflicting,
                format!("没有超过 {threshold_minutes} 分钟的可拆分任务"),
            );
        };

        let (first, second) = split_request(target);
        let mut working = without(blocks, &target.id);

        let first_block = match self.placer.place_one(&working, &first, signal) {
            PlaceAttempt::Placed(block, _) => block,
            PlaceAttempt::Unplaced(reason) => {
                return ResolutionOutcome::new(
                    &conflict.id,
                    kind,
                    ResolutionState::StillConflicting,
                    format!("拆分后的第一部分无法安排: {}", reason.as_str()),
                );
            }
        };
        working.push(first_block.clone());
        let second = second.not_before(first_block.end_at);
        let second_block = match self.placer.place_one(&working, &second, signal) {
            PlaceAttempt::Placed(block, _) => block,
            PlaceAttempt::Unplaced(reason) => {
                return ResolutionOutcome::new(
                    &conflict.id,
                    kind,
                    ResolutionState::StillConflicting,
                    format!("拆分后的第二部分无法安排: {}", reason.as_str()),
                );
            }
        };
        working.pop();

        let created = vec![first_block.id.clone(), second_block.id.clone()];
        replace(blocks, working, vec![first_block, second_block]);
        let mut outcome = ResolutionOutcome::new(
            &conflict.id,
            kind,
            ResolutionState::Resolved,
            format!("已将 {} 拆分为两部分", target.id),
        );
        outcome.moved_block_ids.push(target.id.clone());
        outcome.created_block_ids = created;
        outcome
    }

    fn suggest(
        &self,
        blocks: &[TimeBlock],
        conflict: &ScheduleConflict,
        victim: TimeBlock,
        max_alternatives: usize,
    ) -> ResolutionOutcome {
        let limit = max_alternatives.min(self.settings().max_alternatives);
        let rest = without(blocks, &victim.id);
        let request = PlacementRequest::from_block(&victim).excluding(victim.start_at);
        let alternatives: Vec<AlternativeSlot> = self
            .placer
            .rank_candidates(&rest, &request, limit)
            .into_iter()
            .map(|(start, breakdown)| AlternativeSlot {
                block_id: victim.id.clone(),
                start_at: start,
                end_at: offset_minutes(start, victim.duration_minutes),
                score: breakdown.normalized_total(),
            })
            .collect();

        let mut outcome = ResolutionOutcome::new(
            &conflict.id,
            ResolutionStrategy::SuggestAlternative { max_alternatives }.kind(),
            ResolutionState::Deferred,
            format!("为 {} 提供 {} 个备选时间", victim.id, alternatives.len()),
        );
        outcome.alternatives = alternatives;
        outcome
    }

    fn defer(
        &self,
        blocks: &mut Vec<TimeBlock>,
        conflict: &ScheduleConflict,
        victim: TimeBlock,
        signal: &CancellationSignal,
    ) -> ResolutionOutcome {
        let kind = ResolutionStrategy::DeferToNextDay.kind();
        let next_day = schedule_utils::start_of_day(victim.start_at) + Duration::days(1);
        let horizon_end = self.placer.context().horizon.end.max(next_day);
        let window = TimeRange::new(next_day, horizon_end + Duration::days(1));

        let rest = without(blocks, &victim.id);
        let request = PlacementRequest::from_block(&victim);
        match self.placer.place_within(&rest, &request, window, signal) {
            PlaceAttempt::Placed(moved, _) => {
                let message = format!(
                    "已将 {} 推迟至 {}",
                    victim.id,
                    schedule_utils::format_datetime(moved.start_at)
                );
                replace(blocks, rest, vec![moved]);
                let mut outcome =
                    ResolutionOutcome::new(&conflict.id, kind, ResolutionState::Resolved, message);
                outcome.moved_block_ids.push(victim.id);
                outcome
            }
            PlaceAttempt::Unplaced(reason) => ResolutionOutcome::new(
                &conflict.id,
                kind,
                ResolutionState::StillConflicting,
                format!("无法将 {} 推迟到次日: {}", victim.id, reason.as_str()),
            ),
        }
    }

    fn compress(
        &self,
        blocks: &mut Vec<TimeBlock>,
        conflict: &ScheduleConflict,
        min_ratio: f64,
    ) -> ResolutionOutcome {
        let kind = ResolutionStrategy::Compress { min_ratio }.kind();
        let still = |message: String| {
            ResolutionOutcome::new(&conflict.id, kind, ResolutionState::StillConflicting, message)
        };

        if !self.settings().allow_compress {
            return still("压缩策略未启用".to_string());
        }
        let mut members: Vec<TimeBlock> = blocks
            .iter()
            .filter(|block| conflict.involves(&block.id))
            .cloned()
            .collect();
        if members.len() < 2
            || !members
                .iter()
                .all(|block| is_compressible(block) && self.can_move(block))
        {
            return still("冲突中包含不可压缩的时间块".to_string());
        }

        members.sort_by(|a, b| a.start_at.cmp(&b.start_at).then_with(|| a.id.cmp(&b.id)));
        let span_start = members.iter().map(|b| b.start_at).min().unwrap_or_default();
        let span_end = members.iter().map(|b| b.end_at).max().unwrap_or_default();
        let span = (span_end - span_start).num_minutes();
        let total: i64 = members.iter().map(|block| block.duration_minutes).sum();
        let ratio = span as f64 / total.max(1) as f64;
        if ratio < min_ratio {
            return still(format!("所需压缩比例 {ratio:.2} 低于下限 {min_ratio:.2}"));
        }

        let mut cursor = span_start;
        let count = members.len();
        for (index, block) in members.iter_mut().enumerate() {
            let end = if index + 1 == count {
                span_end
            } else {
                offset_minutes(cursor, (block.duration_minutes as f64 * ratio).floor() as i64)
            };
            if end <= cursor {
                return still(format!("压缩后 {} 的时长不足", block.id));
            }
            block.retime(TimeRange::new(cursor, end));
            block
                .metadata
                .insert("compressedRatio".into(), json!(ratio));
            cursor = end;
        }

        let ids: Vec<String> = members.iter().map(|block| block.id.clone()).collect();
        let rest: Vec<TimeBlock> = blocks
            .iter()
            .filter(|block| !ids.contains(&block.id))
            .cloned()
            .collect();
        if members
            .iter()
            .any(|member| rest.iter().any(|other| other.overlaps(member)))
        {
            return still("压缩后仍与其他时间块重叠".to_string());
        }

        replace(blocks, rest, members);
        let mut outcome = ResolutionOutcome::new(
            &conflict.id,
            kind,
            ResolutionState::Resolved,
            format!("已按比例 {ratio:.2} 压缩 {} 个时间块", ids.len()),
        );
        outcome.moved_block_ids = ids;
        outcome
    }

    /// Detect/resolve loop. Conflicts nothing can fix are accepted and reported.
    pub fn resolve_all(
        &self,
        blocks: &mut Vec<TimeBlock>,
        constraints: &[ScheduleConstraint],
        policy: &ResolutionPolicy,
        signal: &CancellationSignal,
    ) -> ResolutionReport {
        let settings = self.settings();
        let detector = ConflictDetector::new(settings);
        let mut report = ResolutionReport::default();
        let mut accepted: BTreeSet<String> = BTreeSet::new();
        let mut rounds = 0;

        loop {
            let conflicts = detector.detect_all(blocks, constraints);
            let Some(conflict) = conflicts.iter().find(|c| !accepted.contains(&c.id)) else {
                break;
            };
            if signal.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if rounds >= settings.max_resolution_rounds {
                report.issues.push(ScheduleIssue::new(
                    IssueKind::UnresolvableConflict,
                    None,
                    format!("冲突解决超过 {} 轮，剩余冲突已保留", settings.max_resolution_rounds),
                ));
                break;
            }
            rounds += 1;

            if self.victims(blocks, conflict).is_empty() {
                info!(
                    target: "app::scheduler::resolver",
                    conflict = %conflict.id,
                    blocks = ?conflict.block_ids(),
                    "accepting conflict between immovable blocks"
                );
                accepted.insert(conflict.id.clone());
                report.issues.push(ScheduleIssue::new(
                    IssueKind::UnresolvableConflict,
                    Some(&conflict.id),
                    format!("无法自动解决: {}", conflict.message),
                ));
                continue;
            }

            let strategies = if policy.strategies.is_empty() {
                conflict.suggested_resolutions.clone()
            } else {
                policy.strategies.clone()
            };

            let mut resolved = false;
            for strategy in &strategies {
                let outcome = self.apply(blocks, conflict, strategy, signal);
                resolved = outcome.state == ResolutionState::Resolved;
                report.outcomes.push(outcome);
                if resolved {
                    break;
                }
            }
            if !resolved {
                accepted.insert(conflict.id.clone());
                report.issues.push(ScheduleIssue::new(
                    IssueKind::UnresolvableConflict,
                    Some(&conflict.id),
                    format!("所有策略均未能解决: {}", conflict.message),
                ));
            }
        }

        sort_blocks(blocks);
        report.outstanding = detector
            .detect_all(blocks, constraints)
            .into_iter()
            .map(|mut conflict| {
                conflict.accepted = true;
                conflict
            })
            .collect();
        debug!(
            target: "app::scheduler::resolver",
            rounds,
            outcomes = report.outcomes.len(),
            outstanding = report.outstanding.len(),
            "resolution loop finished"
        );
        report
    }
}

fn without(blocks: &[TimeBlock], id: &str) -> Vec<TimeBlock> {
    blocks.iter().filter(|block| block.id != id).cloned().collect()
}

fn replace(blocks: &mut Vec<TimeBlock>, rest: Vec<TimeBlock>, added: Vec<TimeBlock>) {
    *blocks = rest;
    blocks.extend(added);
    sort_blocks(blocks);
}

/// Halves a block into two placeable parts, `{id}#1` and `{id}#2`.
fn split_request(block: &TimeBlock) -> (PlacementRequest, PlacementRequest) {
    let first_minutes = block.duration_minutes / 2;
    let second_minutes = block.duration_minutes - first_minutes;

    let part = |index: u8, minutes: i64| {
        let mut request = PlacementRequest::from_block(block);
        request.id = format!("{}#{index}", block.id);
        request.title = format!("{} ({index}/2)", block.title);
        request.duration_minutes = minutes;
        if index == 1 {
            request.buffer_before_minutes = block.buffer_before_minutes.min(minutes);
            request.buffer_after_minutes = 0;
        } else {
            request.buffer_before_minutes = 0;
            request.buffer_after_minutes = block.buffer_after_minutes.min(minutes);
        }
        request
            .metadata
            .insert("splitFrom".into(), json!(block.id));
        request
    };
    (part(1, first_minutes), part(2, second_minutes))
}
