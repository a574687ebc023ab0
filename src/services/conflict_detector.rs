use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::debug;

use crate::models::conflict::{ConflictType, ScheduleConflict};
use crate::models::constraint::{ConstraintKind, ScheduleConstraint};
use crate::models::time_block::TimeBlock;
use crate::services::conflict_resolver::suggest_strategies;
use crate::services::settings_service::EngineSettings;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

/// Pair severity: mean priority, doubled for focus and again for habits, clamped to 1–10.
pub fn severity(a: &TimeBlock, b: &TimeBlock) -> u8 {
    let mut value = (a.priority.ordinal() as f64 + b.priority.ordinal() as f64) / 2.0;
    if a.is_focus_time || b.is_focus_time {
        value *= 2.0;
    }
    if a.is_habit || b.is_habit {
        value *= 2.0;
    }
    value.round().clamp(1.0, 10.0) as u8
}

/// Stable id derived from the conflict type and the sorted block ids.
pub fn conflict_id(conflict_type: ConflictType, block_ids: &[&str]) -> String {
    let mut ids = block_ids.to_vec();
    ids.sort_unstable();
    let key = format!("{}|{}", conflict_type.as_str(), ids.join("|"));
    format!(
        "conflict-{}-{:016x}",
        conflict_type.as_str(),
        deterministic_hash(&key, FNV_OFFSET)
    )
}

pub fn build_conflict(
    conflict_type: ConflictType,
    blocks: Vec<TimeBlock>,
    severity: u8,
    message: String,
    settings: &EngineSettings,
) -> ScheduleConflict {
    let ids: Vec<&str> = blocks.iter().map(|block| block.id.as_str()).collect();
    let id = conflict_id(conflict_type, &ids);
    let suggested_resolutions = suggest_strategies(&blocks, severity, settings);
    ScheduleConflict {
        id,
        conflict_type,
        severity,
        blocks,
        suggested_resolutions,
        message,
        accepted: false,
    }
}

/// Whether a block counts toward a duration cap. Uncategorized caps only count flexible work.
pub(crate) fn cap_applies(constraint: &ScheduleConstraint, category: &str, fixed: bool) -> bool {
    match &constraint.kind {
        ConstraintKind::DurationCap { category: None, .. } => !fixed,
        ConstraintKind::DurationCap { .. } => constraint.caps_category(category),
        _ => false,
    }
}

pub struct ConflictDetector<'a> {
    settings: &'a EngineSettings,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(settings: &'a EngineSettings) -> Self {
        Self { settings }
    }

    /// Every pairwise overlap among `blocks` (plus `candidate`), via sort-and-sweep.
    pub fn detect(&self, blocks: &[TimeBlock], candidate: Option<&TimeBlock>) -> Vec<ScheduleConflict> {
        let mut ordered: Vec<&TimeBlock> = blocks.iter().chain(candidate).collect();
        ordered.sort_by(|a, b| {
            a.start_at
                .cmp(&b.start_at)
                .then_with(|| a.end_at.cmp(&b.end_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut conflicts = Vec::new();
        let mut active: Vec<&TimeBlock> = Vec::new();
        for block in ordered {
            active.retain(|open| open.end_at > block.start_at);
            for open in &active {
                conflicts.push(self.overlap_conflict(open, block));
            }
            active.push(block);
        }

        sort_conflicts(&mut conflicts);
        conflicts
    }

    /// Hard duration caps exceeded by two or more blocks on the same day.
    pub fn detect_constraint_violations(
        &self,
        blocks: &[TimeBlock],
        constraints: &[ScheduleConstraint],
    ) -> Vec<ScheduleConflict> {
        let mut conflicts = Vec::new();
        for constraint in constraints.iter().filter(|c| c.is_blocking()) {
            let ConstraintKind::DurationCap {
                max_minutes_per_day,
                ..
            } = &constraint.kind
            else {
                continue;
            };

            let mut per_day: BTreeMap<NaiveDate, Vec<&TimeBlock>> = BTreeMap::new();
            for block in blocks
                .iter()
                .filter(|block| cap_applies(constraint, &block.category_or_type(), block.is_fixed()))
            {
                per_day.entry(block.start_at.date_naive()).or_default().push(block);
            }

            for (day, day_blocks) in per_day {
                let total: i64 = day_blocks.iter().map(|block| block.duration_minutes).sum();
                if total <= *max_minutes_per_day || day_blocks.len() < 2 {
                    continue;
                }
                let mean = day_blocks
                    .iter()
                    .map(|block| block.priority.ordinal() as f64)
                    .sum::<f64>()
                    / day_blocks.len() as f64;
                let severity = mean.round().clamp(1.0, 10.0) as u8;
                conflicts.push(build_conflict(
                    ConflictType::ConstraintViolation,
                    day_blocks.into_iter().cloned().collect(),
                    severity,
                    format!(
                        "{day} 排程 {total} 分钟，超过约束 {} 的上限 {max_minutes_per_day} 分钟",
                        constraint.id
                    ),
                    self.settings,
                ));
            }
        }
        sort_conflicts(&mut conflicts);
        conflicts
    }

    pub fn detect_all(
        &self,
        blocks: &[TimeBlock],
        constraints: &[ScheduleConstraint],
    ) -> Vec<ScheduleConflict> {
        let mut conflicts = self.detect(blocks, None);
        conflicts.extend(self.detect_constraint_violations(blocks, constraints));
        sort_conflicts(&mut conflicts);
        debug!(
            target: "app::scheduler::conflict",
            blocks = blocks.len(),
            conflicts = conflicts.len(),
            "conflict detection finished"
        );
        conflicts
    }

    fn overlap_conflict(&self, a: &TimeBlock, b: &TimeBlock) -> ScheduleConflict {
        let conflict_type = if a.is_external() && b.is_external() {
            ConflictType::ResourceConflict
        } else {
            ConflictType::Overlap
        };
        let message = format!(
            "时间块 {} [{} - {}] 与 {} [{} - {}] 重叠",
            a.id,
            a.start_at.format("%m-%d %H:%M"),
            a.end_at.format("%H:%M"),
            b.id,
            b.start_at.format("%m-%d %H:%M"),
            b.end_at.format("%H:%M"),
        );
        build_conflict(
            conflict_type,
            vec![a.clone(), b.clone()],
            severity(a, b),
            message,
            self.settings,
        )
    }
}

fn sort_conflicts(conflicts: &mut [ScheduleConflict]) {
    conflicts.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));
}

fn deterministic_hash(value: &str, seed: u64) -> u64 {
    let mut hash: u64 = seed;
    for byte in value.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1_099_511_628_211u64);
    }
    hash
}
