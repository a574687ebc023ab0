use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::models::calendar::ExternalEvent;
use crate::models::candidate::PlacementRequest;
use crate::models::constraint::ScheduleConstraint;
use crate::models::disruption::{Disruption, DisruptionKind};
use crate::models::pattern::{EnergyLevel, PatternSnapshot};
use crate::models::schedule::{GeneratedSchedule, IssueKind, ScheduleIssue};
use crate::models::time_block::{Priority, TaskType, TimeBlock, TimeRange};
use crate::services::calendar_integrator::normalize_event;
use crate::services::conflict_resolver::{ConflictResolver, ResolutionPolicy};
use crate::services::placer::{PlacementContext, Placer};
use crate::services::schedule_service::{
    build_schedule, default_patterns, unplaced_issues, ScheduleDraft, UNPLACED_HABITS_KEY,
};
use crate::services::settings_service::EngineSettings;
use crate::utils::cancellation::CancellationSignal;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleRequest {
    pub schedule: GeneratedSchedule,
    pub disruption: Disruption,
    #[serde(default)]
    pub patterns: Option<PatternSnapshot>,
    #[serde(default)]
    pub constraints: Vec<ScheduleConstraint>,
    #[serde(default)]
    pub resolution_policy: ResolutionPolicy,
}

/// Re-plans only the part of a schedule a disruption invalidates.
pub struct AutonomousRescheduler<'a> {
    settings: &'a EngineSettings,
}

impl<'a> AutonomousRescheduler<'a> {
    pub fn new(settings: &'a EngineSettings) -> Self {
        Self { settings }
    }

    pub fn reschedule(
        &self,
        request: RescheduleRequest,
        signal: &CancellationSignal,
    ) -> AppResult<GeneratedSchedule> {
        let RescheduleRequest {
            schedule,
            disruption,
            patterns,
            constraints,
            resolution_policy,
        } = request;

        let range = TimeRange::checked(disruption.time_range.start, disruption.time_range.end)?;
        for constraint in &constraints {
            constraint.validate()?;
        }

        let mut issues = Vec::new();
        let source_patterns = match patterns.or_else(|| schedule.patterns.clone()) {
            Some(patterns) => patterns,
            None => default_patterns(&schedule.owner_id, 0, &mut issues),
        };
        let mut patterns = source_patterns.clone();
        let mut blocks = schedule.blocks.clone();
        let mut affected_ranges = vec![range];
        let mut pinned: Option<String> = None;

        match disruption.kind {
            DisruptionKind::MeetingOverrun => {
                let (extent, meeting_id) = extend_meeting(&mut blocks, &disruption, range, &mut issues);
                affected_ranges.push(extent);
                pinned = meeting_id;
            }
            DisruptionKind::UrgentTask => {
                let urgent = urgent_block(&disruption, range);
                if blocks.iter().any(|block| block.id == urgent.id) {
                    return Err(AppError::validation_with_details(
                        "紧急任务 ID 与现有时间块重复",
                        json!({"blockId": urgent.id}),
                    ));
                }
                blocks.push(urgent);
            }
            DisruptionKind::EnergyLevelChange => {
                let level = disruption
                    .metadata
                    .get("energy")
                    .and_then(JsonValue::as_str)
                    .and_then(EnergyLevel::parse)
                    .ok_or_else(|| {
                        AppError::validation_with_details(
                            "能量变化事件缺少有效的 energy 字段",
                            json!({"metadata": disruption.metadata}),
                        )
                    })?;
                patterns.override_energy(&range, level);
            }
            DisruptionKind::ExternalEvent => {
                let block = self.external_block(&disruption, range)?;
                affected_ranges.push(block.range());
                blocks.retain(|existing| existing.id != block.id);
                blocks.push(block);
            }
        }

        let (affected, kept): (Vec<TimeBlock>, Vec<TimeBlock>) =
            blocks.into_iter().partition(|block| {
                !block.is_fixed()
                    && pinned.as_deref() != Some(block.id.as_str())
                    && affected_ranges
                        .iter()
                        .any(|affected| block.range().overlaps(affected))
            });
        let affected_ids: Vec<String> = affected.iter().map(|block| block.id.clone()).collect();

        let horizon = schedule.horizon.range();
        let search_start = range.start.max(horizon.start);
        let search = TimeRange::new(search_start, horizon.end.max(search_start));
        let requests: Vec<PlacementRequest> = affected
            .iter()
            .map(|block| PlacementRequest::from_block(block).not_before(search_start))
            .collect();

        let placer = Placer::new(PlacementContext::new(
            self.settings,
            search,
            &patterns,
            &constraints,
        ));
        let outcome = placer.place(kept, requests, signal);
        issues.extend(unplaced_issues(&outcome.unplaced));

        let mut blocks = outcome.blocks;
        let report = ConflictResolver::new(&placer)
            .restricted_to(affected_ids.iter().cloned())
            .resolve_all(
                &mut blocks,
                &placer.context().constraints,
                &resolution_policy,
                signal,
            );
        issues.extend(report.issues);

        info!(
            target: "app::scheduler::rescheduler",
            schedule = %schedule.id,
            disruption = disruption.kind.as_str(),
            affected = affected_ids.len(),
            replaced = outcome.placed_ids.len(),
            "schedule revised after disruption"
        );

        let mut unplaced_habit_ids: BTreeSet<String> = schedule
            .metadata
            .get(UNPLACED_HABITS_KEY)
            .and_then(JsonValue::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        unplaced_habit_ids.extend(
            affected
                .iter()
                .filter(|block| block.is_habit)
                .filter(|block| outcome.unplaced.iter().any(|entry| entry.id == block.id))
                .map(|block| block.id.clone()),
        );

        let mut unplaced = schedule.unplaced.clone();
        unplaced.extend(outcome.unplaced);

        let mut metadata = schedule.metadata.clone();
        metadata.insert("parentScheduleId".into(), json!(schedule.id));
        metadata.insert("disruptionType".into(), json!(disruption.kind.as_str()));
        metadata.insert("affectedBlockIds".into(), json!(affected_ids));

        Ok(build_schedule(ScheduleDraft {
            settings: self.settings,
            owner_id: schedule.owner_id.clone(),
            horizon: schedule.horizon.clone(),
            blocks,
            conflicts: report.outstanding,
            unplaced,
            unplaced_habit_ids,
            issues,
            patterns: &patterns,
            source_patterns,
            constraints: &placer.context().constraints,
            partial: outcome.partial || report.cancelled,
            revision: schedule.revision + 1,
            metadata,
        }))
    }

    fn external_block(&self, disruption: &Disruption, range: TimeRange) -> AppResult<TimeBlock> {
        match disruption.metadata.get("event") {
            Some(raw) => {
                let event: ExternalEvent = serde_json::from_value(raw.clone())?;
                normalize_event(&event, self.settings.timezone()?)
            }
            None => {
                let mut block = TimeBlock::fixed(
                    format!("external-{}", range.start.timestamp()),
                    "外部日程",
                    range,
                );
                block.task_type = TaskType::Meeting;
                block.source = Some("external".into());
                Ok(block)
            }
        }
    }
}

/// Stretches the overrunning meeting to the end of `range`. Returns the span now blocked and
/// the id of the meeting, which stays where it is during re-placement.
fn extend_meeting(
    blocks: &mut Vec<TimeBlock>,
    disruption: &Disruption,
    range: TimeRange,
    issues: &mut Vec<ScheduleIssue>,
) -> (TimeRange, Option<String>) {
    let requested = disruption.metadata.get("blockId").and_then(JsonValue::as_str);
    let position = match requested {
        Some(id) => {
            let found = blocks.iter().position(|block| block.id == id);
            if found.is_none() {
                warn!(
                    target: "app::scheduler::rescheduler",
                    block = id,
                    "overrunning meeting not found in schedule"
                );
                issues.push(ScheduleIssue::new(
                    IssueKind::InvalidInput,
                    Some(id),
                    format!("超时会议 {id} 不在当前排程中"),
                ));
            }
            found
        }
        None => blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| block.start_at < range.start && block.end_at >= range.start)
            .min_by_key(|(_, block)| (!block.is_fixed(), (block.end_at - range.start).num_minutes(), block.id.clone()))
            .map(|(index, _)| index),
    };

    match position {
        Some(index) => {
            let meeting = &mut blocks[index];
            let end = meeting.end_at.max(range.end);
            let overrun = (end - meeting.end_at).num_minutes();
            meeting.retime(TimeRange::new(meeting.start_at, end));
            meeting.metadata.insert("overrunMinutes".into(), json!(overrun));
            (meeting.range(), Some(meeting.id.clone()))
        }
        None => {
            let mut placeholder = TimeBlock::fixed(
                format!("overrun-{}", range.start.timestamp()),
                "会议超时",
                range,
            );
            placeholder.task_type = TaskType::Meeting;
            blocks.push(placeholder);
            (range, None)
        }
    }
}

fn urgent_block(disruption: &Disruption, range: TimeRange) -> TimeBlock {
    let metadata = &disruption.metadata;
    let id = metadata
        .get("id")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("urgent-{}", range.start.timestamp()));
    let title = metadata
        .get("title")
        .and_then(JsonValue::as_str)
        .unwrap_or("紧急任务")
        .to_string();

    let mut block = TimeBlock::fixed(id, title, range);
    block.priority = Priority::Critical;
    block.task_type = metadata
        .get("taskType")
        .and_then(|raw| serde_json::from_value::<TaskType>(raw.clone()).ok())
        .unwrap_or_default();
    block
        .metadata
        .insert("disruption".into(), json!(DisruptionKind::UrgentTask.as_str()));
    block
}
