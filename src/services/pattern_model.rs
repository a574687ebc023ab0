use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveTime, Timelike};
use tracing::{debug, warn};

use crate::models::conflict::StrategyKind;
use crate::models::constraint::{ConstraintKind, ScheduleConstraint};
use crate::models::pattern::{
    EnergyLevel, FocusQuality, FocusTimeBlock, HabitDefenseRule, HistoricalRecord, HourlyPattern,
    PatternSnapshot,
};
use crate::models::time_block::{normalize_tag, Priority};
use crate::services::settings_service::EngineSettings;

const HIGH_ENERGY_THRESHOLD: f64 = 0.7;
const MEDIUM_ENERGY_THRESHOLD: f64 = 0.4;
const LOW_PRODUCTIVITY_THRESHOLD: f64 = 0.3;
const AVOIDANCE_FLEXIBILITY_WEIGHT: f64 = 0.6;
const MAX_ALTERNATIVE_TIMES: usize = 3;

/// Derives a [`PatternSnapshot`] from historical activity.
#[derive(Debug, Clone)]
pub struct PatternModel {
    min_occurrences: usize,
    interruption_threshold: f64,
}

#[derive(Debug, Default)]
struct HourBucket {
    productivity: f64,
    interruptions: f64,
    count: usize,
}

#[derive(Debug, Default)]
struct HabitStats {
    display_name: String,
    total: usize,
    completed: usize,
    weeks: BTreeSet<(i32, u32)>,
    completion_hours: BTreeMap<u32, usize>,
}

impl PatternModel {
    pub fn new(min_occurrences: usize, interruption_threshold: f64) -> Self {
        Self {
            min_occurrences: min_occurrences.max(1),
            interruption_threshold,
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(
            settings.min_pattern_occurrences,
            settings.interruption_threshold,
        )
    }

    pub fn analyze(&self, records: &[HistoricalRecord]) -> PatternSnapshot {
        let valid: Vec<&HistoricalRecord> = records.iter().filter(|r| r.is_valid()).collect();
        let skipped = records.len() - valid.len();
        if skipped > 0 {
            warn!(
                target: "app::scheduler::pattern",
                skipped,
                "ignoring historical records with out-of-range values"
            );
        }

        let hourly = self.hourly_patterns(&valid);
        if hourly.is_empty() {
            debug!(
                target: "app::scheduler::pattern",
                samples = valid.len(),
                min_occurrences = self.min_occurrences,
                "history insufficient for pattern extraction"
            );
            return PatternSnapshot::insufficient(valid.len());
        }

        let productive_hours = hourly
            .iter()
            .filter(|pattern| pattern.energy == EnergyLevel::High)
            .map(|pattern| pattern.hour)
            .collect();
        let focus_blocks = self.focus_blocks(&hourly);
        let habit_rules = self.habit_rules(&valid);
        let category_affinity = self.category_affinity(&valid);
        let derived_constraints = avoidance_constraints(&hourly);

        debug!(
            target: "app::scheduler::pattern",
            samples = valid.len(),
            hours = hourly.len(),
            focus_blocks = focus_blocks.len(),
            habit_rules = habit_rules.len(),
            "pattern snapshot derived"
        );

        PatternSnapshot {
            hourly,
            productive_hours,
            focus_blocks,
            habit_rules,
            category_affinity,
            derived_constraints,
            sample_count: valid.len(),
            is_sufficient: true,
        }
    }

    fn hourly_patterns(&self, records: &[&HistoricalRecord]) -> Vec<HourlyPattern> {
        let mut buckets: BTreeMap<u32, HourBucket> = BTreeMap::new();
        for record in records {
            let bucket = buckets.entry(record.timestamp.hour()).or_default();
            bucket.productivity += record.productivity_score;
            bucket.interruptions += record.interruption_count as f64;
            bucket.count += 1;
        }

        buckets
            .into_iter()
            .filter(|(_, bucket)| bucket.count >= self.min_occurrences)
            .map(|(hour, bucket)| {
                let mean_productivity = bucket.productivity / bucket.count as f64;
                let mean_interruptions = bucket.interruptions / bucket.count as f64;
                HourlyPattern {
                    hour,
                    sample_count: bucket.count,
                    mean_productivity,
                    mean_interruptions,
                    energy: classify_energy(mean_productivity),
                    quality: classify_quality(mean_productivity, mean_interruptions),
                }
            })
            .collect()
    }

    fn focus_blocks(&self, hourly: &[HourlyPattern]) -> Vec<FocusTimeBlock> {
        let mut runs: Vec<Vec<&HourlyPattern>> = Vec::new();
        for pattern in hourly {
            if !matches!(pattern.quality, FocusQuality::Deep | FocusQuality::Moderate) {
                continue;
            }
            match runs.last_mut() {
                Some(run)
                    if run.last().map_or(false, |last| {
                        last.hour + 1 == pattern.hour && last.quality == pattern.quality
                    }) =>
                {
                    run.push(pattern)
                }
                _ => runs.push(vec![pattern]),
            }
        }

        let mut ranked: Vec<(FocusTimeBlock, f64)> = runs
            .into_iter()
            .filter_map(|run| self.focus_block_for_run(&run))
            .collect();

        ranked.sort_by(|(a, a_prod), (b, b_prod)| {
            a.quality
                .cmp(&b.quality)
                .then_with(|| b.protection_level.cmp(&a.protection_level))
                .then_with(|| b_prod.total_cmp(a_prod))
                .then_with(|| a.start_time.cmp(&b.start_time))
        });
        ranked.into_iter().map(|(block, _)| block).collect()
    }

    fn focus_block_for_run(&self, run: &[&HourlyPattern]) -> Option<(FocusTimeBlock, f64)> {
        let first = run.first()?;
        let last = run.last()?;
        let quality = first.quality;

        let start_time = NaiveTime::from_hms_opt(first.hour, 0, 0)?;
        let end_time = if last.hour + 1 >= 24 {
            NaiveTime::from_hms_opt(23, 59, 0)?
        } else {
            NaiveTime::from_hms_opt(last.hour + 1, 0, 0)?
        };

        let base: u8 = if quality == FocusQuality::Deep { 4 } else { 3 };
        let noisy = run
            .iter()
            .any(|pattern| pattern.mean_interruptions > self.interruption_threshold);
        let protection_level = (base + u8::from(noisy)).min(5);

        let mean_productivity =
            run.iter().map(|pattern| pattern.mean_productivity).sum::<f64>() / run.len() as f64;
        let (buffer_minutes, recovery_time_minutes) = match quality {
            FocusQuality::Deep => (15, 25),
            _ => (10, 15),
        };

        Some((
            FocusTimeBlock {
                start_time,
                end_time,
                duration_minutes: (end_time - start_time).num_minutes(),
                quality,
                protection_level,
                buffer_minutes,
                interruption_cost: (mean_productivity * 10.0).min(10.0),
                recovery_time_minutes,
            },
            mean_productivity,
        ))
    }

    fn habit_rules(&self, records: &[&HistoricalRecord]) -> Vec<HabitDefenseRule> {
        let mut stats: BTreeMap<String, HabitStats> = BTreeMap::new();
        for record in records {
            let Some(name) = record.habit_name.as_deref() else {
                continue;
            };
            let key = normalize_tag(name);
            if key.is_empty() {
                continue;
            }
            let entry = stats.entry(key).or_insert_with(|| HabitStats {
                display_name: name.trim().to_string(),
                ..Default::default()
            });
            entry.total += 1;
            let week = record.timestamp.iso_week();
            entry.weeks.insert((week.year(), week.week()));
            if record.completed.unwrap_or(true) {
                entry.completed += 1;
                *entry
                    .completion_hours
                    .entry(record.timestamp.hour())
                    .or_default() += 1;
            }
        }

        stats
            .into_values()
            .filter(|habit| habit.total >= self.min_occurrences)
            .map(|habit| {
                let completion_rate = habit.completed as f64 / habit.total as f64;
                let miss_rate = 1.0 - completion_rate;
                let protection_strength = 0.5 + 0.5 * miss_rate;
                let weekly = habit.completed as f64 / habit.weeks.len().max(1) as f64;

                let mut hours: Vec<(u32, usize)> = habit.completion_hours.into_iter().collect();
                hours.sort_by(|(a_hour, a_count), (b_hour, b_count)| {
                    b_count.cmp(a_count).then_with(|| a_hour.cmp(b_hour))
                });
                let alternative_times = hours
                    .into_iter()
                    .take(MAX_ALTERNATIVE_TIMES)
                    .filter_map(|(hour, _)| NaiveTime::from_hms_opt(hour, 0, 0))
                    .collect();

                HabitDefenseRule {
                    habit_name: habit.display_name,
                    priority: Priority::from_ordinal_clamped(1 + (4.0 * miss_rate).round() as i64),
                    time_flexibility_minutes: (120.0 * miss_rate).round() as i64,
                    min_weekly_frequency: (weekly.round() as u32).max(1),
                    protection_strength,
                    alternative_times,
                    resolution_strategy: if protection_strength >= 0.75 {
                        StrategyKind::RescheduleLowerPriority
                    } else {
                        StrategyKind::SuggestAlternative
                    },
                }
            })
            .collect()
    }

    fn category_affinity(&self, records: &[&HistoricalRecord]) -> BTreeMap<String, f64> {
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for record in records {
            let key = normalize_tag(&record.activity_type);
            if key.is_empty() {
                continue;
            }
            let entry = sums.entry(key).or_default();
            entry.0 += record.productivity_score;
            entry.1 += 1;
        }
        sums.into_iter()
            .filter(|(_, (_, count))| *count >= self.min_occurrences)
            .map(|(key, (sum, count))| (key, sum / count as f64))
            .collect()
    }
}

pub fn classify_energy(mean_productivity: f64) -> EnergyLevel {
    if mean_productivity >= HIGH_ENERGY_THRESHOLD {
        EnergyLevel::High
    } else if mean_productivity >= MEDIUM_ENERGY_THRESHOLD {
        EnergyLevel::Medium
    } else {
        EnergyLevel::Low
    }
}

pub fn classify_quality(mean_productivity: f64, mean_interruptions: f64) -> FocusQuality {
    if mean_productivity >= 0.75 && mean_interruptions <= 1.5 {
        FocusQuality::Deep
    } else if mean_productivity >= 0.6 && mean_interruptions <= 3.0 {
        FocusQuality::Moderate
    } else if mean_productivity >= 0.4 {
        FocusQuality::Shallow
    } else {
        FocusQuality::Interrupted
    }
}

/// Soft exclusions over consecutive low-productivity hours.
fn avoidance_constraints(hourly: &[HourlyPattern]) -> Vec<ScheduleConstraint> {
    let mut spans: Vec<(u32, u32)> = Vec::new();
    for pattern in hourly
        .iter()
        .filter(|pattern| pattern.mean_productivity < LOW_PRODUCTIVITY_THRESHOLD)
    {
        match spans.last_mut() {
            Some((_, end)) if *end == pattern.hour => *end = pattern.hour + 1,
            _ => spans.push((pattern.hour, pattern.hour + 1)),
        }
    }

    spans
        .into_iter()
        .map(|(start, end)| ScheduleConstraint {
            id: format!("pattern-avoid-{start:02}"),
            kind: ConstraintKind::TimeWindowExclusion {
                weekday: None,
                start_minute: start * 60,
                end_minute: end * 60,
            },
            priority: Priority::Low,
            flexibility_weight: AVOIDANCE_FLEXIBILITY_WEIGHT,
        })
        .collect()
}
