use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::models::conflict::StrategyKind;
use crate::models::constraint::ScheduleConstraint;
use crate::models::time_block::{normalize_tag, Priority, TimeRange};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnergyLevel {
    Low,
    Medium,
    High,
}

impl EnergyLevel {
    pub fn rank(self) -> i32 {
        match self {
            EnergyLevel::Low => 0,
            EnergyLevel::Medium => 1,
            EnergyLevel::High => 2,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(EnergyLevel::Low),
            "medium" => Some(EnergyLevel::Medium),
            "high" => Some(EnergyLevel::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FocusQuality {
    Deep,
    Moderate,
    Shallow,
    Interrupted,
}

impl FocusQuality {
    pub fn value(self) -> f64 {
        match self {
            FocusQuality::Deep => 1.0,
            FocusQuality::Moderate => 0.75,
            FocusQuality::Shallow => 0.5,
            FocusQuality::Interrupted => 0.25,
        }
    }
}

/// One observed activity session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalRecord {
    pub timestamp: DateTime<Utc>,
    pub productivity_score: f64,
    pub duration_minutes: i64,
    pub activity_type: String,
    #[serde(default)]
    pub interruption_count: u32,
    #[serde(default)]
    pub habit_name: Option<String>,
    #[serde(default)]
    pub completed: Option<bool>,
}

impl HistoricalRecord {
    pub fn is_valid(&self) -> bool {
        self.productivity_score.is_finite()
            && (0.0..=1.0).contains(&self.productivity_score)
            && self.duration_minutes >= 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HourlyPattern {
    pub hour: u32,
    pub sample_count: usize,
    pub mean_productivity: f64,
    pub mean_interruptions: f64,
    pub energy: EnergyLevel,
    pub quality: FocusQuality,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FocusTimeBlock {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub duration_minutes: i64,
    pub quality: FocusQuality,
    pub protection_level: u8,
    pub buffer_minutes: i64,
    pub interruption_cost: f64,
    pub recovery_time_minutes: i64,
}

impl FocusTimeBlock {
    pub fn is_protected(&self) -> bool {
        self.protection_level >= 4
    }

    /// Concrete occurrences of this window on the days `range` touches.
    pub fn occurrences(&self, range: &TimeRange) -> Vec<TimeRange> {
        let mut windows = Vec::new();
        let mut day = range.start.date_naive();
        let last_day = range.end.date_naive();
        while day <= last_day {
            let start = day.and_time(self.start_time).and_utc();
            let end = day.and_time(self.end_time).and_utc();
            if end > start {
                windows.push(TimeRange::new(start, end));
            }
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        windows
    }

    pub fn overlap_minutes(&self, range: &TimeRange) -> i64 {
        self.occurrences(range)
            .iter()
            .map(|window| window.overlap_minutes(range))
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HabitDefenseRule {
    pub habit_name: String,
    pub priority: Priority,
    pub time_flexibility_minutes: i64,
    pub min_weekly_frequency: u32,
    pub protection_strength: f64,
    #[serde(default)]
    pub alternative_times: Vec<NaiveTime>,
    pub resolution_strategy: StrategyKind,
}

impl HabitDefenseRule {
    pub fn matches(&self, title: &str, category: Option<&str>) -> bool {
        let name = normalize_tag(&self.habit_name);
        normalize_tag(title) == name || category.map(normalize_tag).as_deref() == Some(name.as_str())
    }

    /// Whether any alternative time, on a day `range` touches, falls inside it.
    pub fn alternatives_within(&self, range: &TimeRange) -> bool {
        let mut day = range.start.date_naive();
        let last_day = range.end.date_naive();
        while day <= last_day {
            if self
                .alternative_times
                .iter()
                .any(|time| range.contains(day.and_time(*time).and_utc()))
            {
                return true;
            }
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        false
    }

    /// Minutes between `start` and the closest alternative time on the same day.
    pub fn distance_minutes(&self, start: DateTime<Utc>) -> Option<i64> {
        let day = start.date_naive();
        self.alternative_times
            .iter()
            .map(|time| (day.and_time(*time).and_utc() - start).num_minutes().abs())
            .min()
    }
}

/// Caller-supplied pattern data for one invocation. The engine never caches it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PatternSnapshot {
    #[serde(default)]
    pub hourly: Vec<HourlyPattern>,
    #[serde(default)]
    pub productive_hours: Vec<u32>,
    #[serde(default)]
    pub focus_blocks: Vec<FocusTimeBlock>,
    #[serde(default)]
    pub habit_rules: Vec<HabitDefenseRule>,
    #[serde(default)]
    pub category_affinity: BTreeMap<String, f64>,
    #[serde(default)]
    pub derived_constraints: Vec<ScheduleConstraint>,
    #[serde(default)]
    pub sample_count: usize,
    #[serde(default)]
    pub is_sufficient: bool,
}

impl PatternSnapshot {
    pub fn insufficient(sample_count: usize) -> Self {
        Self {
            sample_count,
            is_sufficient: false,
            ..Default::default()
        }
    }

    /// Generic energy curve used when there is not enough history.
    pub fn default_heuristics() -> Self {
        let hourly = (6..22)
            .map(|hour| {
                let energy = match hour {
                    9..=11 => EnergyLevel::High,
                    12 | 13 | 18..=21 => EnergyLevel::Low,
                    _ => EnergyLevel::Medium,
                };
                HourlyPattern {
                    hour,
                    sample_count: 0,
                    mean_productivity: match energy {
                        EnergyLevel::High => 0.75,
                        EnergyLevel::Medium => 0.55,
                        EnergyLevel::Low => 0.35,
                    },
                    mean_interruptions: 0.0,
                    energy,
                    quality: FocusQuality::Shallow,
                }
            })
            .collect();

        Self {
            hourly,
            productive_hours: vec![9, 10, 11],
            is_sufficient: false,
            ..Default::default()
        }
    }

    pub fn energy_at(&self, hour: u32) -> Option<EnergyLevel> {
        self.hourly
            .iter()
            .find(|pattern| pattern.hour == hour)
            .map(|pattern| pattern.energy)
    }

    pub fn is_productive_hour(&self, hour: u32) -> bool {
        self.productive_hours.contains(&hour)
    }

    pub fn affinity(&self, tag: &str) -> f64 {
        self.category_affinity
            .get(&normalize_tag(tag))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn protected_focus_blocks(&self) -> impl Iterator<Item = &FocusTimeBlock> {
        self.focus_blocks.iter().filter(|block| block.is_protected())
    }

    /// Forces the energy class of every hour touched by `range`.
    pub fn override_energy(&mut self, range: &TimeRange, level: EnergyLevel) {
        let mut cursor = range.start;
        let mut hours = Vec::new();
        while cursor < range.end {
            let hour = cursor.hour();
            if !hours.contains(&hour) {
                hours.push(hour);
            }
            cursor += Duration::hours(1);
        }
        let last = (range.end - Duration::minutes(1)).hour();
        if !hours.contains(&last) {
            hours.push(last);
        }

        for hour in hours {
            match self.hourly.iter_mut().find(|pattern| pattern.hour == hour) {
                Some(pattern) => pattern.energy = level,
                None => self.hourly.push(HourlyPattern {
                    hour,
                    sample_count: 0,
                    mean_productivity: 0.5,
                    mean_interruptions: 0.0,
                    energy: level,
                    quality: FocusQuality::Shallow,
                }),
            }
            match level {
                EnergyLevel::High => {
                    if !self.productive_hours.contains(&hour) {
                        self.productive_hours.push(hour);
                    }
                }
                _ => self.productive_hours.retain(|productive| *productive != hour),
            }
        }
        self.hourly.sort_by_key(|pattern| pattern.hour);
        self.productive_hours.sort_unstable();
    }
}
