use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::models::time_block::TimeRange;
use crate::services::settings_service::EngineSettings;

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"];

/// Parses an ISO-8601 instant into UTC. Timestamps without an offset are read in `zone`.
pub fn parse_datetime_in(value: &str, zone: Tz) -> AppResult<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(with_offset.with_timezone(&Utc));
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| {
            AppError::validation_with_details("无效的时间格式", json!({"value": value}))
        })?;

    zone.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| {
            AppError::validation_with_details(
                "本地时间在该时区不存在",
                json!({"value": value, "timezone": zone.name()}),
            )
        })
}

pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub fn midnight_minutes_of(dt: DateTime<Utc>) -> i64 {
    (dt.hour() as i64) * 60 + (dt.minute() as i64)
}

pub fn start_of_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt - Duration::minutes(midnight_minutes_of(dt))
        - Duration::seconds(dt.second() as i64)
        - Duration::nanoseconds(dt.nanosecond() as i64)
}

/// Working-hour windows for each working day touched by `horizon`, clipped to it.
pub fn working_windows(horizon: &TimeRange, settings: &EngineSettings) -> Vec<TimeRange> {
    let mut windows = Vec::new();
    let mut day = start_of_day(horizon.start);
    while day < horizon.end {
        if settings.works_on(day.weekday()) {
            let window = TimeRange::new(
                day + Duration::minutes(settings.workday_start_minute as i64),
                day + Duration::minutes(settings.workday_end_minute as i64),
            );
            if let Some(clipped) = window.intersect(horizon) {
                windows.push(clipped);
            }
        }
        day += Duration::days(1);
    }
    windows
}

/// Sorts and coalesces overlapping or touching ranges.
pub fn merge_ranges(mut ranges: Vec<TimeRange>) -> Vec<TimeRange> {
    ranges.retain(|range| !range.is_empty());
    ranges.sort_by_key(|range| (range.start, range.end));

    let mut merged: Vec<TimeRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if let Some(last) = merged.last_mut() {
            if range.start <= last.end {
                last.end = last.end.max(range.end);
                continue;
            }
        }
        merged.push(range);
    }
    merged
}

/// Parts of `windows` not covered by any `occupied` range.
pub fn free_intervals(windows: &[TimeRange], occupied: &[TimeRange]) -> Vec<TimeRange> {
    let busy = merge_ranges(occupied.to_vec());
    let mut free = Vec::new();

    for window in merge_ranges(windows.to_vec()) {
        let mut cursor = window.start;
        for range in busy.iter().filter(|range| range.overlaps(&window)) {
            if range.start > cursor {
                free.push(TimeRange::new(cursor, range.start));
            }
            cursor = cursor.max(range.end);
        }
        if cursor < window.end {
            free.push(TimeRange::new(cursor, window.end));
        }
    }
    free
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, day, hour, minute, 0)
            .single()
            .expect("valid datetime")
    }

    #[test]
    fn naive_timestamps_use_the_given_zone() -> AppResult<()> {
        let parsed = parse_datetime_in("2025-05-01T09:00:00", chrono_tz::Asia::Shanghai)?;
        assert_eq!(parsed, dt(1, 1, 0));
        let explicit = parse_datetime_in("2025-05-01T09:00:00+02:00", chrono_tz::Asia::Shanghai)?;
        assert_eq!(explicit, dt(1, 7, 0));
        assert!(parse_datetime_in("tomorrow morning", chrono_tz::UTC).is_err());
        Ok(())
    }

    #[test]
    fn working_windows_follow_weekdays_and_clip() {
        let mut settings = EngineSettings::default();
        settings.working_weekdays = vec![chrono::Weekday::Thu];
        let horizon = TimeRange::new(dt(1, 10, 0), dt(3, 0, 0));
        let windows = working_windows(&horizon, &settings);
        assert_eq!(windows, vec![TimeRange::new(dt(1, 10, 0), dt(1, 18, 0))]);
    }

    #[test]
    fn free_intervals_subtract_busy_time() {
        let windows = vec![TimeRange::new(dt(1, 9, 0), dt(1, 17, 0))];
        let busy = vec![
            TimeRange::new(dt(1, 10, 0), dt(1, 11, 0)),
            TimeRange::new(dt(1, 10, 30), dt(1, 12, 0)),
            TimeRange::new(dt(1, 16, 0), dt(1, 18, 0)),
        ];
        let free = free_intervals(&windows, &busy);
        assert_eq!(
            free,
            vec![
                TimeRange::new(dt(1, 9, 0), dt(1, 10, 0)),
                TimeRange::new(dt(1, 12, 0), dt(1, 16, 0)),
            ]
        );
    }

    #[test]
    fn start_of_day_truncates() {
        assert_eq!(start_of_day(dt(1, 13, 45)), dt(1, 0, 0));
    }
}
