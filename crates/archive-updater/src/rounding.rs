//! Snapping helpers for [`crate::UpdatePolicy::round_notification`].
//!
//! All times are milliseconds since the Unix epoch, UTC.

use time::{Date, Month, OffsetDateTime};

pub const MS_PER_DAY: i64 = 86_400_000;

pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Widens `[start, end)` outward to whole UTC days.
pub fn round_to_day(start: i64, end: i64) -> (i64, i64) {
    let start = start.div_euclid(MS_PER_DAY) * MS_PER_DAY;
    let end = match end.rem_euclid(MS_PER_DAY) {
        0 => end,
        remainder => end.saturating_add(MS_PER_DAY - remainder),
    };
    (start, end)
}

/// Widens `[start, end)` outward to whole UTC years. Bounds outside the calendar
/// range `time` supports are left as they are.
pub fn round_to_year(start: i64, end: i64) -> (i64, i64) {
    let start = year_of(start)
        .and_then(year_start_ms)
        .unwrap_or(start);
    let end = match year_of(end) {
        Some(year) => match year_start_ms(year) {
            Some(boundary) if boundary == end => end,
            _ => year_start_ms(year + 1).unwrap_or(end),
        },
        None => end,
    };
    (start, end)
}

/// Pulls an end in the future back to now, never below `start`.
pub fn clamp_end_to_now(start: i64, end: i64) -> (i64, i64) {
    clamp_end(start, end, now_ms())
}

pub fn clamp_end(start: i64, end: i64, now: i64) -> (i64, i64) {
    (start, end.min(now).max(start))
}

fn year_of(ms: i64) -> Option<i32> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .map(|moment| moment.year())
}

fn year_start_ms(year: i32) -> Option<i64> {
    let date = Date::from_calendar_date(year, Month::January, 1).ok()?;
    Some(date.midnight().assume_utc().unix_timestamp() * 1000)
}
