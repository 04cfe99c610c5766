//! Calendar arithmetic shared by every deadline computation.
//!
//! Business-day counting steps one day at a time and only counts
//! Monday–Friday. University holidays are not modeled.

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// How a policy's duration is counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    #[default]
    CalendarDays,
    BusinessDays,
}

fn is_weekend(date: DateTime<Utc>) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Advance `start` by `days` business days, skipping Saturdays and Sundays.
pub fn add_business_days(start: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    let mut date = start;
    let mut remaining = days;
    while remaining > 0 {
        date += Duration::days(1);
        if !is_weekend(date) {
            remaining -= 1;
        }
    }
    date
}

/// Advance `start` by `days` counted in the given unit.
pub fn add_stage_days(start: DateTime<Utc>, days: u32, unit: DurationUnit) -> DateTime<Utc> {
    match unit {
        DurationUnit::CalendarDays => start + Duration::days(days as i64),
        DurationUnit::BusinessDays => add_business_days(start, days),
    }
}
