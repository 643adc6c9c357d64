//! Occurrence advancement for recurring reminders.
//!
//! Pure functions of (recurrence, occurrence) so the scheduler's
//! bookkeeping is testable without a database or clock.

use chrono::{DateTime, Datelike, Duration, Utc};

use crate::model::{DaySet, Recurrence};

/// Compute the occurrence following `current`.
///
/// Returns `None` for one-shot reminders (consumed on delivery) and for an
/// empty weekday set, which validation keeps out of the store.
pub fn next_occurrence(
    recurrence: &Recurrence,
    current: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match recurrence {
        Recurrence::None => None,
        Recurrence::Daily => Some(current + Duration::hours(24)),
        Recurrence::Weekly { days } | Recurrence::Custom { days } => {
            next_weekday_occurrence(*days, current)
        }
    }
}

/// Advance a missed occurrence past `now`.
///
/// Used for recurring reminders that slept beyond the grace window: the
/// missed occurrences are skipped, not fired, and the reminder resumes at
/// its first occurrence strictly after `now`. Returns `None` for one-shot
/// reminders, which cannot advance.
pub fn catch_up(
    recurrence: &Recurrence,
    occurrence: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut occurrence = occurrence;
    while occurrence <= now {
        occurrence = next_occurrence(recurrence, occurrence)?;
    }
    Some(occurrence)
}

/// Earliest day strictly after `current` whose weekday is in `days`, at the
/// same time-of-day. A single-day set yields the same weekday next week.
fn next_weekday_occurrence(days: DaySet, current: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let weekday = current.weekday();
    for offset in 1..=7i64 {
        let candidate = weekday_after(weekday, offset);
        if days.contains(candidate) {
            return Some(current + Duration::days(offset));
        }
    }
    None
}

fn weekday_after(day: chrono::Weekday, offset: i64) -> chrono::Weekday {
    let mut d = day;
    for _ in 0..offset {
        d = d.succ();
    }
    d
}
