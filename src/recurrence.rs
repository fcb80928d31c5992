//! Expansion of a task's repeat rule into concrete reminder instants.
//!
//! Reminders are always re-derived from `date_time`, the repeat rule and the
//! reminder leads, so editing a task replaces its window instead of adding
//! to it.

use chrono::{Datelike, Days, NaiveDate, TimeZone};

use crate::clock::{self, MINUTE_MS};
use crate::model::{RepeatType, Task, WeekdaySet};

/// Upper bound on calendar days scanned per requested occurrence.
const SCAN_DAYS_PER_OCCURRENCE: u64 = 7;

/// Occurrences of `task` strictly after `after`, at most `limit` of them.
/// A non-repeating task has exactly one occurrence, its anchor, even when it
/// is already in the past.
pub fn occurrences<Tz: TimeZone>(task: &Task, tz: &Tz, after: i64, limit: usize) -> Vec<i64> {
    if !task.is_repeating() {
        return vec![task.date_time];
    }
    if limit == 0 {
        return Vec::new();
    }

    let anchor = clock::instant(tz, task.date_time).naive_local();
    let anchor_date = anchor.date();
    let time_of_day = anchor.time();

    // Skip the days that are certainly behind `after`.
    let after_date = clock::local_date(tz, after)
        .checked_sub_days(Days::new(1))
        .unwrap_or(anchor_date);
    let mut day = anchor_date.max(after_date);

    let budget = (limit as u64 + 2) * SCAN_DAYS_PER_OCCURRENCE;
    let mut found = Vec::with_capacity(limit);
    for _ in 0..budget {
        if matches_rule(task, anchor_date, day) {
            let at = clock::from_local(tz, day.and_time(time_of_day));
            if at > after {
                found.push(at);
                if found.len() == limit {
                    break;
                }
            }
        }
        day = match day.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => break,
        };
    }
    found
}

fn matches_rule(task: &Task, anchor_date: NaiveDate, day: NaiveDate) -> bool {
    match task.repeat_type {
        RepeatType::None => day == anchor_date,
        RepeatType::Daily => true,
        RepeatType::Weekly => (day - anchor_date).num_days() % 7 == 0,
        RepeatType::Weekdays => WeekdaySet::WORKWEEK.includes(day.weekday()),
        RepeatType::Custom => task.repeat_days.includes(day.weekday()),
    }
}

/// Derives the reminder instants for the next `window` occurrences after
/// `now`. Output is sorted and free of duplicates. Instants that are already
/// past are kept; registration drops them.
pub fn derive_reminders<Tz: TimeZone>(task: &Task, tz: &Tz, now: i64, window: usize) -> Vec<i64> {
    if task.reminder_leads.is_empty() {
        return Vec::new();
    }
    if task.is_completed && !task.is_repeating() {
        return Vec::new();
    }
    let mut reminders: Vec<i64> = occurrences(task, tz, now, window.max(1))
        .into_iter()
        .flat_map(|occurrence| {
            task.reminder_leads
                .iter()
                .map(move |lead| occurrence - i64::from(*lead) * MINUTE_MS)
        })
        .collect();
    reminders.sort_unstable();
    reminders.dedup();
    reminders
}

pub fn next_occurrence<Tz: TimeZone>(task: &Task, tz: &Tz, now: i64) -> Option<i64> {
    occurrences(task, tz, now, 1)
        .into_iter()
        .find(|occurrence| *occurrence > now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::tests::{local_ms, CentralEurope};
    use crate::clock::{format_date_time, LocalZone};
    use crate::model::{RepeatType, WeekdaySet};

    fn utc() -> LocalZone {
        LocalZone::parse("utc").expect("zone")
    }

    fn task_at(ms: i64, repeat: RepeatType, leads: &[u32]) -> Task {
        let mut task = Task::new("Standup", ms);
        task.id = 7;
        task.repeat_type = repeat;
        task.reminder_leads = leads.to_vec();
        task
    }

    #[test]
    fn non_repeating_task_uses_anchor_only() {
        let zone = utc();
        let at = local_ms(&zone, 2026, 10, 20, 9, 0);
        let now = local_ms(&zone, 2026, 10, 16, 12, 0);
        let task = task_at(at, RepeatType::None, &[0, 15]);
        let reminders = derive_reminders(&task, &zone, now, 7);
        assert_eq!(reminders, vec![at - 15 * MINUTE_MS, at]);
    }

    #[test]
    fn no_leads_means_no_reminders() {
        let zone = utc();
        let task = task_at(local_ms(&zone, 2026, 10, 20, 9, 0), RepeatType::Daily, &[]);
        assert!(derive_reminders(&task, &zone, 0, 7).is_empty());
    }

    #[test]
    fn completed_one_off_task_derives_nothing() {
        let zone = utc();
        let mut task = task_at(local_ms(&zone, 2026, 10, 20, 9, 0), RepeatType::None, &[0]);
        task.is_completed = true;
        assert!(derive_reminders(&task, &zone, 0, 7).is_empty());
    }

    #[test]
    fn daily_window_starts_after_now() {
        let zone = utc();
        let anchor = local_ms(&zone, 2026, 10, 1, 9, 0);
        let now = local_ms(&zone, 2026, 10, 16, 10, 0);
        let task = task_at(anchor, RepeatType::Daily, &[0]);
        let reminders = derive_reminders(&task, &zone, now, 3);
        let labels: Vec<String> = reminders
            .iter()
            .map(|ms| format_date_time(&zone, *ms))
            .collect();
        assert_eq!(
            labels,
            vec!["Oct 17, 2026 09:00", "Oct 18, 2026 09:00", "Oct 19, 2026 09:00"]
        );
    }

    #[test]
    fn daily_keeps_local_time_across_fall_back() {
        let zone = CentralEurope;
        let anchor = local_ms(&zone, 2026, 10, 23, 9, 0);
        let now = local_ms(&zone, 2026, 10, 22, 0, 0);
        let task = task_at(anchor, RepeatType::Daily, &[0]);
        let occurrences = occurrences(&task, &zone, now, 4);
        for occurrence in &occurrences {
            let local = clock::local_time(&zone, *occurrence);
            assert_eq!(local.format("%H:%M").to_string(), "09:00");
        }
        // Saturday to Sunday spans the extra hour.
        assert_eq!(occurrences[2] - occurrences[1], 25 * clock::HOUR_MS);
    }

    #[test]
    fn weekdays_skip_the_weekend() {
        let zone = utc();
        // Friday anchor.
        let anchor = local_ms(&zone, 2026, 10, 16, 8, 30);
        let now = local_ms(&zone, 2026, 10, 16, 7, 0);
        let task = task_at(anchor, RepeatType::Weekdays, &[0]);
        let found = occurrences(&task, &zone, now, 3);
        assert_eq!(
            found,
            vec![
                anchor,
                local_ms(&zone, 2026, 10, 19, 8, 30),
                local_ms(&zone, 2026, 10, 20, 8, 30),
            ]
        );
    }

    #[test]
    fn weekly_steps_seven_days_from_anchor() {
        let zone = utc();
        let anchor = local_ms(&zone, 2026, 10, 2, 18, 0);
        let now = local_ms(&zone, 2026, 10, 16, 19, 0);
        let task = task_at(anchor, RepeatType::Weekly, &[0]);
        assert_eq!(
            occurrences(&task, &zone, now, 2),
            vec![
                local_ms(&zone, 2026, 10, 23, 18, 0),
                local_ms(&zone, 2026, 10, 30, 18, 0),
            ]
        );
    }

    #[test]
    fn custom_days_follow_the_set() {
        let zone = utc();
        let anchor = local_ms(&zone, 2026, 10, 16, 7, 0);
        let mut task = task_at(anchor, RepeatType::Custom, &[10]);
        task.repeat_days = WeekdaySet::TUE | WeekdaySet::SAT;
        let found = occurrences(&task, &zone, anchor - 1, 3);
        assert_eq!(
            found,
            vec![
                local_ms(&zone, 2026, 10, 17, 7, 0),
                local_ms(&zone, 2026, 10, 20, 7, 0),
                local_ms(&zone, 2026, 10, 24, 7, 0),
            ]
        );
        let reminders = derive_reminders(&task, &zone, anchor - 1, 3);
        assert_eq!(reminders[0], found[0] - 10 * MINUTE_MS);
    }

    #[test]
    fn derivation_is_deterministic() {
        let zone = utc();
        let anchor = local_ms(&zone, 2026, 10, 16, 7, 0);
        let mut task = task_at(anchor, RepeatType::Daily, &[0, 5, 5]);
        let first = derive_reminders(&task, &zone, anchor - 1, 5);
        task.reminders = first.clone();
        let second = derive_reminders(&task, &zone, anchor - 1, 5);
        assert_eq!(first, second);
        assert_eq!(first.len(), 10);
    }

    #[test]
    fn next_occurrence_of_past_one_off_is_none() {
        let zone = utc();
        let task = task_at(1_000, RepeatType::None, &[0]);
        assert_eq!(next_occurrence(&task, &zone, 2_000), None);
        assert_eq!(next_occurrence(&task, &zone, 0), Some(1_000));
    }
}
