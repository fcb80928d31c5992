use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{bail, Result};
use chrono::{
    DateTime, Datelike, Days, FixedOffset, Local, LocalResult, NaiveDate, NaiveDateTime,
    NaiveTime, Offset, TimeZone, Utc, Weekday,
};

pub const MINUTE_MS: i64 = 60_000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;

const DATE_PATTERN: &str = "%b %-d, %Y";
const TIME_PATTERN: &str = "%H:%M";
const DATE_TIME_PATTERN: &str = "%b %-d, %Y %H:%M";

/// Source of "now" in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.now.fetch_add(minutes * MINUTE_MS, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// The user's time zone: the operating system zone (DST aware) or a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalZone {
    System,
    Fixed(FixedOffset),
}

impl Default for LocalZone {
    fn default() -> Self {
        LocalZone::System
    }
}

impl LocalZone {
    /// Accepts `local`/`system`, `utc`/`z`, or an offset such as `+02:00` / `-0530`.
    pub fn parse(spec: &str) -> Result<Self> {
        let trimmed = spec.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "local" | "system" => return Ok(LocalZone::System),
            "utc" | "z" => return Ok(LocalZone::Fixed(utc_offset())),
            _ => {}
        }
        let (sign, rest) = match trimmed.as_bytes().first() {
            Some(b'+') => (1, &trimmed[1..]),
            Some(b'-') => (-1, &trimmed[1..]),
            _ => bail!("unrecognised time zone '{trimmed}'"),
        };
        let digits: String = rest.chars().filter(|ch| *ch != ':').collect();
        if digits.len() != 4 || !digits.chars().all(|ch| ch.is_ascii_digit()) {
            bail!("unrecognised time zone offset '{trimmed}'");
        }
        let hours: i32 = digits[..2].parse()?;
        let minutes: i32 = digits[2..].parse()?;
        if hours > 23 || minutes > 59 {
            bail!("time zone offset '{trimmed}' out of range");
        }
        let seconds = sign * (hours * 3600 + minutes * 60);
        match FixedOffset::east_opt(seconds) {
            Some(offset) => Ok(LocalZone::Fixed(offset)),
            None => bail!("time zone offset '{trimmed}' out of range"),
        }
    }
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

impl TimeZone for LocalZone {
    type Offset = FixedOffset;

    fn from_offset(offset: &FixedOffset) -> Self {
        LocalZone::Fixed(*offset)
    }

    fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
        self.offset_from_local_datetime(&local.and_time(NaiveTime::default()))
    }

    fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
        match self {
            LocalZone::System => Local.offset_from_local_datetime(local),
            LocalZone::Fixed(offset) => LocalResult::Single(*offset),
        }
    }

    fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
        self.offset_from_utc_datetime(&utc.and_time(NaiveTime::default()))
    }

    fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
        match self {
            LocalZone::System => Local.offset_from_utc_datetime(utc),
            LocalZone::Fixed(offset) => *offset,
        }
    }
}

pub fn instant<Tz: TimeZone>(tz: &Tz, ms: i64) -> DateTime<Tz> {
    let utc = DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default();
    utc.with_timezone(tz)
}

pub fn local_date<Tz: TimeZone>(tz: &Tz, ms: i64) -> NaiveDate {
    instant(tz, ms).date_naive()
}

pub fn local_time<Tz: TimeZone>(tz: &Tz, ms: i64) -> NaiveTime {
    instant(tz, ms).time()
}

/// Converts a wall-clock reading to an instant. Ambiguous readings (clocks
/// turned back) take the earlier instant; readings inside a gap (clocks
/// turned forward) are read with the offset in force before the gap.
pub fn from_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> i64 {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        LocalResult::None => {
            let before_gap = local - chrono::Duration::hours(3);
            let offset = tz
                .from_local_datetime(&before_gap)
                .earliest()
                .map(|dt| dt.offset().fix().local_minus_utc())
                .unwrap_or(0);
            (local - chrono::Duration::seconds(i64::from(offset)))
                .and_utc()
                .timestamp_millis()
        }
    }
}

pub fn start_of_day<Tz: TimeZone>(tz: &Tz, ms: i64) -> i64 {
    let date = local_date(tz, ms);
    from_local(tz, date.and_time(NaiveTime::default()))
}

/// Last millisecond of the local day containing `ms`.
pub fn end_of_day<Tz: TimeZone>(tz: &Tz, ms: i64) -> i64 {
    next_day_start(tz, ms) - 1
}

pub fn next_day_start<Tz: TimeZone>(tz: &Tz, ms: i64) -> i64 {
    let date = local_date(tz, ms);
    match date.checked_add_days(Days::new(1)) {
        Some(next) => from_local(tz, next.and_time(NaiveTime::default())),
        None => i64::MAX,
    }
}

/// `[start, end)` bounds of the local day containing `ms`.
pub fn day_bounds<Tz: TimeZone>(tz: &Tz, ms: i64) -> (i64, i64) {
    (start_of_day(tz, ms), next_day_start(tz, ms))
}

pub fn start_of_week<Tz: TimeZone>(tz: &Tz, ms: i64, first_day: Weekday) -> i64 {
    let date = local_date(tz, ms);
    let back = days_since(date.weekday(), first_day);
    let start = date.checked_sub_days(Days::new(back)).unwrap_or(date);
    from_local(tz, start.and_time(NaiveTime::default()))
}

/// `[start, end)` bounds of the seven local days starting at the week containing `ms`.
pub fn week_bounds<Tz: TimeZone>(tz: &Tz, ms: i64, first_day: Weekday) -> (i64, i64) {
    let start = start_of_week(tz, ms, first_day);
    (start, add_days(tz, start, 7))
}

fn days_since(day: Weekday, first_day: Weekday) -> u64 {
    let from = first_day.num_days_from_monday();
    let to = day.num_days_from_monday();
    u64::from((to + 7 - from) % 7)
}

pub fn is_same_day<Tz: TimeZone>(tz: &Tz, a: i64, b: i64) -> bool {
    local_date(tz, a) == local_date(tz, b)
}

pub fn is_today<Tz: TimeZone>(tz: &Tz, clock: &dyn Clock, ms: i64) -> bool {
    is_same_day(tz, ms, clock.now_ms())
}

/// Moves by whole calendar days keeping the local time of day.
pub fn add_days<Tz: TimeZone>(tz: &Tz, ms: i64, days: i64) -> i64 {
    let local = instant(tz, ms).naive_local();
    let shifted = if days >= 0 {
        local.checked_add_days(Days::new(days.unsigned_abs()))
    } else {
        local.checked_sub_days(Days::new(days.unsigned_abs()))
    };
    match shifted {
        Some(target) => from_local(tz, target),
        None => ms,
    }
}

pub fn add_minutes(ms: i64, minutes: i64) -> i64 {
    ms + minutes * MINUTE_MS
}

pub fn weekday<Tz: TimeZone>(tz: &Tz, ms: i64) -> Weekday {
    local_date(tz, ms).weekday()
}

pub fn day_of_week_name<Tz: TimeZone>(tz: &Tz, ms: i64) -> &'static str {
    match weekday(tz, ms) {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

pub fn day_of_week_short<Tz: TimeZone>(tz: &Tz, ms: i64) -> &'static str {
    &day_of_week_name(tz, ms)[..3]
}

pub fn format_date<Tz: TimeZone>(tz: &Tz, ms: i64) -> String
where
    Tz::Offset: std::fmt::Display,
{
    instant(tz, ms).format(DATE_PATTERN).to_string()
}

pub fn format_time<Tz: TimeZone>(tz: &Tz, ms: i64) -> String
where
    Tz::Offset: std::fmt::Display,
{
    instant(tz, ms).format(TIME_PATTERN).to_string()
}

pub fn format_date_time<Tz: TimeZone>(tz: &Tz, ms: i64) -> String
where
    Tz::Offset: std::fmt::Display,
{
    instant(tz, ms).format(DATE_TIME_PATTERN).to_string()
}

/// Parses `YYYY-MM-DD HH:MM`, `YYYY-MM-DDTHH:MM` or a bare `YYYY-MM-DD`
/// (start of that day) as local wall-clock time.
pub fn parse_local<Tz: TimeZone>(tz: &Tz, input: &str) -> Result<i64> {
    let trimmed = input.trim();
    for pattern in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(local) = NaiveDateTime::parse_from_str(trimmed, pattern) {
            return Ok(from_local(tz, local));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(from_local(tz, date.and_time(NaiveTime::default())));
    }
    bail!("could not parse '{trimmed}' as a local date or date-time (expected YYYY-MM-DD [HH:MM])")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Central European rules: +01:00, +02:00 from the last Sunday of March
    /// to the last Sunday of October, switching at 01:00 UTC.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct CentralEurope;

    impl CentralEurope {
        fn standard() -> FixedOffset {
            FixedOffset::east_opt(3600).expect("valid offset")
        }

        fn summer() -> FixedOffset {
            FixedOffset::east_opt(7200).expect("valid offset")
        }

        fn last_sunday(year: i32, month: u32) -> NaiveDateTime {
            let first_of_next = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)
            }
            .expect("valid date");
            let mut day = first_of_next.pred_opt().expect("valid date");
            while day.weekday() != Weekday::Sun {
                day = day.pred_opt().expect("valid date");
            }
            day.and_hms_opt(1, 0, 0).expect("valid time")
        }

        fn offset_at_utc(utc: &NaiveDateTime) -> FixedOffset {
            let start = Self::last_sunday(utc.year(), 3);
            let end = Self::last_sunday(utc.year(), 10);
            if *utc >= start && *utc < end {
                Self::summer()
            } else {
                Self::standard()
            }
        }
    }

    impl TimeZone for CentralEurope {
        type Offset = FixedOffset;

        fn from_offset(_offset: &FixedOffset) -> Self {
            CentralEurope
        }

        fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_time(NaiveTime::default()))
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            let candidates: Vec<FixedOffset> = [Self::summer(), Self::standard()]
                .into_iter()
                .filter(|offset| {
                    let utc = *local - chrono::Duration::seconds(i64::from(offset.local_minus_utc()));
                    Self::offset_at_utc(&utc) == *offset
                })
                .collect();
            match candidates.as_slice() {
                [single] => LocalResult::Single(*single),
                [first, second] => LocalResult::Ambiguous(*first, *second),
                _ => LocalResult::None,
            }
        }

        fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
            self.offset_from_utc_datetime(&utc.and_time(NaiveTime::default()))
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            Self::offset_at_utc(utc)
        }
    }

    pub(crate) fn local_ms<Tz: TimeZone>(tz: &Tz, y: i32, m: u32, d: u32, h: u32, min: u32) -> i64 {
        let local = NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(h, min, 0))
            .expect("valid local date-time");
        from_local(tz, local)
    }

    #[test]
    fn day_bounds_follow_the_zone_not_utc() {
        let zone = LocalZone::parse("+05:30").expect("zone");
        let at = local_ms(&zone, 2026, 10, 16, 0, 15);
        let (start, end) = day_bounds(&zone, at);
        assert_eq!(start, local_ms(&zone, 2026, 10, 16, 0, 0));
        assert_eq!(end, local_ms(&zone, 2026, 10, 17, 0, 0));
        assert_eq!(end_of_day(&zone, at), end - 1);
    }

    #[test]
    fn day_across_fall_back_lasts_twenty_five_hours() {
        let zone = CentralEurope;
        let at = local_ms(&zone, 2026, 10, 25, 12, 0);
        let (start, end) = day_bounds(&zone, at);
        assert_eq!(end - start, 25 * HOUR_MS);
    }

    #[test]
    fn add_days_keeps_wall_clock_time_across_dst() {
        let zone = CentralEurope;
        let before = local_ms(&zone, 2026, 10, 24, 9, 0);
        let after = add_days(&zone, before, 1);
        assert_eq!(local_time(&zone, after).format("%H:%M").to_string(), "09:00");
        assert_eq!(after - before, 25 * HOUR_MS);
    }

    #[test]
    fn spring_forward_gap_moves_forward() {
        let zone = CentralEurope;
        // 02:30 does not exist on 2026-03-29.
        let ms = local_ms(&zone, 2026, 3, 29, 2, 30);
        assert_eq!(local_time(&zone, ms).format("%H:%M").to_string(), "03:30");
    }

    #[test]
    fn start_of_week_respects_first_day() {
        let zone = LocalZone::Fixed(utc_offset());
        // 2026-10-16 is a Friday.
        let friday = local_ms(&zone, 2026, 10, 16, 18, 0);
        assert_eq!(
            start_of_week(&zone, friday, Weekday::Mon),
            local_ms(&zone, 2026, 10, 12, 0, 0)
        );
        assert_eq!(
            start_of_week(&zone, friday, Weekday::Sun),
            local_ms(&zone, 2026, 10, 11, 0, 0)
        );
        assert_eq!(day_of_week_name(&zone, friday), "Friday");
        assert_eq!(day_of_week_short(&zone, friday), "Fri");
    }

    #[test]
    fn parses_zone_specs() {
        assert_eq!(LocalZone::parse("local").expect("zone"), LocalZone::System);
        assert_eq!(
            LocalZone::parse("-0330").expect("zone"),
            LocalZone::Fixed(FixedOffset::west_opt(3 * 3600 + 1800).expect("offset"))
        );
        assert!(LocalZone::parse("Mars/Olympus").is_err());
        assert!(LocalZone::parse("+25:00").is_err());
    }

    #[test]
    fn parse_local_accepts_dates_and_date_times() {
        let zone = LocalZone::parse("+02:00").expect("zone");
        let ms = parse_local(&zone, "2026-10-16 09:30").expect("parse");
        assert_eq!(format_date_time(&zone, ms), "Oct 16, 2026 09:30");
        let day = parse_local(&zone, "2026-10-16").expect("parse");
        assert_eq!(format_time(&zone, day), "00:00");
        assert!(parse_local(&zone, "next tuesday").is_err());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance_minutes(10);
        assert_eq!(clock.now_ms(), 1_000 + 10 * MINUTE_MS);
        assert!(is_same_day(&LocalZone::Fixed(utc_offset()), clock.now_ms(), 0));
    }
}
