use chrono::{
    DateTime, Days, Duration, LocalResult, NaiveDateTime, NaiveTime, Offset, TimeZone, Timelike,
    Utc,
};
use chrono_tz::Tz;
use thiserror::Error;

use crate::types::{minute_of_day, QuietHoursSettings};

/// Zone used when no quiet-hours zone is configured.
pub const DEFAULT_TIMEZONE: &str = "Europe/Berlin";

/// Minutes added after the end of quiet hours before sending resumes.
pub const RESUME_BUFFER_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuietHoursError {
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// Evaluates per-recipient quiet windows against a single, process-wide named zone.
#[derive(Debug, Clone, Copy)]
pub struct QuietHoursCalculator {
    tz: Tz,
}

impl Default for QuietHoursCalculator {
    fn default() -> Self {
        Self { tz: Tz::Europe__Berlin }
    }
}

impl QuietHoursCalculator {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Builds a calculator from an IANA zone name such as `Europe/Berlin`.
    pub fn from_name(name: &str) -> Result<Self, QuietHoursError> {
        let tz: Tz = name
            .parse()
            .map_err(|_| QuietHoursError::InvalidTimezone(name.to_string()))?;
        Ok(Self { tz })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Wall-clock minute of day of `now` in the configured zone.
    pub fn local_minute_of_day(&self, now: DateTime<Utc>) -> u32 {
        minute_of_day(now.with_timezone(&self.tz).time())
    }

    /// Returns `true` when `now` falls inside the recipient's quiet window.
    ///
    /// A window with `start == end` is empty and never matches.
    pub fn in_quiet_hours(&self, now: DateTime<Utc>, settings: &QuietHoursSettings) -> bool {
        let now_minutes = self.local_minute_of_day(now);
        let start = settings.start_minutes();
        let end = settings.end_minutes();

        if start == end {
            return false;
        }
        if start < end {
            return start <= now_minutes && now_minutes < end;
        }
        now_minutes >= start || now_minutes < end
    }

    /// Next instant at which quiet hours end, plus the resume buffer.
    ///
    /// The end boundary is resolved with the zone offset in force on the target date, so a
    /// daylight-saving transition between `now` and the target is accounted for.
    pub fn next_send_time(&self, now: DateTime<Utc>, settings: &QuietHoursSettings) -> DateTime<Utc> {
        let local = now.with_timezone(&self.tz);
        let mut date = local.date_naive();
        if minute_of_day(local.time()) >= settings.end_minutes() {
            date = date.checked_add_days(Days::new(1)).unwrap_or(date);
        }

        let target = date.and_time(truncate_to_minute(settings.end));
        self.resolve_local(target) + Duration::minutes(RESUME_BUFFER_MINUTES)
    }

    fn resolve_local(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(resolved) => resolved.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            LocalResult::None => {
                // Civil time skipped by a forward transition: apply the offset from before the gap.
                let before = self
                    .tz
                    .offset_from_utc_datetime(&(naive - Duration::days(1)))
                    .fix();
                let utc = naive - Duration::seconds(i64::from(before.local_minus_utc()));
                Utc.from_utc_datetime(&utc)
            }
        }
    }
}

fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    time.with_second(0)
        .and_then(|value| value.with_nanosecond(0))
        .unwrap_or(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn settings(start: &str, end: &str) -> QuietHoursSettings {
        QuietHoursSettings::parse(start, end).expect("settings")
    }

    fn berlin() -> QuietHoursCalculator {
        QuietHoursCalculator::from_name(DEFAULT_TIMEZONE).expect("zone")
    }

    fn local_hhmm(calc: &QuietHoursCalculator, instant: DateTime<Utc>) -> String {
        instant
            .with_timezone(&calc.timezone())
            .format("%H:%M")
            .to_string()
    }

    #[test]
    fn wrapping_window_detects_across_midnight() {
        let calc = berlin();
        let window = settings("22:00", "07:00");

        // 23:30 local (UTC+1 in January)
        assert!(calc.in_quiet_hours(at("2024-01-01T22:30:00Z"), &window));
        // 20:30 local
        assert!(!calc.in_quiet_hours(at("2024-01-01T19:30:00Z"), &window));
        // 06:59 local next morning
        assert!(calc.in_quiet_hours(at("2024-01-02T05:59:00Z"), &window));
        // 07:00 local is the first minute outside the window
        assert!(!calc.in_quiet_hours(at("2024-01-02T06:00:00Z"), &window));
    }

    #[test]
    fn non_wrapping_window_is_half_open() {
        let calc = berlin();
        let window = settings("09:00", "17:00");

        assert!(!calc.in_quiet_hours(at("2024-01-01T07:59:00Z"), &window));
        assert!(calc.in_quiet_hours(at("2024-01-01T08:00:00Z"), &window));
        assert!(calc.in_quiet_hours(at("2024-01-01T15:59:00Z"), &window));
        assert!(!calc.in_quiet_hours(at("2024-01-01T16:00:00Z"), &window));
    }

    #[test]
    fn equal_bounds_mean_no_quiet_hours() {
        let calc = berlin();
        let window = settings("07:00", "07:00");

        for hour in 0..24 {
            let instant = at("2024-01-01T00:00:00Z") + Duration::hours(hour);
            assert!(!calc.in_quiet_hours(instant, &window), "hour {hour}");
        }
    }

    #[test]
    fn uses_configured_zone() {
        let calc = QuietHoursCalculator::from_name("UTC").expect("utc");
        let window = settings("22:00", "07:00");

        assert!(calc.in_quiet_hours(at("2024-01-01T22:30:00Z"), &window));
        assert!(!calc.in_quiet_hours(at("2024-01-01T21:30:00Z"), &window));
    }

    #[test]
    fn rejects_unknown_zone() {
        let err = QuietHoursCalculator::from_name("Mars/Olympus").expect_err("invalid");
        assert_eq!(err, QuietHoursError::InvalidTimezone("Mars/Olympus".to_string()));
    }

    #[test]
    fn next_send_time_after_end_moves_to_next_day() {
        let calc = berlin();
        let window = settings("22:00", "07:00");

        let next = calc.next_send_time(at("2024-01-01T22:30:00Z"), &window);
        assert_eq!(next, at("2024-01-02T06:30:00Z"));
        assert_eq!(local_hhmm(&calc, next), "07:30");
    }

    #[test]
    fn next_send_time_before_end_stays_on_same_day() {
        let calc = berlin();
        let window = settings("22:00", "07:00");

        // 04:00 local on Jan 2
        let next = calc.next_send_time(at("2024-01-02T03:00:00Z"), &window);
        assert_eq!(next, at("2024-01-02T06:30:00Z"));
    }

    #[test]
    fn next_send_time_uses_target_date_offset_in_spring() {
        let calc = berlin();
        let window = settings("22:00", "07:00");

        // 23:30 CET on Mar 30; clocks go forward during the night.
        let next = calc.next_send_time(at("2024-03-30T22:30:00Z"), &window);
        assert_eq!(next, at("2024-03-31T05:30:00Z"));
        assert_eq!(local_hhmm(&calc, next), "07:30");
    }

    #[test]
    fn next_send_time_uses_target_date_offset_in_autumn() {
        let calc = berlin();
        let window = settings("22:00", "07:00");

        // 23:30 CEST on Oct 26; clocks go back during the night.
        let next = calc.next_send_time(at("2024-10-26T21:30:00Z"), &window);
        assert_eq!(next, at("2024-10-27T06:30:00Z"));
        assert_eq!(local_hhmm(&calc, next), "07:30");
    }

    #[test]
    fn end_inside_skipped_hour_resolves_forward() {
        let calc = berlin();
        let window = settings("00:00", "02:30");

        // 00:30 CET on Mar 31; 02:30 local does not exist that day.
        let next = calc.next_send_time(at("2024-03-30T23:30:00Z"), &window);
        assert_eq!(next, at("2024-03-31T02:00:00Z"));
    }

    #[test]
    fn end_inside_repeated_hour_uses_earliest_instant() {
        let calc = berlin();
        let window = settings("00:00", "02:30");

        // 00:30 CEST on Oct 27; 02:30 local occurs twice.
        let next = calc.next_send_time(at("2024-10-26T22:30:00Z"), &window);
        assert_eq!(next, at("2024-10-27T01:00:00Z"));
    }
}
