//! Local-day arithmetic in a fixed UTC offset.
//!
//! Daily triggers, "today"/"yesterday" context windows and AI-proposed
//! "HH:MM" times are all interpreted in the deployment's local offset.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};

use crate::error::{CadenceError, Result};

/// Converts between UTC instants and the deployment's local calendar.
#[derive(Debug, Clone, Copy)]
pub struct LocalClock {
    offset: FixedOffset,
}

impl LocalClock {
    /// Clock for a UTC offset in minutes (e.g. 480 for UTC+8).
    pub fn new(utc_offset_minutes: i32) -> Result<Self> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
            CadenceError::Config(format!("utc offset out of range: {utc_offset_minutes} min"))
        })?;
        Ok(Self { offset })
    }

    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Local calendar date of an instant.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// Local "HH:MM" of an instant.
    pub fn local_hm(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset).format("%H:%M").to_string()
    }

    /// UTC instant for a local date + time of day.
    pub fn at(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = date.and_time(time) - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&naive)
    }

    /// `[start, end)` of a local day, in UTC.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.at(date, NaiveTime::MIN);
        (start, start + Duration::days(1))
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::utc()
    }
}

/// Parse an AI-provided "HH:MM" (also accepts "H:MM" and "HH:MM:SS").
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| CadenceError::Parse(format!("bad time of day '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_day_bounds_with_offset() {
        let clock = LocalClock::new(8 * 60).unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let (start, end) = clock.day_bounds(date);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 2, 28, 16, 0, 0).unwrap());
        assert_eq!(end - start, Duration::days(1));
    }

    #[test]
    fn test_local_date_crosses_midnight() {
        let clock = LocalClock::new(8 * 60).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 2, 28, 17, 0, 0).unwrap();
        assert_eq!(clock.local_date(at), NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
        assert_eq!(clock.local_hm(at), "01:00");
    }

    #[test]
    fn test_parse_time_of_day() {
        let t = parse_time_of_day("9:05").unwrap();
        assert_eq!((t.hour(), t.minute()), (9, 5));
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("noon").is_err());
    }

    #[test]
    fn test_offset_out_of_range() {
        assert!(LocalClock::new(24 * 60).is_err());
    }
}
