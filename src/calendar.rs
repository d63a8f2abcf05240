//! Timestamp and calendar derivation shared by the `time` and `songplays`
//! tables, so both agree on every field for the same `start_time`.
//!
//! All derivation is in UTC.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::{EtlError, Result};

/// Converts an activity `ts` (epoch milliseconds) into `start_time`,
/// keeping millisecond precision.
pub fn start_time_from_millis(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ts).ok_or(EtlError::TimestampOutOfRange { ts })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalendarFields {
    pub hour: i32,
    pub day: i32,
    /// ISO-8601 week number (1..=53).
    pub week: i32,
    pub month: i32,
    /// Calendar year, not the ISO week-numbering year.
    pub year: i32,
    /// 1 = Sunday ... 7 = Saturday.
    pub weekday: i32,
}

impl CalendarFields {
    pub fn of(start_time: &DateTime<Utc>) -> Self {
        Self {
            hour: start_time.hour() as i32,
            day: start_time.day() as i32,
            week: start_time.iso_week().week() as i32,
            month: start_time.month() as i32,
            year: start_time.year(),
            weekday: start_time.weekday().number_from_sunday() as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_start_time_keeps_millis() {
        let t = start_time_from_millis(1541440000123).unwrap();
        assert_eq!(t.timestamp(), 1541440000);
        assert_eq!(t.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_calendar_fields_basic() {
        // 2018-11-05 17:46:40 UTC, a Monday
        let t = start_time_from_millis(1541440000000).unwrap();
        let fields = CalendarFields::of(&t);
        assert_eq!(
            fields,
            CalendarFields {
                hour: 17,
                day: 5,
                week: 45,
                month: 11,
                year: 2018,
                weekday: 2,
            }
        );
    }

    #[test]
    fn test_weekday_numbering_starts_sunday() {
        let sunday = Utc.with_ymd_and_hms(2018, 11, 4, 0, 0, 0).unwrap();
        let saturday = Utc.with_ymd_and_hms(2018, 11, 10, 23, 59, 59).unwrap();
        assert_eq!(CalendarFields::of(&sunday).weekday, 1);
        assert_eq!(CalendarFields::of(&saturday).weekday, 7);
    }

    #[test]
    fn test_iso_week_at_year_boundary() {
        // Friday 2021-01-01 belongs to ISO week 53 of 2020
        let new_year = Utc.with_ymd_and_hms(2021, 1, 1, 12, 0, 0).unwrap();
        let fields = CalendarFields::of(&new_year);
        assert_eq!(fields.week, 53);
        assert_eq!(fields.year, 2021);
        assert_eq!(fields.month, 1);

        // Monday 2018-12-31 belongs to ISO week 1 of 2019
        let last_day = Utc.with_ymd_and_hms(2018, 12, 31, 0, 0, 0).unwrap();
        let fields = CalendarFields::of(&last_day);
        assert_eq!(fields.week, 1);
        assert_eq!(fields.year, 2018);
    }

    #[test]
    fn test_out_of_range_timestamp() {
        assert!(matches!(
            start_time_from_millis(i64::MAX),
            Err(EtlError::TimestampOutOfRange { .. })
        ));
    }
}
