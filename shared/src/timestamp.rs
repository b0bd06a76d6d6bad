//! GPS timestamps reported by the timer unit.
//!
//! The timer transmits times as ASCII in the form `YYYY:MM:DD:HH:MM:SS:mmm`.
//! Live `CURRENT_TIME` reports may append a further `:R` field giving the
//! number of seconds until the next trigger.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("timestamp payload is not ASCII text")]
    NotText,
    #[error("expected 6 to 8 ':' separated fields, got {0}")]
    FieldCount(usize),
    #[error("field {index} is not a number: {field:?}")]
    BadField { index: usize, field: String },
    #[error("{0} is not a valid calendar time")]
    OutOfRange(String),
}

/// A GPS-derived UTC time.
///
/// `valid` is false for the placeholder timestamps attached to frames that
/// arrived without a matching trigger time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub milliseconds: u16,
    /// True when the GPS receiver had a position fix
    pub locked: bool,
    /// Seconds until the next trigger, only meaningful for live reports
    pub remaining_exposure: u16,
    pub valid: bool,
}

impl Timestamp {
    /// Placeholder for a frame with no trigger time available.
    pub fn invalid() -> Self {
        Self {
            year: 0,
            month: 0,
            day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
            milliseconds: 0,
            locked: false,
            remaining_exposure: 0,
            valid: false,
        }
    }

    pub fn from_datetime(time: DateTime<Utc>, locked: bool) -> Self {
        Self {
            year: time.year(),
            month: time.month() as u8,
            day: time.day() as u8,
            hours: time.hour() as u8,
            minutes: time.minute() as u8,
            seconds: time.second() as u8,
            milliseconds: (time.timestamp_subsec_millis() % 1000) as u16,
            locked,
            remaining_exposure: 0,
            valid: true,
        }
    }

    /// Parse a timer payload.
    ///
    /// Accepts six fields (no milliseconds), seven fields, or seven fields
    /// followed by the remaining-exposure count.
    pub fn parse_wire(payload: &[u8], locked: bool) -> Result<Self, TimestampError> {
        let text = std::str::from_utf8(payload).map_err(|_| TimestampError::NotText)?;
        let text = text.trim_end_matches(['\0', '\r', '\n']);
        let fields: Vec<&str> = text.split(':').collect();
        if !(6..=8).contains(&fields.len()) {
            return Err(TimestampError::FieldCount(fields.len()));
        }

        let mut values = [0u32; 8];
        for (index, field) in fields.iter().enumerate() {
            values[index] = field
                .trim()
                .parse::<u32>()
                .map_err(|_| TimestampError::BadField {
                    index,
                    field: field.to_string(),
                })?;
        }

        if values[6] > 999 || values[7] > u16::MAX as u32 || values[0] > 9999 {
            return Err(TimestampError::OutOfRange(text.to_string()));
        }

        let timestamp = Self {
            year: values[0] as i32,
            month: values[1].min(u8::MAX as u32) as u8,
            day: values[2].min(u8::MAX as u32) as u8,
            hours: values[3].min(u8::MAX as u32) as u8,
            minutes: values[4].min(u8::MAX as u32) as u8,
            seconds: values[5].min(u8::MAX as u32) as u8,
            milliseconds: values[6] as u16,
            locked,
            remaining_exposure: values[7] as u16,
            valid: true,
        };

        if timestamp.to_naive().is_none() {
            return Err(TimestampError::OutOfRange(text.to_string()));
        }
        Ok(timestamp)
    }

    /// Render in the timer wire format.
    pub fn to_wire(&self) -> String {
        format!(
            "{:04}:{:02}:{:02}:{:02}:{:02}:{:02}:{:03}",
            self.year, self.month, self.day, self.hours, self.minutes, self.seconds, self.milliseconds
        )
    }

    /// Calendar form of the time. A leap second (second 60) becomes second
    /// 59 with the milliseconds carried past 1000, as chrono represents it.
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        let (seconds, milliseconds) = if self.seconds == 60 {
            (59, self.milliseconds as u32 + 1000)
        } else {
            (self.seconds as u32, self.milliseconds as u32)
        };
        NaiveDate::from_ymd_opt(self.year, self.month as u32, self.day as u32)?.and_hms_milli_opt(
            self.hours as u32,
            self.minutes as u32,
            seconds,
            milliseconds,
        )
    }

    /// Shift the time back by whole seconds, normalising across minute, hour,
    /// day, month and year boundaries.
    ///
    /// Timestamps that do not describe a calendar time are returned unchanged.
    pub fn subtract_seconds(&self, seconds: i64) -> Self {
        let Some(naive) = self.to_naive() else {
            return *self;
        };
        let Some(delta) = TimeDelta::try_seconds(seconds) else {
            return *self;
        };
        let Some(shifted) = naive.checked_sub_signed(delta) else {
            return *self;
        };

        Self {
            year: shifted.year(),
            month: shifted.month() as u8,
            day: shifted.day() as u8,
            hours: shifted.hour() as u8,
            minutes: shifted.minute() as u8,
            seconds: shifted.second() as u8,
            ..*self
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.valid {
            return write!(f, "unavailable");
        }
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
            self.year, self.month, self.day, self.hours, self.minutes, self.seconds, self.milliseconds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seven_fields() {
        let ts = Timestamp::parse_wire(b"2012:01:01:00:00:02:000", true).unwrap();
        assert_eq!(ts.year, 2012);
        assert_eq!(ts.month, 1);
        assert_eq!(ts.seconds, 2);
        assert_eq!(ts.milliseconds, 0);
        assert!(ts.locked);
        assert!(ts.valid);
        assert_eq!(ts.remaining_exposure, 0);
    }

    #[test]
    fn test_parse_remaining_exposure_field() {
        let ts = Timestamp::parse_wire(b"2012:01:01:00:00:02:000:4", false).unwrap();
        assert_eq!(ts.remaining_exposure, 4);
        assert!(!ts.locked);
    }

    #[test]
    fn test_parse_without_milliseconds() {
        let ts = Timestamp::parse_wire(b"2011:06:30:23:59:59", true).unwrap();
        assert_eq!(ts.milliseconds, 0);
        assert_eq!(ts.hours, 23);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(
            Timestamp::parse_wire(b"2012:01:01", true),
            Err(TimestampError::FieldCount(3))
        );
        assert!(matches!(
            Timestamp::parse_wire(b"2012:xx:01:00:00:00:000", true),
            Err(TimestampError::BadField { index: 1, .. })
        ));
        assert!(matches!(
            Timestamp::parse_wire(b"2012:02:30:00:00:00:000", true),
            Err(TimestampError::OutOfRange(_))
        ));
        assert_eq!(
            Timestamp::parse_wire(&[0xff, 0xfe], true),
            Err(TimestampError::NotText)
        );
    }

    #[test]
    fn test_wire_format_matches_input() {
        let text = "2012:01:31:08:05:09:042";
        let ts = Timestamp::parse_wire(text.as_bytes(), true).unwrap();
        assert_eq!(ts.to_wire(), text);
    }

    #[test]
    fn test_subtract_seconds_crosses_year_boundary() {
        let ts = Timestamp::parse_wire(b"2012:01:01:00:00:02:250", true).unwrap();
        let start = ts.subtract_seconds(5);
        assert_eq!(start.to_wire(), "2011:12:31:23:59:57:250");
        assert!(start.locked);
    }

    #[test]
    fn test_subtract_seconds_leap_day() {
        let ts = Timestamp::parse_wire(b"2012:03:01:00:00:10:000", true).unwrap();
        assert_eq!(ts.subtract_seconds(20).to_wire(), "2012:02:29:23:59:50:000");
    }

    #[test]
    fn test_parse_leap_second() {
        let ts = Timestamp::parse_wire(b"2016:12:31:23:59:60:000", true).unwrap();
        assert_eq!(ts.seconds, 60);
        assert!(ts.valid);
        assert_eq!(ts.to_wire(), "2016:12:31:23:59:60:000");
        assert_eq!(ts.subtract_seconds(2).to_wire(), "2016:12:31:23:59:58:000");
        assert!(matches!(
            Timestamp::parse_wire(b"2016:12:31:23:59:61:000", true),
            Err(TimestampError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_invalid_timestamp_unchanged_by_subtract() {
        let ts = Timestamp::invalid();
        assert_eq!(ts.subtract_seconds(10), ts);
        assert_eq!(ts.to_string(), "unavailable");
    }

    #[test]
    fn test_display() {
        let ts = Timestamp::parse_wire(b"2012:01:01:00:00:02:007", true).unwrap();
        assert_eq!(ts.to_string(), "2012-01-01 00:00:02.007");
    }
}
