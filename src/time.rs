//! Common timestamp format
//!
//! Timestamps appear in experiment metadata, bundle metadata, and disk
//! experiment ids. They are always:
//! - UTC
//! - microsecond resolution
//! - 24-hour, human readable: `YYYY-MM-DD_HH-MM-SS-ffffff_UTC`

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};

use crate::Result;

/// `strftime` layout shared by [`format_timestamp`] and [`parse_timestamp`].
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S-%6f_UTC";

/// Current time truncated to microsecond resolution.
///
/// Truncation keeps `parse_timestamp(format_timestamp(now()))` lossless.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Current time as a formatted timestamp string.
#[must_use]
pub fn timestamp() -> String {
    format_timestamp(&now())
}

/// Format a UTC time in the fixed layout.
#[must_use]
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp produced by [`format_timestamp`].
///
/// # Errors
///
/// Returns [`crate::Error::Timestamp`] if the string does not follow the layout.
pub fn parse_timestamp(stamp: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)?;
    Ok(naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_format_layout() {
        let time = Utc
            .with_ymd_and_hms(2014, 3, 7, 16, 5, 9)
            .unwrap()
            .with_nanosecond(42_000)
            .unwrap();
        assert_eq!(format_timestamp(&time), "2014-03-07_16-05-09-000042_UTC");
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let time = now();
        let parsed = parse_timestamp(&format_timestamp(&time)).unwrap();
        assert_eq!(parsed, time);
    }

    #[test]
    fn test_parse_rejects_other_layouts() {
        assert!(parse_timestamp("2014-03-07T16:05:09Z").is_err());
        assert!(parse_timestamp("").is_err());
    }

    #[test]
    fn test_now_has_microsecond_resolution() {
        let time = now();
        assert_eq!(time.timestamp_subsec_nanos() % 1_000, 0);
    }
}
