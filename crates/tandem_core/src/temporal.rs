//! Temporal normalization
//!
//! Script dates are a millisecond count since the Unix epoch with no zone.
//! Host values are normalized to that absolute instant on the way in:
//! zone-naive values are read as UTC, zoned values use their own offset.
//! The sub-millisecond remainder is carried separately so the bridge can
//! restore it while the script side leaves the date untouched.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};

const NANOS_PER_MILLI: u32 = 1_000_000;

/// An absolute instant split into whole milliseconds and the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochInstant {
    pub millis: i64,
    /// Always in `0..1_000_000`.
    pub sub_millis_nanos: u32,
}

impl EpochInstant {
    /// Script-side time value.
    pub fn millis_f64(&self) -> f64 {
        self.millis as f64
    }

    pub fn has_sub_millis(&self) -> bool {
        self.sub_millis_nanos != 0
    }
}

pub fn from_naive_datetime(value: &NaiveDateTime) -> EpochInstant {
    let utc = value.and_utc();
    let nanos = utc.timestamp_subsec_nanos();
    // Leap-second nanos (>= 1e9) fold into the last millisecond
    let nanos = nanos.min(999_999_999);
    EpochInstant {
        millis: utc.timestamp() * 1000 + (nanos / NANOS_PER_MILLI) as i64,
        sub_millis_nanos: nanos % NANOS_PER_MILLI,
    }
}

pub fn from_zoned(value: &DateTime<FixedOffset>) -> EpochInstant {
    from_naive_datetime(&value.naive_utc())
}

pub fn from_date(value: &NaiveDate) -> EpochInstant {
    from_naive_datetime(&value.and_time(NaiveTime::MIN))
}

/// Time-of-day values are anchored to the epoch date.
pub fn from_time(value: &NaiveTime) -> EpochInstant {
    // NaiveDate::default() is 1970-01-01
    let epoch = NaiveDate::default();
    from_naive_datetime(&epoch.and_time(*value))
}

/// Rebuild a zone-naive (UTC) datetime from a script time value.
///
/// Returns `None` for NaN (an invalid script date) or out-of-range values.
pub fn to_naive_datetime(millis: f64, sub_millis_nanos: u32) -> Option<NaiveDateTime> {
    if !millis.is_finite() {
        return None;
    }
    let whole = millis.trunc() as i64;
    let base = DateTime::<Utc>::from_timestamp_millis(whole)?.naive_utc();
    let extra = sub_millis_nanos.min(NANOS_PER_MILLI - 1) as i64;
    base.checked_add_signed(TimeDelta::nanoseconds(extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn naive(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").unwrap()
    }

    #[test]
    fn test_naive_is_read_as_utc() {
        let instant = from_naive_datetime(&naive("1970-01-01 00:00:01.500"));
        assert_eq!(instant.millis, 1500);
        assert_eq!(instant.sub_millis_nanos, 0);
    }

    #[test]
    fn test_sub_millis_split() {
        let instant = from_naive_datetime(&naive("2020-05-17 12:00:00.123456789"));
        assert_eq!(instant.millis % 1000, 123);
        assert_eq!(instant.sub_millis_nanos, 456_789);
        assert!(instant.has_sub_millis());

        let back = to_naive_datetime(instant.millis_f64(), instant.sub_millis_nanos).unwrap();
        assert_eq!(back, naive("2020-05-17 12:00:00.123456789"));
    }

    #[test]
    fn test_zoned_normalizes_to_instant() {
        let zoned = DateTime::parse_from_rfc3339("2021-03-04T10:00:00+02:00").unwrap();
        let instant = from_zoned(&zoned);
        let back = to_naive_datetime(instant.millis_f64(), 0).unwrap();
        assert_eq!(back, naive("2021-03-04 08:00:00.0"));
    }

    #[test]
    fn test_before_epoch() {
        let instant = from_naive_datetime(&naive("1969-12-31 23:59:59.250"));
        assert_eq!(instant.millis, -750);
        assert_eq!(
            to_naive_datetime(instant.millis_f64(), 0).unwrap(),
            naive("1969-12-31 23:59:59.250")
        );
    }

    #[test]
    fn test_date_and_time_anchors() {
        let date = NaiveDate::from_ymd_opt(2000, 1, 2).unwrap();
        assert_eq!(from_date(&date).millis, 946_771_200_000);

        let time = NaiveTime::from_hms_opt(0, 1, 0).unwrap();
        assert_eq!(from_time(&time).millis, 60_000);
    }

    #[test]
    fn test_invalid_script_date() {
        assert_eq!(to_naive_datetime(f64::NAN, 0), None);
    }

    // Years 0001 through 9999, all exactly representable as script numbers.
    const MIN_MILLIS: i64 = -62_135_596_800_000;
    const MAX_MILLIS: i64 = 253_402_300_799_999;

    proptest! {
        #[test]
        fn test_naive_roundtrip(millis in MIN_MILLIS..=MAX_MILLIS, nanos in 0u32..NANOS_PER_MILLI) {
            let base = DateTime::<Utc>::from_timestamp_millis(millis).unwrap().naive_utc();
            let value = base + TimeDelta::nanoseconds(nanos as i64);

            let instant = from_naive_datetime(&value);
            prop_assert_eq!(instant.millis, millis);
            prop_assert_eq!(instant.sub_millis_nanos, nanos);
            prop_assert_eq!(to_naive_datetime(instant.millis_f64(), instant.sub_millis_nanos), Some(value));
        }

        #[test]
        fn test_zoned_matches_utc(millis in MIN_MILLIS / 2..=MAX_MILLIS / 2, offset in -86_399i32..=86_399) {
            let utc = DateTime::<Utc>::from_timestamp_millis(millis).unwrap();
            let zone = FixedOffset::east_opt(offset).unwrap();
            let zoned = utc.with_timezone(&zone);
            prop_assert_eq!(from_zoned(&zoned), from_naive_datetime(&utc.naive_utc()));
        }
    }
}
