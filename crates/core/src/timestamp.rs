//! Timestamp helpers.
//!
//! Stores persist timestamps as microseconds since the epoch so that they
//! compare correctly as integers in every realization.

use time::OffsetDateTime;

/// Current UTC time truncated to microsecond precision.
pub fn now() -> OffsetDateTime {
    truncate(OffsetDateTime::now_utc())
}

/// Truncate to microsecond precision.
pub fn truncate(t: OffsetDateTime) -> OffsetDateTime {
    from_micros(to_micros(t))
}

pub fn to_micros(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000) as i64
}

/// Convert microseconds since the epoch back to a UTC timestamp.
///
/// Out-of-range values saturate to the epoch.
pub fn from_micros(micros: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
