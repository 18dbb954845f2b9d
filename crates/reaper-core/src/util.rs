use std::time::Duration;

/// Adds two microsecond counts, clamping to `i64::MAX`/`i64::MIN` instead of wrapping.
pub fn saturated_add(a: i64, b: i64) -> i64 {
    a.saturating_add(b)
}

/// Converts a duration to whole microseconds, saturating at `i64::MAX`.
pub fn duration_to_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

/// Converts a (possibly negative) microsecond count to a duration; negatives become zero.
pub fn micros_to_duration(micros: i64) -> Duration {
    Duration::from_micros(micros.max(0) as u64)
}
