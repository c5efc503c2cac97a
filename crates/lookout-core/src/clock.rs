use time::OffsetDateTime;

/// Milliseconds since the Unix epoch, floored.
pub fn unix_millis(at: OffsetDateTime) -> i64 {
    at.unix_timestamp_nanos().div_euclid(1_000_000) as i64
}

/// Whole seconds elapsed from `since_ms` to `now_ms`, clamped at zero.
///
/// A block stamped in the future (local clock behind the chain) reads as zero rather than a
/// negative age.
pub fn seconds_between(since_ms: i64, now_ms: i64) -> u64 {
    now_ms.saturating_sub(since_ms).div_euclid(1000).max(0) as u64
}
