use chrono::{DateTime, TimeZone, Utc};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    current_unix_timestamp_ms() / 1_000
}

/// Converts a UTC instant to signed Unix milliseconds, the column format used for
/// reply quota rows.
pub fn datetime_to_unix_ms(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

/// Converts Unix milliseconds back to a UTC instant. Out-of-range values clamp to
/// the epoch.
pub fn datetime_from_unix_ms(value: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(value)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
