use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch. A clock before the epoch reads as 0.
pub fn timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
