//! Timestamp utilities
//!
//! Task creation times are persisted as integer milliseconds since the Unix
//! epoch so the claim query can order on them without parsing.

use chrono::{DateTime, TimeZone, Utc};

/// Current time as milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert stored epoch milliseconds back to a UTC timestamp
///
/// Out-of-range values collapse to the epoch rather than failing a read.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
