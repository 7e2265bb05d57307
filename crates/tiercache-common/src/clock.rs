//! Wall-clock helpers for catalog timestamps

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds
#[must_use]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
