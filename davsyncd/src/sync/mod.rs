pub mod backoff;
pub mod content;
pub mod folder;
pub mod forest;
pub mod node;
pub mod paths;
pub mod repair;
pub mod scheduler;
pub mod store;
pub mod transfer;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
