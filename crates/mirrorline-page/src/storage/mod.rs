//! Session-scoped storage shared by every page instance of a session.

pub mod items;
pub mod tokens;

use std::time::{SystemTime, UNIX_EPOCH};

pub use items::{Item, ItemStore, StorageCallback, StorageEvent};
pub use tokens::{TokenEntry, TokenStore, TokenValue, TokenWriteOutcome};

/// Wall-clock milliseconds since the Unix epoch, or 0 if the clock is before it.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}
