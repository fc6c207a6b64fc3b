//! Shared utility functions.

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp as seconds since Unix epoch.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Convert MiB to bytes.
pub fn mib_to_bytes(mib: u32) -> u64 {
    u64::from(mib) * 1024 * 1024
}
