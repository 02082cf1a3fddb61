//! Shared timestamp and id helpers.

use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    format!("{}Z", now_secs())
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Parses a `1771220592Z` style stamp back to seconds.
pub fn parse_epoch_z(ts: &str) -> Option<u64> {
    ts.trim_end_matches('Z').parse::<u64>().ok()
}

pub fn new_ulid() -> String {
    Ulid::new().to_string()
}

/// Short lowercase random token taken from the random half of a ULID.
pub fn random_token(len: usize) -> String {
    let ulid = Ulid::new().to_string();
    let random = &ulid[10..];
    random[..len.min(random.len())].to_ascii_lowercase()
}
