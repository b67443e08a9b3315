//! Utility functions shared across the codebase

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Get current time in milliseconds since Unix epoch.
/// Returns 0 if system time is before Unix epoch (fallback behavior).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_millis(0))
        .as_millis() as u64
}

/// Generate a unique resource-name token safe for parallel scenarios.
///
/// Combines PID and an atomic counter so that two harness processes, or two
/// scenarios within one process, never collide on device or namespace names.
pub fn unique_token() -> String {
    let seq = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() % 0xffff;
    format!("{pid:x}{seq:x}")
}

/// Truncate a name to the Linux netdev limit (15 chars).
pub fn clamp_ifname(name: &str) -> String {
    if name.len() > 15 {
        name[..15].to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_tokens_differ() {
        let a = unique_token();
        let b = unique_token();
        assert_ne!(a, b);
    }

    #[test]
    fn clamp_respects_netdev_limit() {
        assert_eq!(clamp_ifname("short"), "short");
        let long = "abcdefghijklmnopqrstuvwxyz";
        let clamped = clamp_ifname(long);
        assert_eq!(clamped.len(), 15);
        assert!(long.starts_with(&clamped));
    }
}
