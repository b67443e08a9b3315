//! Harness configuration.
//!
//! One plain struct of knobs passed down to every component. Nothing here
//! changes at runtime; scenarios receive an immutable copy.

use std::path::PathBuf;
use std::time::Duration;

/// Default interface/namespace name prefix. Kept short because the full
/// name (prefix + unique token + pair index + side) must fit the 15-char
/// netdev limit.
pub const DEFAULT_IFACE_PREFIX: &str = "fp";

/// Default second octet for per-pair /24 subnets (`10.<base>.<pair+1>.x`).
/// 210 is outside the ranges commonly grabbed by container runtimes.
pub const DEFAULT_SUBNET_BASE: u8 = 210;

/// Top-level harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Prefix for veth device and namespace names.
    pub iface_prefix: String,
    /// Second octet of the 10.x.y.z addressing plan.
    pub subnet_base: u8,
    /// How long `send_and_wait` waits for a reply before reporting "none".
    pub send_timeout: Duration,
    /// Upper bound on waiting for backend counters to settle.
    pub settle_timeout: Duration,
    /// Delay between counter reads while settling.
    pub settle_interval: Duration,
    /// Override for the backend program path (e.g. a bpfilter-provided
    /// iptables frontend). `None` uses the backend's default program name.
    pub backend_program: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            iface_prefix: DEFAULT_IFACE_PREFIX.to_string(),
            subnet_base: DEFAULT_SUBNET_BASE,
            send_timeout: Duration::from_secs(2),
            settle_timeout: Duration::from_secs(1),
            settle_interval: Duration::from_millis(50),
            backend_program: None,
        }
    }
}

impl HarnessConfig {
    /// Create config from CLI arguments.
    pub fn from_cli(
        backend_program: Option<PathBuf>,
        send_timeout_ms: u64,
        settle_timeout_ms: u64,
    ) -> Self {
        Self {
            send_timeout: Duration::from_millis(send_timeout_ms),
            settle_timeout: Duration::from_millis(settle_timeout_ms),
            backend_program,
            ..Self::default()
        }
    }
}
