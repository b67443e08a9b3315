//! Shared utilities for integration tests.
#![allow(dead_code)]

use fwprobe::backend::BackendKind;
use fwprobe::config::HarnessConfig;
use fwprobe::scenario::check_harness_deps;

/// Check all integration test dependencies. Returns `true` if tests should
/// be skipped (prints the reason to stderr). Use at the top of every test.
pub fn skip_without_deps(backend: BackendKind) -> bool {
    match check_harness_deps(backend, &HarnessConfig::default()) {
        Ok(()) => false,
        Err(reason) => {
            eprintln!("Skipping: {reason}");
            true
        }
    }
}

pub fn test_config() -> HarnessConfig {
    HarnessConfig::default()
}
