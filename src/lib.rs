//! fwprobe: end-to-end verification harness for kernel packet filtering.
//!
//! Proves with real traffic that rules installed through a rule-management
//! CLI are enforced by the engine behind it: build an isolated veth
//! topology, inject protocol-correct frames on one end, and read the
//! backend's per-rule counters to confirm the match.

// Use mimalloc as the global allocator for tests (non-Windows only)
#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod backend;
pub mod config;
pub mod error;
pub mod packet;
pub mod runner;
pub mod scenario;
pub mod topology;
pub mod transport;
pub mod utils;

// Re-export commonly used items
pub use backend::{BackendKind, ChainStats, RuleController, RuleStats, find_chain};
pub use config::HarnessConfig;
pub use error::{BackendError, HarnessError, ParseError, ResourceError, TransportError};
pub use packet::{PacketDescriptor, ProtocolKind};
pub use scenario::{ScenarioContext, SkipReason, check_harness_deps, run_scenario};
pub use topology::{Endpoint, Topology};
pub use transport::RawTransport;
pub use utils::now_ms;
