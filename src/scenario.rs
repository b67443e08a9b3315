//! Scenario harness: composes topology, rule controller, packet factory and
//! transport into one per-scenario context with guaranteed teardown.
//!
//! A scenario body receives a [`ScenarioContext`] and nothing else; all
//! process-wide network and rule state is reached through it, which keeps
//! scenario isolation auditable. Teardown runs whether the body passes,
//! fails, or panics (the latter via [`Topology`]'s `Drop`).

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use crate::backend::{BackendKind, ChainStats, RuleController};
use crate::config::HarnessConfig;
use crate::error::ResourceError;
use crate::packet::{PacketDescriptor, ProtocolKind};
use crate::topology::{self, Endpoint, Topology};
use crate::transport::RawTransport;

// ---------------------------------------------------------------------------
// Dependency checking
// ---------------------------------------------------------------------------

/// Check if a binary exists in PATH.
pub fn check_binary(name: &str) -> Option<PathBuf> {
    Command::new("sh")
        .args(["-c", &format!("command -v {name}")])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| PathBuf::from(String::from_utf8_lossy(&o.stdout).trim().to_string()))
}

/// Returns `true` if the process can create namespaces and open raw
/// sockets (effective UID 0).
pub fn check_privileges() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Reason why scenarios must be skipped.
#[derive(Debug)]
pub enum SkipReason {
    NotRoot,
    MissingTool(String),
    MissingBackend(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotRoot => write!(f, "requires root (netns + raw sockets)"),
            SkipReason::MissingTool(t) => write!(f, "system tool '{t}' not found"),
            SkipReason::MissingBackend(b) => {
                write!(f, "rule-management backend '{b}' not found")
            }
        }
    }
}

/// Check everything a scenario needs. Returns `Ok(())` if available, or
/// `Err(SkipReason)` with the first missing dependency.
pub fn check_harness_deps(
    backend: BackendKind,
    config: &HarnessConfig,
) -> std::result::Result<(), SkipReason> {
    if !check_privileges() {
        return Err(SkipReason::NotRoot);
    }

    if check_binary("ip").is_none() {
        return Err(SkipReason::MissingTool("ip".to_string()));
    }

    match &config.backend_program {
        Some(path) => {
            if !path.exists() {
                return Err(SkipReason::MissingBackend(path.display().to_string()));
            }
        }
        None => {
            let program = backend.default_program();
            if check_binary(program).is_none() {
                return Err(SkipReason::MissingBackend(program.to_string()));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// ScenarioContext
// ---------------------------------------------------------------------------

/// Everything one scenario may touch: its topology, its rule controller,
/// and constructors for packets and transports.
pub struct ScenarioContext {
    topology: Topology,
    controller: RuleController,
    config: HarnessConfig,
}

impl ScenarioContext {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn controller(&self) -> &RuleController {
        &self.controller
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Host-side (injection) endpoint of pair `i`.
    pub fn host(&self, i: usize) -> &Endpoint {
        self.topology.host(i)
    }

    /// Namespaced (filtered-ingress) endpoint of pair `i`.
    pub fn peer(&self, i: usize) -> &Endpoint {
        self.topology.peer(i)
    }

    /// Build a packet addressed between two of this scenario's endpoints.
    pub fn build_packet(
        &self,
        kind: ProtocolKind,
        src: &Endpoint,
        dst: &Endpoint,
    ) -> PacketDescriptor {
        PacketDescriptor::build(kind, src, dst)
    }

    /// Open a raw transport on one of this scenario's endpoints.
    pub fn transport(&self, endpoint: &Endpoint) -> crate::error::Result<RawTransport> {
        Ok(RawTransport::open(endpoint)?)
    }

    /// Append a rule through the scenario's backend.
    pub async fn append_rule(&self, chain: &str, expression: &str) -> crate::error::Result<()> {
        self.controller.append_rule(chain, expression).await
    }

    /// Read backend counters, settled: the snapshot is re-read until two
    /// consecutive reads agree (or the settle timeout elapses), so counters
    /// reflect any packet sent before this call returned.
    pub async fn stats(&self) -> crate::error::Result<Vec<ChainStats>> {
        let deadline = tokio::time::Instant::now() + self.config.settle_timeout;
        let mut last = self.controller.stats().await?;
        loop {
            tokio::time::sleep(self.config.settle_interval).await;
            let next = self.controller.stats().await?;
            let settled = next == last;
            last = next;
            if settled || tokio::time::Instant::now() >= deadline {
                return Ok(last);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario runner
// ---------------------------------------------------------------------------

/// Run one scenario body with a fresh topology and a clean rule table.
///
/// Teardown is unconditional. A teardown failure is logged and suppressed
/// when the body already failed (the body's error is what the caller sees);
/// it surfaces only when teardown is the sole failure. Repeated teardown
/// failures trip a process-wide breaker that fails subsequent scenarios
/// fast with [`ResourceError::Exhausted`].
pub async fn run_scenario<F>(
    name: &str,
    config: &HarnessConfig,
    backend: BackendKind,
    pair_count: usize,
    body: F,
) -> Result<()>
where
    F: AsyncFnOnce(&mut ScenarioContext) -> Result<()>,
{
    if let Some(failures) = topology::teardown_exhausted() {
        return Err(ResourceError::Exhausted(failures).into());
    }

    info!(scenario = name, backend = %backend, "starting scenario");
    let topo = Topology::create(config, pair_count).context("topology setup")?;
    let controller = RuleController::new(backend, config, Some(topo.netns().to_string()));
    let mut ctx = ScenarioContext {
        topology: topo,
        controller,
        config: config.clone(),
    };

    let result = async {
        // Fresh rule table even if an earlier run leaked state.
        ctx.controller.flush().await.context("flush backend rules")?;
        body(&mut ctx).await
    }
    .await;

    let teardown = ctx.topology.destroy();

    match (result, teardown) {
        (Ok(()), Ok(())) => {
            info!(scenario = name, "scenario passed");
            Ok(())
        }
        (Ok(()), Err(td)) => {
            Err(anyhow::Error::new(td).context(format!("teardown failed after scenario '{name}'")))
        }
        (Err(e), teardown) => {
            if let Err(td) = teardown {
                warn!(scenario = name, "suppressing teardown error: {td}");
            }
            Err(e.context(format!("scenario '{name}' failed")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_reasons_are_descriptive() {
        assert!(format!("{}", SkipReason::NotRoot).contains("root"));
        assert!(format!("{}", SkipReason::MissingTool("ip".into())).contains("'ip'"));
        assert!(
            format!("{}", SkipReason::MissingBackend("nft".into())).contains("'nft'")
        );
    }

    #[test]
    fn missing_backend_override_is_reported() {
        let config = HarnessConfig {
            backend_program: Some(PathBuf::from("/nonexistent/iptables")),
            ..HarnessConfig::default()
        };
        // Even as root this must fail: the override path does not exist.
        if check_privileges() {
            let err = check_harness_deps(BackendKind::Iptables, &config).unwrap_err();
            assert!(matches!(err, SkipReason::MissingBackend(_)));
        }
    }

    #[test]
    fn check_binary_finds_sh() {
        assert!(check_binary("sh").is_some());
        assert!(check_binary("fwprobe-no-such-binary").is_none());
    }
}
