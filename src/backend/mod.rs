//! Backend-agnostic rule management.
//!
//! A [`RuleController`] installs rules and reads per-rule counters through
//! an external CLI. The controller promises the *shape* of the returned
//! data (chains holding rules in installation order, each with packet and
//! byte counters); how a concrete backend encodes that on the wire is its
//! own business. One variant exists per concrete backend so a different
//! rule-management tool can be substituted without touching scenarios.

pub mod iptables;
pub mod nftables;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::config::HarnessConfig;
use crate::error::{BackendError, Result};

pub use iptables::IptablesBackend;
pub use nftables::NftablesBackend;

/// Parsed counter state for one rule. A read-only snapshot of backend state
/// at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleStats {
    pub packets: u64,
    pub bytes: u64,
    /// The rule's action (DROP, ACCEPT, ...) as the backend reports it.
    pub target: String,
    /// Backend-formatted match text. Diagnostics only, never interpreted.
    pub detail: String,
}

/// Ordered rule counters for one chain: position N holds the Nth appended
/// rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStats {
    pub name: String,
    pub rules: Vec<RuleStats>,
}

/// Look up a chain by name in a stats snapshot.
pub fn find_chain<'a>(stats: &'a [ChainStats], name: &str) -> Option<&'a ChainStats> {
    stats.iter().find(|c| c.name == name)
}

/// Which rule-management CLI drives the engine under test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// iptables-compatible frontend (including engine-provided drop-ins).
    #[default]
    Iptables,
    /// nftables `nft` CLI.
    Nftables,
}

impl BackendKind {
    /// Program name used when the config carries no override.
    pub const fn default_program(self) -> &'static str {
        match self {
            BackendKind::Iptables => "iptables",
            BackendKind::Nftables => "nft",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Iptables => write!(f, "iptables"),
            BackendKind::Nftables => write!(f, "nftables"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iptables" => Ok(BackendKind::Iptables),
            "nftables" | "nft" => Ok(BackendKind::Nftables),
            _ => Err(format!("invalid backend '{s}': use iptables or nftables")),
        }
    }
}

impl clap::ValueEnum for BackendKind {
    fn value_variants<'a>() -> &'a [Self] {
        &[BackendKind::Iptables, BackendKind::Nftables]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            BackendKind::Iptables => Some(clap::builder::PossibleValue::new("iptables")),
            BackendKind::Nftables => Some(clap::builder::PossibleValue::new("nftables")),
        }
    }
}

/// The rule controller handle scenarios use. Stateless façade over the
/// backend's live rule table.
#[derive(Debug, Clone)]
pub enum RuleController {
    Iptables(IptablesBackend),
    Nftables(NftablesBackend),
}

impl RuleController {
    /// Bind a controller of `kind` to its resolved program, optionally
    /// executing inside a network namespace.
    pub fn new(kind: BackendKind, config: &HarnessConfig, netns: Option<String>) -> Self {
        let program = config
            .backend_program
            .clone()
            .unwrap_or_else(|| PathBuf::from(kind.default_program()));
        match kind {
            BackendKind::Iptables => Self::Iptables(IptablesBackend::new(program, netns)),
            BackendKind::Nftables => Self::Nftables(NftablesBackend::new(program, netns)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Iptables(_) => BackendKind::Iptables,
            Self::Nftables(_) => BackendKind::Nftables,
        }
    }

    /// Append `expression` to `chain`, forwarding the expression verbatim.
    pub async fn append_rule(&self, chain: &str, expression: &str) -> Result<()> {
        match self {
            Self::Iptables(b) => b.append_rule(chain, expression).await,
            Self::Nftables(b) => b.append_rule(chain, expression).await,
        }
    }

    /// Read the backend's counters into ordered per-chain records.
    pub async fn stats(&self) -> Result<Vec<ChainStats>> {
        match self {
            Self::Iptables(b) => b.stats().await,
            Self::Nftables(b) => b.stats().await,
        }
    }

    /// Remove all rules the harness may have installed. Idempotent.
    pub async fn flush(&self) -> Result<()> {
        match self {
            Self::Iptables(b) => b.flush().await,
            Self::Nftables(b) => b.flush().await,
        }
    }
}

/// Split a rule expression into argv tokens. No shell is involved anywhere
/// in the invocation path, so whitespace splitting is the only processing
/// the expression ever receives.
pub(crate) fn split_expression(expression: &str) -> impl Iterator<Item = &str> {
    expression.split_whitespace()
}

/// Invoke the backend program (optionally inside `netns`) and capture its
/// output. Non-zero exit becomes [`BackendError::CommandFailed`] carrying
/// stderr.
pub(crate) async fn run_backend(
    program: &Path,
    netns: Option<&str>,
    args: &[String],
) -> Result<std::process::Output, BackendError> {
    let mut cmd = match netns {
        Some(ns) => {
            let mut c = Command::new("ip");
            c.args(["netns", "exec", ns]);
            c.arg(program);
            c
        }
        None => Command::new(program),
    };

    debug!(program = %program.display(), ?args, "invoking backend");
    let out = cmd
        .args(args)
        .output()
        .await
        .map_err(|source| BackendError::Unreachable {
            program: program.display().to_string(),
            source,
        })?;

    if out.status.success() {
        Ok(out)
    } else {
        Err(BackendError::CommandFailed {
            program: program.display().to_string(),
            status: out.status,
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}
