//! nftables backend.
//!
//! Rules live in a dedicated `ip fwprobe` table so flushing never touches
//! rulesets the harness does not own. Counters come from `nft -j`, whose
//! JSON shape is stable across nft versions; expressions wanting counters
//! must include a `counter` statement (nft statement order is meaningful,
//! so the harness never injects one).

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{BackendError, HarnessError, ParseError, Result};

use super::{ChainStats, RuleStats, run_backend, split_expression};

/// Table owned by the harness (family `ip`).
pub const TABLE: &str = "fwprobe";

#[derive(Debug, Clone)]
pub struct NftablesBackend {
    program: PathBuf,
    netns: Option<String>,
}

impl NftablesBackend {
    pub fn new(program: impl Into<PathBuf>, netns: Option<String>) -> Self {
        Self {
            program: program.into(),
            netns,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output, BackendError> {
        run_backend(&self.program, self.netns.as_deref(), &args).await
    }

    /// Create the harness table and `chain` if missing. `nft add` is
    /// idempotent for both. Base-chain hooks are derived from the
    /// conventional chain names; anything else becomes a regular chain.
    async fn ensure_chain(&self, chain: &str) -> Result<(), BackendError> {
        self.run(to_args(&["add", "table", "ip", TABLE])).await?;

        let mut args = to_args(&["add", "chain", "ip", TABLE, chain]);
        if let Some(hook) = base_hook(chain) {
            args.push(format!(
                "{{ type filter hook {hook} priority 0 ; policy accept ; }}"
            ));
        }
        self.run(args).await?;
        Ok(())
    }

    pub async fn append_rule(&self, chain: &str, expression: &str) -> Result<()> {
        self.ensure_chain(chain).await?;
        let mut args = to_args(&["add", "rule", "ip", TABLE, chain]);
        args.extend(split_expression(expression).map(str::to_string));
        self.run(args).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<Vec<ChainStats>> {
        let args = to_args(&["-j", "list", "table", "ip", TABLE]);
        match self.run(args).await {
            Ok(out) => Ok(parse_stats_json(&String::from_utf8_lossy(&out.stdout))?),
            // No table yet means no rules were ever appended.
            Err(BackendError::CommandFailed { ref stderr, .. })
                if stderr.contains("No such file or directory") =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(HarnessError::Backend(e)),
        }
    }

    pub async fn flush(&self) -> Result<()> {
        let args = to_args(&["delete", "table", "ip", TABLE]);
        match self.run(args).await {
            Ok(_) => Ok(()),
            Err(BackendError::CommandFailed { ref stderr, .. })
                if stderr.contains("No such file or directory") =>
            {
                Ok(())
            }
            Err(e) => Err(HarnessError::Backend(e)),
        }
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn base_hook(chain: &str) -> Option<&'static str> {
    match chain.to_ascii_lowercase().as_str() {
        "input" => Some("input"),
        "output" => Some("output"),
        "forward" => Some("forward"),
        "prerouting" => Some("prerouting"),
        "postrouting" => Some("postrouting"),
        _ => None,
    }
}

/// Parse `nft -j list table` output. Chains and rules appear in the
/// `nftables` array in definition order, which for rules is installation
/// order.
pub(crate) fn parse_stats_json(text: &str) -> Result<Vec<ChainStats>, ParseError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ParseError::new(format!("invalid JSON from nft: {e}")))?;
    let items = value
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| ParseError::new("missing 'nftables' array"))?;

    let mut chains: Vec<ChainStats> = Vec::new();

    for item in items {
        if let Some(chain) = item.get("chain") {
            let name = chain
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ParseError::new("chain object without a name"))?;
            chains.push(ChainStats {
                name: name.to_string(),
                rules: Vec::new(),
            });
        } else if let Some(rule) = item.get("rule") {
            let chain_name = rule
                .get("chain")
                .and_then(Value::as_str)
                .ok_or_else(|| ParseError::new("rule object without a chain"))?;
            let chain = chains
                .iter_mut()
                .find(|c| c.name == chain_name)
                .ok_or_else(|| {
                    ParseError::new(format!("rule references unknown chain '{chain_name}'"))
                })?;

            let exprs = rule
                .get("expr")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            let (packets, bytes) = exprs
                .iter()
                .find_map(|e| e.get("counter"))
                .map(|c| {
                    (
                        c.get("packets").and_then(Value::as_u64).unwrap_or(0),
                        c.get("bytes").and_then(Value::as_u64).unwrap_or(0),
                    )
                })
                .unwrap_or((0, 0));

            let target = exprs
                .iter()
                .rev()
                .find_map(verdict_name)
                .unwrap_or_default();

            let detail = exprs
                .iter()
                .filter(|e| e.get("counter").is_none())
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(" ");

            chain.rules.push(RuleStats {
                packets,
                bytes,
                target,
                detail,
            });
        }
        // table/metainfo objects carry no counter state
    }

    Ok(chains)
}

fn verdict_name(expr: &Value) -> Option<String> {
    let obj = expr.as_object()?;
    for key in ["drop", "accept", "reject", "jump", "goto", "return"] {
        if obj.contains_key(key) {
            return Some(key.to_ascii_uppercase());
        }
    }
    None
}
