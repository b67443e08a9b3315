//! iptables-compatible backend.
//!
//! Works with legacy iptables, iptables-nft, and engine-provided
//! iptables-syntax frontends: the program path is configurable and the
//! invocation contract is just `-A`/`-F` plus `-L -nvx` for counters.

use std::path::{Path, PathBuf};

use crate::error::{ParseError, Result};

use super::{ChainStats, RuleStats, run_backend, split_expression};

#[derive(Debug, Clone)]
pub struct IptablesBackend {
    program: PathBuf,
    netns: Option<String>,
}

impl IptablesBackend {
    pub fn new(program: impl Into<PathBuf>, netns: Option<String>) -> Self {
        Self {
            program: program.into(),
            netns,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Argv (after the program) for appending `expression` to `chain`.
    /// Expression tokens pass through verbatim.
    pub fn append_args(chain: &str, expression: &str) -> Vec<String> {
        let mut args = vec!["-A".to_string(), chain.to_string()];
        args.extend(split_expression(expression).map(str::to_string));
        args
    }

    pub async fn append_rule(&self, chain: &str, expression: &str) -> Result<()> {
        let args = Self::append_args(chain, expression);
        run_backend(&self.program, self.netns.as_deref(), &args).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<Vec<ChainStats>> {
        let args: Vec<String> = ["-L", "-nvx"].iter().map(|s| s.to_string()).collect();
        let out = run_backend(&self.program, self.netns.as_deref(), &args).await?;
        Ok(parse_stats(&String::from_utf8_lossy(&out.stdout))?)
    }

    pub async fn flush(&self) -> Result<()> {
        let args = vec!["-F".to_string()];
        run_backend(&self.program, self.netns.as_deref(), &args).await?;
        Ok(())
    }
}

/// Parse `iptables -L -nvx` output into ordered per-chain stats.
///
/// Tolerates column-width variation between iptables versions; the parts we
/// rely on are the `Chain <name> (...)` headers, the `pkts bytes ...`
/// column header, and the first two numeric columns of each rule line.
pub(crate) fn parse_stats(text: &str) -> Result<Vec<ChainStats>, ParseError> {
    let mut chains: Vec<ChainStats> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("Chain ") {
            let name = rest
                .split_whitespace()
                .next()
                .ok_or_else(|| ParseError::in_line("chain header without a name", line))?;
            chains.push(ChainStats {
                name: name.to_string(),
                rules: Vec::new(),
            });
            continue;
        }

        if trimmed.starts_with("pkts") {
            continue; // column header
        }

        let chain = chains
            .last_mut()
            .ok_or_else(|| ParseError::in_line("rule line before any chain header", line))?;

        let mut tokens = trimmed.split_whitespace();
        let pkts = tokens
            .next()
            .ok_or_else(|| ParseError::in_line("rule line without counters", line))?;
        let bytes = tokens
            .next()
            .ok_or_else(|| ParseError::in_line("rule line without a byte counter", line))?;

        let packets: u64 = pkts
            .parse()
            .map_err(|_| ParseError::in_line("packet counter is not an integer", line))?;
        let bytes: u64 = bytes
            .parse()
            .map_err(|_| ParseError::in_line("byte counter is not an integer", line))?;

        let target = tokens.next().unwrap_or("").to_string();
        let detail = tokens.collect::<Vec<_>>().join(" ");

        chain.rules.push(RuleStats {
            packets,
            bytes,
            target,
            detail,
        });
    }

    Ok(chains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::find_chain;

    const SAMPLE: &str = "\
Chain INPUT (policy ACCEPT 12 packets, 2048 bytes)
    pkts      bytes target     prot opt in     out     source               destination
       1       76 DROP       icmp --  fpb0   *       0.0.0.0/0            0.0.0.0/0
       0        0 ACCEPT     udp  --  *      *       0.0.0.0/0            0.0.0.0/0            udp dpt:9

Chain FORWARD (policy ACCEPT 0 packets, 0 bytes)
    pkts      bytes target     prot opt in     out     source               destination

Chain OUTPUT (policy ACCEPT 3 packets, 228 bytes)
    pkts      bytes target     prot opt in     out     source               destination
     999 12345678 DROP       all  --  *      fpb1    0.0.0.0/0            0.0.0.0/0
";

    #[test]
    fn append_rule_argv_matches_cli_contract() {
        // `iptables -A INPUT -p icmp -i <dev> -j DROP`, tokens untouched.
        let args = IptablesBackend::append_args("INPUT", "-p icmp -i fpb0 -j DROP");
        assert_eq!(args, ["-A", "INPUT", "-p", "icmp", "-i", "fpb0", "-j", "DROP"]);
    }

    #[test]
    fn parses_chains_in_order_with_exact_counters() {
        let stats = parse_stats(SAMPLE).unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].name, "INPUT");
        assert_eq!(stats[1].name, "FORWARD");
        assert_eq!(stats[2].name, "OUTPUT");

        let input = find_chain(&stats, "INPUT").unwrap();
        assert_eq!(input.rules.len(), 2);
        assert_eq!(input.rules[0].packets, 1);
        assert_eq!(input.rules[0].bytes, 76);
        assert_eq!(input.rules[0].target, "DROP");
        assert_eq!(input.rules[1].packets, 0);
        assert_eq!(input.rules[1].target, "ACCEPT");

        assert!(find_chain(&stats, "FORWARD").unwrap().rules.is_empty());

        let output = find_chain(&stats, "OUTPUT").unwrap();
        assert_eq!(output.rules[0].packets, 999);
        assert_eq!(output.rules[0].bytes, 12_345_678);
    }

    #[test]
    fn rule_detail_keeps_match_text() {
        let stats = parse_stats(SAMPLE).unwrap();
        let input = find_chain(&stats, "INPUT").unwrap();
        assert!(input.rules[0].detail.contains("fpb0"));
        assert!(input.rules[1].detail.contains("udp dpt:9"));
    }

    #[test]
    fn empty_output_yields_no_chains() {
        assert!(parse_stats("").unwrap().is_empty());
    }

    #[test]
    fn human_readable_counters_are_rejected() {
        // Without -x iptables abbreviates counters; that shape must not be
        // silently misread.
        let text = "\
Chain INPUT (policy ACCEPT 0 packets, 0 bytes)
    pkts      bytes target     prot opt in     out     source               destination
    105K 12M DROP       icmp --  *      *       0.0.0.0/0            0.0.0.0/0
";
        let err = parse_stats(text).unwrap_err();
        assert!(err.reason.contains("not an integer"));
    }

    #[test]
    fn rule_before_chain_header_is_rejected() {
        let err = parse_stats("       1       76 DROP icmp\n").unwrap_err();
        assert!(err.reason.contains("before any chain header"));
    }

    #[test]
    fn stats_read_is_a_pure_snapshot() {
        // Parsing the same text twice yields identical records.
        let a = parse_stats(SAMPLE).unwrap();
        let b = parse_stats(SAMPLE).unwrap();
        assert_eq!(a, b);
    }
}
