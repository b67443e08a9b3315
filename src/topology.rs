//! Virtual network topology: veth pairs with the receive side isolated in a
//! dedicated network namespace.
//!
//! The injection (`host`) end of every pair stays in the host namespace so
//! the transport can open a raw socket on it; the `peer` end lives inside
//! the scenario's namespace, where the filtering backend's INPUT hook sees
//! and counts arriving packets. Construction and destruction are paired:
//! `Drop` repeats the best-effort teardown so a panicking scenario still
//! releases every device.

use std::net::Ipv4Addr;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::config::HarnessConfig;
use crate::error::ResourceError;
use crate::utils::{clamp_ifname, unique_token};

/// Consecutive failed teardowns before the harness refuses to start new
/// scenarios (resource exhaustion escalation).
pub const TEARDOWN_FAILURE_LIMIT: u32 = 3;

static TEARDOWN_FAILURES: AtomicU32 = AtomicU32::new(0);

/// One side of a veth pair.
#[derive(Debug, Clone)]
pub struct Endpoint {
    name: String,
    peer_name: String,
    ip: Ipv4Addr,
    mac: [u8; 6],
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the endpoint this one is wired to.
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }
}

/// A point-to-point link: `host` end in the host namespace, `peer` end in
/// the scenario namespace.
#[derive(Debug, Clone)]
pub struct LinkPair {
    pub host: Endpoint,
    pub peer: Endpoint,
}

/// All endpoint pairs of one scenario, created together and torn down
/// together.
#[derive(Debug)]
pub struct Topology {
    netns: String,
    pairs: Vec<LinkPair>,
    destroyed: bool,
}

impl Topology {
    /// Allocate `pair_count` veth pairs with deterministic, collision-free
    /// names and bring every end up.
    pub fn create(config: &HarnessConfig, pair_count: usize) -> Result<Self, ResourceError> {
        assert!(pair_count > 0, "need at least one endpoint pair");

        let token = unique_token();
        let netns = clamp_ifname(&format!("{}ns{token}", config.iface_prefix));

        let mut topo = Self {
            netns,
            pairs: Vec::with_capacity(pair_count),
            destroyed: false,
        };

        if let Err(e) = topo.setup(config, pair_count, &token) {
            // Partial allocations must not leak.
            let _ = topo.teardown_best_effort();
            topo.destroyed = true;
            return Err(e);
        }

        Ok(topo)
    }

    fn setup(
        &mut self,
        config: &HarnessConfig,
        pair_count: usize,
        token: &str,
    ) -> Result<(), ResourceError> {
        // Clean up a stale namespace with the same name (idempotent)
        let _ = ip(&["netns", "del", &self.netns]);

        ip_checked(&["netns", "add", &self.netns])?;
        debug!(ns = %self.netns, "created network namespace");

        // Loopback inside the namespace. Best-effort, failure is non-fatal
        let _ = ip_in_ns(&self.netns, &["link", "set", "lo", "up"]);

        for i in 0..pair_count {
            let host_name = clamp_ifname(&format!("{}{token}a{i}", config.iface_prefix));
            let peer_name = clamp_ifname(&format!("{}{token}b{i}", config.iface_prefix));
            let subnet = (i + 1) as u8;
            let host_ip = Ipv4Addr::new(10, config.subnet_base, subnet, 1);
            let peer_ip = Ipv4Addr::new(10, config.subnet_base, subnet, 2);
            let host_mac = [0x52, 0x54, 0x00, 0xfb, subnet, 0x01];
            let peer_mac = [0x52, 0x54, 0x00, 0xfb, subnet, 0x02];

            // Clean up stale veth (idempotent)
            let _ = ip(&["link", "del", &host_name]);

            ip_checked(&[
                "link", "add", &host_name, "type", "veth", "peer", "name", &peer_name,
            ])?;
            debug!(host = %host_name, peer = %peer_name, "created veth pair");

            // Deterministic MACs so packet addressing derives from endpoint
            // registration alone.
            ip_checked(&["link", "set", &host_name, "address", &format_mac(host_mac)])?;
            ip_checked(&["link", "set", &peer_name, "address", &format_mac(peer_mac)])?;

            // Move the peer end into the scenario namespace
            ip_checked(&["link", "set", &peer_name, "netns", &self.netns])?;

            // Configure the host end
            ip_checked(&["addr", "add", &format!("{host_ip}/24"), "dev", &host_name])?;
            ip_checked(&["link", "set", &host_name, "up"])?;

            // Configure the namespaced end
            ip_in_ns_checked(
                &self.netns,
                &["addr", "add", &format!("{peer_ip}/24"), "dev", &peer_name],
            )?;
            ip_in_ns_checked(&self.netns, &["link", "set", &peer_name, "up"])?;

            debug!(
                ns = %self.netns,
                %host_ip,
                %peer_ip,
                "veth link configured"
            );

            self.pairs.push(LinkPair {
                host: Endpoint {
                    name: host_name.clone(),
                    peer_name: peer_name.clone(),
                    ip: host_ip,
                    mac: host_mac,
                },
                peer: Endpoint {
                    name: peer_name,
                    peer_name: host_name,
                    ip: peer_ip,
                    mac: peer_mac,
                },
            });
        }

        Ok(())
    }

    /// Name of the scenario's network namespace. Backend commands run
    /// inside it so rule state is naturally per-scenario.
    pub fn netns(&self) -> &str {
        &self.netns
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn pairs(&self) -> &[LinkPair] {
        &self.pairs
    }

    /// Host-side (injection) endpoint of pair `i`.
    pub fn host(&self, i: usize) -> &Endpoint {
        &self.pairs[i].host
    }

    /// Namespaced (filtered-ingress) endpoint of pair `i`.
    pub fn peer(&self, i: usize) -> &Endpoint {
        &self.pairs[i].peer
    }

    /// Remove every endpoint created by this topology. Idempotent;
    /// partially-missing resources are not an error.
    pub fn destroy(&mut self) -> Result<(), ResourceError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        match self.teardown_best_effort() {
            Ok(()) => {
                TEARDOWN_FAILURES.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let failures = TEARDOWN_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(ns = %self.netns, %failures, "teardown failed: {e}");
                Err(e)
            }
        }
    }

    /// Delete the namespace (which destroys the veth pairs whose peer end
    /// lives inside it) and sweep any host-side leftovers. Retries once on
    /// a busy resource before giving up.
    fn teardown_best_effort(&self) -> Result<(), ResourceError> {
        let mut first_err = None;

        let mut attempt = 0;
        let ns_result = loop {
            let out = ip(&["netns", "del", &self.netns])?;
            if out.status.success() || stderr_means_missing(&out) {
                break Ok(());
            }
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            if attempt == 0 && stderr.contains("busy") {
                attempt += 1;
                std::thread::sleep(std::time::Duration::from_millis(200));
                continue;
            }
            break Err(ResourceError::Teardown {
                command: format!("ip netns del {}", self.netns),
                stderr,
            });
        };
        if let Err(e) = ns_result {
            first_err = Some(e);
        }

        // Host-side link ends disappear with their namespaced peers; sweep
        // anyway in case the move into the namespace never happened.
        for pair in &self.pairs {
            let out = ip(&["link", "del", &pair.host.name])?;
            if !out.status.success() && !stderr_means_missing(&out) && first_err.is_none() {
                first_err = Some(ResourceError::Teardown {
                    command: format!("ip link del {}", pair.host.name),
                    stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
                });
            }
        }

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        if !self.destroyed {
            debug!(ns = %self.netns, "topology dropped without explicit destroy");
            let _ = self.destroy();
        }
    }
}

/// True when the harness should refuse to start new scenarios because
/// previous teardowns kept failing.
pub fn teardown_exhausted() -> Option<u32> {
    let failures = TEARDOWN_FAILURES.load(Ordering::Relaxed);
    (failures >= TEARDOWN_FAILURE_LIMIT).then_some(failures)
}

/// Does a device with this name exist in the host namespace?
pub fn device_exists(name: &str) -> bool {
    ip(&["link", "show", name]).is_ok_and(|out| out.status.success())
}

/// Run a command inside the topology's namespace, returning raw output.
pub(crate) fn ip_in_ns(ns: &str, args: &[&str]) -> Result<Output, ResourceError> {
    let mut full: Vec<&str> = vec!["netns", "exec", ns, "ip"];
    full.extend_from_slice(args);
    ip(&full)
}

fn ip_in_ns_checked(ns: &str, args: &[&str]) -> Result<Output, ResourceError> {
    let out = ip_in_ns(ns, args)?;
    if out.status.success() {
        Ok(out)
    } else {
        Err(ResourceError::Setup {
            command: format!("ip netns exec {ns} ip {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}

/// Run `ip <args>`, returning raw output.
fn ip(args: &[&str]) -> Result<Output, ResourceError> {
    Command::new("ip")
        .args(args)
        .output()
        .map_err(|source| ResourceError::Spawn {
            command: format!("ip {}", args.join(" ")),
            source,
        })
}

/// Run `ip <args>`, failing with stderr if it exits non-zero.
fn ip_checked(args: &[&str]) -> Result<Output, ResourceError> {
    let out = ip(args)?;
    if out.status.success() {
        Ok(out)
    } else {
        Err(ResourceError::Setup {
            command: format!("ip {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}

fn stderr_means_missing(out: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&out.stderr);
    stderr.contains("No such file or directory")
        || stderr.contains("Cannot find device")
        || stderr.contains("does not exist")
}

fn format_mac(mac: [u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
