//! Counter semantics and lifecycle guarantees.
//!
//! Stats reads must be idempotent, rule order must survive the round trip
//! through the backend, and topology endpoints must be gone after every
//! scenario, including ones that fail or panic.

mod common;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use fwprobe::backend::{BackendKind, find_chain};
use fwprobe::packet::ProtocolKind;
use fwprobe::scenario::run_scenario;
use fwprobe::topology::device_exists;

#[tokio::test]
async fn stats_read_is_idempotent() -> Result<()> {
    if common::skip_without_deps(BackendKind::Iptables) {
        return Ok(());
    }

    let config = common::test_config();
    run_scenario(
        "stats_idempotent",
        &config,
        BackendKind::Iptables,
        1,
        async |ctx| {
            let expr = format!("-p icmp -i {} -j DROP", ctx.peer(0).name());
            ctx.append_rule("INPUT", &expr).await?;

            let packet =
                ctx.build_packet(ProtocolKind::IcmpEchoRequest, ctx.host(0), ctx.peer(0));
            let mut transport = ctx.transport(ctx.host(0))?;
            let _ = transport
                .send_and_wait(&packet, ctx.config().send_timeout)
                .await?;

            let first = ctx.stats().await?;
            let second = ctx.stats().await?;
            assert_eq!(first, second, "stats changed with no intervening traffic");
            Ok(())
        },
    )
    .await
}

#[tokio::test]
async fn rule_order_is_preserved() -> Result<()> {
    if common::skip_without_deps(BackendKind::Iptables) {
        return Ok(());
    }

    let config = common::test_config();
    run_scenario(
        "rule_order",
        &config,
        BackendKind::Iptables,
        1,
        async |ctx| {
            let iface = ctx.peer(0).name().to_string();
            let dports = [9001u16, 9002, 9003];
            for dport in dports {
                let expr = format!("-p udp -i {iface} --dport {dport} -j DROP");
                ctx.append_rule("INPUT", &expr).await?;
            }

            let stats = ctx.stats().await?;
            let input = find_chain(&stats, "INPUT").expect("INPUT chain in stats");
            assert_eq!(input.rules.len(), dports.len());
            for (i, dport) in dports.iter().enumerate() {
                assert!(
                    input.rules[i].detail.contains(&dport.to_string()),
                    "rule {i} does not mention port {dport}: {:?}",
                    input.rules[i].detail
                );
            }
            Ok(())
        },
    )
    .await
}

#[tokio::test]
async fn topology_is_gone_after_failing_scenario() -> Result<()> {
    if common::skip_without_deps(BackendKind::Iptables) {
        return Ok(());
    }

    let config = common::test_config();
    let host_name = Arc::new(Mutex::new(String::new()));
    let captured = Arc::clone(&host_name);

    let result = run_scenario(
        "synthetic_failure",
        &config,
        BackendKind::Iptables,
        1,
        async |ctx| {
            *captured.lock().unwrap() = ctx.host(0).name().to_string();
            anyhow::bail!("synthetic failure");
        },
    )
    .await;

    assert!(result.is_err(), "scenario error must propagate");
    let name = host_name.lock().unwrap().clone();
    assert!(!name.is_empty(), "scenario body never ran");
    assert!(
        !device_exists(&name),
        "endpoint '{name}' left behind after failing scenario"
    );
    Ok(())
}

#[tokio::test]
async fn topology_is_gone_after_panicking_scenario() {
    if common::skip_without_deps(BackendKind::Iptables) {
        return;
    }

    let config = common::test_config();
    let host_name = Arc::new(Mutex::new(String::new()));
    let captured = Arc::clone(&host_name);

    let joined = tokio::spawn(async move {
        run_scenario(
            "synthetic_panic",
            &config,
            BackendKind::Iptables,
            1,
            async |ctx| {
                *captured.lock().unwrap() = ctx.host(0).name().to_string();
                panic!("synthetic panic");
            },
        )
        .await
    })
    .await;

    assert!(joined.is_err(), "panic should surface as a join error");
    let name = host_name.lock().unwrap().clone();
    assert!(!name.is_empty(), "scenario body never ran");
    assert!(
        !device_exists(&name),
        "endpoint '{name}' left behind after panicking scenario"
    );
}

#[tokio::test]
async fn scenarios_are_isolated_from_each_other() -> Result<()> {
    if common::skip_without_deps(BackendKind::Iptables) {
        return Ok(());
    }

    let config = common::test_config();

    // First scenario installs a rule and ends.
    run_scenario("isolation_a", &config, BackendKind::Iptables, 1, async |ctx| {
        let expr = format!("-p icmp -i {} -j DROP", ctx.peer(0).name());
        ctx.append_rule("INPUT", &expr).await?;
        Ok(())
    })
    .await?;

    // The next scenario must start from an empty ruleset.
    run_scenario("isolation_b", &config, BackendKind::Iptables, 1, async |ctx| {
        let stats = ctx.stats().await?;
        let leaked: usize = stats.iter().map(|c| c.rules.len()).sum();
        assert_eq!(leaked, 0, "rule state leaked between scenarios: {stats:?}");
        Ok(())
    })
    .await
}
