use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for the binary (non-Windows only)
#[cfg(not(windows))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

use fwprobe::backend::BackendKind;
use fwprobe::config::HarnessConfig;
use fwprobe::{runner, scenario};

#[derive(Parser, Debug)]
#[command(
    name = "fwprobe",
    author,
    version,
    disable_version_flag = true,
    about = "Packet-filter rule verification harness",
    override_usage = "fwprobe [OPTIONS] [SCENARIOS]..."
)]
struct Cli {
    /// Print the version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::SetTrue)]
    print_version: bool,

    /// Scenarios to run (default: all; see --list)
    scenarios: Vec<String>,

    /// List available scenarios and exit
    #[arg(long = "list")]
    list: bool,

    /// Rule-management backend driving the engine under test
    #[arg(long = "backend", value_enum, default_value = "iptables")]
    backend: BackendKind,

    /// Path to the rule-management program (e.g. an engine-provided
    /// iptables frontend)
    #[arg(long = "program")]
    program: Option<PathBuf>,

    /// How long to wait for a reply before treating the packet as dropped
    #[arg(long = "send-timeout-ms", default_value = "2000")]
    send_timeout_ms: u64,

    /// Upper bound on waiting for backend counters to settle
    #[arg(long = "settle-timeout-ms", default_value = "1000")]
    settle_timeout_ms: u64,

    /// Emit the run report as JSON
    #[arg(long = "json")]
    json: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Cli::parse();
    if args.print_version {
        let version = env!("CARGO_PKG_VERSION");
        let git_hash = env!("GIT_HASH");
        let git_branch = env!("GIT_BRANCH");
        let git_dirty = env!("GIT_DIRTY");

        println!(
            "{} ({}@{}{}) [{}]",
            version,
            git_branch,
            git_hash,
            git_dirty,
            env!("CARGO_PKG_NAME")
        );
        return Ok(());
    }

    if args.list {
        for name in runner::ALL_SCENARIOS {
            println!("{name}");
        }
        return Ok(());
    }

    let config = HarnessConfig::from_cli(args.program, args.send_timeout_ms, args.settle_timeout_ms);

    // The runner would skip every scenario anyway; fail loudly instead so
    // a misconfigured CI host is visible.
    if let Err(reason) = scenario::check_harness_deps(args.backend, &config) {
        eprintln!("fwprobe cannot run here: {reason}");
        std::process::exit(2);
    }

    let names: Vec<&str> = if args.scenarios.is_empty() {
        runner::ALL_SCENARIOS.to_vec()
    } else {
        args.scenarios.iter().map(String::as_str).collect()
    };

    let reports = runner::run_selected(&config, args.backend, &names).await?;
    if args.json {
        println!("{}", runner::report_json(&reports));
    } else {
        runner::print_report(&reports);
    }

    if reports.iter().any(|r| r.failed()) {
        std::process::exit(1);
    }
    Ok(())
}
