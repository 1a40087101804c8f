//! # drover Agent Entry Point
//!
//! Starts one agent, wires the default HTTP server pool and task
//! supervisor, and runs until Ctrl-C.
//!
//! ```text
//! drover-agent --server 10.0.0.1:4647 --state-dir /var/lib/drover \
//!              --region eu --meta rack=r12
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use drover_agent::supervisor_factory;
use drover_agent::{Agent, Config, HttpServerPool};
use drover_common::Node;

/// drover agent — registers this machine with the drover servers and
/// supervises the replication allocations placed on it.
#[derive(Parser)]
#[command(name = "drover-agent", version, about)]
struct Cli {
    /// Directory for agent state; a temp dir when omitted.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Root for allocation working directories; a temp dir when omitted.
    #[arg(long)]
    alloc_dir: Option<PathBuf>,

    /// Region to register into.
    #[arg(long, default_value = "global")]
    region: String,

    /// Datacenter of this node.
    #[arg(long, default_value = "dc1")]
    datacenter: String,

    /// Node name; defaults to the hostname.
    #[arg(long)]
    node_name: Option<String>,

    /// Server address to contact (repeatable).
    #[arg(long = "server")]
    servers: Vec<String>,

    /// Dev mode: no persistence, in-process-friendly retry intervals.
    #[arg(long)]
    dev: bool,

    /// Port to reserve on every network device (repeatable).
    #[arg(long = "reserved-port")]
    reserved_ports: Vec<u16>,

    /// Seconds between host resource-usage collections.
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,

    /// Node meta entry as key=value (repeatable).
    #[arg(long = "meta", value_parser = parse_key_value)]
    meta: Vec<(String, String)>,

    /// Agent option as key=value (repeatable), e.g.
    /// `fingerprint.whitelist=arch,cpu`.
    #[arg(long = "option", value_parser = parse_key_value)]
    options: Vec<(String, String)>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let node = Node {
        datacenter: cli.datacenter,
        name: cli.node_name.unwrap_or_default(),
        meta: cli.meta.into_iter().collect::<HashMap<_, _>>(),
        ..Node::default()
    };
    let config = Config {
        state_dir: cli.state_dir,
        alloc_dir: cli.alloc_dir,
        region: cli.region,
        servers: cli.servers,
        dev_mode: cli.dev,
        globally_reserved_ports: cli.reserved_ports,
        stats_collection_interval: Duration::from_secs(cli.stats_interval.max(1)),
        options: cli.options.into_iter().collect(),
        node: Some(node),
    };

    let agent = Agent::new(
        config,
        Arc::new(HttpServerPool::new()),
        None,
        supervisor_factory(),
    )
    .await
    .context("agent startup failed")?;
    info!(node_id = %agent.node().id, "agent started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    agent.shutdown().await.context("agent shutdown failed")?;
    Ok(())
}
