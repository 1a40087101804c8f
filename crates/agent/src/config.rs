//! # Agent Configuration
//!
//! The operator-supplied configuration for one agent process, plus the
//! immutable snapshot handed to allocation runners.
//!
//! ## Snapshot model
//!
//! The live `Config` and `Node` are guarded by the agent's config lock
//! and mutate over time (fingerprints, registration, node-change
//! detection). Runners must never synchronize with those writers, so the
//! agent maintains an `Arc<AgentSnapshot>` copy that is rebuilt under the
//! write lock on every node change and shared copy-on-write from then on.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use drover_common::Node;

/// Default interval between host resource-usage collections.
pub const DEFAULT_STATS_COLLECTION_INTERVAL: Duration = Duration::from_secs(10);

/// Operator configuration for the agent core.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory for agent state (`client-id`, per-alloc runner state).
    /// Auto-assigned a temp directory when unset.
    pub state_dir: Option<PathBuf>,
    /// Root for per-allocation working directories. Auto-assigned a temp
    /// directory when unset.
    pub alloc_dir: Option<PathBuf>,
    /// Region the node registers into.
    pub region: String,
    /// Initial primary server addresses (`host:port`).
    pub servers: Vec<String>,
    /// Dev mode: no persistence, fresh node ID per run, tight retry
    /// intervals, in-process RPC allowed.
    pub dev_mode: bool,
    /// Ports reserved on every fingerprinted network device.
    pub globally_reserved_ports: Vec<u16>,
    pub stats_collection_interval: Duration,
    /// Free-form option strings, e.g. `fingerprint.whitelist`.
    pub options: HashMap<String, String>,
    /// Operator-seeded node fields (datacenter, name, meta). The agent
    /// fills in everything else.
    pub node: Option<Node>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            state_dir: None,
            alloc_dir: None,
            region: "global".to_string(),
            servers: Vec::new(),
            dev_mode: false,
            globally_reserved_ports: Vec::new(),
            stats_collection_interval: DEFAULT_STATS_COLLECTION_INTERVAL,
            options: HashMap::new(),
            node: None,
        }
    }
}

impl Config {
    /// Parses the option string under `key` as a comma- or
    /// whitespace-separated list into a set. Missing key → empty set.
    #[must_use]
    pub fn read_string_list_to_map(&self, key: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        if let Some(raw) = self.options.get(key) {
            for part in raw.split([',', ' ', '\t']) {
                let trimmed = part.trim();
                if !trimmed.is_empty() {
                    out.insert(trimmed.to_string());
                }
            }
        }
        out
    }
}

/// Immutable view of the config and node, shared with runners.
///
/// Rebuilt (not mutated) whenever the node changes; holders keep reading
/// their old copy without coordination.
#[derive(Clone, Debug)]
pub struct AgentSnapshot {
    pub config: Config,
    pub node: Node,
}
