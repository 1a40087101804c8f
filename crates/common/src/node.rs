//! # Node Model & Lifecycle Status
//!
//! Defines the node structure every drover agent registers with the
//! control-plane servers, along with its resource inventory and the
//! small set of lifecycle states the servers track for it.
//!
//! ## States
//!
//! | Status | Meaning | Schedulable |
//! |--------|---------|-------------|
//! | `Init` | Agent booted, registration not yet acknowledged | No |
//! | `Ready` | Registered and heartbeating | **Yes** |
//! | `Down` | Servers stopped receiving heartbeats | No |
//!
//! The agent itself only ever reports `init` (before first registration)
//! and `ready` (after). `down` is assigned server-side when the heartbeat
//! TTL lapses; it appears here so responses deserialize losslessly.
//!
//! ## Invariants
//!
//! - `attributes`, `meta`, and `links` are always present (possibly empty)
//!   maps — consumers never need to null-check them.
//! - `id` is generated once per node and survives agent restarts unless
//!   the agent runs in dev mode.
//! - `reserved.networks` is keyed by IP: at most one entry per address,
//!   each carrying a merged, duplicate-free reserved-port list.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════════════════
// NODE STATUS
// ════════════════════════════════════════════════════════════════════════════

/// Lifecycle status of a drover node as reported to the servers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Agent started, registration not yet acknowledged by the servers.
    #[default]
    Init,
    /// Registered and heartbeating; eligible for allocations.
    Ready,
    /// Heartbeat TTL lapsed; assigned server-side only.
    Down,
}

impl NodeStatus {
    /// The wire string for this status (`init`, `ready`, `down`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Init => "init",
            NodeStatus::Ready => "ready",
            NodeStatus::Down => "down",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// RESOURCES
// ════════════════════════════════════════════════════════════════════════════

/// A single reservable port on a network device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    #[serde(rename = "Value")]
    pub value: u16,
}

/// A fingerprinted network device and the ports reserved on it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkResource {
    /// Device name, e.g. `eth0`.
    pub device: String,
    /// CIDR of the attached subnet, if known.
    pub cidr: String,
    /// Address the device answers on; the key for reservation merging.
    #[serde(rename = "IP")]
    pub ip: String,
    /// Link bandwidth in megabits.
    pub mbits: u32,
    pub reserved_ports: Vec<Port>,
}

impl NetworkResource {
    /// Copy of this device suitable for a reservation entry: same
    /// identity, no bandwidth claim.
    #[must_use]
    pub fn reservation_copy(&self) -> NetworkResource {
        let mut copy = self.clone();
        copy.mbits = 0;
        copy
    }

    /// Adds `port` to the reserved list unless it is already present.
    pub fn reserve_port(&mut self, port: u16) {
        let p = Port { value: port };
        if !self.reserved_ports.contains(&p) {
            self.reserved_ports.push(p);
        }
    }
}

/// Compute, memory, disk, and network inventory for a node.
///
/// Used both for the fingerprinted totals (`Node::resources`) and for the
/// operator-reserved share (`Node::reserved`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resources {
    /// Total compute in MHz.
    #[serde(rename = "CPU")]
    pub cpu: u64,
    /// Memory in MB.
    #[serde(rename = "MemoryMB")]
    pub memory_mb: u64,
    /// Scratch disk in MB.
    #[serde(rename = "DiskMB")]
    pub disk_mb: u64,
    pub networks: Vec<NetworkResource>,
}

// ════════════════════════════════════════════════════════════════════════════
// NODE
// ════════════════════════════════════════════════════════════════════════════

/// A worker node as registered with the drover servers.
///
/// Built once at agent start and mutated only under the agent's config
/// write lock: fingerprinters add attributes and resources, registration
/// flips the status, and the node-change watcher re-registers when the
/// attribute or meta maps drift.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    /// Stable unique identifier, persisted across restarts (non-dev).
    #[serde(rename = "ID")]
    pub id: String,
    /// Human-readable name; hostname when available, else the ID.
    pub name: String,
    /// Datacenter the node belongs to; defaults to `dc1`.
    pub datacenter: String,
    /// Region the node registers into.
    pub region: String,
    pub status: NodeStatus,
    /// Fingerprinted attributes (`arch`, `cpu.numcores`, …).
    pub attributes: HashMap<String, String>,
    /// Operator-set metadata, forwarded verbatim to the servers.
    pub meta: HashMap<String, String>,
    /// Named links to sibling services on this machine.
    pub links: HashMap<String, String>,
    /// Fingerprinted resource totals.
    pub resources: Resources,
    /// Operator-reserved resources, excluded from scheduling.
    pub reserved: Resources,
}
