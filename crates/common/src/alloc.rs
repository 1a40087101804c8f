//! # Allocation Model
//!
//! An allocation is the unit of replication work a server places on a
//! node: an opaque payload of tasks plus the bookkeeping the agent needs
//! to supervise it. The agent core reads only four things from the
//! server-desired view — the ID, the predecessor link, the server-assigned
//! modify index, and whether the allocation is terminal. Everything else
//! is owned either by the servers or by the per-allocation runner.
//!
//! ## Client status
//!
//! `pending → running → {complete | failed | lost}`. The three right-hand
//! states are terminal: once an allocation reports one of them it never
//! leaves it, and any successor chained onto it may start.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════════════════
// CLIENT STATUS
// ════════════════════════════════════════════════════════════════════════════

/// Client-side status of an allocation, owned by the agent and synced
/// to the servers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocClientStatus {
    /// Runner created, no task has started yet.
    #[default]
    Pending,
    /// At least one task is executing.
    Running,
    /// All tasks finished successfully.
    Complete,
    /// A task failed permanently.
    Failed,
    /// The node was lost while the allocation ran; assigned server-side.
    Lost,
}

impl AllocClientStatus {
    /// Whether this status is terminal (`complete`, `failed`, or `lost`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocClientStatus::Complete | AllocClientStatus::Failed | AllocClientStatus::Lost
        )
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TASK STATE
// ════════════════════════════════════════════════════════════════════════════

/// Per-task state inside an allocation, reported by the runner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    /// Coarse state string: `pending`, `running`, or `dead`.
    pub state: String,
    /// Whether the task exited with a failure.
    pub failed: bool,
}

// ════════════════════════════════════════════════════════════════════════════
// ALLOCATION
// ════════════════════════════════════════════════════════════════════════════

/// A unit of replication work assigned by the servers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Allocation {
    #[serde(rename = "ID")]
    pub id: String,
    /// Node this allocation was placed on.
    #[serde(rename = "NodeID")]
    pub node_id: String,
    /// Predecessor in a replacement chain; this allocation must not start
    /// until the predecessor is terminal on the same node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_allocation: Option<String>,
    /// Server-monotonic index bumped on every server-side modification.
    pub alloc_modify_index: u64,
    pub client_status: AllocClientStatus,
    /// Free-form explanation for the current client status.
    #[serde(default)]
    pub client_description: String,
    #[serde(default)]
    pub task_states: HashMap<String, TaskState>,
    /// Opaque task/resource/constraint payload; interpreted only by the
    /// per-allocation runner.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Allocation {
    /// Whether the allocation has reached a terminal client status.
    #[must_use]
    pub fn terminated(&self) -> bool {
        self.client_status.is_terminal()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// STATUS UPDATE
// ════════════════════════════════════════════════════════════════════════════

/// The client-owned slice of an allocation, sent back to the servers.
///
/// Runners emit these as their tasks progress; the agent batches them
/// last-writer-wins per allocation ID before pushing a `Node.UpdateAlloc`.
/// Only fields the client is authoritative for are carried.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocStatusUpdate {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    pub task_states: HashMap<String, TaskState>,
    pub client_status: AllocClientStatus,
    pub client_description: String,
}

impl AllocStatusUpdate {
    /// Whether the reported status is terminal.
    #[must_use]
    pub fn terminated(&self) -> bool {
        self.client_status.is_terminal()
    }
}
