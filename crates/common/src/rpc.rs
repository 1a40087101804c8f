//! # RPC Request & Response Types
//!
//! Wire structs for the five server RPCs the agent consumes. The method
//! names and field names are part of the server contract:
//!
//! | Method | Request | Response |
//! |--------|---------|----------|
//! | `Node.Register` | [`NodeRegisterRequest`] | [`NodeUpdateResponse`] |
//! | `Node.UpdateStatus` | [`NodeUpdateStatusRequest`] | [`NodeUpdateResponse`] |
//! | `Node.GetClientAllocs` | [`NodeSpecificRequest`] | [`NodeClientAllocsResponse`] |
//! | `Alloc.GetAllocs` | [`AllocsGetRequest`] | [`AllocsGetResponse`] |
//! | `Node.UpdateAlloc` | [`AllocUpdateRequest`] | [`GenericResponse`] |
//!
//! `Node.GetClientAllocs` is a long-poll: the server holds the request
//! until its state index advances past `MinQueryIndex`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alloc::{AllocStatusUpdate, Allocation};
use crate::node::{Node, NodeStatus};

/// Options common to every write RPC.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WriteRequest {
    pub region: String,
}

/// Options common to every read RPC.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryOptions {
    pub region: String,
    /// Allow any server (not only the leader) to answer.
    pub allow_stale: bool,
    /// Long-poll floor: the server blocks until its index exceeds this.
    pub min_query_index: u64,
}

/// Request for `Node.Register`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeRegisterRequest {
    pub node: Node,
    #[serde(flatten)]
    pub write_request: WriteRequest,
}

/// Response for `Node.Register` and `Node.UpdateStatus`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeUpdateResponse {
    /// How long until the next heartbeat is required, in milliseconds.
    #[serde(rename = "HeartbeatTTL")]
    pub heartbeat_ttl_ms: u64,
    /// Scheduler evaluations triggered by this update.
    #[serde(rename = "EvalIDs", default)]
    pub eval_ids: Vec<String>,
    /// Current server addresses, for pool refresh.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub num_nodes: u32,
    /// RPC address of the raft leader; empty while no leader is known.
    #[serde(rename = "LeaderRPCAddr", default)]
    pub leader_rpc_addr: String,
    pub index: u64,
}

impl NodeUpdateResponse {
    /// The heartbeat TTL as a [`Duration`].
    #[must_use]
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ttl_ms)
    }
}

/// Request for `Node.UpdateStatus` (the heartbeat).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeUpdateStatusRequest {
    #[serde(rename = "NodeID")]
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(flatten)]
    pub write_request: WriteRequest,
}

/// Request for `Node.GetClientAllocs`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeSpecificRequest {
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(flatten)]
    pub query_options: QueryOptions,
}

/// Response for `Node.GetClientAllocs`: the authoritative map of what
/// should run on the node, as allocation ID → modify index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeClientAllocsResponse {
    #[serde(default)]
    pub allocs: HashMap<String, u64>,
    pub index: u64,
}

/// Request for `Alloc.GetAllocs`: fetch full payloads for the given IDs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocsGetRequest {
    #[serde(rename = "AllocIDs")]
    pub alloc_ids: Vec<String>,
    #[serde(flatten)]
    pub query_options: QueryOptions,
}

/// Response for `Alloc.GetAllocs`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocsGetResponse {
    #[serde(default)]
    pub allocs: Vec<Allocation>,
    pub index: u64,
}

/// Request for `Node.UpdateAlloc`: a batch of client-owned status slices.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocUpdateRequest {
    pub alloc: Vec<AllocStatusUpdate>,
    #[serde(flatten)]
    pub write_request: WriteRequest,
}

/// Empty acknowledgement carrying only the write index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GenericResponse {
    #[serde(default)]
    pub index: u64,
}
