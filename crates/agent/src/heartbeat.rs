//! # Registration & Heartbeat
//!
//! Keeps the node registered and live against the servers:
//!
//! ```text
//!         start
//!           │
//!           ▼
//!    [registering] ──register ok──▶ [heartbeating]
//!           ▲                            │
//!           │                            │ error contains "node not found"
//!           │                            ▼
//!           └──────── re-register ──── [stale]
//!                                        │
//!                                        │ other error
//!                                        ▼
//!                                  [retry-backoff]
//! ```
//!
//! The first heartbeat fires a random fraction of the initial stagger
//! after start (dev mode: immediately); afterwards each success
//! schedules the next tick at the server-assigned TTL. A server that no
//! longer knows the node answers with `node not found` somewhere in the
//! error text, which sends the loop straight back to registration.
//!
//! The node-change watcher lives here too: it hashes the attribute and
//! meta maps on a staggered interval and re-registers when either hash
//! drifts. Registration is idempotent server-side, so re-registering is
//! always safe.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, error, info};

use drover_common::{
    NodeRegisterRequest, NodeStatus, NodeUpdateResponse, NodeUpdateStatusRequest, WriteRequest,
};

use crate::agent::{
    random_stagger, Agent, INITIAL_HEARTBEAT_STAGGER, NODE_UPDATE_INTERVAL, REGISTER_ERR_GRACE,
    REGISTER_RETRY_BASE,
};
use crate::metrics::AgentMetrics;
use crate::rpc::RpcError;

/// Error-text marker for a registration the servers have forgotten.
const NODE_NOT_FOUND: &str = "node not found";

/// Order-independent, run-stable hash of a string map.
///
/// Entries are hashed in sorted order with separators, so insertion
/// order never matters and equal maps always collide — exactly what the
/// drift check needs.
#[must_use]
pub(crate) fn stable_map_hash(map: &HashMap<String, String>) -> u64 {
    let mut entries: Vec<(&str, &str)> = map
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    entries.sort_unstable();

    let mut hasher = Sha256::new();
    for (key, value) in entries {
        hasher.update(key.as_bytes());
        hasher.update([0x00]);
        hasher.update(value.as_bytes());
        hasher.update([0xff]);
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}

impl Agent {
    /// Long-lived loop: registers the node, then heartbeats at the
    /// server-assigned TTL until shutdown.
    pub(crate) async fn register_and_heartbeat(self: Arc<Self>) {
        self.retry_register_node().await;

        tokio::spawn(Arc::clone(&self).watch_node_updates());

        // First heartbeat is staggered so a restarting fleet does not
        // thunder against the servers.
        let mut heartbeat_at = if self.dev_mode() {
            Instant::now()
        } else {
            Instant::now() + random_stagger(INITIAL_HEARTBEAT_STAGGER)
        };

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                _ = tokio::time::sleep_until(heartbeat_at) => {
                    match self.update_node_status().await {
                        Ok(()) => {
                            let ttl = self.heartbeat.lock().heartbeat_ttl;
                            heartbeat_at = Instant::now() + ttl;
                        }
                        Err(e) if e.to_string().contains(NODE_NOT_FOUND) => {
                            // The servers have changed out from under us;
                            // this node is unknown to them now.
                            info!("re-registering node");
                            self.retry_register_node().await;
                            heartbeat_at =
                                Instant::now() + random_stagger(INITIAL_HEARTBEAT_STAGGER);
                        }
                        Err(e) => {
                            let interval = self.retry_interval(REGISTER_RETRY_BASE);
                            AgentMetrics::incr(&self.metrics.heartbeat_failures);
                            error!(error = %e, retry_in = ?interval, "heartbeating failed");
                            heartbeat_at = Instant::now() + interval;
                        }
                    }
                }
            }
        }
    }

    /// Registers until it sticks, backing off between attempts.
    pub(crate) async fn retry_register_node(&self) {
        loop {
            match self.register_node().await {
                Ok(()) => return,
                Err(e) => {
                    if self.start.elapsed() > REGISTER_ERR_GRACE {
                        error!(error = %e, "failed to register node");
                    } else {
                        // Leader election is usually still in flight this
                        // early; keep the noise down.
                        debug!(error = %e, "node registration attempt failed");
                    }
                }
            }
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                _ = tokio::time::sleep(self.retry_interval(REGISTER_RETRY_BASE)) => {}
            }
        }
    }

    /// One `Node.Register` attempt. On success the node is `ready` and
    /// the heartbeat schedule is primed from the response TTL.
    async fn register_node(&self) -> Result<(), RpcError> {
        let node = self.node();
        let req = NodeRegisterRequest {
            node,
            write_request: WriteRequest {
                region: self.region(),
            },
        };
        let resp: NodeUpdateResponse = self.rpc.call("Node.Register", &req).await?;

        self.shared.write().node.status = NodeStatus::Ready;
        AgentMetrics::incr(&self.metrics.registrations);

        debug!("node registration complete");
        if !resp.eval_ids.is_empty() {
            debug!(
                evals = resp.eval_ids.len(),
                "evaluations triggered by node registration"
            );
        }

        let mut hb = self.heartbeat.lock();
        hb.last_heartbeat = Instant::now();
        hb.heartbeat_ttl = resp.heartbeat_ttl();
        Ok(())
    }

    /// One heartbeat: `Node.UpdateStatus`, then server-list refresh and
    /// the quorum flag from the response.
    async fn update_node_status(&self) -> Result<(), RpcError> {
        let node_id = self.shared.read().node.id.clone();
        let req = NodeUpdateStatusRequest {
            node_id,
            status: NodeStatus::Ready,
            write_request: WriteRequest {
                region: self.region(),
            },
        };
        let resp: NodeUpdateResponse = self.rpc.call("Node.UpdateStatus", &req).await?;

        AgentMetrics::incr(&self.metrics.heartbeats);
        if !resp.eval_ids.is_empty() {
            debug!(
                evals = resp.eval_ids.len(),
                "evaluations triggered by node update"
            );
        }

        {
            let mut hb = self.heartbeat.lock();
            hb.last_heartbeat = Instant::now();
            hb.heartbeat_ttl = resp.heartbeat_ttl();
        }

        self.rpc.pool().refresh_server_lists(
            &resp.servers,
            resp.num_nodes,
            &resp.leader_rpc_addr,
        )?;

        // An empty leader address means the answering server sits in a
        // minority partition or mid-election.
        if resp.leader_rpc_addr.is_empty() {
            let _ = self.last_heartbeat_from_quorum.compare_exchange(
                true,
                false,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        } else {
            let _ = self.last_heartbeat_from_quorum.compare_exchange(
                false,
                true,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        Ok(())
    }

    /// Whether the last heartbeat response named a leader.
    #[must_use]
    pub fn last_heartbeat_from_quorum(&self) -> bool {
        self.last_heartbeat_from_quorum.load(Ordering::SeqCst)
    }

    /// Long-lived loop: re-registers whenever the node's attribute or
    /// meta map drifts (periodic fingerprints, operator edits).
    async fn watch_node_updates(self: Arc<Self>) {
        debug!(
            interval = ?NODE_UPDATE_INTERVAL,
            "periodically checking for node changes"
        );
        let (_, mut attr_hash, mut meta_hash) = self.has_node_changed(0, 0);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                _ = tokio::time::sleep(self.retry_interval(NODE_UPDATE_INTERVAL)) => {
                    let (changed, new_attr_hash, new_meta_hash) =
                        self.has_node_changed(attr_hash, meta_hash);
                    attr_hash = new_attr_hash;
                    meta_hash = new_meta_hash;
                    if changed {
                        debug!("node changed, updating registration");
                        self.refresh_snapshot();
                        self.retry_register_node().await;
                    }
                }
            }
        }
    }

    /// Compares current attribute/meta hashes against the last observed
    /// values; returns the new values alongside the verdict.
    pub(crate) fn has_node_changed(
        &self,
        old_attr_hash: u64,
        old_meta_hash: u64,
    ) -> (bool, u64, u64) {
        let shared = self.shared.read();
        let attr_hash = stable_map_hash(&shared.node.attributes);
        let meta_hash = stable_map_hash(&shared.node.meta);
        (
            attr_hash != old_attr_hash || meta_hash != old_meta_hash,
            attr_hash,
            meta_hash,
        )
    }
}
