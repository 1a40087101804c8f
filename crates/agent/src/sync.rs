//! # Allocation Status Sync
//!
//! Single consumer of the status-update channel the runners write into.
//! Updates are coalesced last-writer-wins per allocation ID and flushed
//! to the servers every 200 ms via `Node.UpdateAlloc`. A failed flush
//! keeps the batch, switches the cadence to a staggered retry interval,
//! and restores the fast cadence on the next success — the server only
//! ever needs the *latest* status per allocation, so nothing is lost by
//! batching harder under failure.
//!
//! Intake is also where chained allocations are released: a terminal
//! update whose ID keys the blocked index starts the parked successor
//! exactly once and drops the key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error};

use drover_common::{AllocStatusUpdate, AllocUpdateRequest, GenericResponse, WriteRequest};

use crate::agent::{Agent, ALLOC_SYNC_INTERVAL, ALLOC_SYNC_RETRY_BASE};
use crate::metrics::AgentMetrics;

impl Agent {
    /// Long-lived loop: batch runner status updates and push them to the
    /// servers.
    pub(crate) async fn alloc_sync(self: Arc<Self>) {
        let Some(mut rx) = self.take_updates_rx() else {
            return;
        };

        let mut updates: HashMap<String, AllocStatusUpdate> = HashMap::new();
        let mut interval = ALLOC_SYNC_INTERVAL;
        let mut staggered = false;
        let mut tick_at = Instant::now() + interval;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                update = rx.recv() => {
                    let Some(update) = update else { return };
                    self.release_blocked(&update);
                    updates.insert(update.id.clone(), update);
                }
                _ = tokio::time::sleep_until(tick_at) => {
                    if !updates.is_empty() {
                        match self.push_alloc_updates(&updates).await {
                            Ok(()) => {
                                updates.clear();
                                if staggered {
                                    staggered = false;
                                    interval = ALLOC_SYNC_INTERVAL;
                                }
                            }
                            Err(interval_after_failure) => {
                                staggered = true;
                                interval = interval_after_failure;
                            }
                        }
                    }
                    tick_at = Instant::now() + interval;
                }
            }
        }
    }

    /// Sends one coalesced batch. On failure returns the staggered
    /// interval to retry at; the caller keeps the batch.
    async fn push_alloc_updates(
        &self,
        updates: &HashMap<String, AllocStatusUpdate>,
    ) -> Result<(), Duration> {
        let req = AllocUpdateRequest {
            alloc: updates.values().cloned().collect(),
            write_request: WriteRequest {
                region: self.region(),
            },
        };
        match self
            .rpc
            .call::<_, GenericResponse>("Node.UpdateAlloc", &req)
            .await
        {
            Ok(_) => {
                AgentMetrics::incr(&self.metrics.sync_batches);
                debug!(allocs = req.alloc.len(), "synced allocation status");
                Ok(())
            }
            Err(e) => {
                AgentMetrics::incr(&self.metrics.sync_failures);
                error!(error = %e, "failed to update allocations");
                Err(self.retry_interval(ALLOC_SYNC_RETRY_BASE))
            }
        }
    }

    /// Releases the successor parked behind `update`'s allocation, if
    /// the update is terminal and one is parked. The blocked write lock
    /// is held across the release so it happens exactly once.
    fn release_blocked(&self, update: &AllocStatusUpdate) {
        if !update.terminated() {
            return;
        }
        let mut blocked = self.blocked.write();
        if let Some(successor) = blocked.remove(&update.id) {
            debug!(
                alloc_id = %successor.id,
                previous = %update.id,
                "starting blocked allocation after terminal predecessor"
            );
            AgentMetrics::incr(&self.metrics.blocked_released);
            self.add_alloc(successor);
        }
    }
}
