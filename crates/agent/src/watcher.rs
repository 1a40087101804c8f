//! # Allocation Watcher
//!
//! Long-polls the servers for the authoritative set of allocations this
//! node should be running. The response is a cheap map of allocation ID
//! → modify index; only entries that are new locally or whose index
//! advanced past the local runner's copy are pulled in full. Everything
//! else lands in the *filtered* set so the reconciler still knows the
//! server wants it kept.
//!
//! The watcher never touches the alloc index — it only produces
//! [`AllocUpdates`] records. The reconciler is the single writer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use drover_common::{
    Allocation, AllocsGetRequest, AllocsGetResponse, NodeClientAllocsResponse,
    NodeSpecificRequest, QueryOptions,
};

use crate::agent::{Agent, GET_ALLOC_RETRY_BASE};
use crate::metrics::AgentMetrics;

/// One round of desired-state from the servers.
#[derive(Clone, Debug, Default)]
pub struct AllocUpdates {
    /// Allocations downloaded in full because they are new or changed.
    pub pulled: HashMap<String, Allocation>,
    /// Allocations the server still wants but whose modify index did not
    /// advance past the local copy.
    pub filtered: HashSet<String>,
}

impl Agent {
    /// Long-lived loop: long-poll `Node.GetClientAllocs`, pull changed
    /// allocations, and push one [`AllocUpdates`] record downstream per
    /// round.
    pub(crate) async fn watch_allocations(self: Arc<Self>, updates: mpsc::Sender<AllocUpdates>) {
        let node_id = self.shared.read().node.id.clone();
        let region = self.region();
        // The long-poll floor; only ever advances.
        let mut min_query_index = 0u64;

        loop {
            let req = NodeSpecificRequest {
                node_id: node_id.clone(),
                query_options: QueryOptions {
                    region: region.clone(),
                    allow_stale: true,
                    min_query_index,
                },
            };
            let resp: NodeClientAllocsResponse = tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                resp = self.rpc.call::<_, NodeClientAllocsResponse>("Node.GetClientAllocs", &req) => match resp {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(error = %e, "failed to query for node allocations");
                        let retry = self.retry_interval(GET_ALLOC_RETRY_BASE);
                        tokio::select! {
                            biased;
                            _ = self.shutdown.wait() => return,
                            _ = tokio::time::sleep(retry) => continue,
                        }
                    }
                }
            };

            // Split the response into the pull set (no local runner, or
            // the runner wants the newer copy) and the filtered set.
            let mut pull = Vec::new();
            let mut filtered = HashSet::new();
            let runners = self.alloc_runners();
            for (alloc_id, modify_index) in &resp.allocs {
                match runners.get(alloc_id) {
                    Some(runner) if !runner.should_update(*modify_index) => {
                        filtered.insert(alloc_id.clone());
                    }
                    _ => pull.push(alloc_id.clone()),
                }
            }
            debug!(
                index = resp.index,
                pulled = pull.len(),
                filtered = filtered.len(),
                "updated allocations"
            );

            let mut pulled = HashMap::new();
            if !pull.is_empty() {
                let allocs_req = AllocsGetRequest {
                    alloc_ids: pull,
                    query_options: QueryOptions {
                        region: region.clone(),
                        allow_stale: true,
                        min_query_index: 0,
                    },
                };
                let allocs_resp: AllocsGetResponse = tokio::select! {
                    biased;
                    _ = self.shutdown.wait() => return,
                    resp = self.rpc.call::<_, AllocsGetResponse>("Alloc.GetAllocs", &allocs_req) => match resp {
                        Ok(resp) => resp,
                        Err(e) => {
                            warn!(error = %e, "failed to query updated allocations");
                            let retry = self.retry_interval(GET_ALLOC_RETRY_BASE);
                            tokio::select! {
                                biased;
                                _ = self.shutdown.wait() => return,
                                _ = tokio::time::sleep(retry) => continue,
                            }
                        }
                    }
                };
                AgentMetrics::incr(&self.metrics.alloc_pulls);
                for alloc in allocs_resp.allocs {
                    pulled.insert(alloc.id.clone(), alloc);
                }
            }

            if resp.index > min_query_index {
                min_query_index = resp.index;
            }

            let update = AllocUpdates { pulled, filtered };
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                _ = updates.send(update) => {}
            }
        }
    }
}
