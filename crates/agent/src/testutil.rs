//! Shared unit-test doubles: a scriptable in-process RPC handler, a
//! recording runner factory, and an agent constructor wired to both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;

use drover_common::{
    AllocClientStatus, AllocStatusUpdate, AllocUpdateRequest, Allocation, AllocsGetRequest,
    AllocsGetResponse, GenericResponse, NodeClientAllocsResponse, NodeSpecificRequest,
    NodeUpdateResponse,
};

use crate::agent::Agent;
use crate::config::Config;
use crate::rpc::{HttpServerPool, RpcError, RpcHandler};
use crate::runner::{AllocRunner, AllocRunnerFactory, RunnerError};
use crate::stats::AllocStatistics;

// ════════════════════════════════════════════════════════════════════════════
// MOCK RPC HANDLER
// ════════════════════════════════════════════════════════════════════════════

/// Scriptable server: registration and heartbeats answer immediately,
/// `Node.GetClientAllocs` long-polls against an index the test advances,
/// and `Node.UpdateAlloc` batches are recorded.
pub(crate) struct MockRpc {
    /// Heartbeat TTL handed out by register/update-status, in ms.
    pub heartbeat_ttl_ms: AtomicU64,
    /// Leader address in responses; empty simulates a quorum-less reply.
    pub leader_rpc_addr: Mutex<String>,
    /// Errors to inject into upcoming `Node.UpdateStatus` calls, in order.
    heartbeat_errors: Mutex<Vec<String>>,
    pub register_calls: AtomicU64,
    fail_update_alloc: AtomicBool,
    /// Long-poll state: (server index, alloc ID → modify index).
    allocs_tx: watch::Sender<(u64, HashMap<String, u64>)>,
    /// Payloads served by `Alloc.GetAllocs`.
    alloc_table: Mutex<HashMap<String, Allocation>>,
    update_alloc_batches: Mutex<Vec<Vec<AllocStatusUpdate>>>,
}

impl Default for MockRpc {
    fn default() -> Self {
        let (allocs_tx, _) = watch::channel((0, HashMap::new()));
        MockRpc {
            heartbeat_ttl_ms: AtomicU64::new(10_000),
            leader_rpc_addr: Mutex::new("127.0.0.1:4647".to_string()),
            heartbeat_errors: Mutex::new(Vec::new()),
            register_calls: AtomicU64::new(0),
            fail_update_alloc: AtomicBool::new(false),
            allocs_tx,
            alloc_table: Mutex::new(HashMap::new()),
            update_alloc_batches: Mutex::new(Vec::new()),
        }
    }
}

impl MockRpc {
    /// Advances the long-poll index and desired set; blocked
    /// `Node.GetClientAllocs` calls wake up.
    pub(crate) fn set_allocs(&self, index: u64, allocs: &[(&str, u64)]) {
        let map = allocs
            .iter()
            .map(|(id, idx)| (id.to_string(), *idx))
            .collect();
        let _ = self.allocs_tx.send((index, map));
    }

    /// Seeds the payload served for one allocation ID.
    pub(crate) fn put_alloc(&self, alloc: Allocation) {
        self.alloc_table.lock().insert(alloc.id.clone(), alloc);
    }

    /// Queues an error for the next `Node.UpdateStatus` call.
    pub(crate) fn fail_next_heartbeat(&self, message: &str) {
        self.heartbeat_errors.lock().push(message.to_string());
    }

    pub(crate) fn fail_update_alloc(&self, fail: bool) {
        self.fail_update_alloc.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn update_alloc_batches(&self) -> Vec<Vec<AllocStatusUpdate>> {
        self.update_alloc_batches.lock().clone()
    }

    fn node_update_response(&self) -> NodeUpdateResponse {
        NodeUpdateResponse {
            heartbeat_ttl_ms: self.heartbeat_ttl_ms.load(Ordering::SeqCst),
            leader_rpc_addr: self.leader_rpc_addr.lock().clone(),
            index: 1,
            ..NodeUpdateResponse::default()
        }
    }
}

#[async_trait]
impl RpcHandler for MockRpc {
    async fn rpc(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        match method {
            "Node.Register" => {
                self.register_calls.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::to_value(self.node_update_response())?)
            }
            "Node.UpdateStatus" => {
                let injected = {
                    let mut errors = self.heartbeat_errors.lock();
                    if errors.is_empty() {
                        None
                    } else {
                        Some(errors.remove(0))
                    }
                };
                match injected {
                    Some(message) => Err(RpcError::Application(message)),
                    None => Ok(serde_json::to_value(self.node_update_response())?),
                }
            }
            "Node.GetClientAllocs" => {
                let req: NodeSpecificRequest = serde_json::from_value(args)?;
                let min = req.query_options.min_query_index;
                let mut rx = self.allocs_tx.subscribe();
                let ok = async { rx.wait_for(|(index, _)| *index > min).await.is_ok() }.await;
                let state = if ok {
                    rx.borrow().clone()
                } else {
                    // Sender gone: hold the long-poll open forever.
                    std::future::pending().await
                };
                Ok(serde_json::to_value(NodeClientAllocsResponse {
                    allocs: state.1,
                    index: state.0,
                })?)
            }
            "Alloc.GetAllocs" => {
                let req: AllocsGetRequest = serde_json::from_value(args)?;
                let table = self.alloc_table.lock();
                let allocs = req
                    .alloc_ids
                    .iter()
                    .filter_map(|id| table.get(id).cloned())
                    .collect();
                Ok(serde_json::to_value(AllocsGetResponse { allocs, index: 0 })?)
            }
            "Node.UpdateAlloc" => {
                if self.fail_update_alloc.load(Ordering::SeqCst) {
                    return Err(RpcError::Application("server unavailable".to_string()));
                }
                let req: AllocUpdateRequest = serde_json::from_value(args)?;
                self.update_alloc_batches.lock().push(req.alloc);
                Ok(serde_json::to_value(GenericResponse::default())?)
            }
            other => Err(RpcError::Application(format!("unknown method {other}"))),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MOCK RUNNER
// ════════════════════════════════════════════════════════════════════════════

/// Inert runner that records lifecycle calls and lets tests flip its
/// allocation's client status.
pub(crate) struct MockRunner {
    alloc: RwLock<Allocation>,
    destroy_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    pub updates_received: Mutex<Vec<Allocation>>,
}

impl MockRunner {
    fn new(alloc: Allocation) -> Self {
        let (destroy_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        MockRunner {
            alloc: RwLock::new(alloc),
            destroy_tx,
            done_tx,
            updates_received: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_status(&self, status: AllocClientStatus) {
        self.alloc.write().client_status = status;
    }

    pub(crate) fn destroyed(&self) -> bool {
        *self.destroy_tx.borrow()
    }
}

#[async_trait]
impl AllocRunner for MockRunner {
    fn alloc(&self) -> Allocation {
        self.alloc.read().clone()
    }

    fn should_update(&self, modify_index: u64) -> bool {
        modify_index > self.alloc.read().alloc_modify_index
    }

    async fn run(self: Arc<Self>) {
        let mut destroy_rx = self.destroy_tx.subscribe();
        let _ = destroy_rx.wait_for(|destroyed| *destroyed).await;
        let _ = self.done_tx.send(true);
    }

    fn update(&self, alloc: Allocation) {
        self.updates_received.lock().push(alloc.clone());
        let status = self.alloc.read().client_status;
        let mut current = self.alloc.write();
        *current = alloc;
        current.client_status = status;
    }

    fn destroy(&self) {
        let _ = self.destroy_tx.send(true);
    }

    async fn wait(&self) {
        let mut done_rx = self.done_tx.subscribe();
        let _ = done_rx.wait_for(|done| *done).await;
    }

    fn save_state(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    fn restore_state(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    fn stats(&self) -> AllocStatistics {
        AllocStatistics::default()
    }
}

/// Factory that records every runner it creates, addressable by ID.
#[derive(Default)]
pub(crate) struct MockFactory {
    runners: Mutex<HashMap<String, Arc<MockRunner>>>,
}

impl MockFactory {
    pub(crate) fn factory(self: &Arc<Self>) -> AllocRunnerFactory {
        let this = Arc::clone(self);
        Arc::new(move |_snapshot, _updates, alloc| {
            let runner = Arc::new(MockRunner::new(alloc.clone()));
            this.runners.lock().insert(alloc.id, Arc::clone(&runner));
            runner as Arc<dyn AllocRunner>
        })
    }

    pub(crate) fn runner(&self, id: &str) -> Option<Arc<MockRunner>> {
        self.runners.lock().get(id).cloned()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// AGENT CONSTRUCTORS
// ════════════════════════════════════════════════════════════════════════════

/// Dev-mode agent wired to a default [`MockRpc`].
pub(crate) async fn test_agent(factory: &Arc<MockFactory>) -> Arc<Agent> {
    test_agent_with(Arc::new(MockRpc::default()), factory).await
}

/// Dev-mode agent wired to the given [`MockRpc`].
pub(crate) async fn test_agent_with(
    rpc: Arc<MockRpc>,
    factory: &Arc<MockFactory>,
) -> Arc<Agent> {
    let config = Config {
        dev_mode: true,
        region: "global".to_string(),
        servers: vec!["127.0.0.1:4647".to_string()],
        ..Config::default()
    };
    Agent::new(
        config,
        Arc::new(HttpServerPool::new()),
        Some(rpc as Arc<dyn RpcHandler>),
        factory.factory(),
    )
    .await
    .expect("test setup: agent")
}
