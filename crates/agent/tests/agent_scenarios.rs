//! End-to-end agent scenarios against a scripted in-process server:
//! cold start, warm start from disk, allocation arrival with chaining,
//! chained release, stale-node recovery, and the heartbeat/long-poll
//! timing contracts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use drover_agent::{
    supervisor_factory, Agent, AllocRunner, AllocRunnerFactory, Config, HttpServerPool,
    RpcError, RpcHandler, RunnerError, StatusUpdateSender,
};
use drover_common::{
    AllocClientStatus, AllocStatusUpdate, AllocUpdateRequest, Allocation, AllocsGetRequest,
    AllocsGetResponse, GenericResponse, NodeClientAllocsResponse, NodeSpecificRequest,
    NodeStatus, NodeUpdateResponse,
};

// ════════════════════════════════════════════════════════════════════════════
// SCRIPTED SERVER
// ════════════════════════════════════════════════════════════════════════════

/// In-process stand-in for the control plane. Registration and
/// heartbeats answer immediately; `Node.GetClientAllocs` long-polls an
/// index the test advances; calls are recorded for assertions.
struct ScriptedServer {
    heartbeat_ttl_ms: AtomicU64,
    heartbeat_errors: Mutex<Vec<String>>,
    register_calls: AtomicU64,
    update_status_at: Mutex<Vec<Instant>>,
    get_allocs_floors: Mutex<Vec<u64>>,
    update_alloc_batches: Mutex<Vec<Vec<AllocStatusUpdate>>>,
    allocs_tx: watch::Sender<(u64, HashMap<String, u64>)>,
    alloc_table: Mutex<HashMap<String, Allocation>>,
}

impl Default for ScriptedServer {
    fn default() -> Self {
        let (allocs_tx, _) = watch::channel((0, HashMap::new()));
        ScriptedServer {
            heartbeat_ttl_ms: AtomicU64::new(10_000),
            heartbeat_errors: Mutex::new(Vec::new()),
            register_calls: AtomicU64::new(0),
            update_status_at: Mutex::new(Vec::new()),
            get_allocs_floors: Mutex::new(Vec::new()),
            update_alloc_batches: Mutex::new(Vec::new()),
            allocs_tx,
            alloc_table: Mutex::new(HashMap::new()),
        }
    }
}

impl ScriptedServer {
    fn set_allocs(&self, index: u64, allocs: &[(&str, u64)]) {
        let map = allocs
            .iter()
            .map(|(id, idx)| (id.to_string(), *idx))
            .collect();
        let _ = self.allocs_tx.send((index, map));
    }

    fn put_alloc(&self, alloc: Allocation) {
        self.alloc_table.lock().insert(alloc.id.clone(), alloc);
    }

    fn response(&self) -> NodeUpdateResponse {
        NodeUpdateResponse {
            heartbeat_ttl_ms: self.heartbeat_ttl_ms.load(Ordering::SeqCst),
            leader_rpc_addr: "127.0.0.1:4647".to_string(),
            index: 1,
            ..NodeUpdateResponse::default()
        }
    }
}

#[async_trait]
impl RpcHandler for ScriptedServer {
    async fn rpc(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        match method {
            "Node.Register" => {
                self.register_calls.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::to_value(self.response())?)
            }
            "Node.UpdateStatus" => {
                self.update_status_at.lock().push(Instant::now());
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
                    None => Ok(serde_json::to_value(self.response())?),
                }
            }
            "Node.GetClientAllocs" => {
                let req: NodeSpecificRequest = serde_json::from_value(args)?;
                let floor = req.query_options.min_query_index;
                self.get_allocs_floors.lock().push(floor);
                let mut rx = self.allocs_tx.subscribe();
                let ok = async { rx.wait_for(|(index, _)| *index > floor).await.is_ok() }.await;
                let (index, allocs) = if ok {
                    rx.borrow().clone()
                } else {
                    std::future::pending().await
                };
                Ok(serde_json::to_value(NodeClientAllocsResponse {
                    allocs,
                    index,
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
                let req: AllocUpdateRequest = serde_json::from_value(args)?;
                self.update_alloc_batches.lock().push(req.alloc);
                Ok(serde_json::to_value(GenericResponse::default())?)
            }
            other => Err(RpcError::Application(format!("unknown method {other}"))),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TEST RUNNER
// ════════════════════════════════════════════════════════════════════════════

/// Runner whose terminal transition the test triggers explicitly.
struct TestRunner {
    alloc: RwLock<Allocation>,
    updates: StatusUpdateSender,
    terminal_tx: watch::Sender<bool>,
    destroy_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

impl TestRunner {
    fn new(updates: StatusUpdateSender, alloc: Allocation) -> Self {
        let (terminal_tx, _) = watch::channel(false);
        let (destroy_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        TestRunner {
            alloc: RwLock::new(alloc),
            updates,
            terminal_tx,
            destroy_tx,
            done_tx,
        }
    }

    fn finish(&self) {
        let _ = self.terminal_tx.send(true);
    }
}

#[async_trait]
impl AllocRunner for TestRunner {
    fn alloc(&self) -> Allocation {
        self.alloc.read().clone()
    }

    fn should_update(&self, modify_index: u64) -> bool {
        modify_index > self.alloc.read().alloc_modify_index
    }

    async fn run(self: Arc<Self>) {
        let running = {
            let mut alloc = self.alloc.write();
            alloc.client_status = AllocClientStatus::Running;
            alloc.clone()
        };
        self.updates.send(&running).await;

        let mut terminal_rx = self.terminal_tx.subscribe();
        let mut destroy_rx = self.destroy_tx.subscribe();
        tokio::select! {
            _ = async { let _ = terminal_rx.wait_for(|t| *t).await; } => {
                let terminal = {
                    let mut alloc = self.alloc.write();
                    alloc.client_status = AllocClientStatus::Complete;
                    alloc.clone()
                };
                self.updates.send(&terminal).await;
            }
            _ = async { let _ = destroy_rx.wait_for(|d| *d).await; } => {}
        }
        let _ = self.done_tx.send(true);
    }

    fn update(&self, alloc: Allocation) {
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

    fn stats(&self) -> drover_agent::AllocStatistics {
        drover_agent::AllocStatistics::default()
    }
}

/// Factory recording every [`TestRunner`] it creates.
#[derive(Default)]
struct TestFactory {
    runners: Mutex<HashMap<String, Arc<TestRunner>>>,
    created: Mutex<Vec<String>>,
}

impl TestFactory {
    fn factory(self: &Arc<Self>) -> AllocRunnerFactory {
        let this = Arc::clone(self);
        Arc::new(move |_snapshot, updates, alloc| {
            let runner = Arc::new(TestRunner::new(updates, alloc.clone()));
            this.created.lock().push(alloc.id.clone());
            this.runners.lock().insert(alloc.id, Arc::clone(&runner));
            runner as Arc<dyn AllocRunner>
        })
    }

    fn runner(&self, id: &str) -> Option<Arc<TestRunner>> {
        self.runners.lock().get(id).cloned()
    }

    fn created_count(&self, id: &str) -> usize {
        self.created.lock().iter().filter(|c| *c == id).count()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HELPERS
// ════════════════════════════════════════════════════════════════════════════

fn dev_config() -> Config {
    Config {
        dev_mode: true,
        region: "global".to_string(),
        servers: vec!["127.0.0.1:4647".to_string()],
        ..Config::default()
    }
}

async fn start_agent(
    config: Config,
    server: &Arc<ScriptedServer>,
    factory: AllocRunnerFactory,
) -> Arc<Agent> {
    Agent::new(
        config,
        Arc::new(HttpServerPool::new()),
        Some(Arc::clone(server) as Arc<dyn RpcHandler>),
        factory,
    )
    .await
    .expect("test setup: agent")
}

/// Yields until the spawned loops have had a chance to run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// ════════════════════════════════════════════════════════════════════════════
// SCENARIOS
// ════════════════════════════════════════════════════════════════════════════

// ── S1: cold start in dev mode ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cold_start_dev_mode_registers_and_heartbeats_immediately() {
    let server = Arc::new(ScriptedServer::default());
    let factory = Arc::new(TestFactory::default());
    let agent = start_agent(dev_config(), &server, factory.factory()).await;

    settle().await;

    // A fresh UUID was generated and registration flipped the status.
    assert_eq!(agent.node().id.len(), 36);
    assert_eq!(agent.node().status, NodeStatus::Ready);
    assert_eq!(server.register_calls.load(Ordering::SeqCst), 1);
    // Dev mode schedules the first heartbeat at T+0.
    assert!(!server.update_status_at.lock().is_empty());

    agent.shutdown().await.expect("test: shutdown");
}

// ── S2: warm start restores state from disk ──────────────────────────────

#[tokio::test(start_paused = true)]
async fn warm_start_restores_node_id_and_allocations() {
    let dir = tempfile::tempdir().expect("test setup: tempdir");
    let seeded_id = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    std::fs::write(dir.path().join("client-id"), seeded_id).expect("test setup: id");
    seed_alloc_state(dir.path(), "alloc-1");

    let server = Arc::new(ScriptedServer::default());
    let config = Config {
        dev_mode: false,
        state_dir: Some(dir.path().to_path_buf()),
        region: "global".to_string(),
        ..Config::default()
    };
    let agent = start_agent(config, &server, supervisor_factory()).await;

    // The persisted identity wins over generation.
    assert_eq!(agent.node().id, seeded_id);
    // One runner restored from disk and launched.
    assert_eq!(agent.num_allocations(), 1);
    assert!(agent.alloc_stats("alloc-1").is_ok());

    // Its running status flows through the sync loop's first window.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let batches = server.update_alloc_batches.lock().clone();
    assert!(!batches.is_empty());
    assert_eq!(batches[0][0].id, "alloc-1");
    assert_eq!(batches[0][0].node_id, seeded_id);

    agent.shutdown().await.expect("test: shutdown");
}

fn seed_alloc_state(state_dir: &Path, id: &str) {
    let alloc_dir = state_dir.join("alloc").join(id);
    std::fs::create_dir_all(&alloc_dir).expect("test setup: alloc dir");
    let alloc = Allocation {
        id: id.to_string(),
        alloc_modify_index: 2,
        payload: serde_json::json!({"tasks": {"apply": {}}}),
        ..Allocation::default()
    };
    let body = serde_json::to_vec_pretty(&alloc).expect("test setup: encode");
    std::fs::write(alloc_dir.join("alloc.json"), body).expect("test setup: state file");
}

// ── S3 + S4: allocation arrival, chaining, and chained release ───────────

#[tokio::test(start_paused = true)]
async fn chained_allocation_parks_then_releases_on_terminal_predecessor() {
    let server = Arc::new(ScriptedServer::default());
    server.put_alloc(Allocation {
        id: "alloc-A".to_string(),
        alloc_modify_index: 7,
        ..Allocation::default()
    });
    server.put_alloc(Allocation {
        id: "alloc-B".to_string(),
        alloc_modify_index: 3,
        previous_allocation: Some("alloc-A".to_string()),
        ..Allocation::default()
    });

    let factory = Arc::new(TestFactory::default());
    let agent = start_agent(dev_config(), &server, factory.factory()).await;

    // The watcher round names both; the pull set is both of them.
    server.set_allocs(1, &[("alloc-A", 7), ("alloc-B", 3)]);
    settle().await;

    // A runs; B is parked behind it.
    assert_eq!(agent.num_allocations(), 1);
    assert_eq!(factory.created_count("alloc-A"), 1);
    assert_eq!(factory.created_count("alloc-B"), 0);

    // S4: the predecessor terminates; B starts exactly once.
    factory
        .runner("alloc-A")
        .expect("test: runner A")
        .finish();
    settle().await;

    assert_eq!(agent.num_allocations(), 2);
    assert_eq!(factory.created_count("alloc-B"), 1);

    agent.shutdown().await.expect("test: shutdown");
}

// ── S5: stale node triggers exactly one re-registration ──────────────────

#[tokio::test(start_paused = true)]
async fn stale_node_error_reregisters_once() {
    let server = Arc::new(ScriptedServer::default());
    server
        .heartbeat_errors
        .lock()
        .push("rpc: node not found".to_string());

    let factory = Arc::new(TestFactory::default());
    let agent = start_agent(dev_config(), &server, factory.factory()).await;

    settle().await;
    // Initial registration plus exactly one stale-triggered one.
    assert_eq!(server.register_calls.load(Ordering::SeqCst), 2);

    // Heartbeats resume afterwards (next attempt within the initial
    // stagger window).
    tokio::time::sleep(Duration::from_secs(11)).await;
    let heartbeats = server.update_status_at.lock().len();
    assert!(heartbeats >= 2, "expected resumed heartbeats, saw {heartbeats}");

    agent.shutdown().await.expect("test: shutdown");
}

// ── property: heartbeats honor the server-assigned TTL ───────────────────

#[tokio::test(start_paused = true)]
async fn heartbeats_fire_at_the_assigned_ttl() {
    let server = Arc::new(ScriptedServer::default());
    let factory = Arc::new(TestFactory::default());
    let agent = start_agent(dev_config(), &server, factory.factory()).await;

    tokio::time::sleep(Duration::from_secs(35)).await;

    let at = server.update_status_at.lock().clone();
    assert!(at.len() >= 3, "expected several heartbeats, saw {}", at.len());
    for pair in at.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_secs(10) && gap <= Duration::from_secs(10) + Duration::from_millis(50),
            "heartbeat gap {gap:?} strays from the 10s TTL"
        );
    }

    agent.shutdown().await.expect("test: shutdown");
}

// ── property: the long-poll floor never decreases ────────────────────────

#[tokio::test(start_paused = true)]
async fn long_poll_index_is_monotonic() {
    let server = Arc::new(ScriptedServer::default());
    server.put_alloc(Allocation {
        id: "alloc-A".to_string(),
        alloc_modify_index: 1,
        ..Allocation::default()
    });

    let factory = Arc::new(TestFactory::default());
    let agent = start_agent(dev_config(), &server, factory.factory()).await;

    for round in 1..=4u64 {
        server.set_allocs(round * 10, &[("alloc-A", round)]);
        settle().await;
    }

    let floors = server.get_allocs_floors.lock().clone();
    assert!(floors.len() >= 4);
    for pair in floors.windows(2) {
        assert!(pair[0] <= pair[1], "long-poll floor decreased: {floors:?}");
    }
    // The floor caught up to the last served index.
    assert_eq!(*floors.last().expect("test: floors"), 40);

    agent.shutdown().await.expect("test: shutdown");
}
