//! # Agent Core
//!
//! The root owner of every other resource in the process. One [`Agent`]
//! is created at startup and torn down exactly once through
//! [`Agent::shutdown`].
//!
//! ## Control loops
//!
//! ```text
//! ┌────────────────────────────── Agent ──────────────────────────────┐
//! │                                                                   │
//! │  register+heartbeat ──▶ Node.Register / Node.UpdateStatus         │
//! │       │                                                           │
//! │       └─▶ node-change watcher (attr/meta hash drift)              │
//! │                                                                   │
//! │  alloc watcher ──▶ Node.GetClientAllocs (long-poll)               │
//! │       │                 └─▶ Alloc.GetAllocs (pull set)            │
//! │       ▼                                                           │
//! │  reconciler ──▶ alloc index (single writer) ──▶ runners           │
//! │       ▲                                            │              │
//! │       │ blocked release                            │ status       │
//! │  sync loop ◀───────────────────────────────────────┘              │
//! │       └─▶ Node.UpdateAlloc (batched, 200 ms)                      │
//! │                                                                   │
//! │  host stats · state snapshot (60 s) · periodic fingerprints       │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every loop suspends on a timer, a channel, or an RPC, and selects on
//! the shutdown signal with a `biased` arm so cancellation wins
//! deterministically. No lock is held across an RPC or a blocking
//! channel send.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use drover_common::{AllocStatusUpdate, Allocation, Node, NodeStatus};

use crate::config::{AgentSnapshot, Config};
use crate::fingerprint::{self, Fingerprint};
use crate::metrics::AgentMetrics;
use crate::rpc::{RpcClient, RpcHandler, ServerPool};
use crate::runner::{AllocRunner, AllocRunnerFactory, StatusUpdateSender};
use crate::shutdown::{self, ShutdownNotifier, ShutdownSignal};
use crate::state::{self, StateError};
use crate::stats::{AllocStatistics, HostStats, HostStatsCollector, ProcStatsCollector};

// ════════════════════════════════════════════════════════════════════════════
// TUNING CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// Minimum interval between registration retries; the actual wait is a
/// value between this and twice this.
pub(crate) const REGISTER_RETRY_BASE: Duration = Duration::from_secs(15);

/// Minimum interval between allocation-fetch retries.
pub(crate) const GET_ALLOC_RETRY_BASE: Duration = Duration::from_secs(30);

/// Flat retry interval used in dev mode for every loop.
pub(crate) const DEV_MODE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between periodic state snapshots.
pub(crate) const STATE_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// Registration errors inside this window after start are expected
/// (leader election in flight) and logged quietly.
pub(crate) const REGISTER_ERR_GRACE: Duration = Duration::from_secs(10);

/// The first heartbeat fires a random fraction of this after start;
/// afterwards the server-assigned TTL takes over.
pub(crate) const INITIAL_HEARTBEAT_STAGGER: Duration = Duration::from_secs(10);

/// Base interval for node attribute/meta drift checks.
pub(crate) const NODE_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Batching window for allocation status updates.
pub(crate) const ALLOC_SYNC_INTERVAL: Duration = Duration::from_millis(200);

/// Base retry interval after a failed status sync.
pub(crate) const ALLOC_SYNC_RETRY_BASE: Duration = Duration::from_secs(5);

/// Buffer of the runner → sync-loop status channel.
pub(crate) const STATUS_UPDATE_BUFFER: usize = 64;

/// Buffer of the watcher → reconciler desired-set channel.
pub(crate) const ALLOC_UPDATES_BUFFER: usize = 8;

/// A random duration in `[0, max)`; zero stays zero.
#[must_use]
pub(crate) fn random_stagger(max: Duration) -> Duration {
    let nanos = max.as_nanos() as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

/// Fatal agent-construction errors. Everything after construction is
/// handled inside the loops.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to initialize agent: {0}")]
    Init(#[from] StateError),
    #[error("unknown allocation ID {0:?}")]
    UnknownAlloc(String),
}

// ════════════════════════════════════════════════════════════════════════════
// SHARED STATE
// ════════════════════════════════════════════════════════════════════════════

/// Config, node, and their runner-facing snapshot; one lock for all
/// three so a node mutation and its snapshot refresh are atomic.
pub(crate) struct SharedState {
    pub(crate) config: Config,
    pub(crate) node: Node,
    pub(crate) snapshot: Arc<AgentSnapshot>,
}

/// Heartbeat bookkeeping, written on every heartbeat result.
pub(crate) struct HeartbeatState {
    pub(crate) last_heartbeat: Instant,
    pub(crate) heartbeat_ttl: Duration,
}

// ════════════════════════════════════════════════════════════════════════════
// AGENT
// ════════════════════════════════════════════════════════════════════════════

/// The per-node agent: registers the node, heartbeats, reconciles the
/// server's allocation set against the local one, and syncs client-owned
/// status back.
pub struct Agent {
    pub(crate) start: Instant,
    pub(crate) shared: RwLock<SharedState>,
    pub(crate) rpc: RpcClient,
    pub(crate) factory: AllocRunnerFactory,

    /// The live allocation set. Written only by the reconciler (and the
    /// restore pass before any loop starts).
    pub(crate) allocs: RwLock<HashMap<String, Arc<dyn AllocRunner>>>,
    /// Allocations parked until their predecessor terminates, keyed by
    /// the predecessor's ID.
    pub(crate) blocked: RwLock<HashMap<String, Allocation>>,

    pub(crate) updates_tx: mpsc::Sender<AllocStatusUpdate>,
    updates_rx: Mutex<Option<mpsc::Receiver<AllocStatusUpdate>>>,

    pub(crate) heartbeat: Mutex<HeartbeatState>,
    /// True ⇔ the last heartbeat response named a leader. Atomic so
    /// readers never touch the heartbeat lock.
    pub(crate) last_heartbeat_from_quorum: AtomicBool,

    collector: Arc<dyn HostStatsCollector>,
    resource_usage: RwLock<Option<HostStats>>,

    pub(crate) metrics: Arc<AgentMetrics>,

    shutdown_flag: Mutex<bool>,
    shutdown_notifier: ShutdownNotifier,
    pub(crate) shutdown: ShutdownSignal,
}

impl Agent {
    /// Creates the agent and starts every control loop.
    ///
    /// Construction order matters: directories and node identity first
    /// (the only fatal errors), then fingerprints and port reservations
    /// under the config lock, then the snapshot copy, then state
    /// restoration, and only then the loops.
    pub async fn new(
        mut config: Config,
        pool: Arc<dyn ServerPool>,
        rpc_handler: Option<Arc<dyn RpcHandler>>,
        factory: AllocRunnerFactory,
    ) -> Result<Arc<Agent>, AgentError> {
        let state_dir = state::init_state_dir(config.state_dir.as_deref())?;
        info!(dir = %state_dir.display(), "using state directory");
        config.state_dir = Some(state_dir.clone());

        let alloc_dir = state::init_alloc_dir(config.alloc_dir.as_deref())?;
        info!(dir = %alloc_dir.display(), "using alloc directory");
        config.alloc_dir = Some(alloc_dir);

        let node = Self::setup_node(&mut config, &state_dir)?;

        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_BUFFER);
        let (shutdown_notifier, shutdown_signal) = shutdown::channel();

        let snapshot = Arc::new(AgentSnapshot {
            config: config.clone(),
            node: node.clone(),
        });
        let agent = Arc::new(Agent {
            start: Instant::now(),
            shared: RwLock::new(SharedState {
                config,
                node,
                snapshot,
            }),
            rpc: RpcClient::new(Arc::clone(&pool), rpc_handler),
            factory,
            allocs: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashMap::new()),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
            heartbeat: Mutex::new(HeartbeatState {
                last_heartbeat: Instant::now(),
                heartbeat_ttl: Duration::ZERO,
            }),
            last_heartbeat_from_quorum: AtomicBool::new(false),
            collector: Arc::new(ProcStatsCollector::new()),
            resource_usage: RwLock::new(None),
            metrics: Arc::new(AgentMetrics::new()),
            shutdown_flag: Mutex::new(false),
            shutdown_notifier,
            shutdown: shutdown_signal,
        });

        let periodic = agent.fingerprint();
        agent.reserve_ports();
        agent.refresh_snapshot();

        {
            let servers = agent.shared.read().config.servers.clone();
            for addr in &servers {
                pool.add_primary_server(addr);
            }
        }

        if let Err(e) = agent.restore_state() {
            // Individual allocations failed to restore; the rest run.
            error!(error = %e, "failed to restore state");
        }

        tokio::spawn(Arc::clone(&agent).register_and_heartbeat());
        tokio::spawn(Arc::clone(&agent).periodic_snapshot());
        tokio::spawn(Arc::clone(&agent).alloc_sync());
        tokio::spawn(Arc::clone(&agent).run());
        tokio::spawn(Arc::clone(&agent).collect_host_stats());
        for (name, fp, interval) in periodic {
            tokio::spawn(Arc::clone(&agent).fingerprint_periodic(name, fp, interval));
        }

        Ok(agent)
    }

    /// Builds the node from operator-seeded fields plus generated
    /// identity and defaults.
    fn setup_node(config: &mut Config, state_dir: &std::path::Path) -> Result<Node, AgentError> {
        let mut node = config.node.take().unwrap_or_default();

        node.id = if config.dev_mode {
            uuid::Uuid::new_v4().to_string()
        } else {
            state::read_or_generate_node_id(state_dir)?
        };
        if node.datacenter.is_empty() {
            node.datacenter = "dc1".to_string();
        }
        if node.region.is_empty() {
            node.region = config.region.clone();
        }
        if node.name.is_empty() {
            node.name = fingerprint::hostname().unwrap_or_default();
        }
        if node.name.is_empty() {
            node.name = node.id.clone();
        }
        node.status = NodeStatus::Init;
        Ok(node)
    }

    // ────────────────────────────────────────────────────────────────────
    // Fingerprinting
    // ────────────────────────────────────────────────────────────────────

    /// Runs every whitelisted built-in fingerprinter once under the
    /// config write lock; returns the periodic ones for their loops.
    fn fingerprint(&self) -> Vec<(&'static str, Box<dyn Fingerprint>, Duration)> {
        let whitelist = self
            .shared
            .read()
            .config
            .read_string_list_to_map("fingerprint.whitelist");
        let whitelist_enabled = !whitelist.is_empty();

        let mut applied = Vec::new();
        let mut skipped = Vec::new();
        let mut periodic = Vec::new();

        for name in fingerprint::BUILTIN_FINGERPRINTS.iter().copied() {
            if whitelist_enabled && !whitelist.contains(name) {
                skipped.push(name);
                continue;
            }
            let Some(fp) = fingerprint::new_fingerprint(name) else {
                continue;
            };
            {
                let mut shared = self.shared.write();
                let SharedState { config, node, .. } = &mut *shared;
                match fp.fingerprint(config, node) {
                    Ok(true) => applied.push(name),
                    Ok(false) => {}
                    Err(e) => warn!(fingerprint = name, error = %e, "fingerprint failed"),
                }
            }
            if let Some(interval) = fp.periodic() {
                periodic.push((name, fp, interval));
            }
        }

        debug!(?applied, "applied fingerprints");
        if !skipped.is_empty() {
            debug!(?skipped, "fingerprint modules skipped due to whitelist");
        }
        periodic
    }

    /// Re-invokes one periodic fingerprinter at its interval until
    /// shutdown. Per-tick errors are logged and retried next tick.
    async fn fingerprint_periodic(
        self: Arc<Self>,
        name: &'static str,
        fp: Box<dyn Fingerprint>,
        interval: Duration,
    ) {
        debug!(fingerprint = name, ?interval, "fingerprinting periodically");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                _ = tokio::time::sleep(interval) => {
                    let mut shared = self.shared.write();
                    let SharedState { config, node, .. } = &mut *shared;
                    if let Err(e) = fp.fingerprint(config, node) {
                        debug!(fingerprint = name, error = %e, "periodic fingerprint failed");
                    }
                }
            }
        }
    }

    /// Merges the globally-reserved ports into the reservation entry of
    /// every fingerprinted network device, keyed by IP and free of
    /// duplicates.
    fn reserve_ports(&self) {
        let mut shared = self.shared.write();
        let global = shared.config.globally_reserved_ports.clone();
        if global.is_empty() {
            return;
        }

        let node = &mut shared.node;
        let mut reserved_index: HashMap<String, drover_common::NetworkResource> = node
            .reserved
            .networks
            .drain(..)
            .map(|net| (net.ip.clone(), net))
            .collect();

        for net in &node.resources.networks {
            let entry = reserved_index
                .entry(net.ip.clone())
                .or_insert_with(|| net.reservation_copy());
            for port in &global {
                entry.reserve_port(*port);
            }
        }

        let mut networks: Vec<_> = reserved_index.into_values().collect();
        networks.sort_by(|a, b| a.ip.cmp(&b.ip));
        node.reserved.networks = networks;
    }

    // ────────────────────────────────────────────────────────────────────
    // Shared-state access
    // ────────────────────────────────────────────────────────────────────

    /// Rebuilds the runner-facing snapshot from the live config and
    /// node. Call after any node mutation.
    pub(crate) fn refresh_snapshot(&self) {
        let mut shared = self.shared.write();
        shared.snapshot = Arc::new(AgentSnapshot {
            config: shared.config.clone(),
            node: shared.node.clone(),
        });
    }

    /// The current runner-facing snapshot.
    pub(crate) fn snapshot(&self) -> Arc<AgentSnapshot> {
        Arc::clone(&self.shared.read().snapshot)
    }

    /// A copy of the locally registered node.
    #[must_use]
    pub fn node(&self) -> Node {
        self.shared.read().node.clone()
    }

    #[must_use]
    pub fn region(&self) -> String {
        self.shared.read().config.region.clone()
    }

    #[must_use]
    pub fn datacenter(&self) -> String {
        self.shared.read().node.datacenter.clone()
    }

    pub(crate) fn dev_mode(&self) -> bool {
        self.shared.read().config.dev_mode
    }

    /// Retry interval for `base`: flat one second in dev mode, otherwise
    /// a random value in `[base, 2·base)`.
    pub(crate) fn retry_interval(&self, base: Duration) -> Duration {
        if self.dev_mode() {
            DEV_MODE_RETRY_INTERVAL
        } else {
            base + random_stagger(base)
        }
    }

    /// A consistent snapshot of the current runner set.
    pub(crate) fn alloc_runners(&self) -> HashMap<String, Arc<dyn AllocRunner>> {
        self.allocs.read().clone()
    }

    pub(crate) fn status_sender(&self) -> StatusUpdateSender {
        StatusUpdateSender::new(
            self.shared.read().node.id.clone(),
            self.updates_tx.clone(),
            self.shutdown.clone(),
        )
    }

    /// Takes the status-update receiver; the sync loop is its single
    /// consumer.
    pub(crate) fn take_updates_rx(&self) -> Option<mpsc::Receiver<AllocStatusUpdate>> {
        self.updates_rx.lock().take()
    }

    // ────────────────────────────────────────────────────────────────────
    // Persistence passes
    // ────────────────────────────────────────────────────────────────────

    /// Restores one runner per allocation directory on disk. Failures
    /// are collected; successfully restored runners are launched.
    pub(crate) fn restore_state(&self) -> Result<(), StateError> {
        if self.dev_mode() {
            return Ok(());
        }
        let state_dir = match self.shared.read().config.state_dir.clone() {
            Some(dir) => dir,
            None => return Ok(()),
        };

        let mut errors = Vec::new();
        for id in state::list_alloc_state_ids(&state_dir)? {
            let alloc = Allocation {
                id: id.clone(),
                ..Allocation::default()
            };
            let runner = (self.factory)(self.snapshot(), self.status_sender(), alloc);
            self.allocs.write().insert(id.clone(), Arc::clone(&runner));
            match runner.restore_state() {
                Ok(()) => {
                    tokio::spawn(runner.run());
                }
                Err(e) => {
                    error!(alloc_id = %id, error = %e, "failed to restore state for alloc");
                    errors.push(format!("alloc {id}: {e}"));
                }
            }
        }
        StateError::from_collected(errors)
    }

    /// Snapshots every runner's state. Failures are collected; the pass
    /// never aborts early.
    pub(crate) fn save_state(&self) -> Result<(), StateError> {
        if self.dev_mode() {
            return Ok(());
        }
        let mut errors = Vec::new();
        for (id, runner) in self.alloc_runners() {
            if let Err(e) = runner.save_state() {
                error!(alloc_id = %id, error = %e, "failed to save state for alloc");
                AgentMetrics::incr(&self.metrics.state_save_failures);
                errors.push(format!("alloc {id}: {e}"));
            }
        }
        StateError::from_collected(errors)
    }

    /// Periodically snapshots runner state to disk.
    async fn periodic_snapshot(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                _ = tokio::time::sleep(STATE_SNAPSHOT_INTERVAL) => {
                    if let Err(e) = self.save_state() {
                        error!(error = %e, "failed to save state");
                    }
                }
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Host stats
    // ────────────────────────────────────────────────────────────────────

    /// Collects host resource usage on the configured interval, starting
    /// immediately.
    async fn collect_host_stats(self: Arc<Self>) {
        let interval = self.shared.read().config.stats_collection_interval;
        let mut next = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => return,
                _ = tokio::time::sleep_until(next) => {
                    next = Instant::now() + interval;
                    match self.collector.collect() {
                        Ok(sample) => *self.resource_usage.write() = Some(sample),
                        Err(e) => warn!(error = %e, "error fetching host resource usage stats"),
                    }
                }
            }
        }
    }

    /// The most recent host resource-usage sample, if one was collected.
    #[must_use]
    pub fn latest_host_stats(&self) -> Option<HostStats> {
        self.resource_usage.read().clone()
    }

    /// Task statistics of one allocation.
    pub fn alloc_stats(&self, alloc_id: &str) -> Result<AllocStatistics, AgentError> {
        let runner = self
            .allocs
            .read()
            .get(alloc_id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAlloc(alloc_id.to_string()))?;
        Ok(runner.stats())
    }

    /// Debugging counters for the agent's sub-systems.
    #[must_use]
    pub fn stats(&self) -> HashMap<String, HashMap<String, String>> {
        let num_allocs = self.allocs.read().len();
        let (last_heartbeat, heartbeat_ttl) = {
            let hb = self.heartbeat.lock();
            (hb.last_heartbeat.elapsed(), hb.heartbeat_ttl)
        };
        let mut client = HashMap::new();
        client.insert("node_id".to_string(), self.shared.read().node.id.clone());
        client.insert(
            "known_servers".to_string(),
            self.rpc.pool().num_servers().to_string(),
        );
        client.insert("num_allocations".to_string(), num_allocs.to_string());
        client.insert(
            "last_heartbeat".to_string(),
            format!("{last_heartbeat:?}"),
        );
        client.insert("heartbeat_ttl".to_string(), format!("{heartbeat_ttl:?}"));

        let mut out = HashMap::new();
        out.insert("client".to_string(), client);
        out
    }

    /// Prometheus exposition of the agent counters and latest host
    /// gauges.
    #[must_use]
    pub fn metrics_text(&self) -> String {
        self.metrics
            .to_prometheus(self.resource_usage.read().as_ref())
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<AgentMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Number of allocations currently supervised.
    #[must_use]
    pub fn num_allocations(&self) -> usize {
        self.allocs.read().len()
    }

    /// Adds a server to the pool's primary list.
    pub fn add_primary_server(&self, addr: &str) {
        self.rpc.pool().add_primary_server(addr);
    }

    // ────────────────────────────────────────────────────────────────────
    // Shutdown
    // ────────────────────────────────────────────────────────────────────

    /// Tears the agent down. Idempotent: only the first call acts.
    ///
    /// Dev mode destroys the running allocations and waits for them;
    /// otherwise their state is saved and they are left to be recovered
    /// on the next start.
    pub async fn shutdown(&self) -> Result<(), StateError> {
        {
            let mut flag = self.shutdown_flag.lock();
            if *flag {
                return Ok(());
            }
            *flag = true;
        }
        info!("agent shutting down");

        if self.dev_mode() {
            let runners: Vec<_> = self.allocs.read().values().cloned().collect();
            for runner in &runners {
                runner.destroy();
            }
            for runner in &runners {
                runner.wait().await;
            }
        }

        self.shutdown_notifier.notify();
        self.save_state()
    }

    /// Whether shutdown has been initiated.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_flag.lock()
    }
}
