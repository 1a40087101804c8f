//! # Allocation Runner Interface
//!
//! The agent core supervises allocations but never executes them: each
//! allocation is handed to an opaque runner created by a factory. The
//! reconciler installs and removes runners, the watcher consults their
//! modify index, and runners stream client-owned status back through a
//! [`StatusUpdateSender`].
//!
//! Lifecycle contract, enforced by the reconciler:
//! - `run` is launched exactly once per installed runner.
//! - `update` may arrive any number of times while running.
//! - `destroy` is asynchronous: the index entry is already gone when it
//!   is invoked, and the runner drains on its own terminal path.
//! - `save_state`/`restore_state` own everything under the runner's
//!   state directory; the agent only ever passes the root.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use drover_common::{AllocStatusUpdate, Allocation};

use crate::config::AgentSnapshot;
use crate::shutdown::ShutdownSignal;
use crate::stats::AllocStatistics;

/// Error from a runner's persistence hooks. Collected, never fatal.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RunnerError(pub String);

/// A per-allocation supervisor.
#[async_trait]
pub trait AllocRunner: Send + Sync {
    /// The runner's current view of its allocation.
    fn alloc(&self) -> Allocation;

    /// Whether a server-side modify index requires pulling a fresh copy
    /// of the allocation.
    fn should_update(&self, modify_index: u64) -> bool;

    /// Drives the allocation until it terminates or is destroyed.
    async fn run(self: Arc<Self>);

    /// Applies a new server copy of the allocation.
    fn update(&self, alloc: Allocation);

    /// Requests teardown. Returns immediately; the run loop drains.
    fn destroy(&self);

    /// Completes once the run loop has exited.
    async fn wait(&self);

    fn save_state(&self) -> Result<(), RunnerError>;

    fn restore_state(&self) -> Result<(), RunnerError>;

    /// Latest task statistics for this allocation.
    fn stats(&self) -> AllocStatistics;
}

/// Creates a runner for one allocation.
///
/// Arguments: the shared config/node snapshot, the status-update sender
/// the runner reports through, and the allocation to supervise.
pub type AllocRunnerFactory =
    Arc<dyn Fn(Arc<AgentSnapshot>, StatusUpdateSender, Allocation) -> Arc<dyn AllocRunner> + Send + Sync>;

// ════════════════════════════════════════════════════════════════════════════
// STATUS UPDATE SENDER
// ════════════════════════════════════════════════════════════════════════════

/// Handle runners use to report status into the agent's sync loop.
///
/// Sends carry only the client-owned fields of the allocation. The
/// channel is bounded: a full buffer applies backpressure to the runner,
/// while a shutdown in progress drops the message instead of blocking
/// teardown.
#[derive(Clone)]
pub struct StatusUpdateSender {
    node_id: String,
    tx: mpsc::Sender<AllocStatusUpdate>,
    shutdown: ShutdownSignal,
}

impl StatusUpdateSender {
    pub fn new(
        node_id: String,
        tx: mpsc::Sender<AllocStatusUpdate>,
        shutdown: ShutdownSignal,
    ) -> Self {
        StatusUpdateSender {
            node_id,
            tx,
            shutdown,
        }
    }

    /// Queues a status update for `alloc`, stripped to the client-owned
    /// fields.
    pub async fn send(&self, alloc: &Allocation) {
        let update = AllocStatusUpdate {
            id: alloc.id.clone(),
            node_id: self.node_id.clone(),
            task_states: alloc.task_states.clone(),
            client_status: alloc.client_status,
            client_description: alloc.client_description.clone(),
        };
        tokio::select! {
            biased;
            _ = self.shutdown.wait() => {}
            _ = self.tx.send(update) => {}
        }
    }
}
