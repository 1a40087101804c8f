//! # Task Supervisor
//!
//! The default [`AllocRunner`] implementation. It keeps the allocation's
//! client-owned state, persists it as JSON under the agent's state
//! directory, and reports transitions through the status channel.
//!
//! Replication-task execution itself is pluggable at a lower layer; the
//! supervisor's job is the lifecycle: `pending → running` when launched,
//! terminal when destroyed, state on disk at every save point so a
//! restarted agent can pick the allocation back up.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, warn};

use drover_common::{AllocClientStatus, Allocation, TaskState};

use crate::config::AgentSnapshot;
use crate::runner::{AllocRunner, AllocRunnerFactory, RunnerError, StatusUpdateSender};
use crate::state::ALLOC_STATE_SUBDIR;
use crate::stats::{AllocStatistics, TaskStatistics};

/// Filename of the supervisor's persisted state inside its alloc state
/// directory.
const STATE_FILE: &str = "alloc.json";

/// Default per-allocation supervisor.
pub struct TaskSupervisor {
    alloc: RwLock<Allocation>,
    snapshot: Arc<AgentSnapshot>,
    updates: StatusUpdateSender,
    destroy_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

impl TaskSupervisor {
    pub fn new(
        snapshot: Arc<AgentSnapshot>,
        updates: StatusUpdateSender,
        alloc: Allocation,
    ) -> Self {
        let (destroy_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        TaskSupervisor {
            alloc: RwLock::new(alloc),
            snapshot,
            updates,
            destroy_tx,
            done_tx,
        }
    }

    fn state_dir(&self) -> Option<PathBuf> {
        if self.snapshot.config.dev_mode {
            return None;
        }
        let state_dir = self.snapshot.config.state_dir.as_ref()?;
        Some(
            state_dir
                .join(ALLOC_STATE_SUBDIR)
                .join(&self.alloc.read().id),
        )
    }

    /// Seeds task states from the payload's task map on first launch.
    fn seed_task_states(alloc: &mut Allocation, state: &str) {
        if alloc.task_states.is_empty() {
            if let Some(tasks) = alloc.payload.get("tasks").and_then(|t| t.as_object()) {
                for name in tasks.keys() {
                    alloc.task_states.insert(
                        name.clone(),
                        TaskState {
                            state: state.to_string(),
                            failed: false,
                        },
                    );
                }
            }
        }
    }

    fn set_all_tasks(alloc: &mut Allocation, state: &str) {
        for task in alloc.task_states.values_mut() {
            task.state = state.to_string();
        }
    }
}

#[async_trait]
impl AllocRunner for TaskSupervisor {
    fn alloc(&self) -> Allocation {
        self.alloc.read().clone()
    }

    fn should_update(&self, modify_index: u64) -> bool {
        modify_index > self.alloc.read().alloc_modify_index
    }

    async fn run(self: Arc<Self>) {
        let id = self.alloc.read().id.clone();

        if self.alloc.read().terminated() {
            // Restored in a terminal state; nothing left to drive.
            let _ = self.done_tx.send(true);
            return;
        }

        // The allocation owns its working directory for as long as it
        // lives on this node.
        if let Some(alloc_dir) = self.snapshot.config.alloc_dir.as_ref() {
            let work_dir = alloc_dir.join(&id);
            if let Err(e) = fs::create_dir_all(&work_dir) {
                warn!(alloc_id = %id, error = %e, "failed to create alloc working dir");
            }
        }

        let running = {
            let mut alloc = self.alloc.write();
            alloc.client_status = AllocClientStatus::Running;
            alloc.client_description = "tasks are running".to_string();
            Self::seed_task_states(&mut alloc, "running");
            Self::set_all_tasks(&mut alloc, "running");
            alloc.clone()
        };
        debug!(alloc_id = %id, "allocation running");
        self.updates.send(&running).await;

        let mut destroy_rx = self.destroy_tx.subscribe();
        let _ = destroy_rx.wait_for(|destroyed| *destroyed).await;

        let terminal = {
            let mut alloc = self.alloc.write();
            if !alloc.terminated() {
                alloc.client_status = AllocClientStatus::Complete;
                alloc.client_description = "allocation removed".to_string();
                Self::set_all_tasks(&mut alloc, "dead");
            }
            alloc.clone()
        };
        debug!(alloc_id = %id, status = ?terminal.client_status, "allocation terminal");
        self.updates.send(&terminal).await;

        if let Err(e) = self.save_state() {
            warn!(alloc_id = %id, error = %e, "failed to save terminal state");
        }
        let _ = self.done_tx.send(true);
    }

    fn update(&self, alloc: Allocation) {
        let mut current = self.alloc.write();
        // The server copy is authoritative for everything except the
        // client-owned fields, which this runner keeps.
        let client_status = current.client_status;
        let client_description = current.client_description.clone();
        let task_states = current.task_states.clone();
        *current = alloc;
        current.client_status = client_status;
        current.client_description = client_description;
        if !task_states.is_empty() {
            current.task_states = task_states;
        }
    }

    fn destroy(&self) {
        let _ = self.destroy_tx.send(true);
    }

    async fn wait(&self) {
        let mut done_rx = self.done_tx.subscribe();
        let _ = done_rx.wait_for(|done| *done).await;
    }

    fn save_state(&self) -> Result<(), RunnerError> {
        let Some(dir) = self.state_dir() else {
            return Ok(());
        };
        let alloc = self.alloc.read().clone();
        fs::create_dir_all(&dir).map_err(|e| RunnerError(format!("create {dir:?}: {e}")))?;
        let body = serde_json::to_vec_pretty(&alloc)
            .map_err(|e| RunnerError(format!("encode alloc {}: {e}", alloc.id)))?;
        // Write-then-rename so a crash never leaves a torn state file.
        let tmp = dir.join(format!("{STATE_FILE}.tmp"));
        let path = dir.join(STATE_FILE);
        fs::write(&tmp, body).map_err(|e| RunnerError(format!("write {tmp:?}: {e}")))?;
        fs::rename(&tmp, &path).map_err(|e| RunnerError(format!("rename {tmp:?}: {e}")))?;
        Ok(())
    }

    fn restore_state(&self) -> Result<(), RunnerError> {
        let Some(dir) = self.state_dir() else {
            return Ok(());
        };
        let path = dir.join(STATE_FILE);
        let body =
            fs::read(&path).map_err(|e| RunnerError(format!("read {path:?}: {e}")))?;
        let restored: Allocation = serde_json::from_slice(&body)
            .map_err(|e| RunnerError(format!("decode {path:?}: {e}")))?;
        *self.alloc.write() = restored;
        Ok(())
    }

    fn stats(&self) -> AllocStatistics {
        let alloc = self.alloc.read();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let tasks = alloc
            .task_states
            .iter()
            .map(|(name, task)| {
                (
                    name.clone(),
                    TaskStatistics {
                        status: task.state.clone(),
                        timestamp,
                        ..TaskStatistics::default()
                    },
                )
            })
            .collect();
        AllocStatistics { tasks }
    }
}

/// Factory producing [`TaskSupervisor`] runners; the default wiring for
/// the agent binary.
#[must_use]
pub fn supervisor_factory() -> AllocRunnerFactory {
    Arc::new(|snapshot, updates, alloc| {
        Arc::new(TaskSupervisor::new(snapshot, updates, alloc)) as Arc<dyn AllocRunner>
    })
}
