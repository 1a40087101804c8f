//! # Agent Metrics
//!
//! Lock-free counters for the agent's control loops, exposed as
//! Prometheus text. All fields are `AtomicU64`; increments use relaxed
//! ordering (monotonic counters need no synchronization), reads for the
//! exposition snapshot use `SeqCst`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::stats::HostStats;

/// Counters for one agent process.
#[derive(Debug, Default)]
pub struct AgentMetrics {
    pub registrations: AtomicU64,
    pub heartbeats: AtomicU64,
    pub heartbeat_failures: AtomicU64,
    pub allocs_added: AtomicU64,
    pub allocs_updated: AtomicU64,
    pub allocs_removed: AtomicU64,
    pub allocs_blocked: AtomicU64,
    pub blocked_released: AtomicU64,
    pub alloc_pulls: AtomicU64,
    pub sync_batches: AtomicU64,
    pub sync_failures: AtomicU64,
    pub state_save_failures: AtomicU64,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders all counters, plus gauges from the latest host-stats
    /// sample when one is available, in Prometheus exposition format.
    #[must_use]
    pub fn to_prometheus(&self, host: Option<&HostStats>) -> String {
        let mut out = String::new();
        let mut counter = |name: &str, value: u64| {
            out.push_str(&format!(
                "# TYPE drover_agent_{name} counter\ndrover_agent_{name} {value}\n"
            ));
        };
        counter("registrations_total", self.registrations.load(Ordering::SeqCst));
        counter("heartbeats_total", self.heartbeats.load(Ordering::SeqCst));
        counter(
            "heartbeat_failures_total",
            self.heartbeat_failures.load(Ordering::SeqCst),
        );
        counter("allocs_added_total", self.allocs_added.load(Ordering::SeqCst));
        counter("allocs_updated_total", self.allocs_updated.load(Ordering::SeqCst));
        counter("allocs_removed_total", self.allocs_removed.load(Ordering::SeqCst));
        counter("allocs_blocked_total", self.allocs_blocked.load(Ordering::SeqCst));
        counter(
            "blocked_released_total",
            self.blocked_released.load(Ordering::SeqCst),
        );
        counter("alloc_pulls_total", self.alloc_pulls.load(Ordering::SeqCst));
        counter("sync_batches_total", self.sync_batches.load(Ordering::SeqCst));
        counter("sync_failures_total", self.sync_failures.load(Ordering::SeqCst));
        counter(
            "state_save_failures_total",
            self.state_save_failures.load(Ordering::SeqCst),
        );

        if let Some(host) = host {
            let mut gauge = |name: &str, value: f64| {
                out.push_str(&format!(
                    "# TYPE drover_host_{name} gauge\ndrover_host_{name} {value}\n"
                ));
            };
            gauge("memory_total_bytes", host.memory.total as f64);
            gauge("memory_available_bytes", host.memory.available as f64);
            gauge("memory_used_bytes", host.memory.used as f64);
            gauge("uptime_seconds", host.uptime_secs as f64);
        }
        out
    }
}
