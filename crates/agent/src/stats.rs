//! # Host & Task Statistics
//!
//! Two reporting surfaces live here:
//!
//! - **Host stats** — CPU, memory, and uptime of the machine, collected
//!   on a fixed interval into the agent's resource-usage cache and
//!   served from [`crate::agent::Agent::latest_host_stats`].
//! - **Task statistics** — per-replication-task counters (row counts,
//!   binlog coordinates, throughput) owned by the allocation runners and
//!   surfaced through their stats reporters.
//!
//! The default host collector reads `/proc` directly. CPU percentages
//! are deltas between consecutive samples, so the first collection after
//! boot reports zeros.

use std::collections::HashMap;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════
// HOST STATS MODEL
// ════════════════════════════════════════════════════════════════════════════

/// Memory usage of the host, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub free: u64,
}

/// Usage of one CPU, in percent over the last collection interval.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    /// CPU label, e.g. `cpu0`.
    pub cpu: String,
    pub user: f64,
    pub system: f64,
    pub idle: f64,
    pub total: f64,
}

/// One host resource-usage sample.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostStats {
    pub memory: MemoryStats,
    pub cpu: Vec<CpuStats>,
    pub uptime_secs: u64,
    /// Unix nanoseconds at collection time.
    pub timestamp: i64,
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("host stats unavailable: {0}")]
    Unavailable(String),
}

/// Source of host resource-usage samples.
pub trait HostStatsCollector: Send + Sync {
    fn collect(&self) -> Result<HostStats, StatsError>;
}

// ════════════════════════════════════════════════════════════════════════════
// /proc COLLECTOR
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy, Debug, Default)]
struct CpuTicks {
    user: u64,
    system: u64,
    idle: u64,
    total: u64,
}

/// Host stats collector backed by `/proc`.
pub struct ProcStatsCollector {
    last_cpu: Mutex<HashMap<String, CpuTicks>>,
}

impl ProcStatsCollector {
    pub fn new() -> Self {
        ProcStatsCollector {
            last_cpu: Mutex::new(HashMap::new()),
        }
    }

    fn memory() -> Result<MemoryStats, StatsError> {
        let meminfo = fs::read_to_string("/proc/meminfo")
            .map_err(|e| StatsError::Unavailable(e.to_string()))?;
        let mut stats = MemoryStats::default();
        for line in meminfo.lines() {
            let field = |prefix: &str| -> Option<u64> {
                line.strip_prefix(prefix)
                    .and_then(|rest| rest.trim().trim_end_matches(" kB").trim().parse().ok())
                    .map(|kb: u64| kb * 1024)
            };
            if let Some(v) = field("MemTotal:") {
                stats.total = v;
            } else if let Some(v) = field("MemAvailable:") {
                stats.available = v;
            } else if let Some(v) = field("MemFree:") {
                stats.free = v;
            }
        }
        stats.used = stats.total.saturating_sub(stats.available);
        Ok(stats)
    }

    fn uptime() -> u64 {
        fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|s| s.split_whitespace().next().map(str::to_string))
            .and_then(|s| s.parse::<f64>().ok())
            .map(|f| f as u64)
            .unwrap_or(0)
    }

    fn cpu_ticks() -> Result<HashMap<String, CpuTicks>, StatsError> {
        let stat = fs::read_to_string("/proc/stat")
            .map_err(|e| StatsError::Unavailable(e.to_string()))?;
        let mut out = HashMap::new();
        for line in stat.lines() {
            let mut parts = line.split_whitespace();
            let Some(label) = parts.next() else { continue };
            if !label.starts_with("cpu") || label == "cpu" {
                continue;
            }
            let fields: Vec<u64> = parts.filter_map(|p| p.parse().ok()).collect();
            if fields.len() < 4 {
                continue;
            }
            // user nice system idle iowait irq softirq ...
            let ticks = CpuTicks {
                user: fields[0] + fields[1],
                system: fields[2],
                idle: fields[3],
                total: fields.iter().sum(),
            };
            out.insert(label.to_string(), ticks);
        }
        Ok(out)
    }

    fn percent(part: u64, whole: u64) -> f64 {
        if whole == 0 {
            0.0
        } else {
            part as f64 / whole as f64 * 100.0
        }
    }
}

impl Default for ProcStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl HostStatsCollector for ProcStatsCollector {
    fn collect(&self) -> Result<HostStats, StatsError> {
        let memory = Self::memory()?;
        let current = Self::cpu_ticks()?;

        let mut cpu = Vec::with_capacity(current.len());
        {
            let mut last = self.last_cpu.lock();
            for (label, ticks) in &current {
                let prev = last.get(label).copied().unwrap_or_default();
                let d_total = ticks.total.saturating_sub(prev.total);
                let d_user = ticks.user.saturating_sub(prev.user);
                let d_system = ticks.system.saturating_sub(prev.system);
                let d_idle = ticks.idle.saturating_sub(prev.idle);
                cpu.push(CpuStats {
                    cpu: label.clone(),
                    user: Self::percent(d_user, d_total),
                    system: Self::percent(d_system, d_total),
                    idle: Self::percent(d_idle, d_total),
                    total: Self::percent(d_total.saturating_sub(d_idle), d_total),
                });
            }
            *last = current;
        }
        cpu.sort_by(|a, b| a.cpu.cmp(&b.cpu));

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        Ok(HostStats {
            memory,
            cpu,
            uptime_secs: Self::uptime(),
            timestamp,
        })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TASK STATISTICS
// ════════════════════════════════════════════════════════════════════════════

/// Replication-stream position of one task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentCoordinates {
    pub file: String,
    pub position: i64,
    pub gtid_set: String,
    pub relay_master_log_file: String,
    pub read_master_log_pos: i64,
    pub executed_gtid_set: String,
}

/// Row-change counters of one task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub insert_count: i64,
    pub update_count: i64,
    pub del_count: i64,
}

/// Count-over-time pair (events and the interval they span).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputStat {
    pub num: u64,
    pub time: u64,
}

/// Message-broker traffic counters of one task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgStat {
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
}

/// Statistics of one replication task, reported by its runner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub current_coordinates: Option<CurrentCoordinates>,
    pub table_stats: Option<TableStats>,
    pub delay_count: Option<ThroughputStat>,
    pub throughput_stat: Option<ThroughputStat>,
    pub msg_stat: MsgStat,
    pub rows_count: i64,
    pub status: String,
    pub timestamp: i64,
}

/// All task statistics of one allocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocStatistics {
    pub tasks: HashMap<String, TaskStatistics>,
}
