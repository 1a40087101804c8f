//! CPU core-count and frequency fingerprint.

use std::fs;

use drover_common::Node;

use crate::config::Config;

use super::{Fingerprint, FingerprintError};

/// Records core count and, where `/proc/cpuinfo` is readable, the clock
/// frequency and derived total compute (MHz × cores) used as the node's
/// CPU resource.
pub struct CpuFingerprint;

impl CpuFingerprint {
    fn clock_mhz() -> Option<f64> {
        let cpuinfo = fs::read_to_string("/proc/cpuinfo").ok()?;
        for line in cpuinfo.lines() {
            if let Some(rest) = line.strip_prefix("cpu MHz") {
                return rest.trim_start_matches([' ', '\t', ':']).trim().parse().ok();
            }
        }
        None
    }
}

impl Fingerprint for CpuFingerprint {
    fn fingerprint(&self, _config: &Config, node: &mut Node) -> Result<bool, FingerprintError> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .map_err(|e| FingerprintError::Unavailable {
                probe: "cpu",
                reason: e.to_string(),
            })?;
        node.attributes
            .insert("cpu.numcores".to_string(), cores.to_string());

        if let Some(mhz) = Self::clock_mhz() {
            node.attributes
                .insert("cpu.frequency".to_string(), format!("{mhz:.0}"));
            let total = (mhz * cores as f64) as u64;
            node.attributes
                .insert("cpu.totalcompute".to_string(), total.to_string());
            if node.resources.cpu == 0 {
                node.resources.cpu = total;
            }
        }
        Ok(true)
    }
}
