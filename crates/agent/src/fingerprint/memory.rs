//! Total-memory fingerprint.

use std::fs;

use drover_common::Node;

use crate::config::Config;

use super::{Fingerprint, FingerprintError};

/// Reads `MemTotal` from `/proc/meminfo` into the node's memory resource
/// and a `memory.totalbytes` attribute.
pub struct MemoryFingerprint;

impl MemoryFingerprint {
    fn total_bytes() -> Option<u64> {
        let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                return Some(kb * 1024);
            }
        }
        None
    }
}

impl Fingerprint for MemoryFingerprint {
    fn fingerprint(&self, _config: &Config, node: &mut Node) -> Result<bool, FingerprintError> {
        let total = Self::total_bytes().ok_or(FingerprintError::Unavailable {
            probe: "memory",
            reason: "/proc/meminfo not readable".to_string(),
        })?;
        node.attributes
            .insert("memory.totalbytes".to_string(), total.to_string());
        if node.resources.memory_mb == 0 {
            node.resources.memory_mb = total / (1024 * 1024);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn reads_total_memory() {
        let mut node = Node::default();
        MemoryFingerprint
            .fingerprint(&Config::default(), &mut node)
            .expect("test: fingerprint");
        assert!(node.resources.memory_mb > 0);
        assert!(node.attributes.contains_key("memory.totalbytes"));
    }
}
