//! Operating system and hostname fingerprint.

use std::fs;

use drover_common::Node;

use crate::config::Config;

use super::{Fingerprint, FingerprintError};

/// Best-effort hostname: kernel first, environment as fallback.
#[must_use]
pub fn hostname() -> Option<String> {
    if let Ok(name) = fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}

/// Records the OS family, kernel release, and hostname.
pub struct OsFingerprint;

impl Fingerprint for OsFingerprint {
    fn fingerprint(&self, _config: &Config, node: &mut Node) -> Result<bool, FingerprintError> {
        node.attributes
            .insert("os.name".to_string(), std::env::consts::OS.to_string());
        if let Ok(release) = fs::read_to_string("/proc/sys/kernel/osrelease") {
            node.attributes
                .insert("kernel.version".to_string(), release.trim().to_string());
        }
        if let Some(host) = hostname() {
            node.attributes.insert("unique.hostname".to_string(), host);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_os_name() {
        let mut node = Node::default();
        OsFingerprint
            .fingerprint(&Config::default(), &mut node)
            .expect("test: fingerprint");
        assert_eq!(
            node.attributes.get("os.name").map(String::as_str),
            Some(std::env::consts::OS)
        );
    }
}
