//! CPU architecture fingerprint.

use drover_common::Node;

use crate::config::Config;

use super::{Fingerprint, FingerprintError};

/// Records the compile-time target architecture under `arch`.
pub struct ArchFingerprint;

impl Fingerprint for ArchFingerprint {
    fn fingerprint(&self, _config: &Config, node: &mut Node) -> Result<bool, FingerprintError> {
        node.attributes
            .insert("arch".to_string(), std::env::consts::ARCH.to_string());
        Ok(true)
    }
}
