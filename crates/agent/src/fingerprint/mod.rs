//! # Fingerprint Pipeline
//!
//! Fingerprinters populate the node's attribute map and resource
//! inventory from the local environment. Each is a small pluggable unit:
//! one probe call that may apply attributes, plus an optional periodic
//! interval at which the agent re-invokes it until shutdown.
//!
//! Rules of the pipeline:
//! - A non-empty `fingerprint.whitelist` config option filters the
//!   built-in set; skipped names are logged.
//! - Every enabled fingerprinter runs once at boot under the node write
//!   lock; periodic ones additionally get a background loop.
//! - Errors are logged and non-fatal, both at boot and per tick.
//! - Fingerprinters only ever *add* attributes. They must not clear
//!   keys owned by other fingerprinters.

use std::time::Duration;

use thiserror::Error;

use drover_common::Node;

use crate::config::Config;

mod arch;
mod cpu;
mod memory;
mod os;

pub use arch::ArchFingerprint;
pub use cpu::CpuFingerprint;
pub use memory::MemoryFingerprint;
pub use os::{hostname, OsFingerprint};

/// Error from a single fingerprint probe. Never fatal to the agent.
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("{probe} unavailable: {reason}")]
    Unavailable { probe: &'static str, reason: String },
}

/// A pluggable node fingerprinter.
pub trait Fingerprint: Send + Sync {
    /// Probes the environment, writing attributes and resources into
    /// `node`. Returns whether anything applied.
    fn fingerprint(&self, config: &Config, node: &mut Node) -> Result<bool, FingerprintError>;

    /// Interval at which the agent should re-run this fingerprinter, or
    /// `None` for one-shot.
    fn periodic(&self) -> Option<Duration> {
        None
    }
}

/// Built-in fingerprinter names, in execution order.
pub const BUILTIN_FINGERPRINTS: &[&str] = &["arch", "cpu", "memory", "os"];

/// Instantiates a built-in fingerprinter by name.
#[must_use]
pub fn new_fingerprint(name: &str) -> Option<Box<dyn Fingerprint>> {
    match name {
        "arch" => Some(Box::new(ArchFingerprint)),
        "cpu" => Some(Box::new(CpuFingerprint)),
        "memory" => Some(Box::new(MemoryFingerprint)),
        "os" => Some(Box::new(OsFingerprint)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_resolves() {
        for name in BUILTIN_FINGERPRINTS.iter().copied() {
            assert!(new_fingerprint(name).is_some(), "missing builtin {name}");
        }
        assert!(new_fingerprint("nope").is_none());
    }

    #[test]
    fn builtins_only_add_attributes() {
        let config = Config::default();
        let mut node = Node::default();
        node.attributes
            .insert("operator.custom".to_string(), "kept".to_string());
        for name in BUILTIN_FINGERPRINTS.iter().copied() {
            let f = new_fingerprint(name).expect("test: builtin");
            // Probe errors are acceptable on exotic hosts; clearing
            // foreign keys is not.
            let _ = f.fingerprint(&config, &mut node);
        }
        assert_eq!(
            node.attributes.get("operator.custom").map(String::as_str),
            Some("kept")
        );
    }

    #[test]
    fn builtins_are_one_shot() {
        for name in BUILTIN_FINGERPRINTS.iter().copied() {
            let f = new_fingerprint(name).expect("test: builtin");
            assert!(f.periodic().is_none(), "{name} should be one-shot");
        }
    }
}
