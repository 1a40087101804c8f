//! # State Persistence
//!
//! On-disk layout owned by the agent:
//!
//! ```text
//! {state_dir}/              # 0700
//! ├── client-id             # node UUID text, 0700
//! └── alloc/{alloc-id}/     # opaque, owned by the allocation runner
//! {alloc_dir}/              # 0755, per-alloc working directories
//! ```
//!
//! Dev mode skips all of it: a fresh UUID is generated per run and
//! nothing touches disk. A missing `alloc/` directory is an empty state,
//! not an error. Failures creating the directories or reading/writing
//! the ID file are the only fatal-init errors in the agent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

/// Subdirectory of the state dir holding per-alloc runner state.
pub const ALLOC_STATE_SUBDIR: &str = "alloc";

/// Filename of the persisted node ID.
pub const CLIENT_ID_FILE: &str = "client-id";

/// Errors from state-directory setup and node-ID persistence.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed creating state dir {path}: {source}")]
    CreateStateDir { path: PathBuf, source: io::Error },
    #[error("failed creating alloc dir {path}: {source}")]
    CreateAllocDir { path: PathBuf, source: io::Error },
    #[error("failed creating temporary directory: {0}")]
    TempDir(io::Error),
    #[error("node ID setup failed at {path}: {source}")]
    NodeId { path: PathBuf, source: io::Error },
    #[error("failed to list alloc state under {path}: {source}")]
    ListAllocState { path: PathBuf, source: io::Error },
    /// Per-item failures collected over a save or restore pass.
    #[error("{}", .0.join("; "))]
    Multi(Vec<String>),
}

impl StateError {
    /// Wraps a pass's collected failures, or `Ok` when there were none.
    pub fn from_collected(errors: Vec<String>) -> Result<(), StateError> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StateError::Multi(errors))
        }
    }
}

/// Creates `dir` with the given unix mode, succeeding if it already
/// exists.
fn ensure_dir(dir: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match fs::DirBuilder::new().recursive(true).mode(mode).create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Ensures the state directory exists (0700), creating a temp dir when
/// `state_dir` is unset. Returns the effective path.
pub fn init_state_dir(state_dir: Option<&Path>) -> Result<PathBuf, StateError> {
    match state_dir {
        Some(dir) => {
            ensure_dir(dir, 0o700).map_err(|source| StateError::CreateStateDir {
                path: dir.to_path_buf(),
                source,
            })?;
            Ok(dir.to_path_buf())
        }
        None => temp_dir("drover-agent-state"),
    }
}

/// Ensures the alloc directory exists (0755), creating a temp dir when
/// `alloc_dir` is unset. Returns the effective path.
pub fn init_alloc_dir(alloc_dir: Option<&Path>) -> Result<PathBuf, StateError> {
    match alloc_dir {
        Some(dir) => {
            ensure_dir(dir, 0o755).map_err(|source| StateError::CreateAllocDir {
                path: dir.to_path_buf(),
                source,
            })?;
            Ok(dir.to_path_buf())
        }
        None => temp_dir("drover-agent-alloc"),
    }
}

fn temp_dir(prefix: &str) -> Result<PathBuf, StateError> {
    let dir = std::env::temp_dir().join(format!("{}-{}", prefix, Uuid::new_v4()));
    ensure_dir(&dir, 0o700).map_err(StateError::TempDir)?;
    Ok(dir)
}

/// Reads the persisted node ID from `{state_dir}/client-id`, generating
/// and persisting a fresh UUID when the file is missing or empty.
///
/// The ID file is written 0700 so only the agent's user can read it.
/// Corruption is not second-guessed: whatever non-empty text is on disk
/// IS the node's identity.
pub fn read_or_generate_node_id(state_dir: &Path) -> Result<String, StateError> {
    use std::os::unix::fs::PermissionsExt;

    let id_path = state_dir.join(CLIENT_ID_FILE);
    match fs::read_to_string(&id_path) {
        Ok(existing) if !existing.is_empty() => return Ok(existing),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(StateError::NodeId {
                path: id_path,
                source,
            })
        }
    }

    let id = Uuid::new_v4().to_string();
    let write = fs::write(&id_path, &id).and_then(|()| {
        fs::set_permissions(&id_path, fs::Permissions::from_mode(0o700))
    });
    write.map_err(|source| StateError::NodeId {
        path: id_path,
        source,
    })?;
    Ok(id)
}

/// Lists the allocation IDs with state on disk under
/// `{state_dir}/alloc/`. A missing directory is an empty list.
pub fn list_alloc_state_ids(state_dir: &Path) -> Result<Vec<String>, StateError> {
    let alloc_state = state_dir.join(ALLOC_STATE_SUBDIR);
    let entries = match fs::read_dir(&alloc_state) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StateError::ListAllocState {
                path: alloc_state,
                source,
            })
        }
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StateError::ListAllocState {
            path: alloc_state.clone(),
            source,
        })?;
        if let Some(name) = entry.file_name().to_str() {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}
