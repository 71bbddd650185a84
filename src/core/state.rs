//! State file management — load, save (atomic), path derivation.
//!
//! The state store is plain data: it is loaded once at the start of a run,
//! the resolver produces a new snapshot, and the snapshot is committed once at
//! the end. Until the final rename the previous state file is untouched.

use super::error::StateError;
use super::types::{StateRecord, StateStore};
use crate::provenance::eventlog::now_iso8601;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current state schema version.
pub const SCHEMA: &str = "1.0";

/// Default state directory, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".score-ecs";

/// Derive the state file path within the state directory.
pub fn state_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("state.yaml")
}

/// Create a new empty state.
pub fn new_state() -> StateStore {
    StateStore {
        schema: SCHEMA.to_string(),
        generator: format!("score-ecs {}", env!("CARGO_PKG_VERSION")),
        generated_at: None,
        workloads: Vec::new(),
        resources: Default::default(),
    }
}

impl StateStore {
    pub fn get(&self, id: &str) -> Option<&StateRecord> {
        self.resources.get(id)
    }

    pub fn insert(&mut self, id: &str, record: StateRecord) {
        self.resources.insert(id.to_string(), record);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        new_state()
    }
}

/// Load the state. A missing file is an empty state; an unreadable or corrupt
/// file is an error.
pub fn load_state(state_dir: &Path) -> Result<StateStore, StateError> {
    let path = state_file_path(state_dir);
    if !path.exists() {
        return Ok(new_state());
    }
    let content = std::fs::read_to_string(&path).map_err(|source| StateError::Read {
        path: path.clone(),
        source,
    })?;
    let state: StateStore = serde_yaml_ng::from_str(&content).map_err(|e| StateError::Parse {
        path: path.clone(),
        message: e.to_string(),
    })?;
    if state.schema.split('.').next() != SCHEMA.split('.').next() {
        return Err(StateError::UnsupportedSchema {
            path,
            found: state.schema,
        });
    }
    Ok(state)
}

/// Save the state atomically, stamping the commit time.
pub fn save_state(state_dir: &Path, state: &StateStore) -> Result<(), StateError> {
    let mut stamped = state.clone();
    stamped.generated_at = Some(now_iso8601());
    stamped.generator = format!("score-ecs {}", env!("CARGO_PKG_VERSION"));
    let yaml =
        serde_yaml_ng::to_string(&stamped).map_err(|e| StateError::Serialize(e.to_string()))?;
    write_atomic(&state_file_path(state_dir), yaml.as_bytes())
}

/// Write a file atomically: temp file in the same directory, fsync, rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StateError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StateError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let write = |tmp: &Path| -> std::io::Result<()> {
        let mut file = std::fs::File::create(tmp)?;
        file.write_all(contents)?;
        file.sync_all()
    };
    if let Err(source) = write(&tmp_path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(StateError::Write {
            path: tmp_path,
            source,
        });
    }
    std::fs::rename(&tmp_path, path).map_err(|source| StateError::Write {
        path: path.to_path_buf(),
        source,
    })
}
