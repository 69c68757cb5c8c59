//! On-disk registry state.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};

use crate::registry::{Attachment, Network};

/// Current state file format.
pub const STATE_VERSION: u32 = 1;

/// Everything the registry persists. Address allocations are rebuilt from
/// the attachments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Format version.
    pub version: u32,
    /// All networks.
    pub networks: Vec<Network>,
    /// All attachments.
    pub attachments: Vec<Attachment>,
}

/// JSON file holding [`PersistedState`].
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    /// Store at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state; `None` when nothing was saved yet.
    ///
    /// # Errors
    ///
    /// I/O failures, unparsable files or an unknown format version.
    pub fn load(&self) -> SkiffResult<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let state: PersistedState = serde_json::from_str(&content).map_err(|e| {
            SkiffError::Serialization(format!("failed to parse {}: {e}", self.path.display()))
        })?;
        if state.version > STATE_VERSION {
            return Err(SkiffError::Config {
                message: format!(
                    "{} has format version {}, newer than {STATE_VERSION}",
                    self.path.display(),
                    state.version
                ),
            });
        }
        Ok(Some(state))
    }

    /// Replace the state atomically (write a temp file, then rename).
    ///
    /// # Errors
    ///
    /// I/O or serialization failures; the previous file stays intact.
    pub fn save(&self, state: &PersistedState) -> SkiffResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| SkiffError::Serialization(format!("failed to serialize network state: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        tracing::trace!(path = %self.path.display(), networks = state.networks.len(), "Network state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("network/state.json"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn save_creates_parents_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("network/state.json"));
        let state = PersistedState {
            version: STATE_VERSION,
            ..PersistedState::default()
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));

        let names: Vec<_> = fs::read_dir(dir.path().join("network"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["state.json"]);
    }

    #[test]
    fn rejects_garbage_and_future_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("state.json"));

        fs::write(store.path(), "{ not json").unwrap();
        assert!(matches!(store.load(), Err(SkiffError::Serialization(_))));

        fs::write(store.path(), r#"{"version": 99, "networks": [], "attachments": []}"#).unwrap();
        assert!(matches!(store.load(), Err(SkiffError::Config { .. })));
    }
}
