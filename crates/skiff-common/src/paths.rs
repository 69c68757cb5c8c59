//! Filesystem layout of the daemon.
//!
//! ```text
//! <root>/network/state.json            registry state
//! <runtime>/containers/<id>/vsock.sock container VM hybrid vsock
//! <runtime>/helper/vsock.sock          helper VM hybrid vsock
//! ```
//!
//! `SKIFF_ROOT` and `SKIFF_RUNTIME_DIR` override the default locations.

use std::path::PathBuf;

use once_cell::sync::Lazy;

const DEFAULT_ROOT: &str = "/var/lib/skiff";
const DEFAULT_RUNTIME_DIR: &str = "/run/skiff";

static FROM_ENV: Lazy<SkiffPaths> = Lazy::new(|| {
    let dir = |var: &str, fallback: &str| {
        std::env::var_os(var).map_or_else(|| PathBuf::from(fallback), PathBuf::from)
    };
    SkiffPaths {
        root: dir("SKIFF_ROOT", DEFAULT_ROOT),
        runtime: dir("SKIFF_RUNTIME_DIR", DEFAULT_RUNTIME_DIR),
    }
});

/// Data and runtime directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkiffPaths {
    /// Persistent data.
    pub root: PathBuf,
    /// Sockets and other state that does not survive a reboot.
    pub runtime: PathBuf,
}

impl SkiffPaths {
    /// The default layout, honoring the environment overrides.
    #[must_use]
    pub fn new() -> Self {
        FROM_ENV.clone()
    }

    /// Everything under `root`, with the runtime directory at `root/run`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            runtime: root.join("run"),
            root,
        }
    }

    /// Directory of the network registry.
    #[must_use]
    pub fn networks(&self) -> PathBuf {
        self.root.join("network")
    }

    /// Registry state file.
    #[must_use]
    pub fn network_state(&self) -> PathBuf {
        self.networks().join("state.json")
    }

    /// Hybrid vsock socket of a container VM.
    #[must_use]
    pub fn container_vsock(&self, id: &str) -> PathBuf {
        self.runtime.join("containers").join(id).join("vsock.sock")
    }

    /// Hybrid vsock socket of the helper VM.
    #[must_use]
    pub fn helper_vsock(&self) -> PathBuf {
        self.runtime.join("helper").join("vsock.sock")
    }

    /// Create the directories the daemon writes to.
    ///
    /// # Errors
    ///
    /// Returns the first directory creation failure.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        [self.networks().as_path(), self.runtime.as_path()]
            .into_iter()
            .try_for_each(std::fs::create_dir_all)
    }
}

impl Default for SkiffPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_under_custom_root() {
        let paths = SkiffPaths::with_root("/srv/skiff");
        assert_eq!(paths.runtime, PathBuf::from("/srv/skiff/run"));
        assert_eq!(
            paths.network_state(),
            PathBuf::from("/srv/skiff/network/state.json")
        );
        assert_eq!(
            paths.container_vsock("abc123"),
            PathBuf::from("/srv/skiff/run/containers/abc123/vsock.sock")
        );
        assert_eq!(
            paths.helper_vsock(),
            PathBuf::from("/srv/skiff/run/helper/vsock.sock")
        );
    }

    #[test]
    fn create_dirs_under_temp_root() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SkiffPaths::with_root(dir.path());
        paths.create_dirs().unwrap();
        assert!(paths.networks().is_dir());
        assert!(paths.runtime.is_dir());
    }
}
