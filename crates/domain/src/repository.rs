use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Directory that marks a path as a configured repository root and holds
/// per-repository state (clock tokens, caches). Never ingested.
pub const SYSTEM_DIR: &str = ".lumilio";

/// Staging directory for uploads in flight; excluded from discovery until
/// the upload pipeline moves files into their final location.
pub const INBOX_DIR: &str = "inbox";

/// A photo repository: one watched directory tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub repo_id: Uuid,
    pub name: String,
    /// Absolute path of the repository root.
    pub path: PathBuf,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Repository {
    /// Whether `path` carries the marker directory that distinguishes a
    /// configured repository root from an arbitrary parent directory.
    pub fn is_configured_root(path: &Path) -> bool {
        path.join(SYSTEM_DIR).is_dir()
    }

    pub fn system_dir(&self) -> PathBuf {
        self.path.join(SYSTEM_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!Repository::is_configured_root(dir.path()));
        std::fs::create_dir(dir.path().join(SYSTEM_DIR)).unwrap();
        assert!(Repository::is_configured_root(dir.path()));
    }

    #[test]
    fn active_defaults_to_true() {
        let repo: Repository = serde_json::from_value(serde_json::json!({
            "repo_id": Uuid::new_v4(),
            "name": "main",
            "path": "/photos/main",
        }))
        .unwrap();
        assert!(repo.active);
    }
}
