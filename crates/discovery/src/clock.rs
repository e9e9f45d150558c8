//! Clock-token persistence.
//!
//! The token is an opaque cursor into watchman's change log, stored as a
//! single line at `<root>/.lumilio/watchman.clock`. A token is only ever
//! used with the repository it was written for; when the service rejects
//! it the file is cleared and the session falls back to a full rescan.

use std::path::{Path, PathBuf};

use lum_domain::repository::SYSTEM_DIR;
use lum_domain::Result;

const CLOCK_FILE: &str = "watchman.clock";

pub struct ClockStore {
    dir: PathBuf,
    path: PathBuf,
}

impl ClockStore {
    pub fn new(repo_root: &Path) -> Self {
        let dir = repo_root.join(SYSTEM_DIR);
        let path = dir.join(CLOCK_FILE);
        Self { dir, path }
    }

    /// The persisted token, if any. A missing or empty file reads as
    /// `None`.
    pub fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => {
                let token = text.trim().to_string();
                Ok(if token.is_empty() { None } else { Some(token) })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a token, creating the system directory if missing
    /// (0755 dir, 0644 file).
    pub fn save(&self, token: &str) -> Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o755))?;
            }
        }
        std::fs::write(&self.path, format!("{token}\n"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o644))?;
        }
        tracing::debug!(path = %self.path.display(), "clock token persisted");
        Ok(())
    }

    /// Remove the token (stale-clock recovery). Missing file is fine.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
