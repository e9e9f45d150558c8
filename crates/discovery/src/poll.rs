//! Poll fallback — the failure floor of discovery.
//!
//! A periodic full scan of the repository diffed against the previous
//! snapshot, converted into synthetic file deltas and fed through the
//! same handler as live pushes. Even if the notification service
//! silently stops delivering, discovery converges within one poll
//! period.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::filter::ExtensionFilter;
use crate::paths;
use crate::watchman::FileDelta;

#[derive(Debug, Clone, PartialEq)]
struct FileStamp {
    size: u64,
    mtime_ms: i64,
}

pub struct PollScanner {
    root: PathBuf,
    filter: ExtensionFilter,
    snapshot: HashMap<String, FileStamp>,
}

impl PollScanner {
    pub fn new(root: PathBuf, filter: ExtensionFilter) -> Self {
        Self {
            root,
            filter,
            snapshot: HashMap::new(),
        }
    }

    fn walk(&self) -> HashMap<String, FileStamp> {
        let mut current = HashMap::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let storage_path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if storage_path.is_empty()
                || paths::is_excluded(&storage_path)
                || !self.filter.matches(&storage_path)
            {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let mtime_ms = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            current.insert(
                storage_path,
                FileStamp {
                    size: metadata.len(),
                    mtime_ms,
                },
            );
        }
        current
    }

    /// Capture the baseline without emitting deltas. Called once at
    /// session start so the poll path does not duplicate the initial
    /// scan.
    pub fn prime(&mut self) {
        self.snapshot = self.walk();
        tracing::debug!(
            root = %self.root.display(),
            files = self.snapshot.len(),
            "poll snapshot primed"
        );
    }

    /// Full rescan; returns the diff against the previous snapshot as
    /// synthetic deltas. Blocking — run under `spawn_blocking`.
    pub fn scan(&mut self) -> Vec<FileDelta> {
        let current = self.walk();
        let mut deltas = Vec::new();

        for (path, stamp) in &current {
            match self.snapshot.get(path) {
                Some(old) if old == stamp => {}
                _ => deltas.push(FileDelta {
                    name: path.clone(),
                    exists: true,
                    size: Some(stamp.size),
                    mtime_ms: Some(stamp.mtime_ms),
                }),
            }
        }
        for path in self.snapshot.keys() {
            if !current.contains_key(path) {
                deltas.push(FileDelta {
                    name: path.clone(),
                    exists: false,
                    size: None,
                    mtime_ms: None,
                });
            }
        }

        if !deltas.is_empty() {
            tracing::debug!(
                root = %self.root.display(),
                deltas = deltas.len(),
                "poll fallback found changes"
            );
        }
        self.snapshot = current;
        deltas
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner(root: &Path) -> PollScanner {
        PollScanner::new(
            root.to_path_buf(),
            ExtensionFilter::from_extensions(["jpg", "mov"]),
        )
    }

    fn write(root: &Path, rel: &str, bytes: &[u8]) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn new_file_appears_as_upsert_delta() {
        let dir = tempfile::tempdir().unwrap();
        let mut scanner = scanner(dir.path());
        scanner.prime();

        write(dir.path(), "2024/new.jpg", b"bytes");
        let deltas = scanner.scan();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].name, "2024/new.jpg");
        assert!(deltas[0].exists);
        assert_eq!(deltas[0].size, Some(5));
    }

    #[test]
    fn unchanged_files_produce_no_deltas() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.jpg", b"bytes");
        let mut scanner = scanner(dir.path());
        scanner.prime();
        assert!(scanner.scan().is_empty());
    }

    #[test]
    fn removed_file_appears_as_delete_delta() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.jpg", b"bytes");
        let mut scanner = scanner(dir.path());
        scanner.prime();

        std::fs::remove_file(dir.path().join("a.jpg")).unwrap();
        let deltas = scanner.scan();
        assert_eq!(deltas.len(), 1);
        assert!(!deltas[0].exists);
        assert_eq!(deltas[0].name, "a.jpg");
    }

    #[test]
    fn size_change_is_a_delta() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.jpg", b"v1");
        let mut scanner = scanner(dir.path());
        scanner.prime();

        write(dir.path(), "a.jpg", b"v2-longer");
        let deltas = scanner.scan();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].size, Some(9));
    }

    #[test]
    fn excluded_and_unsupported_paths_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".lumilio/watchman.clock", b"c:1:2");
        write(dir.path(), "inbox/upload.jpg", b"staging");
        write(dir.path(), "notes.txt", b"text");
        write(dir.path(), "real.jpg", b"bytes");

        let mut scanner = scanner(dir.path());
        let deltas = scanner.scan();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].name, "real.jpg");
    }

    #[test]
    fn consecutive_scans_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.jpg", b"bytes");
        let mut scanner = scanner(dir.path());
        scanner.prime();

        write(dir.path(), "b.mov", b"video");
        assert_eq!(scanner.scan().len(), 1);
        assert!(scanner.scan().is_empty());
    }
}
