//! Watch supervisor — owns one session task per active repository.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use lum_domain::discovery::JobQueue;
use lum_domain::repository::Repository;

use crate::session::{WatchSession, WatchSessionConfig};
use crate::watchman::Connector;

pub struct WatchSupervisor {
    cancel: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WatchSupervisor {
    /// Spawn one session per active repository. Inactive repositories
    /// are skipped; a repository id is never watched twice by one
    /// process.
    pub fn start(
        repositories: Vec<Repository>,
        config: WatchSessionConfig,
        connector: Arc<dyn Connector>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        let mut seen = HashSet::new();

        for repo in repositories {
            if !repo.active {
                tracing::info!(repo = %repo.name, "repository inactive, not watching");
                continue;
            }
            if !seen.insert(repo.repo_id) {
                tracing::warn!(repo = %repo.name, "duplicate repository id, already watched");
                continue;
            }

            let span = tracing::info_span!("watch", repo = %repo.name);
            let session = WatchSession::new(
                repo,
                config.clone(),
                connector.clone(),
                queue.clone(),
                cancel.child_token(),
            );
            handles.push(tokio::spawn(session.run().instrument(span)));
        }

        tracing::info!(sessions = handles.len(), "watch supervisor started");
        Self { cancel, handles }
    }

    pub fn session_count(&self) -> usize {
        self.handles.len()
    }

    /// Cancel every session and wait for clean exits (each persists its
    /// last seen clock on the way out).
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("watch supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::MemoryJobQueue;
    use crate::watchman::Transport;
    use lum_domain::{Error, Result};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NeverConnector {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Connector for NeverConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Watch("no service in tests".into()))
        }
    }

    fn repo(name: &str, path: PathBuf, active: bool) -> Repository {
        Repository {
            repo_id: uuid::Uuid::new_v4(),
            name: name.into(),
            path,
            active,
        }
    }

    fn config() -> WatchSessionConfig {
        WatchSessionConfig {
            settle: std::time::Duration::from_secs(2),
            poll_interval: None,
            initial_scan: true,
            extensions: ["jpg".to_string()].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn inactive_repositories_are_not_watched() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = WatchSupervisor::start(
            vec![repo("idle", dir.path().to_path_buf(), false)],
            config(),
            Arc::new(NeverConnector {
                calls: AtomicU32::new(0),
            }),
            Arc::new(MemoryJobQueue::new()),
        );
        assert_eq!(supervisor.session_count(), 0);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_repository_ids_spawn_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = repo("main", dir.path().to_path_buf(), true);
        let b = Repository {
            repo_id: a.repo_id,
            ..a.clone()
        };
        a.name = "main-again".into();

        let supervisor = WatchSupervisor::start(
            vec![a, b],
            config(),
            Arc::new(NeverConnector {
                calls: AtomicU32::new(0),
            }),
            Arc::new(MemoryJobQueue::new()),
        );
        assert_eq!(supervisor.session_count(), 1);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn unmarked_root_session_exits_by_itself() {
        // No .lumilio marker: the session refuses and never dials.
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(NeverConnector {
            calls: AtomicU32::new(0),
        });
        let supervisor = WatchSupervisor::start(
            vec![repo("plain", dir.path().to_path_buf(), true)],
            config(),
            connector.clone(),
            Arc::new(MemoryJobQueue::new()),
        );
        assert_eq!(supervisor.session_count(), 1);
        supervisor.shutdown().await;
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }
}
