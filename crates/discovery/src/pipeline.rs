//! Debounce & enqueue pipeline.
//!
//! Owns the pending map for one watch session. Raw file events go in;
//! settled, idempotent discovery jobs come out on the `discover_asset`
//! queue. A file must hold still (same size and mtime) for the settle
//! window before its upsert is enqueued; deletes are enqueued
//! immediately. Queue-insert failures are retried a bounded number of
//! times on the settle tick.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use lum_domain::discovery::{
    content_type_for, DiscoveryJob, DiscoveryOp, JobQueue, DISCOVER_ASSET_QUEUE,
};
use lum_domain::repository::Repository;
use lum_domain::{Error, Result};

use crate::paths;

/// Delay before retrying a failed queue insert.
const INSERT_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Attempts per entry before it is dropped with a log line.
const MAX_INSERT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
struct PendingEntry {
    full_path: PathBuf,
    last_size: Option<u64>,
    last_mtime_ms: Option<i64>,
    ready_at: Instant,
    attempts: u32,
}

struct RetryJob {
    job: DiscoveryJob,
    ready_at: Instant,
    attempts: u32,
}

/// Per-session debounce state. Owned by exactly one session task and
/// never shared.
pub struct DebouncePipeline {
    repo_id: Uuid,
    root: PathBuf,
    queue: Arc<dyn JobQueue>,
    settle: Duration,
    pending: HashMap<String, PendingEntry>,
    retries: Vec<RetryJob>,
}

impl DebouncePipeline {
    pub fn new(repo: &Repository, queue: Arc<dyn JobQueue>, settle: Duration) -> Self {
        Self {
            repo_id: repo.repo_id,
            root: repo.path.clone(),
            queue,
            settle,
            pending: HashMap::new(),
            retries: Vec::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn build_job(&self, storage_path: &str, operation: DiscoveryOp, file_size: Option<u64>) -> DiscoveryJob {
        DiscoveryJob {
            repository_id: self.repo_id,
            relative_path: storage_path.to_string(),
            operation,
            file_name: paths::file_name(storage_path).to_string(),
            content_type: paths::extension(storage_path)
                .and_then(|e| content_type_for(&e))
                .map(String::from),
            file_size,
            detected_at: chrono::Utc::now(),
        }
    }

    async fn insert_or_park(&mut self, job: DiscoveryJob) {
        if let Err(e) = self.queue.insert(DISCOVER_ASSET_QUEUE, &job).await {
            tracing::warn!(
                path = %job.relative_path,
                error = %e,
                "queue insert failed, parking for retry"
            );
            self.retries.push(RetryJob {
                job,
                ready_at: Instant::now() + INSERT_RETRY_DELAY,
                attempts: 1,
            });
        }
    }

    /// Feed one classified file event (live push or poll diff).
    /// `storage_path` must already be clean, filtered, and inside the
    /// repository root.
    pub async fn handle_event(
        &mut self,
        storage_path: String,
        exists: bool,
        size: Option<u64>,
        mtime_ms: Option<i64>,
    ) {
        if !exists {
            // A pending upsert for a now-deleted file is moot.
            self.pending.remove(&storage_path);
            let job = self.build_job(&storage_path, DiscoveryOp::Delete, None);
            tracing::debug!(path = %storage_path, "file removed, enqueueing delete");
            self.insert_or_park(job).await;
            return;
        }

        let full_path = self.root.join(&storage_path);
        let ready_at = Instant::now() + self.settle;
        match self.pending.get_mut(&storage_path) {
            Some(entry) => {
                entry.last_size = size.or(entry.last_size);
                entry.last_mtime_ms = mtime_ms.or(entry.last_mtime_ms);
                entry.ready_at = ready_at;
            }
            None => {
                self.pending.insert(
                    storage_path,
                    PendingEntry {
                        full_path,
                        last_size: size,
                        last_mtime_ms: mtime_ms,
                        ready_at,
                        attempts: 0,
                    },
                );
            }
        }
    }

    /// One settle tick: enqueue every entry that has held still for the
    /// settle window, re-arm the ones still changing, and service
    /// parked insert retries.
    pub async fn settle_tick(&mut self) {
        let now = Instant::now();

        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, e)| e.ready_at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        for storage_path in due {
            let Some(mut entry) = self.pending.remove(&storage_path) else {
                continue;
            };

            let metadata = match tokio::fs::metadata(&entry.full_path).await {
                Ok(md) => md,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let job = self.build_job(&storage_path, DiscoveryOp::Delete, None);
                    tracing::debug!(path = %storage_path, "file vanished while settling");
                    self.insert_or_park(job).await;
                    continue;
                }
                Err(e) => {
                    entry.attempts += 1;
                    if entry.attempts >= MAX_INSERT_ATTEMPTS {
                        tracing::warn!(
                            path = %storage_path,
                            error = %e,
                            "giving up on unstat-able file"
                        );
                    } else {
                        entry.ready_at = now + INSERT_RETRY_DELAY;
                        self.pending.insert(storage_path, entry);
                    }
                    continue;
                }
            };

            if metadata.is_dir() {
                continue;
            }

            let size = metadata.len();
            let mtime_ms = mtime_millis(&metadata);
            let changed = entry.last_size.is_some_and(|s| s != size)
                || entry.last_mtime_ms.is_some_and(|m| m != mtime_ms);

            if changed {
                // Still being written; observe the new state and wait
                // another settle window.
                entry.last_size = Some(size);
                entry.last_mtime_ms = Some(mtime_ms);
                entry.ready_at = now + self.settle;
                self.pending.insert(storage_path, entry);
                continue;
            }

            let job = self.build_job(&storage_path, DiscoveryOp::Upsert, Some(size));
            match self.queue.insert(DISCOVER_ASSET_QUEUE, &job).await {
                Ok(()) => {
                    tracing::debug!(path = %storage_path, size, "discovery job enqueued");
                }
                Err(e) => {
                    entry.attempts += 1;
                    if entry.attempts >= MAX_INSERT_ATTEMPTS {
                        tracing::warn!(
                            path = %storage_path,
                            error = %e,
                            attempts = entry.attempts,
                            "dropping entry after repeated queue failures"
                        );
                    } else {
                        entry.last_size = Some(size);
                        entry.last_mtime_ms = Some(mtime_ms);
                        entry.ready_at = now + INSERT_RETRY_DELAY;
                        self.pending.insert(storage_path, entry);
                    }
                }
            }
        }

        self.service_retries(now).await;
    }

    async fn service_retries(&mut self, now: Instant) {
        let due: Vec<RetryJob> = {
            let mut still_waiting = Vec::new();
            let mut due = Vec::new();
            for retry in self.retries.drain(..) {
                if retry.ready_at <= now {
                    due.push(retry);
                } else {
                    still_waiting.push(retry);
                }
            }
            self.retries = still_waiting;
            due
        };

        for mut retry in due {
            match self.queue.insert(DISCOVER_ASSET_QUEUE, &retry.job).await {
                Ok(()) => {}
                Err(e) => {
                    retry.attempts += 1;
                    if retry.attempts >= MAX_INSERT_ATTEMPTS {
                        tracing::warn!(
                            path = %retry.job.relative_path,
                            error = %e,
                            "dropping job after repeated queue failures"
                        );
                    } else {
                        retry.ready_at = now + INSERT_RETRY_DELAY;
                        self.retries.push(retry);
                    }
                }
            }
        }
    }
}

fn mtime_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory job queue: dev-mode collaborator and the fixture behind
/// the pipeline tests. `fail_next` makes the next N inserts fail, for
/// exercising the retry bound.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<(String, DiscoveryJob)>>,
    fail_next: Mutex<u32>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<(String, DiscoveryJob)> {
        self.jobs.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Make the next `n` inserts fail with a transient queue error.
    pub fn fail_next(&self, n: u32) {
        *self.fail_next.lock() = n;
    }
}

#[async_trait::async_trait]
impl JobQueue for MemoryJobQueue {
    async fn insert(&self, queue: &str, job: &DiscoveryJob) -> Result<()> {
        {
            let mut failures = self.fail_next.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Queue("simulated insert failure".into()));
            }
        }
        self.jobs.lock().push((queue.to_string(), job.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn repo(root: &Path) -> Repository {
        Repository {
            repo_id: Uuid::new_v4(),
            name: "test".into(),
            path: root.to_path_buf(),
            active: true,
        }
    }

    fn write(root: &Path, rel: &str, bytes: &[u8]) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, bytes).unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        queue: Arc<MemoryJobQueue>,
        pipeline: DebouncePipeline,
    }

    fn fixture(settle: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let queue = Arc::new(MemoryJobQueue::new());
        let pipeline = DebouncePipeline::new(&repo(&root), queue.clone(), settle);
        Fixture {
            _dir: dir,
            root,
            queue,
            pipeline,
        }
    }

    async fn upsert_event(f: &mut Fixture, rel: &str) {
        let md = std::fs::metadata(f.root.join(rel)).unwrap();
        f.pipeline
            .handle_event(
                rel.to_string(),
                true,
                Some(md.len()),
                Some(mtime_millis(&md)),
            )
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn stable_file_enqueues_exactly_one_upsert() {
        let mut f = fixture(Duration::from_secs(2));
        write(&f.root, "2024/a.jpg", b"image-bytes");
        upsert_event(&mut f, "2024/a.jpg").await;

        // Not settled yet.
        f.pipeline.settle_tick().await;
        assert!(f.queue.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        f.pipeline.settle_tick().await;

        let jobs = f.queue.jobs();
        assert_eq!(jobs.len(), 1);
        let (queue_name, job) = &jobs[0];
        assert_eq!(queue_name, DISCOVER_ASSET_QUEUE);
        assert_eq!(job.operation, DiscoveryOp::Upsert);
        assert_eq!(job.relative_path, "2024/a.jpg");
        assert_eq!(job.file_name, "a.jpg");
        assert_eq!(job.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(job.file_size, Some(11));

        // Entry is gone; further ticks enqueue nothing.
        tokio::time::advance(Duration::from_secs(2)).await;
        f.pipeline.settle_tick().await;
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_writes_coalesce_into_one_job() {
        let mut f = fixture(Duration::from_secs(2));

        // Bursts at t = 0, 0.5, 1.0, 1.5, 2.0s.
        for i in 0..5u64 {
            write(&f.root, "burst.jpg", format!("content-{i}").repeat(i as usize + 1).as_bytes());
            upsert_event(&mut f, "burst.jpg").await;
            if i < 4 {
                tokio::time::advance(Duration::from_millis(500)).await;
                f.pipeline.settle_tick().await;
                assert!(f.queue.is_empty(), "no job before the file settles");
            }
        }

        // Last write at t=2.0; settled from t=4.0.
        tokio::time::advance(Duration::from_secs(1)).await;
        f.pipeline.settle_tick().await;
        assert!(f.queue.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        f.pipeline.settle_tick().await;
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.queue.jobs()[0].1.operation, DiscoveryOp::Upsert);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_enqueues_immediately_and_cancels_pending_upsert() {
        let mut f = fixture(Duration::from_secs(2));
        write(&f.root, "gone.jpg", b"bytes");
        upsert_event(&mut f, "gone.jpg").await;
        assert_eq!(f.pipeline.pending_len(), 1);

        f.pipeline
            .handle_event("gone.jpg".into(), false, None, None)
            .await;

        assert_eq!(f.pipeline.pending_len(), 0);
        let jobs = f.queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].1.operation, DiscoveryOp::Delete);

        // The settle tick does not produce a late upsert.
        tokio::time::advance(Duration::from_secs(3)).await;
        f.pipeline.settle_tick().await;
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn file_vanishing_before_settle_becomes_a_delete() {
        let mut f = fixture(Duration::from_secs(2));
        write(&f.root, "brief.jpg", b"bytes");
        upsert_event(&mut f, "brief.jpg").await;
        std::fs::remove_file(f.root.join("brief.jpg")).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        f.pipeline.settle_tick().await;

        let jobs = f.queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].1.operation, DiscoveryOp::Delete);
    }

    #[tokio::test(start_paused = true)]
    async fn growing_file_is_rearmed_not_enqueued() {
        let mut f = fixture(Duration::from_secs(2));
        write(&f.root, "copy.jpg", b"partial");
        upsert_event(&mut f, "copy.jpg").await;

        // The copy continues after the event fired.
        write(&f.root, "copy.jpg", b"partial-plus-more-bytes");

        tokio::time::advance(Duration::from_secs(2)).await;
        f.pipeline.settle_tick().await;
        assert!(f.queue.is_empty(), "size changed since last observation");
        assert_eq!(f.pipeline.pending_len(), 1);

        // Quiet for another settle window: enqueued with the final size.
        tokio::time::advance(Duration::from_secs(2)).await;
        f.pipeline.settle_tick().await;
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.queue.jobs()[0].1.file_size, Some(23));
    }

    #[tokio::test(start_paused = true)]
    async fn directory_entries_are_dropped() {
        let mut f = fixture(Duration::from_secs(2));
        std::fs::create_dir_all(f.root.join("album.jpg")).unwrap();
        f.pipeline
            .handle_event("album.jpg".into(), true, None, None)
            .await;

        tokio::time::advance(Duration::from_secs(2)).await;
        f.pipeline.settle_tick().await;
        assert!(f.queue.is_empty());
        assert_eq!(f.pipeline.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn insert_failure_retries_then_succeeds() {
        let mut f = fixture(Duration::from_secs(2));
        write(&f.root, "retry.jpg", b"bytes");
        upsert_event(&mut f, "retry.jpg").await;

        f.queue.fail_next(1);
        tokio::time::advance(Duration::from_secs(2)).await;
        f.pipeline.settle_tick().await;
        assert!(f.queue.is_empty());
        assert_eq!(f.pipeline.pending_len(), 1, "entry re-armed after failure");

        tokio::time::advance(INSERT_RETRY_DELAY).await;
        f.pipeline.settle_tick().await;
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_dropped_after_three_failed_attempts() {
        let mut f = fixture(Duration::from_secs(2));
        write(&f.root, "doomed.jpg", b"bytes");
        upsert_event(&mut f, "doomed.jpg").await;

        f.queue.fail_next(10);
        for _ in 0..MAX_INSERT_ATTEMPTS {
            tokio::time::advance(Duration::from_secs(2)).await;
            f.pipeline.settle_tick().await;
        }
        assert_eq!(f.pipeline.pending_len(), 0, "dropped after attempt bound");
        assert!(f.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delete_insert_is_retried() {
        let mut f = fixture(Duration::from_secs(2));
        f.queue.fail_next(1);
        f.pipeline
            .handle_event("gone.jpg".into(), false, None, None)
            .await;
        assert!(f.queue.is_empty());

        tokio::time::advance(INSERT_RETRY_DELAY).await;
        f.pipeline.settle_tick().await;
        let jobs = f.queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].1.operation, DiscoveryOp::Delete);
    }
}
