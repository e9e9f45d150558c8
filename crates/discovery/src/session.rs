//! Per-repository watch session.
//!
//! One task per active repository: connect to the notification service,
//! run the initial scan since the persisted clock, subscribe, then loop
//! over subscription pushes, settle ticks, and the optional poll
//! fallback until cancelled. Connection failures reconnect with
//! exponential backoff (1s → 30s); a rejected clock token triggers one
//! full rescan instead of looping on the stale cursor.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use lum_domain::config::Config;
use lum_domain::discovery::JobQueue;
use lum_domain::repository::Repository;
use lum_domain::{Error, Result};

use crate::clock::ClockStore;
use crate::filter::ExtensionFilter;
use crate::paths;
use crate::pipeline::DebouncePipeline;
use crate::poll::PollScanner;
use crate::watchman::{build_expression, Connector, FileDelta, WatchmanClient};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(30);
const SETTLE_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WatchSessionConfig {
    pub settle: Duration,
    pub poll_interval: Option<Duration>,
    pub initial_scan: bool,
    pub extensions: BTreeSet<String>,
}

impl WatchSessionConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            settle: cfg.watch.settle(),
            poll_interval: cfg.watch.poll_interval(),
            initial_scan: cfg.watch.initial_scan,
            extensions: cfg.media.supported_extensions(),
        }
    }
}

pub struct WatchSession {
    repo: Repository,
    config: WatchSessionConfig,
    filter: ExtensionFilter,
    connector: Arc<dyn Connector>,
    queue: Arc<dyn JobQueue>,
    cancel: CancellationToken,
}

impl WatchSession {
    pub fn new(
        repo: Repository,
        config: WatchSessionConfig,
        connector: Arc<dyn Connector>,
        queue: Arc<dyn JobQueue>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            filter: ExtensionFilter::from_extension_set(config.extensions.clone()),
            repo,
            config,
            connector,
            queue,
            cancel,
        }
    }

    /// Supervised session loop. Returns when cancelled or when the root
    /// is not a configured repository (the one non-retryable error).
    pub async fn run(mut self) {
        if !Repository::is_configured_root(&self.repo.path) {
            tracing::error!(
                repo = %self.repo.name,
                path = %self.repo.path.display(),
                "refusing to watch: path is not a configured repository root"
            );
            return;
        }

        let mut backoff = BACKOFF_INITIAL;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.connect_and_watch().await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(
                        repo = %self.repo.name,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "watch session error, reconnecting"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_CEILING);
                }
            }
        }
        tracing::info!(repo = %self.repo.name, "watch session stopped");
    }

    async fn connect_and_watch(&mut self) -> Result<()> {
        let transport = self.connector.connect().await?;
        let mut client = WatchmanClient::new(transport);

        let version = client.version().await?;
        let watch_root = client.watch_project(&self.repo.path).await?;
        tracing::info!(
            repo = %self.repo.name,
            version,
            watch = %watch_root.watch.display(),
            relative = watch_root.relative_path.as_deref().unwrap_or(""),
            "connected to notification service"
        );
        let root = watch_root.watch.clone();
        let relative_root = watch_root.relative_path.as_deref();

        let clock_store = ClockStore::new(&self.repo.path);
        let expression = build_expression(&self.config.extensions);
        let mut pipeline =
            DebouncePipeline::new(&self.repo, self.queue.clone(), self.config.settle);

        // ── Initial scan since the persisted clock ───────────────────
        if self.config.initial_scan {
            let saved = clock_store.load()?;
            let result = match client
                .query_since(&root, &expression, saved.as_deref(), relative_root)
                .await
            {
                Ok(result) => result,
                Err(e) if saved.is_some() => {
                    // Stale or foreign token (service restarted). Clear it
                    // and rescan from the beginning rather than looping.
                    tracing::warn!(
                        repo = %self.repo.name,
                        error = %e,
                        "stored clock rejected, falling back to full rescan"
                    );
                    clock_store.clear()?;
                    client
                        .query_since(&root, &expression, None, relative_root)
                        .await?
                }
                Err(e) => return Err(e),
            };
            clock_store.save(&result.clock)?;
            tracing::info!(
                repo = %self.repo.name,
                files = result.files.len(),
                fresh_instance = result.is_fresh_instance,
                "initial scan complete"
            );
            for delta in result.files {
                self.apply_delta(&mut pipeline, delta).await;
            }
        }

        // ── Subscribe at the current clock ───────────────────────────
        let since = clock_store.load()?;
        let sub_clock = client
            .subscribe(&root, &expression, since.as_deref(), relative_root)
            .await?;
        clock_store.save(&sub_clock)?;

        // ── Poll fallback baseline ───────────────────────────────────
        let mut poll_scanner = match self.config.poll_interval {
            Some(_) => {
                let mut scanner =
                    PollScanner::new(self.repo.path.clone(), self.filter.clone());
                let primed = tokio::task::spawn_blocking(move || {
                    scanner.prime();
                    scanner
                })
                .await
                .map_err(|e| Error::Watch(format!("poll baseline scan failed: {e}")))?;
                Some(primed)
            }
            None => None,
        };

        // ── Event loop ───────────────────────────────────────────────
        let (mut events, pump) = client.into_event_pump();
        let mut settle_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + SETTLE_TICK, SETTLE_TICK);
        let poll_period = self.config.poll_interval.unwrap_or(Duration::from_secs(3600));
        let mut poll_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + poll_period, poll_period);

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),

                _ = settle_tick.tick() => {
                    pipeline.settle_tick().await;
                }

                _ = poll_tick.tick(), if poll_scanner.is_some() => {
                    let Some(mut scanner) = poll_scanner.take() else { continue };
                    match tokio::task::spawn_blocking(move || {
                        let deltas = scanner.scan();
                        (scanner, deltas)
                    })
                    .await
                    {
                        Ok((scanner, deltas)) => {
                            poll_scanner = Some(scanner);
                            for delta in deltas {
                                self.apply_delta(&mut pipeline, delta).await;
                            }
                        }
                        Err(e) => break Err(Error::Watch(format!("poll scan panicked: {e}"))),
                    }
                }

                event = events.recv() => match event {
                    Some(Ok(push)) => {
                        if let Some(clock) = &push.clock {
                            if let Err(e) = clock_store.save(clock) {
                                tracing::warn!(error = %e, "failed to persist clock token");
                            }
                        }
                        for delta in push.files {
                            self.apply_delta(&mut pipeline, delta).await;
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Err(Error::Watch("subscription stream ended".into())),
                },
            }
        };

        pump.abort();
        result
    }

    /// Canonicalize and admit one file delta. Paths escaping the root,
    /// inside excluded subtrees, or without a supported extension are
    /// dropped here — both the live and the poll path go through this.
    async fn apply_delta(&self, pipeline: &mut DebouncePipeline, delta: FileDelta) {
        let storage_path = match paths::clean_relative_path(&delta.name) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(name = %delta.name, error = %e, "rejecting suspicious event path");
                return;
            }
        };
        if paths::is_excluded(&storage_path) || !self.filter.matches(&storage_path) {
            return;
        }
        pipeline
            .handle_event(storage_path, delta.exists, delta.size, delta.mtime_ms)
            .await;
    }
}
