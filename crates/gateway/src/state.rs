use std::sync::Arc;

use chrono::{DateTime, Utc};

use lum_agent::{AgentRuntime, ReferenceManager, ToolRegistry};
use lum_domain::asset::AssetQueries;
use lum_domain::config::Config;
use lum_domain::discovery::JobQueue;

use crate::locks::ThreadLockMap;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// `None` when no model is configured; chat endpoints pre-flight on
    /// this and answer with a structured error instead of a broken run.
    pub runtime: Option<Arc<AgentRuntime>>,
    pub registry: Arc<ToolRegistry>,
    pub refs: Arc<ReferenceManager>,
    pub queries: Arc<dyn AssetQueries>,
    pub queue: Arc<dyn JobQueue>,
    pub thread_locks: Arc<ThreadLockMap>,
    pub started_at: DateTime<Utc>,
    /// Sessions spawned by the watch supervisor (0 when disabled).
    pub watch_sessions: usize,
}
