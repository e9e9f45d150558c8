use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::repository::Repository;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub media: MediaConfig,
    /// Configured repositories (dev deployments; production resolves
    /// these from the store).
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "d_true")]
    pub active: bool,
}

impl RepositoryConfig {
    pub fn to_repository(&self) -> Repository {
        Repository {
            repo_id: uuid::Uuid::new_v4(),
            name: self.name.clone(),
            path: self.path.clone(),
            active: self.active,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            allowed_origins: d_cors_origins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM vendor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL (e.g. `https://api.openai.com/v1`).
    #[serde(default = "d_llm_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "d_llm_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_llm_url(),
            api_key_env: d_llm_key_env(),
            model: d_llm_model(),
            temperature: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "d_20")]
    pub max_iterations: u32,
    /// Per-attempt model call timeout.
    #[serde(default = "d_60000")]
    pub model_timeout_ms: u64,
    #[serde(default = "d_3")]
    pub model_retries: u32,
    /// Reference manager entry TTL.
    #[serde(default = "d_600")]
    pub ref_ttl_seconds: u64,
    /// Execute tool calls of one reasoning step concurrently.
    #[serde(default)]
    pub parallel_tools: bool,
    /// Asset counts above this ask the user for confirmation.
    #[serde(default = "d_1")]
    pub confirmation_threshold: u64,
    /// Directory for durable checkpoints. Unset keeps interrupts
    /// in-process only.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            model_timeout_ms: 60_000,
            model_retries: 3,
            ref_ttl_seconds: 600,
            parallel_tools: false,
            confirmation_threshold: 1,
            checkpoint_dir: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Watch & discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Watchman unix socket path.
    #[serde(default = "d_watchman_sock")]
    pub sock: PathBuf,
    /// Quiescence window before a file is considered settled.
    #[serde(default = "d_2")]
    pub settle_seconds: u64,
    /// Enqueue everything present (since the stored clock) on connect.
    #[serde(default = "d_true")]
    pub initial_scan: bool,
    /// Full-rescan cadence when the push channel goes quiet. 0 disables.
    #[serde(default)]
    pub poll_fallback_seconds: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sock: d_watchman_sock(),
            settle_seconds: 2,
            initial_scan: true,
            poll_fallback_seconds: 0,
        }
    }
}

impl WatchConfig {
    /// Settle window, bounded below at one second.
    pub fn settle(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.settle_seconds.max(1))
    }

    pub fn poll_interval(&self) -> Option<std::time::Duration> {
        if self.poll_fallback_seconds == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(self.poll_fallback_seconds))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "d_photo_exts")]
    pub photo_extensions: Vec<String>,
    #[serde(default = "d_raw_exts")]
    pub raw_extensions: Vec<String>,
    #[serde(default = "d_video_exts")]
    pub video_extensions: Vec<String>,
    #[serde(default = "d_audio_exts")]
    pub audio_extensions: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            photo_extensions: d_photo_exts(),
            raw_extensions: d_raw_exts(),
            video_extensions: d_video_exts(),
            audio_extensions: d_audio_exts(),
        }
    }
}

impl MediaConfig {
    /// Union of all configured extension sets, lowercased, no dot.
    ///
    /// Both the subscription expression and the poll fallback are built
    /// from this one set so the two paths cannot diverge.
    pub fn supported_extensions(&self) -> BTreeSet<String> {
        self.photo_extensions
            .iter()
            .chain(&self.raw_extensions)
            .chain(&self.video_extensions)
            .chain(&self.audio_extensions)
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading, env overrides, validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Parse from TOML text.
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        toml::from_str(text).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Apply the documented environment overrides on top of the file
    /// config. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_bool("WATCHMAN_ENABLED") {
            self.watch.enabled = v;
        }
        if let Ok(v) = std::env::var("WATCHMAN_SOCK") {
            if !v.is_empty() {
                self.watch.sock = PathBuf::from(v);
            }
        }
        if let Some(v) = env_u64("WATCHMAN_SETTLE_SECONDS") {
            self.watch.settle_seconds = v;
        }
        if let Some(v) = env_bool("WATCHMAN_INITIAL_SCAN") {
            self.watch.initial_scan = v;
        }
        if let Some(v) = env_u64("WATCHMAN_POLL_FALLBACK_SECONDS") {
            self.watch.poll_fallback_seconds = v;
        }
        if let Some(v) = env_u64("AGENT_MAX_ITERATIONS") {
            self.agent.max_iterations = v as u32;
        }
        if let Some(v) = env_u64("AGENT_MODEL_TIMEOUT_MS") {
            self.agent.model_timeout_ms = v;
        }
        if let Some(v) = env_u64("AGENT_MODEL_RETRIES") {
            self.agent.model_retries = v as u32;
        }
        if let Some(v) = env_u64("AGENT_REF_TTL_SECONDS") {
            self.agent.ref_ttl_seconds = v;
        }
    }

    /// Sanity-check the configuration. The server refuses to start when
    /// any issue has `Error` severity.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.agent.max_iterations == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "agent.max_iterations must be at least 1".into(),
            });
        }
        if self.agent.model_retries == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "agent.model_retries must be at least 1".into(),
            });
        }
        if self.watch.settle_seconds < 1 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "watch.settle_seconds below 1 is clamped to 1".into(),
            });
        }
        if self.watch.enabled && self.repositories.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "watch.enabled is set but no repositories are configured".into(),
            });
        }
        for repo in &self.repositories {
            if !repo.path.is_absolute() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!(
                        "repository '{}': path {} is not absolute",
                        repo.name,
                        repo.path.display()
                    ),
                });
            }
        }
        if self.media.supported_extensions().is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "media: no supported extensions configured".into(),
            });
        }

        issues
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            tracing::warn!(var = name, value = other, "unparseable boolean env var, ignoring");
            None
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "unparseable integer env var, ignoring");
            None
        }
    }
}

// ── Serde default helpers ──────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_port() -> u16 {
    8092
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".into(),
        "http://127.0.0.1:5173".into(),
    ]
}
fn d_llm_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_llm_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn d_llm_model() -> String {
    "gpt-4o".into()
}
fn d_1() -> u64 {
    1
}
fn d_2() -> u64 {
    2
}
fn d_3() -> u32 {
    3
}
fn d_20() -> u32 {
    20
}
fn d_600() -> u64 {
    600
}
fn d_60000() -> u64 {
    60_000
}
fn d_watchman_sock() -> PathBuf {
    PathBuf::from("/usr/local/var/run/watchman/watchman.sock")
}
fn d_photo_exts() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "tiff", "bmp"]
        .map(String::from)
        .to_vec()
}
fn d_raw_exts() -> Vec<String> {
    ["dng", "cr2", "cr3", "nef", "arw", "raf", "orf", "rw2"]
        .map(String::from)
        .to_vec()
}
fn d_video_exts() -> Vec<String> {
    ["mp4", "mov", "avi", "mkv", "webm"].map(String::from).to_vec()
}
fn d_audio_exts() -> Vec<String> {
    ["mp3", "wav", "flac", "m4a", "ogg"].map(String::from).to_vec()
}
