use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use lum_agent::checkpoint::{CheckpointStore, FsCheckpointStore, MemoryCheckpointStore};
use lum_agent::tools::register_builtin_tools;
use lum_agent::{AgentRuntime, ReferenceManager, RunOptions, ToolRegistry};
use lum_discovery::pipeline::MemoryJobQueue;
use lum_discovery::session::WatchSessionConfig;
use lum_discovery::watchman::UnixConnector;
use lum_discovery::WatchSupervisor;
use lum_domain::asset::MemoryAssetIndex;
use lum_domain::config::{Config, ConfigSeverity};
use lum_domain::repository::Repository;
use lum_model::openai::OpenAiChatModel;
use lum_model::retry::RetryPolicy;

use lum_gateway::api;
use lum_gateway::locks::ThreadLockMap;
use lum_gateway::state::AppState;

#[derive(Parser)]
#[command(name = "lumiliod", about = "Lumilio agent & discovery daemon")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "lumilio.toml")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and the watch supervisor (default).
    Serve,
    /// Inspect or validate the configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Version,
}

#[derive(Subcommand)]
enum ConfigCommand {
    Validate,
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config { command }) => {
            let config = load_config(&cli.config)?;
            match command {
                ConfigCommand::Validate => {
                    let issues = config.validate();
                    for issue in &issues {
                        let tag = match issue.severity {
                            ConfigSeverity::Warning => "warning",
                            ConfigSeverity::Error => "error",
                        };
                        eprintln!("{tag}: {issue}");
                    }
                    if issues
                        .iter()
                        .any(|i| i.severity == ConfigSeverity::Error)
                    {
                        std::process::exit(1);
                    }
                    println!("configuration OK");
                }
                ConfigCommand::Show => {
                    println!("{}", toml::to_string_pretty(&config)?);
                }
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("lumiliod {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing (only for `serve`).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lum_gateway=debug")),
        )
        .json()
        .init();
}

/// File config (when present) with environment overrides on top.
fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Config::from_toml(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        Config::default()
    };
    config.apply_env();
    Ok(config)
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "lumiliod starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Tool registry ────────────────────────────────────────────────
    let registry = Arc::new(ToolRegistry::new());
    register_builtin_tools(&registry, config.agent.confirmation_threshold)
        .context("registering built-in tools")?;
    tracing::info!(tools = ?registry.names(), "tool registry ready");

    // ── Reference manager ────────────────────────────────────────────
    let refs = Arc::new(ReferenceManager::new(Duration::from_secs(
        config.agent.ref_ttl_seconds,
    )));

    // ── Dev collaborators (external adapters plug in here) ──────────
    let queries = Arc::new(MemoryAssetIndex::new());
    tracing::warn!("no store adapter configured — serving from an empty in-memory asset index");
    let queue = Arc::new(MemoryJobQueue::new());
    tracing::warn!("no durable queue configured — discovery jobs are held in memory");

    // ── Checkpoint store ─────────────────────────────────────────────
    let checkpoints: Arc<dyn CheckpointStore> = match &config.agent.checkpoint_dir {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "durable checkpoint store ready");
            Arc::new(FsCheckpointStore::new(dir))
        }
        None => Arc::new(MemoryCheckpointStore::new()),
    };

    // ── Chat model + runtime ─────────────────────────────────────────
    let runtime = match OpenAiChatModel::from_config(&config.llm) {
        Ok(model) => {
            tracing::info!(
                model = %config.llm.model,
                base_url = %config.llm.base_url,
                "chat model ready"
            );
            let options = RunOptions {
                max_iterations: config.agent.max_iterations,
                parallel_tools: config.agent.parallel_tools,
                retry: RetryPolicy::from_agent_config(&config.agent),
                ..Default::default()
            };
            Some(Arc::new(AgentRuntime::new(
                Arc::new(model),
                registry.clone(),
                queries.clone(),
                refs.clone(),
                checkpoints,
                options,
            )))
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "chat model unavailable — /chat will answer with a structured error"
            );
            None
        }
    };

    // ── Watch supervisor ─────────────────────────────────────────────
    let (supervisor, watch_sessions) = if config.watch.enabled {
        let repositories: Vec<Repository> = config
            .repositories
            .iter()
            .map(|r| r.to_repository())
            .collect();
        let connector = Arc::new(UnixConnector::new(config.watch.sock.clone()));
        let supervisor = WatchSupervisor::start(
            repositories,
            WatchSessionConfig::from_config(&config),
            connector,
            queue.clone(),
        );
        let sessions = supervisor.session_count();
        (Some(supervisor), sessions)
    } else {
        tracing::info!("filesystem watch disabled");
        (None, 0)
    };

    // ── App state ────────────────────────────────────────────────────
    let thread_locks = Arc::new(ThreadLockMap::new());
    let state = AppState {
        config: config.clone(),
        runtime,
        registry,
        refs: refs.clone(),
        queries,
        queue,
        thread_locks: thread_locks.clone(),
        started_at: chrono::Utc::now(),
        watch_sessions,
    };

    // ── Periodic reference sweep ─────────────────────────────────────
    {
        let refs = refs.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let swept = refs.sweep();
                if swept > 0 {
                    tracing::debug!(swept, "expired references collected");
                }
            }
        });
    }

    // ── Periodic thread-lock pruning ─────────────────────────────────
    {
        let thread_locks = thread_locks.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                thread_locks.prune_idle();
            }
        });
    }

    // ── Router + bind ────────────────────────────────────────────────
    let app = api::router()
        .layer(build_cors_layer(&config.server.allowed_origins))
        .layer(tower::limit::ConcurrencyLimitLayer::new(256))
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "lumiliod listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    // Sessions persist their last clock on the way out.
    if let Some(supervisor) = supervisor {
        supervisor.shutdown().await;
    }
    tracing::info!("lumiliod stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

/// Exact-origin CORS from config; a single `"*"` entry allows all
/// origins (dev only).
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    use axum::http::{header, HeaderValue, Method};

    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let headers = [header::CONTENT_TYPE, header::AUTHORIZATION];

    if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods)
            .allow_headers(headers);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(hv) => Some(hv),
            Err(_) => {
                tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(methods)
        .allow_headers(headers)
}
