//! wayfind — local agentic assistant server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use wf_domain::config::Config;
use wf_mcp_client::{McpManager, McpServerRegistry};
use wf_tools::fetch::{FetchLimits, WebFetcher};
use wf_trajectory::TrajectoryStore;

use wf_gateway::automation::cron::CronScheduler;
use wf_gateway::automation::executor::AutomationExecutor;
use wf_gateway::automation::store::AutomationStore;
use wf_gateway::automation::watcher::FileWatchScheduler;
use wf_gateway::runtime::llm::UnconfiguredLlm;
use wf_gateway::server;
use wf_gateway::state::AppState;
use wf_gateway::trace;

#[derive(Parser, Debug)]
#[command(name = "wayfind", about = "Local agentic assistant server")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "wayfind.toml")]
    config: PathBuf,

    /// Override the state directory from the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the listen address, e.g. 127.0.0.1:4280.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    trace::init();
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    let config = Arc::new(config);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    // ── Stores ───────────────────────────────────────────────────────
    let trajectories = Arc::new(TrajectoryStore::new(&config.data_dir)?);
    let automations = Arc::new(AutomationStore::new(&config.data_dir)?);
    let mcp_registry = Arc::new(McpServerRegistry::new(&config.data_dir)?);

    // Crash recovery before anything new starts: in-flight executions from
    // the previous process are cancelled, their confirmations expired.
    automations.recovery_sweep()?;

    // ── Tool plane ───────────────────────────────────────────────────
    let mcp = Arc::new(McpManager::new(mcp_registry));
    mcp.connect_enabled().await;
    let fetcher = Arc::new(WebFetcher::new(FetchLimits {
        max_bytes: config.tools.web_max_bytes,
        max_text_chars: config.tools.web_max_text_chars,
        timeout_secs: config.tools.web_timeout_secs,
    })?);

    // ── LLM client ───────────────────────────────────────────────────
    // Provider adapters plug in behind this trait; without one configured
    // every run fails fast with a clear error.
    let llm: Arc<dyn wf_gateway::runtime::llm::LlmClient> = Arc::new(UnconfiguredLlm);

    // ── Automations ──────────────────────────────────────────────────
    let executor = Arc::new(AutomationExecutor::new(
        automations.clone(),
        trajectories.clone(),
        llm.clone(),
        mcp.clone(),
        fetcher.clone(),
        config.clone(),
    ));
    executor.start();

    let cron = Arc::new(CronScheduler::new(automations.clone(), executor.clone()));
    cron.start();
    let watcher = Arc::new(FileWatchScheduler::new(
        automations.clone(),
        executor.clone(),
        config.automations.default_debounce_ms,
    ));
    watcher.start();

    let state = AppState {
        config: config.clone(),
        llm,
        trajectories,
        mcp: mcp.clone(),
        fetcher,
        automations,
        executor,
    };

    // ── Serve ────────────────────────────────────────────────────────
    let listen = args
        .listen
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "wayfind listening");

    let result = axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    mcp.shutdown().await;
    result.context("server error")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
