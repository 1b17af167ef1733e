//! Shared application state handed to the channel, the automation
//! subsystem, and the HTTP layer.

use std::sync::Arc;

use wf_domain::config::Config;
use wf_mcp_client::McpManager;
use wf_tools::fetch::WebFetcher;
use wf_trajectory::TrajectoryStore;

use crate::automation::executor::AutomationExecutor;
use crate::automation::store::AutomationStore;
use crate::runtime::llm::LlmClient;

/// Fields are grouped by concern:
/// - **Core services** — config, the LLM client, trajectories
/// - **Tool plane** — MCP manager, web fetcher
/// - **Automations** — store and executor
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub llm: Arc<dyn LlmClient>,
    pub trajectories: Arc<TrajectoryStore>,

    // ── Tool plane ────────────────────────────────────────────────────
    pub mcp: Arc<McpManager>,
    pub fetcher: Arc<WebFetcher>,

    // ── Automations ───────────────────────────────────────────────────
    pub automations: Arc<AutomationStore>,
    pub executor: Arc<AutomationExecutor>,
}
