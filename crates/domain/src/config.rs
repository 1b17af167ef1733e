use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub automations: AutomationsConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    /// Root directory for persisted state (trajectories, automations,
    /// MCP server records). Overridable via `WAYFIND_DATA_DIR`.
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            research: ResearchConfig::default(),
            tools: ToolsConfig::default(),
            automations: AutomationsConfig::default(),
            admin: AdminConfig::default(),
            data_dir: d_data_dir(),
        }
    }
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &std::path::Path) -> crate::Result<Self> {
        let mut config: Config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|e| crate::Error::Config(e.to_string()))?
        } else {
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides: admin identity and the data directory.
    pub fn apply_env(&mut self) {
        if let Ok(email) = std::env::var("WAYFIND_ADMIN_EMAIL") {
            if !email.is_empty() {
                self.admin.email = email;
            }
        }
        if let Ok(password) = std::env::var("WAYFIND_ADMIN_PASSWORD") {
            if !password.is_empty() {
                self.admin.password = Some(password);
            }
        }
        if let Ok(dir) = std::env::var("WAYFIND_DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
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
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Research loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Maximum tool-call iterations per run. Enforced by the LLM adapter.
    #[serde(default = "d_max_iterations")]
    pub max_iterations: u32,
    /// Default model spec handed to the LLM adapter for new runs.
    #[serde(default)]
    pub default_model: Option<String>,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: d_max_iterations(),
            default_model: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default window when reading text files without an explicit limit.
    #[serde(default = "d_read_line_cap")]
    pub read_line_cap: usize,
    /// Hard cap on fetched response bodies (bytes).
    #[serde(default = "d_web_max_bytes")]
    pub web_max_bytes: usize,
    /// Cap on extracted text handed back to the agent (chars).
    #[serde(default = "d_web_max_text_chars")]
    pub web_max_text_chars: usize,
    /// Per-request web fetch timeout (seconds).
    #[serde(default = "d_web_timeout_secs")]
    pub web_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            read_line_cap: d_read_line_cap(),
            web_max_bytes: d_web_max_bytes(),
            web_max_text_chars: d_web_max_text_chars(),
            web_timeout_secs: d_web_timeout_secs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Automations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationsConfig {
    /// Default per-automation hourly execution cap when the record sets none.
    #[serde(default = "d_hourly_cap")]
    pub default_max_per_hour: u32,
    /// Default per-automation daily execution cap when the record sets none.
    #[serde(default = "d_daily_cap")]
    pub default_max_per_day: u32,
    /// Default debounce for file-watch triggers (milliseconds).
    #[serde(default = "d_debounce_ms")]
    pub default_debounce_ms: u64,
}

impl Default for AutomationsConfig {
    fn default() -> Self {
        Self {
            default_max_per_hour: d_hourly_cap(),
            default_max_per_day: d_daily_cap(),
            default_debounce_ms: d_debounce_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Admin user
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The single local user the server acts for. Authentication itself is
/// handled outside the core; this only names the default identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "d_admin_email")]
    pub email: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            email: d_admin_email(),
            password: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_port() -> u16 {
    4280
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_max_iterations() -> u32 {
    25
}
fn d_read_line_cap() -> usize {
    50
}
fn d_web_max_bytes() -> usize {
    5 * 1024 * 1024
}
fn d_web_max_text_chars() -> usize {
    250_000
}
fn d_web_timeout_secs() -> u64 {
    20
}
fn d_hourly_cap() -> u32 {
    12
}
fn d_daily_cap() -> u32 {
    60
}
fn d_debounce_ms() -> u64 {
    500
}
fn d_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn d_admin_email() -> String {
    "admin@localhost".into()
}
