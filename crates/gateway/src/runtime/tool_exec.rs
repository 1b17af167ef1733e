//! Tool dispatch for the research loop.
//!
//! The LLM adapter hands each iteration's tool calls to a [`ToolExecutor`].
//! Calls within one iteration run concurrently; results keep their
//! `source_call_id` linkage. Adapter failures come back as ordinary textual
//! results so the model can react; only a stop/interrupt unwinds the run.

use std::sync::Arc;

use serde_json::Value;

use wf_domain::confirm::Confirmer;
use wf_mcp_client::protocol::{MappedContent, MappedPart};
use wf_mcp_client::McpManager;
use wf_tools::fetch::{FetchRequest, WebFetcher};
use wf_tools::file_read::FileReadRequest;
use wf_tools::grep::GrepRequest;
use wf_tools::shell::ShellRequest;
use wf_tools::ToolError;
use wf_trajectory::{ContentPart, ObservationResult, ResultContent, ToolCall};

use super::cancel::AbortToken;

/// Control-flow exit: the run is stopping while a tool was in flight.
/// State persisted so far is preserved; nothing new is produced.
#[derive(Debug, Clone, thiserror::Error)]
#[error("research paused: {reason}")]
pub struct ResearchPaused {
    pub reason: String,
}

/// Tool definition advertised to the LLM adapter.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub struct ToolExecutor {
    confirmer: Arc<dyn Confirmer>,
    abort: AbortToken,
    mcp: Arc<McpManager>,
    fetcher: Arc<WebFetcher>,
    read_line_cap: usize,
}

impl ToolExecutor {
    pub fn new(
        confirmer: Arc<dyn Confirmer>,
        abort: AbortToken,
        mcp: Arc<McpManager>,
        fetcher: Arc<WebFetcher>,
        read_line_cap: usize,
    ) -> Self {
        Self {
            confirmer,
            abort,
            mcp,
            fetcher,
            read_line_cap,
        }
    }

    /// Built-in tool definitions plus the namespaced MCP catalog.
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = builtin_definitions();
        for tool in self.mcp.catalog().await {
            defs.push(ToolDefinition {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema,
            });
        }
        defs
    }

    /// Execute every call of one iteration concurrently. Result order
    /// mirrors call order, but consumers must rely on `source_call_id`.
    pub async fn execute_all(
        &self,
        calls: &[ToolCall],
    ) -> Result<Vec<ObservationResult>, ResearchPaused> {
        let futures: Vec<_> = calls.iter().map(|call| self.execute(call)).collect();
        let results = futures_util::future::join_all(futures).await;
        results.into_iter().collect()
    }

    /// Execute one tool call. Failures become textual results.
    pub async fn execute(&self, call: &ToolCall) -> Result<ObservationResult, ResearchPaused> {
        if self.abort.is_cancelled() {
            return Err(ResearchPaused {
                reason: "run aborted".into(),
            });
        }

        let content = match self.dispatch(call).await {
            Ok(content) => content,
            Err(ToolError::Failure(message)) => ResultContent::Text(format!("Error: {message}")),
            Err(ToolError::Interrupted(rejected)) => {
                return Err(ResearchPaused {
                    reason: rejected.reason,
                })
            }
        };

        Ok(ObservationResult {
            source_call_id: call.tool_call_id.clone(),
            content,
        })
    }

    async fn dispatch(&self, call: &ToolCall) -> Result<ResultContent, ToolError> {
        let confirmer = Some(self.confirmer.as_ref());
        match call.function_name.as_str() {
            "read_file" => {
                let request: FileReadRequest = parse_args(&call.arguments)?;
                let value = wf_tools::file_read::read_file(request, self.read_line_cap, confirmer)
                    .await?;
                Ok(render_file_read(&value))
            }
            "grep_files" => {
                let request: GrepRequest = parse_args(&call.arguments)?;
                let value = wf_tools::grep::grep_files(request, confirmer).await?;
                Ok(ResultContent::Text(render_grep(&value)))
            }
            "read_webpage" => {
                let request: FetchRequest = parse_args(&call.arguments)?;
                let value = self.fetcher.read_webpage(request, confirmer).await?;
                Ok(ResultContent::Text(render_fetch(&value)))
            }
            "execute_command" => {
                let request: ShellRequest = parse_args(&call.arguments)?;
                let value = wf_tools::shell::execute_command(request, confirmer).await?;
                Ok(ResultContent::Text(render_shell(&value)))
            }
            name if name.contains(wf_mcp_client::TOOL_NAMESPACE_SEPARATOR) => {
                self.dispatch_mcp(name, call.arguments.clone()).await
            }
            unknown => Err(ToolError::Failure(format!("unknown tool '{unknown}'"))),
        }
    }

    async fn dispatch_mcp(&self, name: &str, args: Value) -> Result<ResultContent, ToolError> {
        use wf_mcp_client::McpError;
        match self
            .mcp
            .execute(name, args, Some(self.confirmer.as_ref()))
            .await
        {
            Ok(MappedContent::Text(text)) => Ok(ResultContent::Text(text)),
            Ok(MappedContent::Parts(parts)) => Ok(ResultContent::Multi(
                parts
                    .into_iter()
                    .map(|part| match part {
                        MappedPart::Text { text } => ContentPart::Text { text },
                        MappedPart::Image { mime, base64 } => ContentPart::Image { mime, base64 },
                        MappedPart::Audio { mime, base64 } => ContentPart::Audio { mime, base64 },
                    })
                    .collect(),
            )),
            Err(McpError::Interrupted(rejected)) => Err(ToolError::Interrupted(rejected)),
            Err(other) => Err(ToolError::Failure(other.to_string())),
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone())
        .map_err(|e| ToolError::Failure(format!("invalid tool arguments: {e}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn render_file_read(value: &Value) -> ResultContent {
    if value["kind"] == "image" {
        return ResultContent::Multi(vec![ContentPart::Image {
            mime: value["mime"].as_str().unwrap_or("image/png").to_owned(),
            base64: value["base64"].as_str().unwrap_or_default().to_owned(),
        }]);
    }
    let path = value["path"].as_str().unwrap_or_default();
    let content = value["content"].as_str().unwrap_or_default();
    ResultContent::Text(format!("{path}:\n{content}"))
}

fn render_grep(value: &Value) -> String {
    let empty = Vec::new();
    let matches = value["matches"].as_array().unwrap_or(&empty);
    if matches.is_empty() {
        return format!("No matches for '{}'", value["pattern"].as_str().unwrap_or(""));
    }
    let mut out = String::new();
    for m in matches {
        out.push_str(&format!(
            "{}:{}: {}\n",
            m["file"].as_str().unwrap_or(""),
            m["line"],
            m["text"].as_str().unwrap_or("")
        ));
    }
    if value["truncated"].as_bool().unwrap_or(false) {
        out.push_str("[match list truncated]\n");
    }
    out
}

fn render_fetch(value: &Value) -> String {
    format!(
        "{} ({} {})\n{}",
        value["url"].as_str().unwrap_or(""),
        value["status"],
        value["content_type"].as_str().unwrap_or(""),
        value["text"].as_str().unwrap_or("")
    )
}

fn render_shell(value: &Value) -> String {
    let mut out = format!("exit code: {}\n", value["exit_code"]);
    let stdout = value["stdout"].as_str().unwrap_or("");
    let stderr = value["stderr"].as_str().unwrap_or("");
    if !stdout.is_empty() {
        out.push_str(stdout);
    }
    if !stderr.is_empty() {
        out.push_str("\n[stderr]\n");
        out.push_str(stderr);
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in tool definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn builtin_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "read_file".into(),
            description: "Read a file. Text files are windowed by line; images return base64; \
                          DOCX/XLSX/PPTX are extracted to text."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Path to the file" },
                    "offset": { "type": "integer", "description": "First line to return (0-indexed)" },
                    "limit": { "type": "integer", "description": "Maximum lines to return" }
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "grep_files".into(),
            description: "Search a directory tree for lines matching a regular expression.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Regular expression" },
                    "path": { "type": "string", "description": "Directory or file to search" },
                    "case_insensitive": { "type": "boolean" },
                    "max_results": { "type": "integer" }
                },
                "required": ["pattern", "path"]
            }),
        },
        ToolDefinition {
            name: "read_webpage".into(),
            description: "Fetch a URL and extract readable text.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "http(s) URL to fetch" },
                    "extract_text": { "type": "boolean", "description": "Extract text from HTML (default true)" }
                },
                "required": ["url"]
            }),
        },
        ToolDefinition {
            name: "execute_command".into(),
            description: "Run a shell command. Declare access_mode so the user can judge the risk."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Shell command to run" },
                    "access_mode": {
                        "type": "string",
                        "enum": ["read-only", "write-only", "read-write"],
                        "description": "Filesystem access the command needs"
                    },
                    "workdir": { "type": "string" },
                    "timeout_secs": { "type": "integer" }
                },
                "required": ["command", "access_mode"]
            }),
        },
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
