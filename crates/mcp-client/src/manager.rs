//! MCP manager — owns live client connections, advertises namespaced tools,
//! and enforces each server's confirmation policy on execution.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use wf_domain::confirm::{ConfirmationRejected, Confirmer, OperationDetails};

use crate::launcher;
use crate::protocol::{
    self, map_content, MappedContent, McpToolDef, ToolCallResult, ToolsListResult,
};
use crate::registry::{ConfirmationMode, McpServerRecord, McpServerRegistry, McpTransportKind};
use crate::transport::{HttpTransport, McpTransport, StdioTransport, TransportError};
use crate::TOOL_NAMESPACE_SEPARATOR;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server not connected: {0}")]
    ServerNotFound(String),

    #[error("'{0}' is not a namespaced MCP tool name")]
    BadToolName(String),

    #[error("{0}")]
    Denied(String),

    #[error("tool error: {0}")]
    ToolFailed(String),

    /// The run is stopping; the confirmation future was rejected.
    #[error(transparent)]
    Interrupted(#[from] ConfirmationRejected),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One live server connection with its discovered tool set.
pub struct McpClient {
    pub record: McpServerRecord,
    pub tools: Vec<McpToolDef>,
    transport: Box<dyn McpTransport>,
}

impl McpClient {
    /// Connect per the record's transport, run the MCP handshake, and list
    /// tools (restricted by `enabled_tools` when configured).
    pub async fn connect(record: McpServerRecord) -> Result<Self, McpError> {
        let transport: Box<dyn McpTransport> = match record.transport_type {
            McpTransportKind::Stdio => {
                let plan = launcher::launch_plan(&record.path, &[]);
                let env = launcher::build_env(&record.env).await;
                Box::new(StdioTransport::spawn(&plan, &env)?)
            }
            McpTransportKind::Http => Box::new(HttpTransport::new(
                record.path.clone(),
                record.api_key.clone(),
            )?),
        };

        let params = serde_json::to_value(protocol::initialize_params())
            .map_err(|e| McpError::Protocol(format!("serializing initialize params: {e}")))?;
        let response = transport.send_request("initialize", Some(params)).await?;
        response
            .into_result()
            .map_err(|e| McpError::Protocol(format!("initialize failed: {e}")))?;

        transport
            .send_notification("notifications/initialized")
            .await?;

        let tools_response = transport.send_request("tools/list", None).await?;
        let mut tools = match tools_response.into_result() {
            Ok(value) => serde_json::from_value::<ToolsListResult>(value)
                .map(|r| r.tools)
                .unwrap_or_else(|e| {
                    tracing::warn!(server = %record.name, error = %e, "unparseable tools/list result");
                    Vec::new()
                }),
            Err(e) => {
                tracing::warn!(server = %record.name, error = %e, "tools/list failed");
                Vec::new()
            }
        };

        if let Some(enabled) = &record.enabled_tools {
            tools.retain(|t| enabled.iter().any(|name| name == &t.name));
        }

        tracing::info!(server = %record.name, tool_count = tools.len(), "MCP server connected");
        Ok(Self {
            record,
            tools,
            transport,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        if !self.transport.is_alive() {
            return Err(McpError::ServerNotFound(self.record.name.clone()));
        }
        let params = serde_json::json!({ "name": tool, "arguments": arguments });
        let response = self.transport.send_request("tools/call", Some(params)).await?;
        let value = response
            .into_result()
            .map_err(|e| McpError::Protocol(format!("tools/call failed: {e}")))?;
        serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("unparseable tools/call result: {e}")))
    }

    async fn shutdown(&self) {
        self.transport.shutdown().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool as advertised to the agent: namespaced name plus the augmented
/// schema requiring `operation_type`.
#[derive(Debug, Clone)]
pub struct NamespacedTool {
    pub name: String,
    pub server: String,
    pub description: String,
    pub input_schema: Value,
}

/// Add the required `operation_type` property the agent must populate on
/// every call.
pub fn augment_schema(schema: &Value) -> Value {
    let mut out = if schema.is_object() {
        schema.clone()
    } else {
        serde_json::json!({ "type": "object", "properties": {} })
    };

    if let Some(object) = out.as_object_mut() {
        object
            .entry("properties")
            .or_insert_with(|| serde_json::json!({}));
        if let Some(properties) = object.get_mut("properties").and_then(|p| p.as_object_mut()) {
            properties.insert(
                "operation_type".into(),
                serde_json::json!({
                    "type": "string",
                    "enum": ["safe", "unsafe"],
                    "description": "Whether this call only reads state (safe) or may modify it (unsafe)."
                }),
            );
        }
        let required = object
            .entry("required")
            .or_insert_with(|| serde_json::json!([]));
        if let Some(required) = required.as_array_mut() {
            if !required.iter().any(|v| v == "operation_type") {
                required.push(serde_json::json!("operation_type"));
            }
        }
    }
    out
}

/// Split `<server>__<tool>` back into its halves.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(TOOL_NAMESPACE_SEPARATOR)
        .filter(|(server, tool)| !server.is_empty() && !tool.is_empty())
}

/// Does this call require a prompt under the server's confirmation mode?
/// An absent or unrecognized `operation_type` is treated as unsafe.
pub fn needs_confirmation(mode: ConfirmationMode, operation_type: Option<&str>) -> bool {
    match mode {
        ConfirmationMode::Never => false,
        ConfirmationMode::Always => true,
        ConfirmationMode::UnsafeOnly => operation_type != Some("safe"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct McpManager {
    registry: Arc<McpServerRegistry>,
    active: Mutex<HashMap<String, Arc<McpClient>>>,
}

impl McpManager {
    pub fn new(registry: Arc<McpServerRegistry>) -> Self {
        Self {
            registry,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<McpServerRegistry> {
        &self.registry
    }

    /// Connect every enabled server. Failures are recorded on the record and
    /// skipped; the server surfaces as status `error` with no tools.
    pub async fn connect_enabled(&self) {
        for record in self.registry.list_enabled() {
            if let Err(e) = self.connect(record.clone()).await {
                let mut message = e.to_string();
                if let Some(hint) = remote_debugging_hint(&message) {
                    message.push_str(&hint);
                }
                tracing::warn!(server = %record.name, error = %message, "MCP connect failed");
                let _ = self.registry.mark_error(record.id, &message);
            }
        }
    }

    /// Connect (or reconnect) one server, closing any prior client first.
    pub async fn connect(&self, record: McpServerRecord) -> Result<(), McpError> {
        if let Some(previous) = self.active.lock().await.remove(&record.name) {
            previous.shutdown().await;
        }
        let client = McpClient::connect(record.clone()).await?;
        self.active
            .lock()
            .await
            .insert(record.name.clone(), Arc::new(client));
        let _ = self.registry.mark_connected(record.id);
        Ok(())
    }

    pub async fn disconnect(&self, name: &str) {
        if let Some(client) = self.active.lock().await.remove(name) {
            client.shutdown().await;
        }
    }

    pub async fn shutdown(&self) {
        let clients: Vec<_> = self.active.lock().await.drain().map(|(_, c)| c).collect();
        let futures: Vec<_> = clients.iter().map(|c| c.shutdown()).collect();
        futures_util::future::join_all(futures).await;
    }

    pub async fn connected_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Every advertised tool across live servers, namespaced and with the
    /// `operation_type` requirement injected.
    pub async fn catalog(&self) -> Vec<NamespacedTool> {
        let active = self.active.lock().await;
        let mut out = Vec::new();
        for (server_name, client) in active.iter() {
            if !client.is_alive() {
                continue;
            }
            for tool in &client.tools {
                out.push(NamespacedTool {
                    name: format!("{server_name}{TOOL_NAMESPACE_SEPARATOR}{}", tool.name),
                    server: server_name.clone(),
                    description: tool.description.clone(),
                    input_schema: augment_schema(&tool.input_schema),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Execute a namespaced tool call: resolve the server, enforce its
    /// confirmation mode against the declared `operation_type`, strip that
    /// property, forward, and map the returned content.
    pub async fn execute(
        &self,
        namespaced: &str,
        mut arguments: Value,
        confirmer: Option<&dyn Confirmer>,
    ) -> Result<MappedContent, McpError> {
        let (server_name, tool_name) = split_namespaced(namespaced)
            .ok_or_else(|| McpError::BadToolName(namespaced.to_owned()))?;

        let client = self
            .active
            .lock()
            .await
            .get(server_name)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(server_name.to_owned()))?;

        // Only surfaced tools are callable; enabled_tools filtering at
        // connect time is authoritative.
        if !client.tools.iter().any(|t| t.name == tool_name) {
            return Err(McpError::Protocol(format!(
                "tool '{tool_name}' is not advertised by server '{server_name}'"
            )));
        }

        let operation_type = arguments
            .get("operation_type")
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        if needs_confirmation(client.record.confirmation_mode, operation_type.as_deref()) {
            let safety = match operation_type.as_deref() {
                Some("safe") => "safe",
                _ => "unsafe",
            };
            let sub_type = format!("{server_name}:{safety}");
            let details = OperationDetails {
                tool_name: namespaced.to_owned(),
                tool_args: arguments.clone(),
                operation_type: Some(sub_type),
                message: Some(format!(
                    "The agent wants to call {tool_name} on MCP server '{server_name}' ({safety})"
                )),
                ..Default::default()
            };
            match confirmer {
                Some(confirmer) => {
                    let outcome = confirmer
                        .request_operation_confirmation("mcp_tool_call", namespaced, details)
                        .await?;
                    if !outcome.approved {
                        return Err(McpError::Denied(outcome.denial_reason.unwrap_or_else(
                            || format!("User denied the call to {namespaced}"),
                        )));
                    }
                }
                None => {
                    return Err(McpError::Denied(format!(
                        "call to {namespaced} requires confirmation, but no confirmation \
                         context is available"
                    )));
                }
            }
        }

        if let Some(object) = arguments.as_object_mut() {
            object.remove("operation_type");
        }

        let result = client.call_tool(tool_name, arguments).await?;
        if result.is_error {
            let text = match map_content(&result.content) {
                MappedContent::Text(t) => t,
                MappedContent::Parts(_) => "tool returned an error with binary content".into(),
            };
            return Err(McpError::ToolFailed(text));
        }
        Ok(map_content(&result.content))
    }
}

/// Hint appended when a connect error looks like the well-known
/// chrome-devtools remote-debugging misconfiguration.
pub fn remote_debugging_hint(error: &str) -> Option<String> {
    let lowered = error.to_lowercase();
    if lowered.contains("remote debugging") || lowered.contains("remote-debugging") || lowered.contains(":9222") {
        Some(
            "; hint: start the browser with --remote-debugging-port=9222 before \
             connecting the chrome-devtools server"
                .to_owned(),
        )
    } else {
        None
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
