//! JSON-RPC 2.0 framing for the MCP protocol, plus the payload shapes this
//! client consumes: initialize, tools/list, tools/call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Fire-and-forget frame (no `id`, no response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

pub fn initialize_params() -> InitializeParams {
    InitializeParams {
        protocol_version: PROTOCOL_VERSION.into(),
        capabilities: serde_json::json!({}),
        client_info: ClientInfo {
            name: "wayfind".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<McpToolDef>,
}

/// One content item of a tools/call result. Binary kinds carry base64 data
/// and a MIME type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// The client-facing shape of a mapped tool result: a plain string for
/// text-only responses, structured parts otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum MappedContent {
    Text(String),
    Parts(Vec<MappedPart>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappedPart {
    Text { text: String },
    Image { mime: String, base64: String },
    Audio { mime: String, base64: String },
}

/// Collapse a multi-part tools/call payload: text-only results become one
/// joined string; anything with binary parts keeps its structure.
pub fn map_content(content: &[ToolContent]) -> MappedContent {
    let only_text = content.iter().all(|c| c.kind == "text");
    if only_text {
        let joined = content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        return MappedContent::Text(joined);
    }

    let parts = content
        .iter()
        .filter_map(|c| match c.kind.as_str() {
            "text" => c.text.clone().map(|text| MappedPart::Text { text }),
            "image" => c.data.clone().map(|base64| MappedPart::Image {
                mime: c.mime_type.clone().unwrap_or_else(|| "image/png".into()),
                base64,
            }),
            "audio" => c.data.clone().map(|base64| MappedPart::Audio {
                mime: c.mime_type.clone().unwrap_or_else(|| "audio/wav".into()),
                base64,
            }),
            other => {
                tracing::debug!(kind = other, "dropping unrecognized MCP content part");
                None
            }
        })
        .collect();
    MappedContent::Parts(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_shape() {
        let req = Request::new(7, "tools/call", Some(serde_json::json!({"name": "x"})));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":7"));
    }

    #[test]
    fn request_without_params_omits_field() {
        let json = serde_json::to_string(&Request::new(1, "tools/list", None)).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn notification_has_no_id() {
        let json =
            serde_json::to_string(&Notification::new("notifications/initialized")).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn response_into_result() {
        let ok: Response =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"x":1}}"#).unwrap();
        assert_eq!(ok.into_result().unwrap()["x"], 1);

        let err: Response = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        let rpc_err = err.into_result().unwrap_err();
        assert_eq!(rpc_err.code, -32601);
    }

    #[test]
    fn tools_list_parses_with_defaults() {
        let raw = r#"{"tools":[{"name":"ping"}]}"#;
        let parsed: ToolsListResult = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.tools[0].name, "ping");
        assert_eq!(parsed.tools[0].description, "");
        assert_eq!(parsed.tools[0].input_schema["type"], "object");
    }

    #[test]
    fn tool_call_result_parses_text() {
        let raw = r#"{"content":[{"type":"text","text":"done"}]}"#;
        let parsed: ToolCallResult = serde_json::from_str(raw).unwrap();
        assert!(!parsed.is_error);
        assert_eq!(map_content(&parsed.content), MappedContent::Text("done".into()));
    }

    #[test]
    fn text_parts_join_to_plain_string() {
        let content = vec![
            ToolContent {
                kind: "text".into(),
                text: Some("first".into()),
                data: None,
                mime_type: None,
            },
            ToolContent {
                kind: "text".into(),
                text: Some("second".into()),
                data: None,
                mime_type: None,
            },
        ];
        assert_eq!(map_content(&content), MappedContent::Text("first\nsecond".into()));
    }

    #[test]
    fn mixed_content_keeps_parts() {
        let content = vec![
            ToolContent {
                kind: "text".into(),
                text: Some("caption".into()),
                data: None,
                mime_type: None,
            },
            ToolContent {
                kind: "image".into(),
                text: None,
                data: Some("aWNvbg==".into()),
                mime_type: Some("image/png".into()),
            },
        ];
        match map_content(&content) {
            MappedContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(&parts[1], MappedPart::Image { mime, .. } if mime == "image/png"));
            }
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn audio_content_mapped() {
        let content = vec![ToolContent {
            kind: "audio".into(),
            text: None,
            data: Some("c291bmQ=".into()),
            mime_type: Some("audio/mpeg".into()),
        }];
        match map_content(&content) {
            MappedContent::Parts(parts) => {
                assert!(matches!(&parts[0], MappedPart::Audio { mime, .. } if mime == "audio/mpeg"));
            }
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn initialize_params_pin_version() {
        let params = initialize_params();
        assert_eq!(params.protocol_version, PROTOCOL_VERSION);
        assert_eq!(params.client_info.name, "wayfind");
    }
}
