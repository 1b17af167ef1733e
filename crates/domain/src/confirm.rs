//! Confirmation protocol — the request/response contract between tool
//! adapters and whichever gate answers them (interactive client or durable
//! automation store).
//!
//! Tools never talk to a client directly. They call [`Confirmer::request_operation_confirmation`]
//! and receive an outcome; the gate implementation decides how the question
//! reaches a human and how long it waits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Risk classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Map an operation (and optional sub-type) to its default risk level.
///
/// `execute_command` is graded by its declared access mode; MCP calls by the
/// agent-declared `operation_type`.
pub fn default_risk(operation: &str, operation_type: Option<&str>) -> RiskLevel {
    match operation {
        "execute_command" => match operation_type {
            Some("read-only") => RiskLevel::Low,
            Some("write-only") => RiskLevel::Medium,
            Some("read-write") => RiskLevel::High,
            _ => RiskLevel::High,
        },
        "mcp_tool_call" => match operation_type {
            Some(sub) if sub.ends_with(":safe") => RiskLevel::Low,
            Some(sub) if sub.ends_with(":unsafe") => RiskLevel::High,
            _ => RiskLevel::Medium,
        },
        "delete_file" => RiskLevel::High,
        "edit_file" | "write_file" | "read_sensitive_file" | "grep_sensitive_path"
        | "fetch_internal_url" => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Preference keys
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The deduplication/preference key for an operation: `op` or `op:subtype`.
///
/// MCP tool calls use the sub-type `"<server>:<safe|unsafe>"`, giving
/// per-server, per-risk granularity.
pub fn confirmation_key(operation: &str, operation_type: Option<&str>) -> String {
    match operation_type {
        Some(sub) if !sub.is_empty() => format!("{operation}:{sub}"),
        _ => operation.to_owned(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / response records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod option_id {
    pub const YES: &str = "yes";
    pub const YES_DONT_ASK: &str = "yes_dont_ask";
    pub const NO: &str = "no";
    pub const GUIDANCE: &str = "guidance";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationOption {
    pub id: String,
    pub label: String,
    /// Rendering hint for the client ("primary", "secondary", "danger").
    pub style: String,
    /// When selected, the gate records the confirmation key as auto-approved
    /// for the rest of the session.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub persist_preference: bool,
}

/// The standard option set offered for every gated operation.
pub fn standard_options() -> Vec<ConfirmationOption> {
    vec![
        ConfirmationOption {
            id: option_id::YES.into(),
            label: "Allow".into(),
            style: "primary".into(),
            persist_preference: false,
        },
        ConfirmationOption {
            id: option_id::YES_DONT_ASK.into(),
            label: "Allow and don't ask again".into(),
            style: "secondary".into(),
            persist_preference: true,
        },
        ConfirmationOption {
            id: option_id::NO.into(),
            label: "Deny".into(),
            style: "danger".into(),
            persist_preference: false,
        },
        ConfirmationOption {
            id: option_id::GUIDANCE.into(),
            label: "Deny with guidance".into(),
            style: "secondary".into(),
            persist_preference: false,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationContext {
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_files: Option<Vec<String>>,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<String>,
}

/// The wire-visible confirmation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
    pub request_id: Uuid,
    pub input_type: String,
    pub title: String,
    pub message: String,
    pub operation: String,
    pub context: OperationContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    pub options: Vec<ConfirmationOption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_option_id: Option<String>,
    /// 0 = never times out (interactive gate); automations use 24 h.
    pub timeout_ms: u64,
}

impl ConfirmationRequest {
    /// The preference key this request is grouped under.
    pub fn key(&self) -> String {
        confirmation_key(&self.operation, self.context.operation_type.as_deref())
    }
}

/// A client's answer to a confirmation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationResponse {
    pub request_id: Uuid,
    pub selected_option_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the requester (a tool adapter) learns back.
#[derive(Debug, Clone)]
pub struct ConfirmationOutcome {
    pub approved: bool,
    pub selected_option: Option<String>,
    pub skip_future_confirmations: bool,
    /// Populated on denial; a `guidance` answer lands here as a soft denial.
    pub denial_reason: Option<String>,
}

impl ConfirmationOutcome {
    pub fn approved(option: &str, skip_future: bool) -> Self {
        Self {
            approved: true,
            selected_option: Some(option.to_owned()),
            skip_future_confirmations: skip_future,
            denial_reason: None,
        }
    }

    pub fn denied(reason: Option<String>) -> Self {
        Self {
            approved: false,
            selected_option: Some(option_id::NO.to_owned()),
            skip_future_confirmations: false,
            denial_reason: reason,
        }
    }

    /// Interpret a raw client response.
    pub fn from_response(response: &ConfirmationResponse) -> Self {
        match response.selected_option_id.as_str() {
            option_id::YES => Self::approved(option_id::YES, false),
            option_id::YES_DONT_ASK => Self::approved(option_id::YES_DONT_ASK, true),
            option_id::GUIDANCE => Self {
                approved: false,
                selected_option: Some(option_id::GUIDANCE.to_owned()),
                skip_future_confirmations: false,
                denial_reason: Some(match &response.guidance {
                    Some(g) => format!("User denied the operation with guidance: {g}"),
                    None => "User denied the operation".to_owned(),
                }),
            },
            _ => Self::denied(Some("User denied the operation".to_owned())),
        }
    }
}

/// Returned instead of an outcome when the run owning the request is being
/// stopped: the pending future was rejected, not answered. Requesters must
/// unwind without executing the gated operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("confirmation rejected: {reason}")]
pub struct ConfirmationRejected {
    pub reason: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Details + trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a gate needs to render a request, beyond operation + target.
#[derive(Debug, Clone, Default)]
pub struct OperationDetails {
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub affected_files: Option<Vec<String>>,
    /// Operation sub-type (e.g. `"read-only"`, `"<server>:safe"`).
    pub operation_type: Option<String>,
    pub diff: Option<String>,
    pub message: Option<String>,
}

#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Block until the user answers (or the gate auto-approves from a stored
    /// preference). `Err(ConfirmationRejected)` means the run is stopping.
    async fn request_operation_confirmation(
        &self,
        operation: &str,
        target: &str,
        details: OperationDetails,
    ) -> std::result::Result<ConfirmationOutcome, ConfirmationRejected>;
}

/// Build the wire request for an operation against a target.
pub fn build_request(
    operation: &str,
    target: &str,
    details: &OperationDetails,
    timeout_ms: u64,
) -> ConfirmationRequest {
    let risk = default_risk(operation, details.operation_type.as_deref());
    ConfirmationRequest {
        request_id: Uuid::new_v4(),
        input_type: "choice".into(),
        title: format!("Allow {operation}?"),
        message: details
            .message
            .clone()
            .unwrap_or_else(|| format!("The agent wants to run {operation} on {target}")),
        operation: operation.to_owned(),
        context: OperationContext {
            tool_name: details.tool_name.clone(),
            tool_args: details.tool_args.clone(),
            affected_files: details.affected_files.clone(),
            risk_level: risk,
            operation_type: details.operation_type.clone(),
        },
        diff: details.diff.clone(),
        options: standard_options(),
        default_option_id: Some(option_id::NO.to_owned()),
        timeout_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_without_subtype() {
        assert_eq!(confirmation_key("write_file", None), "write_file");
        assert_eq!(confirmation_key("write_file", Some("")), "write_file");
    }

    #[test]
    fn key_with_subtype() {
        assert_eq!(
            confirmation_key("execute_command", Some("read-only")),
            "execute_command:read-only"
        );
        assert_eq!(
            confirmation_key("mcp_tool_call", Some("files:safe")),
            "mcp_tool_call:files:safe"
        );
    }

    #[test]
    fn exec_risk_by_access_mode() {
        assert_eq!(default_risk("execute_command", Some("read-only")), RiskLevel::Low);
        assert_eq!(default_risk("execute_command", Some("write-only")), RiskLevel::Medium);
        assert_eq!(default_risk("execute_command", Some("read-write")), RiskLevel::High);
        // No declared mode → treat as the most dangerous.
        assert_eq!(default_risk("execute_command", None), RiskLevel::High);
    }

    #[test]
    fn mcp_risk_by_operation_type() {
        assert_eq!(default_risk("mcp_tool_call", Some("files:safe")), RiskLevel::Low);
        assert_eq!(default_risk("mcp_tool_call", Some("files:unsafe")), RiskLevel::High);
        assert_eq!(default_risk("mcp_tool_call", None), RiskLevel::Medium);
    }

    #[test]
    fn default_risk_by_operation() {
        assert_eq!(default_risk("delete_file", None), RiskLevel::High);
        assert_eq!(default_risk("write_file", None), RiskLevel::Medium);
        assert_eq!(default_risk("read_sensitive_file", None), RiskLevel::Medium);
        assert_eq!(default_risk("fetch_internal_url", None), RiskLevel::Medium);
        assert_eq!(default_risk("read_file", None), RiskLevel::Low);
    }

    #[test]
    fn standard_options_shape() {
        let opts = standard_options();
        assert_eq!(opts.len(), 4);
        let persisting: Vec<_> = opts.iter().filter(|o| o.persist_preference).collect();
        assert_eq!(persisting.len(), 1);
        assert_eq!(persisting[0].id, option_id::YES_DONT_ASK);
    }

    #[test]
    fn outcome_from_yes() {
        let resp = ConfirmationResponse {
            request_id: Uuid::new_v4(),
            selected_option_id: option_id::YES.into(),
            guidance: None,
            timestamp: Utc::now(),
        };
        let outcome = ConfirmationOutcome::from_response(&resp);
        assert!(outcome.approved);
        assert!(!outcome.skip_future_confirmations);
    }

    #[test]
    fn outcome_from_yes_dont_ask_persists() {
        let resp = ConfirmationResponse {
            request_id: Uuid::new_v4(),
            selected_option_id: option_id::YES_DONT_ASK.into(),
            guidance: None,
            timestamp: Utc::now(),
        };
        let outcome = ConfirmationOutcome::from_response(&resp);
        assert!(outcome.approved);
        assert!(outcome.skip_future_confirmations);
    }

    #[test]
    fn outcome_from_guidance_is_soft_denial() {
        let resp = ConfirmationResponse {
            request_id: Uuid::new_v4(),
            selected_option_id: option_id::GUIDANCE.into(),
            guidance: Some("use the staging directory instead".into()),
            timestamp: Utc::now(),
        };
        let outcome = ConfirmationOutcome::from_response(&resp);
        assert!(!outcome.approved);
        assert!(outcome
            .denial_reason
            .as_deref()
            .unwrap()
            .contains("staging directory"));
    }

    #[test]
    fn outcome_from_no() {
        let resp = ConfirmationResponse {
            request_id: Uuid::new_v4(),
            selected_option_id: option_id::NO.into(),
            guidance: None,
            timestamp: Utc::now(),
        };
        let outcome = ConfirmationOutcome::from_response(&resp);
        assert!(!outcome.approved);
        assert!(outcome.denial_reason.is_some());
    }

    #[test]
    fn build_request_carries_risk_and_key() {
        let details = OperationDetails {
            tool_name: "shell".into(),
            tool_args: serde_json::json!({"command": "ls"}),
            operation_type: Some("read-only".into()),
            ..Default::default()
        };
        let req = build_request("execute_command", "ls", &details, 0);
        assert_eq!(req.context.risk_level, RiskLevel::Low);
        assert_eq!(req.key(), "execute_command:read-only");
        assert_eq!(req.timeout_ms, 0);
    }

    #[test]
    fn request_wire_shape_is_camel_case() {
        let req = build_request("delete_file", "/tmp/x", &OperationDetails::default(), 0);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["context"]["riskLevel"], "high");
    }
}
