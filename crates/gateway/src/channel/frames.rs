//! Wire frames for the client channel. Commands flow client → server,
//! events server → client; every event carries the conversation id.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wf_domain::confirm::{ConfirmationRequest, ConfirmationResponse};
use wf_trajectory::{ObservationResult, StepMetrics, ToolCall};

use crate::runtime::run_state::StopReason;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// A new turn, or a soft interrupt when the conversation has an active
    /// run.
    Message {
        message: String,
        #[serde(default)]
        conversation_id: Option<Uuid>,
        client_message_id: String,
        run_id: String,
    },
    /// Hard stop of the active run.
    Stop {
        conversation_id: Uuid,
        #[serde(default)]
        run_id: Option<String>,
    },
    /// Deep-copy an existing conversation and start a run on the copy.
    Fork {
        message: String,
        source_conversation_id: Uuid,
        client_message_id: String,
        run_id: String,
    },
    ConfirmationResponse {
        conversation_id: Uuid,
        #[serde(default)]
        run_id: Option<String>,
        data: ConfirmationResponse,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallStartData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ObservationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StepMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteData {
    pub response: String,
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    ConversationCreated {
        conversation_id: Uuid,
    },
    RunStarted {
        conversation_id: Uuid,
        run_id: String,
    },
    /// The research loop is starting or resuming for this conversation.
    Research {
        conversation_id: Uuid,
    },
    ToolCallStart {
        conversation_id: Uuid,
        data: ToolCallStartData,
    },
    Iteration {
        conversation_id: Uuid,
        data: IterationData,
    },
    ConfirmationRequest {
        conversation_id: Uuid,
        run_id: String,
        data: ConfirmationRequest,
    },
    RunStopped {
        conversation_id: Uuid,
        reason: StopReason,
    },
    Complete {
        conversation_id: Uuid,
        data: CompleteData,
    },
    Error {
        conversation_id: Uuid,
        error: String,
    },
}

impl ServerEvent {
    pub fn conversation_id(&self) -> Uuid {
        match self {
            ServerEvent::ConversationCreated { conversation_id }
            | ServerEvent::RunStarted { conversation_id, .. }
            | ServerEvent::Research { conversation_id }
            | ServerEvent::ToolCallStart { conversation_id, .. }
            | ServerEvent::Iteration { conversation_id, .. }
            | ServerEvent::ConfirmationRequest { conversation_id, .. }
            | ServerEvent::RunStopped { conversation_id, .. }
            | ServerEvent::Complete { conversation_id, .. }
            | ServerEvent::Error { conversation_id, .. } => *conversation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_command_parses() {
        let raw = r#"{"type":"message","message":"Hi","clientMessageId":"c1","runId":"r1"}"#;
        let command: ClientCommand = serde_json::from_str(raw).unwrap();
        match command {
            ClientCommand::Message {
                message,
                conversation_id,
                client_message_id,
                run_id,
            } => {
                assert_eq!(message, "Hi");
                assert!(conversation_id.is_none());
                assert_eq!(client_message_id, "c1");
                assert_eq!(run_id, "r1");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn stop_command_parses_without_run_id() {
        let conversation = Uuid::new_v4();
        let raw = format!(r#"{{"type":"stop","conversationId":"{conversation}"}}"#);
        let command: ClientCommand = serde_json::from_str(&raw).unwrap();
        assert!(matches!(command, ClientCommand::Stop { run_id: None, .. }));
    }

    #[test]
    fn confirmation_response_parses() {
        let conversation = Uuid::new_v4();
        let request = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"confirmation_response","conversationId":"{conversation}","runId":"r1",
                "data":{{"requestId":"{request}","selectedOptionId":"yes","timestamp":"2026-01-05T10:00:00Z"}}}}"#
        );
        let command: ClientCommand = serde_json::from_str(&raw).unwrap();
        match command {
            ClientCommand::ConfirmationResponse { data, .. } => {
                assert_eq!(data.request_id, request);
                assert_eq!(data.selected_option_id, "yes");
            }
            other => panic!("expected confirmation_response, got {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_type_tag_and_conversation() {
        let conversation = Uuid::new_v4();
        let event = ServerEvent::RunStopped {
            conversation_id: conversation,
            reason: StopReason::SoftInterrupt,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_stopped");
        assert_eq!(json["reason"], "soft_interrupt");
        assert_eq!(json["conversationId"], conversation.to_string());
    }

    #[test]
    fn complete_event_shape() {
        let conversation = Uuid::new_v4();
        let event = ServerEvent::Complete {
            conversation_id: conversation,
            data: CompleteData {
                response: "Hello".into(),
                conversation_id: conversation,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["data"]["response"], "Hello");
    }

    #[test]
    fn every_event_reports_its_conversation() {
        let conversation = Uuid::new_v4();
        let event = ServerEvent::Research {
            conversation_id: conversation,
        };
        assert_eq!(event.conversation_id(), conversation);
    }
}
