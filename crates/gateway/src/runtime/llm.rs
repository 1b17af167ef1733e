//! The LLM client contract.
//!
//! The adapter owns prompt construction and the provider wire format; the
//! driver only sees a lazy stream of [`Iteration`]s. The adapter executes
//! tool calls itself (concurrently, within one iteration) through the
//! [`ToolExecutor`] handle carried by the request, and enforces
//! `max_iterations`.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;

use wf_trajectory::{ObservationResult, StepMetrics, ToolCall, Trajectory};

use super::cancel::AbortToken;
use super::tool_exec::ToolExecutor;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The run's abort token fired, or a blocked confirmation was rejected.
    /// Carries the stop reason text; the driver exits gracefully.
    #[error("research paused: {0}")]
    Aborted(String),

    #[error("no LLM provider configured; runs cannot start until an adapter is wired in")]
    NotConfigured,

    #[error("LLM provider error: {0}")]
    Provider(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Iterations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One element of the research stream.
///
/// Three shapes flow through:
/// - a tool-call preview (`is_tool_call_start`) emitted before dispatch,
/// - a completed iteration with executed tool results,
/// - a terminal iteration (`tool_calls` empty) carrying the final message.
///
/// `system_prompt` is populated on the very first completed iteration only.
#[derive(Debug, Clone, Default)]
pub struct Iteration {
    pub is_tool_call_start: bool,
    pub system_prompt: Option<String>,
    pub thought: Option<String>,
    pub message: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ObservationResult>,
    pub metrics: Option<StepMetrics>,
    pub raw: Option<serde_json::Value>,
}

impl Iteration {
    pub fn tool_call_start(
        thought: Option<String>,
        message: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            is_tool_call_start: true,
            thought,
            message,
            tool_calls,
            ..Default::default()
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Terminal iterations end the run: completed, with no tool calls.
    pub fn is_terminal(&self) -> bool {
        !self.is_tool_call_start && self.tool_calls.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request & trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ResearchRequest {
    /// The conversation context: persisted steps plus, on a first run, the
    /// not-yet-persisted user step appended by the driver.
    pub context: Trajectory,
    pub model: Option<String>,
    pub max_iterations: u32,
    pub system_prompt_override: Option<String>,
    pub abort: AbortToken,
    pub tools: Arc<ToolExecutor>,
}

pub type IterationStream = Pin<Box<dyn Stream<Item = Result<Iteration, LlmError>> + Send>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn research(&self, request: ResearchRequest) -> Result<IterationStream, LlmError>;
}

/// Placeholder client used until a provider adapter is wired in; every run
/// fails fast with a configuration error.
pub struct UnconfiguredLlm;

#[async_trait]
impl LlmClient for UnconfiguredLlm {
    async fn research(&self, _request: ResearchRequest) -> Result<IterationStream, LlmError> {
        Err(LlmError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_detection() {
        assert!(Iteration::terminal("done").is_terminal());
        assert!(!Iteration::tool_call_start(None, None, vec![]).is_terminal());

        let with_calls = Iteration {
            tool_calls: vec![ToolCall {
                tool_call_id: "t1".into(),
                function_name: "read_file".into(),
                arguments: serde_json::json!({}),
            }],
            ..Default::default()
        };
        assert!(!with_calls.is_terminal());
    }
}
