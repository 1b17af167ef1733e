//! Runtime — the research loop driver and everything it leans on: the pure
//! run state machine, abort tokens, the confirmation router, the LLM client
//! contract, and tool dispatch.

pub mod cancel;
pub mod confirm;
pub mod llm;
pub mod research;
pub mod run_state;
pub mod tool_exec;

use wf_domain::confirm::ConfirmationRequest;
use wf_trajectory::{ObservationResult, StepMetrics, ToolCall};

/// Events emitted while a run makes progress. The client channel translates
/// them into wire frames; the automation executor drains them for its
/// collector.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// The model announced tool calls that are about to execute.
    ToolCallStart {
        thought: Option<String>,
        message: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    /// A completed iteration was persisted as an agent step.
    Iteration {
        thought: Option<String>,
        message: Option<String>,
        tool_calls: Vec<ToolCall>,
        tool_results: Vec<ObservationResult>,
        step_id: Option<u64>,
        metrics: Option<StepMetrics>,
    },
    Reasoning {
        text: String,
    },
    UserMessagePersisted {
        step_id: u64,
    },
    ConfirmationRequest {
        run_id: String,
        request: ConfirmationRequest,
    },
}
