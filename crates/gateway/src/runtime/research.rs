//! The research loop driver.
//!
//! One call to [`run_research`] produces one logical response: zero or more
//! tool-call iterations, then a final agent message. The driver persists
//! steps in order (system, then the initial user message, then agent steps),
//! emits [`DriverEvent`]s, and treats the abort token and the run control as
//! its only exits besides LLM failure.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use wf_trajectory::{Observation, StepDraft, TrajectoryStore};

use super::cancel::AbortToken;
use super::llm::{LlmClient, LlmError, ResearchRequest};
use super::run_state::StopReason;
use super::tool_exec::ToolExecutor;
use super::DriverEvent;

/// Substituted when a terminal iteration carries an empty message.
pub const EMPTY_RESPONSE_FALLBACK: &str =
    "I was unable to produce a response for this request.";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a research assistant with access to tools.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run control
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDisposition {
    Continue,
    Stop(StopReason),
}

/// Consulted after every persisted step; the session-backed implementation
/// advances the state machine, the automation one only watches its token.
pub trait RunControl: Send + Sync {
    fn on_step_completed(&self) -> StepDisposition;
}

/// Stop only when the abort token fires (automation runs).
pub struct TokenControl {
    pub abort: AbortToken,
}

impl RunControl for TokenControl {
    fn on_step_completed(&self) -> StepDisposition {
        if self.abort.is_cancelled() {
            StepDisposition::Stop(StopReason::UserStop)
        } else {
            StepDisposition::Continue
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs & outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ResearchInput {
    pub conversation_id: Uuid,
    pub user_message: Option<String>,
    pub model: Option<String>,
    pub max_iterations: u32,
    pub system_prompt_override: Option<String>,
    pub abort: AbortToken,
}

#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub response: String,
    pub iteration_count: u32,
    pub conversation_id: Uuid,
    pub step_id: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Controlled exit: stop, soft interrupt, or a rejected confirmation.
    /// Everything persisted so far stays persisted.
    #[error("research paused: {reason}")]
    Paused { reason: String },

    #[error("LLM failure: {0}")]
    Llm(String),

    #[error("internal failure: {0}")]
    Internal(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_research(
    trajectories: &TrajectoryStore,
    llm: &dyn LlmClient,
    tools: Arc<ToolExecutor>,
    control: &dyn RunControl,
    events: &mpsc::Sender<DriverEvent>,
    input: ResearchInput,
) -> Result<ResearchOutcome, RunError> {
    let conversation_id = input.conversation_id;
    trajectories
        .open_or_create(conversation_id)
        .map_err(|e| RunError::Internal(e.to_string()))?;

    let snapshot = trajectories
        .snapshot(conversation_id)
        .map_err(|e| RunError::Internal(e.to_string()))?;
    let first_run = snapshot.is_empty();

    // On subsequent runs the user message is appended right away. On the
    // first ever run it stays in-memory so the persisted order can be
    // system, user, agent once the effective system prompt is known.
    if !first_run {
        if let Some(message) = &input.user_message {
            let step_id = trajectories
                .with_mut(conversation_id, |t| t.add_step(StepDraft::user(message)))
                .map_err(|e| RunError::Internal(e.to_string()))?
                .map_err(|e| RunError::Internal(e.to_string()))?;
            let _ = events.send(DriverEvent::UserMessagePersisted { step_id }).await;
        }
    }

    let mut context = trajectories
        .snapshot(conversation_id)
        .map_err(|e| RunError::Internal(e.to_string()))?;
    if first_run {
        if let Some(message) = &input.user_message {
            context
                .add_step(StepDraft::user(message))
                .map_err(|e| RunError::Internal(e.to_string()))?;
        }
    }

    let request = ResearchRequest {
        context,
        model: input.model.clone(),
        max_iterations: input.max_iterations,
        system_prompt_override: input.system_prompt_override.clone(),
        abort: input.abort.clone(),
        tools,
    };

    let mut stream = match llm.research(request).await {
        Ok(stream) => stream,
        Err(LlmError::Aborted(reason)) => return Err(RunError::Paused { reason }),
        Err(e) => return Err(RunError::Llm(e.to_string())),
    };

    let mut prelude_persisted = !first_run;
    let mut iteration_count: u32 = 0;

    while let Some(item) = stream.next().await {
        let iteration = match item {
            Ok(iteration) => iteration,
            Err(LlmError::Aborted(reason)) => return Err(RunError::Paused { reason }),
            Err(e) => return Err(RunError::Llm(e.to_string())),
        };

        if iteration.is_tool_call_start {
            let _ = events
                .send(DriverEvent::ToolCallStart {
                    thought: iteration.thought,
                    message: iteration.message,
                    tool_calls: iteration.tool_calls,
                })
                .await;
            continue;
        }

        // First completed iteration of a new conversation: persist the
        // system prompt, then the user message, keeping the order invariant.
        if !prelude_persisted {
            prelude_persisted = true;
            let system_prompt = input
                .system_prompt_override
                .clone()
                .or_else(|| iteration.system_prompt.clone())
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_owned());
            trajectories
                .with_mut(conversation_id, |t| t.add_step(StepDraft::system(system_prompt)))
                .map_err(|e| RunError::Internal(e.to_string()))?
                .map_err(|e| RunError::Internal(e.to_string()))?;
            if let Some(message) = &input.user_message {
                let step_id = trajectories
                    .with_mut(conversation_id, |t| t.add_step(StepDraft::user(message)))
                    .map_err(|e| RunError::Internal(e.to_string()))?
                    .map_err(|e| RunError::Internal(e.to_string()))?;
                let _ = events.send(DriverEvent::UserMessagePersisted { step_id }).await;
            }
        }

        if let Some(thought) = &iteration.thought {
            let _ = events
                .send(DriverEvent::Reasoning {
                    text: thought.clone(),
                })
                .await;
        }

        if iteration.is_terminal() {
            let response = match iteration.message.as_deref() {
                Some(text) if !text.trim().is_empty() => text.to_owned(),
                _ => EMPTY_RESPONSE_FALLBACK.to_owned(),
            };

            let mut draft = StepDraft::agent(&response);
            draft.reasoning = iteration.thought.clone();
            draft.metrics = iteration.metrics;
            draft.raw_output = iteration.raw.clone();
            let step_id = trajectories
                .with_mut(conversation_id, |t| t.add_step(draft))
                .map_err(|e| RunError::Internal(e.to_string()))?
                .map_err(|e| RunError::Internal(e.to_string()))?;
            iteration_count += 1;

            let _ = events
                .send(DriverEvent::Iteration {
                    thought: iteration.thought,
                    message: Some(response.clone()),
                    tool_calls: Vec::new(),
                    tool_results: Vec::new(),
                    step_id: Some(step_id),
                    metrics: iteration.metrics,
                })
                .await;

            return Ok(ResearchOutcome {
                response,
                iteration_count,
                conversation_id,
                step_id,
            });
        }

        // Tool-call iteration: persist the agent step with its observation
        // and feed the same step back into the in-memory context.
        let mut draft = StepDraft {
            source: Some(wf_trajectory::StepSource::Agent),
            message: iteration.message.clone(),
            reasoning: iteration.thought.clone(),
            tool_calls: Some(iteration.tool_calls.clone()),
            observation: Some(Observation {
                results: iteration.tool_results.clone(),
            }),
            metrics: iteration.metrics,
            raw_output: iteration.raw.clone(),
        };
        if draft.message.as_deref().is_some_and(|m| m.is_empty()) {
            draft.message = None;
        }
        let step_id = trajectories
            .with_mut(conversation_id, |t| t.add_step(draft))
            .map_err(|e| RunError::Internal(e.to_string()))?
            .map_err(|e| RunError::Internal(e.to_string()))?;
        iteration_count += 1;

        let _ = events
            .send(DriverEvent::Iteration {
                thought: iteration.thought,
                message: iteration.message,
                tool_calls: iteration.tool_calls,
                tool_results: iteration.tool_results,
                step_id: Some(step_id),
                metrics: iteration.metrics,
            })
            .await;

        // Step boundary: the only place a soft interrupt is observed.
        if input.abort.is_cancelled() {
            return Err(RunError::Paused {
                reason: "run aborted".into(),
            });
        }
        if let StepDisposition::Stop(reason) = control.on_step_completed() {
            return Err(RunError::Paused {
                reason: stop_reason_label(reason).to_owned(),
            });
        }
    }

    Err(RunError::Llm(
        "LLM stream ended without a final message".into(),
    ))
}

pub fn stop_reason_label(reason: StopReason) -> &'static str {
    match reason {
        StopReason::UserStop => "user_stop",
        StopReason::SoftInterrupt => "soft_interrupt",
        StopReason::Error => "error",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
