//! Step types — one entry in a trajectory.
//!
//! What the original wire format keeps as untyped JSON (observation content,
//! multi-part tool results) is modelled here as tagged variants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Source
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepSource {
    System,
    User,
    Agent,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool calls & observations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub function_name: String,
    pub arguments: serde_json::Value,
}

/// One content part of a multi-part tool result. Binary parts carry
/// base64-encoded data alongside the MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { mime: String, base64: String },
    Audio { mime: String, base64: String },
}

/// Tool result content: a plain string for text-only results, a part list
/// when binary content is involved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultContent {
    Text(String),
    Multi(Vec<ContentPart>),
}

impl ResultContent {
    /// Flatten to display text; binary parts become placeholders.
    pub fn as_text(&self) -> String {
        match self {
            ResultContent::Text(t) => t.clone(),
            ResultContent::Multi(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.clone(),
                    ContentPart::Image { mime, .. } => format!("[image: {mime}]"),
                    ContentPart::Audio { mime, .. } => format!("[audio: {mime}]"),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Each result references the tool call that produced it by id — linkage is
/// by `source_call_id`, never positional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationResult {
    pub source_call_id: String,
    pub content: ResultContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub results: Vec<ObservationResult>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metrics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(default)]
    pub cost_usd: f64,
}

impl StepMetrics {
    /// Accumulate another step's metrics into this aggregate.
    pub fn accumulate(&mut self, other: &StepMetrics) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        if let Some(cached) = other.cached_tokens {
            *self.cached_tokens.get_or_insert(0) += cached;
        }
        self.cost_usd += other.cost_usd;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within a trajectory, strictly increasing, never reused.
    pub step_id: u64,
    pub timestamp: DateTime<Utc>,
    pub source: StepSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StepMetrics>,
    /// Provider-opaque passthrough kept only for the next LLM call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<serde_json::Value>,
}

/// Everything a caller provides when appending a step; ids and timestamps
/// are assigned by the trajectory.
#[derive(Debug, Clone, Default)]
pub struct StepDraft {
    pub source: Option<StepSource>,
    pub message: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub observation: Option<Observation>,
    pub metrics: Option<StepMetrics>,
    pub raw_output: Option<serde_json::Value>,
}

impl StepDraft {
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            source: Some(StepSource::System),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self {
            source: Some(StepSource::User),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self {
            source: Some(StepSource::Agent),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(calls);
        self
    }

    pub fn with_observation(mut self, observation: Observation) -> Self {
        self.observation = Some(observation);
        self
    }

    pub fn with_metrics(mut self, metrics: StepMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw_output = Some(raw);
        self
    }
}
