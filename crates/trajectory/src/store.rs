//! Trajectory store — one JSON document per conversation, cached in memory
//! and rewritten atomically on every mutation.
//!
//! The run scheduler guarantees a single writer per conversation; readers
//! (exports, UI fetches) get cloned snapshots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wf_domain::{Error, Result};

use crate::step::{Step, StepDraft, StepMetrics, StepSource};

/// Schema tag prefix for the trajectory interchange format.
pub const ATIF_SCHEMA: &str = "ATIF-1.0";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trajectory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            name: "wayfind".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub schema: String,
    pub session_id: Uuid,
    pub agent: AgentInfo,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub final_metrics: StepMetrics,
}

impl Trajectory {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            schema: ATIF_SCHEMA.into(),
            session_id,
            agent: AgentInfo::default(),
            steps: Vec::new(),
            final_metrics: StepMetrics::default(),
        }
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append a step. The id is `max(existing) + 1` (never reused after a
    /// deletion), the timestamp is now. Returns the assigned step id.
    pub fn add_step(&mut self, draft: StepDraft) -> Result<u64> {
        let source = draft
            .source
            .ok_or_else(|| Error::Validation("step draft has no source".into()))?;
        let step_id = self.steps.iter().map(|s| s.step_id).max().unwrap_or(0) + 1;
        let step = Step {
            step_id,
            timestamp: Utc::now(),
            source,
            message: draft.message,
            reasoning: draft.reasoning,
            tool_calls: draft.tool_calls,
            observation: draft.observation,
            metrics: draft.metrics,
            raw_output: draft.raw_output,
        };
        self.steps.push(step);
        self.recompute_metrics();
        Ok(step_id)
    }

    /// Remove a single step by id. Surviving step ids are unchanged.
    pub fn delete_step(&mut self, step_id: u64) -> bool {
        let before = self.steps.len();
        self.steps.retain(|s| s.step_id != step_id);
        let removed = self.steps.len() != before;
        if removed {
            self.recompute_metrics();
        }
        removed
    }

    /// Remove the consecutive agent block containing `step_id`: the targeted
    /// step and every following agent step up to the next non-agent step.
    /// Returns the number of removed steps (0 if the step is not an agent
    /// step or does not exist).
    pub fn delete_agent_message(&mut self, step_id: u64) -> usize {
        let Some(idx) = self.steps.iter().position(|s| s.step_id == step_id) else {
            return 0;
        };
        if self.steps[idx].source != StepSource::Agent {
            return 0;
        }
        let mut end = idx;
        while end < self.steps.len() && self.steps[end].source == StepSource::Agent {
            end += 1;
        }
        let removed = end - idx;
        self.steps.drain(idx..end);
        self.recompute_metrics();
        removed
    }

    /// Remove a full turn starting at a user step: the user step, any
    /// immediately following user steps (pre-response chaining), and the
    /// consecutive agent steps after them, up to the next user step or the
    /// end. Returns the number of removed steps (0 unless `step_id` names a
    /// user step).
    pub fn delete_turn(&mut self, step_id: u64) -> usize {
        let Some(idx) = self.steps.iter().position(|s| s.step_id == step_id) else {
            return 0;
        };
        if self.steps[idx].source != StepSource::User {
            return 0;
        }
        let mut end = idx;
        while end < self.steps.len() && self.steps[end].source == StepSource::User {
            end += 1;
        }
        while end < self.steps.len() && self.steps[end].source == StepSource::Agent {
            end += 1;
        }
        let removed = end - idx;
        self.steps.drain(idx..end);
        self.recompute_metrics();
        removed
    }

    /// `final_metrics` is always a pure aggregation over surviving steps.
    pub fn recompute_metrics(&mut self) {
        let mut total = StepMetrics::default();
        for step in &self.steps {
            if let Some(m) = &step.metrics {
                total.accumulate(m);
            }
        }
        self.final_metrics = total;
    }

    /// Deep copy under a fresh session id (the fork command). Steps keep
    /// their ids and timestamps; nothing else is carried over.
    pub fn deep_copy(&self, new_session_id: Uuid) -> Trajectory {
        Trajectory {
            schema: self.schema.clone(),
            session_id: new_session_id,
            agent: self.agent.clone(),
            steps: self.steps.clone(),
            final_metrics: self.final_metrics,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle to one conversation's trajectory.
pub type TrajectoryHandle = Arc<Mutex<Trajectory>>;

pub struct TrajectoryStore {
    dir: PathBuf,
    open: Mutex<HashMap<Uuid, TrajectoryHandle>>,
}

impl TrajectoryStore {
    pub fn new(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("trajectories");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            open: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, conversation_id: Uuid) -> PathBuf {
        self.dir.join(format!("{conversation_id}.json"))
    }

    pub fn exists(&self, conversation_id: Uuid) -> bool {
        self.open.lock().contains_key(&conversation_id) || self.path_for(conversation_id).exists()
    }

    /// Open an existing trajectory, or create an empty one for a new
    /// conversation. The map lock is held across the disk load so two
    /// callers can never end up with divergent handles.
    pub fn open_or_create(&self, conversation_id: Uuid) -> Result<TrajectoryHandle> {
        let mut open = self.open.lock();
        if let Some(handle) = open.get(&conversation_id) {
            return Ok(handle.clone());
        }

        let path = self.path_for(conversation_id);
        let trajectory = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Trajectory::new(Uuid::new_v4())
        };

        let handle = Arc::new(Mutex::new(trajectory));
        open.insert(conversation_id, handle.clone());
        Ok(handle)
    }

    /// Open an existing trajectory; error if the conversation is unknown.
    pub fn open(&self, conversation_id: Uuid) -> Result<TrajectoryHandle> {
        if !self.exists(conversation_id) {
            return Err(Error::ConversationNotFound(conversation_id));
        }
        self.open_or_create(conversation_id)
    }

    /// Run a mutation against the trajectory and persist the result
    /// atomically before returning.
    pub fn with_mut<R>(
        &self,
        conversation_id: Uuid,
        f: impl FnOnce(&mut Trajectory) -> R,
    ) -> Result<R> {
        let handle = self.open_or_create(conversation_id)?;
        let (result, snapshot) = {
            let mut trajectory = handle.lock();
            let result = f(&mut trajectory);
            (result, trajectory.clone())
        };
        self.persist(conversation_id, &snapshot)?;
        Ok(result)
    }

    /// Consistent read-only snapshot.
    pub fn snapshot(&self, conversation_id: Uuid) -> Result<Trajectory> {
        let handle = self.open(conversation_id)?;
        let snapshot = handle.lock().clone();
        Ok(snapshot)
    }

    /// Deep-copy a conversation's trajectory into a new conversation under a
    /// fresh session id. Returns the new conversation id.
    pub fn fork(&self, source: Uuid) -> Result<Uuid> {
        let snapshot = self.snapshot(source)?;
        let new_conversation = Uuid::new_v4();
        let copy = snapshot.deep_copy(Uuid::new_v4());
        self.persist(new_conversation, &copy)?;
        self.open
            .lock()
            .insert(new_conversation, Arc::new(Mutex::new(copy)));
        Ok(new_conversation)
    }

    /// Import a validated trajectory as a new conversation.
    pub fn import(&self, trajectory: Trajectory) -> Result<Uuid> {
        let conversation_id = Uuid::new_v4();
        self.persist(conversation_id, &trajectory)?;
        self.open
            .lock()
            .insert(conversation_id, Arc::new(Mutex::new(trajectory)));
        Ok(conversation_id)
    }

    /// Export a conversation's trajectory as an ATIF document.
    pub fn export_atif(&self, conversation_id: Uuid) -> Result<String> {
        let snapshot = self.snapshot(conversation_id)?;
        crate::atif::export(&snapshot)
    }

    /// Validate and import an ATIF document as a new conversation.
    pub fn import_atif(&self, raw: &str) -> Result<Uuid> {
        let trajectory = crate::atif::import(raw)?;
        self.import(trajectory)
    }

    /// Atomic write: serialize to a tmp sibling, then rename into place.
    fn persist(&self, conversation_id: Uuid, trajectory: &Trajectory) -> Result<()> {
        let path = self.path_for(conversation_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(trajectory)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
