//! Persistence for automations, their executions, and durable pending
//! confirmations. JSON files under the state directory, rewritten
//! atomically; executions are bounded to a recent window in memory and on
//! disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use wf_domain::{Error, Result};

use super::model::{
    Automation, AutomationExecution, AutomationStatus, ExecutionStatus,
    PendingConfirmationRecord, PendingConfirmationStatus,
};

const MAX_EXECUTIONS_KEPT: usize = 1000;

pub struct AutomationStore {
    dir: PathBuf,
    automations: RwLock<Vec<Automation>>,
    executions: RwLock<Vec<AutomationExecution>>,
    pending: RwLock<Vec<PendingConfirmationRecord>>,
}

impl AutomationStore {
    pub fn new(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("automations");
        std::fs::create_dir_all(&dir)?;
        let automations = load_json(&dir.join("automations.json"))?;
        let executions = load_json(&dir.join("executions.json"))?;
        let pending = load_json(&dir.join("pending_confirmations.json"))?;
        Ok(Self {
            dir,
            automations: RwLock::new(automations),
            executions: RwLock::new(executions),
            pending: RwLock::new(pending),
        })
    }

    // ── Automations ───────────────────────────────────────────────────

    pub fn create(&self, automation: Automation) -> Result<Automation> {
        let mut automations = self.automations.write();
        automations.push(automation.clone());
        persist_json(&self.dir.join("automations.json"), &*automations)?;
        Ok(automation)
    }

    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut Automation)) -> Result<Automation> {
        let mut automations = self.automations.write();
        let automation = automations
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(Error::AutomationNotFound(id))?;
        f(automation);
        automation.updated_at = Utc::now();
        let updated = automation.clone();
        persist_json(&self.dir.join("automations.json"), &*automations)?;
        Ok(updated)
    }

    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let mut automations = self.automations.write();
        let before = automations.len();
        automations.retain(|a| a.id != id);
        let removed = automations.len() != before;
        if removed {
            persist_json(&self.dir.join("automations.json"), &*automations)?;
        }
        Ok(removed)
    }

    pub fn get(&self, id: Uuid) -> Option<Automation> {
        self.automations.read().iter().find(|a| a.id == id).cloned()
    }

    pub fn list(&self) -> Vec<Automation> {
        self.automations.read().clone()
    }

    pub fn list_active(&self) -> Vec<Automation> {
        self.automations
            .read()
            .iter()
            .filter(|a| a.status == AutomationStatus::Active)
            .cloned()
            .collect()
    }

    /// Bidirectional one-to-one link, stored as two nullable ids.
    pub fn link_conversation(&self, id: Uuid, conversation_id: Uuid) -> Result<()> {
        self.update(id, |a| a.conversation_id = Some(conversation_id))
            .map(|_| ())
    }

    /// Reverse direction of the link: the automation owning a conversation.
    pub fn automation_for_conversation(&self, conversation_id: Uuid) -> Option<Automation> {
        self.automations
            .read()
            .iter()
            .find(|a| a.conversation_id == Some(conversation_id))
            .cloned()
    }

    // ── Executions ────────────────────────────────────────────────────

    pub fn insert_execution(&self, execution: AutomationExecution) -> Result<AutomationExecution> {
        let mut executions = self.executions.write();
        executions.push(execution.clone());
        let overflow = executions.len().saturating_sub(MAX_EXECUTIONS_KEPT);
        if overflow > 0 {
            executions.drain(..overflow);
        }
        persist_json(&self.dir.join("executions.json"), &*executions)?;
        Ok(execution)
    }

    pub fn update_execution(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut AutomationExecution),
    ) -> Result<AutomationExecution> {
        let mut executions = self.executions.write();
        let execution = executions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::Other(format!("execution {id} not found")))?;
        f(execution);
        let updated = execution.clone();
        persist_json(&self.dir.join("executions.json"), &*executions)?;
        Ok(updated)
    }

    pub fn get_execution(&self, id: Uuid) -> Option<AutomationExecution> {
        self.executions.read().iter().find(|e| e.id == id).cloned()
    }

    pub fn executions_for(&self, automation_id: Uuid) -> Vec<AutomationExecution> {
        self.executions
            .read()
            .iter()
            .filter(|e| e.automation_id == automation_id)
            .cloned()
            .collect()
    }

    /// Executions created for an automation since a cutoff; the rate
    /// limiter counts these against the hourly/daily caps.
    pub fn executions_since(&self, automation_id: Uuid, cutoff: DateTime<Utc>) -> usize {
        self.executions
            .read()
            .iter()
            .filter(|e| e.automation_id == automation_id && e.created_at >= cutoff)
            .count()
    }

    pub fn count_running(&self) -> usize {
        self.executions
            .read()
            .iter()
            .filter(|e| e.status == ExecutionStatus::Running)
            .count()
    }

    // ── Durable confirmations ─────────────────────────────────────────

    pub fn insert_pending(&self, record: PendingConfirmationRecord) -> Result<()> {
        let mut pending = self.pending.write();
        pending.push(record);
        persist_json(&self.dir.join("pending_confirmations.json"), &*pending)
    }

    pub fn update_pending(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut PendingConfirmationRecord),
    ) -> Result<PendingConfirmationRecord> {
        let mut pending = self.pending.write();
        let record = pending
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::Other(format!("pending confirmation {id} not found")))?;
        f(record);
        let updated = record.clone();
        persist_json(&self.dir.join("pending_confirmations.json"), &*pending)?;
        Ok(updated)
    }

    pub fn get_pending(&self, id: Uuid) -> Option<PendingConfirmationRecord> {
        self.pending.read().iter().find(|p| p.id == id).cloned()
    }

    pub fn list_pending(&self) -> Vec<PendingConfirmationRecord> {
        self.pending
            .read()
            .iter()
            .filter(|p| p.status == PendingConfirmationStatus::Pending)
            .cloned()
            .collect()
    }

    // ── Crash recovery ────────────────────────────────────────────────

    /// On startup, every execution that was in flight when the process died
    /// is cancelled, and its pending confirmations expire.
    pub fn recovery_sweep(&self) -> Result<(usize, usize)> {
        let mut cancelled = 0;
        {
            let mut executions = self.executions.write();
            for execution in executions.iter_mut() {
                if !execution.status.is_terminal() {
                    execution.status = ExecutionStatus::Cancelled;
                    execution.error_message = Some("interrupted by server restart".into());
                    execution.completed_at = Some(Utc::now());
                    cancelled += 1;
                }
            }
            if cancelled > 0 {
                persist_json(&self.dir.join("executions.json"), &*executions)?;
            }
        }

        let mut expired = 0;
        {
            let mut pending = self.pending.write();
            for record in pending.iter_mut() {
                if record.status == PendingConfirmationStatus::Pending {
                    record.status = PendingConfirmationStatus::Expired;
                    expired += 1;
                }
            }
            if expired > 0 {
                persist_json(&self.dir.join("pending_confirmations.json"), &*pending)?;
            }
        }

        if cancelled > 0 || expired > 0 {
            tracing::info!(cancelled, expired, "automation recovery sweep");
        }
        Ok((cancelled, expired))
    }

    /// Rate limit check against the record's caps (or the given defaults).
    pub fn within_rate_limits(
        &self,
        automation: &Automation,
        default_hourly: u32,
        default_daily: u32,
    ) -> bool {
        let now = Utc::now();
        let hourly_cap = automation.max_executions_per_hour.unwrap_or(default_hourly);
        let daily_cap = automation.max_executions_per_day.unwrap_or(default_daily);
        let last_hour = self.executions_since(automation.id, now - Duration::hours(1));
        if last_hour >= hourly_cap as usize {
            return false;
        }
        let last_day = self.executions_since(automation.id, now - Duration::days(1));
        last_day < daily_cap as usize
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn persist_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
