//! Automation data model: triggers, executions, and the durable pending
//! confirmations that outlive a process restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wf_domain::confirm::ConfirmationRequest;

/// Executions running at once across the whole process.
pub const MAX_CONCURRENT_EXECUTIONS: usize = 3;

/// Retries after the first attempt.
pub const MAX_RETRIES: u32 = 2;

/// Back-off before each retry attempt.
pub const RETRY_DELAYS: [std::time::Duration; 2] = [
    std::time::Duration::from_secs(15),
    std::time::Duration::from_secs(30),
];

/// Durable confirmations expire after a day.
pub const CONFIRMATION_TTL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Error messages that must not be retried.
pub const NON_RETRYABLE_ERRORS: [&str; 4] = [
    "confirmation timeout expired",
    "automation not found",
    "user not found",
    "automation cancelled",
];

pub fn is_non_retryable(message: &str) -> bool {
    let lowered = message.to_lowercase();
    NON_RETRYABLE_ERRORS
        .iter()
        .any(|needle| lowered.contains(needle))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Triggers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronTrigger {
    /// 5-field cron expression: minute hour dom month dow.
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchEventKind {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWatchTrigger {
    /// Watched roots; `~` is expanded.
    pub paths: Vec<String>,
    /// Optional glob applied to the changed file's path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Which event kinds fire the automation.
    pub events: Vec<WatchEventKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "trigger_type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Cron(CronTrigger),
    FileWatch(FileWatchTrigger),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Automation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Active,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    /// The user message each triggered run starts from.
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerConfig>,
    pub status: AutomationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions_per_hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions_per_day: Option<u32>,
    /// All runs of one automation share one conversation, linked on first
    /// run (nullable both ways, ids only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Automation {
    pub fn new(user_id: &str, name: &str, prompt: &str, trigger: Option<TriggerConfig>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_owned(),
            name: name.to_owned(),
            prompt: prompt.to_owned(),
            trigger,
            status: AutomationStatus::Active,
            max_executions_per_hour: None,
            max_executions_per_day: None,
            conversation_id: None,
            last_executed_at: None,
            next_scheduled_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    AwaitingConfirmation,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationExecution {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub status: ExecutionStatus,
    pub trigger_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AutomationExecution {
    pub fn new(automation_id: Uuid, trigger_data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id,
            status: ExecutionStatus::Pending,
            trigger_data,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error_message: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Durable confirmations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingConfirmationStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

/// Unlike the in-memory pending map of an interactive run, this record
/// survives a process restart; an orphaned row can still be answered and is
/// simply treated as lost by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfirmationRecord {
    /// Equals the confirmation request id.
    pub id: Uuid,
    pub execution_id: Uuid,
    pub request: ConfirmationRequest,
    pub status: PendingConfirmationStatus,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_retryable_matching() {
        assert!(is_non_retryable("Confirmation timeout expired"));
        assert!(is_non_retryable("error: automation not found"));
        assert!(is_non_retryable("user not found"));
        assert!(is_non_retryable("automation cancelled"));
        assert!(!is_non_retryable("connection reset by peer"));
        assert!(!is_non_retryable("rate limited"));
    }

    #[test]
    fn execution_status_terminality() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::AwaitingConfirmation.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn trigger_config_serde_tagging() {
        let cron = TriggerConfig::Cron(CronTrigger {
            schedule: "0 9 * * *".into(),
            timezone: Some("Europe/Paris".into()),
        });
        let json = serde_json::to_value(&cron).unwrap();
        assert_eq!(json["trigger_type"], "cron");
        assert_eq!(json["schedule"], "0 9 * * *");

        let watch = TriggerConfig::FileWatch(FileWatchTrigger {
            paths: vec!["~/inbox".into()],
            pattern: Some("*.md".into()),
            events: vec![WatchEventKind::Create, WatchEventKind::Modify],
            debounce_ms: Some(500),
        });
        let json = serde_json::to_value(&watch).unwrap();
        assert_eq!(json["trigger_type"], "file_watch");
        assert_eq!(json["events"][0], "create");
    }

    #[test]
    fn automation_roundtrip_with_defaults() {
        let automation = Automation::new("admin@localhost", "daily digest", "summarize", None);
        let json = serde_json::to_string(&automation).unwrap();
        let back: Automation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, AutomationStatus::Active);
        assert!(back.conversation_id.is_none());
        assert!(back.max_executions_per_hour.is_none());
    }
}
