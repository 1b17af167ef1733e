//! The automation executor: a FIFO queue with bounded concurrency,
//! per-automation mutual exclusion, rate limits, a retry ladder, and a
//! durable confirmation gate with a 24-hour expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use uuid::Uuid;

use wf_domain::config::Config;
use wf_domain::confirm::{
    build_request, option_id, ConfirmationOutcome, ConfirmationRejected, ConfirmationResponse,
    Confirmer, OperationDetails,
};
use wf_domain::{Error, Result};
use wf_mcp_client::McpManager;
use wf_tools::fetch::WebFetcher;
use wf_trajectory::TrajectoryStore;

use crate::runtime::cancel::AbortToken;
use crate::runtime::llm::LlmClient;
use crate::runtime::research::{run_research, ResearchInput, RunError, TokenControl};
use crate::runtime::tool_exec::ToolExecutor;
use crate::runtime::DriverEvent;

use super::model::{
    is_non_retryable, AutomationExecution, AutomationStatus, ExecutionStatus,
    PendingConfirmationRecord, PendingConfirmationStatus, CONFIRMATION_TTL,
    MAX_CONCURRENT_EXECUTIONS, MAX_RETRIES, RETRY_DELAYS,
};
use super::store::AutomationStore;

const TIMEOUT_MESSAGE: &str = "Confirmation timeout expired";
const CANCELLED_MESSAGE: &str = "automation cancelled";

enum WaiterResolution {
    Outcome(ConfirmationOutcome),
    Rejected(String),
}

type WaiterMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<WaiterResolution>>>>;

pub struct AutomationExecutor {
    store: Arc<AutomationStore>,
    trajectories: Arc<TrajectoryStore>,
    llm: Arc<dyn LlmClient>,
    mcp: Arc<McpManager>,
    fetcher: Arc<WebFetcher>,
    config: Arc<Config>,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
    semaphore: Arc<Semaphore>,
    /// Per-automation mutual exclusion plus the running execution's token.
    running: Mutex<HashMap<Uuid, AbortToken>>,
    waiters: WaiterMap,
    confirmation_ttl: Duration,
}

impl AutomationExecutor {
    pub fn new(
        store: Arc<AutomationStore>,
        trajectories: Arc<TrajectoryStore>,
        llm: Arc<dyn LlmClient>,
        mcp: Arc<McpManager>,
        fetcher: Arc<WebFetcher>,
        config: Arc<Config>,
    ) -> Self {
        Self::with_confirmation_ttl(store, trajectories, llm, mcp, fetcher, config, CONFIRMATION_TTL)
    }

    pub fn with_confirmation_ttl(
        store: Arc<AutomationStore>,
        trajectories: Arc<TrajectoryStore>,
        llm: Arc<dyn LlmClient>,
        mcp: Arc<McpManager>,
        fetcher: Arc<WebFetcher>,
        config: Arc<Config>,
        confirmation_ttl: Duration,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            store,
            trajectories,
            llm,
            mcp,
            fetcher,
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_EXECUTIONS)),
            running: Mutex::new(HashMap::new()),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            confirmation_ttl,
        }
    }

    /// Spawn the worker loop. Call once after construction.
    pub fn start(self: &Arc<Self>) {
        let Some(mut queue_rx) = self.queue_rx.lock().take() else {
            tracing::warn!("automation executor already started");
            return;
        };
        let executor = self.clone();
        tokio::spawn(async move {
            while let Some(execution_id) = queue_rx.recv().await {
                let permit = match executor.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let executor = executor.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    executor.run_execution(execution_id).await;
                });
            }
        });
    }

    // ── Enqueue ───────────────────────────────────────────────────────

    /// Validate and enqueue one execution. Rejected when the automation is
    /// missing, paused, already running, or over its rate caps.
    pub fn queue_execution(
        &self,
        automation_id: Uuid,
        trigger_data: serde_json::Value,
    ) -> Result<Uuid> {
        let automation = self
            .store
            .get(automation_id)
            .ok_or(Error::AutomationNotFound(automation_id))?;
        if automation.status != AutomationStatus::Active {
            return Err(Error::Other(format!(
                "automation '{}' is paused",
                automation.name
            )));
        }
        if self.running.lock().contains_key(&automation_id) {
            return Err(Error::Other(format!(
                "automation '{}' is already running",
                automation.name
            )));
        }
        if !self.store.within_rate_limits(
            &automation,
            self.config.automations.default_max_per_hour,
            self.config.automations.default_max_per_day,
        ) {
            return Err(Error::Other(format!(
                "automation '{}' exceeded its execution rate limit",
                automation.name
            )));
        }

        let execution = self
            .store
            .insert_execution(AutomationExecution::new(automation_id, trigger_data))?;
        self.queue_tx
            .send(execution.id)
            .map_err(|_| Error::Other("automation executor is not running".into()))?;
        tracing::info!(
            automation = %automation.name,
            execution_id = %execution.id,
            "queued automation execution"
        );
        Ok(execution.id)
    }

    // ── Control ───────────────────────────────────────────────────────

    /// Pause an automation and abort its running execution, if any.
    pub fn deactivate(&self, automation_id: Uuid) -> Result<()> {
        self.store
            .update(automation_id, |a| a.status = AutomationStatus::Paused)?;
        self.abort_running(automation_id);
        Ok(())
    }

    pub fn abort_running(&self, automation_id: Uuid) {
        if let Some(token) = self.running.lock().get(&automation_id) {
            token.cancel();
        }
    }

    pub fn is_running(&self, automation_id: Uuid) -> bool {
        self.running.lock().contains_key(&automation_id)
    }

    // ── Confirmation responses ────────────────────────────────────────

    /// Answer a durable confirmation. The row is updated even when the
    /// in-memory future is gone after a restart (the executor treats the
    /// orphan as lost). Approvals and guidance answers resume the
    /// execution; a hard denial cancels it.
    pub fn respond_to_confirmation(&self, response: &ConfirmationResponse) -> Result<()> {
        let record = self
            .store
            .get_pending(response.request_id)
            .ok_or_else(|| Error::Other(format!("confirmation {} not found", response.request_id)))?;
        if record.status != PendingConfirmationStatus::Pending {
            return Err(Error::Other(format!(
                "confirmation {} already resolved",
                response.request_id
            )));
        }

        let outcome = ConfirmationOutcome::from_response(response);
        let is_guidance = outcome.selected_option.as_deref() == Some(option_id::GUIDANCE);

        self.store.update_pending(response.request_id, |p| {
            p.status = if outcome.approved {
                PendingConfirmationStatus::Approved
            } else {
                PendingConfirmationStatus::Denied
            };
            p.responded_at = Some(Utc::now());
        })?;

        let waiter = self.waiters.lock().remove(&response.request_id);
        let Some(waiter) = waiter else {
            tracing::warn!(
                request_id = %response.request_id,
                "confirmation answered after restart; execution already lost"
            );
            return Ok(());
        };

        if outcome.approved || is_guidance {
            self.store
                .update_execution(record.execution_id, |e| e.status = ExecutionStatus::Running)?;
            let _ = waiter.send(WaiterResolution::Outcome(outcome));
        } else {
            self.store.update_execution(record.execution_id, |e| {
                e.status = ExecutionStatus::Cancelled;
                e.error_message = Some(CANCELLED_MESSAGE.into());
            })?;
            let _ = waiter.send(WaiterResolution::Rejected(CANCELLED_MESSAGE.into()));
        }
        Ok(())
    }

    // ── Execution ─────────────────────────────────────────────────────

    async fn run_execution(self: Arc<Self>, execution_id: Uuid) {
        let Some(execution) = self.store.get_execution(execution_id) else {
            tracing::warn!(%execution_id, "queued execution vanished");
            return;
        };
        let automation_id = execution.automation_id;
        let Some(automation) = self.store.get(automation_id) else {
            let _ = self.store.update_execution(execution_id, |e| {
                e.status = ExecutionStatus::Failed;
                e.error_message = Some("automation not found".into());
                e.completed_at = Some(Utc::now());
            });
            return;
        };

        // Per-automation mutual exclusion, second check at dequeue time.
        let abort = AbortToken::new();
        {
            let mut running = self.running.lock();
            if running.contains_key(&automation_id) {
                let _ = self.store.update_execution(execution_id, |e| {
                    e.status = ExecutionStatus::Cancelled;
                    e.error_message = Some("skipped: automation already running".into());
                    e.completed_at = Some(Utc::now());
                });
                return;
            }
            running.insert(automation_id, abort.clone());
        }

        // All runs of one automation share one conversation.
        let conversation_id = match automation.conversation_id {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                if let Err(e) = self.store.link_conversation(automation_id, id) {
                    tracing::warn!(error = %e, "failed to link automation conversation");
                }
                id
            }
        };

        let _ = self.store.update_execution(execution_id, |e| {
            e.status = ExecutionStatus::Running;
            e.started_at = Some(Utc::now());
        });
        let _ = self
            .store
            .update(automation_id, |a| a.last_executed_at = Some(Utc::now()));

        let mut attempt: u32 = 0;
        loop {
            let (events_tx, mut events_rx) = mpsc::channel::<DriverEvent>(64);
            // Automation runs have no client channel; drain progress events.
            let drain = tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

            let gate = Arc::new(DurableGate {
                store: self.store.clone(),
                waiters: self.waiters.clone(),
                execution_id,
                ttl: self.confirmation_ttl,
            });
            let tools = Arc::new(ToolExecutor::new(
                gate,
                abort.clone(),
                self.mcp.clone(),
                self.fetcher.clone(),
                self.config.tools.read_line_cap,
            ));
            let control = TokenControl {
                abort: abort.clone(),
            };
            let input = ResearchInput {
                conversation_id,
                user_message: Some(automation.prompt.clone()),
                model: self.config.research.default_model.clone(),
                max_iterations: self.config.research.max_iterations,
                system_prompt_override: None,
                abort: abort.clone(),
            };

            let result = run_research(
                &self.trajectories,
                self.llm.as_ref(),
                tools,
                &control,
                &events_tx,
                input,
            )
            .await;
            drop(events_tx);
            let _ = drain.await;

            match result {
                Ok(outcome) => {
                    let _ = self.store.update_execution(execution_id, |e| {
                        e.status = ExecutionStatus::Completed;
                        e.completed_at = Some(Utc::now());
                    });
                    tracing::info!(
                        automation = %automation.name,
                        %execution_id,
                        iterations = outcome.iteration_count,
                        "automation execution completed"
                    );
                    break;
                }
                Err(error) => {
                    let message = match &error {
                        RunError::Paused { reason } => reason.clone(),
                        RunError::Llm(message) | RunError::Internal(message) => message.clone(),
                    };

                    let cancelled = abort.is_cancelled()
                        || message.to_lowercase().contains(CANCELLED_MESSAGE)
                        || message.contains(TIMEOUT_MESSAGE);
                    if cancelled {
                        let final_message = if message.contains(TIMEOUT_MESSAGE) {
                            TIMEOUT_MESSAGE.to_owned()
                        } else {
                            CANCELLED_MESSAGE.to_owned()
                        };
                        let _ = self.store.update_execution(execution_id, |e| {
                            e.status = ExecutionStatus::Cancelled;
                            e.error_message = Some(final_message.clone());
                            e.completed_at = Some(Utc::now());
                        });
                        break;
                    }

                    if is_non_retryable(&message) || attempt >= MAX_RETRIES {
                        let _ = self.store.update_execution(execution_id, |e| {
                            e.status = ExecutionStatus::Failed;
                            e.error_message = Some(message.clone());
                            e.completed_at = Some(Utc::now());
                        });
                        tracing::warn!(
                            automation = %automation.name,
                            %execution_id,
                            error = %message,
                            "automation execution failed"
                        );
                        break;
                    }

                    let delay = RETRY_DELAYS[attempt as usize % RETRY_DELAYS.len()];
                    attempt += 1;
                    let _ = self.store.update_execution(execution_id, |e| {
                        e.retry_count = attempt;
                        e.error_message = Some(message.clone());
                    });
                    tracing::info!(
                        automation = %automation.name,
                        %execution_id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "retrying automation execution"
                    );
                    tokio::time::sleep(delay).await;
                    if abort.is_cancelled() {
                        let _ = self.store.update_execution(execution_id, |e| {
                            e.status = ExecutionStatus::Cancelled;
                            e.error_message = Some(CANCELLED_MESSAGE.into());
                            e.completed_at = Some(Utc::now());
                        });
                        break;
                    }
                }
            }
        }

        self.running.lock().remove(&automation_id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Durable gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Confirmation gate for automation runs: every request is written to the
/// durable table, the execution flips to `awaiting_confirmation`, and a
/// timer expires the row (and rejects the in-memory future) after the TTL.
struct DurableGate {
    store: Arc<AutomationStore>,
    waiters: WaiterMap,
    execution_id: Uuid,
    ttl: Duration,
}

#[async_trait]
impl Confirmer for DurableGate {
    async fn request_operation_confirmation(
        &self,
        operation: &str,
        target: &str,
        details: OperationDetails,
    ) -> std::result::Result<ConfirmationOutcome, ConfirmationRejected> {
        let request = build_request(operation, target, &details, self.ttl.as_millis() as u64);
        let request_id = request.request_id;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        self.store
            .insert_pending(PendingConfirmationRecord {
                id: request_id,
                execution_id: self.execution_id,
                request,
                status: PendingConfirmationStatus::Pending,
                expires_at,
                responded_at: None,
            })
            .map_err(|e| ConfirmationRejected {
                reason: format!("failed to persist confirmation: {e}"),
            })?;
        self.store
            .update_execution(self.execution_id, |e| {
                e.status = ExecutionStatus::AwaitingConfirmation;
            })
            .map_err(|e| ConfirmationRejected {
                reason: format!("failed to mark execution awaiting confirmation: {e}"),
            })?;

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id, tx);

        // Expiry timer: fires only if nobody answered first.
        {
            let waiters = self.waiters.clone();
            let store = self.store.clone();
            let ttl = self.ttl;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                let waiter = waiters.lock().remove(&request_id);
                if let Some(waiter) = waiter {
                    let _ = store.update_pending(request_id, |p| {
                        p.status = PendingConfirmationStatus::Expired;
                    });
                    let _ = waiter.send(WaiterResolution::Rejected(TIMEOUT_MESSAGE.into()));
                }
            });
        }

        match rx.await {
            Ok(WaiterResolution::Outcome(outcome)) => Ok(outcome),
            Ok(WaiterResolution::Rejected(reason)) => Err(ConfirmationRejected { reason }),
            Err(_) => Err(ConfirmationRejected {
                reason: "confirmation gate dropped".into(),
            }),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::model::Automation;
    use crate::runtime::llm::{Iteration, IterationStream, LlmError, ResearchRequest};
    use wf_mcp_client::McpServerRegistry;
    use wf_tools::fetch::FetchLimits;
    use wf_trajectory::ToolCall;

    /// Adapter that issues one gated execute_command call, then finishes.
    struct ToolCallingLlm;

    #[async_trait]
    impl LlmClient for ToolCallingLlm {
        async fn research(&self, request: ResearchRequest) -> std::result::Result<IterationStream, LlmError> {
            let tools = request.tools.clone();
            let stream = async_stream::stream! {
                let call = ToolCall {
                    tool_call_id: "tc1".into(),
                    function_name: "execute_command".into(),
                    arguments: serde_json::json!({
                        "command": "true",
                        "access_mode": "read-only"
                    }),
                };
                match tools.execute_all(std::slice::from_ref(&call)).await {
                    Ok(results) => {
                        yield Ok(Iteration {
                            system_prompt: Some("automation prompt".into()),
                            tool_calls: vec![call],
                            tool_results: results,
                            ..Default::default()
                        });
                        yield Ok(Iteration::terminal("automation finished"));
                    }
                    Err(paused) => {
                        yield Err(LlmError::Aborted(paused.reason));
                    }
                }
            };
            Ok(Box::pin(stream))
        }
    }

    /// Adapter that always answers immediately with a terminal message.
    struct ImmediateLlm;

    #[async_trait]
    impl LlmClient for ImmediateLlm {
        async fn research(&self, _request: ResearchRequest) -> std::result::Result<IterationStream, LlmError> {
            let stream = async_stream::stream! {
                let mut first = Iteration::terminal("done");
                first.system_prompt = Some("sys".into());
                yield Ok(first);
            };
            Ok(Box::pin(stream))
        }
    }

    /// Adapter that fails with a retryable provider error.
    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn research(&self, _request: ResearchRequest) -> std::result::Result<IterationStream, LlmError> {
            Err(LlmError::Provider("upstream hiccup".into()))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<AutomationStore>,
        executor: Arc<AutomationExecutor>,
    }

    fn fixture(llm: Arc<dyn LlmClient>, ttl: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AutomationStore::new(dir.path()).unwrap());
        let trajectories = Arc::new(TrajectoryStore::new(dir.path()).unwrap());
        let registry = Arc::new(McpServerRegistry::new(dir.path()).unwrap());
        let mcp = Arc::new(McpManager::new(registry));
        let fetcher = Arc::new(WebFetcher::new(FetchLimits::default()).unwrap());
        let config = Arc::new(Config::default());
        let executor = Arc::new(AutomationExecutor::with_confirmation_ttl(
            store.clone(),
            trajectories,
            llm,
            mcp,
            fetcher,
            config,
            ttl,
        ));
        executor.start();
        Fixture {
            _dir: dir,
            store,
            executor,
        }
    }

    async fn wait_for_terminal(
        store: &AutomationStore,
        execution_id: Uuid,
        timeout: Duration,
    ) -> AutomationExecution {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(execution) = store.get_execution(execution_id) {
                if execution.status.is_terminal() {
                    return execution;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("execution did not reach a terminal status in time");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn immediate_run_completes_and_links_conversation() {
        let fx = fixture(Arc::new(ImmediateLlm), Duration::from_secs(60));
        let automation = fx
            .store
            .create(Automation::new("admin", "digest", "summarize", None))
            .unwrap();

        let execution_id = fx
            .executor
            .queue_execution(automation.id, serde_json::json!({"trigger": "manual"}))
            .unwrap();

        let execution =
            wait_for_terminal(&fx.store, execution_id, Duration::from_secs(5)).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let automation = fx.store.get(automation.id).unwrap();
        assert!(automation.conversation_id.is_some());
        assert!(automation.last_executed_at.is_some());
    }

    #[tokio::test]
    async fn repeat_runs_share_the_conversation() {
        let fx = fixture(Arc::new(ImmediateLlm), Duration::from_secs(60));
        let automation = fx
            .store
            .create(Automation::new("admin", "digest", "summarize", None))
            .unwrap();

        let first = fx
            .executor
            .queue_execution(automation.id, serde_json::json!({}))
            .unwrap();
        wait_for_terminal(&fx.store, first, Duration::from_secs(5)).await;
        let conversation = fx.store.get(automation.id).unwrap().conversation_id;

        let second = fx
            .executor
            .queue_execution(automation.id, serde_json::json!({}))
            .unwrap();
        wait_for_terminal(&fx.store, second, Duration::from_secs(5)).await;
        assert_eq!(fx.store.get(automation.id).unwrap().conversation_id, conversation);
    }

    #[tokio::test]
    async fn unknown_automation_rejected_at_enqueue() {
        let fx = fixture(Arc::new(ImmediateLlm), Duration::from_secs(60));
        let err = fx
            .executor
            .queue_execution(Uuid::new_v4(), serde_json::json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn paused_automation_rejected_at_enqueue() {
        let fx = fixture(Arc::new(ImmediateLlm), Duration::from_secs(60));
        let automation = fx
            .store
            .create(Automation::new("admin", "digest", "summarize", None))
            .unwrap();
        fx.executor.deactivate(automation.id).unwrap();
        let err = fx
            .executor
            .queue_execution(automation.id, serde_json::json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("paused"));
    }

    #[tokio::test]
    async fn rate_limit_rejects_enqueue() {
        let fx = fixture(Arc::new(ImmediateLlm), Duration::from_secs(60));
        let mut automation = Automation::new("admin", "busy", "go", None);
        automation.max_executions_per_hour = Some(1);
        let automation = fx.store.create(automation).unwrap();

        let first = fx
            .executor
            .queue_execution(automation.id, serde_json::json!({}))
            .unwrap();
        wait_for_terminal(&fx.store, first, Duration::from_secs(5)).await;

        let err = fx
            .executor
            .queue_execution(automation.id, serde_json::json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("rate limit"));
    }

    #[tokio::test]
    async fn confirmation_timeout_cancels_without_retry() {
        let fx = fixture(Arc::new(ToolCallingLlm), Duration::from_millis(100));
        let automation = fx
            .store
            .create(Automation::new("admin", "guarded", "run the check", None))
            .unwrap();

        let execution_id = fx
            .executor
            .queue_execution(automation.id, serde_json::json!({}))
            .unwrap();

        let execution =
            wait_for_terminal(&fx.store, execution_id, Duration::from_secs(5)).await;
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.error_message.as_deref(), Some(TIMEOUT_MESSAGE));
        assert_eq!(execution.retry_count, 0);

        // The durable row expired.
        let rows: Vec<_> = fx
            .store
            .executions_for(automation.id)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert!(rows.contains(&execution_id));
        let pending = fx.store.list_pending();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn approval_resumes_execution() {
        let fx = fixture(Arc::new(ToolCallingLlm), Duration::from_secs(60));
        let automation = fx
            .store
            .create(Automation::new("admin", "guarded", "run the check", None))
            .unwrap();

        let execution_id = fx
            .executor
            .queue_execution(automation.id, serde_json::json!({}))
            .unwrap();

        // Wait for the durable confirmation row to appear.
        let request_id = {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            loop {
                if let Some(record) = fx
                    .store
                    .list_pending()
                    .into_iter()
                    .find(|p| p.execution_id == execution_id)
                {
                    break record.id;
                }
                if tokio::time::Instant::now() >= deadline {
                    panic!("no pending confirmation appeared");
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        // The execution flips to awaiting_confirmation right after the row
        // lands.
        {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            loop {
                if fx.store.get_execution(execution_id).unwrap().status
                    == ExecutionStatus::AwaitingConfirmation
                {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    panic!("execution never reached awaiting_confirmation");
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        fx.executor
            .respond_to_confirmation(&ConfirmationResponse {
                request_id,
                selected_option_id: option_id::YES.into(),
                guidance: None,
                timestamp: Utc::now(),
            })
            .unwrap();

        let execution =
            wait_for_terminal(&fx.store, execution_id, Duration::from_secs(5)).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(
            fx.store.get_pending(request_id).unwrap().status,
            PendingConfirmationStatus::Approved
        );
    }

    #[tokio::test]
    async fn denial_cancels_execution() {
        let fx = fixture(Arc::new(ToolCallingLlm), Duration::from_secs(60));
        let automation = fx
            .store
            .create(Automation::new("admin", "guarded", "run the check", None))
            .unwrap();
        let execution_id = fx
            .executor
            .queue_execution(automation.id, serde_json::json!({}))
            .unwrap();

        let request_id = {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            loop {
                if let Some(record) = fx
                    .store
                    .list_pending()
                    .into_iter()
                    .find(|p| p.execution_id == execution_id)
                {
                    break record.id;
                }
                if tokio::time::Instant::now() >= deadline {
                    panic!("no pending confirmation appeared");
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        fx.executor
            .respond_to_confirmation(&ConfirmationResponse {
                request_id,
                selected_option_id: option_id::NO.into(),
                guidance: None,
                timestamp: Utc::now(),
            })
            .unwrap();

        let execution =
            wait_for_terminal(&fx.store, execution_id, Duration::from_secs(5)).await;
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert_eq!(
            fx.store.get_pending(request_id).unwrap().status,
            PendingConfirmationStatus::Denied
        );
    }

    #[tokio::test]
    async fn orphaned_response_updates_row_only() {
        let fx = fixture(Arc::new(ImmediateLlm), Duration::from_secs(60));
        let automation = fx
            .store
            .create(Automation::new("admin", "a", "p", None))
            .unwrap();
        let execution = fx
            .store
            .insert_execution(AutomationExecution::new(automation.id, serde_json::json!({})))
            .unwrap();

        // A row with no in-memory waiter, as after a restart.
        let request = build_request("write_file", "/tmp/x", &OperationDetails::default(), 1000);
        let request_id = request.request_id;
        fx.store
            .insert_pending(PendingConfirmationRecord {
                id: request_id,
                execution_id: execution.id,
                request,
                status: PendingConfirmationStatus::Pending,
                expires_at: Utc::now() + chrono::Duration::hours(1),
                responded_at: None,
            })
            .unwrap();

        fx.executor
            .respond_to_confirmation(&ConfirmationResponse {
                request_id,
                selected_option_id: option_id::YES.into(),
                guidance: None,
                timestamp: Utc::now(),
            })
            .unwrap();

        assert_eq!(
            fx.store.get_pending(request_id).unwrap().status,
            PendingConfirmationStatus::Approved
        );
        // The execution itself was not touched.
        assert_eq!(
            fx.store.get_execution(execution.id).unwrap().status,
            ExecutionStatus::Pending
        );
    }

    /// Adapter that holds every run open until the shared semaphore hands
    /// out a permit.
    struct GatedLlm {
        started: Arc<std::sync::atomic::AtomicUsize>,
        release: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait]
    impl LlmClient for GatedLlm {
        async fn research(&self, _request: ResearchRequest) -> std::result::Result<IterationStream, LlmError> {
            let started = self.started.clone();
            let release = self.release.clone();
            let stream = async_stream::stream! {
                started.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let permit = release.acquire().await;
                drop(permit);
                let mut first = Iteration::terminal("released");
                first.system_prompt = Some("sys".into());
                yield Ok(first);
            };
            Ok(Box::pin(stream))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_three_executions_run_concurrently() {
        let started = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let release = Arc::new(tokio::sync::Semaphore::new(0));
        let llm = Arc::new(GatedLlm {
            started: started.clone(),
            release: release.clone(),
        });
        let fx = fixture(llm, Duration::from_secs(60));

        // Five distinct automations, all queued at once.
        let mut execution_ids = Vec::new();
        for i in 0..5 {
            let automation = fx
                .store
                .create(Automation::new("admin", &format!("job-{i}"), "go", None))
                .unwrap();
            execution_ids.push(
                fx.executor
                    .queue_execution(automation.id, serde_json::json!({}))
                    .unwrap(),
            );
        }

        // Only three make it past the semaphore while the rest queue.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while started.load(std::sync::atomic::Ordering::SeqCst) < 3 {
            if tokio::time::Instant::now() >= deadline {
                panic!("three executions never started");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(started.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(fx.store.count_running(), 3);

        // Releasing the gate lets every execution finish.
        release.add_permits(16);
        for execution_id in execution_ids {
            let execution =
                wait_for_terminal(&fx.store, execution_id, Duration::from_secs(5)).await;
            assert_eq!(execution.status, ExecutionStatus::Completed);
        }
    }

    #[tokio::test]
    async fn retries_then_fails() {
        // Shrink the retry delays by pausing tokio's clock.
        tokio::time::pause();
        let fx = fixture(Arc::new(FailingLlm), Duration::from_secs(60));
        let automation = fx
            .store
            .create(Automation::new("admin", "flaky", "go", None))
            .unwrap();
        let execution_id = fx
            .executor
            .queue_execution(automation.id, serde_json::json!({}))
            .unwrap();

        let execution =
            wait_for_terminal(&fx.store, execution_id, Duration::from_secs(120)).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.retry_count, MAX_RETRIES);
        assert!(execution.error_message.as_deref().unwrap().contains("hiccup"));
    }
}
