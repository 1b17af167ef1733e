//! Command dispatch and run orchestration for one client connection.
//!
//! The connection owns a session map keyed by conversation id. Commands for
//! one connection are serialized through [`Connection::handle`]; distinct
//! conversations still run in parallel because each run lives in its own
//! spawned task.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::runtime::cancel::AbortToken;
use crate::runtime::confirm::ConfirmationRouter;
use crate::runtime::research::{run_research, ResearchInput, RunError};
use crate::runtime::run_state::{self, QueuedMessage, RunEvent, RunState, StopReason};
use crate::runtime::tool_exec::ToolExecutor;
use crate::runtime::DriverEvent;
use crate::state::AppState;

use super::frames::{
    ClientCommand, CompleteData, IterationData, ServerEvent, ToolCallStartData,
};
use super::session::{SessionControl, SessionMap, SharedSession};

/// One run to execute: ids from the client command plus the user message
/// (absent when resuming without new input).
struct RunSpec {
    run_id: String,
    client_message_id: String,
    message: Option<String>,
}

pub struct Connection {
    state: AppState,
    sessions: Arc<SessionMap>,
    outbound: mpsc::Sender<ServerEvent>,
    user: String,
}

impl Connection {
    pub fn new(state: AppState, outbound: mpsc::Sender<ServerEvent>) -> Self {
        let user = state.config.admin.email.clone();
        Self {
            state,
            sessions: Arc::new(SessionMap::new()),
            outbound,
            user,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionMap> {
        &self.sessions
    }

    pub async fn handle(&self, command: ClientCommand) {
        match command {
            ClientCommand::Message {
                message,
                conversation_id,
                client_message_id,
                run_id,
            } => {
                self.handle_message(message, conversation_id, client_message_id, run_id)
                    .await
            }
            ClientCommand::Stop {
                conversation_id,
                run_id,
            } => self.handle_stop(conversation_id, run_id).await,
            ClientCommand::Fork {
                message,
                source_conversation_id,
                client_message_id,
                run_id,
            } => {
                self.handle_fork(message, source_conversation_id, client_message_id, run_id)
                    .await
            }
            ClientCommand::ConfirmationResponse {
                conversation_id,
                run_id,
                data,
            } => {
                self.handle_confirmation_response(conversation_id, run_id, data)
                    .await
            }
        }
    }

    // ── message ───────────────────────────────────────────────────────

    async fn handle_message(
        &self,
        message: String,
        conversation_id: Option<Uuid>,
        client_message_id: String,
        run_id: String,
    ) {
        let (conversation_id, is_new) = match conversation_id {
            Some(id) => (id, false),
            None => (Uuid::new_v4(), true),
        };
        if is_new {
            self.emit(ServerEvent::ConversationCreated { conversation_id }).await;
        }

        let session = self.sessions.get_or_create(conversation_id, &self.user);
        let start = {
            let mut guard = session.lock();
            if guard.state.is_running() {
                // Active run: queue as a soft interrupt. When the run is
                // blocked in a confirmation, the machine escalates to a hard
                // stop so the queued message can start a fresh run.
                let has_pending = guard.has_pending_confirmations();
                guard.apply(RunEvent::SoftInterrupt {
                    message: QueuedMessage {
                        run_id,
                        client_message_id,
                        message,
                    },
                    has_pending_confirmations: has_pending,
                });
                None
            } else {
                guard.apply(RunEvent::Reset);
                guard.apply(RunEvent::StartRun {
                    run_id: run_id.clone(),
                    client_message_id: client_message_id.clone(),
                });
                Some(RunSpec {
                    run_id,
                    client_message_id,
                    message: Some(message),
                })
            }
        };

        if let Some(spec) = start {
            self.spawn_run_loop(conversation_id, session, spec);
        }
    }

    // ── stop ──────────────────────────────────────────────────────────

    async fn handle_stop(&self, conversation_id: Uuid, run_id: Option<String>) {
        let Some(session) = self.sessions.get(conversation_id) else {
            tracing::warn!(%conversation_id, "stop for unknown conversation, dropping");
            return;
        };
        let mut guard = session.lock();
        if let Some(expected) = &run_id {
            if guard.state.run_id() != Some(expected.as_str()) {
                tracing::warn!(
                    %conversation_id,
                    requested = %expected,
                    active = ?guard.state.run_id(),
                    "stop run id mismatch, dropping"
                );
                return;
            }
        }
        guard.apply(RunEvent::HardStop {
            reason: StopReason::UserStop,
            clear_queue: true,
        });
        // run_stopped is emitted by the run task once the driver observes
        // the abort, not here.
    }

    // ── fork ──────────────────────────────────────────────────────────

    async fn handle_fork(
        &self,
        message: String,
        source_conversation_id: Uuid,
        client_message_id: String,
        run_id: String,
    ) {
        let forked = match self.state.trajectories.fork(source_conversation_id) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(%source_conversation_id, error = %e, "fork failed");
                self.emit(ServerEvent::Error {
                    conversation_id: source_conversation_id,
                    error: format!("fork failed: {e}"),
                })
                .await;
                return;
            }
        };

        self.emit(ServerEvent::ConversationCreated {
            conversation_id: forked,
        })
        .await;

        let session = self.sessions.get_or_create(forked, &self.user);
        {
            let mut guard = session.lock();
            guard.apply(RunEvent::StartRun {
                run_id: run_id.clone(),
                client_message_id: client_message_id.clone(),
            });
        }
        self.spawn_run_loop(
            forked,
            session,
            RunSpec {
                run_id,
                client_message_id,
                message: Some(message),
            },
        );
    }

    // ── confirmation_response ─────────────────────────────────────────

    async fn handle_confirmation_response(
        &self,
        conversation_id: Uuid,
        run_id: Option<String>,
        data: wf_domain::confirm::ConfirmationResponse,
    ) {
        let router = match self.sessions.get(conversation_id) {
            Some(session) => {
                let guard = session.lock();
                if let Some(expected) = &run_id {
                    if guard.state.run_id() != Some(expected.as_str()) {
                        tracing::warn!(
                            %conversation_id,
                            requested = %expected,
                            "confirmation response run id mismatch, dropping"
                        );
                        return;
                    }
                }
                guard.router.clone()
            }
            None => None,
        };

        if let Some(router) = router {
            if !router.resolve(&data) {
                tracing::warn!(
                    request_id = %data.request_id,
                    "confirmation response for unknown request"
                );
            }
            return;
        }

        // No interactive gate for this conversation: the request may belong
        // to an automation run, whose confirmations live in the durable
        // table and survive restarts.
        if let Err(e) = self.state.executor.respond_to_confirmation(&data) {
            tracing::warn!(
                %conversation_id,
                request_id = %data.request_id,
                error = %e,
                "confirmation response matched no gate"
            );
        }
    }

    // ── teardown ──────────────────────────────────────────────────────

    /// Connection closed: abort every active run and reject every pending
    /// confirmation, then discard the sessions.
    pub fn close(&self) {
        for session in self.sessions.drain() {
            let mut guard = session.lock();
            if guard.state.is_running() {
                guard.apply(RunEvent::HardStop {
                    reason: StopReason::UserStop,
                    clear_queue: true,
                });
            }
            guard.clear_run_resources();
        }
    }

    async fn emit(&self, event: ServerEvent) {
        let _ = self.outbound.send(event).await;
    }

    // ── run loop ──────────────────────────────────────────────────────

    /// Execute the prepared run, then any messages queued behind it by soft
    /// interrupts, sequentially. `StartRun` must already be applied for the
    /// first spec.
    fn spawn_run_loop(&self, conversation_id: Uuid, session: SharedSession, first: RunSpec) {
        let state = self.state.clone();
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            let mut current = Some(first);
            while let Some(spec) = current.take() {
                current =
                    execute_run(&state, &outbound, conversation_id, &session, spec).await;
            }
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one prepared run to completion and return the successor spec, if a
/// soft interrupt queued one.
async fn execute_run(
    state: &AppState,
    outbound: &mpsc::Sender<ServerEvent>,
    conversation_id: Uuid,
    session: &SharedSession,
    spec: RunSpec,
) -> Option<RunSpec> {
    let (events_tx, events_rx) = mpsc::channel::<DriverEvent>(64);

    let (abort, router) = {
        let mut guard = session.lock();
        tracing::debug!(
            user = %guard.user,
            run_id = %spec.run_id,
            %conversation_id,
            "run prepared"
        );
        let abort = guard.abort.clone().unwrap_or_else(AbortToken::new);
        let router = Arc::new(ConfirmationRouter::new(
            spec.run_id.clone(),
            guard.preferences.clone(),
            events_tx.clone(),
        ));
        guard.router = Some(router.clone());
        (abort, router)
    };

    let _ = outbound
        .send(ServerEvent::RunStarted {
            conversation_id,
            run_id: spec.run_id.clone(),
        })
        .await;
    let _ = outbound
        .send(ServerEvent::Research { conversation_id })
        .await;

    let forwarder = spawn_event_forwarder(conversation_id, events_rx, outbound.clone());

    let tools = Arc::new(ToolExecutor::new(
        router.clone(),
        abort.clone(),
        state.mcp.clone(),
        state.fetcher.clone(),
        state.config.tools.read_line_cap,
    ));
    let control = SessionControl {
        session: session.clone(),
    };
    let input = ResearchInput {
        conversation_id,
        user_message: spec.message,
        model: state.config.research.default_model.clone(),
        max_iterations: state.config.research.max_iterations,
        system_prompt_override: None,
        abort,
    };

    let result = run_research(
        &state.trajectories,
        state.llm.as_ref(),
        tools,
        &control,
        &events_tx,
        input,
    )
    .await;
    // Release our senders feeding the forwarder; the session's router clone
    // goes away in the transition below. Only then can the forwarder drain.
    drop(events_tx);
    drop(router);

    // Transition first, flush remaining driver events, then emit the final
    // frames so per-conversation event order holds.
    let (finish, next) = {
        let mut guard = session.lock();
        match result {
            Ok(outcome) => {
                guard.apply(RunEvent::RunComplete);
                guard.clear_run_resources();
                (Finish::Complete(outcome.response), None)
            }
            Err(RunError::Llm(message)) | Err(RunError::Internal(message)) => {
                guard.apply(RunEvent::RunError);
                guard.clear_run_resources();
                (Finish::Failed(message), None)
            }
            Err(RunError::Paused { .. }) => {
                // A rejection exit can leave the machine in Running(hard);
                // drive it over the step boundary it never reached.
                if guard.state.is_running() {
                    guard.apply(RunEvent::StepCompleted);
                }
                let reason = match &guard.state {
                    RunState::Stopped { reason, .. } => *reason,
                    _ => StopReason::UserStop,
                };
                let successor = run_state::take_next_queued(&mut guard.state);
                let mut remaining = Vec::new();
                while let Some(message) = run_state::take_next_queued(&mut guard.state) {
                    remaining.push(message);
                }
                guard.clear_run_resources();
                if let Some(queued) = &successor {
                    guard.apply(RunEvent::Reset);
                    guard.apply(RunEvent::StartRun {
                        run_id: queued.run_id.clone(),
                        client_message_id: queued.client_message_id.clone(),
                    });
                    // Messages queued behind the successor become soft
                    // interrupts of the new run, so they drain in order.
                    for message in remaining {
                        guard.apply(RunEvent::SoftInterrupt {
                            message,
                            has_pending_confirmations: false,
                        });
                    }
                }
                (
                    Finish::Stopped(reason),
                    successor.map(|queued| RunSpec {
                        run_id: queued.run_id,
                        client_message_id: queued.client_message_id,
                        message: Some(queued.message),
                    }),
                )
            }
        }
    };

    let _ = forwarder.await;

    match finish {
        Finish::Complete(response) => {
            let _ = outbound
                .send(ServerEvent::Complete {
                    conversation_id,
                    data: CompleteData {
                        response,
                        conversation_id,
                    },
                })
                .await;
        }
        Finish::Failed(message) => {
            let _ = outbound
                .send(ServerEvent::Error {
                    conversation_id,
                    error: message,
                })
                .await;
            let _ = outbound
                .send(ServerEvent::RunStopped {
                    conversation_id,
                    reason: StopReason::Error,
                })
                .await;
        }
        Finish::Stopped(reason) => {
            let _ = outbound
                .send(ServerEvent::RunStopped {
                    conversation_id,
                    reason,
                })
                .await;
        }
    }

    next
}

enum Finish {
    Complete(String),
    Failed(String),
    Stopped(StopReason),
}

/// Translate driver events into wire frames. Ends once every sender (the
/// driver's and the router's) is gone.
fn spawn_event_forwarder(
    conversation_id: Uuid,
    mut events: mpsc::Receiver<DriverEvent>,
    outbound: mpsc::Sender<ServerEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let frame = match event {
                DriverEvent::ToolCallStart {
                    thought,
                    message,
                    tool_calls,
                } => Some(ServerEvent::ToolCallStart {
                    conversation_id,
                    data: ToolCallStartData {
                        thought,
                        message,
                        tool_calls,
                    },
                }),
                DriverEvent::Iteration {
                    thought,
                    message,
                    tool_calls,
                    tool_results,
                    step_id,
                    metrics,
                } => Some(ServerEvent::Iteration {
                    conversation_id,
                    data: IterationData {
                        thought,
                        message,
                        tool_calls,
                        tool_results,
                        step_id,
                        metrics,
                    },
                }),
                DriverEvent::ConfirmationRequest { run_id, request } => {
                    Some(ServerEvent::ConfirmationRequest {
                        conversation_id,
                        run_id,
                        data: request,
                    })
                }
                // Internal progress markers without a wire frame.
                DriverEvent::Reasoning { .. } | DriverEvent::UserMessagePersisted { .. } => None,
            };
            if let Some(frame) = frame {
                if outbound.send(frame).await.is_err() {
                    break;
                }
            }
        }
    })
}
