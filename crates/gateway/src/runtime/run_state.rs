//! The per-conversation run state machine.
//!
//! Pure transition logic: `apply` maps (state, event) to (state, effects)
//! and never touches tokens, futures, or I/O itself. The side-effecting
//! runner interprets the returned effects (creating abort tokens, aborting
//! runs, rejecting pending confirmations).
//!
//! Lifecycle invariant: `Idle -> Running -> {Idle | Stopped}`; a queued
//! soft-interrupt message restarts the cycle from `Stopped`.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// States
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserStop,
    SoftInterrupt,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    None,
    Soft,
    Hard,
}

/// A user message queued by a soft interrupt, started as a fresh run once
/// the current one stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub run_id: String,
    pub client_message_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Idle,
    Running {
        run_id: String,
        client_message_id: String,
        stop_mode: StopMode,
        stop_reason: Option<StopReason>,
        queued: Vec<QueuedMessage>,
    },
    Stopped {
        run_id: String,
        reason: StopReason,
        queued: Vec<QueuedMessage>,
    },
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running { .. })
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            RunState::Running { run_id, .. } | RunState::Stopped { run_id, .. } => {
                Some(run_id.as_str())
            }
            RunState::Idle => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events & effects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub enum RunEvent {
    StartRun {
        run_id: String,
        client_message_id: String,
    },
    /// A user message arrived during an active run. When confirmations are
    /// pending the driver cannot reach a step boundary, so the machine
    /// upgrades to a hard stop with `reason = SoftInterrupt`.
    SoftInterrupt {
        message: QueuedMessage,
        has_pending_confirmations: bool,
    },
    HardStop {
        reason: StopReason,
        clear_queue: bool,
    },
    StepCompleted,
    RunComplete,
    RunError,
    Reset,
}

/// Instructions for the side-effecting runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// A fresh run needs a fresh abort token.
    CreateAbortToken,
    /// Signal the run's abort token and reject all pending confirmations
    /// with the given reason.
    AbortRun { reject_reason: StopReason },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn apply(state: RunState, event: RunEvent) -> (RunState, Vec<Effect>) {
    match (state, event) {
        (RunState::Idle, RunEvent::StartRun { run_id, client_message_id }) => (
            RunState::Running {
                run_id,
                client_message_id,
                stop_mode: StopMode::None,
                stop_reason: None,
                queued: Vec::new(),
            },
            vec![Effect::CreateAbortToken],
        ),

        (
            RunState::Running {
                run_id,
                client_message_id,
                stop_mode,
                stop_reason,
                mut queued,
            },
            RunEvent::SoftInterrupt {
                message,
                has_pending_confirmations,
            },
        ) => {
            queued.push(message);
            match stop_mode {
                StopMode::None if has_pending_confirmations => (
                    // Blocked in a confirmation await: escalate so the
                    // pending futures can be rejected and the queued
                    // message can start a fresh run.
                    RunState::Running {
                        run_id,
                        client_message_id,
                        stop_mode: StopMode::Hard,
                        stop_reason: Some(StopReason::SoftInterrupt),
                        queued,
                    },
                    vec![Effect::AbortRun {
                        reject_reason: StopReason::SoftInterrupt,
                    }],
                ),
                StopMode::None => (
                    RunState::Running {
                        run_id,
                        client_message_id,
                        stop_mode: StopMode::Soft,
                        stop_reason,
                        queued,
                    },
                    Vec::new(),
                ),
                // Already stopping: just keep the message queued.
                _ => (
                    RunState::Running {
                        run_id,
                        client_message_id,
                        stop_mode,
                        stop_reason,
                        queued,
                    },
                    Vec::new(),
                ),
            }
        }

        (
            RunState::Running {
                run_id,
                client_message_id,
                queued,
                ..
            },
            RunEvent::HardStop { reason, clear_queue },
        ) => (
            RunState::Running {
                run_id,
                client_message_id,
                stop_mode: StopMode::Hard,
                stop_reason: Some(reason),
                queued: if clear_queue { Vec::new() } else { queued },
            },
            vec![Effect::AbortRun {
                reject_reason: reason,
            }],
        ),

        (
            RunState::Running {
                run_id,
                client_message_id,
                stop_mode,
                stop_reason,
                queued,
            },
            RunEvent::StepCompleted,
        ) => match stop_mode {
            StopMode::Soft if !queued.is_empty() => (
                RunState::Stopped {
                    run_id,
                    reason: StopReason::SoftInterrupt,
                    queued,
                },
                Vec::new(),
            ),
            StopMode::Hard => (
                RunState::Stopped {
                    run_id,
                    reason: stop_reason.unwrap_or(StopReason::UserStop),
                    queued,
                },
                Vec::new(),
            ),
            _ => (
                RunState::Running {
                    run_id,
                    client_message_id,
                    stop_mode,
                    stop_reason,
                    queued,
                },
                Vec::new(),
            ),
        },

        (RunState::Running { .. }, RunEvent::RunComplete) => (RunState::Idle, Vec::new()),

        (RunState::Running { run_id, .. }, RunEvent::RunError) => (
            RunState::Stopped {
                run_id,
                reason: StopReason::Error,
                queued: Vec::new(),
            },
            Vec::new(),
        ),

        (_, RunEvent::Reset) => (RunState::Idle, Vec::new()),

        // Every other (state, event) pair leaves the state untouched.
        (state, event) => {
            tracing::debug!(?event, "run event ignored in current state");
            (state, Vec::new())
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// True iff the driver should fetch another iteration.
pub fn should_continue(state: &RunState) -> bool {
    matches!(
        state,
        RunState::Running {
            stop_mode: StopMode::None,
            ..
        }
    )
}

/// After persisting a step, should the driver exit, and why?
pub fn should_stop_after_step(state: &RunState) -> Option<StopReason> {
    match state {
        RunState::Running {
            stop_mode: StopMode::Soft,
            queued,
            ..
        } if !queued.is_empty() => Some(StopReason::SoftInterrupt),
        RunState::Running {
            stop_mode: StopMode::Hard,
            stop_reason,
            ..
        } => Some(stop_reason.unwrap_or(StopReason::UserStop)),
        RunState::Stopped { reason, .. } => Some(*reason),
        _ => None,
    }
}

/// Pop the next queued message after a soft-interrupt stop.
pub fn take_next_queued(state: &mut RunState) -> Option<QueuedMessage> {
    match state {
        RunState::Stopped { queued, .. } if !queued.is_empty() => Some(queued.remove(0)),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
