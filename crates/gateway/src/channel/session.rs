//! In-memory sessions, one per conversation per connection.
//!
//! A session owns the run state, the abort token, and the confirmation
//! router of its active run. It dies with the connection; trajectories and
//! automations survive independently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::runtime::cancel::AbortToken;
use crate::runtime::confirm::{ConfirmationPreferences, ConfirmationRouter};
use crate::runtime::research::{stop_reason_label, RunControl, StepDisposition};
use crate::runtime::run_state::{self, Effect, RunEvent, RunState};

pub struct Session {
    pub user: String,
    pub preferences: ConfirmationPreferences,
    pub state: RunState,
    pub abort: Option<AbortToken>,
    pub router: Option<Arc<ConfirmationRouter>>,
}

impl Session {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_owned(),
            preferences: Arc::new(Mutex::new(HashSet::new())),
            state: RunState::Idle,
            abort: None,
            router: None,
        }
    }

    /// Apply a state-machine event and interpret its effects against this
    /// session's token and router.
    pub fn apply(&mut self, event: RunEvent) -> Vec<Effect> {
        let state = std::mem::replace(&mut self.state, RunState::Idle);
        let (next, effects) = run_state::apply(state, event);
        self.state = next;

        for effect in &effects {
            match effect {
                Effect::CreateAbortToken => {
                    self.abort = Some(AbortToken::new());
                }
                Effect::AbortRun { reject_reason } => {
                    if let Some(abort) = &self.abort {
                        abort.cancel();
                    }
                    if let Some(router) = &self.router {
                        router.reject_all(stop_reason_label(*reject_reason));
                    }
                }
            }
        }
        effects
    }

    pub fn has_pending_confirmations(&self) -> bool {
        self.router.as_ref().is_some_and(|r| r.has_pending())
    }

    /// Tear down per-run resources once a run has finished.
    pub fn clear_run_resources(&mut self) {
        self.abort = None;
        self.router = None;
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct SessionMap {
    inner: Mutex<HashMap<Uuid, SharedSession>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: Uuid) -> Option<SharedSession> {
        self.inner.lock().get(&conversation_id).cloned()
    }

    pub fn get_or_create(&self, conversation_id: Uuid, user: &str) -> SharedSession {
        self.inner
            .lock()
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(user))))
            .clone()
    }

    /// Remove and return every session (connection teardown).
    pub fn drain(&self) -> Vec<SharedSession> {
        self.inner.lock().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver control
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Step-boundary control backed by the session state machine.
pub struct SessionControl {
    pub session: SharedSession,
}

impl RunControl for SessionControl {
    fn on_step_completed(&self) -> StepDisposition {
        let mut session = self.session.lock();
        session.apply(RunEvent::StepCompleted);
        match &session.state {
            RunState::Stopped { reason, .. } => StepDisposition::Stop(*reason),
            _ => StepDisposition::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::run_state::{QueuedMessage, StopReason};

    fn queued() -> QueuedMessage {
        QueuedMessage {
            run_id: "r2".into(),
            client_message_id: "c2".into(),
            message: "next".into(),
        }
    }

    #[test]
    fn start_run_installs_abort_token() {
        let mut session = Session::new("admin@localhost");
        session.apply(RunEvent::StartRun {
            run_id: "r1".into(),
            client_message_id: "c1".into(),
        });
        assert!(session.state.is_running());
        assert!(session.abort.is_some());
    }

    #[test]
    fn hard_stop_cancels_token() {
        let mut session = Session::new("admin@localhost");
        session.apply(RunEvent::StartRun {
            run_id: "r1".into(),
            client_message_id: "c1".into(),
        });
        let token = session.abort.clone().unwrap();
        session.apply(RunEvent::HardStop {
            reason: StopReason::UserStop,
            clear_queue: true,
        });
        assert!(token.is_cancelled());
    }

    #[test]
    fn soft_interrupt_with_pending_cancels_token() {
        let mut session = Session::new("admin@localhost");
        session.apply(RunEvent::StartRun {
            run_id: "r1".into(),
            client_message_id: "c1".into(),
        });
        let token = session.abort.clone().unwrap();
        session.apply(RunEvent::SoftInterrupt {
            message: queued(),
            has_pending_confirmations: true,
        });
        assert!(token.is_cancelled());
    }

    #[test]
    fn soft_interrupt_without_pending_keeps_token_live() {
        let mut session = Session::new("admin@localhost");
        session.apply(RunEvent::StartRun {
            run_id: "r1".into(),
            client_message_id: "c1".into(),
        });
        let token = session.abort.clone().unwrap();
        session.apply(RunEvent::SoftInterrupt {
            message: queued(),
            has_pending_confirmations: false,
        });
        assert!(!token.is_cancelled());
    }

    #[test]
    fn session_control_maps_stopped_state() {
        let session = Arc::new(Mutex::new(Session::new("admin@localhost")));
        {
            let mut guard = session.lock();
            guard.apply(RunEvent::StartRun {
                run_id: "r1".into(),
                client_message_id: "c1".into(),
            });
            guard.apply(RunEvent::SoftInterrupt {
                message: queued(),
                has_pending_confirmations: false,
            });
        }
        let control = SessionControl {
            session: session.clone(),
        };
        assert_eq!(
            control.on_step_completed(),
            StepDisposition::Stop(StopReason::SoftInterrupt)
        );
    }

    #[test]
    fn session_control_continues_while_running() {
        let session = Arc::new(Mutex::new(Session::new("admin@localhost")));
        session.lock().apply(RunEvent::StartRun {
            run_id: "r1".into(),
            client_message_id: "c1".into(),
        });
        let control = SessionControl {
            session: session.clone(),
        };
        assert_eq!(control.on_step_completed(), StepDisposition::Continue);
    }

    #[test]
    fn map_reuses_sessions_per_conversation() {
        let map = SessionMap::new();
        let conversation = Uuid::new_v4();
        let a = map.get_or_create(conversation, "u");
        let b = map.get_or_create(conversation, "u");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn drain_empties_the_map() {
        let map = SessionMap::new();
        map.get_or_create(Uuid::new_v4(), "u");
        map.get_or_create(Uuid::new_v4(), "u");
        let drained = map.drain();
        assert_eq!(drained.len(), 2);
        assert!(map.is_empty());
    }
}
