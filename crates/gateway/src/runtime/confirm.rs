//! The interactive confirmation gate.
//!
//! One [`ConfirmationRouter`] exists per run. Requests are multiplexed by
//! `request_id` over oneshot futures; session-level preferences short-circuit
//! repeat questions, and a `yes_dont_ask` answer fans out to every in-flight
//! request with the same confirmation key before the response returns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use wf_domain::confirm::{
    build_request, option_id, ConfirmationOutcome, ConfirmationRejected, ConfirmationRequest,
    ConfirmationResponse, Confirmer, OperationDetails,
};

use super::DriverEvent;

/// Session-scoped auto-approval keys (`op` or `op:subtype`).
pub type ConfirmationPreferences = Arc<Mutex<HashSet<String>>>;

enum Resolution {
    Answered(ConfirmationOutcome),
    Rejected(String),
}

struct PendingRequest {
    key: String,
    respond: oneshot::Sender<Resolution>,
}

pub struct ConfirmationRouter {
    run_id: String,
    preferences: ConfirmationPreferences,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    events: mpsc::Sender<DriverEvent>,
}

impl ConfirmationRouter {
    pub fn new(
        run_id: String,
        preferences: ConfirmationPreferences,
        events: mpsc::Sender<DriverEvent>,
    ) -> Self {
        Self {
            run_id,
            preferences,
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Route a client's answer to the waiting request. A `yes_dont_ask`
    /// answer also records the preference and resolves every other pending
    /// request with the same key, atomically with respect to new arrivals.
    /// Returns false when the request id is unknown (already resolved).
    pub fn resolve(&self, response: &ConfirmationResponse) -> bool {
        let outcome = ConfirmationOutcome::from_response(response);

        let (target, fanned_out) = {
            let mut pending = self.pending.lock();
            let Some(target) = pending.remove(&response.request_id) else {
                return false;
            };

            let mut same_key = Vec::new();
            if outcome.skip_future_confirmations {
                self.preferences.lock().insert(target.key.clone());
                let ids: Vec<Uuid> = pending
                    .iter()
                    .filter(|(_, entry)| entry.key == target.key)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    if let Some(entry) = pending.remove(&id) {
                        same_key.push(entry);
                    }
                }
            }
            (target, same_key)
        };

        let _ = target.respond.send(Resolution::Answered(outcome));
        for entry in fanned_out {
            let _ = entry.respond.send(Resolution::Answered(
                ConfirmationOutcome::approved(option_id::YES_DONT_ASK, true),
            ));
        }
        true
    }

    /// Reject every pending request; used by stop and by the
    /// soft-interrupt-with-pending escalation.
    pub fn reject_all(&self, reason: &str) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.respond.send(Resolution::Rejected(reason.to_owned()));
        }
    }
}

#[async_trait]
impl Confirmer for ConfirmationRouter {
    async fn request_operation_confirmation(
        &self,
        operation: &str,
        target: &str,
        details: OperationDetails,
    ) -> Result<ConfirmationOutcome, ConfirmationRejected> {
        let request = build_request(operation, target, &details, 0);
        let key = request.key();

        if self.preferences.lock().contains(&key) {
            return Ok(ConfirmationOutcome::approved(option_id::YES_DONT_ASK, true));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            request.request_id,
            PendingRequest {
                key,
                respond: tx,
            },
        );

        let _ = self
            .events
            .send(DriverEvent::ConfirmationRequest {
                run_id: self.run_id.clone(),
                request: request.clone(),
            })
            .await;

        // The interactive gate never times out; rejection comes only from
        // stop or soft-interrupt escalation.
        match rx.await {
            Ok(Resolution::Answered(outcome)) => Ok(outcome),
            Ok(Resolution::Rejected(reason)) => Err(ConfirmationRejected { reason }),
            Err(_) => Err(ConfirmationRejected {
                reason: "confirmation router dropped".into(),
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
    use chrono::Utc;

    fn router() -> (Arc<ConfirmationRouter>, mpsc::Receiver<DriverEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let router = Arc::new(ConfirmationRouter::new(
            "r1".into(),
            Arc::new(Mutex::new(HashSet::new())),
            tx,
        ));
        (router, rx)
    }

    async fn next_request(rx: &mut mpsc::Receiver<DriverEvent>) -> ConfirmationRequest {
        match rx.recv().await {
            Some(DriverEvent::ConfirmationRequest { request, .. }) => request,
            other => panic!("expected a confirmation request event, got {other:?}"),
        }
    }

    fn answer(request_id: Uuid, option: &str) -> ConfirmationResponse {
        ConfirmationResponse {
            request_id,
            selected_option_id: option.into(),
            guidance: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn approve_roundtrip() {
        let (router, mut rx) = router();
        let waiter = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .request_operation_confirmation(
                        "write_file",
                        "/tmp/out.txt",
                        OperationDetails::default(),
                    )
                    .await
            })
        };

        let request = next_request(&mut rx).await;
        assert_eq!(request.operation, "write_file");
        assert!(router.has_pending());

        assert!(router.resolve(&answer(request.request_id, option_id::YES)));
        let outcome = waiter.await.unwrap().unwrap();
        assert!(outcome.approved);
        assert!(!router.has_pending());
    }

    #[tokio::test]
    async fn denial_carries_reason() {
        let (router, mut rx) = router();
        let waiter = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .request_operation_confirmation(
                        "delete_file",
                        "/tmp/x",
                        OperationDetails::default(),
                    )
                    .await
            })
        };
        let request = next_request(&mut rx).await;
        assert!(router.resolve(&answer(request.request_id, option_id::NO)));
        let outcome = waiter.await.unwrap().unwrap();
        assert!(!outcome.approved);
        assert!(outcome.denial_reason.is_some());
    }

    #[tokio::test]
    async fn guidance_is_soft_denial_with_text() {
        let (router, mut rx) = router();
        let waiter = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .request_operation_confirmation(
                        "execute_command",
                        "rm -rf build",
                        OperationDetails {
                            operation_type: Some("read-write".into()),
                            ..Default::default()
                        },
                    )
                    .await
            })
        };
        let request = next_request(&mut rx).await;
        let mut response = answer(request.request_id, option_id::GUIDANCE);
        response.guidance = Some("clean only the target directory".into());
        router.resolve(&response);
        let outcome = waiter.await.unwrap().unwrap();
        assert!(!outcome.approved);
        assert!(outcome
            .denial_reason
            .as_deref()
            .unwrap()
            .contains("target directory"));
    }

    #[tokio::test]
    async fn preference_short_circuits_prompt() {
        let (router, mut rx) = router();
        router
            .preferences
            .lock()
            .insert("execute_command:read-only".into());

        let outcome = router
            .request_operation_confirmation(
                "execute_command",
                "ls",
                OperationDetails {
                    operation_type: Some("read-only".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.approved);
        // No prompt was emitted.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn yes_dont_ask_fans_out_to_same_key() {
        let (router, mut rx) = router();
        let spawn_request = |router: Arc<ConfirmationRouter>| {
            tokio::spawn(async move {
                router
                    .request_operation_confirmation(
                        "execute_command",
                        "git status",
                        OperationDetails {
                            operation_type: Some("read-only".into()),
                            ..Default::default()
                        },
                    )
                    .await
            })
        };

        let w1 = spawn_request(router.clone());
        let w2 = spawn_request(router.clone());
        let w3 = spawn_request(router.clone());

        let first = next_request(&mut rx).await;
        let _second = next_request(&mut rx).await;
        let _third = next_request(&mut rx).await;
        assert_eq!(router.pending_count(), 3);

        router.resolve(&answer(first.request_id, option_id::YES_DONT_ASK));

        for waiter in [w1, w2, w3] {
            let outcome = waiter.await.unwrap().unwrap();
            assert!(outcome.approved);
            assert!(outcome.skip_future_confirmations);
        }
        assert_eq!(router.pending_count(), 0);
        assert!(router
            .preferences
            .lock()
            .contains("execute_command:read-only"));
    }

    #[tokio::test]
    async fn fan_out_spares_other_keys() {
        let (router, mut rx) = router();
        let read_only = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .request_operation_confirmation(
                        "execute_command",
                        "ls",
                        OperationDetails {
                            operation_type: Some("read-only".into()),
                            ..Default::default()
                        },
                    )
                    .await
            })
        };
        let write = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .request_operation_confirmation(
                        "execute_command",
                        "tee out",
                        OperationDetails {
                            operation_type: Some("write-only".into()),
                            ..Default::default()
                        },
                    )
                    .await
            })
        };

        let first = next_request(&mut rx).await;
        let second = next_request(&mut rx).await;
        let (ro_request, wo_request) = if first.context.operation_type.as_deref() == Some("read-only")
        {
            (first, second)
        } else {
            (second, first)
        };

        router.resolve(&answer(ro_request.request_id, option_id::YES_DONT_ASK));
        let ro = read_only.await.unwrap().unwrap();
        assert!(ro.approved);

        // The write-only request is still waiting for its own answer.
        assert_eq!(router.pending_count(), 1);
        router.resolve(&answer(wo_request.request_id, option_id::NO));
        let wo = write.await.unwrap().unwrap();
        assert!(!wo.approved);
    }

    #[tokio::test]
    async fn reject_all_unblocks_every_waiter() {
        let (router, mut rx) = router();
        let w1 = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .request_operation_confirmation("write_file", "/a", OperationDetails::default())
                    .await
            })
        };
        let w2 = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .request_operation_confirmation("delete_file", "/b", OperationDetails::default())
                    .await
            })
        };
        next_request(&mut rx).await;
        next_request(&mut rx).await;

        router.reject_all("user_stop");

        for waiter in [w1, w2] {
            let err = waiter.await.unwrap().unwrap_err();
            assert_eq!(err.reason, "user_stop");
        }
        assert!(!router.has_pending());
    }

    #[tokio::test]
    async fn resolve_unknown_request_is_false() {
        let (router, _rx) = router();
        assert!(!router.resolve(&answer(Uuid::new_v4(), option_id::YES)));
    }
}
