//! Built-in tool adapters: file reading, grep, and web fetch, each wrapping
//! otherwise-pure I/O with a confirmation gate when the target is sensitive.
//!
//! Every adapter returns `Result<serde_json::Value, ToolError>`; callers
//! reify `Failure` as tool-result text for the agent, while `Interrupted`
//! unwinds the run (the confirmation future was rejected by a stop).

pub mod fetch;
pub mod file_read;
pub mod grep;
pub mod sensitive;
pub mod shell;

use wf_domain::confirm::{
    ConfirmationRejected, Confirmer, OperationDetails,
};

/// Failure modes of a tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Ordinary failure, surfaced to the LLM as result text.
    #[error("{0}")]
    Failure(String),

    /// The run is stopping; unwind without producing a result.
    #[error(transparent)]
    Interrupted(#[from] ConfirmationRejected),
}

pub type ToolResult = std::result::Result<serde_json::Value, ToolError>;

/// Gate a hazardous operation behind the confirmation protocol.
///
/// With no confirmation context available, hazardous targets are denied
/// outright; the caller is expected to have already let non-hazardous
/// targets through without calling this.
pub(crate) async fn gate(
    confirmer: Option<&dyn Confirmer>,
    operation: &str,
    target: &str,
    details: OperationDetails,
) -> std::result::Result<(), ToolError> {
    let Some(confirmer) = confirmer else {
        return Err(ToolError::Failure(format!(
            "{operation} on {target} requires user confirmation, but no confirmation \
             context is available"
        )));
    };

    let outcome = confirmer
        .request_operation_confirmation(operation, target, details)
        .await?;

    if outcome.approved {
        Ok(())
    } else {
        Err(ToolError::Failure(
            outcome
                .denial_reason
                .unwrap_or_else(|| format!("User denied {operation} on {target}")),
        ))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use wf_domain::confirm::{
        ConfirmationOutcome, ConfirmationRejected, Confirmer, OperationDetails,
    };

    /// Records requests and answers them all the same way.
    pub struct ScriptedConfirmer {
        pub approve: bool,
        pub requests: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedConfirmer {
        pub fn approving() -> Self {
            Self {
                approve: true,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn denying() -> Self {
            Self {
                approve: false,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Confirmer for ScriptedConfirmer {
        async fn request_operation_confirmation(
            &self,
            operation: &str,
            target: &str,
            _details: OperationDetails,
        ) -> Result<ConfirmationOutcome, ConfirmationRejected> {
            self.requests
                .lock()
                .push((operation.to_owned(), target.to_owned()));
            if self.approve {
                Ok(ConfirmationOutcome::approved("yes", false))
            } else {
                Ok(ConfirmationOutcome::denied(Some(format!(
                    "User denied {operation} on {target}"
                ))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedConfirmer;
    use super::*;

    #[tokio::test]
    async fn gate_without_context_denies() {
        let err = gate(None, "read_sensitive_file", "/home/u/.ssh/id_rsa", OperationDetails::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Failure(_)));
        assert!(err.to_string().contains("confirmation"));
    }

    #[tokio::test]
    async fn gate_approved_passes() {
        let confirmer = ScriptedConfirmer::approving();
        gate(
            Some(&confirmer),
            "read_sensitive_file",
            "/home/u/.aws/credentials",
            OperationDetails::default(),
        )
        .await
        .unwrap();
        assert_eq!(confirmer.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn gate_denied_fails_with_reason() {
        let confirmer = ScriptedConfirmer::denying();
        let err = gate(
            Some(&confirmer),
            "grep_sensitive_path",
            "/home/u/.ssh",
            OperationDetails::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("denied"));
    }
}
