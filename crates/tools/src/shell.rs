//! `execute_command` adapter — run a shell command after confirmation.
//!
//! Every invocation is gated; the agent declares an access mode
//! (`read-only`, `write-only`, `read-write`) that becomes the confirmation
//! sub-type and drives the risk grading. Output is captured with a hard
//! timeout and a size cap.

use serde::Deserialize;
use serde_json::json;
use wf_domain::confirm::{Confirmer, OperationDetails};

use crate::{gate, ToolError, ToolResult};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_OUTPUT_CHARS: usize = 20_000;

#[derive(Debug, Clone, Deserialize)]
pub struct ShellRequest {
    pub command: String,
    /// Declared access mode: "read-only" | "write-only" | "read-write".
    #[serde(default)]
    pub access_mode: Option<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub async fn execute_command(req: ShellRequest, confirmer: Option<&dyn Confirmer>) -> ToolResult {
    gate(
        confirmer,
        "execute_command",
        &req.command,
        OperationDetails {
            tool_name: "execute_command".into(),
            tool_args: json!({ "command": req.command, "access_mode": req.access_mode }),
            operation_type: req.access_mode.clone(),
            message: Some(format!("The agent wants to run: {}", req.command)),
            ..Default::default()
        },
    )
    .await?;

    let mut command = tokio::process::Command::new("sh");
    command.arg("-c").arg(&req.command);
    if let Some(workdir) = &req.workdir {
        command.current_dir(workdir);
    }
    command.kill_on_drop(true);

    let timeout = std::time::Duration::from_secs(req.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ToolError::Failure(format!(
                "failed to spawn '{}': {e}",
                req.command
            )))
        }
        Err(_) => {
            return Err(ToolError::Failure(format!(
                "command '{}' timed out after {}s",
                req.command,
                timeout.as_secs()
            )))
        }
    };

    let stdout = clip(&String::from_utf8_lossy(&output.stdout));
    let stderr = clip(&String::from_utf8_lossy(&output.stderr));
    Ok(json!({
        "command": req.command,
        "exit_code": output.status.code(),
        "stdout": stdout,
        "stderr": stderr,
    }))
}

fn clip(s: &str) -> String {
    if s.chars().count() <= MAX_OUTPUT_CHARS {
        s.to_owned()
    } else {
        let clipped: String = s.chars().take(MAX_OUTPUT_CHARS).collect();
        format!("{clipped}\n[output truncated]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedConfirmer;

    #[tokio::test]
    async fn requires_confirmation() {
        let err = execute_command(
            ShellRequest {
                command: "echo hi".into(),
                access_mode: Some("read-only".into()),
                workdir: None,
                timeout_secs: None,
            },
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("confirmation"));
    }

    #[tokio::test]
    async fn denial_becomes_failure_text() {
        let confirmer = ScriptedConfirmer::denying();
        let err = execute_command(
            ShellRequest {
                command: "rm -rf /tmp/x".into(),
                access_mode: Some("read-write".into()),
                workdir: None,
                timeout_secs: None,
            },
            Some(&confirmer),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Failure(_)));
        assert!(err.to_string().contains("denied"));
    }

    #[tokio::test]
    async fn runs_after_approval() {
        let confirmer = ScriptedConfirmer::approving();
        let out = execute_command(
            ShellRequest {
                command: "echo approved-output".into(),
                access_mode: Some("read-only".into()),
                workdir: None,
                timeout_secs: None,
            },
            Some(&confirmer),
        )
        .await
        .unwrap();
        assert_eq!(out["exit_code"], 0);
        assert!(out["stdout"].as_str().unwrap().contains("approved-output"));
        assert_eq!(confirmer.requests.lock()[0].0, "execute_command");
    }

    #[tokio::test]
    async fn captures_exit_code_and_stderr() {
        let confirmer = ScriptedConfirmer::approving();
        let out = execute_command(
            ShellRequest {
                command: "echo oops >&2; exit 3".into(),
                access_mode: Some("read-only".into()),
                workdir: None,
                timeout_secs: None,
            },
            Some(&confirmer),
        )
        .await
        .unwrap();
        assert_eq!(out["exit_code"], 3);
        assert!(out["stderr"].as_str().unwrap().contains("oops"));
    }

    #[tokio::test]
    async fn times_out() {
        let confirmer = ScriptedConfirmer::approving();
        let err = execute_command(
            ShellRequest {
                command: "sleep 5".into(),
                access_mode: Some("read-only".into()),
                workdir: None,
                timeout_secs: Some(1),
            },
            Some(&confirmer),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
