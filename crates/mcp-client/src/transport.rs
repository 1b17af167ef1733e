//! MCP transports.
//!
//! - **Stdio**: spawn a child process and exchange newline-delimited
//!   JSON-RPC over its stdin/stdout. A background reader task correlates
//!   responses to callers by request id, so notifications interleaved by the
//!   server never confuse a pending call.
//! - **Streamable HTTP**: POST each request to the server endpoint,
//!   accepting either a JSON body or an SSE stream carrying the response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};

use crate::launcher::LaunchPlan;
use crate::protocol::{Notification, Request, Response};

/// Per-request response deadline.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Grace period for a child to exit after stdin closes.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);
/// Abandon a server whose stdout is mostly non-JSON noise.
const MAX_NOISE_LINES: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON framing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("timed out waiting for MCP response")]
    Timeout,
}

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Response, TransportError>;

    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    async fn shutdown(&self);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type PendingMap = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn the server process and start the stdout reader task.
    pub fn spawn(
        plan: &LaunchPlan,
        env: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut command = tokio::process::Command::new(&plan.program);
        command
            .args(&plan.args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "child stdin unavailable",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "child stdout unavailable",
            ))
        })?;

        let pending: PendingMap = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // Stderr is logged, never parsed.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(line = %line, "mcp server stderr");
                }
            });
        }

        // Reader task: route responses to waiting callers by id.
        {
            let pending = pending.clone();
            let alive = alive.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut noise = 0usize;
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            if !trimmed.starts_with('{') {
                                noise += 1;
                                if noise >= MAX_NOISE_LINES {
                                    tracing::warn!(
                                        "mcp server stdout is mostly non-JSON, abandoning"
                                    );
                                    break;
                                }
                                continue;
                            }
                            match serde_json::from_str::<Response>(trimmed) {
                                Ok(response) => {
                                    if let Some(tx) = pending.lock().remove(&response.id) {
                                        let _ = tx.send(response);
                                    } else {
                                        tracing::debug!(
                                            id = response.id,
                                            "mcp response without a waiting caller"
                                        );
                                    }
                                }
                                // Server-initiated notifications have no id
                                // and are ignored by this client.
                                Err(_) => {
                                    tracing::debug!(line = %trimmed, "skipping mcp frame");
                                }
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                alive.store(false, Ordering::SeqCst);
                // Wake every waiter with a dropped sender.
                pending.lock().clear();
            });
        }

        Ok(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            alive,
        })
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Response, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = serde_json::to_string(&Request::new(id, method, params))?;
        if let Err(e) = self.write_line(&frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the reader task saw EOF.
            Ok(Err(_)) => Err(TransportError::ProcessExited),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let frame = serde_json::to_string(&Notification::new(method))?;
        self.write_line(&frame).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(?status, "mcp server exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "waiting for mcp server failed"),
            Err(_) => {
                tracing::warn!("mcp server did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streamable HTTP
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    bearer: Option<String>,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(endpoint: String, bearer: Option<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            bearer,
            next_id: AtomicU64::new(1),
        })
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json, text/event-stream")
            .json(body);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }
}

/// Pull JSON-RPC responses out of an SSE body: every `data:` line is a frame.
fn parse_sse_responses(body: &str) -> Vec<Response> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|payload| serde_json::from_str::<Response>(payload.trim()).ok())
        .collect()
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Response, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, method, params);
        let response = self.post(&request).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!(
                "{} returned {status}",
                self.endpoint
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if content_type.contains("text/event-stream") {
            parse_sse_responses(&body)
                .into_iter()
                .find(|r| r.id == id)
                .ok_or(TransportError::Timeout)
        } else {
            Ok(serde_json::from_str(&body)?)
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notification = Notification::new(method);
        let response = self.post(&notification).await?;
        if response.status().is_success() || response.status().as_u16() == 202 {
            Ok(())
        } else {
            Err(TransportError::Http(format!(
                "{} returned {} for notification",
                self.endpoint,
                response.status()
            )))
        }
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn shutdown(&self) {}
}
