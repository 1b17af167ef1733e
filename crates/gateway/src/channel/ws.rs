//! WebSocket endpoint for the client channel.
//!
//! Flow:
//! 1. Client connects to `/v1/ws` and the socket is split.
//! 2. A writer task drains the outbound event channel to the socket.
//! 3. The reader loop parses command frames and dispatches them through the
//!    connection; unparseable frames are logged and dropped.
//! 4. On disconnect, every session's run is aborted and pending
//!    confirmations are rejected.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::AppState;

use super::commands::Connection;
use super::frames::{ClientCommand, ServerEvent};

/// Buffered events per connection before backpressure applies.
const OUTBOUND_BUFFER: usize = 256;

/// GET /v1/ws — upgrade to the client channel.
pub async fn client_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);

    let connection = Connection::new(state, outbound_tx);
    tracing::info!("client connected");

    // Writer: the only writer of this connection's event stream, so event
    // order per conversation is preserved end to end.
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize event frame");
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Reader: dispatch command frames until the peer goes away.
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => connection.handle(command).await,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unparseable command frame");
                }
            },
            Message::Close(_) => break,
            // axum answers pings at the protocol level.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                tracing::debug!("ignoring binary frame");
            }
        }
    }

    let session_count = connection.sessions().len();
    connection.close();
    writer.abort();
    tracing::info!(sessions = session_count, "client disconnected");
}
