//! HTTP surface: the WebSocket client channel plus a health probe. Every
//! other interaction with the core happens over the channel.

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::channel::ws::client_ws;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/ws", get(client_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
