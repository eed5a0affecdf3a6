//! Read-only snapshot API for an external presentation layer.
//!
//! `GET /snapshot` returns the current snapshot as JSON. `/ws` upgrades to a
//! WebSocket that answers each `get_snapshot` text message with the same
//! JSON. With a token configured, both require `?token=<token>`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::stream::StreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::state::SharedStore;

#[derive(Clone)]
pub struct ApiState {
    store: SharedStore,
    token: Option<Arc<str>>,
}

impl ApiState {
    fn authorized(&self, q: &HashMap<String, String>) -> bool {
        match self.token.as_deref() {
            Some(expected) => q.get("token").is_some_and(|t| t == expected),
            None => true,
        }
    }
}

pub fn router(store: SharedStore, token: Option<String>) -> Router {
    Router::new()
        .route("/snapshot", get(snapshot_handler))
        .route("/ws", get(ws_handler))
        .with_state(ApiState {
            store,
            token: token.map(Arc::from),
        })
}

/// Serve until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    store: SharedStore,
    token: Option<String>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "snapshot API listening");
    }
    axum::serve(listener, router(store, token))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn snapshot_handler(State(state): State<ApiState>, Query(q): Query<HashMap<String, String>>) -> Response {
    if !state.authorized(&q) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(state.store.read()).into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if !state.authorized(&q) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    debug!("snapshot client connected");
    while let Some(Ok(msg)) = socket.next().await {
        match msg {
            Message::Text(text) if text == "get_snapshot" => {
                let Ok(js) = serde_json::to_string(&state.store.read()) else {
                    continue;
                };
                if socket.send(Message::Text(js)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    debug!("snapshot client disconnected");
}
