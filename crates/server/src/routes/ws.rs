// crates/server/src/routes/ws.rs
//! Realtime channel.
//!
//! - `WS /ws` -- JSON events `{"event": "<name>", "data": {...}}`
//!
//! Client events on one connection are handled in arrival order by a
//! dedicated task, so a `message` can never overtake the `join` before it.
//! Everything the server sends (direct replies and room broadcasts) goes
//! through the connection's unbounded queue and is written by the socket
//! loop.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use claude_web_core::{ClientEvent, Engine, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Protocol-level ping interval; detects half-open connections.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Removes the connection from every room when the socket task ends,
/// including on panic or cancellation.
struct ConnectionGuard {
    connection_id: String,
    engine: Arc<Engine>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let engine = self.engine.clone();
        let connection_id = std::mem::take(&mut self.connection_id);
        tokio::spawn(async move {
            engine.disconnect(&connection_id).await;
        });
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.engine.connect(&connection_id, out_tx.clone());
    let _guard = ConnectionGuard {
        connection_id: connection_id.clone(),
        engine: state.engine.clone(),
    };
    info!(connection_id = %connection_id, "realtime client connected");

    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<String>();
    let dispatcher = tokio::spawn({
        let state = state.clone();
        let connection_id = connection_id.clone();
        async move {
            while let Some(text) = in_rx.recv().await {
                dispatch(&state, &connection_id, &text, &out_tx).await;
            }
        }
    });

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // Skip the immediate first tick.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(event) = outgoing else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(text.as_str().to_string()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "socket error");
                        break;
                    }
                    // Pong replies are sent by axum; binary frames are not part of the protocol.
                    Some(Ok(_)) => {}
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    dispatcher.abort();
    info!(connection_id = %connection_id, "realtime client disconnected");
}

/// Handle one client frame. Failures become a single `error` event.
async fn dispatch(
    state: &AppState,
    connection_id: &str,
    text: &str,
    reply: &mpsc::UnboundedSender<ServerEvent>,
) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(connection_id = %connection_id, error = %e, "malformed event");
            let _ = reply.send(ServerEvent::error("Malformed event"));
            return;
        }
    };

    let principal = match state.verifier.verify(event.token()) {
        Ok(principal) => principal,
        Err(e) => {
            warn!(connection_id = %connection_id, event = event.name(), error = %e, "rejected token");
            let _ = reply.send(ServerEvent::error("Invalid token"));
            return;
        }
    };

    let engine = &state.engine;
    let name = event.name();
    let result = match event {
        ClientEvent::Join { session_id, .. } => engine
            .join_user(connection_id, &session_id, &principal.user_id)
            .await
            .map(Some),
        ClientEvent::Message {
            session_id,
            message,
            ..
        } => engine
            .send_user_input(&session_id, &message)
            .await
            .map(|()| None),
        ClientEvent::JoinProject { project_id, .. } => engine
            .join_project(connection_id, &project_id, &principal.user_id)
            .await
            .map(Some),
        ClientEvent::ProjectMessage {
            project_id,
            message,
            ..
        } => engine
            .send_project_input(&project_id, &message)
            .await
            .map(|()| None),
    };

    match result {
        Ok(Some(response)) => {
            let _ = reply.send(response);
        }
        Ok(None) => {}
        Err(e) => {
            warn!(connection_id = %connection_id, event = name, error = %e, "event failed");
            let _ = reply.send(ServerEvent::error(e.client_message()));
        }
    }
}
