//! WebSocket route for the interaction protocol

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::ApiState;
use super::gateway::{Inbound, Outbound};

/// How long queued events may take to flush after the gateway finishes
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Query parameters for the interaction socket
#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/interaction/{session_id}", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, query.token))
}

/// Bridge a socket to the protocol gateway
async fn handle_socket(
    socket: WebSocket,
    state: Arc<ApiState>,
    session_id: String,
    token: Option<String>,
) {
    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Event(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let inbound = receiver.filter_map(|msg| async move {
        match msg {
            Ok(Message::Binary(bytes)) => Some(Inbound::Audio(bytes.to_vec())),
            Ok(Message::Text(text)) => Some(Inbound::Control(text.to_string())),
            Ok(Message::Close(_)) => Some(Inbound::Close),
            Ok(Message::Ping(_) | Message::Pong(_)) => None,
            Err(e) => {
                tracing::debug!(error = %e, "websocket receive failed");
                Some(Inbound::Close)
            }
        }
    });

    state
        .gateway
        .serve(&session_id, token.as_deref(), inbound, tx)
        .await;

    // the gateway dropped its sender; let queued events drain
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
}
