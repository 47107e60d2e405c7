//! WebSocket handler for voice sessions
//!
//! Each connection gets one [`Session`]. Binary frames are audio, text
//! frames are control commands; everything the session emits is written
//! back by a dedicated writer task.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};

use super::ApiState;
use crate::audio::AudioChunk;
use crate::protocol::OutboundFrame;
use crate::session::{Outbound, Session};

/// Frames queued for one client before session writes wait
const OUTBOUND_CAPACITY: usize = 64;

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Encode a queued frame for the socket
fn encode(frame: OutboundFrame) -> Option<Message> {
    match frame {
        OutboundFrame::Message(msg) => match serde_json::to_string(&msg) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize message");
                None
            }
        },
        OutboundFrame::Audio(audio) => Some(Message::Binary(audio.into())),
    }
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();

    let (outbound, mut rx) = Outbound::channel(OUTBOUND_CAPACITY);
    let session = Session::start(state.backends.clone(), state.settings.clone(), outbound).await;
    let session_id = session.id();
    state.sessions.insert(Arc::clone(&session));

    tracing::info!(session_id = %session_id, "WebSocket connected");

    // Forward queued frames to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Some(message) = encode(frame) else {
                continue;
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Feed incoming frames to the session
    let recv_session = Arc::clone(&session);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Binary(data) => recv_session.handle_audio(AudioChunk::new(data)).await,
                Message::Text(text) => recv_session.handle_text(text.as_str()).await,
                Message::Ping(data) => {
                    // axum answers pings itself
                    tracing::trace!(len = data.len(), "received ping");
                }
                Message::Close(_) => {
                    tracing::info!(session_id = %session_id, "WebSocket closed by client");
                    break;
                }
                Message::Pong(_) => {}
            }
        }
    });

    // Wait for either side to finish, or for the server to close the session
    let root = session.root_token().clone();
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        () = root.cancelled() => {
            recv_task.abort();
            send_task.abort();
        }
    }

    session.close().await;
    state.sessions.remove(session_id);

    tracing::info!(session_id = %session_id, "WebSocket disconnected");
}
