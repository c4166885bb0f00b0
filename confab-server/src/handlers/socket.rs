//! WebSocket gateway: one socket per client, JSON event envelopes both ways.

use std::sync::Arc;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::models::{ClientEvent, StatusMessage, events::SERVER_MESSAGE};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    http::error::{ApiError, AppResult},
    services::{Transport, room_hub::Outbound},
};

#[derive(Debug, Default, Deserialize)]
pub struct SocketParams {
    user_id: Option<String>,
}

fn resolve_user(params: SocketParams) -> AppResult<String> {
    params
        .user_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::unauthorized("user_id query parameter is required"))
}

/// `GET /ws?user_id=..`: upgrades to the chat socket.
pub async fn ws_handler(
    Query(params): Query<SocketParams>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user_id = resolve_user(params)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let connection_id = Uuid::new_v4().to_string();
    let span = info_span!("ws_connection", connection_id = %connection_id, user_id = %user_id);

    async move {
        let mut outbound = state.hub.connect(&connection_id, &user_id).await;
        let (mut sink, mut incoming) = socket.split();
        info!("socket connected");

        let writer = tokio::spawn(
            async move {
                while let Some(frame) = outbound.recv().await {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, event = %frame.event, "failed to encode frame");
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = sink.close().await;
            }
            .in_current_span(),
        );

        while let Some(received) = incoming.next().await {
            match received {
                Ok(WsMessage::Text(text)) => {
                    dispatch_text(&state, &connection_id, &user_id, text.as_str()).await;
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, "socket read failed");
                    break;
                }
            }
        }

        state.coordinator.disconnect(&connection_id).await;
        writer.abort();
        info!("socket disconnected");
    }
    .instrument(span)
    .await;
}

/// Routes one inbound text frame. Chat turns run on their own task so the
/// reader keeps serving `abort` while a reply streams; their handle is returned.
pub(crate) async fn dispatch_text(
    state: &Arc<AppState>,
    connection_id: &str,
    user_id: &str,
    text: &str,
) -> Option<JoinHandle<()>> {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "unreadable client frame");
            let status = StatusMessage::new("", format!("invalid event: {err}"));
            state
                .hub
                .emit_to(
                    connection_id,
                    Outbound::reliable(SERVER_MESSAGE, serde_json::to_value(status).unwrap_or_default()),
                )
                .await;
            return None;
        }
    };

    match event {
        ClientEvent::ChatMessage(mut message) => {
            message.user_id = user_id.to_string();
            let coordinator = Arc::clone(&state.coordinator);
            let connection_id = connection_id.to_string();
            Some(tokio::spawn(
                async move {
                    coordinator.handle_chat_message(&connection_id, message).await;
                }
                .in_current_span(),
            ))
        }
        ClientEvent::JoinChatRoom(join) => {
            state
                .coordinator
                .join_chat_room(connection_id, &join.room_id)
                .await;
            None
        }
        ClientEvent::Abort(chat_id) => {
            state.coordinator.abort(connection_id, &chat_id).await;
            None
        }
    }
}
