//! The per-conversation WebSocket.
//!
//! Subscribes to the notification bus, resolves reference notifications to
//! sanitized messages by re-reading the row, and forwards ephemeral payloads
//! as-is. Dropping the subscription on disconnect starts the miss-buffer
//! window for this (user, conversation).

use axum::extract::ws::{
    CloseFrame,
    Message,
    WebSocket,
    WebSocketUpgrade,
};
use axum::extract::{
    Path,
    Query,
    State,
};
use axum::response::Response;
use model::store;
use notifications::NotificationPayload;
use serde::Deserialize;

use crate::auth::{
    auth_mode,
    UserContext,
};
use crate::AppState;

const CLOSE_UNAUTHENTICATED: u16 = 4401;
const CLOSE_FORBIDDEN: u16 = 4403;

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

pub async fn conversation_updates(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(conversation_id): Path<i32>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        run_socket(state, socket, conversation_id, query.token).await;
    })
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn run_socket(
    state: AppState,
    socket: WebSocket,
    conversation_id: i32,
    token: Option<String>,
) {
    // In edit mode no token is required for WebSocket connections.
    if token.is_none() && auth_mode() != "edit" {
        return close_with(socket, CLOSE_UNAUTHENTICATED, "No token").await;
    }
    let user = match UserContext::from_token(token.as_deref()) {
        Ok(user) => user,
        Err(_) => return close_with(socket, CLOSE_UNAUTHENTICATED, "No token").await,
    };

    // The socket only streams conversations its user owns.
    let authorized = {
        let conn = match state.deps.app_pool.acquire("ws_authorize").await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("ws authorization failed: {e:#}");
                return close_with(socket, CLOSE_FORBIDDEN, "Unauthorized").await;
            },
        };
        store::get_conversation(&conn, conversation_id, user.user_id)
            .await
            .ok()
            .flatten()
            .is_some()
    };
    if !authorized {
        return close_with(socket, CLOSE_FORBIDDEN, "Unauthorized").await;
    }

    let mut socket = socket;
    let mut subscription = state.deps.bus.subscribe(user.user_id, conversation_id);
    loop {
        tokio::select! {
            payload = subscription.recv() => {
                let Some(payload) = payload else { break };
                match forward_payload(&state, &mut socket, conversation_id, payload).await {
                    Ok(true) => {},
                    Ok(false) | Err(_) => break,
                }
            },
            message = socket.recv() => {
                match message {
                    // Inbound frames are ignored; the socket is send-only.
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {},
                    Some(Err(_)) => break,
                }
            },
        }
    }
    // subscription drops here, starting the replay window.
}

/// Sends one payload to the socket. Returns Ok(false) when the socket is
/// gone.
async fn forward_payload(
    state: &AppState,
    socket: &mut WebSocket,
    conversation_id: i32,
    payload: NotificationPayload,
) -> anyhow::Result<bool> {
    let json = match payload {
        // Ephemeral payloads go out directly, no DB lookup.
        NotificationPayload::Ephemeral(_) | NotificationPayload::EphemeralError(_) => {
            payload.to_json()
        },
        NotificationPayload::Reference(reference) => {
            let conn = state.deps.app_pool.acquire("ws_resolve_reference").await?;
            let Some(stored) = store::get_message(&conn, reference.id, conversation_id).await?
            else {
                return Ok(true);
            };
            // System messages carry internal context and never reach
            // clients.
            let Some(sanitized) = stored.sanitize() else {
                return Ok(true);
            };
            serde_json::to_value(&sanitized)?
        },
    };
    Ok(socket
        .send(Message::Text(json.to_string().into()))
        .await
        .is_ok())
}
