use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::Identity;
use crate::connection_manager::{Registration, Session, TransportError};
use crate::error::AppError;
use crate::metrics::{
    WS_CONNECTIONS_CLOSED, WS_CONNECTIONS_OPENED, WS_CONNECTION_DURATION, WS_HANDSHAKES_REJECTED,
};
use crate::server::AppState;

use super::message::{OutboundMessage, ServerMessage};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// Without a verified identity the socket is still upgraded, then closed
/// straight away with a policy-violation status.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let identity = extract_token(&query, &headers)
        .ok_or_else(|| AppError::Auth("Missing authentication token".to_string()))
        .and_then(|token| state.identity.verify(&token));

    match identity {
        Ok(identity) => {
            tracing::info!(
                tenant_id = %identity.tenant_id,
                user_id = %identity.user_id,
                "WebSocket upgrade accepted"
            );
            ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
        }
        Err(e) => {
            WS_HANDSHAKES_REJECTED.inc();
            tracing::warn!(error = %e, "WebSocket handshake rejected");
            ws.on_upgrade(reject_socket)
        }
    }
}

/// Extract token from query parameter or Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(ref token) = query.token {
        if !token.is_empty() {
            return Some(token.clone());
        }
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

async fn reject_socket(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Utf8Bytes::from_static("authentication required"),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Run one dashboard session until either side goes away or a newer session
/// for the same user replaces it.
#[tracing::instrument(
    name = "ws.session",
    skip(socket, state, identity),
    fields(
        tenant_id = %identity.tenant_id,
        user_id = %identity.user_id,
        otel.kind = "server"
    )
)]
async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity) {
    let connection_start = std::time::Instant::now();

    let (tx, mut rx) =
        mpsc::channel::<OutboundMessage>(state.settings.websocket.channel_buffer.max(1));

    let Registration { session, replaced } =
        state
            .registry
            .connect(&identity.tenant_id, &identity.user_id, tx);

    if let Some(previous) = replaced {
        // The registry leaves the old transport open; stop its pump here.
        state.bridge.release_session(&previous).await;
        previous.close();
        tracing::info!(
            session_id = %session.id,
            replaced_session_id = %previous.id,
            "Replaced existing session"
        );
    }

    WS_CONNECTIONS_OPENED.inc();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize message");
                    continue;
                }
            };

            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let recv_state = state.clone();
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &recv_state, &recv_session).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(session_id = %session.id, "Send task completed");
        }
        _ = &mut recv_task => {
            tracing::debug!(session_id = %session.id, "Receive task completed");
        }
        _ = session.closed() => {
            tracing::debug!(session_id = %session.id, "Session closed by replacement");
        }
    }

    send_task.abort();
    recv_task.abort();

    state.bridge.release_session(&session).await;
    state.registry.remove_session(&session);

    WS_CONNECTIONS_CLOSED.inc();
    let duration = connection_start.elapsed().as_secs_f64();
    WS_CONNECTION_DURATION.observe(duration);

    tracing::info!(
        session_id = %session.id,
        duration_secs = duration,
        "WebSocket session closed"
    );
}

/// Process one inbound frame. Returns false if the session should end.
async fn process_message(msg: Message, state: &AppState, session: &Arc<Session>) -> bool {
    let reply = match msg {
        Message::Text(text) => state.bridge.handle_client_message(session, text.as_str()).await,
        Message::Binary(_) => ServerMessage::error("Binary frames are not supported"),
        Message::Ping(_) | Message::Pong(_) => return true,
        Message::Close(_) => {
            tracing::debug!(session_id = %session.id, "Client sent close frame");
            return false;
        }
    };

    match session.push(reply) {
        Ok(()) => true,
        Err(TransportError::Full) => {
            tracing::warn!(session_id = %session.id, "Outbound queue full, reply dropped");
            true
        }
        Err(TransportError::Closed) => false,
    }
}
