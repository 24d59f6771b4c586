//! Per-connection lifecycle — spec sections 4.1, 4.2, 4.8.
//!
//! Mirrors the teacher's `websocket::handler::handle_socket` reader/writer
//! task split: one task drains the outbound mpsc channel into the socket,
//! the other drains inbound client frames and drives the subscription
//! protocol. The two tasks race each other; whichever exits first causes the
//! other to be aborted and the connection torn down.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::gateway::protocol::{close_code, ClientFrame, ServerFrame};
use crate::state::AppState;

/// Client is dropped if it sends nothing (not even a PING) for three
/// consecutive intervals of this length (spec section 4.8 heartbeat
/// timeout).
const SILENCE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_INTERVALS: u32 = 3;

/// Entry point from `gateway::upgrade`. Token verification happens here,
/// after the upgrade has already completed, so a failure can be reported as
/// a WebSocket close code (spec section 4.8) rather than an HTTP rejection.
pub async fn run_connection(mut socket: WebSocket, token: Option<String>, state: AppState) {
    let Some(token) = token else {
        close_immediately(socket, close_code::INVALID_TOKEN, "missing token").await;
        return;
    };

    let principal = match crate::auth::verify_token(&token, &state.jwt_secret) {
        Ok(p) => p,
        Err(crate::error::AppError::ExpiredToken) => {
            close_immediately(socket, close_code::EXPIRED_TOKEN, "expired token").await;
            return;
        }
        Err(_) => {
            close_immediately(socket, close_code::INVALID_TOKEN, "invalid token").await;
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let (connection_id, mut close_rx) = state
        .connections
        .connect(principal.user_id, tx, principal.expiry_unix_seconds)
        .await;

    tracing::debug!(
        connection_id = %connection_id,
        user_id = %principal.user_id,
        "gateway connection established"
    );

    let send_state = state.clone();
    let write_deadline = state.socket_write_deadline;
    let mut send_task = tokio::spawn(async move {
        let close = loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break close_code::NORMAL };
                    let len = msg.len();
                    // spec section 5: a socket write is bounded by a fixed
                    // deadline or the queued-bytes cap, whichever trips
                    // first; a write that hangs past the deadline gets the
                    // same 1011 close as a backpressure trip.
                    match tokio::time::timeout(write_deadline, ws_sender.send(Message::Text(msg))).await {
                        Ok(Ok(())) => {
                            send_state.connections.ack_sent(connection_id, len).await;
                        }
                        Ok(Err(_)) => break close_code::NORMAL,
                        Err(_) => {
                            tracing::debug!(connection_id = %connection_id, "socket write exceeded its deadline");
                            break close_code::INTERNAL_ERROR;
                        }
                    }
                }
                Ok(()) = close_rx.changed() => {
                    if let Some(signal) = *close_rx.borrow() {
                        break signal.code;
                    }
                }
            }
        };
        let reason = if close == close_code::NORMAL { "closing" } else { "forced close" };
        // Best-effort; ignore errors or timeouts closing an already-dead peer.
        let _ = tokio::time::timeout(
            write_deadline,
            ws_sender.send(Message::Close(Some(super::close_frame(close, reason)))),
        )
        .await;
    });

    let recv_state = state.clone();
    let recv_conn_id = connection_id;
    let recv_user_id = principal.user_id;
    let mut recv_task = tokio::spawn(async move {
        let mut missed_intervals: u32 = 0;
        let mut close_requested = false;
        let mut ticker = tokio::time::interval(SILENCE_CHECK_INTERVAL);
        ticker.tick().await; // first tick fires immediately; consume it

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            missed_intervals = 0;
                            handle_client_frame(&recv_state, recv_conn_id, recv_user_id, &text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            missed_intervals = 0;
                        }
                        Some(Err(e)) => {
                            tracing::debug!(connection_id = %recv_conn_id, error = ?e, "websocket receive error");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    missed_intervals += 1;
                    if missed_intervals >= MAX_MISSED_INTERVALS && !close_requested {
                        tracing::debug!(connection_id = %recv_conn_id, "closing idle connection (heartbeat timeout)");
                        close_requested = true;
                        recv_state.connections.request_close(recv_conn_id, close_code::NORMAL).await;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.connections.disconnect(connection_id).await;
    if let Err(e) = state.subscriptions.cleanup_connection(connection_id).await {
        tracing::warn!(error = ?e, connection_id = %connection_id, "failed to clean up subscriptions on disconnect");
    }
}

/// Sends a close frame on a socket that never made it into the Connection
/// Manager (auth rejected before registration), then drops it.
async fn close_immediately(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(super::close_frame(code, reason))))
        .await;
}

async fn handle_client_frame(state: &AppState, connection_id: uuid::Uuid, user_id: uuid::Uuid, text: &str) {
    let frame = match ClientFrame::parse(text) {
        Ok(f) => f,
        Err(e) => {
            // spec section 7: a ProtocolError sends ERROR and closes.
            state
                .connections
                .send(connection_id, &ServerFrame::error(e.0))
                .await;
            state
                .connections
                .request_close(connection_id, close_code::PROTOCOL_ERROR)
                .await;
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe { payload } => {
            match state
                .subscriptions
                .subscribe(user_id, connection_id, &payload.entity_code, &payload.entity_ids)
                .await
            {
                Ok(count) => {
                    state
                        .connections
                        .send(
                            connection_id,
                            &ServerFrame::Subscribed {
                                payload: crate::gateway::protocol::SubscribedPayload { count },
                            },
                        )
                        .await;
                }
                Err(e) => {
                    tracing::warn!(error = ?e, connection_id = %connection_id, "subscribe failed");
                    state
                        .connections
                        .send(connection_id, &ServerFrame::error("subscribe failed"))
                        .await;
                }
            }
        }
        ClientFrame::Unsubscribe { payload } => {
            if let Err(e) = state
                .subscriptions
                .unsubscribe(user_id, &payload.entity_code, payload.entity_ids.as_deref())
                .await
            {
                tracing::warn!(error = ?e, connection_id = %connection_id, "unsubscribe failed");
            }
        }
        ClientFrame::UnsubscribeAll => {
            if let Err(e) = state.subscriptions.unsubscribe_all(user_id).await {
                tracing::warn!(error = ?e, connection_id = %connection_id, "unsubscribe_all failed");
            }
        }
        ClientFrame::TokenRefresh { payload } => {
            match crate::auth::verify_token(&payload.token, &state.jwt_secret) {
                Ok(new_principal) if new_principal.user_id == user_id => {
                    state
                        .connections
                        .update_token_expiry(connection_id, new_principal.expiry_unix_seconds)
                        .await;
                }
                _ => {
                    state
                        .connections
                        .send(connection_id, &ServerFrame::error("invalid refresh token"))
                        .await;
                }
            }
        }
        ClientFrame::Ping => {
            state.connections.send(connection_id, &ServerFrame::Pong).await;
        }
    }
}
