//! Gateway (C8) — spec section 4.8.
//!
//! Owns the `/ws` upgrade path and the two periodic per-pod sweeps that keep
//! live connections honest about token expiry (I2 and the `TOKEN_EXPIRING_SOON`
//! warning). The per-connection reader/writer task split lives in
//! `handler`, mirroring the teacher's `websocket::handler` module.

pub mod handler;
pub mod protocol;

use std::time::Duration;

use axum::extract::ws::{CloseFrame, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::Deserialize;

use crate::auth::extract_ws_token;
use crate::state::AppState;

pub use protocol::close_code;

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// GET /ws?token=<jwt> — upgrade to a WebSocket connection.
///
/// A bearer `Authorization` header takes precedence over the query parameter
/// when both are present (spec section 4.1); browsers cannot attach custom
/// headers to the upgrade request, so the query parameter exists purely as a
/// fallback for that environment, not as a parallel credential path.
///
/// Token verification happens *after* the upgrade, not here: spec section
/// 4.8 requires a failure to be reported as a WebSocket close code (`4001`
/// invalid, `4002` expired), which only exists once the socket is open.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    header_token: Option<TypedHeader<Authorization<Bearer>>>,
    State(state): State<AppState>,
) -> Response {
    let header_token = header_token.map(|TypedHeader(Authorization(bearer))| bearer.token().to_string());
    let token = extract_ws_token(params.token.as_deref(), header_token.as_deref());

    ws.on_upgrade(move |socket| handler::run_connection(socket, token, state))
}

/// Close-frame helper shared by the expiry sweeps and the per-connection
/// reader loop — every forced close in this module goes through one of the
/// codes in `protocol::close_code`.
pub(crate) fn close_frame(code: u16, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: reason.into(),
    }
}

/// Background task: closes any connection whose token has expired (I2) and
/// warns connections approaching expiry with `TOKEN_EXPIRING_SOON`. Runs
/// independently per pod — there is nothing cross-pod about token expiry,
/// unlike subscription staleness.
pub async fn run_expiry_sweep(state: AppState, cancel: tokio_util::sync::CancellationToken) {
    let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }

        let now = chrono::Utc::now();

        for (conn_id, expiry) in state
            .connections
            .connections_expiring_within(now, state.token_expiry_warning)
            .await
        {
            let remaining = expiry - now.timestamp();
            state
                .connections
                .send(
                    conn_id,
                    &protocol::ServerFrame::TokenExpiringSoon {
                        payload: protocol::TokenExpiringSoonPayload {
                            expires_in: remaining,
                        },
                    },
                )
                .await;
        }

        for conn_id in state.connections.expired_connections(now).await {
            state
                .connections
                .request_close(conn_id, close_code::EXPIRED_TOKEN)
                .await;
            tracing::debug!(connection_id = %conn_id, "requested close for connection with expired token");
        }
    }
}
