//! `/health` — liveness probe. Not part of the spec's core modules, but
//! carried as ambient surface the way the teacher exposes one (spec section
//! 9 ambient-stack note).

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db_ok = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = ?e, "health check: database query failed");
            false
        }
    };

    let connection_stats = state.connections.stats().await;

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if db_ok { "ok" } else { "degraded" },
            "database": db_ok,
            "connections": connection_stats.connections,
            "users": connection_stats.users,
        })),
    )
}
