use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error kinds surfaced across the small HTTP surface this service exposes
/// (the `/ws` upgrade rejection path and `/health`). Background components
/// (C5 listener, C6 poller, C7 fan-out) never produce an `AppError` — they
/// have no HTTP response to return — and instead log through `tracing`
/// directly.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Bearer token failed signature or shape verification. Collapsed to a
    /// single opaque kind at every HTTP-facing boundary — callers never
    /// learn *why* a token was rejected, only that it was.
    #[error("Invalid token")]
    InvalidToken,

    /// Token signature and shape checked out but `exp` has passed. Kept
    /// distinct from `InvalidToken` because the gateway close path needs
    /// it (`4002` vs `4001`); expiry is a plaintext claim, so exposing it
    /// leaks nothing a holder of the token didn't already know.
    #[error("Expired token")]
    ExpiredToken,

    #[error("Validation error: {0}")]
    Validation(String),

    /// A database call exceeded its deadline (spec section 5: "every
    /// database call carries a deadline, default 5s"). Distinct from
    /// `Database` so callers can tell a slow backend apart from one that
    /// actively returned an error.
    #[error("Database call timed out")]
    Timeout,

    #[error("Internal server error")]
    Internal,
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message): (StatusCode, String) = match self {
            AppError::Database(e) => {
                tracing::error!(error = ?e, "database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".into())
            }
            AppError::InvalidToken | AppError::ExpiredToken => {
                (StatusCode::UNAUTHORIZED, "Invalid or expired token".into())
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Timeout => {
                tracing::warn!("database call exceeded its deadline");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Database call timed out".into(),
                )
            }
            AppError::Internal => {
                tracing::error!("internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn invalid_token_returns_401() {
        let response = AppError::InvalidToken.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn validation_error_returns_400() {
        let response = AppError::Validation("bad request".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn internal_error_returns_500() {
        let response = AppError::Internal.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn invalid_token_body_has_error_key() {
        let response = AppError::InvalidToken.into_response();
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "Invalid or expired token");
    }
}
