use axum::{async_trait, extract::FromRequestParts, http::request::Parts, http::StatusCode};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use jsonwebtoken::{decode, errors::ErrorKind, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Token Verifier (C1)
// ============================================================================

/// Claims carried by the bearer token this service verifies. Token
/// *issuance* lives in the out-of-scope HTTP API (spec section 1) — this
/// module only ever decodes and validates.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// The principal and expiry recovered from a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    pub expiry_unix_seconds: i64,
}

/// Decode and validate a bearer token against the process-wide signing
/// secret. Every HTTP-facing caller collapses the result to a single opaque
/// "invalid" outcome per spec section 4.1 — bad signature, malformed shape,
/// and expiry are indistinguishable there. The one exception is the gateway
/// close path (spec section 4.8), which needs `4001` vs `4002`; `exp` is a
/// plaintext claim, not a secret, so surfacing that one reason through the
/// typed error costs nothing an attacker could exploit.
pub fn verify_token(token: &str, secret: &str) -> Result<Principal, AppError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AppError::ExpiredToken,
        _ => AppError::InvalidToken,
    })?;

    let claims = data.claims;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AppError::InvalidToken)?;

    Ok(Principal {
        user_id,
        expiry_unix_seconds: claims.exp,
    })
}

// ============================================================================
// Extracting a bearer token from connection-initiation metadata
// ============================================================================

/// Extracts a bearer token from either the `Authorization: Bearer` header or
/// (since WebSocket upgrades are plain GETs that browsers cannot attach
/// custom headers to) a `token` query parameter — spec section 6. The header
/// wins when both are present.
pub fn extract_ws_token(query_token: Option<&str>, header_token: Option<&str>) -> Option<String> {
    header_token
        .map(ToOwned::to_owned)
        .or_else(|| query_token.map(ToOwned::to_owned))
}

/// Authenticated principal extracted from a valid bearer token on an
/// ordinary (non-WebSocket) HTTP request. This crate exposes no protected
/// REST endpoints of its own; the extractor exists for parity with the
/// corpus this is grounded on and is available to any future HTTP surface.
pub struct AuthUser(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, StatusCode> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| StatusCode::UNAUTHORIZED)?;

        verify_token(bearer.token(), &state.jwt_secret)
            .map(AuthUser)
            .map_err(|_| StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const TEST_SECRET: &str = "test-secret-min-32-characters-long!!";

    fn token_with_exp(user_id: Uuid, exp: i64) -> String {
        let claims = Claims {
            sub: user_id.to_string(),
            exp,
            iat: Utc::now().timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verify_token_accepts_fresh_token() {
        let user_id = Uuid::new_v4();
        let token = token_with_exp(user_id, Utc::now().timestamp() + 900);

        let principal = verify_token(&token, TEST_SECRET).expect("token should verify");
        assert_eq!(principal.user_id, user_id);
    }

    #[test]
    fn verify_token_distinguishes_expired_from_invalid() {
        let user_id = Uuid::new_v4();
        let token = token_with_exp(user_id, Utc::now().timestamp() - 10);

        let result = verify_token(&token, TEST_SECRET);
        assert!(matches!(result, Err(AppError::ExpiredToken)));
    }

    #[test]
    fn verify_token_rejects_wrong_secret() {
        let token = token_with_exp(Uuid::new_v4(), Utc::now().timestamp() + 900);
        let result = verify_token(&token, "a-completely-different-secret-value");
        assert!(matches!(result, Err(AppError::InvalidToken)));
    }

    #[test]
    fn verify_token_rejects_malformed_string() {
        let result = verify_token("not.a.jwt", TEST_SECRET);
        assert!(matches!(result, Err(AppError::InvalidToken)));
    }

    #[test]
    fn verify_token_rejects_non_uuid_subject() {
        let claims = Claims {
            sub: "not-a-uuid".to_string(),
            exp: Utc::now().timestamp() + 900,
            iat: Utc::now().timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap();

        let result = verify_token(&token, TEST_SECRET);
        assert!(matches!(result, Err(AppError::InvalidToken)));
    }

    #[test]
    fn extract_ws_token_prefers_header_over_query() {
        let result = extract_ws_token(Some("from-query"), Some("from-header"));
        assert_eq!(result.as_deref(), Some("from-header"));
    }

    #[test]
    fn extract_ws_token_falls_back_to_query() {
        let result = extract_ws_token(Some("from-query"), None);
        assert_eq!(result.as_deref(), Some("from-query"));
    }

    #[test]
    fn extract_ws_token_none_when_absent() {
        let result = extract_ws_token(None, None);
        assert_eq!(result, None);
    }
}
