//! Wire protocol for the gateway (C8) — spec sections 3 and 4.8.
//!
//! All frames are UTF-8 JSON shaped `{type: <string>, payload?: <object>}`.
//! Tagged variants with an enumerated `type` reject unknown tags by
//! construction (redesign flag in spec section 9 — no `any`-typed payloads).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ChangeAction, EntityId, EntityType};

// ============================================================================
// Client -> server
// ============================================================================

/// Parsed client frame. Not itself `Deserialize` — the wire shape nests a
/// differently-typed `payload` per tag and unit variants carry none, which
/// an internally-tagged enum derive cannot express directly. `parse` decodes
/// the envelope and dispatches to the right payload type by hand instead.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Subscribe { payload: SubscribePayload },
    Unsubscribe { payload: UnsubscribePayload },
    UnsubscribeAll,
    TokenRefresh { payload: TokenRefreshPayload },
    Ping,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub entity_code: EntityType,
    pub entity_ids: Vec<EntityId>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribePayload {
    pub entity_code: EntityType,
    #[serde(default)]
    pub entity_ids: Option<Vec<EntityId>>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct TokenRefreshPayload {
    pub token: String,
}

// The client frames above are read through an intermediate envelope because
// `#[serde(tag = "type", content = "payload")]` cannot flatten a
// differently-shaped payload per unit variant (UNSUBSCRIBE_ALL / PING carry
// none). `RawFrame` captures the envelope; `ClientFrame::parse` then decodes
// the typed payload per tag, rejecting unknown tags and malformed payloads
// uniformly as `ProtocolError` at the call site.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError(e.to_string()))?;

        let parse_payload = |v: serde_json::Value| -> Result<_, ProtocolError> {
            serde_json::from_value(v).map_err(|e| ProtocolError(e.to_string()))
        };

        match raw.kind.as_str() {
            "SUBSCRIBE" => Ok(ClientFrame::Subscribe {
                payload: parse_payload(raw.payload)?,
            }),
            "UNSUBSCRIBE" => Ok(ClientFrame::Unsubscribe {
                payload: parse_payload(raw.payload)?,
            }),
            "UNSUBSCRIBE_ALL" => Ok(ClientFrame::UnsubscribeAll),
            "TOKEN_REFRESH" => Ok(ClientFrame::TokenRefresh {
                payload: parse_payload(raw.payload)?,
            }),
            "PING" => Ok(ClientFrame::Ping),
            other => Err(ProtocolError(format!("unknown frame type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError(pub String);

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Server -> client
// ============================================================================

/// One entity's change within an `INVALIDATE` message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeItem {
    pub entity_id: EntityId,
    pub action: ChangeAction,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidatePayload {
    pub entity_code: EntityType,
    pub changes: Vec<ChangeItem>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenExpiringSoonPayload {
    #[serde(rename = "expiresIn")]
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribedPayload {
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    Invalidate { payload: InvalidatePayload },
    TokenExpiringSoon { payload: TokenExpiringSoonPayload },
    Subscribed { payload: SubscribedPayload },
    Pong,
    Error { payload: ErrorPayload },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            payload: ErrorPayload {
                message: message.into(),
            },
        }
    }
}

/// WebSocket close codes (spec section 4.8).
pub mod close_code {
    pub const INVALID_TOKEN: u16 = 4001;
    pub const EXPIRED_TOKEN: u16 = 4002;
    pub const NORMAL: u16 = 1000;
    /// Malformed or unrecognised client frame (spec section 7's
    /// `ProtocolError`). The standard RFC 6455 "protocol error" code.
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INTERNAL_ERROR: u16 = 1011;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_frame() {
        let entity_id = Uuid::new_v4();
        let text = format!(
            r#"{{"type":"SUBSCRIBE","payload":{{"entityCode":"project","entityIds":["{entity_id}"]}}}}"#
        );

        let frame = ClientFrame::parse(&text).unwrap();
        match frame {
            ClientFrame::Subscribe { payload } => {
                assert_eq!(payload.entity_code, "project");
                assert_eq!(payload.entity_ids, vec![entity_id]);
            }
            _ => panic!("expected Subscribe"),
        }
    }

    #[test]
    fn parses_unsubscribe_without_entity_ids() {
        let text = r#"{"type":"UNSUBSCRIBE","payload":{"entityCode":"project"}}"#;
        let frame = ClientFrame::parse(text).unwrap();
        match frame {
            ClientFrame::Unsubscribe { payload } => {
                assert_eq!(payload.entity_code, "project");
                assert_eq!(payload.entity_ids, None);
            }
            _ => panic!("expected Unsubscribe"),
        }
    }

    #[test]
    fn parses_unsubscribe_all_and_ping_without_payload() {
        assert_eq!(
            ClientFrame::parse(r#"{"type":"UNSUBSCRIBE_ALL"}"#).unwrap(),
            ClientFrame::UnsubscribeAll
        );
        assert_eq!(
            ClientFrame::parse(r#"{"type":"PING"}"#).unwrap(),
            ClientFrame::Ping
        );
    }

    #[test]
    fn rejects_unknown_frame_type() {
        let result = ClientFrame::parse(r#"{"type":"EXPLODE"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        let result = ClientFrame::parse("not json");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_subscribe_missing_required_field() {
        let result = ClientFrame::parse(r#"{"type":"SUBSCRIBE","payload":{"entityCode":"project"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn invalidate_serializes_camel_case_payload() {
        let frame = ServerFrame::Invalidate {
            payload: InvalidatePayload {
                entity_code: "project".to_string(),
                changes: vec![ChangeItem {
                    entity_id: Uuid::nil(),
                    action: ChangeAction::Update(1),
                    version: 0,
                }],
                timestamp: 1000,
            },
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"INVALIDATE""#));
        assert!(json.contains(r#""entityCode":"project""#));
        assert!(json.contains(r#""entityId":"00000000-0000-0000-0000-000000000000""#));
        assert!(json.contains(r#""action":"UPDATE""#));
    }

    #[test]
    fn subscribed_serializes_with_count() {
        let frame = ServerFrame::Subscribed {
            payload: SubscribedPayload { count: 3 },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"SUBSCRIBED","payload":{"count":3}}"#);
    }

    #[test]
    fn pong_has_no_payload_field() {
        let json = serde_json::to_string(&ServerFrame::Pong).unwrap();
        assert_eq!(json, r#"{"type":"PONG"}"#);
    }
}
