//! Domain types shared across the connection manager, subscription registry,
//! change-log interface, and fan-out engine — spec section 3.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit connection identifier (spec section 3, Connection).
pub type ConnectionId = Uuid;

/// Short string code identifying a family of entities, e.g. `"project"`,
/// `"task"` (spec GLOSSARY, "Entity type code").
pub type EntityType = String;

/// Opaque 128-bit entity identifier (spec section 3, Subscription).
pub type EntityId = Uuid;

/// The encoded action integer from the change log, translated to the wire
/// enum. Spec section 9 (Open Questions): only `3` (DELETE) and `4` (CREATE)
/// are fully enumerated; every other non-zero integer is assumed `UPDATE`
/// and a diagnostic is emitted the first time an unrecognised code is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    /// `action = 0`. Filtered out before fan-out (spec section 4.4).
    View,
    Create,
    Delete,
    /// Carries the original integer code for diagnostics; `1` and `2` are
    /// the only values the source distinguishes, but the set is "deliberately
    /// open-ended" per spec section 4.7.
    Update(i32),
}

impl ChangeAction {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ChangeAction::View,
            4 => ChangeAction::Create,
            3 => ChangeAction::Delete,
            other => {
                if other != 1 && other != 2 {
                    tracing::warn!(code = other, "unexpected change-log action code; treating as UPDATE");
                }
                ChangeAction::Update(other)
            }
        }
    }

    pub fn is_view(&self) -> bool {
        matches!(self, ChangeAction::View)
    }

    /// The wire representation used in the client invalidation message.
    pub fn wire_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "CREATE",
            ChangeAction::Delete => "DELETE",
            ChangeAction::Update(_) => "UPDATE",
            ChangeAction::View => "VIEW",
        }
    }
}

impl Serialize for ChangeAction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.wire_str())
    }
}

/// `sync_status` of a change-log row (spec section 3, invariant I5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Sent,
    Skipped,
}

impl SyncStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Sent => "sent",
            SyncStatus::Skipped => "skipped",
        }
    }
}
