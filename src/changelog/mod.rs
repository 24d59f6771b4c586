//! Change-Log Interface (C4) — spec section 4.4.
//!
//! Reads pending rows, marks them `sent` or `skipped`. All updates are
//! idempotent under retries — the log id deduplicates at the subscriber
//! level via `version`, so a status update that fails and is retried never
//! causes double delivery.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::db::with_deadline;
use crate::error::AppResult;
use crate::model::{ChangeAction, EntityId, EntityType};

#[derive(Debug, Clone, FromRow)]
struct LogRow {
    id: Uuid,
    entity_type: String,
    entity_id: Uuid,
    action: i32,
    created_at: DateTime<Utc>,
    version: i64,
}

/// One pending change-log entry, decoded for fan-out.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub log_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub action: ChangeAction,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl From<LogRow> for LogEntry {
    fn from(row: LogRow) -> Self {
        LogEntry {
            log_id: row.id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            action: ChangeAction::from_code(row.action),
            created_at: row.created_at,
            version: row.version,
        }
    }
}

#[derive(Clone)]
pub struct ChangeLog {
    pool: PgPool,
    db_call_deadline: Duration,
}

impl ChangeLog {
    pub fn new(pool: PgPool, db_call_deadline: Duration) -> Self {
        Self {
            pool,
            db_call_deadline,
        }
    }

    /// For each `(entity_type, entity_id)` with any pending rows, returns
    /// only the newest row (by `created_at`) and skips `action = VIEW`
    /// (spec section 4.4 — the core deduplication invariant: a burst of N
    /// writes to the same entity produces one delivery).
    pub async fn fetch_pending(&self, limit: i64) -> AppResult<Vec<LogEntry>> {
        let rows: Vec<LogRow> = with_deadline(
            self.db_call_deadline,
            sqlx::query_as(
                "SELECT id, entity_type, entity_id, action, created_at, version FROM (
                     SELECT DISTINCT ON (entity_type, entity_id)
                         id, entity_type, entity_id, action, created_at, version
                     FROM change_log
                     WHERE sync_status = 'pending' AND action <> 0
                     ORDER BY entity_type, entity_id, created_at DESC
                 ) AS newest
                 ORDER BY created_at ASC
                 LIMIT $1",
            )
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(rows.into_iter().map(LogEntry::from).collect())
    }

    /// Marks `sent`. Preserves invariant I5 (spec section 3): never moves a
    /// row that is already `sent` — this is also how a `skipped` row can
    /// still be "upgraded" to `sent` by a later pod (spec section 4.7) while
    /// a row already `sent` can never be demoted.
    pub async fn mark_sent(&self, log_ids: &[Uuid]) -> AppResult<u64> {
        if log_ids.is_empty() {
            return Ok(0);
        }
        let result = with_deadline(
            self.db_call_deadline,
            sqlx::query(
                "UPDATE change_log SET sync_status = 'sent', processed_at = now()
                 WHERE id = ANY($1) AND sync_status <> 'sent'",
            )
            .bind(log_ids)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }

    /// Marks `skipped`. Only ever transitions rows that are still `pending`
    /// — never overwrites `sent` (monotonicity) and never re-skips an
    /// already-`skipped` row redundantly.
    pub async fn mark_skipped(&self, log_ids: &[Uuid]) -> AppResult<u64> {
        if log_ids.is_empty() {
            return Ok(0);
        }
        let result = with_deadline(
            self.db_call_deadline,
            sqlx::query(
                "UPDATE change_log SET sync_status = 'skipped', processed_at = now()
                 WHERE id = ANY($1) AND sync_status = 'pending'",
            )
            .bind(log_ids)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }
}
