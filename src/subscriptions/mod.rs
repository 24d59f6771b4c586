//! Subscription Registry (C3) — spec section 4.3.
//!
//! Durable shared table of `(user_id, connection_id, entity_type, entity_id)`.
//! Writes are local to the issuing pod but reads are cross-pod — this is the
//! shared state that lets any pod route a change to any connection (C9).

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::db::with_deadline;
use crate::error::AppResult;
use crate::model::{ConnectionId, EntityId, EntityType};

/// One subscriber's intersection with a fan-out query's entity id set —
/// the primitive `get_batch_subscribers` returns (spec section 4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub user_id: Uuid,
    pub connection_id: ConnectionId,
    pub subscribed_entity_ids: Vec<EntityId>,
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    user_id: Uuid,
    connection_id: Uuid,
    entity_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct EntityCount {
    pub entity_type: EntityType,
    pub count: i64,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    pool: PgPool,
    db_call_deadline: Duration,
}

impl SubscriptionRegistry {
    pub fn new(pool: PgPool, db_call_deadline: Duration) -> Self {
        Self {
            pool,
            db_call_deadline,
        }
    }

    /// Bulk upsert. Idempotent, deduplicates the input server-side, and is a
    /// single round-trip regardless of list size (redesign flag in spec
    /// section 9: parameterised arrays, never per-row concatenation).
    /// Either every row commits or none do — a single `INSERT ... SELECT
    /// FROM UNNEST` is one statement, hence one implicit transaction.
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        connection_id: ConnectionId,
        entity_type: &str,
        entity_ids: &[EntityId],
    ) -> AppResult<u64> {
        let deduped = dedup(entity_ids);
        if deduped.is_empty() {
            return Ok(0);
        }

        with_deadline(
            self.db_call_deadline,
            sqlx::query(
                "INSERT INTO subscriptions (user_id, connection_id, entity_type, entity_id, created_at)
                 SELECT $1, $2, $3, e, now() FROM UNNEST($4::uuid[]) AS e
                 ON CONFLICT (connection_id, entity_type, entity_id) DO NOTHING",
            )
            .bind(user_id)
            .bind(connection_id)
            .bind(entity_type)
            .bind(&deduped)
            .execute(&self.pool),
        )
        .await?;

        Ok(deduped.len() as u64)
    }

    /// When `entity_ids` is `None`, removes all of this user's subscriptions
    /// for the type. An empty (but present) id list is a no-op.
    pub async fn unsubscribe(
        &self,
        user_id: Uuid,
        entity_type: &str,
        entity_ids: Option<&[EntityId]>,
    ) -> AppResult<u64> {
        match entity_ids {
            Some(ids) if ids.is_empty() => Ok(0),
            Some(ids) => {
                let deduped = dedup(ids);
                let result = with_deadline(
                    self.db_call_deadline,
                    sqlx::query(
                        "DELETE FROM subscriptions
                         WHERE user_id = $1 AND entity_type = $2 AND entity_id = ANY($3)",
                    )
                    .bind(user_id)
                    .bind(entity_type)
                    .bind(&deduped)
                    .execute(&self.pool),
                )
                .await?;
                Ok(result.rows_affected())
            }
            None => {
                let result = with_deadline(
                    self.db_call_deadline,
                    sqlx::query(
                        "DELETE FROM subscriptions WHERE user_id = $1 AND entity_type = $2",
                    )
                    .bind(user_id)
                    .bind(entity_type)
                    .execute(&self.pool),
                )
                .await?;
                Ok(result.rows_affected())
            }
        }
    }

    pub async fn unsubscribe_all(&self, user_id: Uuid) -> AppResult<u64> {
        let result = with_deadline(
            self.db_call_deadline,
            sqlx::query("DELETE FROM subscriptions WHERE user_id = $1")
                .bind(user_id)
                .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }

    /// Run on socket close; also safe to run on arbitrary dead ids.
    pub async fn cleanup_connection(&self, connection_id: ConnectionId) -> AppResult<u64> {
        let result = with_deadline(
            self.db_call_deadline,
            sqlx::query("DELETE FROM subscriptions WHERE connection_id = $1")
                .bind(connection_id)
                .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }

    /// Fan-out primitive: for each subscriber covering any id in
    /// `entity_ids`, return the intersection of their subscriptions with the
    /// query set. One round-trip via a parameterised array.
    pub async fn get_batch_subscribers(
        &self,
        entity_type: &str,
        entity_ids: &[EntityId],
    ) -> AppResult<Vec<Subscriber>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<SubscriptionRow> = with_deadline(
            self.db_call_deadline,
            sqlx::query_as(
                "SELECT user_id, connection_id, entity_id FROM subscriptions
                 WHERE entity_type = $1 AND entity_id = ANY($2)",
            )
            .bind(entity_type)
            .bind(entity_ids)
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(group_subscribers(rows))
    }

    /// Removes subscription rows older than `older_than` whose
    /// `connection_id` is not claimed by any pod's heartbeat (spec section
    /// 3 invariant I3, section 4.3). Idempotent; runs as a plain `DELETE`
    /// that never blocks the fan-out path, which only ever reads.
    pub async fn cleanup_stale(&self, older_than: Duration) -> AppResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();

        let result = with_deadline(
            self.db_call_deadline,
            sqlx::query(
                "DELETE FROM subscriptions s
                 WHERE s.created_at < $1
                   AND NOT EXISTS (
                       SELECT 1 FROM connection_heartbeats h
                       WHERE h.connection_id = s.connection_id AND h.last_seen >= $1
                   )",
            )
            .bind(cutoff)
            .execute(&self.pool),
        )
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> AppResult<Vec<EntityCount>> {
        let rows: Vec<(String, i64)> = with_deadline(
            self.db_call_deadline,
            sqlx::query_as("SELECT entity_type, COUNT(*) FROM subscriptions GROUP BY entity_type")
                .fetch_all(&self.pool),
        )
        .await?;

        Ok(rows
            .into_iter()
            .map(|(entity_type, count)| EntityCount { entity_type, count })
            .collect())
    }
}

fn dedup(ids: &[EntityId]) -> Vec<EntityId> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.iter().filter(|id| seen.insert(**id)).copied().collect()
}

/// Groups flat `(user_id, connection_id, entity_id)` rows by subscriber.
/// Factored out so the fan-out shape can be unit tested without a database.
fn group_subscribers(rows: Vec<SubscriptionRow>) -> Vec<Subscriber> {
    let mut grouped: HashMap<(Uuid, ConnectionId), Vec<EntityId>> = HashMap::new();
    for row in rows {
        grouped
            .entry((row.user_id, row.connection_id))
            .or_default()
            .push(row.entity_id);
    }

    grouped
        .into_iter()
        .map(|((user_id, connection_id), subscribed_entity_ids)| Subscriber {
            user_id,
            connection_id,
            subscribed_entity_ids,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_removes_duplicate_entity_ids() {
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let result = dedup(&[id, other, id]);
        assert_eq!(result.len(), 2);
        assert!(result.contains(&id) && result.contains(&other));
    }

    #[test]
    fn dedup_of_empty_is_empty() {
        assert!(dedup(&[]).is_empty());
    }

    #[test]
    fn group_subscribers_collects_intersection_per_connection() {
        let user1 = Uuid::new_v4();
        let conn1 = Uuid::new_v4();
        let conn2 = Uuid::new_v4();
        let e1 = Uuid::new_v4();
        let e2 = Uuid::new_v4();

        let rows = vec![
            SubscriptionRow {
                user_id: user1,
                connection_id: conn1,
                entity_id: e1,
            },
            SubscriptionRow {
                user_id: user1,
                connection_id: conn1,
                entity_id: e2,
            },
            SubscriptionRow {
                user_id: user1,
                connection_id: conn2,
                entity_id: e1,
            },
        ];

        let mut subscribers = group_subscribers(rows);
        subscribers.sort_by_key(|s| s.subscribed_entity_ids.len());

        assert_eq!(subscribers.len(), 2);
        let single = &subscribers[0];
        assert_eq!(single.connection_id, conn2);
        assert_eq!(single.subscribed_entity_ids, vec![e1]);

        let double = &subscribers[1];
        assert_eq!(double.connection_id, conn1);
        assert_eq!(double.subscribed_entity_ids.len(), 2);
    }

    #[test]
    fn group_subscribers_of_empty_rows_is_empty() {
        assert!(group_subscribers(Vec::new()).is_empty());
    }
}
