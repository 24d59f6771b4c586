//! Heartbeat writer — ambient supplement to the Subscription Registry (C3).
//!
//! Upserts `(connection_id, pod_id, now())` for every connection this pod
//! currently holds open, on a fixed tick. `cleanup_stale` treats a
//! subscription row as garbage once no pod's heartbeat has touched its
//! `connection_id` within the stale window (spec section 3 invariant I3);
//! this task is what makes "live on some pod" externally observable without
//! pod-to-pod RPC (C9).

use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use crate::connections::ConnectionManager;

const TICK_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(pool: PgPool, connections: ConnectionManager, pod_id: Uuid) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = tick_once(&pool, &connections, pod_id).await {
            tracing::warn!(error = ?e, "heartbeat upsert failed; will retry next tick");
        }
    }
}

async fn tick_once(
    pool: &PgPool,
    connections: &ConnectionManager,
    pod_id: Uuid,
) -> Result<(), sqlx::Error> {
    let ids: Vec<Uuid> = connections.all_connection_ids().await;
    if ids.is_empty() {
        return Ok(());
    }

    sqlx::query(
        "INSERT INTO connection_heartbeats (connection_id, pod_id, last_seen)
         SELECT c, $2, now() FROM UNNEST($1::uuid[]) AS c
         ON CONFLICT (connection_id) DO UPDATE SET pod_id = EXCLUDED.pod_id, last_seen = EXCLUDED.last_seen",
    )
    .bind(&ids)
    .bind(pod_id)
    .execute(pool)
    .await?;

    Ok(())
}
