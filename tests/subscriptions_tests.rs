mod common;

use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn subscribe_then_get_batch_subscribers_round_trips() {
    let h = common::harness().await;
    let user_id = Uuid::new_v4();
    let conn_id = Uuid::new_v4();
    let entity_type = format!("project-{}", Uuid::new_v4().simple());
    let entity_id = Uuid::new_v4();

    h.subscriptions
        .subscribe(user_id, conn_id, &entity_type, &[entity_id])
        .await
        .unwrap();

    let subscribers = h
        .subscriptions
        .get_batch_subscribers(&entity_type, &[entity_id])
        .await
        .unwrap();

    assert_eq!(subscribers.len(), 1);
    assert_eq!(subscribers[0].connection_id, conn_id);
    assert_eq!(subscribers[0].subscribed_entity_ids, vec![entity_id]);
}

#[tokio::test]
async fn subscribe_is_idempotent_under_duplicate_entity_ids() {
    let h = common::harness().await;
    let user_id = Uuid::new_v4();
    let conn_id = Uuid::new_v4();
    let entity_type = format!("project-{}", Uuid::new_v4().simple());
    let entity_id = Uuid::new_v4();

    let inserted = h
        .subscriptions
        .subscribe(user_id, conn_id, &entity_type, &[entity_id, entity_id])
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    // Re-subscribing to the same pair is a no-op, not an error.
    h.subscriptions
        .subscribe(user_id, conn_id, &entity_type, &[entity_id])
        .await
        .unwrap();

    let subscribers = h
        .subscriptions
        .get_batch_subscribers(&entity_type, &[entity_id])
        .await
        .unwrap();
    assert_eq!(subscribers.len(), 1);
}

#[tokio::test]
async fn unsubscribe_without_ids_removes_every_subscription_for_the_type() {
    let h = common::harness().await;
    let user_id = Uuid::new_v4();
    let conn_id = Uuid::new_v4();
    let entity_type = format!("project-{}", Uuid::new_v4().simple());
    let e1 = Uuid::new_v4();
    let e2 = Uuid::new_v4();

    h.subscriptions
        .subscribe(user_id, conn_id, &entity_type, &[e1, e2])
        .await
        .unwrap();

    let removed = h
        .subscriptions
        .unsubscribe(user_id, &entity_type, None)
        .await
        .unwrap();
    assert_eq!(removed, 2);

    let subscribers = h
        .subscriptions
        .get_batch_subscribers(&entity_type, &[e1, e2])
        .await
        .unwrap();
    assert!(subscribers.is_empty());
}

#[tokio::test]
async fn cleanup_connection_removes_all_of_its_subscriptions() {
    let h = common::harness().await;
    let user_id = Uuid::new_v4();
    let conn_id = Uuid::new_v4();
    let entity_type = format!("project-{}", Uuid::new_v4().simple());
    let entity_id = Uuid::new_v4();

    h.subscriptions
        .subscribe(user_id, conn_id, &entity_type, &[entity_id])
        .await
        .unwrap();

    h.subscriptions.cleanup_connection(conn_id).await.unwrap();

    let subscribers = h
        .subscriptions
        .get_batch_subscribers(&entity_type, &[entity_id])
        .await
        .unwrap();
    assert!(subscribers.is_empty());
}

#[tokio::test]
async fn cleanup_stale_spares_connections_with_a_recent_heartbeat() {
    let h = common::harness().await;
    let user_id = Uuid::new_v4();
    let conn_id = Uuid::new_v4();
    let entity_type = format!("project-{}", Uuid::new_v4().simple());
    let entity_id = Uuid::new_v4();

    h.subscriptions
        .subscribe(user_id, conn_id, &entity_type, &[entity_id])
        .await
        .unwrap();

    sqlx::query(
        "INSERT INTO connection_heartbeats (connection_id, pod_id, last_seen) VALUES ($1, $2, now())",
    )
    .bind(conn_id)
    .bind(Uuid::new_v4())
    .execute(&h.pool)
    .await
    .unwrap();

    // A cutoff far in the past never classifies a just-subscribed,
    // just-heartbeated row as stale.
    let removed = h
        .subscriptions
        .cleanup_stale(Duration::from_secs(3600))
        .await
        .unwrap();

    let subscribers = h
        .subscriptions
        .get_batch_subscribers(&entity_type, &[entity_id])
        .await
        .unwrap();
    assert_eq!(subscribers.len(), 1, "removed {removed} rows unexpectedly");
}
