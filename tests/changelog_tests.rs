mod common;

use serial_test::serial;
use uuid::Uuid;

/// `change_log` rows are global (no per-test partition key), so tests that
/// rely on `fetch_pending`'s ordering/limit behavior run serially to avoid
/// racing each other's rows into view.
#[tokio::test]
#[serial]
async fn fetch_pending_returns_only_the_newest_row_per_entity() {
    let h = common::harness().await;
    let entity_type = format!("doc-{}", Uuid::new_v4().simple());
    let entity_id = Uuid::new_v4();

    let _first = common::insert_change_log_row(&h.pool, &entity_type, entity_id, 4, 1).await;
    let newest = common::insert_change_log_row(&h.pool, &entity_type, entity_id, 1, 2).await;

    let pending = h.change_log.fetch_pending(100).await.unwrap();
    let rows: Vec<_> = pending
        .iter()
        .filter(|e| e.entity_type == entity_type)
        .collect();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].log_id, newest);
    assert_eq!(rows[0].version, 2);
}

#[tokio::test]
#[serial]
async fn fetch_pending_filters_out_view_actions() {
    let h = common::harness().await;
    let entity_type = format!("doc-{}", Uuid::new_v4().simple());
    let entity_id = Uuid::new_v4();

    common::insert_change_log_row(&h.pool, &entity_type, entity_id, 0, 1).await;

    let pending = h.change_log.fetch_pending(100).await.unwrap();
    assert!(!pending.iter().any(|e| e.entity_type == entity_type));
}

#[tokio::test]
#[serial]
async fn mark_sent_is_terminal_and_cannot_be_overwritten_by_skip() {
    let h = common::harness().await;
    let entity_type = format!("doc-{}", Uuid::new_v4().simple());
    let log_id = common::insert_change_log_row(&h.pool, &entity_type, Uuid::new_v4(), 4, 1).await;

    h.change_log.mark_sent(&[log_id]).await.unwrap();
    assert_eq!(common::sync_status(&h.pool, log_id).await, "sent");

    let affected = h.change_log.mark_skipped(&[log_id]).await.unwrap();
    assert_eq!(affected, 0);
    assert_eq!(common::sync_status(&h.pool, log_id).await, "sent");
}

#[tokio::test]
#[serial]
async fn mark_sent_can_upgrade_a_previously_skipped_row() {
    let h = common::harness().await;
    let entity_type = format!("doc-{}", Uuid::new_v4().simple());
    let log_id = common::insert_change_log_row(&h.pool, &entity_type, Uuid::new_v4(), 4, 1).await;

    h.change_log.mark_skipped(&[log_id]).await.unwrap();
    assert_eq!(common::sync_status(&h.pool, log_id).await, "skipped");

    h.change_log.mark_sent(&[log_id]).await.unwrap();
    assert_eq!(common::sync_status(&h.pool, log_id).await, "sent");
}
