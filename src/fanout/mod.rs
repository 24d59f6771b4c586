//! Fan-out Engine (C7) — spec section 4.7.
//!
//! Given a batch of changes for one entity type, resolves subscribers,
//! filters to local connections, composes and sends the invalidation
//! message, and updates change-log status. Invoked both by the Notify
//! Listener (one row at a time, dispatched asynchronously so a slow
//! subscriber set never back-pressures the NOTIFY channel) and the Poll
//! Watcher (a whole sweep's worth of rows, grouped by entity type).

use uuid::Uuid;

use crate::connections::{ConnectionManager, SendOutcome};
use crate::gateway::protocol::{ChangeItem, InvalidatePayload, ServerFrame};
use crate::model::{ChangeAction, EntityId, EntityType};
use crate::subscriptions::SubscriptionRegistry;

/// One change to fan out. `log_id` is carried through so the caller can
/// update change-log status once dispatch completes.
#[derive(Debug, Clone)]
pub struct ChangeTuple {
    pub entity_id: EntityId,
    pub action: ChangeAction,
    pub log_id: Uuid,
    pub version: i64,
}

/// Who called the engine — governs the skip-path in step 3 of the
/// algorithm, which only applies when the listener (not the poller)
/// triggered fan-out for a row with zero local subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Listener,
    Poller,
}

/// Outcome of fanning out one entity type's batch of changes: which log ids
/// to mark `sent`, which to mark `skipped`. The caller (listener or poller)
/// owns calling into the Change-Log Interface with these — the engine never
/// touches the change log directly, keeping the Postgres write on the
/// caller's existing connection/transaction.
#[derive(Debug, Default)]
pub struct FanoutOutcome {
    pub sent_log_ids: Vec<Uuid>,
    pub skipped_log_ids: Vec<Uuid>,
}

pub struct FanoutEngine {
    connections: ConnectionManager,
    subscriptions: SubscriptionRegistry,
}

impl FanoutEngine {
    pub fn new(connections: ConnectionManager, subscriptions: SubscriptionRegistry) -> Self {
        Self {
            connections,
            subscriptions,
        }
    }

    /// Runs the full algorithm from spec section 4.7 for one entity type's
    /// batch of changes (all non-VIEW; VIEW is filtered upstream by the
    /// Change-Log Interface).
    pub async fn dispatch(
        &self,
        entity_type: &EntityType,
        changes: &[ChangeTuple],
        trigger: Trigger,
    ) -> FanoutOutcome {
        let mut outcome = FanoutOutcome::default();
        if changes.is_empty() {
            return outcome;
        }

        let entity_ids: Vec<EntityId> = changes.iter().map(|c| c.entity_id).collect();
        let subscribers = match self
            .subscriptions
            .get_batch_subscribers(entity_type, &entity_ids)
            .await
        {
            Ok(subs) => subs,
            Err(e) => {
                tracing::warn!(
                    entity_type = %entity_type,
                    error = ?e,
                    "failed to query subscribers for fan-out; batch will be retried on the next trigger"
                );
                return outcome;
            }
        };

        let mut local_subscribers = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            if self.connections.has_open(subscriber.connection_id).await {
                local_subscribers.push(subscriber);
            }
        }

        if local_subscribers.is_empty() {
            if trigger == Trigger::Listener {
                // No pod on this network handled it yet — acceptable false
                // positives here are resolved by mark_sent's ability to
                // overwrite a skipped row (I5 is preserved: sent is terminal,
                // skipped is not).
                outcome
                    .skipped_log_ids
                    .extend(changes.iter().map(|c| c.log_id));
            }
            return outcome;
        }

        let by_entity: std::collections::HashMap<EntityId, &ChangeTuple> =
            changes.iter().map(|c| (c.entity_id, c)).collect();

        let mut any_sent = false;
        for subscriber in &local_subscribers {
            let mut member_changes: Vec<ChangeItem> = subscriber
                .subscribed_entity_ids
                .iter()
                .filter_map(|id| by_entity.get(id))
                .map(|c| ChangeItem {
                    entity_id: c.entity_id,
                    action: c.action,
                    version: c.version,
                })
                .collect();

            if member_changes.is_empty() {
                continue;
            }
            member_changes.sort_by_key(|c| c.version);

            let message = ServerFrame::Invalidate {
                payload: InvalidatePayload {
                    entity_code: entity_type.clone(),
                    changes: member_changes,
                    timestamp: chrono::Utc::now().timestamp(),
                },
            };

            let sent = self
                .connections
                .send(subscriber.connection_id, &message)
                .await;
            if sent == SendOutcome::Sent {
                any_sent = true;
            }
        }

        if any_sent {
            outcome
                .sent_log_ids
                .extend(changes.iter().map(|c| c.log_id));
        } else if trigger == Trigger::Listener {
            outcome
                .skipped_log_ids
                .extend(changes.iter().map(|c| c.log_id));
        }

        outcome
    }
}
