//! Notify Listener (C5) — spec section 4.5.
//!
//! Holds a single `LISTEN` connection open against the configured channel and
//! dispatches each `NOTIFY` payload to the Fan-out Engine as it arrives. Runs
//! as a standalone background task (spawned from `main`) with its own
//! reconnect state machine — the rest of the system never observes a
//! dropped connection directly, only the gap in delivery that the Poll
//! Watcher (C6) exists to close.

use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::PgListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::changelog::ChangeLog;
use crate::fanout::{ChangeTuple, FanoutEngine, Trigger};
use crate::model::ChangeAction;

/// Connection lifecycle (spec section 4.5). Exposed for tests and logging
/// only — the listener never lets callers observe or drive this directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Connecting,
    Listening,
    Disconnected,
}

/// Shape of a `NOTIFY` payload, as produced by the trigger that writes
/// `change_log` rows. Unknown extra fields are ignored; a payload that fails
/// to parse is logged and dropped rather than killing the listener (spec
/// section 4.5 edge case — malformed payloads must not take the channel
/// down, since the Poll Watcher cannot recover a payload it never sees
/// duplicated anywhere but `change_log` itself, which the next sweep will
/// still pick up).
#[derive(Debug, Deserialize)]
struct NotifyPayload {
    log_id: Uuid,
    entity_code: String,
    entity_id: Uuid,
    action: i32,
    #[allow(dead_code)]
    timestamp: Option<i64>,
    #[serde(default)]
    version: i64,
}

pub struct NotifyListener {
    database_url: String,
    channel: String,
    change_log: ChangeLog,
    fanout: std::sync::Arc<FanoutEngine>,
    base_delay: Duration,
    attempt_ceiling: u32,
}

impl NotifyListener {
    pub fn new(
        database_url: impl Into<String>,
        channel: impl Into<String>,
        change_log: ChangeLog,
        fanout: std::sync::Arc<FanoutEngine>,
        base_delay: Duration,
        attempt_ceiling: u32,
    ) -> Self {
        Self {
            database_url: database_url.into(),
            channel: channel.into(),
            change_log,
            fanout,
            base_delay,
            attempt_ceiling,
        }
    }

    /// Runs until `cancel` fires. Reconnects with exponential backoff
    /// (doubling, exponent capped at 5, so delay caps at 32x `base_delay`)
    /// up to `attempt_ceiling` consecutive failures, after which the
    /// listener parks permanently and relies entirely on the Poll Watcher
    /// (spec section 4.5 — no indefinite retry storm against a Postgres
    /// that is down for good).
    pub async fn run(self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            tracing::info!(channel = %self.channel, attempt, "notify listener connecting");
            match self.connect_and_listen(&cancel).await {
                Ok(()) => {
                    // `connect_and_listen` only returns Ok on cooperative
                    // cancellation.
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        error = ?e,
                        attempt,
                        "notify listener disconnected; scheduling reconnect"
                    );
                    if attempt > self.attempt_ceiling {
                        tracing::error!(
                            attempts = attempt,
                            "notify listener exhausted reconnect attempts; parking \
                             permanently, relying on poll watcher for delivery"
                        );
                        return;
                    }
                    let delay = self.backoff_delay(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(5);
        self.base_delay * 2u32.pow(exponent)
    }

    /// Returns `Ok(())` only when `cancel` fired while listening; any other
    /// exit (connect failure, recv error) is `Err` and triggers a reconnect
    /// in `run`.
    async fn connect_and_listen(&self, cancel: &CancellationToken) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect(&self.database_url).await?;
        listener.listen(&self.channel).await?;
        tracing::info!(channel = %self.channel, "notify listener connected");

        loop {
            tokio::select! {
                notification = listener.recv() => {
                    let notification = notification?;
                    let raw = notification.payload().to_string();
                    let fanout = self.fanout.clone();
                    let change_log = self.change_log.clone();
                    // Spawned rather than awaited inline: fan-out for one
                    // payload involves a subscriber query plus a per-subscriber
                    // send loop, and must never back-pressure the NOTIFY
                    // channel (spec section 4.5) while the next notification
                    // is waiting to be received.
                    tokio::spawn(async move {
                        Self::handle_payload(&fanout, &change_log, &raw).await;
                    });
                }
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    async fn handle_payload(fanout: &FanoutEngine, change_log: &ChangeLog, raw: &str) {
        let payload: NotifyPayload = match serde_json::from_str(raw) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = ?e, raw, "dropping malformed NOTIFY payload");
                return;
            }
        };

        let action = ChangeAction::from_code(payload.action);
        if action.is_view() {
            return;
        }

        let change = ChangeTuple {
            entity_id: payload.entity_id,
            action,
            log_id: payload.log_id,
            version: payload.version,
        };

        let outcome = fanout
            .dispatch(&payload.entity_code, std::slice::from_ref(&change), Trigger::Listener)
            .await;

        if let Err(e) = change_log.mark_sent(&outcome.sent_log_ids).await {
            tracing::warn!(error = ?e, "failed to mark change-log row sent after listener dispatch");
        }
        if let Err(e) = change_log.mark_skipped(&outcome.skipped_log_ids).await {
            tracing::warn!(error = ?e, "failed to mark change-log row skipped after listener dispatch");
        }
    }
}
