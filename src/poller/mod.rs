//! Poll Watcher (C6) — spec section 4.6.
//!
//! Safety net for the Notify Listener: on a fixed interval, sweeps
//! `change_log` for anything still `pending` and fans it out regardless of
//! whether a NOTIFY ever arrived for it. Every row the sweep fetches gets
//! marked `sent` unconditionally once dispatch is attempted — unlike the
//! listener, the poller never marks a row `skipped`, since by the time the
//! poller sees a row the grace period for "maybe another pod just hasn't
//! caught up yet" has already elapsed (spec section 4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::changelog::ChangeLog;
use crate::fanout::{ChangeTuple, FanoutEngine, Trigger};
use crate::model::EntityType;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const INITIAL_DELAY: Duration = Duration::from_secs(5);

pub struct PollWatcher {
    change_log: ChangeLog,
    fanout: Arc<FanoutEngine>,
    interval: Duration,
    batch_limit: i64,
    /// Guards against a sweep still running when the next tick fires (spec
    /// section 4.6 edge case — a slow sweep must not overlap itself).
    running: AtomicBool,
}

impl PollWatcher {
    pub fn new(
        change_log: ChangeLog,
        fanout: Arc<FanoutEngine>,
        interval: Duration,
        batch_limit: i64,
    ) -> Self {
        Self {
            change_log,
            fanout,
            interval,
            batch_limit,
            running: AtomicBool::new(false),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(INITIAL_DELAY) => {}
            _ = cancel.cancelled() => return,
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // consume the immediate first tick; we already waited INITIAL_DELAY

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn sweep_once(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("poll watcher sweep still running; skipping this tick");
            return;
        }

        let result = self.do_sweep().await;
        self.running.store(false, Ordering::SeqCst);

        if let Err(e) = result {
            tracing::warn!(error = ?e, "poll watcher sweep failed");
        }
    }

    async fn do_sweep(&self) -> Result<(), crate::error::AppError> {
        let pending = self.change_log.fetch_pending(self.batch_limit).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut by_entity_type: HashMap<EntityType, Vec<ChangeTuple>> = HashMap::new();
        for entry in &pending {
            by_entity_type
                .entry(entry.entity_type.clone())
                .or_default()
                .push(ChangeTuple {
                    entity_id: entry.entity_id,
                    action: entry.action,
                    log_id: entry.log_id,
                    version: entry.version,
                });
        }

        let all_log_ids: Vec<uuid::Uuid> = pending.iter().map(|e| e.log_id).collect();

        for (entity_type, changes) in &by_entity_type {
            self.fanout
                .dispatch(entity_type, changes, Trigger::Poller)
                .await;
        }

        // Unconditional: a row fetched by the poller has already missed its
        // listener-driven delivery window, so there is no further fallback
        // to defer to. Marking it sent (rather than leaving it pending)
        // prevents the same row from being re-swept forever (spec section
        // 4.6).
        self.change_log.mark_sent(&all_log_ids).await?;

        tracing::debug!(
            rows = pending.len(),
            entity_types = by_entity_type.len(),
            "poll watcher sweep dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionManager;
    use crate::subscriptions::SubscriptionRegistry;

    fn lazy_pool() -> sqlx::PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://unused@localhost/unused")
            .expect("lazy pool construction never touches the network")
    }

    fn watcher() -> PollWatcher {
        let pool = lazy_pool();
        let fanout = Arc::new(FanoutEngine::new(
            ConnectionManager::new(1_048_576),
            SubscriptionRegistry::new(pool.clone(), Duration::from_secs(5)),
        ));
        PollWatcher::new(
            ChangeLog::new(pool, Duration::from_secs(5)),
            fanout,
            DEFAULT_INTERVAL,
            500,
        )
    }

    #[test]
    fn reentrancy_guard_starts_clear() {
        let w = watcher();
        assert!(!w.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn concurrent_sweep_attempt_is_skipped_while_one_runs() {
        let w = watcher();
        w.running.store(true, Ordering::SeqCst);
        // sweep_once should observe the guard already held and return
        // immediately without attempting `do_sweep` (which would otherwise
        // error trying to reach a real database).
        w.sweep_once().await;
        // Guard is left exactly as this test set it — sweep_once does not
        // clear a guard it didn't acquire itself.
        assert!(w.running.load(Ordering::SeqCst));
    }
}
