use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use crate::changelog::ChangeLog;
use crate::connections::ConnectionManager;
use crate::fanout::FanoutEngine;
use crate::subscriptions::SubscriptionRegistry;

/// Shared application state passed to every handler and background task.
///
/// Built once at startup (the composition root — spec section 9's redesign
/// flag against ambient module-loaded singletons) and cloned cheaply per
/// request; every field is itself an `Arc`-backed handle or `Copy` value.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub jwt_secret: Arc<str>,
    pub connections: ConnectionManager,
    pub subscriptions: SubscriptionRegistry,
    pub change_log: ChangeLog,
    pub fanout: Arc<FanoutEngine>,
    /// Random per-process id used only as the heartbeat table's pod
    /// discriminator; never sent over the wire.
    pub pod_id: Uuid,
    pub token_expiry_warning: Duration,
    pub stale_subscription_window: Duration,
    /// Deadline for a single outbound socket write (spec section 5's
    /// "whichever trips first" alongside the queued-bytes cap).
    pub socket_write_deadline: Duration,
}
