//! Connection Manager (C2) — spec section 4.2.
//!
//! Pod-local registry mapping connection id -> outbound socket handle, and
//! user id -> set of connection ids. Cheaply cloneable (wraps an `Arc`), the
//! same shape as the teacher's `ConnectionManager`, generalised to track
//! per-connection token expiry and queued-byte backpressure in addition to
//! the socket handle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

use crate::model::ConnectionId;

/// A server-initiated close request for a connection's writer task to act
/// on — spec section 4.8's close codes, raised from outside the per-connection
/// tasks (backpressure detected by a fan-out send, or an expiry sweep).
#[derive(Debug, Clone, Copy)]
pub struct CloseSignal {
    pub code: u16,
}

/// One registered connection's outbound handle and liveness bookkeeping.
struct ConnectionEntry {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<String>,
    close_tx: watch::Sender<Option<CloseSignal>>,
    token_expiry: AtomicI64,
    queued_bytes: AtomicUsize,
    #[allow(dead_code)]
    created_at: chrono::DateTime<Utc>,
}

/// Outcome of attempting to deliver one message to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// No such connection, or its outbound channel is already closed.
    NotConnected,
    /// The connection's queued-byte backpressure cap was exceeded; the
    /// gateway must close the socket with code `1011` (spec section 5).
    Backpressure,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub connections: usize,
    pub users: usize,
}

/// Tracks active WebSocket connections. Invariant I1 (spec section 3): for
/// any live `connection_id`, exactly one entry exists in `by_id` AND it is
/// present in `by_user[user_id]`. The two maps are always mutated together
/// under their own locks to preserve this.
#[derive(Clone)]
pub struct ConnectionManager {
    by_id: Arc<RwLock<HashMap<ConnectionId, ConnectionEntry>>>,
    by_user: Arc<RwLock<HashMap<Uuid, HashSet<ConnectionId>>>>,
    outbound_byte_cap: usize,
}

impl ConnectionManager {
    pub fn new(outbound_byte_cap: usize) -> Self {
        Self {
            by_id: Arc::new(RwLock::new(HashMap::new())),
            by_user: Arc::new(RwLock::new(HashMap::new())),
            outbound_byte_cap,
        }
    }

    /// Register a new connection. Generates a random 128-bit connection id.
    /// The caller retains the receive half of `tx`'s channel and is
    /// responsible for actually writing frames to the socket — this keeps
    /// the reader/writer task split the teacher uses, with the Connection
    /// Manager owning only the routing table, not the socket itself.
    pub async fn connect(
        &self,
        user_id: Uuid,
        tx: mpsc::UnboundedSender<String>,
        token_expiry: i64,
    ) -> (ConnectionId, watch::Receiver<Option<CloseSignal>>) {
        let connection_id = Uuid::new_v4();
        let (close_tx, close_rx) = watch::channel(None);
        let entry = ConnectionEntry {
            user_id,
            tx,
            close_tx,
            token_expiry: AtomicI64::new(token_expiry),
            queued_bytes: AtomicUsize::new(0),
            created_at: Utc::now(),
        };

        self.by_id.write().await.insert(connection_id, entry);
        self.by_user
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(connection_id);

        (connection_id, close_rx)
    }

    /// Ask the connection's writer task to close the socket with `code` at
    /// its next opportunity. Fire-and-forget: if the connection is already
    /// gone there is nothing to signal.
    pub async fn request_close(&self, connection_id: ConnectionId, code: u16) {
        if let Some(entry) = self.by_id.read().await.get(&connection_id) {
            let _ = entry.close_tx.send(Some(CloseSignal { code }));
        }
    }

    /// Remove a connection from both maps. Idempotent; returns the previous
    /// user id if one was registered.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Option<Uuid> {
        let user_id = self.by_id.write().await.remove(&connection_id)?.user_id;

        let mut by_user = self.by_user.write().await;
        if let Some(set) = by_user.get_mut(&user_id) {
            set.remove(&connection_id);
            if set.is_empty() {
                by_user.remove(&user_id);
            }
        }

        Some(user_id)
    }

    /// True only if the connection is registered and its outbound channel
    /// has not been closed.
    pub async fn has_open(&self, connection_id: ConnectionId) -> bool {
        self.by_id
            .read()
            .await
            .get(&connection_id)
            .map(|e| !e.tx.is_closed())
            .unwrap_or(false)
    }

    /// Serialise `message` once, write one frame, and report the outcome.
    /// Never blocks: the underlying channel is unbounded, so a slow
    /// consumer is detected via the queued-byte counter rather than by the
    /// channel applying backpressure itself.
    pub async fn send<T: serde::Serialize>(
        &self,
        connection_id: ConnectionId,
        message: &T,
    ) -> SendOutcome {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = ?e, "failed to serialize outbound message");
                return SendOutcome::NotConnected;
            }
        };
        self.send_raw(connection_id, json).await
    }

    async fn send_raw(&self, connection_id: ConnectionId, json: String) -> SendOutcome {
        let by_id = self.by_id.read().await;
        let Some(entry) = by_id.get(&connection_id) else {
            return SendOutcome::NotConnected;
        };

        let new_total = entry
            .queued_bytes
            .fetch_add(json.len(), Ordering::SeqCst)
            + json.len();
        if new_total > self.outbound_byte_cap {
            let _ = entry
                .close_tx
                .send(Some(CloseSignal { code: 1011 }));
            return SendOutcome::Backpressure;
        }

        match entry.tx.send(json) {
            Ok(()) => SendOutcome::Sent,
            Err(_) => SendOutcome::NotConnected,
        }
    }

    /// Called by the writer task after a frame has actually been flushed to
    /// the socket, so the queued-byte counter reflects what is still
    /// in-flight rather than everything ever enqueued.
    pub async fn ack_sent(&self, connection_id: ConnectionId, bytes: usize) {
        if let Some(entry) = self.by_id.read().await.get(&connection_id) {
            entry.queued_bytes.fetch_sub(bytes, Ordering::SeqCst);
        }
    }

    /// Best-effort fan-out to every id in `connection_ids`. No ordering
    /// guarantee across connections (spec section 4.2).
    pub async fn broadcast<T: serde::Serialize>(
        &self,
        connection_ids: &[ConnectionId],
        message: &T,
    ) -> usize {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = ?e, "failed to serialize broadcast message");
                return 0;
            }
        };

        let mut sent = 0;
        for &id in connection_ids {
            if self.send_raw(id, json.clone()).await == SendOutcome::Sent {
                sent += 1;
            }
        }
        sent
    }

    pub async fn update_token_expiry(&self, connection_id: ConnectionId, new_expiry: i64) {
        if let Some(entry) = self.by_id.read().await.get(&connection_id) {
            entry.token_expiry.store(new_expiry, Ordering::SeqCst);
        }
    }

    pub async fn get_connections_for_user(&self, user_id: Uuid) -> HashSet<ConnectionId> {
        self.by_user
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// All connection ids currently live on this pod — used by the
    /// heartbeat writer to claim them in the shared heartbeat table.
    pub async fn all_connection_ids(&self) -> Vec<ConnectionId> {
        self.by_id.read().await.keys().copied().collect()
    }

    pub async fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connections: self.by_id.read().await.len(),
            users: self.by_user.read().await.len(),
        }
    }

    /// Invariant I2 (spec section 3): connections whose token has expired
    /// must be closed. Returns the ids to close; the caller (a background
    /// sweep) is responsible for sending the close frame and then calling
    /// `disconnect`.
    pub async fn expired_connections(&self, now: chrono::DateTime<Utc>) -> Vec<ConnectionId> {
        let now_ts = now.timestamp();
        self.by_id
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.token_expiry.load(Ordering::SeqCst) <= now_ts)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Connections whose token expires within `window` of `now` but has not
    /// yet expired — used to emit `TOKEN_EXPIRING_SOON` (spec section 4.8).
    pub async fn connections_expiring_within(
        &self,
        now: chrono::DateTime<Utc>,
        window: Duration,
    ) -> Vec<(ConnectionId, i64)> {
        let now_ts = now.timestamp();
        let horizon = now_ts + window.as_secs() as i64;
        self.by_id
            .read()
            .await
            .iter()
            .filter_map(|(id, e)| {
                let exp = e.token_expiry.load(Ordering::SeqCst);
                (exp > now_ts && exp <= horizon).then_some((*id, exp))
            })
            .collect()
    }
}
