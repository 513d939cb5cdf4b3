//! Connection registry: identity, lifecycle state, and outbound queues.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chatwire_core::{ChannelId, ConnectionId, HubConfig, HubError, OverflowPolicy};
use chatwire_telemetry::{
    MetricsRecorder, CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL,
    DISCONNECTIONS_TOTAL,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::OutboundQueue;
use crate::transport::Transport;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a connection was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    TransportError,
    SlowConsumer,
    IdleTimeout,
    HeartbeatTimeout,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::SlowConsumer => "slow_consumer",
            Self::IdleTimeout => "idle_timeout",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Shutdown => "shutdown",
        }
    }

    /// Close reason for an error that ends the connection, `None` if the
    /// connection survives it.
    pub fn for_error(err: &HubError) -> Option<Self> {
        if !err.is_fatal() {
            return None;
        }
        Some(match err {
            HubError::SlowConsumerDisconnect(_) => Self::SlowConsumer,
            _ => Self::TransportError,
        })
    }
}

struct Lifecycle {
    state: ConnectionState,
    channels: BTreeSet<ChannelId>,
    close_reason: Option<CloseReason>,
}

/// A single client connection owned by the registry.
pub struct Connection {
    id: ConnectionId,
    connected_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
    last_activity: Mutex<Instant>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    outbound: OutboundQueue,
    cancel: CancellationToken,
    closed: CancellationToken,
}

impl Connection {
    fn new(transport: Arc<dyn Transport>, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            id: ConnectionId::new(),
            connected_at: Utc::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Connecting,
                channels: BTreeSet::new(),
                close_reason: None,
            }),
            last_activity: Mutex::new(Instant::now()),
            transport: Mutex::new(Some(transport)),
            outbound: OutboundQueue::new(capacity, policy),
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lifecycle.lock().close_reason
    }

    /// Channels this connection belongs to, in name order.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.lifecycle.lock().channels.iter().cloned().collect()
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Fires once the connection starts closing.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn activate(&self) -> bool {
        let mut lc = self.lifecycle.lock();
        if lc.state == ConnectionState::Connecting {
            lc.state = ConnectionState::Active;
            true
        } else {
            false
        }
    }

    /// Record membership, but only while ACTIVE. The state check and the
    /// insert happen under the same lock so a concurrent close either sees
    /// the channel or rejects the join.
    pub(crate) fn add_channel_if_active(&self, channel: &ChannelId) -> Result<(), HubError> {
        let mut lc = self.lifecycle.lock();
        if lc.state != ConnectionState::Active {
            return Err(HubError::NotActive(self.id.clone()));
        }
        lc.channels.insert(channel.clone());
        Ok(())
    }

    pub(crate) fn remove_channel(&self, channel: &ChannelId) -> bool {
        self.lifecycle.lock().channels.remove(channel)
    }

    /// Move to CLOSING. Returns the channels held at that moment, or `None`
    /// if another caller already started closing.
    fn begin_closing(&self, reason: CloseReason) -> Option<BTreeSet<ChannelId>> {
        let mut lc = self.lifecycle.lock();
        if lc.state >= ConnectionState::Closing {
            return None;
        }
        lc.state = ConnectionState::Closing;
        lc.close_reason = Some(reason);
        Some(lc.channels.clone())
    }

    fn finish_closed(&self) {
        {
            let mut lc = self.lifecycle.lock();
            lc.state = ConnectionState::Closed;
            lc.channels.clear();
        }
        self.closed.cancel();
    }

    fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().take()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("queued", &self.outbound.len())
            .finish()
    }
}

/// Hook run while a connection is CLOSING, before its queue and transport
/// are released. Used to pull the connection out of its channels.
#[async_trait]
pub trait CloseListener: Send + Sync {
    async fn on_closing(&self, conn: &Arc<Connection>, channels: BTreeSet<ChannelId>);
}

/// Registry of every live connection.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    live: AtomicUsize,
    max_connections: usize,
    queue_capacity: usize,
    overflow_policy: OverflowPolicy,
    listener: RwLock<Option<Weak<dyn CloseListener>>>,
    metrics: Arc<MetricsRecorder>,
}

impl ConnectionRegistry {
    pub fn new(config: &HubConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            connections: DashMap::new(),
            live: AtomicUsize::new(0),
            max_connections: config.max_connections,
            queue_capacity: config.outbound_queue_capacity,
            overflow_policy: config.overflow_policy,
            listener: RwLock::new(None),
            metrics,
        }
    }

    pub fn set_close_listener(&self, listener: Weak<dyn CloseListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Admit a new connection in CONNECTING state.
    pub fn register(&self, transport: Arc<dyn Transport>) -> Result<ConnectionId, HubError> {
        let limit = self.max_connections;
        let admitted = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1));
        if admitted.is_err() {
            self.metrics.counter_inc(CONNECTIONS_REJECTED_TOTAL, &[], 1);
            warn!(limit, "connection rejected at capacity");
            return Err(HubError::CapacityExceeded { limit });
        }

        let conn = Arc::new(Connection::new(
            transport,
            self.queue_capacity,
            self.overflow_policy,
        ));
        let id = conn.id.clone();
        self.connections.insert(id.clone(), conn);

        self.metrics.counter_inc(CONNECTIONS_TOTAL, &[], 1);
        self.metrics.gauge_inc(CONNECTIONS_ACTIVE, &[], 1.0);
        debug!(connection = %id, "connection registered");
        Ok(id)
    }

    /// CONNECTING -> ACTIVE.
    pub fn activate(&self, id: &ConnectionId) -> Result<Arc<Connection>, HubError> {
        let conn = self.lookup(id)?;
        if !conn.activate() {
            return Err(HubError::NotActive(id.clone()));
        }
        debug!(connection = %id, "connection active");
        Ok(conn)
    }

    pub fn lookup(&self, id: &ConnectionId) -> Result<Arc<Connection>, HubError> {
        self.connections
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HubError::ConnectionNotFound(id.clone()))
    }

    /// Snapshot of ACTIVE connections. Entries are filtered lazily, so a
    /// connection that starts closing mid-iteration is skipped.
    pub fn list_active(&self) -> impl Iterator<Item = Arc<Connection>> {
        let snapshot: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        snapshot.into_iter().filter(|conn| conn.is_active())
    }

    /// Ids of every registered connection, whatever its state.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn touch(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            conn.touch();
        }
    }

    /// ACTIVE connections with no activity for longer than `timeout`.
    pub fn idle_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.list_active()
            .filter(|conn| conn.idle_for() > timeout)
            .map(|conn| conn.id.clone())
            .collect()
    }

    /// Connections admitted and not yet fully closed.
    pub fn count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Close a connection. Idempotent: only the first call for an id does
    /// any work; a call that overlaps it waits until it reaches CLOSED.
    pub async fn mark_closed(&self, id: &ConnectionId, reason: CloseReason) -> ConnectionState {
        let Some(conn) = self.connections.get(id).map(|e| Arc::clone(e.value())) else {
            return ConnectionState::Closed;
        };
        let Some(channels) = conn.begin_closing(reason) else {
            conn.closed.cancelled().await;
            return ConnectionState::Closed;
        };
        conn.cancel.cancel();

        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.on_closing(&conn, channels).await;
        }

        let discarded = conn.outbound.close();
        if let Some(transport) = conn.take_transport() {
            transport.close();
        }
        conn.finish_closed();

        if self.connections.remove(id).is_some() {
            self.live.fetch_sub(1, Ordering::AcqRel);
            self.metrics.gauge_inc(CONNECTIONS_ACTIVE, &[], -1.0);
        }
        self.metrics
            .counter_inc(DISCONNECTIONS_TOTAL, &[("reason", reason.as_str())], 1);
        info!(
            connection = %id,
            reason = reason.as_str(),
            discarded,
            dropped = conn.outbound.dropped(),
            "connection closed"
        );
        ConnectionState::Closed
    }
}
