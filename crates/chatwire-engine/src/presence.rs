//! Presence and lifecycle tracking.
//!
//! The tracker is the only entry point that changes membership on behalf of
//! a client. It pairs every membership change with its presence
//! notification under the same channel lock, and it is the registry's close
//! listener, so closing a connection from anywhere tears down its
//! memberships and tells the remaining members.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatwire_core::{ChannelId, ConnectionId, HubError, PresenceKind, Seq, ServerEvent};
use chatwire_telemetry::MetricsRecorder;
use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::channels::ChannelManager;
use crate::registry::{CloseListener, CloseReason, Connection, ConnectionRegistry, ConnectionState};
use crate::router::MessageRouter;
use crate::transport::Transport;

/// Buffered lifecycle events per subscriber before it starts lagging.
const LIFECYCLE_BUFFER: usize = 256;

/// Connection lifecycle transitions, published for observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected {
        connection: ConnectionId,
    },
    Activated {
        connection: ConnectionId,
    },
    Joined {
        connection: ConnectionId,
        channel: ChannelId,
    },
    Left {
        connection: ConnectionId,
        channel: ChannelId,
    },
    Closed {
        connection: ConnectionId,
        reason: CloseReason,
    },
}

pub struct LifecycleTracker {
    registry: Arc<ConnectionRegistry>,
    channels: Arc<ChannelManager>,
    router: Arc<MessageRouter>,
    events: broadcast::Sender<LifecycleEvent>,
    metrics: Arc<MetricsRecorder>,
}

impl LifecycleTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        channels: Arc<ChannelManager>,
        router: Arc<MessageRouter>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let (events, _) = broadcast::channel(LIFECYCLE_BUFFER);
        Self {
            registry,
            channels,
            router,
            events,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn publish_event(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Accept a new transport. The connection starts in CONNECTING.
    pub fn connect(&self, transport: Arc<dyn Transport>) -> Result<Arc<Connection>, HubError> {
        let id = self.registry.register(transport)?;
        let conn = self.registry.lookup(&id)?;
        info!(connection = %id, "client connected");
        self.publish_event(LifecycleEvent::Connected { connection: id });
        Ok(conn)
    }

    /// CONNECTING -> ACTIVE. Queues the `welcome` frame.
    pub fn activate(&self, id: &ConnectionId) -> Result<Arc<Connection>, HubError> {
        let conn = self.registry.activate(id)?;
        self.router.send_direct(
            &conn,
            ServerEvent::Welcome {
                connection: id.clone(),
            },
        );
        self.publish_event(LifecycleEvent::Activated {
            connection: id.clone(),
        });
        Ok(conn)
    }

    /// Join a channel by name. Every member, the joiner included, is told.
    pub async fn join(&self, id: &ConnectionId, name: &str) -> Result<ChannelId, HubError> {
        let conn = self.registry.lookup(id)?;
        let channel = ChannelId::parse(name)?;
        cancellable(&conn, async {
            let mut guard = self.channels.join_locked(&conn, &channel).await?;
            self.router
                .emit_presence(&mut guard, id, PresenceKind::Joined);
            Ok::<_, HubError>(())
        })
        .await?;
        debug!(connection = %id, channel = %channel, "joined channel");
        self.publish_event(LifecycleEvent::Joined {
            connection: id.clone(),
            channel: channel.clone(),
        });
        Ok(channel)
    }

    /// Leave a channel by name. Remaining members are told.
    pub async fn leave(&self, id: &ConnectionId, name: &str) -> Result<ChannelId, HubError> {
        let conn = self.registry.lookup(id)?;
        let channel = ChannelId::parse(name)?;
        cancellable(&conn, async {
            let mut guard = self.channels.leave_locked(&conn, &channel).await?;
            self.router.emit_presence(&mut guard, id, PresenceKind::Left);
            Ok::<_, HubError>(())
        })
        .await?;
        debug!(connection = %id, channel = %channel, "left channel");
        self.publish_event(LifecycleEvent::Left {
            connection: id.clone(),
            channel: channel.clone(),
        });
        Ok(channel)
    }

    /// Publish a message on behalf of `id`.
    pub async fn publish(
        &self,
        id: &ConnectionId,
        name: &str,
        payload: String,
    ) -> Result<(ChannelId, Seq), HubError> {
        let conn = self.registry.lookup(id)?;
        let channel = ChannelId::parse(name)?;
        let seq = cancellable(&conn, self.router.publish(id, &channel, payload)).await?;
        Ok((channel, seq))
    }

    /// Close a connection. Idempotent.
    pub async fn disconnect(&self, id: &ConnectionId, reason: CloseReason) -> ConnectionState {
        self.registry.mark_closed(id, reason).await
    }

    /// Close a connection after a fatal error. Errors the connection
    /// survives are treated as transport failures.
    pub async fn fail(&self, id: &ConnectionId, err: &HubError) -> ConnectionState {
        warn!(connection = %id, error = %err, fatal = err.is_fatal(), "connection failed");
        let reason = CloseReason::for_error(err).unwrap_or(CloseReason::TransportError);
        self.disconnect(id, reason).await
    }

    /// Close connections idle for longer than `timeout`.
    pub async fn sweep_idle(&self, timeout: Duration) -> usize {
        let idle = self.registry.idle_connections(timeout);
        let count = idle.len();
        for id in idle {
            info!(connection = %id, "closing idle connection");
            self.disconnect(&id, CloseReason::IdleTimeout).await;
        }
        count
    }

    /// Close every connection, whatever its state.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let ids = self.registry.ids();
        let count = ids.len();
        join_all(ids.iter().map(|id| self.disconnect(id, reason))).await;
        count
    }
}

#[async_trait]
impl CloseListener for LifecycleTracker {
    async fn on_closing(&self, conn: &Arc<Connection>, channels: BTreeSet<ChannelId>) {
        for channel in channels {
            if let Some(mut guard) = self.channels.remove_closing(conn, &channel).await {
                self.router
                    .emit_presence(&mut guard, conn.id(), PresenceKind::Disconnected);
            }
        }
        let reason = conn.close_reason().unwrap_or(CloseReason::ClientClosed);
        info!(connection = %conn.id(), reason = reason.as_str(), "client disconnected");
        self.publish_event(LifecycleEvent::Closed {
            connection: conn.id().clone(),
            reason,
        });
    }
}

/// Run `fut` unless the connection starts closing first.
async fn cancellable<T, F>(conn: &Connection, fut: F) -> Result<T, HubError>
where
    F: Future<Output = Result<T, HubError>>,
{
    let token = conn.cancel_token();
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(HubError::Cancelled),
        result = fut => result,
    }
}
