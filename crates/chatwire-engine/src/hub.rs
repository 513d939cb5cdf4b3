use std::sync::Arc;

use chatwire_core::{ConnectionId, HubConfig, HubError, TransportError};
use chatwire_telemetry::MetricsRecorder;
use futures::Stream;
use tokio::time::Instant;
use tracing::info;

use crate::channels::ChannelManager;
use crate::presence::LifecycleTracker;
use crate::registry::{CloseListener, CloseReason, Connection, ConnectionRegistry};
use crate::router::MessageRouter;
use crate::session;
use crate::transport::{InboundEvent, Transport};

/// Outcome of one maintenance pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub channels_destroyed: usize,
    pub idle_closed: usize,
}

/// Point-in-time counts for health reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub capacity: usize,
    pub channels: usize,
}

/// Owns and wires the registry, channel manager, router and tracker.
pub struct Hub {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    channels: Arc<ChannelManager>,
    router: Arc<MessageRouter>,
    tracker: Arc<LifecycleTracker>,
    metrics: Arc<MetricsRecorder>,
    started_at: Instant,
}

impl Hub {
    pub fn new(config: HubConfig, metrics: Arc<MetricsRecorder>) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(&config, Arc::clone(&metrics)));
        let channels = Arc::new(ChannelManager::new(&config, Arc::clone(&metrics)));
        let router = Arc::new(MessageRouter::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&channels),
            Arc::clone(&metrics),
        ));
        let tracker = Arc::new(LifecycleTracker::new(
            Arc::clone(&registry),
            Arc::clone(&channels),
            Arc::clone(&router),
            Arc::clone(&metrics),
        ));
        let listener: Arc<dyn CloseListener> = tracker.clone();
        registry.set_close_listener(Arc::downgrade(&listener));

        info!(
            max_connections = config.max_connections,
            queue_capacity = config.outbound_queue_capacity,
            overflow_policy = ?config.overflow_policy,
            destroy_policy = ?config.channel_destroy_policy,
            "hub ready"
        );

        Arc::new(Self {
            config,
            registry,
            channels,
            router,
            tracker,
            metrics,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
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

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Admit and activate a connection over `transport`.
    pub async fn open(&self, transport: Arc<dyn Transport>) -> Result<Arc<Connection>, HubError> {
        session::open_session(&self.tracker, transport).await
    }

    /// Drive an opened connection until it closes.
    pub async fn run<S>(&self, conn: Arc<Connection>, transport: Arc<dyn Transport>, inbound: S)
    where
        S: Stream<Item = Result<InboundEvent, TransportError>> + Unpin + Send,
    {
        session::run_session(Arc::clone(&self.tracker), conn, transport, inbound).await;
    }

    /// Open and drive a connection. `None` if it was rejected.
    pub async fn serve<S>(&self, transport: Arc<dyn Transport>, inbound: S) -> Option<ConnectionId>
    where
        S: Stream<Item = Result<InboundEvent, TransportError>> + Unpin + Send,
    {
        session::serve_connection(Arc::clone(&self.tracker), transport, inbound).await
    }

    pub async fn disconnect(&self, id: &ConnectionId, reason: CloseReason) {
        self.tracker.disconnect(id, reason).await;
    }

    /// Destroy expired channels and close idle connections.
    pub async fn sweep(&self) -> SweepReport {
        let channels_destroyed = self.channels.sweep_expired();
        let idle_closed = match self.config.idle_timeout() {
            Some(timeout) => self.tracker.sweep_idle(timeout).await,
            None => 0,
        };
        SweepReport {
            channels_destroyed,
            idle_closed,
        }
    }

    /// Close every connection with reason `shutdown`.
    pub async fn shutdown(&self) -> usize {
        let closed = self.tracker.close_all(CloseReason::Shutdown).await;
        info!(closed, "hub shut down");
        closed
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.count(),
            capacity: self.registry.capacity(),
            channels: self.channels.channel_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use chatwire_core::DestroyPolicy;
    use std::time::Duration;

    #[tokio::test]
    async fn open_activates_and_counts() {
        let hub = Hub::new(HubConfig::default(), Arc::new(MetricsRecorder::new()));
        let conn = hub.open(Arc::new(MemoryTransport::new())).await.unwrap();
        assert!(conn.is_active());
        assert_eq!(hub.stats().connections, 1);
    }

    #[tokio::test]
    async fn rejected_open_reports_capacity_to_client() {
        let hub = Hub::new(
            HubConfig {
                max_connections: 1,
                ..HubConfig::default()
            },
            Arc::new(MetricsRecorder::new()),
        );
        let _first = hub.open(Arc::new(MemoryTransport::new())).await.unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let err = hub.open(transport.clone()).await.unwrap_err();
        assert_eq!(err, HubError::CapacityExceeded { limit: 1 });
        assert!(transport.is_closed());
        assert!(transport.frames()[0].contains("CAPACITY_EXCEEDED"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_closes_idle_and_expired() {
        let hub = Hub::new(
            HubConfig {
                idle_timeout_ms: 1_000,
                channel_destroy_policy: DestroyPolicy::Delayed { ttl_ms: 500 },
                ..HubConfig::default()
            },
            Arc::new(MetricsRecorder::new()),
        );
        let conn = hub.open(Arc::new(MemoryTransport::new())).await.unwrap();
        hub.tracker().join(conn.id(), "general").await.unwrap();
        hub.tracker().leave(conn.id(), "general").await.unwrap();

        tokio::time::advance(Duration::from_millis(1_500)).await;
        let report = hub.sweep().await;
        assert_eq!(
            report,
            SweepReport {
                channels_destroyed: 1,
                idle_closed: 1
            }
        );
        assert_eq!(hub.stats().connections, 0);
        assert_eq!(hub.stats().channels, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let hub = Hub::new(HubConfig::default(), Arc::new(MetricsRecorder::new()));
        let transport = Arc::new(MemoryTransport::new());
        let _conn = hub.open(transport.clone()).await.unwrap();
        assert_eq!(hub.shutdown().await, 1);
        assert!(transport.is_closed());
        assert_eq!(hub.stats().connections, 0);
    }
}
