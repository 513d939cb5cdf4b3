//! Message router: sequencing and fan-out.

use std::sync::Arc;

use chatwire_core::{
    ChannelId, ConnectionId, HubConfig, HubError, Message, OverflowPolicy, PresenceKind, Sender,
    Seq, ServerEvent,
};
use chatwire_telemetry::{
    MetricsRecorder, FANOUT_RECIPIENTS, FRAMES_DROPPED_TOTAL, FRAMES_ENQUEUED_TOTAL,
    MESSAGES_PUBLISHED_TOTAL, SLOW_CONSUMER_DISCONNECTS_TOTAL,
};
use chrono::Utc;
use tracing::{debug, warn};

use crate::channels::{ChannelGuard, ChannelManager};
use crate::queue::PushOutcome;
use crate::registry::{CloseReason, Connection, ConnectionRegistry};

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    channels: Arc<ChannelManager>,
    max_payload_bytes: usize,
    overflow_policy: OverflowPolicy,
    metrics: Arc<MetricsRecorder>,
}

impl MessageRouter {
    pub fn new(
        config: &HubConfig,
        registry: Arc<ConnectionRegistry>,
        channels: Arc<ChannelManager>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            registry,
            channels,
            max_payload_bytes: config.max_payload_bytes,
            overflow_policy: config.overflow_policy,
            metrics,
        }
    }

    /// Sequence `payload` into `channel` and enqueue it for every member.
    ///
    /// The sequence number is assigned and every member's queue is filled
    /// while the channel lock is held, so all members see the same order.
    /// Enqueueing never waits on a slow consumer.
    pub async fn publish(
        &self,
        sender: &ConnectionId,
        channel: &ChannelId,
        payload: String,
    ) -> Result<Seq, HubError> {
        let not_member = || HubError::NotMember {
            connection: sender.clone(),
            channel: channel.clone(),
        };
        let mut guard = match self.channels.lock_existing(channel).await {
            Ok(guard) => guard,
            Err(HubError::ChannelNotFound(_)) => return Err(not_member()),
            Err(e) => return Err(e),
        };
        let active_member = guard
            .members()
            .iter()
            .any(|c| c.id() == sender && c.is_active());
        if !active_member {
            return Err(not_member());
        }
        if payload.len() > self.max_payload_bytes {
            return Err(HubError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }

        let seq = guard.assign_seq();
        let message = Message {
            sender: Sender::Connection(sender.clone()),
            channel: channel.clone(),
            seq,
            payload,
            timestamp: Utc::now(),
        };
        let recipients = guard.len();
        let evicted = self.fan_out(&guard, Arc::new(message.into_event()));
        drop(guard);

        self.metrics.counter_inc(MESSAGES_PUBLISHED_TOTAL, &[], 1);
        self.metrics
            .histogram_observe(FANOUT_RECIPIENTS, &[], recipients as f64);
        debug!(connection = %sender, channel = %channel, seq, recipients, "message published");

        self.evict(evicted);
        Ok(seq)
    }

    /// Enqueue a presence notification for the channel's current members.
    /// Must be called with the guard returned by the membership change so
    /// the notification is ordered with it.
    pub fn emit_presence(
        &self,
        guard: &mut ChannelGuard,
        connection: &ConnectionId,
        kind: PresenceKind,
    ) -> Seq {
        let seq = guard.assign_presence_seq();
        let event = ServerEvent::Presence {
            channel: guard.id().clone(),
            sender: Sender::System,
            connection: connection.clone(),
            kind,
            seq,
            timestamp: Utc::now(),
        };
        debug!(
            channel = %guard.id(),
            connection = %connection,
            kind = kind.as_str(),
            seq,
            "presence"
        );
        let evicted = self.fan_out(guard, Arc::new(event));
        self.evict(evicted);
        seq
    }

    /// Enqueue a frame for one connection (acks, errors, pongs).
    pub fn send_direct(&self, conn: &Connection, event: ServerEvent) -> PushOutcome {
        let kind = event.kind();
        let outcome = conn.outbound().push(Arc::new(event));
        if self.record(conn, kind, outcome) {
            self.evict(vec![conn.id().clone()]);
        }
        outcome
    }

    /// Push one frame into every member's queue. Returns the members whose
    /// queue overflowed under `disconnect_slow_consumer`; their queues are
    /// closed on the spot so they receive nothing further.
    fn fan_out(&self, guard: &ChannelGuard, event: Arc<ServerEvent>) -> Vec<ConnectionId> {
        let kind = event.kind();
        let mut evicted = Vec::new();
        for member in guard.members() {
            let outcome = member.outbound().push(Arc::clone(&event));
            if self.record(member, kind, outcome) {
                evicted.push(member.id().clone());
            }
        }
        evicted
    }

    /// Record metrics for a push. Returns true if the connection must be
    /// disconnected.
    fn record(&self, conn: &Connection, kind: &str, outcome: PushOutcome) -> bool {
        match outcome {
            PushOutcome::Enqueued => {
                self.metrics
                    .counter_inc(FRAMES_ENQUEUED_TOTAL, &[("kind", kind)], 1);
                false
            }
            PushOutcome::DroppedOldest | PushOutcome::DroppedNewest => {
                if outcome == PushOutcome::DroppedOldest {
                    self.metrics
                        .counter_inc(FRAMES_ENQUEUED_TOTAL, &[("kind", kind)], 1);
                }
                self.metrics.counter_inc(
                    FRAMES_DROPPED_TOTAL,
                    &[("policy", policy_label(self.overflow_policy))],
                    1,
                );
                debug!(connection = %conn.id(), kind, "outbound queue full, frame dropped");
                false
            }
            PushOutcome::Overflow => {
                conn.outbound().close();
                true
            }
            PushOutcome::Closed => false,
        }
    }

    /// Close slow consumers off the caller's path.
    fn evict(&self, evicted: Vec<ConnectionId>) {
        for id in evicted {
            let err = HubError::SlowConsumerDisconnect(id.clone());
            warn!(connection = %id, error = %err, "slow consumer, disconnecting");
            self.metrics
                .counter_inc(SLOW_CONSUMER_DISCONNECTS_TOTAL, &[], 1);
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                if let Ok(conn) = registry.lookup(&id) {
                    send_final_error(&conn, &err).await;
                }
                let reason = CloseReason::for_error(&err).unwrap_or(CloseReason::SlowConsumer);
                registry.mark_closed(&id, reason).await;
            });
        }
    }
}

/// Write an error frame straight to the transport, past the full queue.
async fn send_final_error(conn: &Connection, err: &HubError) {
    let Some(transport) = conn.transport() else {
        return;
    };
    match ServerEvent::error(err, None).encode() {
        Ok(frame) => {
            if let Err(e) = transport.send(frame).await {
                debug!(connection = %conn.id(), error = %e, "final error frame not delivered");
            }
        }
        Err(e) => warn!(connection = %conn.id(), error = %e, "failed to encode error frame"),
    }
}

fn policy_label(policy: OverflowPolicy) -> &'static str {
    match policy {
        OverflowPolicy::DropOldest => "drop_oldest",
        OverflowPolicy::DropNewest => "drop_newest",
        OverflowPolicy::DisconnectSlowConsumer => "disconnect_slow_consumer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use chatwire_core::DestroyPolicy;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        channels: Arc<ChannelManager>,
        router: MessageRouter,
        metrics: Arc<MetricsRecorder>,
    }

    fn fixture(config: HubConfig) -> Fixture {
        let metrics = Arc::new(MetricsRecorder::new());
        let registry = Arc::new(ConnectionRegistry::new(&config, metrics.clone()));
        let channels = Arc::new(ChannelManager::new(&config, metrics.clone()));
        let router = MessageRouter::new(&config, registry.clone(), channels.clone(), metrics.clone());
        Fixture {
            registry,
            channels,
            router,
            metrics,
        }
    }

    impl Fixture {
        fn active(&self) -> Arc<Connection> {
            let id = self
                .registry
                .register(Arc::new(MemoryTransport::new()))
                .unwrap();
            self.registry.activate(&id).unwrap()
        }
    }

    fn general() -> ChannelId {
        ChannelId::parse("general").unwrap()
    }

    fn seqs(conn: &Connection) -> Vec<Seq> {
        conn.outbound()
            .snapshot()
            .iter()
            .filter_map(|e| match e.as_ref() {
                ServerEvent::Message { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn publish_assigns_increasing_sequence() {
        let f = fixture(HubConfig::default());
        let a = f.active();
        f.channels.join(&a, &general()).await.unwrap();
        for expected in 1..=3 {
            let seq = f
                .router
                .publish(a.id(), &general(), format!("m{expected}"))
                .await
                .unwrap();
            assert_eq!(seq, expected);
        }
        assert_eq!(seqs(&a), vec![1, 2, 3]);
        assert_eq!(f.metrics.counter_get(MESSAGES_PUBLISHED_TOTAL, &[]), 3);
    }

    #[tokio::test]
    async fn publish_requires_membership() {
        let f = fixture(HubConfig::default());
        let a = f.active();
        let b = f.active();
        let err = f.router.publish(a.id(), &general(), "hi".into()).await.unwrap_err();
        assert!(matches!(err, HubError::NotMember { .. }));

        f.channels.join(&b, &general()).await.unwrap();
        let err = f.router.publish(a.id(), &general(), "hi".into()).await.unwrap_err();
        assert!(matches!(err, HubError::NotMember { .. }));
        assert!(seqs(&b).is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_without_consuming_seq() {
        let f = fixture(HubConfig {
            max_payload_bytes: 4,
            ..HubConfig::default()
        });
        let a = f.active();
        f.channels.join(&a, &general()).await.unwrap();
        let err = f
            .router
            .publish(a.id(), &general(), "too long".into())
            .await
            .unwrap_err();
        assert_eq!(err, HubError::PayloadTooLarge { size: 8, limit: 4 });
        assert_eq!(f.router.publish(a.id(), &general(), "ok".into()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn payload_limit_is_inclusive() {
        let f = fixture(HubConfig {
            max_payload_bytes: 2,
            ..HubConfig::default()
        });
        let a = f.active();
        f.channels.join(&a, &general()).await.unwrap();
        assert!(f.router.publish(a.id(), &general(), "ok".into()).await.is_ok());
    }

    #[tokio::test]
    async fn drop_oldest_keeps_latest_messages() {
        let f = fixture(HubConfig {
            outbound_queue_capacity: 2,
            overflow_policy: OverflowPolicy::DropOldest,
            ..HubConfig::default()
        });
        let a = f.active();
        f.channels.join(&a, &general()).await.unwrap();
        for payload in ["one", "two", "three"] {
            f.router.publish(a.id(), &general(), payload.into()).await.unwrap();
        }
        assert_eq!(seqs(&a), vec![2, 3]);
        assert_eq!(
            f.metrics
                .counter_get(FRAMES_DROPPED_TOTAL, &[("policy", "drop_oldest")]),
            1
        );
    }

    #[tokio::test]
    async fn drop_newest_keeps_earliest_messages() {
        let f = fixture(HubConfig {
            outbound_queue_capacity: 2,
            overflow_policy: OverflowPolicy::DropNewest,
            ..HubConfig::default()
        });
        let a = f.active();
        f.channels.join(&a, &general()).await.unwrap();
        for payload in ["one", "two", "three"] {
            f.router.publish(a.id(), &general(), payload.into()).await.unwrap();
        }
        assert_eq!(seqs(&a), vec![1, 2]);
    }

    #[tokio::test]
    async fn slow_consumer_is_disconnected_and_others_continue() {
        let f = fixture(HubConfig {
            outbound_queue_capacity: 1,
            overflow_policy: OverflowPolicy::DisconnectSlowConsumer,
            channel_destroy_policy: DestroyPolicy::Immediate,
            ..HubConfig::default()
        });
        let fast = f.active();
        let slow = f.active();
        f.channels.join(&fast, &general()).await.unwrap();
        f.channels.join(&slow, &general()).await.unwrap();

        f.router.publish(fast.id(), &general(), "one".into()).await.unwrap();
        // Drain the fast consumer so only the slow one overflows.
        fast.outbound().pop().await.unwrap();
        f.router.publish(fast.id(), &general(), "two".into()).await.unwrap();

        assert!(slow.outbound().is_closed());
        assert_eq!(seqs(&fast), vec![2]);

        let token = slow.cancel_token();
        tokio::time::timeout(std::time::Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert_eq!(f.metrics.counter_get(SLOW_CONSUMER_DISCONNECTS_TOTAL, &[]), 1);
    }

    #[tokio::test]
    async fn presence_uses_separate_counter() {
        let f = fixture(HubConfig::default());
        let a = f.active();
        let mut guard = f.channels.join_locked(&a, &general()).await.unwrap();
        assert_eq!(f.router.emit_presence(&mut guard, a.id(), PresenceKind::Joined), 1);
        drop(guard);
        assert_eq!(f.router.publish(a.id(), &general(), "hi".into()).await.unwrap(), 1);

        let frames = a.outbound().snapshot();
        assert!(matches!(
            frames[0].as_ref(),
            ServerEvent::Presence { kind: PresenceKind::Joined, seq: 1, sender: Sender::System, .. }
        ));
        assert!(matches!(frames[1].as_ref(), ServerEvent::Message { seq: 1, .. }));
    }

    #[tokio::test]
    async fn send_direct_targets_one_connection() {
        let f = fixture(HubConfig::default());
        let a = f.active();
        let b = f.active();
        let outcome = f.router.send_direct(&a, ServerEvent::Pong { id: None });
        assert_eq!(outcome, PushOutcome::Enqueued);
        assert_eq!(a.outbound().len(), 1);
        assert!(b.outbound().is_empty());
        assert_eq!(
            f.metrics.counter_get(FRAMES_ENQUEUED_TOTAL, &[("kind", "pong")]),
            1
        );
    }
}
