//! Channel manager: named groups of connections with per-channel ordering.
//!
//! Each channel's state sits behind its own async mutex. Everything that
//! must be ordered within a channel (membership changes, sequence
//! assignment, fan-out) happens while holding that lock, so all members
//! observe the same order. Unrelated channels never contend.

use std::sync::Arc;
use std::time::Duration;

use chatwire_core::{ChannelId, ConnectionId, DestroyPolicy, HubConfig, HubError, Seq};
use chatwire_telemetry::{MetricsRecorder, CHANNELS_ACTIVE};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::registry::Connection;

struct ChannelState {
    /// Members in join order. Fan-out walks this list.
    members: Vec<Arc<Connection>>,
    next_seq: Seq,
    next_presence_seq: Seq,
    empty_since: Option<Instant>,
    /// Set once the channel has been removed from the map. A task that
    /// raced the removal and still holds the old `Arc` must start over.
    retired: bool,
}

pub struct Channel {
    id: ChannelId,
    created_at: DateTime<Utc>,
    state: Arc<Mutex<ChannelState>>,
}

impl Channel {
    fn new(id: ChannelId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: Arc::new(Mutex::new(ChannelState {
                members: Vec::new(),
                next_seq: 1,
                next_presence_seq: 1,
                empty_since: None,
                retired: false,
            })),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Exclusive access to one channel's state.
pub struct ChannelGuard {
    id: ChannelId,
    state: OwnedMutexGuard<ChannelState>,
}

impl ChannelGuard {
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn members(&self) -> &[Arc<Connection>] {
        &self.state.members
    }

    pub fn member_ids(&self) -> Vec<ConnectionId> {
        self.state.members.iter().map(|c| c.id().clone()).collect()
    }

    pub fn is_member(&self, id: &ConnectionId) -> bool {
        self.state.members.iter().any(|c| c.id() == id)
    }

    pub fn len(&self) -> usize {
        self.state.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.members.is_empty()
    }

    /// Claim the next message sequence number.
    pub fn assign_seq(&mut self) -> Seq {
        let seq = self.state.next_seq;
        self.state.next_seq += 1;
        seq
    }

    /// Claim the next presence sequence number.
    pub fn assign_presence_seq(&mut self) -> Seq {
        let seq = self.state.next_presence_seq;
        self.state.next_presence_seq += 1;
        seq
    }

    /// Sequence number the next message will get.
    pub fn peek_seq(&self) -> Seq {
        self.state.next_seq
    }
}

/// Point-in-time description of a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub created_at: DateTime<Utc>,
    pub members: usize,
    pub next_seq: Seq,
}

pub struct ChannelManager {
    channels: DashMap<ChannelId, Arc<Channel>>,
    destroy_policy: DestroyPolicy,
    lock_timeout: Duration,
    metrics: Arc<MetricsRecorder>,
}

impl ChannelManager {
    pub fn new(config: &HubConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            channels: DashMap::new(),
            destroy_policy: config.channel_destroy_policy,
            lock_timeout: config.lock_timeout(),
            metrics,
        }
    }

    async fn lock(&self, channel: &Channel) -> Result<ChannelGuard, HubError> {
        let state = tokio::time::timeout(self.lock_timeout, Arc::clone(&channel.state).lock_owned())
            .await
            .map_err(|_| HubError::LockTimeout(self.lock_timeout, channel.id.clone()))?;
        Ok(ChannelGuard {
            id: channel.id.clone(),
            state,
        })
    }

    fn get(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Lock an existing channel. Fails with `ChannelNotFound` if it does not
    /// exist or was destroyed while waiting.
    pub async fn lock_existing(&self, id: &ChannelId) -> Result<ChannelGuard, HubError> {
        let channel = self
            .get(id)
            .ok_or_else(|| HubError::ChannelNotFound(id.clone()))?;
        let guard = self.lock(&channel).await?;
        if guard.state.retired {
            return Err(HubError::ChannelNotFound(id.clone()));
        }
        Ok(guard)
    }

    /// Add `conn` to `id`, creating the channel on first use. Returns the
    /// still-held guard so the caller can emit presence in order.
    pub async fn join_locked(
        &self,
        conn: &Arc<Connection>,
        id: &ChannelId,
    ) -> Result<ChannelGuard, HubError> {
        loop {
            let mut created = false;
            let channel = Arc::clone(
                self.channels
                    .entry(id.clone())
                    .or_insert_with(|| {
                        created = true;
                        Arc::new(Channel::new(id.clone()))
                    })
                    .value(),
            );
            if created {
                self.metrics.gauge_inc(CHANNELS_ACTIVE, &[], 1.0);
                debug!(channel = %id, "channel created");
            }

            let mut guard = self.lock(&channel).await?;
            if guard.state.retired {
                continue;
            }
            if guard.is_member(conn.id()) {
                return Err(HubError::AlreadyMember {
                    connection: conn.id().clone(),
                    channel: id.clone(),
                });
            }
            if let Err(e) = conn.add_channel_if_active(id) {
                self.settle_if_empty(&mut guard, &channel);
                return Err(e);
            }
            guard.state.members.push(Arc::clone(conn));
            guard.state.empty_since = None;
            return Ok(guard);
        }
    }

    pub async fn join(&self, conn: &Arc<Connection>, id: &ChannelId) -> Result<(), HubError> {
        self.join_locked(conn, id).await.map(drop)
    }

    /// Remove `conn` from `id`. Returns the still-held guard so the caller
    /// can notify remaining members.
    pub async fn leave_locked(
        &self,
        conn: &Connection,
        id: &ChannelId,
    ) -> Result<ChannelGuard, HubError> {
        let not_member = || HubError::NotMember {
            connection: conn.id().clone(),
            channel: id.clone(),
        };
        let channel = self.get(id).ok_or_else(not_member)?;
        let mut guard = self.lock(&channel).await?;
        if guard.state.retired {
            return Err(not_member());
        }
        let position = guard
            .state
            .members
            .iter()
            .position(|c| c.id() == conn.id())
            .ok_or_else(not_member)?;
        guard.state.members.remove(position);
        conn.remove_channel(id);
        self.settle_if_empty(&mut guard, &channel);
        Ok(guard)
    }

    pub async fn leave(&self, conn: &Connection, id: &ChannelId) -> Result<(), HubError> {
        self.leave_locked(conn, id).await.map(drop)
    }

    /// Remove a closing connection from `id`. Waits for the channel lock
    /// with no deadline: close is one-way and must not leave the member
    /// behind. `None` if it was not a member.
    pub async fn remove_closing(&self, conn: &Connection, id: &ChannelId) -> Option<ChannelGuard> {
        let channel = self.get(id)?;
        let mut guard = ChannelGuard {
            id: channel.id.clone(),
            state: Arc::clone(&channel.state).lock_owned().await,
        };
        if guard.state.retired {
            return None;
        }
        let position = guard
            .state
            .members
            .iter()
            .position(|c| c.id() == conn.id())?;
        guard.state.members.remove(position);
        conn.remove_channel(id);
        self.settle_if_empty(&mut guard, &channel);
        Some(guard)
    }

    /// Apply the destroy policy to a channel that may have just emptied.
    fn settle_if_empty(&self, guard: &mut ChannelGuard, channel: &Arc<Channel>) {
        if !guard.state.members.is_empty() {
            return;
        }
        if guard.state.empty_since.is_none() {
            guard.state.empty_since = Some(Instant::now());
        }
        if self.destroy_policy == DestroyPolicy::Immediate {
            self.retire(guard, channel);
        }
    }

    fn retire(&self, guard: &mut ChannelGuard, channel: &Arc<Channel>) {
        guard.state.retired = true;
        let removed = self
            .channels
            .remove_if(&channel.id, |_, current| Arc::ptr_eq(current, channel));
        if removed.is_some() {
            self.metrics.gauge_inc(CHANNELS_ACTIVE, &[], -1.0);
            debug!(channel = %channel.id, "channel destroyed");
        }
    }

    pub async fn members_of(&self, id: &ChannelId) -> Result<Vec<ConnectionId>, HubError> {
        Ok(self.lock_existing(id).await?.member_ids())
    }

    pub fn channels_of(&self, conn: &Connection) -> Vec<ChannelId> {
        conn.channels()
    }

    pub async fn channel_info(&self, id: &ChannelId) -> Result<ChannelInfo, HubError> {
        let channel = self
            .get(id)
            .ok_or_else(|| HubError::ChannelNotFound(id.clone()))?;
        let guard = self.lock(&channel).await?;
        if guard.state.retired {
            return Err(HubError::ChannelNotFound(id.clone()));
        }
        Ok(ChannelInfo {
            id: id.clone(),
            created_at: channel.created_at,
            members: guard.len(),
            next_seq: guard.peek_seq(),
        })
    }

    /// Destroy empty channels whose delayed TTL has run out. Channels that
    /// are busy are left for the next sweep.
    pub fn sweep_expired(&self) -> usize {
        let Some(ttl) = self.destroy_policy.ttl() else {
            return 0;
        };
        let candidates: Vec<Arc<Channel>> = self
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut destroyed = 0;
        for channel in candidates {
            let Ok(state) = Arc::clone(&channel.state).try_lock_owned() else {
                continue;
            };
            let mut guard = ChannelGuard {
                id: channel.id.clone(),
                state,
            };
            let expired = !guard.state.retired
                && guard.state.members.is_empty()
                && guard
                    .state
                    .empty_since
                    .is_some_and(|since| since.elapsed() >= ttl);
            if expired {
                self.retire(&mut guard, &channel);
                destroyed += 1;
            }
        }
        destroyed
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.contains_key(id)
    }
}
