//! Bounded per-connection outbound queue.
//!
//! `tokio::sync::mpsc` cannot evict its oldest element, so the queue is a
//! `VecDeque` behind a short lock plus a `Notify` for the single consumer
//! (the connection's outbound pump). Producers never wait.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chatwire_core::{OverflowPolicy, ServerEvent};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Result of offering a frame to the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// Enqueued after evicting the oldest frame.
    DroppedOldest,
    /// The offered frame was discarded.
    DroppedNewest,
    /// Queue full under `disconnect_slow_consumer`; nothing was enqueued.
    Overflow,
    /// The queue has been closed.
    Closed,
}

struct QueueState {
    frames: VecDeque<Arc<ServerEvent>>,
    closed: bool,
}

pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer a frame. Never blocks.
    pub fn push(&self, frame: Arc<ServerEvent>) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.frames.len() < self.capacity {
                state.frames.push_back(frame);
                PushOutcome::Enqueued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let _ = state.frames.pop_front();
                        state.frames.push_back(frame);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
                    OverflowPolicy::DisconnectSlowConsumer => PushOutcome::Overflow,
                }
            }
        };
        match outcome {
            PushOutcome::Enqueued | PushOutcome::DroppedOldest => {
                if outcome == PushOutcome::DroppedOldest {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                self.notify.notify_one();
            }
            PushOutcome::DroppedNewest => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Overflow | PushOutcome::Closed => {}
        }
        outcome
    }

    /// Next frame, waiting if empty. `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Arc<ServerEvent>> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue, discarding anything still buffered. Returns the
    /// number of frames discarded; `0` on repeated calls.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            let n = state.frames.len();
            state.frames.clear();
            n
        };
        self.notify.notify_one();
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Buffered frames in delivery order, without consuming them.
    pub fn snapshot(&self) -> Vec<Arc<ServerEvent>> {
        self.state.lock().frames.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pong(n: u32) -> Arc<ServerEvent> {
        Arc::new(ServerEvent::Pong {
            id: Some(n.to_string()),
        })
    }

    fn ids(frames: &[Arc<ServerEvent>]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f.as_ref() {
                ServerEvent::Pong { id } => id.clone(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn drop_oldest_keeps_latest() {
        let q = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        assert_eq!(q.push(pong(1)), PushOutcome::Enqueued);
        assert_eq!(q.push(pong(2)), PushOutcome::Enqueued);
        assert_eq!(q.push(pong(3)), PushOutcome::DroppedOldest);
        assert_eq!(ids(&q.snapshot()), vec!["2", "3"]);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn drop_newest_keeps_earliest() {
        let q = OutboundQueue::new(2, OverflowPolicy::DropNewest);
        q.push(pong(1));
        q.push(pong(2));
        assert_eq!(q.push(pong(3)), PushOutcome::DroppedNewest);
        assert_eq!(ids(&q.snapshot()), vec!["1", "2"]);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn disconnect_policy_reports_overflow() {
        let q = OutboundQueue::new(1, OverflowPolicy::DisconnectSlowConsumer);
        assert_eq!(q.push(pong(1)), PushOutcome::Enqueued);
        assert_eq!(q.push(pong(2)), PushOutcome::Overflow);
        assert_eq!(q.len(), 1);
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn close_discards_and_is_idempotent() {
        let q = OutboundQueue::new(4, OverflowPolicy::DropOldest);
        q.push(pong(1));
        q.push(pong(2));
        assert_eq!(q.close(), 2);
        assert_eq!(q.close(), 0);
        assert!(q.is_closed());
        assert!(q.is_empty());
        assert_eq!(q.push(pong(3)), PushOutcome::Closed);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let q = OutboundQueue::new(0, OverflowPolicy::DropNewest);
        assert_eq!(q.capacity(), 1);
        assert_eq!(q.push(pong(1)), PushOutcome::Enqueued);
    }

    #[tokio::test]
    async fn pop_returns_in_order() {
        let q = OutboundQueue::new(8, OverflowPolicy::DropOldest);
        q.push(pong(1));
        q.push(pong(2));
        assert_eq!(ids(&[q.pop().await.unwrap()]), vec!["1"]);
        assert_eq!(ids(&[q.pop().await.unwrap()]), vec!["2"]);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q = Arc::new(OutboundQueue::new(8, OverflowPolicy::DropOldest));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(pong(7));
        let frame = consumer.await.unwrap().unwrap();
        assert_eq!(ids(&[frame]), vec!["7"]);
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let q = Arc::new(OutboundQueue::new(8, OverflowPolicy::DropOldest));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert!(consumer.await.unwrap().is_none());
    }
}
