//! Transport boundary consumed by the hub.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chatwire_core::{ServerEvent, TransportError};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Write half of a client connection.
///
/// The registry owns the handle for the lifetime of the connection and
/// releases it on close.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one encoded frame.
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Tear down the underlying connection. Must be idempotent.
    fn close(&self);
}

/// Inbound events produced by the read half.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundEvent {
    Data(String),
    /// A frame the transport cannot carry as text (e.g. binary).
    Unsupported(String),
    Close,
}

/// In-memory transport that records every frame written to it.
#[derive(Default)]
pub struct MemoryTransport {
    frames: Mutex<Vec<String>>,
    closed: AtomicBool,
    fail_writes: AtomicBool,
    written: Notify,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `send` fail with a write error.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Raw frames written so far.
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    /// Written frames decoded back into events.
    pub fn events(&self) -> Vec<ServerEvent> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| serde_json::from_str(f).ok())
            .collect()
    }

    /// Wait until at least `n` frames have been written.
    pub async fn wait_for_frames(&self, n: usize) {
        loop {
            let notified = self.written.notified();
            if self.frames.lock().len() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(TransportError::Write("injected failure".into()));
        }
        self.frames.lock().push(frame);
        self.written.notify_waiters();
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}
