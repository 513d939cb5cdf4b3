//! WebSocket adapter for the engine's transport boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use chatwire_core::TransportError;
use chatwire_engine::{InboundEvent, Transport};
use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Deadline for the closing handshake frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Write half of a WebSocket.
pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    send_timeout: Duration,
    closed: CancellationToken,
    alive: AtomicBool,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, WsMessage>, send_timeout: Duration) -> Self {
        Self {
            sink: Mutex::new(sink),
            send_timeout,
            closed: CancellationToken::new(),
            alive: AtomicBool::new(true),
        }
    }

    async fn write(&self, message: WsMessage, deadline: Duration) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        };
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::Closed),
            result = tokio::time::timeout(deadline, write) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(TransportError::Write(e.to_string())),
                Err(_) => Err(TransportError::Timeout(deadline)),
            },
        }
    }

    pub async fn ping(&self) -> Result<(), TransportError> {
        self.write(WsMessage::Ping(Bytes::new()), self.send_timeout).await
    }

    pub fn record_pong(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Whether a pong arrived since the last check. Resets the flag.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Send a close frame and flush. Best effort.
    pub async fn finish(&self) {
        let mut sink = self.sink.lock().await;
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        })
        .await;
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.write(WsMessage::Text(frame.into()), self.send_timeout).await
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Map the read half into engine inbound events. Pongs feed the heartbeat
/// and never reach the engine.
pub fn inbound_events(
    stream: SplitStream<WebSocket>,
    transport: Arc<WsTransport>,
) -> BoxStream<'static, Result<InboundEvent, TransportError>> {
    stream
        .filter_map(move |message| {
            let transport = Arc::clone(&transport);
            async move {
                match message {
                    Ok(WsMessage::Text(text)) => Some(Ok(InboundEvent::Data(text.to_string()))),
                    Ok(WsMessage::Binary(_)) => Some(Ok(InboundEvent::Unsupported(
                        "binary frames are not supported".into(),
                    ))),
                    Ok(WsMessage::Pong(_)) => {
                        transport.record_pong();
                        None
                    }
                    // axum answers pings itself
                    Ok(WsMessage::Ping(_)) => None,
                    Ok(WsMessage::Close(_)) => Some(Ok(InboundEvent::Close)),
                    Err(e) => Some(Err(TransportError::Read(e.to_string()))),
                }
            }
        })
        .boxed()
}
