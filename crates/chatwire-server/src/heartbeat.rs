//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::ws::WsTransport;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No pong within the timeout window.
    TimedOut,
    /// A ping could not be written.
    PingFailed,
    /// The connection closed first.
    Cancelled,
}

/// Liveness check and ping target.
pub trait Heartbeat: Send + Sync {
    /// Whether the peer answered since the last call. Resets the flag.
    fn check_alive(&self) -> bool;
    /// Send a ping. `false` if it could not be written.
    fn ping(&self) -> impl std::future::Future<Output = bool> + Send;
}

impl Heartbeat for WsTransport {
    fn check_alive(&self) -> bool {
        WsTransport::check_alive(self)
    }

    async fn ping(&self) -> bool {
        match WsTransport::ping(self).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "ping failed");
                false
            }
        }
    }
}

/// Ping every `interval` and give up after `timeout / interval` (at least
/// one) consecutive ticks without a pong, or on the first failed ping.
pub async fn run_heartbeat<H: Heartbeat>(
    peer: Arc<H>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    // The first tick fires immediately.
    ticker.tick().await;
    let interval_ms = interval.as_millis().max(1);
    let max_missed = (timeout.as_millis() / interval_ms).max(1);
    let mut missed: u128 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if peer.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
                trace!(missed, "sending ping");
                if !peer.ping().await {
                    return HeartbeatResult::PingFailed;
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
