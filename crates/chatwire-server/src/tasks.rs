use std::sync::Arc;
use std::time::Duration;

use chatwire_engine::Hub;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Periodically destroy expired channels and close idle connections.
pub fn start_sweeper(hub: Arc<Hub>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = hub.sweep().await;
                    if report.channels_destroyed > 0 || report.idle_closed > 0 {
                        info!(
                            channels_destroyed = report.channels_destroyed,
                            idle_closed = report.idle_closed,
                            "sweep"
                        );
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}
