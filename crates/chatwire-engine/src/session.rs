//! Per-connection session driver.
//!
//! A session is two tasks: the read loop below, which decodes client frames
//! and dispatches them, and an outbound pump that drains the connection's
//! queue into the transport. Either side ending closes the connection.

use std::sync::Arc;

use chatwire_core::{ClientFrame, ConnectionId, HubError, ServerEvent, TransportError};
use chatwire_telemetry::CLIENT_ERRORS_TOTAL;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::presence::LifecycleTracker;
use crate::registry::{CloseReason, Connection};
use crate::transport::{InboundEvent, Transport};

/// Admit and activate a connection. On rejection the client gets an
/// `error` frame and the transport is closed.
pub async fn open_session(
    tracker: &LifecycleTracker,
    transport: Arc<dyn Transport>,
) -> Result<Arc<Connection>, HubError> {
    let conn = match tracker.connect(Arc::clone(&transport)) {
        Ok(conn) => conn,
        Err(e) => {
            if let Ok(frame) = ServerEvent::error(&e, None).encode() {
                let _ = transport.send(frame).await;
            }
            transport.close();
            return Err(e);
        }
    };
    match tracker.activate(conn.id()) {
        Ok(conn) => Ok(conn),
        Err(e) => {
            tracker.disconnect(conn.id(), CloseReason::ClientClosed).await;
            Err(e)
        }
    }
}

/// Drive an open session until the client goes away or the connection is
/// closed from elsewhere. Returns once the connection is CLOSED.
pub async fn run_session<S>(
    tracker: Arc<LifecycleTracker>,
    conn: Arc<Connection>,
    transport: Arc<dyn Transport>,
    mut inbound: S,
) where
    S: Stream<Item = Result<InboundEvent, TransportError>> + Unpin + Send,
{
    let pump = tokio::spawn(outbound_pump(
        Arc::clone(&tracker),
        Arc::clone(&conn),
        transport,
    ));

    let token = conn.cancel_token();
    let mut reason = CloseReason::ClientClosed;
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = inbound.next() => next,
        };
        match next {
            None | Some(Ok(InboundEvent::Close)) => break,
            Some(Err(e)) => {
                debug!(connection = %conn.id(), error = %e, "inbound stream failed");
                reason = CloseReason::TransportError;
                break;
            }
            Some(Ok(InboundEvent::Unsupported(kind))) => {
                conn.touch();
                reply_error(&tracker, &conn, HubError::InvalidFrame(kind), None);
            }
            Some(Ok(InboundEvent::Data(text))) => {
                conn.touch();
                dispatch(&tracker, &conn, &text).await;
            }
        }
    }

    tracker.disconnect(conn.id(), reason).await;
    if let Err(e) = pump.await {
        warn!(connection = %conn.id(), error = %e, "outbound pump panicked");
    }
}

/// Open a session and drive it to completion.
pub async fn serve_connection<S>(
    tracker: Arc<LifecycleTracker>,
    transport: Arc<dyn Transport>,
    inbound: S,
) -> Option<ConnectionId>
where
    S: Stream<Item = Result<InboundEvent, TransportError>> + Unpin + Send,
{
    let conn = open_session(&tracker, Arc::clone(&transport)).await.ok()?;
    let id = conn.id().clone();
    run_session(tracker, conn, transport, inbound).await;
    Some(id)
}

async fn outbound_pump(
    tracker: Arc<LifecycleTracker>,
    conn: Arc<Connection>,
    transport: Arc<dyn Transport>,
) {
    while let Some(event) = conn.outbound().pop().await {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection = %conn.id(), error = %e, "failed to encode frame");
                continue;
            }
        };
        if let Err(e) = transport.send(frame).await {
            tracker.fail(conn.id(), &HubError::from(e)).await;
            break;
        }
    }
}

async fn dispatch(tracker: &LifecycleTracker, conn: &Connection, text: &str) {
    let frame = match ClientFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            reply_error(tracker, conn, e, None);
            return;
        }
    };
    let request_id = frame.request_id().map(str::to_owned);
    let op = frame.op();
    let id = conn.id();

    let result = match frame {
        ClientFrame::Join { channel, .. } => tracker
            .join(id, &channel)
            .await
            .map(|channel| (Some(channel), None)),
        ClientFrame::Leave { channel, .. } => tracker
            .leave(id, &channel)
            .await
            .map(|channel| (Some(channel), None)),
        ClientFrame::Send {
            channel, payload, ..
        } => tracker
            .publish(id, &channel, payload)
            .await
            .map(|(channel, seq)| (Some(channel), Some(seq))),
        ClientFrame::Ping { .. } => {
            tracker
                .router()
                .send_direct(conn, ServerEvent::Pong { id: request_id });
            return;
        }
    };

    match result {
        Ok((channel, seq)) => {
            tracker.router().send_direct(
                conn,
                ServerEvent::Ack {
                    id: request_id,
                    op,
                    channel,
                    seq,
                },
            );
        }
        Err(e) => reply_error(tracker, conn, e, request_id),
    }
}

fn reply_error(
    tracker: &LifecycleTracker,
    conn: &Connection,
    err: HubError,
    request_id: Option<String>,
) {
    debug!(
        connection = %conn.id(),
        code = err.code(),
        retryable = err.is_retryable(),
        error = %err,
        "client request rejected"
    );
    tracker
        .metrics()
        .counter_inc(CLIENT_ERRORS_TOTAL, &[("code", err.code())], 1);
    tracker
        .router()
        .send_direct(conn, ServerEvent::error(&err, request_id));
}
