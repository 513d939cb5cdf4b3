use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chatwire_core::{ChannelId, HubConfig, HubError, Seq, ServerConfig};
use chatwire_engine::{CloseReason, Hub};
use chatwire_telemetry::MetricsRecorder;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};
use crate::health::{health_check, HealthResponse};
use crate::heartbeat::{run_heartbeat, HeartbeatResult};
use crate::shutdown::ShutdownCoordinator;
use crate::tasks::start_sweeper;
use crate::ws::{inbound_events, WsTransport};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/channels/{name}", get(channel_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener, start the sweeper and serve until shut down.
pub async fn start(
    config: ServerConfig,
    hub_config: HubConfig,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle> {
    let hub = Hub::new(hub_config, metrics);
    let coordinator = ShutdownCoordinator::new();

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local_addr = listener.local_addr()?;

    let sweeper = start_sweeper(Arc::clone(&hub), config.sweep_interval(), coordinator.token());

    let shutdown_timeout = config.shutdown_timeout();
    let state = AppState {
        hub: Arc::clone(&hub),
        config: Arc::new(config),
    };
    let router = build_router(state);

    info!(
        addr = %local_addr,
        max_connections = hub.stats().capacity,
        "chat server started"
    );

    let token = coordinator.token();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        local_addr,
        hub,
        coordinator,
        tasks: vec![server, sweeper],
        shutdown_timeout,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    local_addr: SocketAddr,
    hub: Arc<Hub>,
    coordinator: ShutdownCoordinator,
    tasks: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Stop accepting, close every connection, then wait for tasks.
    pub async fn shutdown(self) {
        self.coordinator
            .graceful_shutdown(&self.hub, self.tasks, self.shutdown_timeout)
            .await;
        info!("chat server stopped");
    }
}

async fn root_handler() -> &'static str {
    "Chat App API running"
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health_check(state.hub.uptime_secs(), state.hub.stats()))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.metrics().snapshot())
}

#[derive(Debug, Serialize)]
struct ChannelView {
    name: ChannelId,
    created_at: DateTime<Utc>,
    members: usize,
    next_seq: Seq,
}

async fn channel_handler(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    let id = match ChannelId::parse(name) {
        Ok(id) => id,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };
    match state.hub.channels().channel_info(&id).await {
        Ok(info) => Json(ChannelView {
            name: info.id,
            created_at: info.created_at,
            members: info.members,
            next_seq: info.next_seq,
        })
        .into_response(),
        Err(e @ HubError::ChannelNotFound(_)) => error_response(StatusCode::NOT_FOUND, &e),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e),
    }
}

fn error_response(status: StatusCode, err: &HubError) -> Response {
    let body = serde_json::json!({ "code": err.code(), "detail": err.to_string() });
    (status, Json(body)).into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one WebSocket from admission to close.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    let transport = Arc::new(WsTransport::new(sink, state.config.send_timeout()));

    let conn = match state.hub.open(transport.clone()).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(error = %e, "websocket rejected");
            transport.finish().await;
            return;
        }
    };

    let heartbeat = {
        let hub = Arc::clone(&state.hub);
        let id = conn.id().clone();
        let peer = Arc::clone(&transport);
        let interval = state.config.heartbeat_interval();
        let timeout = state.config.heartbeat_timeout();
        let cancel = conn.cancel_token();
        tokio::spawn(async move {
            match run_heartbeat(peer, interval, timeout, cancel).await {
                HeartbeatResult::TimedOut => {
                    warn!(connection = %id, "heartbeat timed out");
                    hub.disconnect(&id, CloseReason::HeartbeatTimeout).await;
                }
                HeartbeatResult::PingFailed => {
                    warn!(connection = %id, "heartbeat ping failed");
                    hub.disconnect(&id, CloseReason::TransportError).await;
                }
                HeartbeatResult::Cancelled => {}
            }
        })
    };

    let inbound = inbound_events(stream, Arc::clone(&transport));
    state.hub.run(conn, transport.clone(), inbound).await;

    let _ = heartbeat.await;
    transport.finish().await;
}
