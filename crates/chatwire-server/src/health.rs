//! `/health` endpoint.

use chatwire_engine::HubStats;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    pub uptime_secs: u64,
    pub connections: usize,
    pub max_connections: usize,
    pub channels: usize,
}

pub fn health_check(uptime_secs: u64, stats: HubStats) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs,
        connections: stats.connections,
        max_connections: stats.capacity,
        channels: stats.channels,
    }
}
