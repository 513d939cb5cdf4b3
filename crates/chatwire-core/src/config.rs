//! Configuration types for the hub and the server shell.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when a connection's outbound queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room.
    #[default]
    DropOldest,
    /// Discard the frame being enqueued.
    DropNewest,
    /// Close the connection that cannot keep up.
    DisconnectSlowConsumer,
}

impl OverflowPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "drop_oldest" => Some(Self::DropOldest),
            "drop_newest" => Some(Self::DropNewest),
            "disconnect_slow_consumer" => Some(Self::DisconnectSlowConsumer),
            _ => None,
        }
    }
}

/// When to free a channel whose last member left.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyPolicy {
    #[default]
    Immediate,
    /// Keep the channel (and its sequence counters) for `ttl_ms`.
    Delayed { ttl_ms: u64 },
}

impl DestroyPolicy {
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Self::Immediate => None,
            Self::Delayed { ttl_ms } => Some(Duration::from_millis(*ttl_ms)),
        }
    }
}

/// Options recognized by the hub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum message payload in bytes.
    pub max_payload_bytes: usize,
    /// Per-connection outbound queue bound.
    pub outbound_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub channel_destroy_policy: DestroyPolicy,
    /// Upper bound on waiting for a channel's serialization lock.
    pub lock_timeout_ms: u64,
    /// Close connections idle for longer than this. `0` disables.
    pub idle_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_payload_bytes: 64 * 1024,
            outbound_queue_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,
            channel_destroy_policy: DestroyPolicy::Immediate,
            lock_timeout_ms: 2_000,
            idle_timeout_ms: 0,
        }
    }
}

impl HubConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// HTTP/WebSocket shell options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    /// Close after this long without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Deadline for a single transport write.
    pub send_timeout_ms: u64,
    /// Largest inbound WebSocket frame accepted.
    pub max_frame_bytes: usize,
    /// How often the channel and idle sweepers run.
    pub sweep_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5001,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            send_timeout_ms: 5_000,
            max_frame_bytes: 1024 * 1024,
            sweep_interval_ms: 1_000,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Output format for the stdout log layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Json,
        }
    }
}

/// Top-level settings file shape.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub logging: LoggingConfig,
}
