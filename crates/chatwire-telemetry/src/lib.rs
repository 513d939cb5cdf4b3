mod metrics;

pub use metrics::{
    HistogramSummary, MetricSample, MetricType, MetricsRecorder, MetricsSnapshot, CHANNELS_ACTIVE,
    CLIENT_ERRORS_TOTAL, CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL,
    DISCONNECTIONS_TOTAL, FANOUT_RECIPIENTS, FRAMES_DROPPED_TOTAL, FRAMES_ENQUEUED_TOTAL,
    MESSAGES_PUBLISHED_TOTAL, SLOW_CONSUMER_DISCONNECTS_TOTAL,
};

use std::str::FromStr;
use std::sync::Arc;

use chatwire_core::config::{LogFormat, LoggingConfig};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "chatwire_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
        }
    }
}

impl TelemetryConfig {
    /// Build from the settings file section. Unknown levels fall back to INFO.
    pub fn from_logging(logging: &LoggingConfig) -> Self {
        Self {
            log_level: Level::from_str(&logging.level).unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            format: logging.format,
        }
    }

    /// Directive string handed to `EnvFilter` when RUST_LOG is unset.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps telemetry handles alive for the life of the process.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    /// Shared metrics recorder.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

/// Initialize logging and metrics. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(fmt_layer).init();

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}
