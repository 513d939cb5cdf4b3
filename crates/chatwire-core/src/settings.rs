//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{DestroyPolicy, LogFormat, OverflowPolicy, Settings};

/// Errors that can occur when loading or validating settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Load settings from an optional file, then the process environment.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    load_settings_with(path, |name| std::env::var(name).ok())
}

/// Same as [`load_settings`] with an injectable environment lookup.
pub fn load_settings_with<F>(path: Option<&Path>, env: F) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut Settings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| env(name).filter(|v| !v.is_empty());

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read("PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.server.port = port,
            None => warn!(key = "PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("CHATWIRE_HOST") {
        settings.server.host = v;
    }

    // ── Hub ─────────────────────────────────────────────────────────
    if let Some(v) = read("CHATWIRE_MAX_CONNECTIONS") {
        match parse_usize_range(&v, 1, 1_000_000) {
            Some(n) => settings.hub.max_connections = n,
            None => warn!(key = "CHATWIRE_MAX_CONNECTIONS", value = %v, "invalid usize env var, ignoring"),
        }
    }
    if let Some(v) = read("CHATWIRE_MAX_PAYLOAD_BYTES") {
        match parse_usize_range(&v, 1, 64 * 1024 * 1024) {
            Some(n) => settings.hub.max_payload_bytes = n,
            None => warn!(key = "CHATWIRE_MAX_PAYLOAD_BYTES", value = %v, "invalid usize env var, ignoring"),
        }
    }
    if let Some(v) = read("CHATWIRE_QUEUE_CAPACITY") {
        match parse_usize_range(&v, 1, 1_000_000) {
            Some(n) => settings.hub.outbound_queue_capacity = n,
            None => warn!(key = "CHATWIRE_QUEUE_CAPACITY", value = %v, "invalid usize env var, ignoring"),
        }
    }
    if let Some(v) = read("CHATWIRE_OVERFLOW_POLICY") {
        match OverflowPolicy::parse(&v) {
            Some(policy) => settings.hub.overflow_policy = policy,
            None => warn!(key = "CHATWIRE_OVERFLOW_POLICY", value = %v, "unknown overflow policy, ignoring"),
        }
    }
    if let Some(v) = read("CHATWIRE_CHANNEL_TTL_MS") {
        match parse_u64_range(&v, 0, 86_400_000) {
            Some(0) => settings.hub.channel_destroy_policy = DestroyPolicy::Immediate,
            Some(ttl_ms) => settings.hub.channel_destroy_policy = DestroyPolicy::Delayed { ttl_ms },
            None => warn!(key = "CHATWIRE_CHANNEL_TTL_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read("CHATWIRE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("CHATWIRE_LOG_FORMAT") {
        match v.to_ascii_lowercase().as_str() {
            "json" => settings.logging.format = LogFormat::Json,
            "pretty" => settings.logging.format = LogFormat::Pretty,
            _ => warn!(key = "CHATWIRE_LOG_FORMAT", value = %v, "unknown log format, ignoring"),
        }
    }
}

/// Reject settings the hub cannot run with.
pub fn validate(settings: &Settings) -> Result<()> {
    let hub = &settings.hub;
    if hub.max_connections == 0 {
        return Err(SettingsError::InvalidValue("hub.max_connections must be > 0".into()));
    }
    if hub.max_payload_bytes == 0 {
        return Err(SettingsError::InvalidValue("hub.max_payload_bytes must be > 0".into()));
    }
    if hub.outbound_queue_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "hub.outbound_queue_capacity must be > 0".into(),
        ));
    }
    if hub.lock_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue("hub.lock_timeout_ms must be > 0".into()));
    }
    let server = &settings.server;
    if server.heartbeat_interval_secs == 0 || server.heartbeat_timeout_secs < server.heartbeat_interval_secs {
        return Err(SettingsError::InvalidValue(
            "server.heartbeat_timeout_secs must be >= heartbeat_interval_secs > 0".into(),
        ));
    }
    if server.sweep_interval_ms == 0 {
        return Err(SettingsError::InvalidValue("server.sweep_interval_ms must be > 0".into()));
    }
    Ok(())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
