use std::time::Duration;

use crate::ids::{ChannelId, ConnectionId};

/// Failure reported by a transport handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
}

/// Errors raised by the hub components.
///
/// Every variant is scoped to a single connection; none of them is fatal to
/// the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    // Handshake
    #[error("connection limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    // Protocol misuse, connection stays alive
    #[error("{connection} is not a member of {channel}")]
    NotMember {
        connection: ConnectionId,
        channel: ChannelId,
    },
    #[error("{connection} is already a member of {channel}")]
    AlreadyMember {
        connection: ConnectionId,
        channel: ChannelId,
    },
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("invalid channel name: {0}")]
    InvalidChannelName(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),
    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),
    #[error("connection {0} is not active")]
    NotActive(ConnectionId),

    // Operational
    #[error("timed out after {0:?} waiting for channel {1}")]
    LockTimeout(Duration, ChannelId),
    #[error("operation cancelled")]
    Cancelled,

    // Fatal to the connection
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("slow consumer disconnected: {0}")]
    SlowConsumerDisconnect(ConnectionId),
}

impl HubError {
    /// Whether this error forces the affected connection into CLOSING.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::SlowConsumerDisconnect(_))
    }

    /// Whether the client may simply retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::LockTimeout(..) | Self::Cancelled
        )
    }

    /// Wire code sent to clients in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::NotMember { .. } => "NOT_MEMBER",
            Self::AlreadyMember { .. } => "ALREADY_MEMBER",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::InvalidChannelName(_) => "INVALID_CHANNEL",
            Self::InvalidFrame(_) => "INVALID_FRAME",
            Self::ConnectionNotFound(_) | Self::ChannelNotFound(_) => "NOT_FOUND",
            Self::NotActive(_) => "NOT_ACTIVE",
            Self::LockTimeout(..) => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::SlowConsumerDisconnect(_) => "SLOW_CONSUMER",
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
