//! Client/server wire frames.
//!
//! Frames are JSON text tagged by `type`. Clients may attach an `id` to any
//! request; it is echoed back in the matching `ack` or `error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::HubError;
use crate::ids::{ChannelId, ConnectionId};

/// Per-channel sequence number. The first message of a channel gets 1.
pub type Seq = u64;

/// Frames sent by clients.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Leave {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Send {
        channel: String,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ClientFrame {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, HubError> {
        serde_json::from_str(text).map_err(|e| HubError::InvalidFrame(e.to_string()))
    }

    /// Client-supplied correlation id, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Join { id, .. }
            | Self::Leave { id, .. }
            | Self::Send { id, .. }
            | Self::Ping { id } => id.as_deref(),
        }
    }

    pub fn op(&self) -> Op {
        match self {
            Self::Join { .. } => Op::Join,
            Self::Leave { .. } => Op::Leave,
            Self::Send { .. } => Op::Send,
            Self::Ping { .. } => Op::Ping,
        }
    }
}

/// Client operation named in acknowledgements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Join,
    Leave,
    Send,
    Ping,
}

/// Who sent a message. `system` is reserved for presence notifications.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Sender {
    System,
    Connection(ConnectionId),
}

const SYSTEM_SENDER: &str = "system";

impl Serialize for Sender {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::System => serializer.serialize_str(SYSTEM_SENDER),
            Self::Connection(id) => serializer.serialize_str(id.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for Sender {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == SYSTEM_SENDER {
            Ok(Self::System)
        } else {
            Ok(Self::Connection(ConnectionId::from_raw(raw)))
        }
    }
}

/// Kind of presence transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    Joined,
    Left,
    Disconnected,
}

impl PresenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::Left => "left",
            Self::Disconnected => "disconnected",
        }
    }
}

/// A sequenced channel message. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub sender: Sender,
    pub channel: ChannelId,
    pub seq: Seq,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn into_event(self) -> ServerEvent {
        ServerEvent::Message {
            channel: self.channel,
            sender: self.sender,
            seq: self.seq,
            payload: self.payload,
            timestamp: self.timestamp,
        }
    }
}

/// Frames sent by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First frame on every activated connection.
    Welcome { connection: ConnectionId },
    Message {
        channel: ChannelId,
        sender: Sender,
        seq: Seq,
        payload: String,
        timestamp: DateTime<Utc>,
    },
    /// Presence uses its own per-channel counter, separate from message `seq`.
    Presence {
        channel: ChannelId,
        sender: Sender,
        connection: ConnectionId,
        kind: PresenceKind,
        seq: Seq,
        timestamp: DateTime<Utc>,
    },
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        op: Op,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<ChannelId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },
    Error {
        code: String,
        detail: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ServerEvent {
    pub fn error(err: &HubError, id: Option<String>) -> Self {
        Self::Error {
            code: err.code().to_string(),
            detail: err.to_string(),
            id,
        }
    }

    /// Short name used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Message { .. } => "message",
            Self::Presence { .. } => "presence",
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_join() {
        let frame = ClientFrame::decode(r#"{"type":"join","channel":"general","id":"r1"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Join {
                channel: "general".into(),
                id: Some("r1".into())
            }
        );
        assert_eq!(frame.request_id(), Some("r1"));
        assert_eq!(frame.op(), Op::Join);
    }

    #[test]
    fn decode_send_without_id() {
        let frame = ClientFrame::decode(r#"{"type":"send","channel":"general","payload":"hi"}"#).unwrap();
        assert_eq!(frame.request_id(), None);
        assert!(matches!(frame, ClientFrame::Send { ref payload, .. } if payload == "hi"));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = ClientFrame::decode(r#"{"type":"shout","channel":"general"}"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_FRAME");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(ClientFrame::decode("not json").is_err());
        assert!(ClientFrame::decode(r#"{"type":"send","channel":"x"}"#).is_err());
    }

    #[test]
    fn system_sender_serializes_as_reserved_name() {
        assert_eq!(serde_json::to_value(Sender::System).unwrap(), json!("system"));
        let conn = Sender::Connection(ConnectionId::from_raw("conn_1"));
        assert_eq!(serde_json::to_value(&conn).unwrap(), json!("conn_1"));
        let back: Sender = serde_json::from_value(json!("system")).unwrap();
        assert_eq!(back, Sender::System);
    }

    #[test]
    fn message_event_wire_shape() {
        let msg = Message {
            sender: Sender::Connection(ConnectionId::from_raw("conn_a")),
            channel: ChannelId::parse("general").unwrap(),
            seq: 7,
            payload: "hi".into(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(msg.into_event()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["channel"], "general");
        assert_eq!(value["sender"], "conn_a");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["payload"], "hi");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn presence_event_wire_shape() {
        let event = ServerEvent::Presence {
            channel: ChannelId::parse("general").unwrap(),
            sender: Sender::System,
            connection: ConnectionId::from_raw("conn_b"),
            kind: PresenceKind::Disconnected,
            seq: 3,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "presence");
        assert_eq!(value["kind"], "disconnected");
        assert_eq!(value["sender"], "system");
        assert_eq!(event.kind(), "presence");
    }

    #[test]
    fn error_event_from_hub_error() {
        let err = HubError::PayloadTooLarge { size: 10, limit: 4 };
        let event = ServerEvent::error(&err, Some("r9".into()));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "PAYLOAD_TOO_LARGE");
        assert_eq!(value["id"], "r9");
    }

    #[test]
    fn ack_omits_empty_fields() {
        let event = ServerEvent::Ack {
            id: None,
            op: Op::Leave,
            channel: None,
            seq: None,
        };
        let json = event.encode().unwrap();
        assert_eq!(json, r#"{"type":"ack","op":"leave"}"#);
    }
}
