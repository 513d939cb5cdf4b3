use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::HubError;

/// Longest channel name accepted, in bytes.
pub const MAX_CHANNEL_NAME_BYTES: usize = 128;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ConnectionId, "conn");

/// Channel identifier. The channel name itself, case-sensitive.
///
/// Unlike connection ids, channel ids are chosen by clients, so they are
/// only constructed through [`ChannelId::parse`].
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Validate a client-supplied channel name.
    pub fn parse(name: impl Into<String>) -> Result<Self, HubError> {
        let name = name.into();
        if name.is_empty() {
            return Err(HubError::InvalidChannelName("channel name is empty".into()));
        }
        if name.len() > MAX_CHANNEL_NAME_BYTES {
            return Err(HubError::InvalidChannelName(format!(
                "channel name exceeds {MAX_CHANNEL_NAME_BYTES} bytes"
            )));
        }
        if name.chars().any(char::is_control) {
            return Err(HubError::InvalidChannelName(
                "channel name contains control characters".into(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChannelId {
    type Err = HubError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.as_str().starts_with("conn_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = ConnectionId::new();
        let parsed: ConnectionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<ConnectionId> = (0..100).map(|_| ConnectionId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn channel_names_are_case_sensitive() {
        let lower = ChannelId::parse("general").unwrap();
        let upper = ChannelId::parse("General").unwrap();
        assert_ne!(lower, upper);
    }

    #[test]
    fn empty_channel_name_rejected() {
        let err = ChannelId::parse("").unwrap_err();
        assert!(matches!(err, HubError::InvalidChannelName(_)));
    }

    #[test]
    fn oversized_channel_name_rejected() {
        let name = "x".repeat(MAX_CHANNEL_NAME_BYTES + 1);
        assert!(ChannelId::parse(name).is_err());
        let name = "x".repeat(MAX_CHANNEL_NAME_BYTES);
        assert!(ChannelId::parse(name).is_ok());
    }

    #[test]
    fn control_characters_rejected() {
        assert!(ChannelId::parse("gen\neral").is_err());
    }

    #[test]
    fn channel_id_deserialize_validates() {
        let ok: ChannelId = serde_json::from_str(r#""random""#).unwrap();
        assert_eq!(ok.as_str(), "random");
        assert!(serde_json::from_str::<ChannelId>(r#""""#).is_err());
    }
}
