pub mod config;
pub mod errors;
pub mod ids;
pub mod protocol;
pub mod settings;

pub use config::{DestroyPolicy, HubConfig, LogFormat, LoggingConfig, OverflowPolicy, ServerConfig, Settings};
pub use errors::{HubError, TransportError};
pub use ids::{ChannelId, ConnectionId};
pub use protocol::{ClientFrame, Message, Op, PresenceKind, Sender, Seq, ServerEvent};
