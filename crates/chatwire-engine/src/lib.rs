pub mod channels;
pub mod hub;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

pub use channels::{ChannelGuard, ChannelInfo, ChannelManager};
pub use hub::{Hub, HubStats, SweepReport};
pub use presence::{LifecycleEvent, LifecycleTracker};
pub use queue::{OutboundQueue, PushOutcome};
pub use registry::{CloseListener, CloseReason, Connection, ConnectionRegistry, ConnectionState};
pub use router::MessageRouter;
pub use transport::{InboundEvent, MemoryTransport, Transport};
