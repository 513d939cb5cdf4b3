//! HTTP and WebSocket shell around the chat engine.

pub mod error;
pub mod health;
pub mod heartbeat;
pub mod server;
pub mod shutdown;
pub mod tasks;
pub mod ws;

pub use error::ServerError;
pub use server::{build_router, start, AppState, ServerHandle};
pub use shutdown::ShutdownCoordinator;
