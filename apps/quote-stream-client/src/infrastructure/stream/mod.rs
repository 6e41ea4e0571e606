//! Quote Stream Adapters
//!
//! The streaming side of the client:
//!
//! - **Codec**: JSON frames to and from domain messages
//! - **Heartbeat**: Keepalive pings and silence detection
//! - **Reconnect**: Exponential backoff policy
//! - **Transport**: WebSocket connector over `tokio-tungstenite`
//! - **Manager**: The connection actor and its client handle

/// JSON frame codec.
pub mod codec;

/// Keepalive pings.
pub mod heartbeat;

/// Connection actor and client handle.
pub mod manager;

/// Reconnection backoff.
pub mod reconnect;

/// WebSocket transport.
pub mod transport;

pub use codec::{CodecError, JsonCodec};
pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use manager::{ConnectionManager, ManagerConfig, ManagerDeps, ManagerStopped, StreamClient};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use transport::{TungsteniteConnection, TungsteniteConnector};
