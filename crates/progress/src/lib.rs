//! Authenticated progress channel between the engine and the UI.
//!
//! - [`ProgressChannel`]: connection state machine with bounded
//!   exponential backoff, idle detection and heartbeats. Fans out
//!   [`ChannelEvent`]s on an in-process bus.
//! - [`Transport`] implementations: [`EventStreamTransport`] (server-sent
//!   events over a signed URL) and [`SocketTransport`] (WebSocket).
//! - [`PortDiscovery`]: loopback port probing with a remembered port.
//! - [`ProgressFeed`]: the seam the job orchestrator consumes.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod messages;
pub mod port;
pub mod reconnect;
pub mod socket;
pub mod stream;
pub mod transport;

pub use channel::{ProgressChannel, ProgressFeed};
pub use config::{ChannelConfig, TransportKind};
pub use error::ChannelError;
pub use events::ChannelEvent;
pub use messages::{parse_frame, ChannelMessage, ProgressUpdate};
pub use port::PortDiscovery;
pub use reconnect::{ConnectionState, ReconnectPolicy};
pub use socket::SocketTransport;
pub use stream::EventStreamTransport;
pub use transport::{Endpoint, Frame, FrameStream, Transport};
