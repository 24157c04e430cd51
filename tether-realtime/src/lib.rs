//! TETHER Realtime - duplex connections that survive flaky networks.
//!
//! - [`Connection`]: one physical stream with heartbeat and linear-backoff
//!   reconnect, reporting [`ConnectionEvent`]s to registered handlers.
//! - [`ConnectionPool`]: shares one connection per endpoint between many
//!   subscribers and closes idle ones on a sweep.
//! - [`Transport`]: how streams are opened; [`WsTransport`] is the
//!   WebSocket implementation.

pub mod connection;
pub mod events;
pub mod pool;
pub mod transport;
pub mod ws;

pub use connection::{Connection, ConnectionOptions, ConnectionState};
pub use events::{ConnectionEvent, HandlerId};
pub use pool::{ConnectionPool, PoolConfig};
pub use transport::{DuplexStream, Frame, FrameSink, FrameStream, Transport};
pub use ws::WsTransport;
