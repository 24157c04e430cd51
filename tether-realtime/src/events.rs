//! Connection lifecycle events.

use std::sync::Arc;

use tether_core::ConnectionError;

use crate::transport::Frame;

/// Everything a [`Connection`](crate::Connection) reports to its handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    Message(Frame),
    Error(ConnectionError),
}

impl ConnectionEvent {
    /// Short name used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Message(_) => "message",
            Self::Error(_) => "error",
        }
    }
}

/// Registration handle returned by [`Connection::on`](crate::Connection::on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

impl HandlerId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

pub(crate) type EventHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;
