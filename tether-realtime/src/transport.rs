//! Transport abstraction for duplex streams.
//!
//! A [`Transport`] knows how to open one physical stream to an endpoint and
//! hands back its two halves. [`Connection`](crate::Connection) owns the state
//! machine on top; transports stay dumb.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use serde::Serialize;
use tether_core::ConnectionError;

/// A single unit of traffic on a duplex stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Serialize `value` as a JSON text frame.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_string(value).map(Self::Text)
    }

    pub fn heartbeat() -> Self {
        Self::Ping(Vec::new())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Ping/pong frames carry liveness only and are not dispatched as messages.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write half of a duplex stream.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ConnectionError> + Send>>;

/// Read half of a duplex stream. Ending the stream means the peer went away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ConnectionError>> + Send>>;

/// Both halves of an opened stream.
pub struct DuplexStream {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl DuplexStream {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens physical streams.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, endpoint: &str) -> Result<DuplexStream, ConnectionError>;
}
