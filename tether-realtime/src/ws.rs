//! WebSocket transport on tokio-tungstenite.

use async_trait::async_trait;
use futures_util::future;
use futures_util::{SinkExt, StreamExt};
use tether_core::ConnectionError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use crate::transport::{DuplexStream, Frame, FrameSink, FrameStream, Transport};

/// Opens `ws://` / `wss://` streams, attaching a fixed set of headers to the
/// upgrade request.
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a header to every upgrade request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ConnectionError> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid_header(name, e))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid_header(name.as_str(), e))?;
        self.headers.push((name, value));
        Ok(self)
    }

    /// Shorthand for an `Authorization: Bearer` header.
    pub fn with_bearer_token(self, token: &str) -> Result<Self, ConnectionError> {
        self.with_header("authorization", &format!("Bearer {}", token))
    }
}

fn invalid_header(name: &str, err: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Transport {
        endpoint: String::new(),
        reason: format!("invalid header {}: {}", name, err),
    }
}

fn transport_error(endpoint: &str, err: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Transport {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
        }
    }
}

/// Map a wire message to a frame. Close and raw frames carry no payload for us.
fn frame_from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Ping(data) => Some(Frame::Ping(data)),
        Message::Pong(data) => Some(Frame::Pong(data)),
        Message::Close(_) | Message::Frame(_) => None,
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, endpoint: &str) -> Result<DuplexStream, ConnectionError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| transport_error(endpoint, e))?;
        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| transport_error(endpoint, e))?;
        tracing::debug!(endpoint = %endpoint, "WebSocket upgrade complete");

        let (write, read) = socket.split();

        let sink_endpoint = endpoint.to_string();
        let sink: FrameSink = Box::pin(
            write
                .with(|frame: Frame| future::ready(Ok::<Message, _>(Message::from(frame))))
                .sink_map_err(move |e: tokio_tungstenite::tungstenite::Error| {
                    transport_error(&sink_endpoint, e)
                }),
        );

        let stream_endpoint = endpoint.to_string();
        let stream: FrameStream = Box::pin(read.filter_map(move |message| {
            let item = match message {
                Ok(message) => frame_from_message(message).map(Ok),
                Err(e) => Some(Err(transport_error(&stream_endpoint, e))),
            };
            future::ready(item)
        }));

        Ok(DuplexStream::new(sink, stream))
    }
}
