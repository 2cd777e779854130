//! Duplex transports for the recognition engine
//!
//! The engine speaks in [`WireMessage`]s over a boxed sink/stream pair.
//! [`WebSocketConnector`] opens the real service connection;
//! [`MemoryConnector`] is an in-process loopback whose far end is handed to
//! the caller as a [`ServerEnd`].

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};

use crate::{Error, Result};

/// Transport-neutral duplex frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Outbound half of a duplex connection
pub type WireSink = Pin<Box<dyn Sink<WireMessage, Error = Error> + Send>>;

/// Inbound half of a duplex connection
pub type WireStream = Pin<Box<dyn Stream<Item = Result<WireMessage>> + Send>>;

/// Parameters for opening a connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    pub api_key: SecretString,
}

/// Opens duplex connections to the recognition service
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the handshake fails
    async fn connect(&self, request: &ConnectRequest) -> Result<(WireSink, WireStream)>;
}

/// WebSocket connector for the DashScope inference endpoint
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl From<WireMessage> for Message {
    fn from(msg: WireMessage) -> Self {
        match msg {
            WireMessage::Text(text) => Self::Text(text),
            WireMessage::Binary(data) => Self::Binary(data),
            WireMessage::Ping(data) => Self::Ping(data),
            WireMessage::Pong(data) => Self::Pong(data),
            WireMessage::Close => Self::Close(None),
        }
    }
}

fn from_ws(msg: Message) -> Option<WireMessage> {
    match msg {
        Message::Text(text) => Some(WireMessage::Text(text)),
        Message::Binary(data) => Some(WireMessage::Binary(data)),
        Message::Ping(data) => Some(WireMessage::Ping(data)),
        Message::Pong(data) => Some(WireMessage::Pong(data)),
        Message::Close(_) => Some(WireMessage::Close),
        Message::Frame(_) => None,
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<(WireSink, WireStream)> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let auth = HeaderValue::from_str(&format!("bearer {}", request.api_key.expose_secret()))
            .map_err(|e| Error::Config(format!("invalid API key: {e}")))?;
        let headers = ws_request.headers_mut();
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(concat!("parley/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert("X-DashScope-DataInspection", HeaderValue::from_static("enable"));

        tracing::debug!(url = %request.url, "opening recognition websocket");

        let (socket, response) = tokio_tungstenite::connect_async(ws_request)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "websocket handshake failed");
                Error::Transport(e.to_string())
            })?;

        tracing::debug!(status = %response.status(), "websocket handshake complete");

        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|e| Error::Transport(e.to_string()))
            .with(|msg: WireMessage| future::ready(Ok::<_, Error>(Message::from(msg))));

        let stream = stream.filter_map(|item| {
            future::ready(match item {
                Ok(msg) => from_ws(msg).map(Ok),
                Err(e) => Some(Err(Error::Transport(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Far end of a [`MemoryConnector`] connection (test support)
pub struct ServerEnd {
    /// Frames written by the client, in order
    pub from_client: fmpsc::UnboundedReceiver<WireMessage>,
    /// Frames (or transport errors) delivered to the client
    pub to_client: fmpsc::UnboundedSender<Result<WireMessage>>,
}

impl ServerEnd {
    /// Deliver a text frame to the client
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.to_client.unbounded_send(Ok(WireMessage::Text(text.into())));
    }

    /// Drop the connection from the server side
    pub fn close(self) {
        let _ = self.to_client.unbounded_send(Ok(WireMessage::Close));
    }
}

/// In-process loopback connector
///
/// Test support: lets suites script the service side of the protocol
/// through the accepted [`ServerEnd`]s. Not used by the binary.
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

impl MemoryConnector {
    /// Create a connector and the receiver of accepted connections
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                connects: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Number of connection attempts so far
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make subsequent connection attempts fail
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _request: &ConnectRequest) -> Result<(WireSink, WireStream)> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_string()));
        }

        let (client_tx, client_rx) = fmpsc::unbounded::<WireMessage>();
        let (server_tx, server_rx) = fmpsc::unbounded::<Result<WireMessage>>();

        self.accepted
            .send(ServerEnd {
                from_client: client_rx,
                to_client: server_tx,
            })
            .map_err(|_| Error::Transport("no server listening".to_string()))?;

        let sink = client_tx.sink_map_err(|e| Error::Transport(e.to_string()));
        Ok((Box::pin(sink), Box::pin(server_rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConnectRequest {
        ConnectRequest {
            url: "memory://asr".to_string(),
            api_key: SecretString::from("sk-test".to_string()),
        }
    }

    #[tokio::test]
    async fn memory_connector_round_trips_frames() {
        let (connector, mut accepted) = MemoryConnector::new();
        let (mut sink, mut stream) = connector.connect(&request()).await.unwrap();
        let mut server = accepted.recv().await.unwrap();

        sink.send(WireMessage::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(
            server.from_client.next().await,
            Some(WireMessage::Binary(vec![1, 2, 3]))
        );

        server.send_text("hello");
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            WireMessage::Text("hello".to_string())
        );
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let (connector, _accepted) = MemoryConnector::new();
        connector.set_refuse(true);

        let result = connector.connect(&request()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(connector.connect_count(), 1);
    }

    #[test]
    fn close_maps_to_websocket_close() {
        assert_eq!(Message::from(WireMessage::Close), Message::Close(None));
        assert_eq!(
            from_ws(Message::Text("x".to_string())),
            Some(WireMessage::Text("x".to_string()))
        );
    }
}
