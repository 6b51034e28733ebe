//! Request/response transports to a sync gateway.
//!
//! The engine only needs one exchange per cycle: send a packet, get a packet
//! back. Two implementations ship with the crate:
//!
//! | scheme          | transport       | exchange                              |
//! |-----------------|-----------------|---------------------------------------|
//! | `ws`, `wss`     | [`WsTransport`] | one text frame out, one text frame in |
//! | `http`, `https` | [`HttpTransport`] | form POST, field `query`            |
//!
//! Reference: RFC 6455, The WebSocket Protocol

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport I/O error: {0}")]
    Io(String),
    #[error("gateway answered with HTTP status {0}")]
    Status(u16),
    #[error("connection closed by peer")]
    Closed,
    #[error("response body is not UTF-8")]
    InvalidBody,
    #[error("unsupported endpoint scheme in {0:?}")]
    UnsupportedScheme(String),
}

/// One request/response exchange with a gateway.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transmit(&self, body: String) -> Result<String, TransportError>;
}

/// Builds a transport for an endpoint URL.
pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync,
{
    fn create(&self, endpoint: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self(endpoint)
    }
}

/// Picks [`WsTransport`] or [`HttpTransport`] by URL scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, endpoint: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let scheme = endpoint
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        match scheme.as_str() {
            "ws" | "wss" => Ok(Arc::new(WsTransport::new(endpoint))),
            "http" | "https" => Ok(Arc::new(HttpTransport::new(endpoint))),
            _ => Err(TransportError::UnsupportedScheme(endpoint.to_owned())),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// WebSocket
// ───────────────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Persistent WebSocket, reconnected lazily after any failure.
pub struct WsTransport {
    url: String,
    stream: Mutex<Option<WsStream>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<WsStream, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        log::info!("connected to {}", self.url);
        Ok(ws)
    }
}

async fn exchange(ws: &mut WsStream, body: String) -> Result<String, TransportError> {
    ws.send(Message::text(body))
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;

    while let Some(frame) = ws.next().await {
        match frame.map_err(|e| TransportError::Io(e.to_string()))? {
            Message::Text(text) => return Ok(text.as_str().to_owned()),
            Message::Binary(bytes) => {
                return String::from_utf8(bytes.to_vec()).map_err(|_| TransportError::InvalidBody)
            }
            Message::Close(_) => return Err(TransportError::Closed),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
    Err(TransportError::Closed)
}

#[async_trait]
impl Transport for WsTransport {
    async fn transmit(&self, body: String) -> Result<String, TransportError> {
        let mut slot = self.stream.lock().await;
        // Taken out for the exchange: if this future is dropped mid-way the
        // half-used socket goes with it and the next cycle reconnects.
        let mut ws = match slot.take() {
            Some(ws) => ws,
            None => self.connect().await?,
        };

        match exchange(&mut ws, body).await {
            Ok(response) => {
                *slot = Some(ws);
                Ok(response)
            }
            Err(err) => {
                log::warn!("{}: dropping connection: {err}", self.url);
                Err(err)
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// HTTP
// ───────────────────────────────────────────────────────────────────

/// Form-POST gateway: the packet goes in field `query`, the response body
/// is the reply packet.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn transmit(&self, body: String) -> Result<String, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .form(&[("query", body)])
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    TransportError::Connect(e.to_string())
                } else {
                    TransportError::Io(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}
