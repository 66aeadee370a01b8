//! Live transport capability
//!
//! The pipeline only sees a pair of channels: frames it wants sent, and
//! events coming back. How the link is made is the transport's business.
//! A link that closes or errors reports `TransportEvent::Closed` exactly
//! once and then goes quiet.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::protocol::{OutboundMessage, PING};

/// Live link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }

    /// Value exported on the connection gauge
    pub fn gauge_value(&self) -> i64 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport failures; all of them end in fallback, none are fatal
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid transport url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connect failed: {0}")]
    Connect(String),
}

/// Frame the pipeline asks the transport to send
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Message(OutboundMessage),
    /// Heartbeat request
    Ping,
}

impl OutboundFrame {
    /// Wire text; heartbeats go out as a bare `ping`, not JSON
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Ping => Some(PING.to_string()),
            Self::Message(message) => match message.encode() {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(error = %e, "Failed to encode outbound frame");
                    None
                }
            },
        }
    }
}

/// Something that happened on the link
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A text frame, undecoded
    Text(String),
    /// The link is gone; carries the reason when there is one
    Closed(Option<String>),
}

/// Channels of one established link. Dropping `outbound` closes the link.
pub struct TransportLink {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Capability that establishes the live link
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<TransportLink, TransportError>;

    /// Where this transport connects, for logs
    fn describe(&self) -> String {
        "transport".to_string()
    }
}

/// Configuration for the WebSocket transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `ws://` or `wss://` endpoint
    pub url: String,
    pub connect_timeout: Duration,
    /// Buffer size of each direction
    pub channel_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            channel_buffer_size: 256,
        }
    }
}

/// Transport over a WebSocket
pub struct WebSocketTransport {
    config: TransportConfig,
}

impl WebSocketTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn endpoint(&self) -> Result<Url, TransportError> {
        let url = Url::parse(&self.config.url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(TransportError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        let url = self.endpoint()?;

        let (stream, _response) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| TransportError::Timeout(self.config.connect_timeout))??;

        info!(endpoint = %url, "WebSocket connected");

        let (mut sink, mut source) = stream.split();
        let buffer = self.config.channel_buffer_size.max(1);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(buffer);

        // writer: ends when the pipeline drops its sender
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let Some(text) = frame.to_text() else {
                    continue;
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(error = %e, "WebSocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // reader: reports Closed once, then stops
        tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(TransportEvent::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if inbound_tx.send(TransportEvent::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => debug!("Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            let _ = inbound_tx.send(TransportEvent::Closed(reason)).await;
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}
