//! tokio-tungstenite による RelayTransport 実装

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{CoreError, Result};
use super::{ClientMessage, RelayMessage, RelayTransport, TransportFactory};

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Relay の URL を検証 (ws / wss のみ)
pub fn validate_relay_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)
        .map_err(|e| CoreError::RelayTransportError(format!("invalid relay url {}: {}", url, e)))?;
    match parsed.scheme() {
        "ws" | "wss" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(CoreError::RelayTransportError(format!(
            "relay url must be ws:// or wss://: {}",
            url
        ))),
    }
}

/// WebSocket 接続
pub struct WsTransport {
    url: String,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    state: ConnectionState,
}

impl WsTransport {
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        validate_relay_url(url)?;

        let (ws, _) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| CoreError::Timeout(connect_timeout))??;
        log::info!("WebSocket connected to {}", url);

        Ok(Self {
            url: url.to_string(),
            ws,
            state: ConnectionState::Connected,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

#[async_trait]
impl RelayTransport for WsTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(CoreError::RelayTransportError(format!("{} is closed", self.url)));
        }
        let text = msg.to_json()?;
        if let Err(e) = self.ws.send(Message::Text(text)).await {
            self.state = ConnectionState::Disconnected;
            return Err(e.into());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<RelayMessage>> {
        if self.state != ConnectionState::Connected {
            return Ok(None);
        }
        while let Some(frame) = self.ws.next().await {
            match frame {
                Ok(Message::Text(text)) => match RelayMessage::parse(&text) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => log::warn!("Failed to parse relay message from {}: {}", self.url, e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(e.into());
                }
            }
        }
        log::info!("WebSocket closed for {}", self.url);
        self.state = ConnectionState::Disconnected;
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Disconnected {
            return Ok(());
        }
        self.state = ConnectionState::Disconnected;
        match self.ws.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// WsTransport を開くファクトリ
#[derive(Debug, Clone)]
pub struct WsTransportFactory {
    connect_timeout: Duration,
}

impl WsTransportFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsTransportFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn open(&self, url: &str) -> Result<Box<dyn RelayTransport>> {
        Ok(Box::new(WsTransport::connect(url, self.connect_timeout).await?))
    }
}
