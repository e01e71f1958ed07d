//! Streaming session primitives.
//!
//! The failover controller talks to the upstream through two small traits so
//! the reconnect/failover logic can be exercised without a network:
//!
//! - [`StreamConnector`] opens and authenticates a session for an account.
//! - [`StreamSession`] sends text frames, pings, and yields inbound frames.
//!
//! [`WsConnector`] / [`WsSession`] are the tokio-tungstenite implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::MirrorError;
use crate::types::Account;

/// Callback invoked for each received text frame.
///
/// Parameters: `(account_id, message_text)`
pub type OnMessageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// One inbound frame of interest to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Keep-alive reply; counts as liveness only.
    Pong,
}

/// An established, authenticated streaming session.
#[async_trait]
pub trait StreamSession: Send {
    async fn send_text(&mut self, text: String) -> Result<(), MirrorError>;

    async fn ping(&mut self) -> Result<(), MirrorError>;

    /// Next inbound frame; `None` once the peer has closed.
    ///
    /// Must be cancel-safe: it is polled inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<Inbound, MirrorError>>;

    async fn close(&mut self);
}

/// Opens sessions for accounts.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connect and authenticate. [`MirrorError::Auth`] means the
    /// credentials were rejected and the attempt must not be retried.
    async fn connect(&self, account: &Account) -> Result<Box<dyn StreamSession>, MirrorError>;
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

// ---------------------------------------------------------------------------
// tokio-tungstenite implementation
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connects to the account's `ws_url` and performs the API-key handshake.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn StreamSession>, MirrorError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let label = account.label().to_string();
        let url = validate_ws_url(&account.ws_url)?;
        info!("[ws-{label}] connecting to {url}");

        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| MirrorError::WebSocket(format!("bad request: {e}")))?;

        let (mut stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| MirrorError::WebSocket(e.to_string()))?;

        authenticate(&mut stream, &account.api_key, &label).await?;
        info!("[ws-{label}] authenticated");
        Ok(Box::new(WsSession { stream, label }))
    }
}

/// Send the API key and wait for the `auth` reply.
async fn authenticate(stream: &mut WsStream, api_key: &str, label: &str) -> Result<(), MirrorError> {
    let msg = json!({"action": "authenticate", "api_key": api_key}).to_string();
    stream
        .send(Message::Text(msg.into()))
        .await
        .map_err(|e| MirrorError::WebSocket(format!("auth send failed: {e}")))?;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let Ok(v) = serde_json::from_str::<serde_json::Value>(text.as_str()) else {
                    debug!("[ws-{label}] ignoring non-JSON frame during auth");
                    continue;
                };
                if v.get("type").and_then(|t| t.as_str()) != Some("auth") {
                    continue;
                }
                return match v.get("status").and_then(|s| s.as_str()) {
                    Some("success") => Ok(()),
                    _ => {
                        let reason = v.get("message").and_then(|m| m.as_str()).unwrap_or("rejected");
                        Err(MirrorError::Auth(reason.to_string()))
                    }
                };
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(MirrorError::WebSocket(e.to_string())),
        }
    }
    Err(MirrorError::WebSocket("closed during authentication".into()))
}

/// A live tokio-tungstenite session.
pub struct WsSession {
    stream: WsStream,
    label: String,
}

#[async_trait]
impl StreamSession for WsSession {
    async fn send_text(&mut self, text: String) -> Result<(), MirrorError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| MirrorError::WebSocket(format!("send error: {e}")))
    }

    async fn ping(&mut self) -> Result<(), MirrorError> {
        self.stream
            .send(Message::Ping(vec![].into()))
            .await
            .map_err(|e| MirrorError::WebSocket(format!("ping send error: {e}")))
    }

    async fn recv(&mut self) -> Option<Result<Inbound, MirrorError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => return Some(Ok(Inbound::Text(text.to_owned()))),
                    Err(_) => debug!("[ws-{}] dropping non-UTF-8 binary frame", self.label),
                },
                Ok(Message::Pong(_)) => return Some(Ok(Inbound::Pong)),
                Ok(Message::Close(frame)) => {
                    warn!("[ws-{}] received close frame: {frame:?}", self.label);
                    return None;
                }
                // Pings are answered by tungstenite on the next flush.
                Ok(_) => {}
                Err(e) => return Some(Err(MirrorError::WebSocket(format!("read error: {e}")))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Parse a streaming URL, accepting only `ws://` and `wss://`.
pub fn validate_ws_url(raw: &str) -> Result<url::Url, MirrorError> {
    let url = url::Url::parse(raw).map_err(|e| MirrorError::Config(format!("invalid ws url '{raw}': {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(MirrorError::Config(format!("unsupported ws scheme '{other}' in '{raw}'"))),
    }
}
