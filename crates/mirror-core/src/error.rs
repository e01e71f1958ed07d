//! Typed error definitions shared by the engine crates.
//!
//! [`MirrorError`] covers failures that callers branch on (configuration,
//! authentication, streaming transport). Everything else travels as
//! `anyhow::Error` with context attached at the call site.

use thiserror::Error;

/// Domain-specific errors for the trading engine.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Upstream rejected the credentials. Never retried.
    #[error("auth error: {0}")]
    Auth(String),

    /// WebSocket connection, handshake, or communication error.
    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl MirrorError {
    /// Whether a connect failure with this error may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth(_) | Self::Config(_))
    }
}
