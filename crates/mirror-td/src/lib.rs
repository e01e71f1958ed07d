//! # mirror-td
//!
//! Order-side modules: the broker REST contract, its OpenAlgo-style HTTP
//! implementation, freeze-quantity splitting and margin-based lot sizing.
//!
//! Every account gets its own [`BrokerApi`] handle. All methods take `&self`
//! so one handle can serve concurrent placements.

pub mod margin;
pub mod openalgo;
pub mod split;

use async_trait::async_trait;
use chrono::NaiveDate;
use mirror_core::types::{Candle, Funds, OrderRecord, OrderRequest, PingInfo, QuoteSnapshot};

pub use openalgo::OpenAlgoClient;

/// Broker call failures, split by how the caller should react.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    /// The broker processed the request and refused it. Not retried.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Credentials refused. Not retried.
    #[error("auth failed: {0}")]
    Auth(String),

    /// Network failure, timeout or 5xx. Safe to retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// Response did not have the expected shape.
    #[error("unexpected response: {0}")]
    Parse(String),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// REST operations the engine needs from one account.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    fn account_id(&self) -> &str;

    /// Connectivity and credential check.
    async fn ping(&self) -> Result<PingInfo, BrokerError>;

    async fn funds(&self) -> Result<Funds, BrokerError>;

    /// Place one order; returns the broker order id.
    async fn place_order(&self, order: &OrderRequest) -> Result<String, BrokerError>;

    async fn order_book(&self) -> Result<Vec<OrderRecord>, BrokerError>;

    async fn quote(&self, symbol: &str, exchange: &str) -> Result<QuoteSnapshot, BrokerError>;

    /// OHLC bars of `interval_minutes` between two dates, oldest first.
    async fn history(
        &self,
        symbol: &str,
        exchange: &str,
        interval_minutes: u32,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Candle>, BrokerError>;
}
