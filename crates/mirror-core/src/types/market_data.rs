//! Market data structures produced by the streaming pipeline.
//!
//! Each inbound frame becomes exactly one [`MarketEvent`]. Prices are plain
//! `f64`; quantities fit in `f64` as well since the upstream sends them as
//! JSON numbers.

use serde::{Deserialize, Serialize};

use super::enums::Mode;

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Last-traded-price update (mode 1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub exchange: String,
    pub ltp: f64,
    /// Local receive time (ms since epoch).
    pub timestamp_ms: u64,
}

/// Full quote update (mode 2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuoteUpdate {
    pub symbol: String,
    pub exchange: String,
    pub ltp: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp_ms: u64,
}

/// Order book update (mode 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub symbol: String,
    pub exchange: String,
    pub ltp: f64,
    /// Bids, best first.
    pub bids: Vec<DepthLevel>,
    /// Asks, best first.
    pub asks: Vec<DepthLevel>,
    pub volume: f64,
    pub open_interest: f64,
    pub timestamp_ms: u64,
}

impl DepthUpdate {
    /// Best bid, if the book side is non-empty.
    pub fn best_bid(&self) -> Option<DepthLevel> {
        self.bids.first().copied()
    }

    /// Best ask, if the book side is non-empty.
    pub fn best_ask(&self) -> Option<DepthLevel> {
        self.asks.first().copied()
    }
}

/// A classified inbound market data message.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Price(PriceUpdate),
    Quote(QuoteUpdate),
    Depth(DepthUpdate),
}

impl MarketEvent {
    /// Mode this event is dispatched under.
    pub fn mode(&self) -> Mode {
        match self {
            Self::Price(_) => Mode::Price,
            Self::Quote(_) => Mode::Quote,
            Self::Depth(_) => Mode::Depth,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Price(p) => &p.symbol,
            Self::Quote(q) => &q.symbol,
            Self::Depth(d) => &d.symbol,
        }
    }

    pub fn exchange(&self) -> &str {
        match self {
            Self::Price(p) => &p.exchange,
            Self::Quote(q) => &q.exchange,
            Self::Depth(d) => &d.exchange,
        }
    }

    /// Last traded price carried by every mode.
    pub fn ltp(&self) -> f64 {
        match self {
            Self::Price(p) => p.ltp,
            Self::Quote(q) => q.ltp,
            Self::Depth(d) => d.ltp,
        }
    }
}

/// One OHLC bar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time (seconds since epoch).
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}
