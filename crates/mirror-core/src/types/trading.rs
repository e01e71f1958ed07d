//! Order, order-book and funds structures exchanged with the broker REST API.

use serde::{Deserialize, Serialize};

use super::enums::{PriceType, Product, Side};

// ---------------------------------------------------------------------------
// Order request (engine → broker)
// ---------------------------------------------------------------------------

/// A single order sent to one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Broker trading symbol (e.g. `"NIFTY28OCT2625000CE"`).
    pub symbol: String,
    /// Exchange segment (e.g. `"NFO"`).
    pub exchange: String,
    pub action: Side,
    /// Quantity in shares/units, already a multiple of the lot size.
    pub quantity: u32,
    pub price_type: PriceType,
    pub product: Product,
    /// Limit price, `0.0` for market orders.
    pub price: f64,
    /// Trigger price for stop orders, `0.0` otherwise.
    pub trigger_price: f64,
    /// Strategy tag echoed back in the order book.
    pub strategy_tag: String,
}

impl OrderRequest {
    /// Copy of this request with a different quantity (used for freeze splits).
    pub fn with_quantity(&self, quantity: u32) -> Self {
        Self { quantity, ..self.clone() }
    }
}

// ---------------------------------------------------------------------------
// Order book (broker → engine)
// ---------------------------------------------------------------------------

/// Broker order status, normalised from free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerOrderStatus {
    Open,
    TriggerPending,
    Complete,
    Rejected,
    Cancelled,
    Unknown,
}

impl BrokerOrderStatus {
    /// Case-insensitive parse of the upstream `order_status` field.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "pending" | "validation pending" | "put order req received" => Self::Open,
            "trigger pending" | "trigger_pending" => Self::TriggerPending,
            "complete" | "completed" | "filled" | "traded" => Self::Complete,
            "rejected" => Self::Rejected,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }

    /// No further fills can happen once the broker reports this.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Rejected | Self::Cancelled)
    }
}

/// One row of an account's order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub status: BrokerOrderStatus,
    pub quantity: u32,
    /// Average fill price, absent until the broker reports one.
    pub average_price: Option<f64>,
    /// Rejection or cancellation reason.
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Funds / quotes
// ---------------------------------------------------------------------------

/// Account funds snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Funds {
    pub available_cash: f64,
    pub collateral: f64,
    pub utilised_debits: f64,
    pub m2m_realized: f64,
    pub m2m_unrealized: f64,
}

impl Funds {
    /// Margin usable for new positions.
    pub fn available_margin(&self) -> f64 {
        self.available_cash + self.collateral - self.utilised_debits
    }
}

/// REST quote snapshot (fallback when the stream has no fresh data).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub ltp: f64,
    pub bid: f64,
    pub ask: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub prev_close: f64,
    pub volume: f64,
    pub open_interest: f64,
}

/// Result of the broker connectivity test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingInfo {
    pub broker: String,
    pub message: String,
}
