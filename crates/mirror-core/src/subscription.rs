//! Subscription state for one logical streaming connection.
//!
//! The set is reference counted so independent consumers (option chain,
//! position monitor, UI) can share an instrument: the upstream subscribe is
//! sent on the first `acquire`, the unsubscribe on the last `release`.
//! The lock is only held for a single map operation.

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::types::Mode;

/// Depth levels requested on every subscribe.
pub const SUBSCRIBE_DEPTH: u32 = 5;

/// An `(instrument, exchange, mode)` stream subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    pub symbol: String,
    pub exchange: String,
    pub mode: Mode,
}

impl Subscription {
    pub fn new(symbol: impl Into<String>, exchange: impl Into<String>, mode: Mode) -> Self {
        Self { symbol: symbol.into(), exchange: exchange.into(), mode }
    }

    /// Wire message requesting this stream.
    pub fn subscribe_msg(&self) -> String {
        json!({
            "action": "subscribe",
            "symbol": self.symbol,
            "exchange": self.exchange,
            "mode": self.mode.code(),
            "depth": SUBSCRIBE_DEPTH,
        })
        .to_string()
    }

    /// Wire message cancelling this stream.
    pub fn unsubscribe_msg(&self) -> String {
        json!({
            "action": "unsubscribe",
            "symbol": self.symbol,
            "exchange": self.exchange,
            "mode": self.mode.code(),
        })
        .to_string()
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.exchange, self.symbol, self.mode)
    }
}

/// Anything that can take subscription requests (the live feed, or a test
/// recorder). Both calls are reference counted by the implementor.
pub trait SubscriptionSink: Send + Sync {
    fn subscribe(&self, sub: Subscription);
    fn unsubscribe(&self, sub: Subscription);
}

/// Reference-counted subscription set.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    refs: Mutex<AHashMap<Subscription, usize>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference. Returns `true` only if the subscription is new.
    pub fn acquire(&self, sub: &Subscription) -> bool {
        let mut refs = self.refs.lock();
        let count = refs.entry(sub.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop a reference. Returns `true` when the last one was released and
    /// the subscription left the set.
    pub fn release(&self, sub: &Subscription) -> bool {
        let mut refs = self.refs.lock();
        match refs.get_mut(sub) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                refs.remove(sub);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, sub: &Subscription) -> bool {
        self.refs.lock().contains_key(sub)
    }

    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.lock().is_empty()
    }

    /// All subscriptions in a stable order, for replay after reconnect.
    pub fn snapshot(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self.refs.lock().keys().cloned().collect();
        subs.sort();
        subs
    }
}
