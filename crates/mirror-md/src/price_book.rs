//! Latest traded price per symbol.
//!
//! Fed by the pipeline for every mode; read by the risk monitor for marks
//! and by the execution engine for the spot price.

use ahash::AHashMap;
use mirror_core::time_util;
use mirror_core::types::MarketEvent;
use parking_lot::RwLock;

use crate::pipeline::MarketHandler;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceEntry {
    pub ltp: f64,
    pub updated_ms: u64,
}

#[derive(Debug, Default)]
pub struct PriceBook {
    prices: RwLock<AHashMap<String, PriceEntry>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a price. Non-positive prices are ignored.
    pub fn update(&self, symbol: &str, ltp: f64, updated_ms: u64) {
        if ltp.is_nan() || ltp <= 0.0 {
            return;
        }
        let mut prices = self.prices.write();
        match prices.get_mut(symbol) {
            Some(entry) => *entry = PriceEntry { ltp, updated_ms },
            None => {
                prices.insert(symbol.to_string(), PriceEntry { ltp, updated_ms });
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<PriceEntry> {
        self.prices.read().get(symbol).copied()
    }

    pub fn ltp(&self, symbol: &str) -> Option<f64> {
        self.get(symbol).map(|e| e.ltp)
    }

    /// Price only if updated within `max_age_ms` of now.
    pub fn fresh_ltp(&self, symbol: &str, max_age_ms: u64) -> Option<f64> {
        let now = time_util::now_ms();
        self.get(symbol)
            .filter(|e| now.saturating_sub(e.updated_ms) <= max_age_ms)
            .map(|e| e.ltp)
    }

    pub fn len(&self) -> usize {
        self.prices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.read().is_empty()
    }
}

impl MarketHandler for PriceBook {
    fn name(&self) -> &str {
        "price_book"
    }

    fn on_event(&self, event: &MarketEvent) -> anyhow::Result<()> {
        let ts = match event {
            MarketEvent::Price(p) => p.timestamp_ms,
            MarketEvent::Quote(q) => q.timestamp_ms,
            MarketEvent::Depth(d) => d.timestamp_ms,
        };
        self.update(event.symbol(), event.ltp(), ts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::types::PriceUpdate;

    #[test]
    fn keeps_latest_and_ignores_zero() {
        let book = PriceBook::new();
        book.update("NIFTY", 25000.0, 1);
        book.update("NIFTY", 25010.0, 2);
        book.update("NIFTY", 0.0, 3);
        assert_eq!(book.get("NIFTY"), Some(PriceEntry { ltp: 25010.0, updated_ms: 2 }));
        assert_eq!(book.ltp("BANKNIFTY"), None);
    }

    #[test]
    fn freshness_window() {
        let book = PriceBook::new();
        let now = time_util::now_ms();
        book.update("A", 10.0, now);
        book.update("B", 20.0, now.saturating_sub(60_000));
        assert_eq!(book.fresh_ltp("A", 5_000), Some(10.0));
        assert_eq!(book.fresh_ltp("B", 5_000), None);
    }

    #[test]
    fn handler_records_events() {
        let book = PriceBook::new();
        let event = MarketEvent::Price(PriceUpdate { symbol: "X".into(), exchange: "NFO".into(), ltp: 5.5, timestamp_ms: 9 });
        book.on_event(&event).unwrap();
        assert_eq!(book.ltp("X"), Some(5.5));
        assert_eq!(book.len(), 1);
    }
}
