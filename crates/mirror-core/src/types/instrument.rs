//! Per-underlying contract specifications.
//!
//! Lot size, exchange freeze quantity, strike step and weekly expiry day
//! for each tradable underlying. Built-in defaults can be overridden from
//! the `instruments` config section.

use std::collections::HashMap;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use super::symbol::base_symbol;

/// Contract specification for one underlying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Shares per lot.
    pub lot_size: u32,
    /// Maximum quantity the exchange accepts in a single order.
    pub freeze_quantity: u32,
    /// Distance between adjacent option strikes.
    pub strike_step: u32,
    /// Exchange the index itself is quoted on.
    #[serde(default = "default_index_exchange")]
    pub index_exchange: String,
    /// Exchange segment for the derivatives.
    #[serde(default = "default_option_exchange")]
    pub option_exchange: String,
    /// Weekday of the weekly expiry.
    #[serde(default = "default_expiry_weekday")]
    pub expiry_weekday: Weekday,
}

fn default_index_exchange() -> String {
    "NSE_INDEX".to_string()
}

fn default_option_exchange() -> String {
    "NFO".to_string()
}

fn default_expiry_weekday() -> Weekday {
    Weekday::Tue
}

impl InstrumentSpec {
    fn nse(lot_size: u32, freeze_quantity: u32, strike_step: u32) -> Self {
        Self {
            lot_size,
            freeze_quantity,
            strike_step,
            index_exchange: default_index_exchange(),
            option_exchange: default_option_exchange(),
            expiry_weekday: Weekday::Tue,
        }
    }

    fn bse(lot_size: u32, freeze_quantity: u32, strike_step: u32) -> Self {
        Self {
            lot_size,
            freeze_quantity,
            strike_step,
            index_exchange: "BSE_INDEX".to_string(),
            option_exchange: "BFO".to_string(),
            expiry_weekday: Weekday::Thu,
        }
    }
}

/// Lookup table keyed by underlying name.
#[derive(Debug, Clone)]
pub struct InstrumentTable {
    specs: HashMap<String, InstrumentSpec>,
    /// Used for underlyings with no entry.
    fallback: InstrumentSpec,
}

impl Default for InstrumentTable {
    fn default() -> Self {
        let mut specs = HashMap::new();
        specs.insert("NIFTY".to_string(), InstrumentSpec::nse(75, 1800, 50));
        specs.insert("BANKNIFTY".to_string(), InstrumentSpec::nse(30, 600, 100));
        specs.insert("FINNIFTY".to_string(), InstrumentSpec::nse(25, 1800, 50));
        specs.insert("MIDCPNIFTY".to_string(), InstrumentSpec::nse(50, 1800, 25));
        specs.insert("SENSEX".to_string(), InstrumentSpec::bse(10, 1000, 100));
        specs.insert("BANKEX".to_string(), InstrumentSpec::bse(15, 1000, 100));
        Self { specs, fallback: InstrumentSpec::nse(75, 1800, 50) }
    }
}

impl InstrumentTable {
    /// Defaults with `overrides` replacing or adding entries.
    pub fn with_overrides(overrides: &HashMap<String, InstrumentSpec>) -> Self {
        let mut table = Self::default();
        for (name, spec) in overrides {
            table.specs.insert(name.to_ascii_uppercase(), spec.clone());
        }
        table
    }

    /// Spec for an underlying name or any derivative symbol of it.
    pub fn get(&self, name_or_symbol: &str) -> &InstrumentSpec {
        let upper = name_or_symbol.to_ascii_uppercase();
        self.specs
            .get(&upper)
            .or_else(|| self.specs.get(base_symbol(&upper)))
            .unwrap_or(&self.fallback)
    }

    /// Whether `day` is the weekly expiry day for `underlying`.
    pub fn is_expiry_day(&self, underlying: &str, day: Weekday) -> bool {
        self.get(underlying).expiry_weekday == day
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_symbol_lookup() {
        let t = InstrumentTable::default();
        assert_eq!(t.get("NIFTY").freeze_quantity, 1800);
        assert_eq!(t.get("BANKNIFTY28OCT2652000PE").freeze_quantity, 600);
        assert_eq!(t.get("sensex").lot_size, 10);
        assert_eq!(t.get("SENSEX").option_exchange, "BFO");
        assert_eq!(t.get("UNKNOWN").freeze_quantity, 1800);
    }

    #[test]
    fn expiry_days() {
        let t = InstrumentTable::default();
        assert!(t.is_expiry_day("NIFTY", Weekday::Tue));
        assert!(t.is_expiry_day("SENSEX", Weekday::Thu));
        assert!(!t.is_expiry_day("SENSEX", Weekday::Tue));
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut o = HashMap::new();
        o.insert("nifty".to_string(), InstrumentSpec::nse(65, 1800, 50));
        let t = InstrumentTable::with_overrides(&o);
        assert_eq!(t.get("NIFTY").lot_size, 65);
        assert_eq!(t.get("BANKNIFTY").lot_size, 30);
    }
}
