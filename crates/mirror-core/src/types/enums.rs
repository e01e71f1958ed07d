//! Enumerations used throughout the trading engine.
//!
//! String forms follow the upstream REST/streaming API (`"BUY"`, `"CE"`,
//! `"MIS"`, ...) so the same enums serialize directly into request bodies.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

// ---------------------------------------------------------------------------
// Subscription mode
// ---------------------------------------------------------------------------

/// Streaming subscription mode. The discriminant is the wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Mode {
    /// Last traded price only.
    #[serde(alias = "ltp")]
    Price = 1,
    /// Full quote (OHLC, volume, top of book).
    Quote = 2,
    /// N-level bid/ask ladder.
    Depth = 3,
}

impl Mode {
    /// Wire code sent in subscribe messages.
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code. Unknown codes yield `None`.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Price),
            2 => Some(Self::Quote),
            3 => Some(Self::Depth),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Price => write!(f, "ltp"),
            Self::Quote => write!(f, "quote"),
            Self::Depth => write!(f, "depth"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order side / instrument enums
// ---------------------------------------------------------------------------

/// Order action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The action that closes a position opened with `self`.
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// `+1.0` for long exposure, `-1.0` for short.
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

impl OptionType {
    /// Symbol suffix (`CE` / `PE`).
    #[inline]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Call => "CE",
            Self::Put => "PE",
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Broker product type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Product {
    /// Intraday, squared off by the broker at session end.
    #[default]
    Mis,
    /// Carry-forward derivatives position.
    Nrml,
    Cnc,
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mis => write!(f, "MIS"),
            Self::Nrml => write!(f, "NRML"),
            Self::Cnc => write!(f, "CNC"),
        }
    }
}

/// Order price type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PriceType {
    #[default]
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "SL")]
    StopLimit,
    #[serde(rename = "SL-M")]
    StopMarket,
}

impl std::fmt::Display for PriceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::StopLimit => write!(f, "SL"),
            Self::StopMarket => write!(f, "SL-M"),
        }
    }
}

// ---------------------------------------------------------------------------
// Risk grade
// ---------------------------------------------------------------------------

/// Margin-utilisation grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
}

impl FromStr for Grade {
    type Err = MirrorError;

    /// Accepts `A`/`B`/`C` (any case) and the legacy profile names
    /// `aggressive`/`balanced`/`conservative`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "aggressive" => Ok(Self::A),
            "b" | "balanced" => Ok(Self::B),
            "c" | "conservative" => Ok(Self::C),
            other => Err(MirrorError::Config(format!("unknown grade '{other}'"))),
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
        }
    }
}

// ---------------------------------------------------------------------------
// Margin trade classification
// ---------------------------------------------------------------------------

/// Trade classification used to key margin-per-lot requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind {
    /// A single naked short option (`sell_c_p`).
    #[serde(alias = "sell_c_p")]
    SellSingle,
    /// Call and put sold together on one underlying (`sell_c_and_p`).
    #[serde(alias = "sell_c_and_p")]
    SellPair,
    /// Long option, bounded by premium rather than margin.
    Buy,
    Futures,
}

impl std::fmt::Display for TradeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SellSingle => "sell_single",
            Self::SellPair => "sell_pair",
            Self::Buy => "buy",
            Self::Futures => "futures",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_codes() {
        assert_eq!(Mode::Price.code(), 1);
        assert_eq!(Mode::from_code(3), Some(Mode::Depth));
        assert_eq!(Mode::from_code(9), None);
    }

    #[test]
    fn grade_accepts_legacy_names() {
        assert_eq!("aggressive".parse::<Grade>().unwrap(), Grade::A);
        assert_eq!("Balanced".parse::<Grade>().unwrap(), Grade::B);
        assert_eq!("c".parse::<Grade>().unwrap(), Grade::C);
        assert!("d".parse::<Grade>().is_err());
    }

    #[test]
    fn wire_strings() {
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"SELL\"");
        assert_eq!(serde_json::to_string(&OptionType::Put).unwrap(), "\"PE\"");
        assert_eq!(serde_json::to_string(&PriceType::StopMarket).unwrap(), "\"SL-M\"");
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }
}
