//! Strategy and leg definitions.
//!
//! Strategies are persisted by an external store; the engine reads them to
//! dispatch orders and to configure per-strategy risk monitoring.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::enums::{Grade, OptionType, PriceType, Product, Side};
use crate::error::MirrorError;

// ---------------------------------------------------------------------------
// Leg
// ---------------------------------------------------------------------------

/// How a leg picks its option strike.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrikeSelection {
    /// An explicit strike price.
    Strike { strike: i64 },
    /// The at-the-money strike.
    Atm,
    /// `offset` strikes in the money (clamped to 1..=20).
    Itm { offset: u32 },
    /// `offset` strikes out of the money (clamped to 1..=20).
    Otm { offset: u32 },
    /// The strike whose premium is closest to `target`.
    Premium { target: f64 },
}

/// What a leg trades.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LegInstrument {
    Option {
        option_type: OptionType,
        selection: StrikeSelection,
    },
    Futures,
}

/// One instrument-level component of a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub leg_number: u32,
    /// Underlying name (`NIFTY`, `BANKNIFTY`, ...).
    pub underlying: String,
    /// Expiry code as it appears in symbols (`28OCT26`).
    pub expiry: String,
    pub instrument: LegInstrument,
    pub action: Side,
    /// Quantity in lots.
    pub lots: u32,
    #[serde(default)]
    pub price_type: PriceType,
    /// Limit price for `LIMIT` legs.
    #[serde(default)]
    pub limit_price: Option<f64>,
}

impl Leg {
    pub fn option_type(&self) -> Option<OptionType> {
        match self.instrument {
            LegInstrument::Option { option_type, .. } => Some(option_type),
            LegInstrument::Futures => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Lot sizing
// ---------------------------------------------------------------------------

/// How leg quantities are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LotSizing {
    /// Use each leg's `lots` unchanged.
    FixedLots,
    /// Derive lots from available margin at the given grade.
    Grade(Grade),
}

impl FromStr for LotSizing {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("fixed_lots") {
            return Ok(Self::FixedLots);
        }
        let grade = s.strip_prefix("grade_").unwrap_or(s);
        grade.parse().map(Self::Grade)
    }
}

impl TryFrom<String> for LotSizing {
    type Error = MirrorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LotSizing> for String {
    fn from(value: LotSizing) -> Self {
        match value {
            LotSizing::FixedLots => "fixed_lots".to_string(),
            LotSizing::Grade(g) => format!("grade_{g}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Risk parameters
// ---------------------------------------------------------------------------

/// Unit of a trailing-stop distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingKind {
    /// Percent of the favourable move given back.
    Percentage,
    /// Price points behind the best price.
    Points,
    /// Currency amount for the whole position, converted to points per unit.
    Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    pub kind: TrailingKind,
    pub value: f64,
}

/// Which Supertrend flip closes the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitType {
    /// Flip to bullish (+1).
    Breakout,
    /// Flip to bearish (-1).
    Breakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TechnicalExit {
    pub exit_type: ExitType,
    #[serde(default = "default_period")]
    pub period: usize,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Candle interval in minutes.
    #[serde(default = "default_timeframe")]
    pub timeframe_minutes: u32,
    /// Number of candles requested per evaluation.
    #[serde(default = "default_lookback")]
    pub lookback: usize,
}

fn default_period() -> usize {
    7
}

fn default_multiplier() -> f64 {
    3.0
}

fn default_timeframe() -> u32 {
    5
}

fn default_lookback() -> usize {
    100
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskParams {
    /// Loss limit; the sign is ignored (`-5000` and `5000` mean the same).
    #[serde(default)]
    pub max_loss: Option<f64>,
    #[serde(default)]
    pub max_profit: Option<f64>,
    #[serde(default)]
    pub trailing_stop: Option<TrailingStop>,
    #[serde(default)]
    pub technical_exit: Option<TechnicalExit>,
}

impl RiskParams {
    pub fn is_empty(&self) -> bool {
        self.max_loss.is_none()
            && self.max_profit.is_none()
            && self.trailing_stop.is_none()
            && self.technical_exit.is_none()
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub legs: Vec<Leg>,
    #[serde(default)]
    pub risk: RiskParams,
    /// Accounts the strategy trades on.
    #[serde(default)]
    pub accounts: Vec<String>,
    pub lot_sizing: LotSizing,
    #[serde(default)]
    pub product: Product,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}
