//! Margin-bounded lot sizing.
//!
//! `lots = floor(available_margin * grade% / 100 / margin_per_lot)`, clamped
//! to `[1, max_lots]`. Requirements are keyed by instrument, trade kind and
//! whether today is the instrument's expiry day. Long options are sized from
//! cash against a per-lot premium budget instead.
//!
//! A multi-leg strategy is sized as a whole by [`MarginTable::plan_lots`]:
//! hedged groups share one quantity and every sizing draws down the margin
//! left for the next.
//!
//! Missing grades and requirements are errors; nothing is provisioned
//! implicitly.

use std::collections::HashMap;

use chrono::Weekday;
use mirror_core::config::MarginConfig;
use mirror_core::types::{Grade, InstrumentTable, Leg, LegInstrument, OptionType, Side, TradeKind, base_symbol};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarginError {
    #[error("no utilisation percentage configured for grade {0}")]
    MissingGrade(Grade),

    #[error("no margin requirement for {0}")]
    MissingRequirement(MarginKey),

    #[error("invalid margin requirement {per_lot} for {key}")]
    InvalidRequirement { key: MarginKey, per_lot: f64 },

    #[error("invalid premium budget {0} per lot for {1}")]
    InvalidPremium(f64, String),
}

/// Composite key of the requirement table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MarginKey {
    /// Underlying name, upper case.
    pub instrument: String,
    pub trade_kind: TradeKind,
    pub expiry_day: bool,
}

impl MarginKey {
    pub fn new(instrument: &str, trade_kind: TradeKind, expiry_day: bool) -> Self {
        Self { instrument: instrument.to_ascii_uppercase(), trade_kind, expiry_day }
    }
}

impl std::fmt::Display for MarginKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let day = if self.expiry_day { "expiry" } else { "non-expiry" };
        write!(f, "{}/{}/{day}", self.instrument, self.trade_kind)
    }
}

/// Outcome of one sizing, kept for logging and display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotCalculation {
    pub lots: u32,
    /// Lots before clamping.
    pub raw_lots: f64,
    pub budget: f64,
    pub per_lot: f64,
    pub grade: Grade,
    pub grade_pct: f64,
}

impl std::fmt::Display for LotCalculation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "budget {:.2} (grade {} @ {}%) / {:.2} per lot = {:.3} -> {} lots",
            self.budget, self.grade, self.grade_pct, self.per_lot, self.raw_lots, self.lots
        )
    }
}

/// Funds one account brings to a multi-leg sizing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SizingBudget {
    pub margin: f64,
    pub cash: f64,
}

/// Grade percentages and per-lot requirements.
#[derive(Debug, Clone, Default)]
pub struct MarginTable {
    grades: HashMap<Grade, f64>,
    requirements: HashMap<MarginKey, f64>,
    buying_premium: HashMap<String, f64>,
    default_buying_premium: f64,
}

impl MarginTable {
    pub fn from_config(cfg: &MarginConfig) -> Self {
        Self {
            grades: cfg.grades.clone(),
            requirements: cfg
                .requirements
                .iter()
                .map(|r| (MarginKey::new(&r.instrument, r.trade_kind, r.expiry_day), r.per_lot))
                .collect(),
            buying_premium: cfg
                .option_buying_premium
                .iter()
                .map(|(k, v)| (k.to_ascii_uppercase(), *v))
                .collect(),
            default_buying_premium: cfg.default_option_buying_premium,
        }
    }

    pub fn set_grade(&mut self, grade: Grade, pct: f64) {
        self.grades.insert(grade, pct);
    }

    pub fn set_requirement(&mut self, key: MarginKey, per_lot: f64) {
        self.requirements.insert(key, per_lot);
    }

    pub fn grade_pct(&self, grade: Grade) -> Result<f64, MarginError> {
        self.grades.get(&grade).copied().ok_or(MarginError::MissingGrade(grade))
    }

    pub fn requirement(&self, key: &MarginKey) -> Result<f64, MarginError> {
        self.requirements
            .get(key)
            .copied()
            .ok_or_else(|| MarginError::MissingRequirement(key.clone()))
    }

    /// Premium budget per lot for long options on `underlying`.
    pub fn buying_premium(&self, underlying: &str) -> f64 {
        let upper = underlying.to_ascii_uppercase();
        self.buying_premium
            .get(&upper)
            .or_else(|| self.buying_premium.get(base_symbol(&upper)))
            .copied()
            .unwrap_or(self.default_buying_premium)
    }

    /// Lots a margin of `available` supports for `key` at `grade`.
    pub fn calculate_lots(
        &self,
        available: f64,
        grade: Grade,
        key: &MarginKey,
        max_lots: u32,
    ) -> Result<LotCalculation, MarginError> {
        let grade_pct = self.grade_pct(grade)?;
        let per_lot = self.requirement(key)?;
        if per_lot.is_nan() || per_lot <= 0.0 {
            return Err(MarginError::InvalidRequirement { key: key.clone(), per_lot });
        }
        let calc = size(available, grade, grade_pct, per_lot, max_lots);
        debug!("[margin] {key}: {calc}");
        Ok(calc)
    }

    /// Lots for a long option leg, sized from available cash.
    pub fn premium_lots(
        &self,
        available_cash: f64,
        grade: Grade,
        underlying: &str,
        max_lots: u32,
    ) -> Result<LotCalculation, MarginError> {
        let grade_pct = self.grade_pct(grade)?;
        let per_lot = self.buying_premium(underlying);
        if per_lot.is_nan() || per_lot <= 0.0 {
            return Err(MarginError::InvalidPremium(per_lot, underlying.to_string()));
        }
        let calc = size(available_cash, grade, grade_pct, per_lot, max_lots);
        debug!("[margin] {underlying}/buy: {calc}");
        Ok(calc)
    }

    /// Size every leg of a strategy on one account, indexed like `legs`.
    ///
    /// Option legs on one underlying are grouped first. Selling both a call
    /// and a put makes every option leg on that underlying one `SellPair`
    /// group. Otherwise a type with both a buy and a sell forms a
    /// `SellSingle` spread. Each group is sized once and its margin
    /// (`lots * per_lot`) is deducted. The legs left over are sized alone in
    /// declaration order: long options from cash, everything else from the
    /// remaining margin, which each sizing draws down in turn.
    pub fn plan_lots(
        &self,
        legs: &[Leg],
        budget: SizingBudget,
        grade: Grade,
        max_lots: u32,
        instruments: &InstrumentTable,
        today: Weekday,
    ) -> Vec<Result<LotCalculation, MarginError>> {
        let mut remaining = budget.margin.max(0.0);
        let mut plan: Vec<Option<Result<LotCalculation, MarginError>>> = vec![None; legs.len()];

        let mut underlyings: Vec<String> = Vec::new();
        for leg in legs.iter().filter(|l| l.option_type().is_some()) {
            let upper = leg.underlying.to_ascii_uppercase();
            if !underlyings.contains(&upper) {
                underlyings.push(upper);
            }
        }

        for underlying in &underlyings {
            let options: Vec<(usize, OptionType, Side)> = legs
                .iter()
                .enumerate()
                .filter(|(_, l)| l.underlying.eq_ignore_ascii_case(underlying))
                .filter_map(|(i, l)| l.option_type().map(|ot| (i, ot, l.action)))
                .collect();
            if options.len() < 2 {
                continue;
            }
            let has = |ot: OptionType, side: Side| options.iter().any(|&(_, t, s)| t == ot && s == side);

            let groups: Vec<(TradeKind, Vec<usize>)> = if has(OptionType::Call, Side::Sell) && has(OptionType::Put, Side::Sell)
            {
                vec![(TradeKind::SellPair, options.iter().map(|&(i, ..)| i).collect())]
            } else {
                [OptionType::Call, OptionType::Put]
                    .into_iter()
                    .filter(|&ot| has(ot, Side::Sell) && has(ot, Side::Buy))
                    .map(|ot| {
                        let members = options.iter().filter(|&&(_, t, _)| t == ot).map(|&(i, ..)| i).collect();
                        (TradeKind::SellSingle, members)
                    })
                    .collect()
            };

            let expiry_day = instruments.is_expiry_day(underlying, today);
            for (kind, members) in groups {
                let key = MarginKey::new(underlying, kind, expiry_day);
                let calc = self.calculate_lots(remaining, grade, &key, max_lots);
                if let Ok(c) = &calc {
                    remaining = (remaining - f64::from(c.lots) * c.per_lot).max(0.0);
                    debug!("[margin] {key}: {} leg(s) share {} lots, {remaining:.2} left", members.len(), c.lots);
                }
                for i in members {
                    plan[i] = Some(calc.clone());
                }
            }
        }

        let mut out = Vec::with_capacity(legs.len());
        for (leg, planned) in legs.iter().zip(plan) {
            let calc = match planned {
                Some(calc) => calc,
                None if classify_leg(leg, legs) == TradeKind::Buy => {
                    self.premium_lots(budget.cash, grade, &leg.underlying, max_lots)
                }
                None => {
                    let key = leg_key(leg, legs, instruments, today);
                    let calc = self.calculate_lots(remaining, grade, &key, max_lots);
                    if let Ok(c) = &calc {
                        remaining = (remaining - f64::from(c.lots) * c.per_lot).max(0.0);
                    }
                    calc
                }
            };
            out.push(calc);
        }
        out
    }
}

fn size(available: f64, grade: Grade, grade_pct: f64, per_lot: f64, max_lots: u32) -> LotCalculation {
    let budget = available.max(0.0) * grade_pct / 100.0;
    let raw_lots = budget / per_lot;
    let max = max_lots.max(1);
    let lots = (raw_lots.floor().max(0.0) as u32).clamp(1, max);
    LotCalculation { lots, raw_lots, budget, per_lot, grade, grade_pct }
}

/// Margin trade kind of `leg` within its strategy.
///
/// A sold option is `SellPair` when the strategy also sells the opposite
/// option type on the same underlying.
pub fn classify_leg(leg: &Leg, all_legs: &[Leg]) -> TradeKind {
    match (leg.instrument, leg.action) {
        (LegInstrument::Futures, _) => TradeKind::Futures,
        (LegInstrument::Option { .. }, Side::Buy) => TradeKind::Buy,
        (LegInstrument::Option { option_type, .. }, Side::Sell) => {
            let opposite = match option_type {
                OptionType::Call => OptionType::Put,
                OptionType::Put => OptionType::Call,
            };
            let paired = all_legs.iter().any(|other| {
                other.leg_number != leg.leg_number
                    && other.action == Side::Sell
                    && other.underlying.eq_ignore_ascii_case(&leg.underlying)
                    && other.option_type() == Some(opposite)
            });
            if paired { TradeKind::SellPair } else { TradeKind::SellSingle }
        }
    }
}

/// Requirement key for `leg` on `today`.
pub fn leg_key(leg: &Leg, all_legs: &[Leg], instruments: &InstrumentTable, today: Weekday) -> MarginKey {
    MarginKey::new(
        &leg.underlying,
        classify_leg(leg, all_legs),
        instruments.is_expiry_day(&leg.underlying, today),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::types::{PriceType, StrikeSelection};

    fn table() -> MarginTable {
        let mut t = MarginTable::from_config(&MarginConfig::default());
        t.set_requirement(MarginKey::new("NIFTY", TradeKind::SellSingle, false), 100_000.0);
        t.set_requirement(MarginKey::new("NIFTY", TradeKind::SellSingle, true), 150_000.0);
        t
    }

    fn leg(n: u32, ot: Option<OptionType>, action: Side) -> Leg {
        Leg {
            leg_number: n,
            underlying: "NIFTY".into(),
            expiry: "28OCT26".into(),
            instrument: match ot {
                Some(option_type) => LegInstrument::Option { option_type, selection: StrikeSelection::Atm },
                None => LegInstrument::Futures,
            },
            action,
            lots: 1,
            price_type: PriceType::Market,
            limit_price: None,
        }
    }

    #[test]
    fn floor_of_grade_share() {
        let t = table();
        let key = MarginKey::new("nifty", TradeKind::SellSingle, false);
        // 1_000_000 * 65% / 100_000 = 6.5
        let calc = t.calculate_lots(1_000_000.0, Grade::B, &key, 50).unwrap();
        assert_eq!(calc.lots, 6);
        assert!((calc.raw_lots - 6.5).abs() < 1e-9);
        // expiry day requirement is higher
        let key = MarginKey::new("NIFTY", TradeKind::SellSingle, true);
        assert_eq!(t.calculate_lots(1_000_000.0, Grade::A, &key, 50).unwrap().lots, 6);
    }

    #[test]
    fn clamped_to_one_and_max() {
        let t = table();
        let key = MarginKey::new("NIFTY", TradeKind::SellSingle, false);
        assert_eq!(t.calculate_lots(10_000.0, Grade::C, &key, 50).unwrap().lots, 1);
        assert_eq!(t.calculate_lots(0.0, Grade::C, &key, 50).unwrap().lots, 1);
        assert_eq!(t.calculate_lots(100_000_000.0, Grade::A, &key, 50).unwrap().lots, 50);
    }

    #[test]
    fn missing_entries_are_errors() {
        let mut t = table();
        let key = MarginKey::new("BANKNIFTY", TradeKind::SellPair, false);
        assert_eq!(
            t.calculate_lots(1e6, Grade::A, &key, 50),
            Err(MarginError::MissingRequirement(key.clone()))
        );
        t.set_requirement(key.clone(), 0.0);
        assert!(matches!(t.calculate_lots(1e6, Grade::A, &key, 50), Err(MarginError::InvalidRequirement { .. })));

        let empty = MarginTable::default();
        assert_eq!(
            empty.calculate_lots(1e6, Grade::B, &key, 50),
            Err(MarginError::MissingGrade(Grade::B))
        );
    }

    #[test]
    fn premium_budget_for_buyers() {
        let t = table();
        // 200_000 * 95% / 20_000 = 9.5
        assert_eq!(t.premium_lots(200_000.0, Grade::A, "NIFTY", 50).unwrap().lots, 9);
        assert_eq!(t.buying_premium("SENSEX"), 20_000.0);
    }

    #[test]
    fn leg_classification() {
        let legs = vec![
            leg(1, Some(OptionType::Call), Side::Sell),
            leg(2, Some(OptionType::Put), Side::Sell),
            leg(3, Some(OptionType::Call), Side::Buy),
            leg(4, None, Side::Sell),
        ];
        assert_eq!(classify_leg(&legs[0], &legs), TradeKind::SellPair);
        assert_eq!(classify_leg(&legs[1], &legs), TradeKind::SellPair);
        assert_eq!(classify_leg(&legs[2], &legs), TradeKind::Buy);
        assert_eq!(classify_leg(&legs[3], &legs), TradeKind::Futures);
        assert_eq!(classify_leg(&legs[0], &legs[..1]), TradeKind::SellSingle);

        let instruments = InstrumentTable::default();
        let key = leg_key(&legs[0], &legs[..1], &instruments, Weekday::Tue);
        assert_eq!(key, MarginKey::new("NIFTY", TradeKind::SellSingle, true));
    }

    fn lots(plan: &[Result<LotCalculation, MarginError>]) -> Vec<u32> {
        plan.iter().map(|r| r.as_ref().map(|c| c.lots).unwrap_or(0)).collect()
    }

    #[test]
    fn hedged_groups_share_lots_and_draw_down_margin() {
        let mut t = table();
        t.set_requirement(MarginKey::new("NIFTY", TradeKind::SellPair, false), 200_000.0);
        t.set_requirement(MarginKey::new("NIFTY", TradeKind::Futures, false), 150_000.0);
        let legs = vec![
            leg(1, Some(OptionType::Call), Side::Sell),
            leg(2, Some(OptionType::Put), Side::Sell),
            leg(3, Some(OptionType::Call), Side::Buy),
            leg(4, None, Side::Sell),
        ];
        let budget = SizingBudget { margin: 1_000_000.0, cash: 1_000_000.0 };
        let instruments = InstrumentTable::default();

        let plan = t.plan_lots(&legs, budget, Grade::B, 50, &instruments, Weekday::Wed);
        // pair: 650_000 / 200_000 = 3.25 -> 3, leaving 400_000
        // futures: 400_000 * 65% / 150_000 = 1.73 -> 1
        assert_eq!(lots(&plan), [3, 3, 3, 1]);
        assert_eq!(plan[3].as_ref().unwrap().budget, 260_000.0);
    }

    #[test]
    fn spread_sized_on_single_sell_requirement() {
        let t = table();
        let legs = vec![
            leg(1, Some(OptionType::Call), Side::Sell),
            leg(2, Some(OptionType::Call), Side::Buy),
            leg(3, Some(OptionType::Put), Side::Buy),
        ];
        let budget = SizingBudget { margin: 1_000_000.0, cash: 200_000.0 };
        let plan = t.plan_lots(&legs, budget, Grade::B, 50, &InstrumentTable::default(), Weekday::Wed);
        // spread 650_000 / 100_000 -> 6; lone put buy 130_000 / 20_000 -> 6 from cash
        assert_eq!(lots(&plan), [6, 6, 6]);
        assert_eq!(plan[2].as_ref().unwrap().per_lot, 20_000.0);

        // a missing pair requirement fails every member of the group
        let pair = vec![leg(1, Some(OptionType::Call), Side::Sell), leg(2, Some(OptionType::Put), Side::Sell)];
        let plan = t.plan_lots(&pair, budget, Grade::B, 50, &InstrumentTable::default(), Weekday::Wed);
        assert!(plan.iter().all(|r| matches!(r, Err(MarginError::MissingRequirement(_)))));
    }
}
