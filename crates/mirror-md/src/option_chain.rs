//! Option chain engine.
//!
//! Maintains, per `(underlying, expiry)`:
//!
//! - the ATM strike derived from the underlying's live price,
//! - a ladder of `2 * half_width + 1` strikes around it, tagged ITM/ATM/OTM,
//! - a per-symbol depth cache with a freshness TTL.
//!
//! The ladder is rebuilt only when the ATM moves. The new ladder is swapped
//! in as a whole and the option subscriptions are diffed against the old
//! one: strikes entering the ladder are acquired, strikes leaving are
//! released.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use mirror_core::config::ChainConfig;
use mirror_core::subscription::{Subscription, SubscriptionSink};
use mirror_core::time_util;
use mirror_core::types::{
    DepthUpdate, InstrumentSpec, MarketEvent, Mode, OptionType, Side, StrikeSelection, option_symbol,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::MarketHandler;

/// ITM/OTM offsets requested by legs are clamped to `1..=MAX_STRIKE_OFFSET`.
pub const MAX_STRIKE_OFFSET: u32 = 20;

/// Strikes scanned on each side of ATM for a premium match.
pub const PREMIUM_SCAN_WIDTH: i64 = 20;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ChainError {
    #[error("no underlying price yet for {0}")]
    NoLadder(String),

    #[error("no fresh premium near {target} for {underlying} {option_type}")]
    NoPremium {
        underlying: String,
        option_type: OptionType,
        target: f64,
    },
}

// ---------------------------------------------------------------------------
// ATM + ladder
// ---------------------------------------------------------------------------

/// Nearest multiple of `step` to `price`. An exact half-way price rounds up.
pub fn compute_atm_strike(price: f64, step: u32) -> i64 {
    if step == 0 {
        return price.round() as i64;
    }
    let step = f64::from(step);
    ((price / step + 0.5).floor() * step) as i64
}

/// Moneyness tag of a strike from one option type's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StrikeTag {
    Itm(u32),
    Atm,
    Otm(u32),
}

impl StrikeTag {
    /// Tag for a signed ladder offset (negative = below ATM).
    ///
    /// Calls are in the money below ATM; puts are mirrored.
    pub fn for_offset(offset: i32, option_type: OptionType) -> Self {
        let signed = match option_type {
            OptionType::Call => offset,
            OptionType::Put => -offset,
        };
        match signed {
            0 => Self::Atm,
            s if s < 0 => Self::Itm(s.unsigned_abs()),
            s => Self::Otm(s as u32),
        }
    }

    /// Ladder offset that carries this tag for `option_type`.
    pub fn offset(self, option_type: OptionType) -> i32 {
        let call = match self {
            Self::Atm => 0,
            Self::Itm(k) => -(k as i32),
            Self::Otm(k) => k as i32,
        };
        match option_type {
            OptionType::Call => call,
            OptionType::Put => -call,
        }
    }
}

impl std::fmt::Display for StrikeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Atm => write!(f, "ATM"),
            Self::Itm(k) => write!(f, "ITM{k}"),
            Self::Otm(k) => write!(f, "OTM{k}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LadderStrike {
    pub strike: i64,
    /// Steps from ATM; negative below.
    pub offset: i32,
}

impl LadderStrike {
    pub fn tag(&self, option_type: OptionType) -> StrikeTag {
        StrikeTag::for_offset(self.offset, option_type)
    }
}

/// Immutable strike ladder around one ATM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrikeLadder {
    pub underlying: String,
    pub expiry: String,
    pub step: u32,
    pub atm: i64,
    /// Ascending by strike.
    pub strikes: Vec<LadderStrike>,
}

/// `2 * half_width + 1` ascending strikes centred on `atm`.
pub fn build_ladder(underlying: &str, expiry: &str, atm: i64, step: u32, half_width: u32) -> StrikeLadder {
    let hw = half_width as i32;
    let strikes = (-hw..=hw)
        .map(|offset| LadderStrike { strike: atm + i64::from(offset) * i64::from(step), offset })
        .collect();
    StrikeLadder {
        underlying: underlying.to_string(),
        expiry: expiry.to_string(),
        step,
        atm,
        strikes,
    }
}

impl StrikeLadder {
    pub fn contains(&self, strike: i64) -> bool {
        self.strikes.iter().any(|s| s.strike == strike)
    }

    /// Strike carrying `tag` for `option_type`, if inside the ladder.
    pub fn strike_for_tag(&self, tag: StrikeTag, option_type: OptionType) -> Option<i64> {
        let offset = tag.offset(option_type);
        self.strikes.iter().find(|s| s.offset == offset).map(|s| s.strike)
    }

    /// Option symbols for every strike, both sides.
    pub fn option_symbols(&self) -> Vec<String> {
        self.strikes
            .iter()
            .flat_map(|s| {
                [OptionType::Call, OptionType::Put]
                    .map(|ot| option_symbol(&self.underlying, &self.expiry, s.strike, ot))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Depth cache
// ---------------------------------------------------------------------------

/// Top-of-book snapshot for one option symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub exchange: String,
    pub ltp: f64,
    pub bid: f64,
    pub bid_qty: f64,
    pub ask: f64,
    pub ask_qty: f64,
    /// `ask - bid` when both sides are quoted, else 0.
    pub spread: f64,
    pub volume: f64,
    pub open_interest: f64,
    pub updated_ms: u64,
}

impl From<&DepthUpdate> for DepthSnapshot {
    fn from(d: &DepthUpdate) -> Self {
        let bid = d.best_bid().unwrap_or_default();
        let ask = d.best_ask().unwrap_or_default();
        let spread = if bid.price > 0.0 && ask.price > 0.0 { ask.price - bid.price } else { 0.0 };
        Self {
            symbol: d.symbol.clone(),
            exchange: d.exchange.clone(),
            ltp: d.ltp,
            bid: bid.price,
            bid_qty: bid.quantity,
            ask: ask.price,
            ask_qty: ask.quantity,
            spread,
            volume: d.volume,
            open_interest: d.open_interest,
            updated_ms: d.timestamp_ms,
        }
    }
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum DepthRead {
    Fresh(DepthSnapshot),
    /// Present but older than the TTL. Kept, not purged.
    Stale(DepthSnapshot),
    Missing,
}

impl DepthRead {
    pub fn fresh(self) -> Option<DepthSnapshot> {
        match self {
            Self::Fresh(s) => Some(s),
            _ => None,
        }
    }

    /// Snapshot regardless of freshness.
    pub fn any(self) -> Option<DepthSnapshot> {
        match self {
            Self::Fresh(s) | Self::Stale(s) => Some(s),
            Self::Missing => None,
        }
    }
}

#[derive(Debug)]
pub struct DepthCache {
    ttl: Duration,
    entries: RwLock<AHashMap<String, DepthSnapshot>>,
}

impl DepthCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: RwLock::new(AHashMap::new()) }
    }

    /// Overwrite the entry for the snapshot's symbol.
    pub fn update(&self, snapshot: DepthSnapshot) {
        self.entries.write().insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn read(&self, symbol: &str) -> DepthRead {
        self.read_at(symbol, time_util::now_ms())
    }

    pub fn read_at(&self, symbol: &str, now_ms: u64) -> DepthRead {
        match self.entries.read().get(symbol) {
            None => DepthRead::Missing,
            Some(s) if now_ms.saturating_sub(s.updated_ms) > self.ttl.as_millis() as u64 => {
                DepthRead::Stale(s.clone())
            }
            Some(s) => DepthRead::Fresh(s.clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Chain view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ChainSide {
    pub symbol: String,
    pub tag: String,
    pub quote: Option<DepthSnapshot>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainRow {
    pub strike: i64,
    pub offset: i32,
    pub ce: ChainSide,
    pub pe: ChainSide,
}

/// Point-in-time chain for display and push.
#[derive(Debug, Clone, Serialize)]
pub struct ChainView {
    pub underlying: String,
    pub expiry: String,
    pub spot: Option<f64>,
    pub atm: Option<i64>,
    /// Σ PE open interest / Σ CE open interest.
    pub pcr: Option<f64>,
    pub rows: Vec<ChainRow>,
}

// ---------------------------------------------------------------------------
// OptionChain
// ---------------------------------------------------------------------------

/// Live chain for one `(underlying, expiry)`.
pub struct OptionChain {
    underlying: String,
    expiry: String,
    spec: InstrumentSpec,
    half_width: u32,
    /// `{underlying}{expiry}`; option symbols of this chain start with it.
    symbol_prefix: String,
    ladder: RwLock<Option<Arc<StrikeLadder>>>,
    spot: Mutex<Option<f64>>,
    depth: DepthCache,
    sink: Arc<dyn SubscriptionSink>,
}

impl OptionChain {
    pub fn new(cfg: &ChainConfig, spec: InstrumentSpec, sink: Arc<dyn SubscriptionSink>) -> Self {
        let underlying = cfg.underlying.to_ascii_uppercase();
        let symbol_prefix = format!("{underlying}{}", cfg.expiry);
        Self {
            underlying,
            expiry: cfg.expiry.clone(),
            spec,
            half_width: cfg.half_width,
            symbol_prefix,
            ladder: RwLock::new(None),
            spot: Mutex::new(None),
            depth: DepthCache::new(cfg.depth_ttl()),
            sink,
        }
    }

    pub fn underlying(&self) -> &str {
        &self.underlying
    }

    pub fn expiry(&self) -> &str {
        &self.expiry
    }

    pub fn spec(&self) -> &InstrumentSpec {
        &self.spec
    }

    /// Quote-mode subscription for the underlying index.
    pub fn underlying_subscription(&self) -> Subscription {
        Subscription::new(&self.underlying, &self.spec.index_exchange, Mode::Quote)
    }

    fn option_subscription(&self, symbol: &str) -> Subscription {
        Subscription::new(symbol, &self.spec.option_exchange, Mode::Depth)
    }

    /// Subscribe to the underlying. Options follow once a price arrives.
    pub fn start(&self) {
        info!("[chain-{}] tracking expiry {} (±{} strikes)", self.underlying, self.expiry, self.half_width);
        self.sink.subscribe(self.underlying_subscription());
    }

    /// Release every subscription this chain holds.
    pub fn stop(&self) {
        let ladder = self.ladder.write().take();
        if let Some(ladder) = ladder {
            for symbol in ladder.option_symbols() {
                self.sink.unsubscribe(self.option_subscription(&symbol));
            }
        }
        self.sink.unsubscribe(self.underlying_subscription());
        info!("[chain-{}] stopped", self.underlying);
    }

    pub fn ladder(&self) -> Option<Arc<StrikeLadder>> {
        self.ladder.read().clone()
    }

    pub fn atm(&self) -> Option<i64> {
        self.ladder.read().as_ref().map(|l| l.atm)
    }

    /// Last underlying price seen.
    pub fn spot(&self) -> Option<f64> {
        *self.spot.lock()
    }

    /// Feed an underlying price. Returns `true` when the ATM moved and the
    /// ladder was replaced.
    pub fn on_underlying_price(&self, price: f64) -> bool {
        if price.is_nan() || price <= 0.0 {
            return false;
        }
        *self.spot.lock() = Some(price);

        let atm = compute_atm_strike(price, self.spec.strike_step);
        let next = Arc::new(build_ladder(&self.underlying, &self.expiry, atm, self.spec.strike_step, self.half_width));
        let previous = {
            let mut guard = self.ladder.write();
            if guard.as_ref().is_some_and(|l| l.atm == atm) {
                return false;
            }
            guard.replace(Arc::clone(&next))
        };

        let new_syms: BTreeSet<String> = next.option_symbols().into_iter().collect();
        let old_syms: BTreeSet<String> = previous
            .as_ref()
            .map(|l| l.option_symbols().into_iter().collect())
            .unwrap_or_default();

        let added: Vec<_> = new_syms.difference(&old_syms).collect();
        let dropped: Vec<_> = old_syms.difference(&new_syms).collect();
        for symbol in &added {
            self.sink.subscribe(self.option_subscription(symbol));
        }
        for symbol in &dropped {
            self.sink.unsubscribe(self.option_subscription(symbol));
        }

        info!(
            "[chain-{}] ATM {} -> {atm} (spot {price:.2}); +{} / -{} option streams",
            self.underlying,
            previous.map(|l| l.atm.to_string()).unwrap_or_else(|| "none".into()),
            added.len(),
            dropped.len(),
        );
        true
    }

    /// Cache a depth update for one of this chain's options.
    pub fn on_depth_update(&self, update: &DepthUpdate) {
        self.depth.update(DepthSnapshot::from(update));
    }

    pub fn depth(&self, symbol: &str) -> DepthRead {
        self.depth.read(symbol)
    }

    pub fn depth_cache(&self) -> &DepthCache {
        &self.depth
    }

    pub fn option_symbol(&self, strike: i64, option_type: OptionType) -> String {
        option_symbol(&self.underlying, &self.expiry, strike, option_type)
    }

    /// Price to trade at: ask for buys, bid for sells, ltp when that side
    /// is empty. Stale snapshots are not used.
    pub fn execution_price(&self, symbol: &str, side: Side) -> Option<f64> {
        let snap = self.depth.read(symbol).fresh()?;
        let touch = match side {
            Side::Buy => snap.ask,
            Side::Sell => snap.bid,
        };
        if touch > 0.0 {
            Some(touch)
        } else if snap.ltp > 0.0 {
            Some(snap.ltp)
        } else {
            None
        }
    }

    /// Resolve a strike-selection rule against the current ATM.
    ///
    /// ITM/OTM offsets are clamped to `1..=MAX_STRIKE_OFFSET` and computed
    /// arithmetically, so they need not lie inside the ladder.
    pub fn resolve_strike(&self, selection: StrikeSelection, option_type: OptionType) -> Result<i64, ChainError> {
        if let StrikeSelection::Strike { strike } = selection {
            return Ok(strike);
        }
        let atm = self.atm().ok_or_else(|| ChainError::NoLadder(self.underlying.clone()))?;
        let step = i64::from(self.spec.strike_step);
        let clamp = |k: u32| i64::from(k.clamp(1, MAX_STRIKE_OFFSET));
        match selection {
            StrikeSelection::Strike { strike } => Ok(strike),
            StrikeSelection::Atm => Ok(atm),
            StrikeSelection::Itm { offset } => {
                let delta = clamp(offset) * step;
                Ok(match option_type {
                    OptionType::Call => atm - delta,
                    OptionType::Put => atm + delta,
                })
            }
            StrikeSelection::Otm { offset } => {
                let delta = clamp(offset) * step;
                Ok(match option_type {
                    OptionType::Call => atm + delta,
                    OptionType::Put => atm - delta,
                })
            }
            StrikeSelection::Premium { target } => self.premium_near(target, option_type).map(|(strike, _)| strike),
        }
    }

    /// Strike within `±PREMIUM_SCAN_WIDTH` of ATM whose fresh ltp is closest
    /// to `target`. Ties prefer the premium below the target.
    pub fn premium_near(&self, target: f64, option_type: OptionType) -> Result<(i64, f64), ChainError> {
        let atm = self.atm().ok_or_else(|| ChainError::NoLadder(self.underlying.clone()))?;
        let step = i64::from(self.spec.strike_step);
        let now = time_util::now_ms();

        let mut best: Option<(i64, f64)> = None;
        for k in -PREMIUM_SCAN_WIDTH..=PREMIUM_SCAN_WIDTH {
            let strike = atm + k * step;
            let symbol = self.option_symbol(strike, option_type);
            let Some(snap) = self.depth.read_at(&symbol, now).fresh() else {
                continue;
            };
            if snap.ltp <= 0.0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, prem)) => {
                    let (d_new, d_best) = ((snap.ltp - target).abs(), (prem - target).abs());
                    d_new < d_best || (d_new == d_best && snap.ltp < target && prem >= target)
                }
            };
            if better {
                best = Some((strike, snap.ltp));
            }
        }

        best.ok_or_else(|| ChainError::NoPremium {
            underlying: self.underlying.clone(),
            option_type,
            target,
        })
    }

    /// Strike carrying `tag` in the current ladder.
    pub fn strike_for_tag(&self, tag: StrikeTag, option_type: OptionType) -> Option<i64> {
        self.ladder.read().as_ref()?.strike_for_tag(tag, option_type)
    }

    /// Snapshot of the whole chain.
    pub fn view(&self) -> ChainView {
        let ladder = self.ladder();
        let now = time_util::now_ms();
        let side = |strike: &LadderStrike, ot: OptionType| {
            let symbol = self.option_symbol(strike.strike, ot);
            let read = self.depth.read_at(&symbol, now);
            let stale = matches!(read, DepthRead::Stale(_));
            ChainSide { tag: strike.tag(ot).to_string(), quote: read.any(), stale, symbol }
        };

        let rows: Vec<ChainRow> = ladder
            .as_ref()
            .map(|l| {
                l.strikes
                    .iter()
                    .map(|s| ChainRow {
                        strike: s.strike,
                        offset: s.offset,
                        ce: side(s, OptionType::Call),
                        pe: side(s, OptionType::Put),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let ce_oi: f64 = rows.iter().filter_map(|r| r.ce.quote.as_ref()).map(|q| q.open_interest).sum();
        let pe_oi: f64 = rows.iter().filter_map(|r| r.pe.quote.as_ref()).map(|q| q.open_interest).sum();
        let pcr = (ce_oi > 0.0).then(|| pe_oi / ce_oi);

        ChainView {
            underlying: self.underlying.clone(),
            expiry: self.expiry.clone(),
            spot: self.spot(),
            atm: ladder.map(|l| l.atm),
            pcr,
            rows,
        }
    }
}

impl MarketHandler for OptionChain {
    fn name(&self) -> &str {
        &self.symbol_prefix
    }

    fn on_event(&self, event: &MarketEvent) -> anyhow::Result<()> {
        match event {
            MarketEvent::Price(_) | MarketEvent::Quote(_) if event.symbol() == self.underlying => {
                self.on_underlying_price(event.ltp());
            }
            MarketEvent::Depth(d) if d.symbol.starts_with(&self.symbol_prefix) => {
                self.on_depth_update(d);
            }
            _ => debug!("[chain-{}] ignoring {}", self.underlying, event.symbol()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::types::{DepthLevel, InstrumentTable, PriceUpdate};

    #[derive(Default)]
    struct RecordingSink {
        subs: Mutex<Vec<Subscription>>,
        unsubs: Mutex<Vec<Subscription>>,
    }

    impl SubscriptionSink for RecordingSink {
        fn subscribe(&self, sub: Subscription) {
            self.subs.lock().push(sub);
        }

        fn unsubscribe(&self, sub: Subscription) {
            self.unsubs.lock().push(sub);
        }
    }

    fn chain(half_width: u32) -> (OptionChain, Arc<RecordingSink>) {
        let cfg = ChainConfig {
            underlying: "NIFTY".into(),
            expiry: "28OCT26".into(),
            half_width,
            depth_ttl_ms: 30_000,
        };
        let sink = Arc::new(RecordingSink::default());
        let spec = InstrumentTable::default().get("NIFTY").clone();
        (OptionChain::new(&cfg, spec, sink.clone()), sink)
    }

    fn depth(symbol: &str, ltp: f64, bid: f64, ask: f64, oi: f64, ts: u64) -> DepthUpdate {
        DepthUpdate {
            symbol: symbol.into(),
            exchange: "NFO".into(),
            ltp,
            bids: vec![DepthLevel { price: bid, quantity: 75.0 }],
            asks: vec![DepthLevel { price: ask, quantity: 150.0 }],
            volume: 0.0,
            open_interest: oi,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn atm_nearest_multiple() {
        assert_eq!(compute_atm_strike(25012.0, 50), 25000);
        assert_eq!(compute_atm_strike(25026.0, 50), 25050);
        assert_eq!(compute_atm_strike(25000.0, 50), 25000);
        assert_eq!(compute_atm_strike(56049.9, 100), 56000);
        assert_eq!(compute_atm_strike(24987.5, 25), 25000);
    }

    #[test]
    fn atm_tie_rounds_up() {
        assert_eq!(compute_atm_strike(25025.0, 50), 25050);
        assert_eq!(compute_atm_strike(56050.0, 100), 56100);
    }

    #[test]
    fn atm_is_always_a_multiple_and_within_half_step() {
        for i in 0..500 {
            let price = 20000.0 + f64::from(i) * 7.3;
            let atm = compute_atm_strike(price, 50);
            assert_eq!(atm % 50, 0);
            assert!((atm as f64 - price).abs() <= 25.0);
        }
    }

    #[test]
    fn ladder_shape_and_tags() {
        let ladder = build_ladder("NIFTY", "28OCT26", 25000, 50, 3);
        assert_eq!(ladder.strikes.len(), 7);
        assert!(ladder.strikes.windows(2).all(|w| w[1].strike - w[0].strike == 50));
        assert_eq!(ladder.strikes[3].strike, 25000);
        for s in &ladder.strikes {
            assert_eq!(s.strike - 25000, i64::from(s.offset) * 50);
            match s.tag(OptionType::Call) {
                StrikeTag::Itm(k) => assert!(s.strike < 25000 && k as i32 == -s.offset),
                StrikeTag::Otm(k) => assert!(s.strike > 25000 && k as i32 == s.offset),
                StrikeTag::Atm => assert_eq!(s.offset, 0),
            }
        }
        assert_eq!(ladder.strikes[0].tag(OptionType::Put), StrikeTag::Otm(3));
        assert_eq!(ladder.strike_for_tag(StrikeTag::Itm(2), OptionType::Call), Some(24900));
        assert_eq!(ladder.strike_for_tag(StrikeTag::Itm(2), OptionType::Put), Some(25100));
        assert_eq!(ladder.strike_for_tag(StrikeTag::Otm(9), OptionType::Put), None);
        assert_eq!(StrikeTag::Itm(3).to_string(), "ITM3");
    }

    #[test]
    fn first_price_subscribes_full_ladder() {
        let (chain, sink) = chain(2);
        chain.start();
        assert_eq!(sink.subs.lock()[0], Subscription::new("NIFTY", "NSE_INDEX", Mode::Quote));

        assert!(chain.on_underlying_price(25012.0));
        assert_eq!(chain.atm(), Some(25000));
        let subs = sink.subs.lock();
        assert_eq!(subs.len(), 1 + 5 * 2);
        assert!(subs.iter().skip(1).all(|s| s.mode == Mode::Depth && s.exchange == "NFO"));
        assert!(subs.contains(&Subscription::new("NIFTY28OCT2624900PE", "NFO", Mode::Depth)));
    }

    #[test]
    fn same_atm_does_not_rebuild() {
        let (chain, sink) = chain(2);
        assert!(chain.on_underlying_price(25012.0));
        let before = chain.ladder().unwrap();
        assert!(!chain.on_underlying_price(25020.0));
        assert!(Arc::ptr_eq(&before, &chain.ladder().unwrap()));
        assert_eq!(sink.subs.lock().len(), 10);
        assert_eq!(chain.spot(), Some(25020.0));
    }

    #[test]
    fn atm_move_diffs_subscriptions() {
        let (chain, sink) = chain(2);
        chain.on_underlying_price(25000.0);
        sink.subs.lock().clear();

        assert!(chain.on_underlying_price(25050.0));
        let subs: Vec<String> = sink.subs.lock().iter().map(|s| s.symbol.clone()).collect();
        let unsubs: Vec<String> = sink.unsubs.lock().iter().map(|s| s.symbol.clone()).collect();
        assert_eq!(subs.len(), 2);
        assert!(subs.contains(&"NIFTY28OCT2625150CE".to_string()));
        assert_eq!(unsubs.len(), 2);
        assert!(unsubs.contains(&"NIFTY28OCT2624900PE".to_string()));
    }

    #[test]
    fn stop_releases_everything() {
        let (chain, sink) = chain(1);
        chain.start();
        chain.on_underlying_price(25000.0);
        chain.stop();
        assert_eq!(sink.unsubs.lock().len(), 3 * 2 + 1);
        assert!(chain.ladder().is_none());
    }

    #[test]
    fn depth_cache_reports_stale() {
        let cache = DepthCache::new(Duration::from_millis(1000));
        cache.update(DepthSnapshot::from(&depth("A", 10.0, 9.5, 10.5, 0.0, 5_000)));
        assert!(matches!(cache.read_at("A", 5_500), DepthRead::Fresh(_)));
        match cache.read_at("A", 7_000) {
            DepthRead::Stale(s) => assert_eq!(s.spread, 1.0),
            other => panic!("expected stale, got {other:?}"),
        }
        assert_eq!(cache.read_at("B", 0), DepthRead::Missing);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn execution_price_uses_touch_then_ltp() {
        let (chain, _) = chain(2);
        let now = time_util::now_ms();
        chain.on_depth_update(&depth("NIFTY28OCT2625000CE", 101.0, 100.5, 101.5, 0.0, now));
        assert_eq!(chain.execution_price("NIFTY28OCT2625000CE", Side::Buy), Some(101.5));
        assert_eq!(chain.execution_price("NIFTY28OCT2625000CE", Side::Sell), Some(100.5));

        chain.on_depth_update(&depth("NIFTY28OCT2625000PE", 90.0, 0.0, 0.0, 0.0, now));
        assert_eq!(chain.execution_price("NIFTY28OCT2625000PE", Side::Buy), Some(90.0));
        assert_eq!(chain.execution_price("NIFTY28OCT2625050PE", Side::Buy), None);
    }

    #[test]
    fn resolve_offsets_clamped_and_mirrored() {
        let (chain, _) = chain(2);
        assert_eq!(
            chain.resolve_strike(StrikeSelection::Atm, OptionType::Call),
            Err(ChainError::NoLadder("NIFTY".into()))
        );
        chain.on_underlying_price(25000.0);
        let r = |sel, ot| chain.resolve_strike(sel, ot).unwrap();
        assert_eq!(r(StrikeSelection::Atm, OptionType::Put), 25000);
        assert_eq!(r(StrikeSelection::Itm { offset: 2 }, OptionType::Call), 24900);
        assert_eq!(r(StrikeSelection::Itm { offset: 2 }, OptionType::Put), 25100);
        assert_eq!(r(StrikeSelection::Otm { offset: 1 }, OptionType::Call), 25050);
        assert_eq!(r(StrikeSelection::Otm { offset: 0 }, OptionType::Put), 24950);
        assert_eq!(r(StrikeSelection::Otm { offset: 99 }, OptionType::Call), 26000);
        assert_eq!(r(StrikeSelection::Strike { strike: 24000 }, OptionType::Call), 24000);
    }

    #[test]
    fn premium_tie_prefers_below_target() {
        let (chain, _) = chain(5);
        chain.on_underlying_price(25000.0);
        let now = time_util::now_ms();
        chain.on_depth_update(&depth("NIFTY28OCT2625100CE", 60.0, 0.0, 0.0, 0.0, now));
        chain.on_depth_update(&depth("NIFTY28OCT2625150CE", 40.0, 0.0, 0.0, 0.0, now));
        chain.on_depth_update(&depth("NIFTY28OCT2625200CE", 20.0, 0.0, 0.0, 0.0, now));
        assert_eq!(chain.premium_near(50.0, OptionType::Call), Ok((25150, 40.0)));
        assert_eq!(chain.premium_near(22.0, OptionType::Call), Ok((25200, 20.0)));
        assert!(matches!(chain.premium_near(50.0, OptionType::Put), Err(ChainError::NoPremium { .. })));
    }

    #[test]
    fn handler_routes_underlying_and_options() {
        let (chain, _) = chain(1);
        let now = time_util::now_ms();
        chain
            .on_event(&MarketEvent::Price(PriceUpdate {
                symbol: "NIFTY".into(),
                exchange: "NSE_INDEX".into(),
                ltp: 25040.0,
                timestamp_ms: now,
            }))
            .unwrap();
        assert_eq!(chain.atm(), Some(25050));

        chain.on_event(&MarketEvent::Depth(depth("NIFTY28OCT2625050CE", 80.0, 79.0, 81.0, 1000.0, now))).unwrap();
        chain.on_event(&MarketEvent::Depth(depth("NIFTY28OCT2625050PE", 70.0, 69.0, 71.0, 1500.0, now))).unwrap();
        chain.on_event(&MarketEvent::Depth(depth("BANKNIFTY28OCT2656000CE", 1.0, 1.0, 1.0, 1.0, now))).unwrap();
        assert_eq!(chain.depth_cache().len(), 2);

        let view = chain.view();
        assert_eq!(view.rows.len(), 3);
        assert_eq!(view.atm, Some(25050));
        assert_eq!(view.pcr, Some(1.5));
        assert_eq!(view.rows[1].ce.tag, "ATM");
        assert_eq!(view.rows[0].pe.tag, "OTM1");
    }
}
