//! Per-strategy risk monitoring.
//!
//! Each active strategy with risk parameters gets one task that wakes on a
//! fixed tick and checks, in order:
//!
//! - `max_loss`: strategy P&L `<= -|max_loss|`
//! - `max_profit`: strategy P&L `>= |max_profit|`
//! - trailing stop, per entered execution
//! - Supertrend flip on the strategy's spread series, at candle close
//!
//! P&L is realised (exited rows) plus unrealised (entered rows at the price
//! book's last price). Every breached condition is logged as its own
//! [`RiskEvent`]; all breaches of a tick share one exit dispatch, after which
//! the strategy is deactivated. Rows still `pending` at that point are exited
//! as soon as the poller confirms their fill; the monitor ends once none are
//! left.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use mirror_core::config::RiskConfig;
use mirror_core::time_util::utc_now;
use mirror_core::types::{
    Candle, Execution, ExecutionStatus, ExitType, RiskEvent, RiskEventType, Side, Strategy, TechnicalExit, TrailingKind,
    TrailingStop,
};
use mirror_td::BrokerApi;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::event::EngineEvent;
use crate::executor::Executor;
use crate::signal::{Direction, supertrend_candles};

/// Bars beyond `period` needed before the Supertrend is trusted.
pub const MIN_EXTRA_BARS: usize = 5;

/// Trading minutes in one session, used to size history requests.
const SESSION_MINUTES: usize = 375;

// ---------------------------------------------------------------------------
// Candle source
// ---------------------------------------------------------------------------

/// Recent OHLC bars for one instrument.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn candles(
        &self,
        account_id: &str,
        symbol: &str,
        exchange: &str,
        interval_minutes: u32,
        lookback: usize,
    ) -> anyhow::Result<Vec<Candle>>;
}

/// Reads history through the account's broker API.
pub struct BrokerCandles {
    executor: Arc<Executor>,
}

impl BrokerCandles {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl CandleSource for BrokerCandles {
    async fn candles(
        &self,
        account_id: &str,
        symbol: &str,
        exchange: &str,
        interval_minutes: u32,
        lookback: usize,
    ) -> anyhow::Result<Vec<Candle>> {
        let broker: Arc<dyn BrokerApi> = self
            .executor
            .broker(account_id)
            .ok_or_else(|| anyhow::anyhow!("unknown account {account_id}"))?;
        let days = lookback * interval_minutes as usize / SESSION_MINUTES + 5;
        let end = utc_now().date_naive();
        let start = end - ChronoDuration::days(days as i64);
        let mut bars = broker.history(symbol, exchange, interval_minutes, start, end).await?;
        if bars.len() > lookback {
            bars.drain(..bars.len() - lookback);
        }
        Ok(bars)
    }
}

// ---------------------------------------------------------------------------
// Pure checks
// ---------------------------------------------------------------------------

/// One breached condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub kind: RiskEventType,
    pub threshold: f64,
    pub current: f64,
    pub notes: String,
}

/// Realised plus unrealised P&L. Rows with a missing price are skipped.
pub fn strategy_pnl(rows: &[Execution], marks: &AHashMap<String, f64>) -> f64 {
    rows.iter()
        .filter(|r| matches!(r.status, ExecutionStatus::Entered | ExecutionStatus::Exited))
        .filter_map(|r| r.pnl(marks.get(&r.id).copied()))
        .sum()
}

pub fn check_pnl_limits(pnl: f64, max_loss: Option<f64>, max_profit: Option<f64>) -> Vec<Breach> {
    let mut out = Vec::new();
    if let Some(limit) = max_loss {
        let threshold = -limit.abs();
        if pnl <= threshold {
            out.push(Breach {
                kind: RiskEventType::MaxLoss,
                threshold,
                current: pnl,
                notes: format!("P&L {pnl:.2} breached max loss {threshold:.2}"),
            });
        }
    }
    if let Some(limit) = max_profit {
        let threshold = limit.abs();
        if pnl >= threshold {
            out.push(Breach {
                kind: RiskEventType::MaxProfit,
                threshold,
                current: pnl,
                notes: format!("P&L {pnl:.2} reached max profit {threshold:.2}"),
            });
        }
    }
    out
}

/// Best favourable price seen so far. Starts at the entry and never retreats.
pub fn advance_reference(side: Side, entry: f64, previous: Option<f64>, mark: f64) -> f64 {
    let prev = previous.unwrap_or(entry);
    match side {
        Side::Buy => prev.max(mark),
        Side::Sell => prev.min(mark),
    }
}

/// Stop level for a position, `None` while a percentage stop is not armed
/// (the price has not yet moved in favour).
pub fn trailing_stop_level(side: Side, entry: f64, reference: f64, quantity: u32, stop: TrailingStop) -> Option<f64> {
    let x = stop.value.abs();
    let distance = match stop.kind {
        TrailingKind::Percentage => {
            let gained = (reference - entry) * side.sign();
            if gained <= 0.0 {
                return None;
            }
            gained * x / 100.0
        }
        TrailingKind::Points => x,
        TrailingKind::Amount => {
            if quantity == 0 {
                return None;
            }
            x / f64::from(quantity)
        }
    };
    Some(reference - distance * side.sign())
}

pub fn trailing_hit(side: Side, mark: f64, stop: f64) -> bool {
    match side {
        Side::Buy => mark <= stop,
        Side::Sell => mark >= stop,
    }
}

/// Combine per-leg candles into one spread series.
///
/// Sell legs minus buy legs (each weighted by lots), absolute value, with
/// high/low re-ordered. With only sell or only buy legs that total is used
/// directly. Only timestamps present in every leg are kept.
pub fn spread_series(legs: &[(Side, f64, Vec<Candle>)]) -> Vec<Candle> {
    #[derive(Default)]
    struct Acc {
        sell: [f64; 4],
        buy: [f64; 4],
        seen: usize,
    }

    let has_sell = legs.iter().any(|(s, _, _)| *s == Side::Sell);
    let has_buy = legs.iter().any(|(s, _, _)| *s == Side::Buy);

    let mut by_ts: BTreeMap<i64, Acc> = BTreeMap::new();
    for (side, lots, candles) in legs {
        for c in candles {
            let acc = by_ts.entry(c.timestamp).or_default();
            let target = match side {
                Side::Sell => &mut acc.sell,
                Side::Buy => &mut acc.buy,
            };
            for (slot, v) in target.iter_mut().zip([c.open, c.high, c.low, c.close]) {
                *slot += v * lots;
            }
            acc.seen += 1;
        }
    }

    by_ts
        .into_iter()
        .filter(|(_, acc)| acc.seen == legs.len())
        .map(|(timestamp, acc)| {
            let [open, a, b, close]: [f64; 4] = std::array::from_fn(|i| {
                match (has_sell, has_buy) {
                    (true, true) => acc.sell[i] - acc.buy[i],
                    (true, false) => acc.sell[i],
                    _ => acc.buy[i],
                }
                .abs()
            });
            Candle { timestamp, open, high: a.max(b), low: a.min(b), close, volume: 0.0 }
        })
        .collect()
}

fn target_direction(exit_type: ExitType) -> Direction {
    match exit_type {
        ExitType::Breakout => Direction::Bullish,
        ExitType::Breakdown => Direction::Bearish,
    }
}

/// Whether a `timeframe`-minute candle closed `minutes_elapsed` minutes into
/// the session and minute `stamp` has not been evaluated yet.
pub fn candle_closed(minutes_elapsed: Option<i64>, timeframe_minutes: u32, stamp: i64, last_evaluated: Option<i64>) -> bool {
    let tf = i64::from(timeframe_minutes.max(1));
    minutes_elapsed.is_some_and(|m| m > 0 && m % tf == 0) && last_evaluated != Some(stamp)
}

fn breach_reason(breaches: &[Breach]) -> String {
    breaches.iter().map(|b| b.kind.to_string()).collect::<Vec<_>>().join("+")
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Mutable state of one strategy's monitor.
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub strategy_id: String,
    /// Trailing reference price per execution id.
    pub references: AHashMap<String, f64>,
    /// Minute stamp of the last Supertrend evaluation.
    pub last_candle_minute: Option<i64>,
    /// Set by a breach; fills confirmed afterwards are exited with it.
    pub exit_reason: Option<String>,
}

impl MonitorState {
    pub fn new(strategy_id: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            references: AHashMap::new(),
            last_candle_minute: None,
            exit_reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Outside the trading session.
    OutsideSession,
    /// Strategy missing or no longer active, nothing left to exit.
    Inactive,
    Clear { pnl: f64 },
    Exited { breaches: Vec<Breach>, exit_order_ids: Vec<String> },
    /// Breached earlier; rows filled since were exited and `pending` rows
    /// are still awaiting their fill.
    Draining { pending: usize, exit_order_ids: Vec<String> },
}

pub struct RiskMonitor {
    executor: Arc<Executor>,
    candles: Option<Arc<dyn CandleSource>>,
    config: RiskConfig,
}

impl RiskMonitor {
    pub fn new(executor: Arc<Executor>, candles: Option<Arc<dyn CandleSource>>, config: RiskConfig) -> Self {
        Self { executor, candles, config }
    }

    /// One evaluation of the strategy in `state`.
    pub async fn tick(&self, state: &mut MonitorState, now: DateTime<Utc>) -> anyhow::Result<TickOutcome> {
        if let Some(reason) = state.exit_reason.clone() {
            return Ok(self.drain(&state.strategy_id, &reason).await);
        }
        if let Some(session) = &self.config.session {
            if !session.is_open(now) {
                return Ok(TickOutcome::OutsideSession);
            }
        }
        let store = self.executor.store();
        let Some(strategy) = store.strategy(&state.strategy_id).await.filter(|s| s.active) else {
            return Ok(TickOutcome::Inactive);
        };

        let rows = store.executions_for_strategy(&strategy.id).await;
        let open: Vec<&Execution> = rows.iter().filter(|r| r.status == ExecutionStatus::Entered).collect();

        let mut marks = AHashMap::new();
        for row in &open {
            if let Some(ltp) = self.executor.price_book().ltp(&row.symbol) {
                store.set_last_price(&row.id, ltp).await;
                marks.insert(row.id.clone(), ltp);
            }
        }
        let pnl = strategy_pnl(&rows, &marks);
        debug!("[risk-{}] pnl {pnl:.2} over {} open row(s)", strategy.id, open.len());
        if open.is_empty() {
            return Ok(TickOutcome::Clear { pnl });
        }

        let mut breaches = check_pnl_limits(pnl, strategy.risk.max_loss, strategy.risk.max_profit);

        if let Some(stop) = strategy.risk.trailing_stop {
            if let Some(b) = self.trailing_breach(state, &open, &marks, stop) {
                breaches.push(b);
            }
        }

        if let Some(tech) = strategy.risk.technical_exit {
            let elapsed = match &self.config.session {
                Some(session) => session.minutes_since_open(now),
                None => Some(i64::from(now.hour() * 60 + now.minute())),
            };
            let stamp = now.timestamp() / 60;
            if candle_closed(elapsed, tech.timeframe_minutes, stamp, state.last_candle_minute) {
                state.last_candle_minute = Some(stamp);
                match self.technical_breach(&strategy, &open, &tech).await {
                    Ok(Some(b)) => breaches.push(b),
                    Ok(None) => {}
                    Err(e) => warn!("[risk-{}] supertrend check failed: {e:#}", strategy.id),
                }
            }
        }

        if breaches.is_empty() {
            return Ok(TickOutcome::Clear { pnl });
        }
        let reason = breach_reason(&breaches);
        let exit_order_ids = self.exit_strategy(&strategy, &rows, &breaches, &reason).await;
        state.exit_reason = Some(reason);
        Ok(TickOutcome::Exited { breaches, exit_order_ids })
    }

    /// First execution whose trailing stop was crossed on this tick.
    fn trailing_breach(
        &self,
        state: &mut MonitorState,
        open: &[&Execution],
        marks: &AHashMap<String, f64>,
        stop: TrailingStop,
    ) -> Option<Breach> {
        let mut hit = None;
        for row in open {
            let (Some(entry), Some(&mark)) = (row.entry_price, marks.get(&row.id)) else {
                continue;
            };
            let previous = state.references.get(&row.id).copied();
            let reference = advance_reference(row.action, entry, previous, mark);
            state.references.insert(row.id.clone(), reference);

            let Some(level) = trailing_stop_level(row.action, entry, reference, row.quantity, stop) else {
                continue;
            };
            if hit.is_none() && trailing_hit(row.action, mark, level) {
                hit = Some(Breach {
                    kind: RiskEventType::TrailingSl,
                    threshold: level,
                    current: mark,
                    notes: format!("{} price {mark:.2} hit trailing stop {level:.2} (best {reference:.2})", row.symbol),
                });
            }
        }
        hit
    }

    async fn technical_breach(
        &self,
        strategy: &Strategy,
        open: &[&Execution],
        tech: &TechnicalExit,
    ) -> anyhow::Result<Option<Breach>> {
        let Some(source) = &self.candles else {
            return Ok(None);
        };

        // One row per leg; the same leg on several accounts trades the same symbol.
        let mut per_leg: BTreeMap<u32, &Execution> = BTreeMap::new();
        for row in open {
            per_leg.entry(row.leg_number).or_insert(row);
        }

        let mut legs = Vec::with_capacity(per_leg.len());
        for row in per_leg.values() {
            let bars = source
                .candles(&row.account_id, &row.symbol, &row.exchange, tech.timeframe_minutes, tech.lookback)
                .await?;
            let lot_size = self.executor.instruments().get(&row.symbol).lot_size.max(1);
            let lots = f64::from(row.quantity) / f64::from(lot_size);
            legs.push((row.action, lots, bars));
        }

        let series = spread_series(&legs);
        if series.len() < tech.period + MIN_EXTRA_BARS {
            debug!("[risk-{}] {} spread bars, supertrend needs {}", strategy.id, series.len(), tech.period + MIN_EXTRA_BARS);
            return Ok(None);
        }

        let st = supertrend_candles(&series, tech.period, tech.multiplier)?;
        let target = target_direction(tech.exit_type);
        Ok(st.last_flip().filter(|d| *d == target).map(|d| Breach {
            kind: RiskEventType::Supertrend,
            threshold: f64::from(target.value()),
            current: f64::from(d.value()),
            notes: format!(
                "supertrend({}, {}) on {}m spread flipped {d:?}",
                tech.period, tech.multiplier, tech.timeframe_minutes
            ),
        }))
    }

    /// Exit every open row once, log one event per breach, deactivate.
    async fn exit_strategy(&self, strategy: &Strategy, rows: &[Execution], breaches: &[Breach], reason: &str) -> Vec<String> {
        warn!("[risk-{}] breached {reason}, exiting all positions", strategy.id);
        let pending = rows.iter().filter(|r| r.status == ExecutionStatus::Pending).count();
        if pending > 0 {
            warn!("[risk-{}] {pending} pending row(s) will be exited once filled", strategy.id);
        }

        let results = self.executor.exit_all(rows, reason).await;
        let mut exit_order_ids = Vec::new();
        let mut failures = 0;
        for r in results {
            match r {
                Ok(row) => exit_order_ids.extend(row.exit_order_ids),
                Err(e) => {
                    failures += 1;
                    warn!("[risk-{}] exit failed: {e}", strategy.id);
                }
            }
        }
        let action = if failures == 0 { "exit_all".to_string() } else { format!("exit_all ({failures} failed)") };

        let store = self.executor.store();
        for b in breaches {
            let event = RiskEvent {
                id: uuid::Uuid::new_v4().to_string(),
                strategy_id: strategy.id.clone(),
                event_type: b.kind,
                threshold_value: b.threshold,
                current_value: b.current,
                action_taken: action.clone(),
                exit_order_ids: exit_order_ids.clone(),
                notes: Some(b.notes.clone()),
                triggered_at: utc_now(),
            };
            store.append_risk_event(event.clone()).await;
            self.executor.hub().publish(EngineEvent::Risk(event));
        }
        store.deactivate_strategy(&strategy.id).await;
        info!("[risk-{}] strategy deactivated after {reason}", strategy.id);
        exit_order_ids
    }

    /// After a breach: exit rows filled since, report what is still pending.
    async fn drain(&self, strategy_id: &str, reason: &str) -> TickOutcome {
        let rows = self.executor.store().executions_for_strategy(strategy_id).await;
        let mut exit_order_ids = Vec::new();
        for r in self.executor.exit_all(&rows, reason).await {
            match r {
                Ok(row) => {
                    info!("[risk-{strategy_id}] exited late fill {} on {}", row.symbol, row.account_id);
                    exit_order_ids.extend(row.exit_order_ids);
                }
                Err(e) => warn!("[risk-{strategy_id}] late exit failed: {e}"),
            }
        }
        let pending = rows.iter().filter(|r| r.status == ExecutionStatus::Pending).count();
        if pending == 0 && exit_order_ids.is_empty() {
            TickOutcome::Inactive
        } else {
            TickOutcome::Draining { pending, exit_order_ids }
        }
    }

    /// Run the monitor for one strategy until it is inactive with nothing
    /// left to exit, or `shutdown` flips.
    pub fn spawn(self: &Arc<Self>, strategy_id: String, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut state = MonitorState::new(strategy_id);
            let mut ticker = tokio::time::interval(monitor.config.tick());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("[risk-{}] monitor started, tick {:?}", state.strategy_id, monitor.config.tick());
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match monitor.tick(&mut state, utc_now()).await {
                            Ok(TickOutcome::Inactive) => break,
                            Ok(_) => {}
                            Err(e) => warn!("[risk-{}] tick failed: {e:#}", state.strategy_id),
                        }
                    }
                }
            }
            info!("[risk-{}] monitor stopped", state.strategy_id);
        })
    }
}
