//! Strategy order dispatch.
//!
//! Entry fans out over accounts with at most `min(accounts, max_workers)`
//! accounts in flight. Within an account the legs are sized together from
//! one funds snapshot, then started in declaration order and placed
//! concurrently. Each (account, leg) becomes one [`Execution`]: `pending`
//! when its orders were accepted, `error` with the broker message otherwise.
//! A leg whose later sub-orders fail after some were accepted stays
//! `pending` for the accepted quantity. A failed leg never cancels its
//! siblings.
//!
//! Exits place the opposing market order for the full quantity, split by the
//! freeze limit, with a per-order timeout and bounded retries. An exit that
//! cannot be placed marks the execution `error` and raises a fatal alert.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use chrono::Datelike;
use futures_util::StreamExt;
use futures_util::future::join_all;
use futures_util::stream;
use mirror_core::config::ExecutionConfig;
use mirror_core::time_util::utc_now;
use mirror_core::types::{
    Execution, ExecutionPatch, ExecutionStatus, InstrumentTable, Leg, LegInstrument, LotSizing, OrderRequest,
    PriceType, Side, Strategy, StrikeSelection, futures_symbol, option_symbol,
};
use mirror_md::option_chain::ChainError;
use mirror_md::{OptionChain, PriceBook};
use mirror_td::margin::{MarginError, MarginTable, SizingBudget};
use mirror_td::split::split_quantity;
use mirror_td::{BrokerApi, BrokerError};
use tracing::{error, info, warn};

use crate::event::{EngineEvent, EventHub};
use crate::store::{ExecutionStore, StoreError};

/// Why a leg could not be turned into an order.
#[derive(Debug, thiserror::Error)]
pub enum LegError {
    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error("no option chain for {underlying} {expiry}")]
    NoChain { underlying: String, expiry: String },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Margin(#[from] MarginError),

    #[error("funds unavailable: {0}")]
    Funds(BrokerError),

    #[error("leg resolves to zero quantity")]
    ZeroQuantity,
}

#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error("execution {id} is {status}, nothing to exit")]
    NotOpen { id: String, status: ExecutionStatus },

    #[error("exit order failed: {0}")]
    Placement(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A leg resolved to a concrete instrument and size on one account.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLeg {
    pub symbol: String,
    pub exchange: String,
    pub lots: u32,
    /// Units, `lots * lot_size`.
    pub quantity: u32,
    pub price: f64,
}

/// Sub-orders accepted for one leg.
struct Placement {
    order_ids: Vec<String>,
    /// Units across the accepted sub-orders.
    quantity: u32,
    failure: Option<String>,
}

/// Outcome of one entry.
#[derive(Debug, Clone)]
pub struct EntryReport {
    pub strategy_id: String,
    pub executions: Vec<Execution>,
}

impl EntryReport {
    pub fn placed(&self) -> usize {
        self.executions.iter().filter(|e| e.status == ExecutionStatus::Pending).count()
    }

    pub fn failed(&self) -> usize {
        self.executions.iter().filter(|e| e.status == ExecutionStatus::Error).count()
    }
}

pub struct Executor {
    brokers: AHashMap<String, Arc<dyn BrokerApi>>,
    chains: Vec<Arc<OptionChain>>,
    price_book: Arc<PriceBook>,
    margin: MarginTable,
    instruments: InstrumentTable,
    store: Arc<dyn ExecutionStore>,
    hub: EventHub,
    config: ExecutionConfig,
}

impl Executor {
    pub fn new(store: Arc<dyn ExecutionStore>, hub: EventHub, config: ExecutionConfig) -> Self {
        Self {
            brokers: AHashMap::new(),
            chains: Vec::new(),
            price_book: Arc::new(PriceBook::new()),
            margin: MarginTable::default(),
            instruments: InstrumentTable::default(),
            store,
            hub,
            config,
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn BrokerApi>) -> Self {
        self.brokers.insert(broker.account_id().to_string(), broker);
        self
    }

    pub fn with_chain(mut self, chain: Arc<OptionChain>) -> Self {
        self.chains.push(chain);
        self
    }

    pub fn with_price_book(mut self, price_book: Arc<PriceBook>) -> Self {
        self.price_book = price_book;
        self
    }

    pub fn with_margin(mut self, margin: MarginTable) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_instruments(mut self, instruments: InstrumentTable) -> Self {
        self.instruments = instruments;
        self
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn price_book(&self) -> &Arc<PriceBook> {
        &self.price_book
    }

    pub fn instruments(&self) -> &InstrumentTable {
        &self.instruments
    }

    pub fn chains(&self) -> &[Arc<OptionChain>] {
        &self.chains
    }

    pub fn broker(&self, account_id: &str) -> Option<Arc<dyn BrokerApi>> {
        self.brokers.get(account_id).cloned()
    }

    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.brokers.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn chain(&self, underlying: &str, expiry: &str) -> Option<&Arc<OptionChain>> {
        self.chains
            .iter()
            .find(|c| c.underlying().eq_ignore_ascii_case(underlying) && c.expiry() == expiry)
    }

    /// Chain whose option symbols `symbol` belongs to.
    fn chain_for_symbol(&self, symbol: &str) -> Option<&Arc<OptionChain>> {
        self.chains.iter().find(|c| {
            symbol
                .strip_prefix(c.underlying())
                .is_some_and(|rest| rest.starts_with(c.expiry()))
        })
    }

    // -----------------------------------------------------------------------
    // Entry
    // -----------------------------------------------------------------------

    /// Place every leg of `strategy` on each of `account_ids` (the
    /// strategy's own accounts when empty).
    pub async fn execute_entry(&self, strategy: &Strategy, account_ids: &[String]) -> anyhow::Result<EntryReport> {
        if strategy.legs.is_empty() {
            anyhow::bail!("strategy {} has no legs", strategy.id);
        }
        let requested = if account_ids.is_empty() { strategy.accounts.as_slice() } else { account_ids };
        let mut seen = AHashSet::new();
        let accounts: Vec<&str> = requested.iter().map(String::as_str).filter(|a| seen.insert(*a)).collect();
        if accounts.is_empty() {
            anyhow::bail!("strategy {} has no accounts", strategy.id);
        }

        let workers = accounts.len().min(self.config.max_workers.max(1));
        info!(
            "[exec-{}] entering {} leg(s) on {} account(s) with {workers} worker(s)",
            strategy.id,
            strategy.legs.len(),
            accounts.len()
        );

        let mut entries = Vec::with_capacity(accounts.len());
        for account in accounts {
            entries.push(self.enter_account(strategy, account));
        }
        let per_account: Vec<Vec<Execution>> = stream::iter(entries).buffer_unordered(workers).collect().await;

        let report = EntryReport { strategy_id: strategy.id.clone(), executions: per_account.into_iter().flatten().collect() };
        info!("[exec-{}] entry done: {} placed, {} failed", strategy.id, report.placed(), report.failed());
        Ok(report)
    }

    async fn enter_account(&self, strategy: &Strategy, account_id: &str) -> Vec<Execution> {
        let Some(broker) = self.broker(account_id) else {
            warn!("[exec-{}] unknown account {account_id}", strategy.id);
            let mut out = Vec::with_capacity(strategy.legs.len());
            for leg in &strategy.legs {
                let (symbol, exchange) = self.leg_instrument_hint(leg);
                let row = self.new_execution(strategy, leg, account_id, &symbol, &exchange, 0, Vec::new());
                out.push(self.record(row, Some(LegError::UnknownAccount(account_id.to_string()).to_string())).await);
            }
            return out;
        };

        let sized = self.lots_for_account(strategy, broker.as_ref()).await;
        let mut legs = Vec::with_capacity(strategy.legs.len());
        for (leg, lots) in strategy.legs.iter().zip(sized) {
            legs.push(self.enter_leg(strategy, leg, account_id, broker.as_ref(), lots));
        }
        join_all(legs).await
    }

    async fn enter_leg(
        &self,
        strategy: &Strategy,
        leg: &Leg,
        account_id: &str,
        broker: &dyn BrokerApi,
        lots: Result<u32, LegError>,
    ) -> Execution {
        let resolved = match lots.and_then(|lots| self.resolve_leg(leg, lots)) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("[exec-{}] {account_id} leg {}: {e}", strategy.id, leg.leg_number);
                let (symbol, exchange) = self.leg_instrument_hint(leg);
                let row = self.new_execution(strategy, leg, account_id, &symbol, &exchange, 0, Vec::new());
                return self.record(row, Some(e.to_string())).await;
            }
        };

        let placement = self.place_leg(strategy, leg, &resolved, broker).await;
        match placement.failure {
            // Accepted sub-orders are live at the broker; track what was placed.
            Some(reason) if !placement.order_ids.is_empty() => {
                warn!(
                    "[exec-{}] {account_id} leg {}: {} of {} placed, {reason}",
                    strategy.id, leg.leg_number, placement.quantity, resolved.quantity
                );
                let mut row = self.new_execution(
                    strategy,
                    leg,
                    account_id,
                    &resolved.symbol,
                    &resolved.exchange,
                    placement.quantity,
                    placement.order_ids,
                );
                row.error_message = Some(reason);
                self.record(row, None).await
            }
            failure => {
                let row = self.new_execution(
                    strategy,
                    leg,
                    account_id,
                    &resolved.symbol,
                    &resolved.exchange,
                    resolved.quantity,
                    placement.order_ids,
                );
                self.record(row, failure).await
            }
        }
    }

    /// Lots per leg on one account, indexed like `strategy.legs`.
    ///
    /// Grade sizing reads the account's funds once and sizes the legs as a
    /// whole.
    pub async fn lots_for_account(&self, strategy: &Strategy, broker: &dyn BrokerApi) -> Vec<Result<u32, LegError>> {
        let grade = match strategy.lot_sizing {
            LotSizing::FixedLots => return strategy.legs.iter().map(|l| Ok(l.lots)).collect(),
            LotSizing::Grade(grade) => grade,
        };
        let funds = match broker.funds().await {
            Ok(funds) => funds,
            Err(e) => {
                warn!("[exec-{}] {}: funds unavailable: {e}", strategy.id, broker.account_id());
                return strategy.legs.iter().map(|_| Err(LegError::Funds(e.clone()))).collect();
            }
        };
        let budget = SizingBudget { margin: funds.available_margin(), cash: funds.available_cash };
        let plan = self.margin.plan_lots(
            &strategy.legs,
            budget,
            grade,
            self.config.max_lots_per_order,
            &self.instruments,
            utc_now().weekday(),
        );
        plan.into_iter()
            .zip(&strategy.legs)
            .map(|(calc, leg)| -> Result<u32, LegError> {
                let calc = calc?;
                info!("[exec-{}] {} leg {}: {calc}", strategy.id, broker.account_id(), leg.leg_number);
                Ok(calc.lots)
            })
            .collect()
    }

    /// Best-effort symbol for a leg that could not be resolved.
    fn leg_instrument_hint(&self, leg: &Leg) -> (String, String) {
        let underlying = leg.underlying.to_ascii_uppercase();
        let spec = self.instruments.get(&underlying);
        let symbol = match leg.instrument {
            LegInstrument::Futures => futures_symbol(&underlying, &leg.expiry),
            LegInstrument::Option { option_type, selection: StrikeSelection::Strike { strike } } => {
                option_symbol(&underlying, &leg.expiry, strike, option_type)
            }
            LegInstrument::Option { .. } => format!("{underlying}{}", leg.expiry),
        };
        (symbol, spec.option_exchange.clone())
    }

    /// Resolve the instrument of `leg` and its quantity for `lots`.
    pub fn resolve_leg(&self, leg: &Leg, lots: u32) -> Result<ResolvedLeg, LegError> {
        let underlying = leg.underlying.to_ascii_uppercase();
        let spec = self.instruments.get(&underlying);

        let symbol = match leg.instrument {
            LegInstrument::Futures => futures_symbol(&underlying, &leg.expiry),
            LegInstrument::Option { option_type, selection } => {
                let strike = match selection {
                    StrikeSelection::Strike { strike } => strike,
                    _ => self
                        .chain(&underlying, &leg.expiry)
                        .ok_or_else(|| LegError::NoChain { underlying: underlying.clone(), expiry: leg.expiry.clone() })?
                        .resolve_strike(selection, option_type)?,
                };
                option_symbol(&underlying, &leg.expiry, strike, option_type)
            }
        };

        let quantity = lots.saturating_mul(spec.lot_size);
        if quantity == 0 {
            return Err(LegError::ZeroQuantity);
        }
        let price = match leg.price_type {
            PriceType::Market | PriceType::StopMarket => 0.0,
            PriceType::Limit | PriceType::StopLimit => leg.limit_price.unwrap_or(0.0),
        };

        Ok(ResolvedLeg { symbol, exchange: spec.option_exchange.clone(), lots, quantity, price })
    }

    /// Place all freeze-split sub-orders of one leg. Stops at the first
    /// sub-order that fails, keeping the ids placed so far.
    async fn place_leg(
        &self,
        strategy: &Strategy,
        leg: &Leg,
        resolved: &ResolvedLeg,
        broker: &dyn BrokerApi,
    ) -> Placement {
        let spec = self.instruments.get(&resolved.symbol);
        let request = OrderRequest {
            symbol: resolved.symbol.clone(),
            exchange: resolved.exchange.clone(),
            action: leg.action,
            quantity: resolved.quantity,
            price_type: leg.price_type,
            product: strategy.product,
            price: resolved.price,
            trigger_price: 0.0,
            strategy_tag: strategy.name.clone(),
        };

        let chunks = split_quantity(resolved.quantity, spec.freeze_quantity);
        let mut order_ids = Vec::with_capacity(chunks.len());
        let mut placed = 0u32;
        for (i, qty) in chunks.iter().enumerate() {
            match self.place_with_retry(broker, &request.with_quantity(*qty)).await {
                Ok(id) => {
                    info!(
                        "[exec-{}] {} {} {} x{qty} placed ({}/{}) id={id}",
                        strategy.id,
                        broker.account_id(),
                        request.action,
                        request.symbol,
                        i + 1,
                        chunks.len()
                    );
                    order_ids.push(id);
                    placed += qty;
                }
                Err(e) => {
                    error!("[exec-{}] {} {} x{qty} failed: {e}", strategy.id, broker.account_id(), request.symbol);
                    let reason = if order_ids.is_empty() {
                        e.to_string()
                    } else {
                        format!("sub-order {}/{} failed after {} placed: {e}", i + 1, chunks.len(), order_ids.len())
                    };
                    return Placement { order_ids, quantity: placed, failure: Some(reason) };
                }
            }
        }
        Placement { order_ids, quantity: placed, failure: None }
    }

    /// Transport errors are retried with a doubling delay; rejections are final.
    async fn place_with_retry(&self, broker: &dyn BrokerApi, order: &OrderRequest) -> Result<String, BrokerError> {
        let attempts = self.config.placement_attempts.max(1);
        let mut delay = self.config.retry_delay();
        let mut attempt = 1;
        loop {
            match broker.place_order(order).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "[exec] {} {} attempt {attempt}/{attempts} failed: {e}, retrying in {delay:?}",
                        broker.account_id(),
                        order.symbol
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn new_execution(
        &self,
        strategy: &Strategy,
        leg: &Leg,
        account_id: &str,
        symbol: &str,
        exchange: &str,
        quantity: u32,
        order_ids: Vec<String>,
    ) -> Execution {
        let now = utc_now();
        Execution {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_id: strategy.id.clone(),
            leg_number: leg.leg_number,
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            action: leg.action,
            product: strategy.product,
            quantity,
            order_ids,
            status: ExecutionStatus::INITIAL,
            entry_price: None,
            exit_price: None,
            exit_order_ids: Vec::new(),
            exit_reason: None,
            error_message: None,
            last_price: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Persist a new execution, moving it straight to `error` on failure.
    async fn record(&self, execution: Execution, failure: Option<String>) -> Execution {
        if let Err(e) = self.store.create_execution(execution.clone()).await {
            error!("[exec-{}] could not store execution {}: {e}", execution.strategy_id, execution.id);
            return execution;
        }
        let row = match failure {
            None => execution,
            Some(message) => {
                let patch = ExecutionPatch { error_message: Some(message), ..Default::default() };
                match self.store.transition(&execution.id, ExecutionStatus::Error, patch).await {
                    Ok(row) => row,
                    Err(e) => {
                        error!("[exec-{}] {e}", execution.strategy_id);
                        execution
                    }
                }
            }
        };
        self.hub.publish(EngineEvent::Execution(row.clone()));
        row
    }

    // -----------------------------------------------------------------------
    // Exit
    // -----------------------------------------------------------------------

    /// Close one open execution with an opposing market order.
    pub async fn execute_exit(&self, execution: &Execution, reason: &str) -> Result<Execution, ExitError> {
        if !matches!(execution.status, ExecutionStatus::Entered | ExecutionStatus::Stopped) {
            return Err(ExitError::NotOpen { id: execution.id.clone(), status: execution.status });
        }
        let broker = self
            .broker(&execution.account_id)
            .ok_or_else(|| ExitError::UnknownAccount(execution.account_id.clone()))?;

        let side = execution.action.opposite();
        let request = OrderRequest {
            symbol: execution.symbol.clone(),
            exchange: execution.exchange.clone(),
            action: side,
            quantity: execution.quantity,
            price_type: PriceType::Market,
            product: execution.product,
            price: 0.0,
            trigger_price: 0.0,
            strategy_tag: format!("exit:{reason}"),
        };
        let freeze = self.instruments.get(&execution.symbol).freeze_quantity;

        let mut exit_ids = Vec::new();
        let mut failure = None;
        for qty in split_quantity(execution.quantity, freeze) {
            match self.exit_with_retry(broker.as_ref(), &request.with_quantity(qty)).await {
                Ok(id) => exit_ids.push(id),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(message) = failure {
            error!(
                "[exec-{}] exit of {} on {} failed: {message}",
                execution.strategy_id, execution.symbol, execution.account_id
            );
            let patch = ExecutionPatch {
                exit_order_ids: Some(exit_ids),
                exit_reason: Some(reason.to_string()),
                error_message: Some(message.clone()),
                ..Default::default()
            };
            match self.store.transition(&execution.id, ExecutionStatus::Error, patch).await {
                Ok(row) => self.hub.publish(EngineEvent::Execution(row)),
                Err(e) => error!("[exec-{}] {e}", execution.strategy_id),
            }
            self.hub.fatal(
                "executor",
                format!("exit of {} on {} failed: {message}", execution.symbol, execution.account_id),
            );
            return Err(ExitError::Placement(message));
        }

        let exit_price = self.exit_price(&execution.symbol, side).or(execution.last_price);
        let patch = ExecutionPatch {
            exit_price,
            exit_order_ids: Some(exit_ids),
            exit_reason: Some(reason.to_string()),
            ..Default::default()
        };
        let row = self.store.transition(&execution.id, ExecutionStatus::Exited, patch).await?;
        info!(
            "[exec-{}] exited {} {} x{} on {} ({reason}) at {:?}",
            row.strategy_id, side, row.symbol, row.quantity, row.account_id, row.exit_price
        );
        self.hub.publish(EngineEvent::Execution(row.clone()));
        Ok(row)
    }

    /// Close every open execution of a strategy concurrently.
    pub async fn exit_all(&self, executions: &[Execution], reason: &str) -> Vec<Result<Execution, ExitError>> {
        let open: Vec<&Execution> = executions
            .iter()
            .filter(|e| matches!(e.status, ExecutionStatus::Entered | ExecutionStatus::Stopped))
            .collect();
        if open.is_empty() {
            return Vec::new();
        }
        let workers = open.len().min(self.config.max_workers.max(1));
        let mut exits = Vec::with_capacity(open.len());
        for execution in open {
            exits.push(self.execute_exit(execution, reason));
        }
        stream::iter(exits).buffer_unordered(workers).collect().await
    }

    async fn exit_with_retry(&self, broker: &dyn BrokerApi, order: &OrderRequest) -> Result<String, String> {
        let attempts = self.config.exit_attempts.max(1);
        let timeout = self.config.exit_timeout();
        let mut last = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, broker.place_order(order)).await {
                Ok(Ok(id)) => return Ok(id),
                Ok(Err(BrokerError::Auth(m))) => return Err(format!("auth failed: {m}")),
                Ok(Err(e)) => last = e.to_string(),
                Err(_) => last = format!("timed out after {timeout:?}"),
            }
            warn!(
                "[exec] exit {} {} x{} attempt {attempt}/{attempts}: {last}",
                broker.account_id(),
                order.symbol,
                order.quantity
            );
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }
        Err(format!("{last} after {attempts} attempt(s)"))
    }

    /// Touch price for `side` from the chain, else the last traded price.
    pub fn exit_price(&self, symbol: &str, side: Side) -> Option<f64> {
        self.chain_for_symbol(symbol)
            .and_then(|c| c.execution_price(symbol, side))
            .or_else(|| self.price_book.ltp(symbol))
    }
}
