//! In-process fakes shared by the engine tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use mirror_core::config::{ChainConfig, ExecutionConfig};
use mirror_core::subscription::{Subscription, SubscriptionSink};
use mirror_core::types::*;
use mirror_md::OptionChain;
use mirror_td::{BrokerApi, BrokerError};
use parking_lot::Mutex;

use crate::event::EventHub;
use crate::executor::Executor;
use crate::store::MemoryStore;

/// Placements in flight, shared across brokers.
#[derive(Default)]
pub(crate) struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeBroker {
    id: String,
    seq: AtomicU64,
    pub placed: Mutex<Vec<OrderRequest>>,
    /// Consumed one per `place_order` call before it succeeds.
    pub failures: Mutex<VecDeque<BrokerError>>,
    /// Every placement fails with this once set.
    pub reject_all: Mutex<Option<BrokerError>>,
    /// Placements fail with this once `n` have been accepted.
    pub reject_after: Mutex<Option<(usize, BrokerError)>>,
    /// Time each accepted placement takes.
    pub latency: Mutex<Duration>,
    pub gauge: Arc<Gauge>,
    pub funds: Mutex<Funds>,
    pub book: Mutex<Vec<OrderRecord>>,
    pub book_error: Mutex<Option<BrokerError>>,
    pub candles: Mutex<AHashMap<String, Vec<Candle>>>,
}

impl FakeBroker {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Self::with_gauge(id, Arc::new(Gauge::default()), Duration::ZERO)
    }

    pub(crate) fn with_gauge(id: &str, gauge: Arc<Gauge>, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            seq: AtomicU64::new(0),
            placed: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            reject_all: Mutex::new(None),
            reject_after: Mutex::new(None),
            latency: Mutex::new(latency),
            gauge,
            funds: Mutex::new(Funds { available_cash: 1_000_000.0, ..Default::default() }),
            book: Mutex::new(Vec::new()),
            book_error: Mutex::new(None),
            candles: Mutex::new(AHashMap::new()),
        })
    }

    pub(crate) fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().clone()
    }
}

#[async_trait]
impl BrokerApi for FakeBroker {
    fn account_id(&self) -> &str {
        &self.id
    }

    async fn ping(&self) -> Result<PingInfo, BrokerError> {
        Ok(PingInfo { broker: "fake".into(), message: "pong".into() })
    }

    async fn funds(&self) -> Result<Funds, BrokerError> {
        Ok(*self.funds.lock())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<String, BrokerError> {
        if let Some(e) = self.reject_all.lock().clone() {
            return Err(e);
        }
        if let Some(e) = self.failures.lock().pop_front() {
            return Err(e);
        }
        let reject_after = self.reject_after.lock().clone();
        if let Some((n, e)) = reject_after {
            if self.seq.load(Ordering::SeqCst) as usize >= n {
                return Err(e);
            }
        }
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauge.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(latency).await;
            self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        }
        self.placed.lock().push(order.clone());
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("{}-{n}", self.id))
    }

    async fn order_book(&self) -> Result<Vec<OrderRecord>, BrokerError> {
        if let Some(e) = self.book_error.lock().clone() {
            return Err(e);
        }
        Ok(self.book.lock().clone())
    }

    async fn quote(&self, _symbol: &str, _exchange: &str) -> Result<QuoteSnapshot, BrokerError> {
        Ok(QuoteSnapshot::default())
    }

    async fn history(
        &self,
        symbol: &str,
        _exchange: &str,
        _interval_minutes: u32,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<Candle>, BrokerError> {
        Ok(self.candles.lock().get(symbol).cloned().unwrap_or_default())
    }
}

pub(crate) struct NullSink;

impl SubscriptionSink for NullSink {
    fn subscribe(&self, _sub: Subscription) {}
    fn unsubscribe(&self, _sub: Subscription) {}
}

pub(crate) fn nifty_chain() -> Arc<OptionChain> {
    let cfg = ChainConfig { underlying: "NIFTY".into(), expiry: "28OCT26".into(), half_width: 5, depth_ttl_ms: 30_000 };
    let spec = InstrumentTable::default().get("NIFTY").clone();
    Arc::new(OptionChain::new(&cfg, spec, Arc::new(NullSink)))
}

pub(crate) fn fast_config() -> ExecutionConfig {
    ExecutionConfig { retry_delay_ms: 1, exit_timeout_ms: 500, ..Default::default() }
}

pub(crate) fn executor(brokers: &[Arc<FakeBroker>]) -> (Arc<Executor>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let mut exec = Executor::new(store.clone(), EventHub::new(64), fast_config()).with_chain(nifty_chain());
    for b in brokers {
        exec = exec.with_broker(b.clone());
    }
    (Arc::new(exec), store)
}

pub(crate) fn option_leg(n: u32, option_type: OptionType, selection: StrikeSelection, action: Side, lots: u32) -> Leg {
    Leg {
        leg_number: n,
        underlying: "NIFTY".into(),
        expiry: "28OCT26".into(),
        instrument: LegInstrument::Option { option_type, selection },
        action,
        lots,
        price_type: PriceType::Market,
        limit_price: None,
    }
}

pub(crate) fn strategy(id: &str, legs: Vec<Leg>, accounts: &[&str]) -> Strategy {
    Strategy {
        id: id.into(),
        name: format!("{id}-name"),
        legs,
        risk: RiskParams::default(),
        accounts: accounts.iter().map(|a| a.to_string()).collect(),
        lot_sizing: LotSizing::FixedLots,
        product: Product::Mis,
        active: true,
    }
}

pub(crate) fn execution(id: &str, strategy_id: &str, account_id: &str) -> Execution {
    let now = Utc::now();
    Execution {
        id: id.into(),
        strategy_id: strategy_id.into(),
        leg_number: 1,
        account_id: account_id.into(),
        symbol: "NIFTY28OCT2625000CE".into(),
        exchange: "NFO".into(),
        action: Side::Sell,
        product: Product::Mis,
        quantity: 75,
        order_ids: vec![format!("{id}-o1")],
        status: ExecutionStatus::Pending,
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
