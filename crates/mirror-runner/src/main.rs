//! # mirror-runner
//!
//! Main entry point for the multi-account option trading engine.
//!
//! Loads a JSON configuration file, connects the market data feed with
//! account failover, builds the option chains, broker clients and store,
//! and runs the order poller and risk monitors until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! mirror-runner config.json --log-level info --enter short-straddle
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mirror_core::subscription::SubscriptionSink;
use mirror_core::types::{InstrumentTable, Mode, failover_order};
use mirror_core::ws::{FailoverFeed, WsConnector};
use mirror_engine::poller::OrderPoller;
use mirror_engine::risk::{BrokerCandles, CandleSource, RiskMonitor};
use mirror_engine::{EngineContext, EventHub, Executor, ExecutionStore, MemoryStore};
use mirror_md::pipeline::DEFAULT_CHANNEL_CAPACITY;
use mirror_md::{MarketHandler, OptionChain, Pipeline, PriceBook};
use mirror_td::OpenAlgoClient;
use mirror_td::margin::MarginTable;
use mirror_td::openalgo::client::DEFAULT_TIMEOUT;
use tracing::{error, info, warn};

/// How often chain snapshots are pushed to event subscribers.
const CHAIN_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Multi-account option trading engine.
#[derive(Parser)]
#[command(name = "mirror-runner", about = "Multi-account option trading engine")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,

    /// Enter these strategies once the feed is up (repeatable).
    #[arg(long = "enter", value_name = "STRATEGY_ID")]
    enter: Vec<String>,

    /// Seconds to wait for the first underlying price before entering.
    #[arg(long, default_value_t = 30)]
    warmup_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Configuration and logging
    let config = mirror_core::config::load_config(&cli.config)?;
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    let _log_guard = mirror_core::logging::init_logging(&cli.log_level, log_dir.as_deref(), &config.module_name());
    info!(
        "mirror-runner starting: config={}, {} account(s), {} chain(s), {} strateg(ies)",
        cli.config.display(),
        config.accounts.len(),
        config.chains.len(),
        config.strategies.len()
    );

    // 2. Market data: feed -> pipeline -> {price book, chains}
    let instruments = InstrumentTable::with_overrides(&config.instruments);
    let mut feed = FailoverFeed::new(failover_order(config.accounts.clone()), config.feed.clone(), Arc::new(WsConnector));
    let sink: Arc<dyn SubscriptionSink> = Arc::new(feed.handle());

    let pipeline = Arc::new(Pipeline::new());
    let price_book = Arc::new(PriceBook::new());
    for mode in [Mode::Price, Mode::Quote, Mode::Depth] {
        pipeline.register(mode, price_book.clone());
    }

    let mut chains = Vec::with_capacity(config.chains.len());
    for cfg in &config.chains {
        let spec = instruments.get(&cfg.underlying).clone();
        let chain = Arc::new(OptionChain::new(cfg, spec, sink.clone()));
        for mode in [Mode::Price, Mode::Quote, Mode::Depth] {
            pipeline.register(mode, chain.clone() as Arc<dyn MarketHandler>);
        }
        chain.start();
        chains.push(chain);
    }

    let (on_text, worker) = pipeline.spawn_worker(DEFAULT_CHANNEL_CAPACITY);
    feed.start(on_text);

    // 3. Order side
    let store = Arc::new(MemoryStore::with_strategies(config.strategies.clone()));
    let hub = EventHub::default();
    let mut executor = Executor::new(store.clone(), hub.clone(), config.execution.clone())
        .with_price_book(price_book.clone())
        .with_margin(MarginTable::from_config(&config.margin))
        .with_instruments(instruments);
    for account in &config.accounts {
        match OpenAlgoClient::new(account, DEFAULT_TIMEOUT) {
            Ok(client) => executor = executor.with_broker(Arc::new(client)),
            Err(e) => error!("[runner] account {}: {e:#}", account.label()),
        }
    }
    for chain in &chains {
        executor = executor.with_chain(chain.clone());
    }
    let executor = Arc::new(executor);

    let candles: Arc<dyn CandleSource> = Arc::new(BrokerCandles::new(executor.clone()));
    let risk = Arc::new(RiskMonitor::new(executor.clone(), Some(candles), config.risk.clone()));
    let poller = Arc::new(OrderPoller::new(executor.clone(), config.poller.clone()));

    let mut engine = EngineContext::new(executor.clone(), risk, poller);
    engine.forward_health(feed.health());
    engine.publish_chains(CHAIN_PUBLISH_INTERVAL);
    engine.start().await;

    // 4. Optional entries
    if !cli.enter.is_empty() {
        wait_for_chains(&chains, Duration::from_secs(cli.warmup_secs)).await;
        for id in &cli.enter {
            match engine.enter(id, &[]).await.with_context(|| format!("entering {id}")) {
                Ok(report) => info!("[runner] {id}: {} placed, {} failed", report.placed(), report.failed()),
                Err(e) => error!("[runner] {e:#}"),
            }
        }
    }

    info!("[runner] running, press Ctrl+C to stop");

    // 5. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("[runner] shutdown signal received");

    // 6. Stop everything
    engine.stop().await;
    for chain in &chains {
        chain.stop();
    }
    feed.stop().await;
    if tokio::time::timeout(Duration::from_secs(5), worker).await.is_err() {
        warn!("[runner] pipeline worker did not stop in time");
    }
    let open = store.executions_with_status(mirror_core::types::ExecutionStatus::Entered).await;
    if !open.is_empty() {
        warn!("[runner] {} execution(s) still open at shutdown", open.len());
    }
    info!("[runner] stopped");
    Ok(())
}

/// Wait until every chain has an ATM, or `timeout`.
async fn wait_for_chains(chains: &[Arc<OptionChain>], timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while chains.iter().any(|c| c.atm().is_none()) {
        if tokio::time::Instant::now() >= deadline {
            let missing: Vec<&str> = chains.iter().filter(|c| c.atm().is_none()).map(|c| c.underlying()).collect();
            warn!("[runner] no underlying price yet for {missing:?}, entering anyway");
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
