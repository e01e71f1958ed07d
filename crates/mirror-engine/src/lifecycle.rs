//! Background task ownership.
//!
//! [`EngineContext`] starts the poller, one risk monitor per active strategy
//! and the chain/health publishers, and stops them all through a single
//! `watch` shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use mirror_core::ws::FeedHealth;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::event::EngineEvent;
use crate::executor::{EntryReport, Executor};
use crate::poller::OrderPoller;
use crate::risk::RiskMonitor;

/// How long `stop` waits for each task.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EngineContext {
    executor: Arc<Executor>,
    risk: Arc<RiskMonitor>,
    poller: Arc<OrderPoller>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
    monitored: AHashSet<String>,
    started: bool,
}

impl EngineContext {
    pub fn new(executor: Arc<Executor>, risk: Arc<RiskMonitor>, poller: Arc<OrderPoller>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            executor,
            risk,
            poller,
            shutdown_tx,
            tasks: Vec::new(),
            monitored: AHashSet::new(),
            started: false,
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Start the poller and a monitor for every active strategy with risk
    /// parameters. Calling `start` twice is a no-op.
    pub async fn start(&mut self) {
        if self.started {
            warn!("[engine] start called twice");
            return;
        }
        self.started = true;
        let poller = self.poller.spawn(self.shutdown_tx.subscribe());
        self.tasks.push(("poller".to_string(), poller));

        let strategies = self.executor.store().strategies().await;
        for s in strategies.iter().filter(|s| s.active && !s.risk.is_empty()) {
            self.monitor(&s.id);
        }
        info!("[engine] started: poller + {} risk monitor(s)", self.monitored.len());
    }

    /// Start a risk monitor for `strategy_id` unless one is already running.
    pub fn monitor(&mut self, strategy_id: &str) {
        self.tasks.retain(|(_, h)| !h.is_finished());
        let running: AHashSet<&str> = self.tasks.iter().map(|(n, _)| n.as_str()).collect();
        let name = format!("risk-{strategy_id}");
        if running.contains(name.as_str()) {
            return;
        }
        let handle = self.risk.spawn(strategy_id.to_string(), self.shutdown_tx.subscribe());
        self.monitored.insert(strategy_id.to_string());
        self.tasks.push((name, handle));
    }

    /// Enter a stored strategy and start monitoring it.
    pub async fn enter(&mut self, strategy_id: &str, account_ids: &[String]) -> anyhow::Result<EntryReport> {
        let strategy = self
            .executor
            .store()
            .strategy(strategy_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown strategy {strategy_id}"))?;
        if !strategy.active {
            anyhow::bail!("strategy {strategy_id} is not active");
        }
        let report = self.executor.execute_entry(&strategy, account_ids).await?;
        if !strategy.risk.is_empty() && report.placed() > 0 {
            self.monitor(strategy_id);
        }
        Ok(report)
    }

    /// Publish a chain view for every chain every `interval`.
    pub fn publish_chains(&mut self, interval: Duration) {
        if self.executor.chains().is_empty() {
            return;
        }
        let executor = self.executor.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        for chain in executor.chains() {
                            if chain.atm().is_some() {
                                executor.hub().publish(EngineEvent::OptionChain(chain.view()));
                            }
                        }
                    }
                }
            }
        });
        self.tasks.push(("chain-publisher".to_string(), handle));
    }

    /// Forward feed health changes to the hub, alerting once when the feed
    /// goes fatal.
    pub fn forward_health(&mut self, mut health: watch::Receiver<FeedHealth>) {
        let hub = self.executor.hub().clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut alerted = false;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    changed = health.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = health.borrow_and_update().clone();
                        if snapshot.fatal && !alerted {
                            alerted = true;
                            let reason = snapshot.last_error.clone().unwrap_or_default();
                            error!("[engine] market data feed failed on every account: {reason}");
                            hub.fatal("feed", format!("all accounts failed: {reason}"));
                        } else if !snapshot.fatal {
                            alerted = false;
                        }
                        hub.publish(EngineEvent::Health(snapshot));
                    }
                }
            }
        });
        self.tasks.push(("health-forwarder".to_string(), handle));
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Signal shutdown and wait for every task.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.tasks.drain(..) {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("[engine] task {name} ended abnormally: {e}"),
                Err(_) => warn!("[engine] task {name} did not stop within {STOP_TIMEOUT:?}"),
            }
        }
        self.monitored.clear();
        self.started = false;
        info!("[engine] stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExecutionStore;
    use crate::testkit::{FakeBroker, executor, option_leg, strategy};
    use mirror_core::config::{PollerConfig, RiskConfig};
    use mirror_core::types::{ExecutionStatus, OptionType, RiskParams, Side, StrikeSelection};

    fn context(exec: Arc<Executor>) -> EngineContext {
        let risk = Arc::new(RiskMonitor::new(exec.clone(), None, RiskConfig { tick_ms: 10, session: None }));
        let poller = Arc::new(OrderPoller::new(exec.clone(), PollerConfig { interval_ms: 10, max_pending_age_secs: 60 }));
        EngineContext::new(exec, risk, poller)
    }

    #[tokio::test]
    async fn enter_monitors_and_stop_joins_everything() {
        let a1 = FakeBroker::new("a1");
        let (exec, store) = executor(&[a1.clone()]);
        let leg = option_leg(1, OptionType::Call, StrikeSelection::Strike { strike: 25000 }, Side::Sell, 1);
        let mut s = strategy("s1", vec![leg], &["a1"]);
        s.risk = RiskParams { max_loss: Some(5000.0), ..Default::default() };
        store.upsert_strategy(s).await;

        let mut ctx = context(exec);
        ctx.start().await;
        let report = ctx.enter("s1", &[]).await.unwrap();
        assert_eq!(report.placed(), 1);
        assert_eq!(store.executions_with_status(ExecutionStatus::Pending).await.len(), 1);
        // start already spawned the monitor; enter does not add a second one
        assert_eq!(ctx.running_tasks(), 2);

        ctx.stop().await;
        assert_eq!(ctx.running_tasks(), 0);
        assert!(ctx.enter("missing", &[]).await.is_err());
    }

    #[tokio::test]
    async fn fatal_feed_health_raises_one_alert() {
        let (exec, _) = executor(&[]);
        let mut rx = exec.hub().subscribe();
        let mut ctx = context(exec);
        let (tx, health_rx) = watch::channel(FeedHealth::default());
        ctx.forward_health(health_rx);

        let fatal = FeedHealth { fatal: true, last_error: Some("auth failed".into()), ..Default::default() };
        tx.send(fatal.clone()).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(first, EngineEvent::FatalAlert { ref source, .. } if source == "feed"));
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(second, EngineEvent::Health(ref h) if h.fatal));

        ctx.stop().await;
    }
}
