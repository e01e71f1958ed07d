//! Order reconciliation.
//!
//! `pending` executions are matched against their account's order book on a
//! fixed interval. The book is fetched once per account per pass, and a
//! failed fetch only delays that account.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use mirror_core::config::PollerConfig;
use mirror_core::time_util::utc_now;
use mirror_core::types::{BrokerOrderStatus, Execution, ExecutionPatch, ExecutionStatus, OrderRecord};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::EngineEvent;
use crate::executor::Executor;

/// What the order book says about one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Every order complete; quantity-weighted average fill price.
    Filled { price: f64, quantity: u32 },
    /// Every order settled, some filled and some rejected or cancelled.
    Partial { price: f64, quantity: u32, reason: String },
    /// Nothing filled and an order was rejected or cancelled.
    Failed(String),
    Pending,
}

/// Match an execution's order ids against an order book index.
pub fn reconcile(execution: &Execution, book: &AHashMap<&str, &OrderRecord>) -> Reconciled {
    if execution.order_ids.is_empty() {
        return Reconciled::Pending;
    }
    let mut filled_qty = 0u32;
    let mut notional = 0.0;
    let mut waiting = false;
    let mut failure: Option<String> = None;
    for id in &execution.order_ids {
        let Some(order) = book.get(id.as_str()) else {
            waiting = true;
            continue;
        };
        match order.status {
            BrokerOrderStatus::Rejected | BrokerOrderStatus::Cancelled => {
                if failure.is_none() {
                    failure = Some(order.reason.clone().unwrap_or_else(|| {
                        let what = if order.status == BrokerOrderStatus::Rejected { "rejected" } else { "cancelled" };
                        format!("order {id} {what}")
                    }));
                }
            }
            BrokerOrderStatus::Complete => match order.average_price {
                Some(price) if order.quantity > 0 => {
                    filled_qty += order.quantity;
                    notional += price * f64::from(order.quantity);
                }
                _ => waiting = true,
            },
            _ => waiting = true,
        }
    }
    if waiting {
        return Reconciled::Pending;
    }
    match (filled_qty, failure) {
        (0, Some(reason)) => Reconciled::Failed(reason),
        (0, None) => Reconciled::Pending,
        (quantity, None) => Reconciled::Filled { price: notional / f64::from(quantity), quantity },
        (quantity, Some(reason)) => Reconciled::Partial { price: notional / f64::from(quantity), quantity, reason },
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub entered: usize,
    pub failed: usize,
    pub pending: usize,
    pub account_errors: usize,
}

pub struct OrderPoller {
    executor: Arc<Executor>,
    config: PollerConfig,
    /// Executions already reported as overdue.
    overdue: Mutex<AHashSet<String>>,
}

impl OrderPoller {
    pub fn new(executor: Arc<Executor>, config: PollerConfig) -> Self {
        Self { executor, config, overdue: Mutex::new(AHashSet::new()) }
    }

    /// One pass over all pending executions.
    pub async fn poll_once(&self) -> PollReport {
        self.poll_at(utc_now()).await
    }

    pub async fn poll_at(&self, now: DateTime<Utc>) -> PollReport {
        let pending = self.executor.store().executions_with_status(ExecutionStatus::Pending).await;
        if pending.is_empty() {
            return PollReport::default();
        }

        let mut by_account: BTreeMap<String, Vec<Execution>> = BTreeMap::new();
        for row in pending {
            by_account.entry(row.account_id.clone()).or_default().push(row);
        }

        let mut passes = Vec::with_capacity(by_account.len());
        for (account, rows) in by_account {
            passes.push(self.poll_account(account, rows, now));
        }
        join_all(passes).await.into_iter().fold(PollReport::default(), |mut acc, r| {
            acc.entered += r.entered;
            acc.failed += r.failed;
            acc.pending += r.pending;
            acc.account_errors += r.account_errors;
            acc
        })
    }

    async fn poll_account(&self, account: String, rows: Vec<Execution>, now: DateTime<Utc>) -> PollReport {
        let mut report = PollReport::default();
        let Some(broker) = self.executor.broker(&account) else {
            warn!("[poller] no broker for account {account}, {} execution(s) left pending", rows.len());
            report.account_errors = 1;
            report.pending = rows.len();
            return report;
        };
        let book = match broker.order_book().await {
            Ok(book) => book,
            Err(e) => {
                warn!("[poller] {account}: order book fetch failed: {e}");
                report.account_errors = 1;
                report.pending = rows.len();
                return report;
            }
        };
        let index: AHashMap<&str, &OrderRecord> = book.iter().map(|o| (o.order_id.as_str(), o)).collect();
        debug!("[poller] {account}: {} order(s) in book, {} pending execution(s)", book.len(), rows.len());

        let store = self.executor.store();
        for row in rows {
            let (next, patch) = match reconcile(&row, &index) {
                Reconciled::Pending => {
                    self.check_overdue(&row, now);
                    report.pending += 1;
                    continue;
                }
                Reconciled::Filled { price, quantity } => (
                    ExecutionStatus::Entered,
                    ExecutionPatch { quantity: Some(quantity), entry_price: Some(price), ..Default::default() },
                ),
                Reconciled::Partial { price, quantity, reason } => {
                    warn!("[poller] {account}: {} filled {quantity} of {}: {reason}", row.symbol, row.quantity);
                    (
                        ExecutionStatus::Entered,
                        ExecutionPatch {
                            quantity: Some(quantity),
                            entry_price: Some(price),
                            error_message: Some(reason),
                            ..Default::default()
                        },
                    )
                }
                Reconciled::Failed(reason) => (
                    ExecutionStatus::Error,
                    ExecutionPatch { error_message: Some(reason), ..Default::default() },
                ),
            };
            self.overdue.lock().remove(&row.id);
            match store.transition(&row.id, next, patch).await {
                Ok(updated) => {
                    match next {
                        ExecutionStatus::Entered => {
                            info!(
                                "[poller] {account}: {} entered {} at {:?}",
                                updated.symbol, updated.quantity, updated.entry_price
                            );
                            report.entered += 1;
                        }
                        _ => {
                            warn!(
                                "[poller] {account}: {} failed: {}",
                                updated.symbol,
                                updated.error_message.as_deref().unwrap_or("")
                            );
                            report.failed += 1;
                        }
                    }
                    self.executor.hub().publish(EngineEvent::Execution(updated));
                }
                // Another writer moved it first.
                Err(e) => debug!("[poller] {account}: {e}"),
            }
        }
        report
    }

    fn check_overdue(&self, row: &Execution, now: DateTime<Utc>) {
        let age = now.signed_duration_since(row.created_at);
        if age.num_seconds() < 0 || (age.num_seconds() as u64) < self.config.max_pending_age_secs {
            return;
        }
        if self.overdue.lock().insert(row.id.clone()) {
            warn!(
                "[poller] {} {} on {} pending for {}s, orders {:?}",
                row.id,
                row.symbol,
                row.account_id,
                age.num_seconds(),
                row.order_ids
            );
        }
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("[poller] started, interval {:?}", poller.config.interval());
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let r = poller.poll_once().await;
                        if r.entered + r.failed > 0 {
                            info!("[poller] {} entered, {} failed, {} still pending", r.entered, r.failed, r.pending);
                        }
                    }
                }
            }
            info!("[poller] stopped");
        })
    }
}
