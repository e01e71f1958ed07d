//! Failover-capable streaming feed.
//!
//! One supervisor task owns the upstream session for a logical account
//! group. It walks the account list in failover order:
//!
//! ```text
//! connecting ──ok──► connected ──lost/stale──► reconnecting ──ok──► connected
//!     │                                            │
//!     └──────────── attempts exhausted / auth ─────┴──► failed ──► next account
//!                                                                  (or fatal)
//! ```
//!
//! Every entry into `connected` replays the whole [`SubscriptionSet`].
//! Observers follow progress through a `watch` channel of [`FeedHealth`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::client::{Backoff, Inbound, OnMessageCallback, StreamConnector, StreamSession};
use crate::config::FeedConfig;
use crate::error::MirrorError;
use crate::subscription::{Subscription, SubscriptionSet, SubscriptionSink};
use crate::time_util::now_ms;
use crate::types::Account;

// ---------------------------------------------------------------------------
// Health reporting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Snapshot published on every state change.
#[derive(Debug, Clone, Serialize)]
pub struct FeedHealth {
    pub state: ConnectionState,
    /// Account currently in use (or last tried).
    pub account_id: Option<String>,
    pub account_switches: u32,
    pub reconnect_count: u32,
    pub total_failures: u32,
    pub last_error: Option<String>,
    /// Every configured account failed; manual intervention required.
    pub fatal: bool,
}

impl Default for FeedHealth {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            account_id: None,
            account_switches: 0,
            reconnect_count: 0,
            total_failures: 0,
            last_error: None,
            fatal: false,
        }
    }
}

/// Message counters, updated per frame without touching the watch channel.
#[derive(Debug, Default)]
pub struct FeedStats {
    pub messages_received: AtomicU64,
    pub last_message_ms: AtomicU64,
}

/// One account switch.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverRecord {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum FeedCommand {
    Subscribe(Subscription),
    Unsubscribe(Subscription),
}

/// Cloneable handle for adding and removing subscriptions.
#[derive(Clone)]
pub struct FeedHandle {
    subscriptions: Arc<SubscriptionSet>,
    cmd_tx: mpsc::UnboundedSender<FeedCommand>,
}

impl FeedHandle {
    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }
}

impl SubscriptionSink for FeedHandle {
    fn subscribe(&self, sub: Subscription) {
        if self.subscriptions.acquire(&sub) {
            let _ = self.cmd_tx.send(FeedCommand::Subscribe(sub));
        }
    }

    fn unsubscribe(&self, sub: Subscription) {
        if self.subscriptions.release(&sub) {
            let _ = self.cmd_tx.send(FeedCommand::Unsubscribe(sub));
        }
    }
}

// ---------------------------------------------------------------------------
// FailoverFeed
// ---------------------------------------------------------------------------

/// Streaming feed over an ordered list of accounts.
pub struct FailoverFeed {
    accounts: Vec<Account>,
    config: FeedConfig,
    connector: Arc<dyn StreamConnector>,
    subscriptions: Arc<SubscriptionSet>,
    stats: Arc<FeedStats>,
    history: Arc<Mutex<Vec<FailoverRecord>>>,
    health_tx: Arc<watch::Sender<FeedHealth>>,
    cmd_tx: mpsc::UnboundedSender<FeedCommand>,
    cmd_rx: Option<mpsc::UnboundedReceiver<FeedCommand>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl FailoverFeed {
    /// `accounts` must already be in failover order (primary first).
    pub fn new(accounts: Vec<Account>, config: FeedConfig, connector: Arc<dyn StreamConnector>) -> Self {
        let (health_tx, _) = watch::channel(FeedHealth::default());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            accounts,
            config,
            connector,
            subscriptions: Arc::new(SubscriptionSet::new()),
            stats: Arc::new(FeedStats::default()),
            history: Arc::new(Mutex::new(Vec::new())),
            health_tx: Arc::new(health_tx),
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn handle(&self) -> FeedHandle {
        FeedHandle { subscriptions: self.subscriptions.clone(), cmd_tx: self.cmd_tx.clone() }
    }

    pub fn health(&self) -> watch::Receiver<FeedHealth> {
        self.health_tx.subscribe()
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        self.stats.clone()
    }

    pub fn failover_history(&self) -> Vec<FailoverRecord> {
        self.history.lock().clone()
    }

    /// Spawn the supervisor task. Calling `start` twice is a no-op.
    pub fn start(&mut self, on_text: OnMessageCallback) {
        let Some(cmd_rx) = self.cmd_rx.take() else {
            warn!("[feed] start called twice");
            return;
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor {
            accounts: self.accounts.clone(),
            config: self.config.clone(),
            connector: self.connector.clone(),
            subscriptions: self.subscriptions.clone(),
            stats: self.stats.clone(),
            history: self.history.clone(),
            health_tx: self.health_tx.clone(),
            on_text,
            cmd_rx,
            shutdown_rx,
        };
        self.task = Some(tokio::spawn(supervisor.run()));
        self.shutdown_tx = Some(shutdown_tx);
    }

    /// Signal shutdown and wait for the supervisor to close its session.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor task
// ---------------------------------------------------------------------------

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Supervisor {
    accounts: Vec<Account>,
    config: FeedConfig,
    connector: Arc<dyn StreamConnector>,
    subscriptions: Arc<SubscriptionSet>,
    stats: Arc<FeedStats>,
    history: Arc<Mutex<Vec<FailoverRecord>>>,
    health_tx: Arc<watch::Sender<FeedHealth>>,
    on_text: OnMessageCallback,
    cmd_rx: mpsc::UnboundedReceiver<FeedCommand>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    fn publish(&self, f: impl FnOnce(&mut FeedHealth)) {
        self.health_tx.send_modify(f);
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff_base(), self.config.backoff_max());
        let mut index = 0;

        while index < self.accounts.len() {
            let account = self.accounts[index].clone();
            let label = account.label().to_string();
            backoff.reset();
            self.publish(|h| {
                h.state = ConnectionState::Connecting;
                h.account_id = Some(account.id.clone());
            });

            let reason = match self.drive_account(&account, &mut backoff).await {
                None => {
                    self.publish(|h| h.state = ConnectionState::Disconnected);
                    info!("[feed-{label}] stopped");
                    return;
                }
                Some(reason) => reason,
            };

            self.publish(|h| {
                h.state = ConnectionState::Failed;
                h.last_error = Some(reason.clone());
            });

            match self.accounts.get(index + 1) {
                Some(next) => {
                    warn!("[feed-{label}] failing over to '{}': {reason}", next.label());
                    self.history.lock().push(FailoverRecord {
                        from: account.id.clone(),
                        to: next.id.clone(),
                        reason,
                        at: Utc::now(),
                    });
                    self.publish(|h| h.account_switches += 1);
                    index += 1;
                }
                None => {
                    error!("[feed-{label}] all {} account(s) failed, feed is down: {reason}", self.accounts.len());
                    self.publish(|h| h.fatal = true);
                    return;
                }
            }
        }
    }

    /// Connect/reconnect loop for one account.
    ///
    /// Returns `None` on shutdown, or the reason the account was given up.
    async fn drive_account(&mut self, account: &Account, backoff: &mut Backoff) -> Option<String> {
        let label = account.label().to_string();
        let budget = self.config.max_reconnect_attempts;
        let mut attempts_left = budget;
        let mut result = self.connect(account).await;

        loop {
            match result {
                Ok(session) => {
                    backoff.reset();
                    attempts_left = budget;
                    self.publish(|h| h.state = ConnectionState::Connected);
                    info!("[feed-{label}] connected");
                    match self.run_session(session, account).await {
                        SessionEnd::Shutdown => return None,
                        SessionEnd::Lost(reason) => {
                            warn!("[feed-{label}] session lost: {reason}");
                            self.publish(|h| {
                                h.state = ConnectionState::Reconnecting;
                                h.last_error = Some(reason);
                            });
                        }
                    }
                }
                Err(e) if !e.is_retryable() => {
                    error!("[feed-{label}] not retrying: {e}");
                    self.publish(|h| h.total_failures += 1);
                    return Some(e.to_string());
                }
                Err(e) => {
                    warn!("[feed-{label}] connect failed: {e}");
                    self.publish(|h| {
                        h.state = ConnectionState::Reconnecting;
                        h.total_failures += 1;
                        h.last_error = Some(e.to_string());
                    });
                }
            }

            if attempts_left == 0 {
                return Some(format!("{budget} reconnect attempt(s) exhausted"));
            }
            attempts_left -= 1;

            let delay = backoff.next_delay();
            info!("[feed-{label}] reconnecting in {delay:?} ({} left)", attempts_left);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.changed() => return None,
            }
            if self.shutting_down() {
                return None;
            }
            self.publish(|h| h.reconnect_count += 1);
            result = self.connect(account).await;
        }
    }

    async fn connect(&self, account: &Account) -> Result<Box<dyn StreamSession>, MirrorError> {
        match tokio::time::timeout(self.config.connect_timeout(), self.connector.connect(account)).await {
            Ok(result) => result,
            Err(_) => Err(MirrorError::WebSocket(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout()
            ))),
        }
    }

    /// Pump one session until it ends.
    async fn run_session(&mut self, mut session: Box<dyn StreamSession>, account: &Account) -> SessionEnd {
        let label = account.label().to_string();

        // Anything queued while disconnected is covered by the replay below.
        while self.cmd_rx.try_recv().is_ok() {}

        let subs = self.subscriptions.snapshot();
        for sub in &subs {
            if let Err(e) = session.send_text(sub.subscribe_msg()).await {
                return SessionEnd::Lost(format!("resubscribe failed: {e}"));
            }
        }
        if !subs.is_empty() {
            info!("[feed-{label}] replayed {} subscription(s)", subs.len());
        }

        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stale_after = self.config.stale_after();
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    info!("[feed-{label}] shutdown signal received");
                    session.close().await;
                    return SessionEnd::Shutdown;
                }

                frame = session.recv() => {
                    match frame {
                        Some(Ok(Inbound::Text(text))) => {
                            last_inbound = Instant::now();
                            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                            self.stats.last_message_ms.store(now_ms(), Ordering::Relaxed);
                            (self.on_text)(&account.id, &text);
                        }
                        Some(Ok(Inbound::Pong)) => last_inbound = Instant::now(),
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                        None => return SessionEnd::Lost("stream closed".into()),
                    }
                }

                Some(cmd) = self.cmd_rx.recv() => {
                    let msg = match cmd {
                        FeedCommand::Subscribe(sub) if self.subscriptions.contains(&sub) => {
                            debug!("[feed-{label}] subscribe {sub}");
                            sub.subscribe_msg()
                        }
                        FeedCommand::Unsubscribe(sub) if !self.subscriptions.contains(&sub) => {
                            debug!("[feed-{label}] unsubscribe {sub}");
                            sub.unsubscribe_msg()
                        }
                        // Superseded by a later command.
                        _ => continue,
                    };
                    if let Err(e) = session.send_text(msg).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }

                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() > stale_after {
                        session.close().await;
                        return SessionEnd::Lost(format!("no data for {:?}", last_inbound.elapsed()));
                    }
                    if let Err(e) = session.ping().await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
            }
        }
    }
}
