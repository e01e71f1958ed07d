//! Market data pipeline: parse, classify, fan out.
//!
//! # Architecture
//!
//! ```text
//! FailoverFeed (async task) ──on_text──► crossbeam bounded channel
//!                                            │
//!                                            ▼
//!                                 pipeline worker (spawn_blocking)
//!                                            │ parse_message
//!                                            ▼
//!                     handlers registered for the event's mode (in order)
//! ```
//!
//! A single worker consumes the channel, so events reach handlers in arrival
//! order. Handler failures (errors or panics) are logged per handler and do
//! not stop delivery to the remaining handlers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mirror_core::time_util;
use mirror_core::types::{MarketEvent, Mode};
use mirror_core::ws::OnMessageCallback;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::parser::{Parsed, parse_message};

/// Default raw-frame channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8192;

/// A consumer of classified market data.
pub trait MarketHandler: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &str;

    fn on_event(&self, event: &MarketEvent) -> anyhow::Result<()>;
}

type HandlerList = Arc<Vec<(Mode, Arc<dyn MarketHandler>)>>;

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub events: AtomicU64,
    pub control: AtomicU64,
    pub discarded: AtomicU64,
    pub handler_failures: AtomicU64,
}

/// Parses raw frames and dispatches them to mode-specific handlers.
#[derive(Default)]
pub struct Pipeline {
    handlers: RwLock<HandlerList>,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `mode`. A handler may be registered
    /// under several modes.
    pub fn register(&self, mode: Mode, handler: Arc<dyn MarketHandler>) {
        let mut guard = self.handlers.write();
        let mut next: Vec<_> = guard.as_ref().clone();
        info!("[pipeline] registered handler '{}' for {mode}", handler.name());
        next.push((mode, handler));
        *guard = Arc::new(next);
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Parse one raw frame and dispatch it.
    pub fn on_message(&self, raw: &str) {
        match parse_message(raw, time_util::now_ms()) {
            Parsed::Event(event) => {
                self.stats.events.fetch_add(1, Ordering::Relaxed);
                self.dispatch(&event);
            }
            Parsed::Control(kind) => {
                self.stats.control.fetch_add(1, Ordering::Relaxed);
                debug!("[pipeline] control frame '{kind}'");
            }
            Parsed::Unrecognized(reason) => {
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                warn!("[pipeline] discarding message ({reason}): {}", truncate(raw, 200));
            }
        }
    }

    /// Synchronous fan-out to every handler registered for the event's mode.
    pub fn dispatch(&self, event: &MarketEvent) {
        let handlers = self.handlers.read().clone();
        let mode = event.mode();
        for (_, handler) in handlers.iter().filter(|(m, _)| *m == mode) {
            match catch_unwind(AssertUnwindSafe(|| handler.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("[pipeline] handler '{}' failed on {}: {e:#}", handler.name(), event.symbol());
                }
                Err(_) => {
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!("[pipeline] handler '{}' panicked on {}", handler.name(), event.symbol());
                }
            }
        }
    }

    /// Start the pipeline worker on a blocking thread.
    ///
    /// Returns the callback to hand to the feed and the worker's join
    /// handle. The worker exits once every clone of the callback is dropped.
    pub fn spawn_worker(self: &Arc<Self>, capacity: usize) -> (OnMessageCallback, tokio::task::JoinHandle<()>) {
        let (tx, rx) = crossbeam_channel::bounded::<String>(capacity);
        let pipeline = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || {
            info!("[pipeline] worker started");
            while let Ok(raw) = rx.recv() {
                pipeline.on_message(&raw);
            }
            info!("[pipeline] worker stopped");
        });

        let on_text: OnMessageCallback = Arc::new(move |account_id, text| {
            if tx.try_send(text.to_owned()).is_err() {
                warn!("[pipeline] channel full, dropping frame from {account_id}");
            }
        });
        (on_text, handle)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl MarketHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_event(&self, event: &MarketEvent) -> anyhow::Result<()> {
            self.seen.lock().push(format!("{}:{}", event.mode(), event.symbol()));
            Ok(())
        }
    }

    struct Failing;

    impl MarketHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_event(&self, _: &MarketEvent) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct Panicking;

    impl MarketHandler for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn on_event(&self, _: &MarketEvent) -> anyhow::Result<()> {
            panic!("handler bug")
        }
    }

    const LTP: &str = r#"{"type":"market_data","symbol":"NIFTY","exchange":"NSE_INDEX","mode":1,"data":{"ltp":25000}}"#;
    const DEPTH: &str = r#"{"type":"market_data","symbol":"NIFTY28OCT2625000CE","exchange":"NFO","mode":3,"data":{"ltp":100,"bids":[],"asks":[]}}"#;

    #[test]
    fn routes_by_mode() {
        let pipeline = Pipeline::new();
        let price = Arc::new(Recorder::default());
        let depth = Arc::new(Recorder::default());
        pipeline.register(Mode::Price, price.clone());
        pipeline.register(Mode::Depth, depth.clone());

        pipeline.on_message(LTP);
        pipeline.on_message(DEPTH);
        pipeline.on_message(r#"{"type":"auth","status":"success"}"#);
        pipeline.on_message("garbage");

        assert_eq!(*price.seen.lock(), vec!["ltp:NIFTY".to_string()]);
        assert_eq!(*depth.seen.lock(), vec!["depth:NIFTY28OCT2625000CE".to_string()]);
        assert_eq!(pipeline.stats().events.load(Ordering::Relaxed), 2);
        assert_eq!(pipeline.stats().control.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().discarded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failing_handlers_are_isolated() {
        let pipeline = Pipeline::new();
        let rec = Arc::new(Recorder::default());
        pipeline.register(Mode::Price, Arc::new(Failing));
        pipeline.register(Mode::Price, Arc::new(Panicking));
        pipeline.register(Mode::Price, rec.clone());

        pipeline.on_message(LTP);
        pipeline.on_message(LTP);

        assert_eq!(rec.seen.lock().len(), 2);
        assert_eq!(pipeline.stats().handler_failures.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn worker_preserves_arrival_order() {
        let pipeline = Arc::new(Pipeline::new());
        let rec = Arc::new(Recorder::default());
        pipeline.register(Mode::Price, rec.clone());

        let (on_text, handle) = pipeline.spawn_worker(64);
        for i in 0..10 {
            let msg = format!(r#"{{"type":"market_data","symbol":"S{i}","mode":1,"data":{{"ltp":1}}}}"#);
            on_text("acc", &msg);
        }
        drop(on_text);
        handle.await.unwrap();

        let seen = rec.seen.lock().clone();
        let expected: Vec<String> = (0..10).map(|i| format!("ltp:S{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn truncate_respects_char_boundary() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("aé", 2), "a");
    }
}
