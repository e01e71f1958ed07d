//! Events pushed to UI and alerting consumers.
//!
//! Publishing never blocks and never fails: with no subscriber the event is
//! dropped, and a lagging subscriber skips the oldest events.

use mirror_core::types::{Execution, RiskEvent};
use mirror_core::ws::FeedHealth;
use mirror_md::option_chain::ChainView;
use serde::Serialize;
use tokio::sync::broadcast;

pub const DEFAULT_HUB_CAPACITY: usize = 1024;

/// A typed event emitted by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Full chain snapshot after a ladder rebuild or on a timer.
    OptionChain(ChainView),

    /// An execution was created or changed status.
    Execution(Execution),

    /// A risk threshold was breached.
    Risk(RiskEvent),

    /// Streaming connection state change.
    Health(FeedHealth),

    /// Something needs manual intervention (failed exit, all accounts down).
    FatalAlert {
        /// Component raising the alert.
        source: String,
        message: String,
    },
}

/// Cloneable broadcast hub.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_HUB_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn fatal(&self, source: &str, message: impl Into<String>) {
        self.publish(EngineEvent::FatalAlert { source: source.to_string(), message: message.into() });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let hub = EventHub::new(8);
        hub.publish(EngineEvent::FatalAlert { source: "x".into(), message: "dropped".into() });

        let mut rx = hub.subscribe();
        hub.fatal("executor", "exit failed");
        match rx.recv().await.unwrap() {
            EngineEvent::FatalAlert { source, message } => {
                assert_eq!(source, "executor");
                assert_eq!(message, "exit failed");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn serializes_with_type_tag() {
        let v = serde_json::to_value(EngineEvent::FatalAlert { source: "feed".into(), message: "down".into() }).unwrap();
        assert_eq!(v["type"], "fatal_alert");
        assert_eq!(v["data"]["source"], "feed");
    }
}
