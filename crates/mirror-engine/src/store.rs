//! Execution persistence contract.
//!
//! The relational store lives outside the engine; the engine only needs
//! single-row reads and upserts. [`MemoryStore`] backs the runner and tests.
//!
//! Status changes go through [`ExecutionStore::transition`], which checks the
//! state machine under the store's lock so two writers (poller and risk
//! monitor) cannot both move a row out of the same state.

use ahash::AHashMap;
use async_trait::async_trait;
use chrono::Utc;
use mirror_core::types::{Execution, ExecutionPatch, ExecutionStatus, RiskEvent, Strategy};
use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("execution {0} not found")]
    NotFound(String),

    #[error("execution {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("execution {id} must be created as {expected}, got {got}")]
    InvalidInitialStatus {
        id: String,
        expected: ExecutionStatus,
        got: ExecutionStatus,
    },

    #[error("execution {0} already exists")]
    Duplicate(String),
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn strategies(&self) -> Vec<Strategy>;

    async fn strategy(&self, id: &str) -> Option<Strategy>;

    async fn upsert_strategy(&self, strategy: Strategy);

    /// Clear the strategy's active flag.
    async fn deactivate_strategy(&self, id: &str);

    /// Insert a new execution. Only `pending` rows may be created.
    async fn create_execution(&self, execution: Execution) -> Result<(), StoreError>;

    async fn execution(&self, id: &str) -> Option<Execution>;

    async fn executions_for_strategy(&self, strategy_id: &str) -> Vec<Execution>;

    async fn executions_with_status(&self, status: ExecutionStatus) -> Vec<Execution>;

    /// Move an execution to `next`, applying `patch`. Fails when the move is
    /// not a legal forward transition.
    async fn transition(&self, id: &str, next: ExecutionStatus, patch: ExecutionPatch)
    -> Result<Execution, StoreError>;

    /// Record the latest mark price. Never changes status.
    async fn set_last_price(&self, id: &str, price: f64);

    async fn append_risk_event(&self, event: RiskEvent);

    async fn risk_events(&self, strategy_id: &str) -> Vec<RiskEvent>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tables {
    strategies: AHashMap<String, Strategy>,
    executions: AHashMap<String, Execution>,
    risk_events: Vec<RiskEvent>,
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategies(strategies: impl IntoIterator<Item = Strategy>) -> Self {
        let store = Self::new();
        {
            let mut t = store.tables.write();
            for s in strategies {
                t.strategies.insert(s.id.clone(), s);
            }
        }
        store
    }
}

fn sorted(mut rows: Vec<Execution>) -> Vec<Execution> {
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    rows
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn strategies(&self) -> Vec<Strategy> {
        let mut all: Vec<Strategy> = self.tables.read().strategies.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    async fn strategy(&self, id: &str) -> Option<Strategy> {
        self.tables.read().strategies.get(id).cloned()
    }

    async fn upsert_strategy(&self, strategy: Strategy) {
        self.tables.write().strategies.insert(strategy.id.clone(), strategy);
    }

    async fn deactivate_strategy(&self, id: &str) {
        if let Some(s) = self.tables.write().strategies.get_mut(id) {
            s.active = false;
        }
    }

    async fn create_execution(&self, execution: Execution) -> Result<(), StoreError> {
        if execution.status != ExecutionStatus::INITIAL {
            return Err(StoreError::InvalidInitialStatus {
                id: execution.id,
                expected: ExecutionStatus::INITIAL,
                got: execution.status,
            });
        }
        let mut t = self.tables.write();
        if t.executions.contains_key(&execution.id) {
            return Err(StoreError::Duplicate(execution.id));
        }
        t.executions.insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn execution(&self, id: &str) -> Option<Execution> {
        self.tables.read().executions.get(id).cloned()
    }

    async fn executions_for_strategy(&self, strategy_id: &str) -> Vec<Execution> {
        let rows = self
            .tables
            .read()
            .executions
            .values()
            .filter(|e| e.strategy_id == strategy_id)
            .cloned()
            .collect();
        sorted(rows)
    }

    async fn executions_with_status(&self, status: ExecutionStatus) -> Vec<Execution> {
        let rows = self.tables.read().executions.values().filter(|e| e.status == status).cloned().collect();
        sorted(rows)
    }

    async fn transition(
        &self,
        id: &str,
        next: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> Result<Execution, StoreError> {
        let mut t = self.tables.write();
        let row = t.executions.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !row.status.can_transition_to(next) {
            return Err(StoreError::IllegalTransition { id: id.to_string(), from: row.status, to: next });
        }
        row.status = next;
        if let Some(q) = patch.quantity {
            row.quantity = q;
        }
        if let Some(p) = patch.entry_price {
            row.entry_price = Some(p);
        }
        if let Some(p) = patch.exit_price {
            row.exit_price = Some(p);
        }
        if let Some(ids) = patch.exit_order_ids {
            row.exit_order_ids = ids;
        }
        if let Some(r) = patch.exit_reason {
            row.exit_reason = Some(r);
        }
        if let Some(m) = patch.error_message {
            row.error_message = Some(m);
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn set_last_price(&self, id: &str, price: f64) {
        if let Some(row) = self.tables.write().executions.get_mut(id) {
            row.last_price = Some(price);
        }
    }

    async fn append_risk_event(&self, event: RiskEvent) {
        self.tables.write().risk_events.push(event);
    }

    async fn risk_events(&self, strategy_id: &str) -> Vec<RiskEvent> {
        self.tables.read().risk_events.iter().filter(|e| e.strategy_id == strategy_id).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::execution;

    #[tokio::test]
    async fn only_pending_can_be_created() {
        let store = MemoryStore::new();
        let mut row = execution("e1", "s1", "a1");
        row.status = ExecutionStatus::Entered;
        assert!(matches!(store.create_execution(row).await, Err(StoreError::InvalidInitialStatus { .. })));
        store.create_execution(execution("e1", "s1", "a1")).await.unwrap();
        assert_eq!(store.create_execution(execution("e1", "s1", "a1")).await, Err(StoreError::Duplicate("e1".into())));
    }

    #[tokio::test]
    async fn transitions_follow_state_machine() {
        let store = MemoryStore::new();
        store.create_execution(execution("e1", "s1", "a1")).await.unwrap();

        let row = store
            .transition("e1", ExecutionStatus::Entered, ExecutionPatch { entry_price: Some(100.0), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(row.entry_price, Some(100.0));

        let err = store.transition("e1", ExecutionStatus::Pending, ExecutionPatch::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { from: ExecutionStatus::Entered, .. }));

        store
            .transition(
                "e1",
                ExecutionStatus::Exited,
                ExecutionPatch { exit_price: Some(90.0), exit_reason: Some("max_loss".into()), ..Default::default() },
            )
            .await
            .unwrap();
        // exited is terminal
        for next in [ExecutionStatus::Entered, ExecutionStatus::Error, ExecutionStatus::Stopped] {
            assert!(store.transition("e1", next, ExecutionPatch::default()).await.is_err());
        }
        assert_eq!(
            store.transition("missing", ExecutionStatus::Entered, ExecutionPatch::default()).await,
            Err(StoreError::NotFound("missing".into()))
        );
    }

    #[tokio::test]
    async fn queries_by_strategy_and_status() {
        let store = MemoryStore::new();
        store.create_execution(execution("e1", "s1", "a1")).await.unwrap();
        store.create_execution(execution("e2", "s2", "a1")).await.unwrap();
        store.set_last_price("e1", 12.5).await;
        assert_eq!(store.executions_for_strategy("s1").await.len(), 1);
        assert_eq!(store.executions_with_status(ExecutionStatus::Pending).await.len(), 2);
        assert_eq!(store.execution("e1").await.unwrap().last_price, Some(12.5));
    }
}
