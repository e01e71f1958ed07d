//! Execution records and risk audit events.
//!
//! An [`Execution`] is one (leg, account) placement. Its status only moves
//! forward; see [`ExecutionStatus::can_transition_to`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{Product, Side};

// ---------------------------------------------------------------------------
// Status state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Order placed, fill not yet confirmed.
    Pending,
    /// Fill confirmed, position open.
    Entered,
    /// Exit order placed and filled.
    Exited,
    /// Placement, fill or exit failure.
    Error,
    /// Monitoring halted manually or by risk; position may still be open.
    Stopped,
}

impl ExecutionStatus {
    /// The only status a new record may be created with.
    pub const INITIAL: Self = Self::Pending;

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Error)
    }

    /// Whether `self → next` is a legal forward transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Entered)
                | (Pending, Error)
                | (Pending, Stopped)
                | (Entered, Exited)
                | (Entered, Error)
                | (Entered, Stopped)
                | (Stopped, Exited)
                | (Stopped, Error)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Entered => "entered",
            Self::Exited => "exited",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub strategy_id: String,
    pub leg_number: u32,
    pub account_id: String,
    pub symbol: String,
    pub exchange: String,
    pub action: Side,
    pub product: Product,
    /// Total quantity in units across all sub-orders.
    pub quantity: u32,
    /// Broker order ids, one per freeze-split sub-order.
    pub order_ids: Vec<String>,
    pub status: ExecutionStatus,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub exit_order_ids: Vec<String>,
    pub exit_reason: Option<String>,
    pub error_message: Option<String>,
    /// Latest traded price seen for `symbol`.
    pub last_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Realised P&L for exited rows, unrealised (at `mark`) for open rows.
    ///
    /// Returns `None` when a needed price is missing.
    pub fn pnl(&self, mark: Option<f64>) -> Option<f64> {
        let entry = self.entry_price?;
        let price = match self.status {
            ExecutionStatus::Exited => self.exit_price?,
            ExecutionStatus::Entered | ExecutionStatus::Stopped => mark.or(self.last_price)?,
            ExecutionStatus::Pending | ExecutionStatus::Error => return None,
        };
        Some((price - entry) * self.quantity as f64 * self.action.sign())
    }
}

/// Fields a transition may set alongside the new status.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    /// Units actually filled, when less than placed.
    pub quantity: Option<u32>,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub exit_order_ids: Option<Vec<String>>,
    pub exit_reason: Option<String>,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Risk events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventType {
    MaxLoss,
    MaxProfit,
    TrailingSl,
    Supertrend,
}

impl std::fmt::Display for RiskEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MaxLoss => "max_loss",
            Self::MaxProfit => "max_profit",
            Self::TrailingSl => "trailing_sl",
            Self::Supertrend => "supertrend",
        };
        f.write_str(s)
    }
}

/// Immutable audit record of one threshold breach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub id: String,
    pub strategy_id: String,
    pub event_type: RiskEventType,
    pub threshold_value: f64,
    pub current_value: f64,
    pub action_taken: String,
    pub exit_order_ids: Vec<String>,
    pub notes: Option<String>,
    pub triggered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ExecutionStatus; 5] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Entered,
        ExecutionStatus::Exited,
        ExecutionStatus::Error,
        ExecutionStatus::Stopped,
    ];

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [ExecutionStatus::Exited, ExecutionStatus::Error] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn nothing_returns_to_pending() {
        for from in ALL {
            assert!(!from.can_transition_to(ExecutionStatus::Pending));
        }
        assert_eq!(ExecutionStatus::INITIAL, ExecutionStatus::Pending);
    }

    #[test]
    fn forward_path() {
        assert!(ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Entered));
        assert!(ExecutionStatus::Entered.can_transition_to(ExecutionStatus::Exited));
        assert!(!ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Exited));
        assert!(!ExecutionStatus::Entered.can_transition_to(ExecutionStatus::Entered));
    }

    #[test]
    fn pnl_sign_follows_side() {
        let now = Utc::now();
        let mut e = Execution {
            id: "e1".into(),
            strategy_id: "s1".into(),
            leg_number: 1,
            account_id: "a".into(),
            symbol: "NIFTY28OCT2625000CE".into(),
            exchange: "NFO".into(),
            action: Side::Sell,
            product: Product::Mis,
            quantity: 75,
            order_ids: vec!["o1".into()],
            status: ExecutionStatus::Entered,
            entry_price: Some(100.0),
            exit_price: None,
            exit_order_ids: vec![],
            exit_reason: None,
            error_message: None,
            last_price: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(e.pnl(Some(120.0)), Some(-1500.0));
        assert_eq!(e.pnl(None), None);
        e.action = Side::Buy;
        e.status = ExecutionStatus::Exited;
        e.exit_price = Some(90.0);
        assert_eq!(e.pnl(None), Some(-750.0));
    }
}
