//! Broker account records as seen by the engine.
//!
//! Credential storage lives outside the engine; an [`Account`] only carries
//! the API key reference and endpoints needed to talk to the broker.

use serde::{Deserialize, Serialize};

/// One broker connection account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identifier used in executions and logs.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Broker label reported by the upstream ping.
    #[serde(default)]
    pub broker: String,
    /// REST base URL (e.g. `http://127.0.0.1:5000`).
    pub host_url: String,
    /// Streaming URL (e.g. `ws://127.0.0.1:8765`).
    pub ws_url: String,
    /// API key sent with every request.
    pub api_key: String,
    /// Primary accounts are tried first during failover.
    #[serde(default)]
    pub is_primary: bool,
    /// Ordering among backups, lower first.
    #[serde(default)]
    pub rank: u32,
}

impl Account {
    /// Label used in log lines.
    pub fn label(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

// Keep API keys out of logs.
impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("broker", &self.broker)
            .field("host_url", &self.host_url)
            .field("ws_url", &self.ws_url)
            .field("is_primary", &self.is_primary)
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

/// Sort accounts into failover order: primary first, then by rank.
pub fn failover_order(mut accounts: Vec<Account>) -> Vec<Account> {
    accounts.sort_by(|a, b| b.is_primary.cmp(&a.is_primary).then(a.rank.cmp(&b.rank)));
    accounts
}
