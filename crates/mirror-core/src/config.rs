//! Configuration parsing for the trading engine.
//!
//! Everything is read from a single JSON file. Only `accounts` is required;
//! every other section falls back to defaults matching the production
//! settings (3 reconnect attempts, 5 dispatch workers, 5 s risk tick, ...).
//!
//! # Example config
//!
//! ```json
//! {
//!   "meta": { "module_name": "mirror", "log_path": "/var/log/mirror" },
//!   "accounts": [
//!     { "id": "primary", "host_url": "http://127.0.0.1:5000",
//!       "ws_url": "ws://127.0.0.1:8765", "api_key": "...", "is_primary": true },
//!     { "id": "backup", "host_url": "http://10.0.0.2:5000",
//!       "ws_url": "ws://10.0.0.2:8765", "api_key": "...", "rank": 1 }
//!   ],
//!   "chains": [{ "underlying": "NIFTY", "expiry": "28OCT26" }],
//!   "margin": {
//!     "requirements": [
//!       { "instrument": "NIFTY", "trade_kind": "sell_pair", "expiry_day": false, "per_lot": 205000 }
//!     ]
//!   }
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;
use crate::types::{Account, Grade, InstrumentSpec, Strategy, TradeKind};

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Module metadata (name, log path).
    #[serde(default)]
    pub meta: Option<ModuleMeta>,
    /// Broker accounts; failover order is derived from `is_primary`/`rank`.
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub feed: FeedConfig,
    /// Per-underlying overrides of the built-in instrument table.
    #[serde(default)]
    pub instruments: HashMap<String, InstrumentSpec>,
    /// Option chains to maintain.
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub margin: MarginConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    /// Strategies seeded into the store at startup.
    #[serde(default)]
    pub strategies: Vec<Strategy>,
}

/// Module metadata block.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
}

impl AppConfig {
    /// Module name used for the log file prefix.
    pub fn module_name(&self) -> String {
        self.meta
            .as_ref()
            .and_then(|m| m.module_name.clone())
            .unwrap_or_else(|| "mirror".to_string())
    }

    pub fn log_path(&self) -> Option<String> {
        self.meta.as_ref().and_then(|m| m.log_path.clone())
    }

    /// Check cross-section consistency.
    pub fn validate(&self) -> Result<(), MirrorError> {
        if self.accounts.is_empty() {
            return Err(MirrorError::Config("at least one account is required".into()));
        }
        let mut ids = HashSet::new();
        for account in &self.accounts {
            if !ids.insert(account.id.as_str()) {
                return Err(MirrorError::Config(format!("duplicate account id '{}'", account.id)));
            }
        }
        if self.feed.max_reconnect_attempts == 0 {
            return Err(MirrorError::Config("feed.max_reconnect_attempts must be > 0".into()));
        }
        for chain in &self.chains {
            if chain.half_width == 0 {
                return Err(MirrorError::Config(format!("chain '{}' has half_width 0", chain.underlying)));
            }
        }
        for strategy in &self.strategies {
            for account in &strategy.accounts {
                if !ids.contains(account.as_str()) {
                    return Err(MirrorError::Config(format!(
                        "strategy '{}' references unknown account '{account}'",
                        strategy.id
                    )));
                }
            }
        }
        if let Some(session) = &self.risk.session {
            session.parse_times()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Feed (streaming connection)
// ---------------------------------------------------------------------------

/// Reconnect, backoff and health-check settings for the streaming feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Interval between keep-alive pings and staleness checks.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// A session with no inbound frame for this long is recycled.
    #[serde(default = "default_stale_secs")]
    pub stale_after_secs: u64,
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_stale_secs() -> u64 {
    90
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_reconnect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            stale_after_secs: default_stale_secs(),
        }
    }
}

impl FeedConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

// ---------------------------------------------------------------------------
// Option chains
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub underlying: String,
    /// Expiry code as used in symbols (`28OCT26`).
    pub expiry: String,
    /// Strikes on each side of ATM.
    #[serde(default = "default_half_width")]
    pub half_width: u32,
    /// Depth snapshots older than this are reported stale.
    #[serde(default = "default_depth_ttl_ms")]
    pub depth_ttl_ms: u64,
}

fn default_half_width() -> u32 {
    20
}

fn default_depth_ttl_ms() -> u64 {
    30_000
}

impl ChainConfig {
    pub fn depth_ttl(&self) -> Duration {
        Duration::from_millis(self.depth_ttl_ms)
    }
}

// ---------------------------------------------------------------------------
// Margin
// ---------------------------------------------------------------------------

/// One margin-per-lot requirement row.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarginRequirementConfig {
    pub instrument: String,
    pub trade_kind: TradeKind,
    pub expiry_day: bool,
    pub per_lot: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarginConfig {
    /// Utilisation percentage per grade.
    #[serde(default = "default_grades")]
    pub grades: HashMap<Grade, f64>,
    #[serde(default)]
    pub requirements: Vec<MarginRequirementConfig>,
    /// Premium budget per lot for long options, keyed by underlying.
    #[serde(default)]
    pub option_buying_premium: HashMap<String, f64>,
    #[serde(default = "default_buying_premium")]
    pub default_option_buying_premium: f64,
}

fn default_grades() -> HashMap<Grade, f64> {
    HashMap::from([(Grade::A, 95.0), (Grade::B, 65.0), (Grade::C, 36.0)])
}

fn default_buying_premium() -> f64 {
    20_000.0
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self {
            grades: default_grades(),
            requirements: Vec::new(),
            option_buying_premium: HashMap::new(),
            default_option_buying_premium: default_buying_premium(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound on concurrent placements (actual bound is `min(accounts, this)`).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_lots")]
    pub max_lots_per_order: u32,
    /// Attempts per order placement on transport errors.
    #[serde(default = "default_retries")]
    pub placement_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retries")]
    pub exit_attempts: u32,
    #[serde(default = "default_exit_timeout_ms")]
    pub exit_timeout_ms: u64,
}

fn default_max_workers() -> usize {
    5
}

fn default_max_lots() -> u32 {
    50
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_exit_timeout_ms() -> u64 {
    5_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_lots_per_order: default_max_lots(),
            placement_attempts: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            exit_attempts: default_retries(),
            exit_timeout_ms: default_exit_timeout_ms(),
        }
    }
}

impl ExecutionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Risk monitor / trading session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_risk_tick_ms")]
    pub tick_ms: u64,
    /// Checks are skipped outside this window when set.
    #[serde(default)]
    pub session: Option<SessionConfig>,
}

fn default_risk_tick_ms() -> u64 {
    5_000
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self { tick_ms: default_risk_tick_ms(), session: None }
    }
}

impl RiskConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Exchange trading hours.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// `HH:MM` local exchange time.
    #[serde(default = "default_open")]
    pub open: String,
    #[serde(default = "default_close")]
    pub close: String,
    #[serde(default = "default_weekdays")]
    pub weekdays: Vec<Weekday>,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
    /// Exchange offset from UTC in minutes (IST = 330).
    #[serde(default = "default_utc_offset")]
    pub utc_offset_minutes: i32,
}

fn default_open() -> String {
    "09:15".to_string()
}

fn default_close() -> String {
    "15:30".to_string()
}

fn default_weekdays() -> Vec<Weekday> {
    vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
}

fn default_utc_offset() -> i32 {
    330
}

impl SessionConfig {
    fn parse_times(&self) -> Result<(NaiveTime, NaiveTime), MirrorError> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s, "%H:%M")
                .map_err(|e| MirrorError::Config(format!("invalid session time '{s}': {e}")))
        };
        Ok((parse(&self.open)?, parse(&self.close)?))
    }

    /// Whether `now` falls inside the trading session.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let Ok((open, close)) = self.parse_times() else {
            return false;
        };
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_minutes * 60) else {
            return false;
        };
        let local = now.with_timezone(&offset);
        if !self.weekdays.contains(&local.weekday()) || self.holidays.contains(&local.date_naive()) {
            return false;
        }
        let t = local.time();
        t >= open && t <= close
    }

    /// Whole minutes from today's open to `now`, `None` before the open.
    pub fn minutes_since_open(&self, now: DateTime<Utc>) -> Option<i64> {
        let (open, _) = self.parse_times().ok()?;
        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60)?;
        let elapsed = now.with_timezone(&offset).time().signed_duration_since(open).num_minutes();
        (elapsed >= 0).then_some(elapsed)
    }
}

// ---------------------------------------------------------------------------
// Order poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_ms")]
    pub interval_ms: u64,
    /// Pending executions older than this are reported once.
    #[serde(default = "default_max_pending_secs")]
    pub max_pending_age_secs: u64,
}

fn default_poll_ms() -> u64 {
    2_000
}

fn default_max_pending_secs() -> u64 {
    300
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_ms: default_poll_ms(), max_pending_age_secs: default_max_pending_secs() }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Load, parse and validate a JSON config file.
pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let config: AppConfig =
        serde_json::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "accounts": [
            {"id": "a1", "host_url": "http://h1", "ws_url": "ws://h1", "api_key": "k1", "is_primary": true},
            {"id": "a2", "host_url": "http://h2", "ws_url": "ws://h2", "api_key": "k2", "rank": 1}
        ],
        "chains": [{"underlying": "NIFTY", "expiry": "28OCT26"}],
        "margin": {"requirements": [
            {"instrument": "NIFTY", "trade_kind": "sell_c_and_p", "expiry_day": true, "per_lot": 250000}
        ]}
    }"#;

    #[test]
    fn defaults_fill_in() {
        let cfg: AppConfig = serde_json::from_str(MINIMAL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.feed.max_reconnect_attempts, 3);
        assert_eq!(cfg.feed.backoff_max(), Duration::from_secs(60));
        assert_eq!(cfg.execution.max_workers, 5);
        assert_eq!(cfg.poller.interval(), Duration::from_secs(2));
        assert_eq!(cfg.risk.tick(), Duration::from_secs(5));
        assert_eq!(cfg.chains[0].half_width, 20);
        assert_eq!(cfg.margin.grades[&Grade::B], 65.0);
        assert_eq!(cfg.margin.requirements[0].trade_kind, TradeKind::SellPair);
        assert_eq!(cfg.module_name(), "mirror");
    }

    #[test]
    fn rejects_duplicate_accounts() {
        let mut cfg: AppConfig = serde_json::from_str(MINIMAL).unwrap();
        cfg.accounts[1].id = "a1".into();
        assert!(matches!(cfg.validate(), Err(MirrorError::Config(_))));
    }

    #[test]
    fn rejects_unknown_strategy_account() {
        let json = MINIMAL.replacen(
            "\"chains\"",
            r#""strategies": [{"id": "s1", "name": "x", "legs": [], "lot_sizing": "fixed_lots", "accounts": ["nope"]}],
            "chains""#,
            1,
        );
        let cfg: AppConfig = serde_json::from_str(&json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn session_window() {
        let session: SessionConfig = serde_json::from_str(r#"{"holidays": ["2026-10-20"]}"#).unwrap();
        // Monday 2026-10-19 10:00 IST = 04:30 UTC
        let open = DateTime::parse_from_rfc3339("2026-10-19T04:30:00Z").unwrap().with_timezone(&Utc);
        assert!(session.is_open(open));
        // Same day 16:00 IST
        let closed = DateTime::parse_from_rfc3339("2026-10-19T10:30:00Z").unwrap().with_timezone(&Utc);
        assert!(!session.is_open(closed));
        // Holiday
        let holiday = DateTime::parse_from_rfc3339("2026-10-20T04:30:00Z").unwrap().with_timezone(&Utc);
        assert!(!session.is_open(holiday));
        // Saturday
        let weekend = DateTime::parse_from_rfc3339("2026-10-24T04:30:00Z").unwrap().with_timezone(&Utc);
        assert!(!session.is_open(weekend));

        // 10:00 IST is 45 minutes after the 09:15 open
        assert_eq!(session.minutes_since_open(open), Some(45));
        let early = DateTime::parse_from_rfc3339("2026-10-19T03:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(session.minutes_since_open(early), None);
    }
}
