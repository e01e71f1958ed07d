//! # mirror-core
//!
//! Core crate for the multi-account option trading engine, providing:
//!
//! - **Types** (`types`): enums, market data, orders, accounts, strategies, executions
//! - **Configuration** (`config`): JSON config deserialization
//! - **Error types** (`error`): domain-specific `MirrorError` via thiserror
//! - **Subscriptions** (`subscription`): reference-counted subscription set
//! - **WebSocket** (`ws`): streaming session, backoff and account failover
//! - **Time utilities** (`time_util`): epoch timestamps
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod subscription;
pub mod time_util;
pub mod types;
pub mod ws;

// Re-export types at crate root for convenience.
pub use types::*;
