//! # mirror-engine
//!
//! Order and risk orchestration on top of the market data and broker crates.
//!
//! | Module      | Role                                                        |
//! |-------------|-------------------------------------------------------------|
//! | `executor`  | concurrent (account × leg) entry and single-row exit        |
//! | `risk`      | per-strategy P&L, trailing stop and Supertrend exits        |
//! | `poller`    | promotes `pending` executions from each account's order book|
//! | `signal`    | Supertrend                                                  |
//! | `store`     | execution persistence contract and in-memory store          |
//! | `event`     | broadcast hub for UI/alert consumers                        |
//! | `lifecycle` | owns the background tasks and their shutdown                |

pub mod event;
pub mod executor;
pub mod lifecycle;
pub mod poller;
pub mod risk;
pub mod signal;
pub mod store;

pub use event::{EngineEvent, EventHub};
pub use executor::Executor;
pub use lifecycle::EngineContext;
pub use store::{ExecutionStore, MemoryStore};

#[cfg(test)]
mod testkit;
