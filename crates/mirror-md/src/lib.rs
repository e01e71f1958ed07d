//! # mirror-md
//!
//! Market data side of the engine.
//!
//! - [`parser`]: classifies streaming frames into price / quote / depth events
//! - [`pipeline`]: worker thread + mode-keyed fan-out to [`pipeline::MarketHandler`]s
//! - [`option_chain`]: ATM, strike ladder, depth cache, chain view
//! - [`price_book`]: last traded price per symbol
//! - [`json_util`]: JSON parsing helpers

pub mod json_util;
pub mod option_chain;
pub mod parser;
pub mod pipeline;
pub mod price_book;

pub use option_chain::{OptionChain, compute_atm_strike};
pub use pipeline::{MarketHandler, Pipeline};
pub use price_book::PriceBook;
