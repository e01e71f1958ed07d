//! Core data types shared by every crate in the workspace.

pub mod account;
pub mod enums;
pub mod execution;
pub mod instrument;
pub mod market_data;
pub mod strategy;
pub mod symbol;
pub mod trading;

pub use account::*;
pub use enums::*;
pub use execution::*;
pub use instrument::*;
pub use market_data::*;
pub use strategy::*;
pub use symbol::*;
pub use trading::*;
