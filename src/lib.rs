//! Spot Scanner Library
//!
//! Capital allocation and risk-managed exits for a spot-trading account:
//! balance-verified order execution, a per-tick exit state machine, and
//! entry admission over a scanned universe.

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod notify;
pub mod position;
pub mod strategy;
pub mod trading;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
