//! Position management module
//!
//! - `store`: authoritative position records and their durable snapshot
//! - `cooldown`: per-instrument re-entry blocks
//! - `risk`: the per-tick exit state machine

pub mod cooldown;
pub mod risk;
pub mod store;

pub use cooldown::CooldownTracker;
pub use risk::{evaluate, Decision, ExitKind, RiskEngine, RiskParams};
pub use store::{Position, PositionStore, ReconcileReport};
