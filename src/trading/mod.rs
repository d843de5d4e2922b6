//! Trading module - order execution against the exchange gateway
//!
//! - `executor`: balance-verified market orders with retries, spacing and
//!   per-instrument serialization
//! - `retry`: the shared backoff policy

pub mod executor;
pub mod retry;

pub use executor::{
    floor_to_precision, BuyFill, BuyOutcome, FailReason, SafeOrderExecutor, SellFill,
    SellOutcome, SkipReason,
};
pub use retry::{RetryError, RetryPolicy};
