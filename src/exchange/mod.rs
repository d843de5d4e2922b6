//! Exchange gateway - the opaque price/balance/order oracle
//!
//! The wire protocol of a concrete exchange lives behind [`ExchangeGateway`].
//! Every call may fail transiently, time out, or return an ambiguous result;
//! the [`crate::trading::SafeOrderExecutor`] is the only component that
//! places orders and turns those failures into tagged outcomes.

pub mod paper;

use async_trait::async_trait;

use crate::error::Result;

pub use paper::PaperExchange;

/// Exchange acknowledgement for a submitted order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderToken(pub String);

impl std::fmt::Display for OrderToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability set consumed from the exchange
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Last traded price in quote currency, `None` when unknown
    async fn current_price(&self, instrument: &str) -> Result<Option<f64>>;

    /// Free balance of an asset (`"KRW"`, `"XRP"`), `None` when unknown
    async fn balance(&self, asset: &str) -> Result<Option<f64>>;

    /// Market buy spending `quote_amount`; `Ok(None)` means no acknowledgement
    async fn place_market_buy(&self, instrument: &str, quote_amount: f64)
        -> Result<Option<OrderToken>>;

    /// Market sell of `base_amount`; `Ok(None)` means no acknowledgement
    async fn place_market_sell(&self, instrument: &str, base_amount: f64)
        -> Result<Option<OrderToken>>;

    /// Exchange-side average buy price, used when no local cost basis exists
    async fn average_buy_price(&self, _instrument: &str) -> Result<Option<f64>> {
        Ok(None)
    }
}

/// Base asset of an instrument (`"KRW-XRP"` -> `"XRP"`)
pub fn base_asset(instrument: &str) -> &str {
    match instrument.split_once('-') {
        Some((_, base)) => base,
        None => instrument,
    }
}

/// Quote asset of an instrument (`"KRW-XRP"` -> `"KRW"`)
pub fn quote_asset(instrument: &str) -> Option<&str> {
    instrument.split_once('-').map(|(quote, _)| quote)
}
