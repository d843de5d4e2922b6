//! Safe order executor
//!
//! Turns "buy X quote of T" / "sell fraction F of T" into a balance-verified
//! fill. All calls for one instrument are serialized behind a per-instrument
//! lock, orders on the same instrument are spaced by a minimum interval, and
//! submissions are retried with exponential backoff. Fill prices are always
//! derived from balance deltas, never from a quoted price.
//!
//! No error escapes this module: every call ends in a tagged outcome.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::retry::{RetryError, RetryPolicy};
use crate::clock::Clock;
use crate::config::ExecutionConfig;
use crate::error::{Error, Result};
use crate::exchange::{base_asset, quote_asset, ExchangeGateway, OrderToken};

/// Why an order was not attempted
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Notional below the exchange minimum order
    BelowMinimumOrder { notional: f64, minimum: f64 },
    /// The account cannot cover the order
    InsufficientFunds { available: f64, required: f64 },
}

/// Why an order attempt failed
#[derive(Debug, Clone, PartialEq)]
pub enum FailReason {
    /// No usable price after retries
    PriceUnavailable,
    /// Every submission failed or went unacknowledged
    NotAcknowledged { attempts: u32, last_error: Option<String> },
    /// The exchange refused the order outright
    Rejected(String),
    /// Order accepted but the balance never moved within the budget
    ConfirmationTimeout,
    /// A balance or price read failed outside the retry loop
    Gateway(String),
}

/// Terminal result of a submission that produced no order
enum NotSubmitted {
    Skip(SkipReason),
    Fail(FailReason),
}

impl From<RetryError> for NotSubmitted {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Permanent(Error::InsufficientBalance {
                available,
                required,
            }) => NotSubmitted::Skip(SkipReason::InsufficientFunds {
                available,
                required,
            }),
            other => NotSubmitted::Fail(other.into()),
        }
    }
}

impl From<NotSubmitted> for BuyOutcome {
    fn from(e: NotSubmitted) -> Self {
        match e {
            NotSubmitted::Skip(reason) => BuyOutcome::Skipped(reason),
            NotSubmitted::Fail(reason) => BuyOutcome::Failed(reason),
        }
    }
}

impl From<NotSubmitted> for SellOutcome {
    fn from(e: NotSubmitted) -> Self {
        match e {
            NotSubmitted::Skip(reason) => SellOutcome::Skipped(reason),
            NotSubmitted::Fail(reason) => SellOutcome::Failed(reason),
        }
    }
}

impl From<RetryError> for FailReason {
    fn from(e: RetryError) -> Self {
        match e {
            RetryError::Exhausted {
                attempts,
                last_error,
            } => FailReason::NotAcknowledged {
                attempts,
                last_error,
            },
            RetryError::Permanent(e) => FailReason::Rejected(e.to_string()),
        }
    }
}

/// Confirmed buy
#[derive(Debug, Clone, PartialEq)]
pub struct BuyFill {
    pub order: OrderToken,
    /// Quote spent per base unit received
    pub avg_price: f64,
    pub filled_qty: f64,
    pub spent: f64,
}

/// Confirmed sell
#[derive(Debug, Clone, PartialEq)]
pub struct SellFill {
    pub order: OrderToken,
    /// Quote received per base unit sold; `None` when the quote balance
    /// did not move within the confirmation budget
    pub avg_price: Option<f64>,
    pub filled_qty: f64,
    pub received: f64,
    /// Base balance left after the fill
    pub remaining_qty: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuyOutcome {
    Filled(BuyFill),
    Skipped(SkipReason),
    Failed(FailReason),
}

impl BuyOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            BuyOutcome::Filled(_) => "OK",
            BuyOutcome::Skipped(_) => "SKIP",
            BuyOutcome::Failed(_) => "FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SellOutcome {
    Filled(SellFill),
    /// Whole balance liquidated because it was worth less than the dust threshold
    DustCleaned(SellFill),
    /// Nothing held on the exchange
    Empty,
    Skipped(SkipReason),
    Failed(FailReason),
}

impl SellOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            SellOutcome::Filled(_) => "OK",
            SellOutcome::DustCleaned(_) => "DUST_CLEAN",
            SellOutcome::Empty => "EMPTY",
            SellOutcome::Skipped(_) => "SKIP",
            SellOutcome::Failed(_) => "FAIL",
        }
    }

    /// Fill details for either fill variant
    pub fn fill(&self) -> Option<&SellFill> {
        match self {
            SellOutcome::Filled(f) | SellOutcome::DustCleaned(f) => Some(f),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn moved(self, baseline: f64, now: f64) -> bool {
        const EPS: f64 = 1e-9;
        match self {
            Direction::Up => now > baseline + EPS,
            Direction::Down => now < baseline - EPS,
        }
    }
}

/// Floor a quantity to `precision` decimal places
pub fn floor_to_precision(quantity: f64, precision: u32) -> f64 {
    if quantity <= 0.0 {
        return 0.0;
    }
    let factor = 10f64.powi(precision as i32);
    (quantity * factor).floor() / factor
}

/// Safe order executor over an exchange gateway
pub struct SafeOrderExecutor {
    gateway: Arc<dyn ExchangeGateway>,
    clock: Arc<dyn Clock>,
    config: ExecutionConfig,
    default_quote: String,
    order_retry: RetryPolicy,
    dust_retry: RetryPolicy,
    price_retry: RetryPolicy,
    locks: DashMap<String, Arc<Mutex<()>>>,
    last_order_at: DashMap<String, DateTime<Utc>>,
}

impl SafeOrderExecutor {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        clock: Arc<dyn Clock>,
        config: ExecutionConfig,
        default_quote: &str,
    ) -> Self {
        Self {
            order_retry: RetryPolicy::orders(&config),
            dust_retry: RetryPolicy::dust(&config),
            price_retry: RetryPolicy::prices(&config),
            gateway,
            clock,
            config,
            default_quote: default_quote.to_string(),
            locks: DashMap::new(),
            last_order_at: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<dyn ExchangeGateway> {
        &self.gateway
    }

    /// Spend up to `quote_budget` on a market buy
    pub async fn buy(&self, instrument: &str, quote_budget: f64) -> BuyOutcome {
        if quote_budget < self.config.min_order_notional {
            debug!(
                "Skip buy {}: budget {:.0} below minimum {:.0}",
                instrument, quote_budget, self.config.min_order_notional
            );
            return BuyOutcome::Skipped(SkipReason::BelowMinimumOrder {
                notional: quote_budget,
                minimum: self.config.min_order_notional,
            });
        }

        let lock = self.lock_for(instrument);
        let _guard = lock.lock().await;

        let outcome = match self.try_buy(instrument, quote_budget).await {
            Ok(outcome) => outcome,
            Err(e) => BuyOutcome::Failed(FailReason::Gateway(e.to_string())),
        };

        match &outcome {
            BuyOutcome::Filled(fill) => info!(
                "BUY {} filled: qty={:.6} avg={:.4} spent={:.0}",
                instrument, fill.filled_qty, fill.avg_price, fill.spent
            ),
            other => warn!("BUY {} {}: {:?}", instrument, other.status(), other),
        }
        outcome
    }

    /// Sell `fraction` of the held balance
    pub async fn sell(&self, instrument: &str, fraction: f64) -> SellOutcome {
        let lock = self.lock_for(instrument);
        let _guard = lock.lock().await;

        let outcome = match self.try_sell(instrument, fraction.clamp(0.0, 1.0)).await {
            Ok(outcome) => outcome,
            Err(e) => SellOutcome::Failed(FailReason::Gateway(e.to_string())),
        };

        match &outcome {
            SellOutcome::Filled(fill) | SellOutcome::DustCleaned(fill) => info!(
                "SELL {} {}: qty={:.6} received={:.0} remaining={:.6}",
                instrument,
                outcome.status(),
                fill.filled_qty,
                fill.received,
                fill.remaining_qty
            ),
            SellOutcome::Empty => debug!("SELL {} EMPTY: nothing held", instrument),
            other => warn!("SELL {} {}: {:?}", instrument, other.status(), other),
        }
        outcome
    }

    async fn try_buy(&self, instrument: &str, quote_budget: f64) -> Result<BuyOutcome> {
        if self.price_with_retry(instrument).await.is_none() {
            return Ok(BuyOutcome::Failed(FailReason::PriceUnavailable));
        }

        let quote = self.quote_of(instrument);
        let base = base_asset(instrument).to_string();
        let quote_before = self.read_balance(&quote).await?;
        let base_before = self.read_balance(&base).await?;
        let amount = quote_budget * self.config.fee_headroom;

        let label = format!("buy {}", instrument);
        let submitted = self
            .order_retry
            .run(self.clock.as_ref(), &label, move |_| async move {
                self.enforce_spacing(instrument).await;
                let result = self.gateway.place_market_buy(instrument, amount).await;
                self.last_order_at.insert(instrument.to_string(), self.clock.now());
                result
            })
            .await;

        let order = match submitted {
            Ok(token) => token,
            Err(e) => return Ok(NotSubmitted::from(e).into()),
        };
        debug!("Buy {} acknowledged: {}", instrument, order);

        let deadline = self.deadline();
        let base_after = match self
            .await_balance_move(&base, base_before, Direction::Up, deadline)
            .await
        {
            Some(b) => b,
            None => return Ok(BuyOutcome::Failed(FailReason::ConfirmationTimeout)),
        };

        let filled_qty = base_after - base_before;
        let spent = match self
            .await_balance_move(&quote, quote_before, Direction::Down, deadline)
            .await
        {
            Some(quote_after) => quote_before - quote_after,
            None => {
                warn!(
                    "Buy {}: quote balance unchanged after fill, assuming submitted amount {:.0}",
                    instrument, amount
                );
                amount
            }
        };

        Ok(BuyOutcome::Filled(BuyFill {
            order,
            avg_price: spent / filled_qty,
            filled_qty,
            spent,
        }))
    }

    async fn try_sell(&self, instrument: &str, fraction: f64) -> Result<SellOutcome> {
        let base = base_asset(instrument).to_string();
        let held = self.read_balance(&base).await?;
        if held <= 0.0 {
            return Ok(SellOutcome::Empty);
        }

        let price = match self.price_with_retry(instrument).await {
            Some(p) => p,
            None => return Ok(SellOutcome::Failed(FailReason::PriceUnavailable)),
        };

        let quantity = floor_to_precision(held * fraction, self.config.quantity_precision);
        let notional = quantity * price;

        if notional < self.config.min_order_notional {
            if held * price < self.config.dust_threshold {
                info!(
                    "Sell {}: whole balance worth {:.0} is dust, liquidating",
                    instrument,
                    held * price
                );
                return self.liquidate_dust(instrument, held).await;
            }
            return Ok(SellOutcome::Skipped(SkipReason::BelowMinimumOrder {
                notional,
                minimum: self.config.min_order_notional,
            }));
        }

        let quote = self.quote_of(instrument);
        let quote_before = self.read_balance(&quote).await?;

        let label = format!("sell {}", instrument);
        let submitted = self
            .order_retry
            .run(self.clock.as_ref(), &label, move |_| async move {
                self.enforce_spacing(instrument).await;
                let result = self.gateway.place_market_sell(instrument, quantity).await;
                self.last_order_at.insert(instrument.to_string(), self.clock.now());
                result
            })
            .await;

        let order = match submitted {
            Ok(token) => token,
            Err(e) => return Ok(NotSubmitted::from(e).into()),
        };

        match self.confirm_sell(order, instrument, held, quote_before).await {
            Some(fill) => Ok(SellOutcome::Filled(fill)),
            None => Ok(SellOutcome::Failed(FailReason::ConfirmationTimeout)),
        }
    }

    /// Sell the entire balance in one order
    async fn liquidate_dust(&self, instrument: &str, held: f64) -> Result<SellOutcome> {
        let quote = self.quote_of(instrument);
        let quote_before = self.read_balance(&quote).await?;

        let label = format!("dust {}", instrument);
        let submitted = self
            .dust_retry
            .run(self.clock.as_ref(), &label, move |_| async move {
                self.enforce_spacing(instrument).await;
                let result = self.gateway.place_market_sell(instrument, held).await;
                self.last_order_at.insert(instrument.to_string(), self.clock.now());
                result
            })
            .await;

        let order = match submitted {
            Ok(token) => token,
            Err(e) => return Ok(NotSubmitted::from(e).into()),
        };

        // Dust is reported as cleaned once acknowledged, whether or not the
        // balance change shows up inside the confirmation budget.
        let fill = match self
            .confirm_sell(order.clone(), instrument, held, quote_before)
            .await
        {
            Some(fill) => fill,
            None => SellFill {
                order,
                avg_price: None,
                filled_qty: 0.0,
                received: 0.0,
                remaining_qty: held,
            },
        };
        Ok(SellOutcome::DustCleaned(fill))
    }

    async fn confirm_sell(
        &self,
        order: OrderToken,
        instrument: &str,
        base_before: f64,
        quote_before: f64,
    ) -> Option<SellFill> {
        let base = base_asset(instrument);
        let quote = self.quote_of(instrument);
        let deadline = self.deadline();

        let base_after = self
            .await_balance_move(base, base_before, Direction::Down, deadline)
            .await?;
        let filled_qty = base_before - base_after;

        let (avg_price, received) = match self
            .await_balance_move(&quote, quote_before, Direction::Up, deadline)
            .await
        {
            Some(quote_after) => {
                let received = quote_after - quote_before;
                (Some(received / filled_qty), received)
            }
            None => {
                warn!("Sell {}: quote balance unchanged after fill", instrument);
                (None, 0.0)
            }
        };

        Some(SellFill {
            order,
            avg_price,
            filled_qty,
            received,
            remaining_qty: base_after.max(0.0),
        })
    }

    /// Price lookup with its own short retry
    pub async fn price_with_retry(&self, instrument: &str) -> Option<f64> {
        let label = format!("price {}", instrument);
        self.price_retry
            .run(self.clock.as_ref(), &label, move |_| async move {
                let price = self.gateway.current_price(instrument).await?;
                Ok(price.filter(|p| *p > 0.0 && p.is_finite()))
            })
            .await
            .ok()
    }

    async fn read_balance(&self, asset: &str) -> Result<f64> {
        self.gateway
            .balance(asset)
            .await?
            .ok_or_else(|| Error::Gateway(format!("balance of {} unavailable", asset)))
    }

    /// Poll `asset` until it moves past `baseline` or the deadline passes
    async fn await_balance_move(
        &self,
        asset: &str,
        baseline: f64,
        direction: Direction,
        deadline: DateTime<Utc>,
    ) -> Option<f64> {
        loop {
            match self.gateway.balance(asset).await {
                Ok(Some(now)) if direction.moved(baseline, now) => return Some(now),
                Ok(_) => {}
                Err(e) => debug!("Balance poll for {} failed: {}", asset, e),
            }

            if self.clock.now() >= deadline {
                return None;
            }
            self.clock.sleep(self.config.confirm_poll()).await;
        }
    }

    /// Wait until the minimum order spacing for `instrument` has elapsed
    async fn enforce_spacing(&self, instrument: &str) {
        let last = self.last_order_at.get(instrument).map(|t| *t);
        if let Some(last) = last {
            let since = (self.clock.now() - last).to_std().unwrap_or_default();
            let interval = self.config.order_interval();
            if since < interval {
                self.clock.sleep(interval - since).await;
            }
        }
    }

    fn deadline(&self) -> DateTime<Utc> {
        self.clock.now()
            + chrono::Duration::from_std(self.config.confirm_timeout())
                .unwrap_or(chrono::Duration::seconds(30))
    }

    fn lock_for(&self, instrument: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(instrument.to_string())
            .or_default()
            .clone()
    }

    fn quote_of(&self, instrument: &str) -> String {
        quote_asset(instrument)
            .unwrap_or(self.default_quote.as_str())
            .to_string()
    }
}
