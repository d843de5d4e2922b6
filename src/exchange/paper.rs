//! In-memory paper exchange
//!
//! Simulates market orders against a price table. Fills settle after a
//! configurable delay measured on the injected [`Clock`], so balance-delta
//! confirmation behaves like it does against a real, eventually-consistent
//! account. Failure injection hooks make the executor's retry paths testable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::prelude::*;
use rand::rngs::StdRng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{base_asset, ExchangeGateway, OrderToken};
use crate::clock::Clock;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone)]
struct PendingFill {
    settle_at: DateTime<Utc>,
    instrument: String,
    side: Side,
    /// Quote amount for buys, base amount for sells
    amount: f64,
}

/// Call counters for assertions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaperStats {
    pub price_calls: u64,
    pub balance_calls: u64,
    pub buy_calls: u64,
    pub sell_calls: u64,
}

#[derive(Debug, Default)]
struct PaperState {
    prices: HashMap<String, f64>,
    balances: HashMap<String, f64>,
    avg_prices: HashMap<String, f64>,
    pending: Vec<PendingFill>,
    fill_delay: Duration,
    fail_next: u32,
    drop_acks: u32,
    hidden_prices: HashSet<String>,
    stall_fills: bool,
    stats: PaperStats,
}

/// Paper trading gateway
pub struct PaperExchange {
    clock: Arc<dyn Clock>,
    quote: String,
    fee_rate: f64,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    /// Create a paper exchange holding `cash` of the quote currency
    pub fn new(clock: Arc<dyn Clock>, quote: &str, cash: f64, fee_rate: f64) -> Self {
        let mut state = PaperState::default();
        state.balances.insert(quote.to_string(), cash);

        Self {
            clock,
            quote: quote.to_string(),
            fee_rate,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_price(&self, instrument: &str, price: f64) {
        self.lock().prices.insert(instrument.to_string(), price);
    }

    pub fn price(&self, instrument: &str) -> Option<f64> {
        self.lock().prices.get(instrument).copied()
    }

    pub fn set_balance(&self, asset: &str, amount: f64) {
        self.lock().balances.insert(asset.to_string(), amount);
    }

    /// Seed an existing holding with an exchange-side average price
    pub fn seed_holding(&self, instrument: &str, quantity: f64, avg_price: f64) {
        let mut state = self.lock();
        state
            .balances
            .insert(base_asset(instrument).to_string(), quantity);
        state.avg_prices.insert(instrument.to_string(), avg_price);
    }

    /// Balance without settling or counting the call
    pub fn peek_balance(&self, asset: &str) -> f64 {
        self.lock().balances.get(asset).copied().unwrap_or(0.0)
    }

    /// Delay between order acceptance and the balance change
    pub fn set_fill_delay(&self, delay: Duration) {
        self.lock().fill_delay = delay;
    }

    /// Accepted orders never settle while enabled
    pub fn stall_fills(&self, stall: bool) {
        self.lock().stall_fills = stall;
    }

    /// Next `n` order submissions fail with a transient gateway error
    pub fn fail_next_orders(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Next `n` order submissions return no acknowledgement
    pub fn drop_next_acks(&self, n: u32) {
        self.lock().drop_acks = n;
    }

    /// Make `current_price` return `None` for an instrument
    pub fn hide_price(&self, instrument: &str, hidden: bool) {
        let mut state = self.lock();
        if hidden {
            state.hidden_prices.insert(instrument.to_string());
        } else {
            state.hidden_prices.remove(instrument);
        }
    }

    pub fn stats(&self) -> PaperStats {
        self.lock().stats.clone()
    }

    /// Apply one random-walk step to every listed price
    pub fn step_prices(&self, rng: &mut StdRng, volatility_pct: f64) {
        let mut state = self.lock();
        for price in state.prices.values_mut() {
            let shock: f64 = rng.gen_range(-1.0..=1.0) * volatility_pct / 100.0;
            *price = (*price * (1.0 + shock)).max(f64::EPSILON);
        }
    }

    /// Drive prices with a seeded random walk until shutdown
    pub async fn run_random_walk(
        self: Arc<Self>,
        interval: Duration,
        volatility_pct: f64,
        seed: Option<u64>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        info!(
            "Paper price walk started ({}ms, ±{}%)",
            interval.as_millis(),
            volatility_pct
        );

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.step_prices(&mut rng, volatility_pct),
                _ = shutdown.recv() => {
                    info!("Paper price walk stopped");
                    break;
                }
            }
        }
    }

    fn settle(&self, state: &mut PaperState) {
        if state.stall_fills {
            return;
        }
        let now = self.clock.now();
        let (due, waiting): (Vec<PendingFill>, Vec<PendingFill>) = state
            .pending
            .drain(..)
            .partition(|f| f.settle_at <= now);
        state.pending = waiting;

        for fill in due {
            let price = match state.prices.get(&fill.instrument) {
                Some(p) => *p,
                None => continue,
            };
            let base = base_asset(&fill.instrument).to_string();
            match fill.side {
                Side::Buy => {
                    let qty = fill.amount * (1.0 - self.fee_rate) / price;
                    let held = state.balances.get(&base).copied().unwrap_or(0.0);
                    let prev_avg = state.avg_prices.get(&fill.instrument).copied().unwrap_or(0.0);
                    let new_avg = (held * prev_avg + fill.amount) / (held + qty);
                    *state.balances.entry(self.quote.clone()).or_insert(0.0) -= fill.amount;
                    state.balances.insert(base, held + qty);
                    state.avg_prices.insert(fill.instrument.clone(), new_avg);
                    debug!("Paper buy settled: {} {:.6} @ {}", fill.instrument, qty, price);
                }
                Side::Sell => {
                    let held = state.balances.get(&base).copied().unwrap_or(0.0);
                    let qty = fill.amount.min(held);
                    let proceeds = qty * price * (1.0 - self.fee_rate);
                    state.balances.insert(base, held - qty);
                    *state.balances.entry(self.quote.clone()).or_insert(0.0) += proceeds;
                    debug!("Paper sell settled: {} {:.6} @ {}", fill.instrument, qty, price);
                }
            }
        }
    }

    fn submit(&self, instrument: &str, side: Side, amount: f64) -> Result<Option<OrderToken>> {
        let mut state = self.lock();
        match side {
            Side::Buy => state.stats.buy_calls += 1,
            Side::Sell => state.stats.sell_calls += 1,
        }
        self.settle(&mut state);

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(Error::Gateway("simulated 502 from paper exchange".into()));
        }
        if state.drop_acks > 0 {
            state.drop_acks -= 1;
            return Ok(None);
        }
        if !state.prices.contains_key(instrument) {
            return Err(Error::UnknownInstrument(instrument.to_string()));
        }
        if amount <= 0.0 {
            return Err(Error::OrderRejected(format!("non-positive amount {}", amount)));
        }

        // Unsettled orders keep their funds reserved
        let asset = match side {
            Side::Buy => self.quote.clone(),
            Side::Sell => base_asset(instrument).to_string(),
        };
        let committed: f64 = state
            .pending
            .iter()
            .filter(|f| f.side == side && (side == Side::Buy || f.instrument == instrument))
            .map(|f| f.amount)
            .sum();
        let available = state.balances.get(&asset).copied().unwrap_or(0.0) - committed;
        if amount > available + 1e-9 {
            return Err(Error::InsufficientBalance {
                available,
                required: amount,
            });
        }

        let settle_at = self.clock.now()
            + chrono::Duration::from_std(state.fill_delay).unwrap_or(chrono::Duration::zero());
        state.pending.push(PendingFill {
            settle_at,
            instrument: instrument.to_string(),
            side,
            amount,
        });

        Ok(Some(OrderToken(uuid::Uuid::new_v4().to_string())))
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn current_price(&self, instrument: &str) -> Result<Option<f64>> {
        let mut state = self.lock();
        state.stats.price_calls += 1;
        if state.hidden_prices.contains(instrument) {
            return Ok(None);
        }
        Ok(state.prices.get(instrument).copied())
    }

    async fn balance(&self, asset: &str) -> Result<Option<f64>> {
        let mut state = self.lock();
        state.stats.balance_calls += 1;
        self.settle(&mut state);
        Ok(Some(state.balances.get(asset).copied().unwrap_or(0.0)))
    }

    async fn place_market_buy(
        &self,
        instrument: &str,
        quote_amount: f64,
    ) -> Result<Option<OrderToken>> {
        self.submit(instrument, Side::Buy, quote_amount)
    }

    async fn place_market_sell(
        &self,
        instrument: &str,
        base_amount: f64,
    ) -> Result<Option<OrderToken>> {
        self.submit(instrument, Side::Sell, base_amount)
    }

    async fn average_buy_price(&self, instrument: &str) -> Result<Option<f64>> {
        Ok(self.lock().avg_prices.get(instrument).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn paper() -> (Arc<ManualClock>, PaperExchange) {
        let clock = Arc::new(ManualClock::default());
        let ex = PaperExchange::new(clock.clone(), "KRW", 100_000.0, 0.0);
        ex.set_price("KRW-XRP", 1000.0);
        (clock, ex)
    }

    #[tokio::test]
    async fn test_buy_settles_immediately_without_delay() {
        let (_clock, ex) = paper();

        let token = ex.place_market_buy("KRW-XRP", 10_000.0).await.unwrap();
        assert!(token.is_some());

        assert_eq!(ex.balance("XRP").await.unwrap(), Some(10.0));
        assert_eq!(ex.balance("KRW").await.unwrap(), Some(90_000.0));
        assert_eq!(ex.average_buy_price("KRW-XRP").await.unwrap(), Some(1000.0));
    }

    #[tokio::test]
    async fn test_fill_delay_uses_clock() {
        let (clock, ex) = paper();
        ex.set_fill_delay(Duration::from_secs(5));

        ex.place_market_buy("KRW-XRP", 10_000.0).await.unwrap();
        assert_eq!(ex.balance("XRP").await.unwrap(), Some(0.0));

        clock.advance(Duration::from_secs(5));
        assert_eq!(ex.balance("XRP").await.unwrap(), Some(10.0));
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let (_clock, ex) = paper();
        let err = ex.place_market_sell("KRW-XRP", 1.0).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert!(err.is_order_permanent());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let (_clock, ex) = paper();
        ex.fail_next_orders(1);
        ex.drop_next_acks(1);

        assert!(ex.place_market_buy("KRW-XRP", 10_000.0).await.is_err());
        assert_eq!(ex.place_market_buy("KRW-XRP", 10_000.0).await.unwrap(), None);
        assert!(ex.place_market_buy("KRW-XRP", 10_000.0).await.unwrap().is_some());
        assert_eq!(ex.stats().buy_calls, 3);
    }

    #[test]
    fn test_random_walk_is_seeded() {
        let (_c1, a) = paper();
        let (_c2, b) = paper();
        let mut r1 = StdRng::seed_from_u64(7);
        let mut r2 = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            a.step_prices(&mut r1, 1.0);
            b.step_prices(&mut r2, 1.0);
        }
        assert_eq!(a.price("KRW-XRP"), b.price("KRW-XRP"));
        assert_ne!(a.price("KRW-XRP"), Some(1000.0));
    }
}
