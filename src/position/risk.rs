//! Position risk engine
//!
//! Every tick each open position is priced and run through [`evaluate`],
//! a pure function of the record, the price and the thresholds. The engine
//! then executes the resulting decision through the order executor and
//! applies the outcome to the store and the cooldown table.
//!
//! Rule order per position:
//! 1. hard stop (bypasses everything else)
//! 2. highest price and trailing latch update
//! 3. effective stop line, `max(base stop, trailing line)` once armed
//! 4. stop exit while below the take-profit level
//! 5. single partial take-profit
//! 6. trailing exit of the remainder

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::cooldown::{cooldown_for, CooldownTracker};
use super::store::{Position, PositionStore};
use crate::clock::Clock;
use crate::config::RiskConfig;
use crate::notify::{EventKind, NotificationSink, TradeEvent};
use crate::trading::{SafeOrderExecutor, SellFill, SellOutcome};

/// Thresholds in percent
#[derive(Debug, Clone, PartialEq)]
pub struct RiskParams {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub trailing_activation_pct: f64,
    pub trailing_pct: f64,
    pub partial_take_ratio: f64,
    pub hard_stop_pct: f64,
}

impl From<&RiskConfig> for RiskParams {
    fn from(config: &RiskConfig) -> Self {
        Self {
            stop_loss_pct: config.stop_loss_pct,
            take_profit_pct: config.take_profit_pct,
            trailing_activation_pct: config.trailing_activation_pct,
            trailing_pct: config.trailing_pct,
            partial_take_ratio: config.partial_take_ratio,
            hard_stop_pct: config.hard_stop_pct,
        }
    }
}

/// How a position left the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    HardStop,
    Stop,
    TrailExit,
}

impl ExitKind {
    fn event(self) -> EventKind {
        match self {
            ExitKind::HardStop => EventKind::HardStop,
            ExitKind::Stop => EventKind::Stop,
            ExitKind::TrailExit => EventKind::TrailExit,
        }
    }
}

/// What to do with a position this tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Hold,
    /// Sell everything
    Exit(ExitKind),
    /// Sell this fraction once
    PartialTake(f64),
}

/// Result of evaluating one position at one price
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    pub unrealized_pct: f64,
    pub highest_price_seen: f64,
    pub trailing_active: bool,
    /// Trailing latched during this evaluation
    pub armed_now: bool,
    pub effective_stop: f64,
    /// Price is at or below the trailing line of an armed position
    pub trail_breached: bool,
}

/// Pure rule evaluation for one position
pub fn evaluate(position: &Position, price: f64, params: &RiskParams) -> Evaluation {
    let avg = position.average_price;
    let unrealized = position.unrealized_pct(price);
    let highest = position.highest_price_seen.max(price).max(avg);

    let armed_now = !position.trailing_active && unrealized >= params.trailing_activation_pct;
    let trailing = position.trailing_active || armed_now;

    let base_stop = avg * (1.0 - params.stop_loss_pct / 100.0);
    let trail_line = highest * (1.0 - params.trailing_pct / 100.0);
    let effective_stop = if trailing {
        base_stop.max(trail_line)
    } else {
        base_stop
    };
    let trail_breached = trailing && price <= trail_line;

    let decision = if unrealized <= -params.hard_stop_pct {
        Decision::Exit(ExitKind::HardStop)
    } else if price <= effective_stop && unrealized < params.take_profit_pct {
        if unrealized < 0.0 {
            Decision::Exit(ExitKind::Stop)
        } else {
            Decision::Exit(ExitKind::TrailExit)
        }
    } else if !position.partial_take_done && unrealized >= params.take_profit_pct {
        Decision::PartialTake(params.partial_take_ratio)
    } else if trail_breached {
        Decision::Exit(ExitKind::TrailExit)
    } else {
        Decision::Hold
    };

    Evaluation {
        decision,
        unrealized_pct: unrealized,
        highest_price_seen: highest,
        trailing_active: trailing,
        armed_now,
        effective_stop,
        trail_breached,
    }
}

/// Per-tick summary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub evaluated: usize,
    pub exits: Vec<(String, ExitKind)>,
    pub partial_takes: Vec<String>,
    pub failures: Vec<String>,
}

/// Risk engine worker
pub struct RiskEngine {
    store: Arc<PositionStore>,
    cooldowns: Arc<CooldownTracker>,
    executor: Arc<SafeOrderExecutor>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
    params: RiskParams,
    fee_rate: f64,
    cooldown_short: Duration,
    cooldown_long: Duration,
    tick_interval: Duration,
}

impl RiskEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<PositionStore>,
        cooldowns: Arc<CooldownTracker>,
        executor: Arc<SafeOrderExecutor>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
        config: &RiskConfig,
        fee_rate: f64,
    ) -> Self {
        Self {
            store,
            cooldowns,
            executor,
            clock,
            sink,
            params: RiskParams::from(config),
            fee_rate,
            cooldown_short: Duration::from_secs(config.cooldown_short_mins * 60),
            cooldown_long: Duration::from_secs(config.cooldown_long_mins * 60),
            tick_interval: Duration::from_millis(config.tick_ms),
        }
    }

    /// Tick until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Risk engine started: SL={}% TP={}% trail={}% (arm at {}%) hard={}%",
            self.params.stop_loss_pct,
            self.params.take_profit_pct,
            self.params.trailing_pct,
            self.params.trailing_activation_pct,
            self.params.hard_stop_pct
        );

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if !report.exits.is_empty() || !report.partial_takes.is_empty() {
                        debug!("Risk tick: {:?}", report);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Risk engine stopped");
                    break;
                }
            }
        }
    }

    /// Evaluate every open position once
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        self.cooldowns.prune(self.clock.now());

        for position in self.store.open_positions().await {
            let instrument = position.instrument.clone();
            let price = match self.executor.gateway().current_price(&instrument).await {
                Ok(Some(p)) if p > 0.0 => p,
                Ok(_) => {
                    debug!("No price for {}, skipping this tick", instrument);
                    continue;
                }
                Err(e) => {
                    debug!("Price lookup for {} failed: {}", instrument, e);
                    continue;
                }
            };
            report.evaluated += 1;

            let eval = evaluate(&position, price, &self.params);
            self.track(&position, &eval).await;

            match eval.decision {
                Decision::Hold => {}
                Decision::Exit(kind) => {
                    if self.exit(&position, price, kind).await {
                        report.exits.push((instrument, kind));
                    } else {
                        report.failures.push(instrument);
                    }
                }
                Decision::PartialTake(ratio) => {
                    match self.partial_take(&position, price, ratio, &eval).await {
                        PartialResult::Taken => report.partial_takes.push(instrument),
                        PartialResult::Closed => {
                            report.exits.push((instrument, ExitKind::TrailExit))
                        }
                        PartialResult::NotTaken if eval.trail_breached => {
                            if self.exit(&position, price, ExitKind::TrailExit).await {
                                report.exits.push((instrument, ExitKind::TrailExit));
                            } else {
                                report.failures.push(instrument);
                            }
                        }
                        PartialResult::NotTaken => report.failures.push(instrument),
                    }
                }
            }
        }

        report
    }

    /// Persist the running high and the trailing latch
    async fn track(&self, position: &Position, eval: &Evaluation) {
        let changed = eval.highest_price_seen > position.highest_price_seen
            || eval.trailing_active != position.trailing_active;
        if !changed {
            return;
        }

        let (highest, trailing) = (eval.highest_price_seen, eval.trailing_active);
        self.store
            .update(&position.instrument, |p| {
                p.highest_price_seen = p.highest_price_seen.max(highest);
                p.trailing_active |= trailing;
            })
            .await;
        self.persist().await;

        if eval.armed_now {
            info!(
                "{} trailing armed at {:+.2}% (high {:.4})",
                position.instrument, eval.unrealized_pct, highest
            );
            self.sink.notify(TradeEvent::new(
                EventKind::TrailingArmed,
                &position.instrument,
                position.quantity,
                highest,
                eval.unrealized_pct,
            ));
        }
    }

    /// Full exit; returns whether the position is gone afterwards
    async fn exit(&self, position: &Position, price: f64, kind: ExitKind) -> bool {
        let instrument = &position.instrument;
        info!(
            "{} {:?} at {:.4} ({:+.2}%)",
            instrument,
            kind,
            price,
            position.unrealized_pct(price)
        );

        match self.executor.sell(instrument, 1.0).await {
            SellOutcome::Filled(fill) | SellOutcome::DustCleaned(fill) => {
                self.announce_exit(position, kind.event(), &fill, price);
                self.close(instrument).await;
                true
            }
            SellOutcome::Empty => {
                warn!("{} has no balance on the exchange, closing record", instrument);
                self.close(instrument).await;
                true
            }
            SellOutcome::Skipped(reason) => {
                warn!("{} exit skipped: {:?}", instrument, reason);
                false
            }
            SellOutcome::Failed(reason) => {
                error!("{} exit failed: {:?}", instrument, reason);
                false
            }
        }
    }

    async fn partial_take(
        &self,
        position: &Position,
        price: f64,
        ratio: f64,
        eval: &Evaluation,
    ) -> PartialResult {
        let instrument = &position.instrument;
        info!(
            "{} partial take {:.0}% at {:.4} ({:+.2}%)",
            instrument,
            ratio * 100.0,
            price,
            eval.unrealized_pct
        );

        match self.executor.sell(instrument, ratio).await {
            SellOutcome::Filled(fill) if fill.remaining_qty > 0.0 => {
                self.store
                    .update(instrument, |p| {
                        p.quantity = fill.remaining_qty;
                        p.partial_take_done = true;
                        p.trailing_active = true;
                        p.highest_price_seen = p.highest_price_seen.max(price);
                    })
                    .await;
                self.announce_exit(position, EventKind::PartialTake, &fill, price);
                self.persist().await;
                PartialResult::Taken
            }
            SellOutcome::Filled(fill) | SellOutcome::DustCleaned(fill) => {
                // Whole balance went out with the partial order
                self.store
                    .update(instrument, |p| p.partial_take_done = true)
                    .await;
                self.announce_exit(position, EventKind::TrailExit, &fill, price);
                self.close(instrument).await;
                PartialResult::Closed
            }
            SellOutcome::Empty => {
                warn!("{} has no balance on the exchange, closing record", instrument);
                self.close(instrument).await;
                PartialResult::Closed
            }
            SellOutcome::Skipped(reason) => {
                warn!("{} partial take skipped: {:?}", instrument, reason);
                PartialResult::NotTaken
            }
            SellOutcome::Failed(reason) => {
                error!("{} partial take failed: {:?}", instrument, reason);
                PartialResult::NotTaken
            }
        }
    }

    /// Close the record and start its cooldown
    async fn close(&self, instrument: &str) {
        let partial_done = self
            .store
            .get(instrument)
            .await
            .map_or(false, |p| p.partial_take_done);
        let length = cooldown_for(partial_done, self.cooldown_short, self.cooldown_long);
        let until = self.clock.now()
            + chrono::Duration::from_std(length).unwrap_or(chrono::Duration::zero());

        if self.store.close_if_open(instrument, until).await.is_some() {
            self.cooldowns.set(instrument, until);
            self.sink.notify(TradeEvent::cooldown(instrument, until));
        }
        self.persist().await;
    }

    fn announce_exit(&self, position: &Position, kind: EventKind, fill: &SellFill, price: f64) {
        if fill.filled_qty <= 0.0 {
            warn!(
                "{} {} acknowledged as {} but no balance change was observed",
                position.instrument, kind, fill.order
            );
            return;
        }
        let sell_price = fill.avg_price.unwrap_or(price);
        let (pct, pnl) = realized(position.average_price, sell_price, fill.filled_qty, self.fee_rate);
        info!(
            "{} {}: qty={:.6} @ {:.4} pnl={:+.0} ({:+.2}%)",
            position.instrument, kind, fill.filled_qty, sell_price, pnl, pct
        );
        self.sink.notify(
            TradeEvent::new(kind, &position.instrument, fill.filled_qty, sell_price, pct)
                .with_pnl(pnl),
        );
    }

    async fn persist(&self) {
        if let Err(e) = self.store.save().await {
            warn!("Failed to save positions: {}", e);
        }
    }
}

enum PartialResult {
    Taken,
    Closed,
    NotTaken,
}

/// Realized percent and P&L of selling `qty` bought at `avg`, net of fees on
/// both legs
pub fn realized(avg: f64, sell_price: f64, qty: f64, fee_rate: f64) -> (f64, f64) {
    if avg <= 0.0 {
        return (0.0, 0.0);
    }
    let gross = (sell_price - avg) * qty;
    let fees = (sell_price + avg) * qty * fee_rate;
    ((sell_price - avg) / avg * 100.0, gross - fees)
}
