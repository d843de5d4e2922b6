//! Entry admission controller
//!
//! Once per scan cycle: check the blackout window and free slots, pull
//! candidates, drop the ineligible ones, split free capital across the free
//! slots and submit buys for the best-ranked candidates.

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::scanner::{Candidate, CandidateSource};
use crate::clock::Clock;
use crate::config::{BlackoutConfig, CapitalConfig};
use crate::error::{Error, Result};
use crate::notify::{EventKind, NotificationSink, TradeEvent};
use crate::position::{CooldownTracker, PositionStore};
use crate::trading::{BuyOutcome, SafeOrderExecutor};

/// Capital split for one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub free_capital: f64,
    pub free_slots: usize,
    /// Slots that actually receive a budget this cycle
    pub funded_slots: usize,
    pub per_slot: f64,
}

/// Split `free_capital` across `free_slots`.
///
/// An even per-slot budget below the minimum order yields no allocation.
/// `carried` is the free capital set aside by an earlier shortfall cycle:
/// when present, capital is concentrated into as many slots as can each
/// meet the minimum, bounded by what is free now.
pub fn allocate(
    free_capital: f64,
    free_slots: usize,
    min_order: f64,
    carried: Option<f64>,
) -> Option<Allocation> {
    if free_slots == 0 || free_capital < min_order || min_order <= 0.0 {
        return None;
    }

    let even = free_capital / free_slots as f64;
    if even >= min_order {
        return Some(Allocation {
            free_capital,
            free_slots,
            funded_slots: free_slots,
            per_slot: even,
        });
    }

    let pool = carried?.min(free_capital);
    let funded_slots = ((pool / min_order).floor() as usize).min(free_slots);
    if funded_slots == 0 {
        return None;
    }
    Some(Allocation {
        free_capital,
        free_slots,
        funded_slots,
        per_slot: pool / funded_slots as f64,
    })
}

/// Best score first, ties broken by instrument id
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.instrument.cmp(&b.instrument))
    });
}

/// Whether `now` falls in the post-reset entry blackout
pub fn in_blackout(config: &BlackoutConfig, now: DateTime<Utc>) -> bool {
    if !config.enabled {
        return false;
    }
    let offset = match FixedOffset::east_opt(config.utc_offset_hours * 3600) {
        Some(o) => o,
        None => return false,
    };
    let local = now.with_timezone(&offset);
    local.hour() == config.hour && local.minute() < config.minutes
}

/// Scan interval that grows on failed scans
#[derive(Debug, Clone)]
pub struct ScanBackoff {
    base: Duration,
    step: Duration,
    max: Duration,
    current: Duration,
}

impl ScanBackoff {
    pub fn new(base: Duration, step: Duration, max: Duration) -> Self {
        Self {
            base,
            step,
            max: max.max(base),
            current: base,
        }
    }

    pub fn from_config(config: &CapitalConfig) -> Self {
        Self::new(
            Duration::from_secs(config.scan_interval_secs),
            Duration::from_secs(config.scan_backoff_step_secs),
            Duration::from_secs(config.max_scan_interval_secs),
        )
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_success(&mut self) {
        self.current = self.base;
    }

    pub fn on_failure(&mut self) {
        self.current = (self.current + self.step).min(self.max);
    }
}

/// What a cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Blackout,
    SlotsFull,
    NoCandidates,
    /// Per-slot budget below the minimum; `carried` when the budget is
    /// pooled into the next cycle
    Shortfall {
        free_capital: f64,
        free_slots: usize,
        carried: bool,
    },
    Submitted { attempted: Vec<String>, filled: Vec<String> },
}

/// Entry admission worker
pub struct AdmissionController {
    store: Arc<PositionStore>,
    cooldowns: Arc<CooldownTracker>,
    executor: Arc<SafeOrderExecutor>,
    source: Arc<dyn CandidateSource>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
    config: CapitalConfig,
    quote: String,
    /// Budget pooled forward by the last shortfall cycle
    carried: Mutex<Option<f64>>,
}

impl AdmissionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<PositionStore>,
        cooldowns: Arc<CooldownTracker>,
        executor: Arc<SafeOrderExecutor>,
        source: Arc<dyn CandidateSource>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
        config: CapitalConfig,
        quote: &str,
    ) -> Self {
        Self {
            store,
            cooldowns,
            executor,
            source,
            clock,
            sink,
            config,
            quote: quote.to_string(),
            carried: Mutex::new(None),
        }
    }

    /// Run cycles until shutdown, backing off after failed scans
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = ScanBackoff::from_config(&self.config);
        info!(
            "Admission controller started: {} slots, scan every {}s",
            self.config.max_open_positions,
            backoff.current().as_secs()
        );

        loop {
            match self.run_cycle().await {
                Ok(outcome) => {
                    debug!("Admission cycle: {:?}", outcome);
                    backoff.on_success();
                }
                Err(e) => {
                    backoff.on_failure();
                    warn!(
                        "Admission cycle failed: {} (next scan in {}s)",
                        e,
                        backoff.current().as_secs()
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff.current()) => {}
                _ = shutdown.recv() => {
                    info!("Admission controller stopped");
                    break;
                }
            }
        }
    }

    /// One admission cycle
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let now = self.clock.now();
        if in_blackout(&self.config.blackout, now) {
            debug!("Entry blackout window, skipping cycle");
            return Ok(CycleOutcome::Blackout);
        }

        let open_count = self.store.open_count().await;
        let free_slots = self.config.max_open_positions.saturating_sub(open_count);
        if free_slots == 0 {
            return Ok(CycleOutcome::SlotsFull);
        }

        let mut candidates = self.eligible(self.source.scan().await?, now).await;
        rank(&mut candidates);

        let free_capital = self.free_capital().await?;
        let min_order = self.executor.config().min_order_notional;
        info!(
            "Scan: {} candidates, {} free slots, free capital {:.0}",
            candidates.len(),
            free_slots,
            free_capital
        );
        if candidates.is_empty() {
            return Ok(CycleOutcome::NoCandidates);
        }

        let mut carried = self.carried.lock().await;
        let allocation = match allocate(free_capital, free_slots, min_order, *carried) {
            Some(a) => a,
            None => {
                let pooled = self.config.pool_shortfall;
                *carried = pooled.then_some(free_capital);
                info!(
                    "Skip entries: {:.0} over {} slots is below minimum order {:.0}{}",
                    free_capital,
                    free_slots,
                    min_order,
                    if pooled { " (pooled for next cycle)" } else { "" }
                );
                return Ok(CycleOutcome::Shortfall {
                    free_capital,
                    free_slots,
                    carried: pooled,
                });
            }
        };
        *carried = None;
        drop(carried);

        let mut attempted = Vec::new();
        let mut filled = Vec::new();
        for candidate in candidates.into_iter().take(allocation.funded_slots) {
            let instrument = candidate.instrument;
            attempted.push(instrument.clone());

            let fill = match self.executor.buy(&instrument, allocation.per_slot).await {
                BuyOutcome::Filled(fill) => fill,
                other => {
                    warn!("Entry {} not filled: {}", instrument, other.status());
                    continue;
                }
            };

            let position = self
                .store
                .record_buy(&instrument, fill.filled_qty, fill.spent, self.clock.now())
                .await?;
            self.sink.notify(TradeEvent::new(
                EventKind::Buy,
                &instrument,
                fill.filled_qty,
                fill.avg_price,
                0.0,
            ));
            if let Err(e) = self.store.save().await {
                warn!("Failed to save positions: {}", e);
            }
            info!(
                "Entered {}: qty={:.6} avg={:.4} spent={:.0}",
                instrument, position.quantity, position.average_price, fill.spent
            );
            filled.push(instrument);
        }

        Ok(CycleOutcome::Submitted { attempted, filled })
    }

    /// Drop excluded, cheap, held and cooling-down instruments
    async fn eligible(&self, candidates: Vec<Candidate>, now: DateTime<Utc>) -> Vec<Candidate> {
        let mut kept = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let instrument = candidate.instrument.as_str();
            if self.config.excluded_instruments.iter().any(|x| x == instrument)
                || candidate.reference_price < self.config.min_reference_price
                || !candidate.score.is_finite()
                || self.cooldowns.is_blocked(instrument, now)
            {
                continue;
            }
            match self.store.get(instrument).await {
                Some(p) if p.is_open() || p.is_cooling_down(now) => continue,
                _ => kept.push(candidate),
            }
        }
        kept
    }

    /// `cash × (1 − buffer) − value of open positions`, floored at zero
    async fn free_capital(&self) -> Result<f64> {
        let gateway = self.executor.gateway();
        let cash = gateway
            .balance(&self.quote)
            .await?
            .ok_or_else(|| Error::Gateway(format!("{} balance unavailable", self.quote)))?;

        let mut in_use = 0.0;
        for position in self.store.open_positions().await {
            let price = match gateway.current_price(&position.instrument).await {
                Ok(Some(p)) if p > 0.0 => p,
                _ => position.average_price,
            };
            in_use += position.quantity * price;
        }

        let target = cash * (1.0 - self.config.cash_buffer_pct / 100.0);
        Ok((target - in_use).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ExecutionConfig;
    use crate::exchange::PaperExchange;
    use crate::notify::ChannelSink;
    use crate::position::Position;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    struct Fixed(Vec<Candidate>);

    #[async_trait]
    impl CandidateSource for Fixed {
        async fn scan(&self) -> Result<Vec<Candidate>> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl CandidateSource for Broken {
        async fn scan(&self) -> Result<Vec<Candidate>> {
            Err(Error::Scan("ticker list unavailable".into()))
        }
    }

    /// 10:00 at UTC+9, outside the blackout
    fn morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 1, 0, 0).unwrap()
    }

    struct Harness {
        exchange: Arc<PaperExchange>,
        store: Arc<PositionStore>,
        cooldowns: Arc<CooldownTracker>,
        controller: AdmissionController,
        events: mpsc::Receiver<TradeEvent>,
    }

    fn harness(cash: f64, config: CapitalConfig, source: Arc<dyn CandidateSource>) -> Harness {
        let clock = Arc::new(ManualClock::new(morning()));
        let exchange = Arc::new(PaperExchange::new(clock.clone(), "KRW", cash, 0.0));
        for (instrument, price) in [
            ("KRW-XRP", 1000.0),
            ("KRW-SOL", 200_000.0),
            ("KRW-ADA", 500.0),
            ("KRW-BTC", 90_000_000.0),
        ] {
            exchange.set_price(instrument, price);
        }

        let store = Arc::new(PositionStore::new(None));
        let cooldowns = Arc::new(CooldownTracker::new());
        let executor = Arc::new(SafeOrderExecutor::new(
            exchange.clone(),
            clock.clone(),
            ExecutionConfig::default(),
            "KRW",
        ));
        let (sink, events) = ChannelSink::new(16);

        let controller = AdmissionController::new(
            store.clone(),
            cooldowns.clone(),
            executor,
            source,
            clock,
            Arc::new(sink),
            config,
            "KRW",
        );
        Harness {
            exchange,
            store,
            cooldowns,
            controller,
            events,
        }
    }

    fn candidates() -> Arc<dyn CandidateSource> {
        Arc::new(Fixed(vec![
            Candidate::new("KRW-ADA", 5.0, 500.0),
            Candidate::new("KRW-XRP", 9.0, 1000.0),
            Candidate::new("KRW-SOL", 9.0, 200_000.0),
            Candidate::new("KRW-BTC", 50.0, 90_000_000.0),
        ]))
    }

    #[test]
    fn test_allocate_even_split() {
        let a = allocate(100_000.0, 2, 5500.0, None).unwrap();
        assert_eq!(a.funded_slots, 2);
        assert_eq!(a.per_slot, 50_000.0);
    }

    #[test]
    fn test_allocate_shortfall_without_carry() {
        // 9000 over 2 slots is 4500 each, below 5500
        assert_eq!(allocate(9000.0, 2, 5500.0, None), None);
    }

    #[test]
    fn test_allocate_concentrates_carried_budget() {
        let a = allocate(9000.0, 2, 5500.0, Some(9000.0)).unwrap();
        assert_eq!(a.funded_slots, 1);
        assert_eq!(a.per_slot, 9000.0);

        let a = allocate(12_000.0, 3, 5500.0, Some(12_000.0)).unwrap();
        assert_eq!(a.funded_slots, 2);
        assert_eq!(a.per_slot, 6000.0);

        // Bounded by what is free now
        let a = allocate(7000.0, 2, 5500.0, Some(9000.0)).unwrap();
        assert_eq!(a.per_slot, 7000.0);

        assert_eq!(allocate(5000.0, 2, 5500.0, Some(9000.0)), None);
    }

    #[test]
    fn test_rank_breaks_ties_by_instrument() {
        let mut list = vec![
            Candidate::new("KRW-XRP", 9.0, 1.0),
            Candidate::new("KRW-ADA", 5.0, 1.0),
            Candidate::new("KRW-SOL", 9.0, 1.0),
        ];
        rank(&mut list);
        let order: Vec<&str> = list.iter().map(|c| c.instrument.as_str()).collect();
        assert_eq!(order, vec!["KRW-SOL", "KRW-XRP", "KRW-ADA"]);
    }

    #[test]
    fn test_blackout_after_daily_reset() {
        let config = BlackoutConfig::default();
        // 09:02 and 09:03 at UTC+9
        assert!(in_blackout(&config, Utc.with_ymd_and_hms(2024, 3, 4, 0, 2, 0).unwrap()));
        assert!(!in_blackout(&config, Utc.with_ymd_and_hms(2024, 3, 4, 0, 3, 0).unwrap()));
        assert!(!in_blackout(&config, morning()));

        let disabled = BlackoutConfig {
            enabled: false,
            ..BlackoutConfig::default()
        };
        assert!(!in_blackout(&disabled, Utc.with_ymd_and_hms(2024, 3, 4, 0, 1, 0).unwrap()));
    }

    #[test]
    fn test_scan_backoff_grows_and_resets() {
        let mut backoff = ScanBackoff::new(
            Duration::from_secs(45),
            Duration::from_secs(15),
            Duration::from_secs(90),
        );
        backoff.on_failure();
        assert_eq!(backoff.current(), Duration::from_secs(60));
        for _ in 0..5 {
            backoff.on_failure();
        }
        assert_eq!(backoff.current(), Duration::from_secs(90));
        backoff.on_success();
        assert_eq!(backoff.current(), Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_cycle_buys_top_ranked_candidates() {
        let mut h = harness(1_000_000.0, CapitalConfig::default(), candidates());

        let outcome = h.controller.run_cycle().await.unwrap();

        // BTC excluded; SOL and XRP tie on score, SOL sorts first
        assert_eq!(
            outcome,
            CycleOutcome::Submitted {
                attempted: vec!["KRW-SOL".into(), "KRW-XRP".into()],
                filled: vec!["KRW-SOL".into(), "KRW-XRP".into()],
            }
        );
        assert_eq!(h.store.open_count().await, 2);

        // 900_000 after the 10% buffer, split in two, less fee headroom
        let sol = h.store.get("KRW-SOL").await.unwrap();
        assert!((sol.cost() - 450_000.0 * 0.999).abs() < 1e-6);
        assert_eq!(sol.highest_price_seen, sol.average_price);
        assert_eq!(h.events.try_recv().unwrap().kind, EventKind::Buy);

        assert_eq!(
            h.controller.run_cycle().await.unwrap(),
            CycleOutcome::SlotsFull
        );
    }

    #[tokio::test]
    async fn test_cycle_skips_held_and_cooling_instruments() {
        let h = harness(1_000_000.0, CapitalConfig::default(), candidates());
        h.exchange.seed_holding("KRW-SOL", 1.0, 200_000.0);
        h.store
            .upsert(Position::open("KRW-SOL", 1.0, 200_000.0, morning()))
            .await;
        h.cooldowns
            .set("KRW-XRP", morning() + chrono::Duration::minutes(30));

        let outcome = h.controller.run_cycle().await.unwrap();

        // One slot left; cash 1_000_000 × 0.9 minus 200_000 in use
        assert_eq!(
            outcome,
            CycleOutcome::Submitted {
                attempted: vec!["KRW-ADA".into()],
                filled: vec!["KRW-ADA".into()],
            }
        );
        let ada = h.store.get("KRW-ADA").await.unwrap();
        assert!((ada.cost() - 700_000.0 * 0.999).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_shortfall_discarded_without_pooling() {
        let h = harness(10_000.0, CapitalConfig::default(), candidates());

        for _ in 0..2 {
            assert_eq!(
                h.controller.run_cycle().await.unwrap(),
                CycleOutcome::Shortfall {
                    free_capital: 9000.0,
                    free_slots: 2,
                    carried: false,
                }
            );
        }
        assert_eq!(h.exchange.stats().buy_calls, 0);
        assert_eq!(h.store.open_count().await, 0);
    }

    #[tokio::test]
    async fn test_shortfall_pooled_into_next_cycle() {
        let config = CapitalConfig {
            pool_shortfall: true,
            ..CapitalConfig::default()
        };
        let h = harness(10_000.0, config, candidates());

        // No entry in the shortfall cycle itself
        assert_eq!(
            h.controller.run_cycle().await.unwrap(),
            CycleOutcome::Shortfall {
                free_capital: 9000.0,
                free_slots: 2,
                carried: true,
            }
        );
        assert_eq!(h.exchange.stats().buy_calls, 0);

        // The carried budget funds one slot on the next cycle
        assert_eq!(
            h.controller.run_cycle().await.unwrap(),
            CycleOutcome::Submitted {
                attempted: vec!["KRW-SOL".into()],
                filled: vec!["KRW-SOL".into()],
            }
        );
        let sol = h.store.get("KRW-SOL").await.unwrap();
        assert!((sol.cost() - 9000.0 * 0.999).abs() < 1e-6);
        assert_eq!(h.exchange.stats().buy_calls, 1);
    }

    #[tokio::test]
    async fn test_failed_scan_surfaces_error() {
        let h = harness(1_000_000.0, CapitalConfig::default(), Arc::new(Broken));
        assert!(matches!(
            h.controller.run_cycle().await,
            Err(Error::Scan(_))
        ));
    }

    #[tokio::test]
    async fn test_unfilled_buy_creates_no_position() {
        let h = harness(1_000_000.0, CapitalConfig::default(), candidates());
        h.exchange.stall_fills(true);

        let outcome = h.controller.run_cycle().await.unwrap();

        match outcome {
            CycleOutcome::Submitted { attempted, filled } => {
                assert_eq!(attempted.len(), 2);
                assert!(filled.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.store.open_count().await, 0);
    }
}
