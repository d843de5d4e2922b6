//! Candidate scanning
//!
//! Entry heuristics plug in behind [`ScoreCandidate`]; the admission
//! controller only ever sees ranked [`Candidate`]s from a
//! [`CandidateSource`] and never special-cases a heuristic.

use async_trait::async_trait;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::exchange::ExchangeGateway;

/// One entry candidate from a scan cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub instrument: String,
    pub score: f64,
    pub reference_price: f64,
}

impl Candidate {
    pub fn new(instrument: &str, score: f64, reference_price: f64) -> Self {
        Self {
            instrument: instrument.to_string(),
            score,
            reference_price,
        }
    }
}

/// Scorer verdict for one instrument
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub admit: bool,
    pub score: f64,
}

impl Verdict {
    pub fn admit(score: f64) -> Self {
        Self { admit: true, score }
    }

    pub fn reject() -> Self {
        Self {
            admit: false,
            score: 0.0,
        }
    }
}

/// Entry heuristic
#[async_trait]
pub trait ScoreCandidate: Send + Sync {
    /// Heuristic name for logs
    fn name(&self) -> &str;

    async fn score(&self, instrument: &str, price: f64) -> Result<Verdict>;
}

/// Produces the candidates of one scan cycle
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn scan(&self) -> Result<Vec<Candidate>>;
}

/// Scores a fixed instrument universe at gateway prices
pub struct UniverseScanner {
    gateway: Arc<dyn ExchangeGateway>,
    universe: Vec<String>,
    scorer: Arc<dyn ScoreCandidate>,
}

impl UniverseScanner {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        universe: Vec<String>,
        scorer: Arc<dyn ScoreCandidate>,
    ) -> Self {
        Self {
            gateway,
            universe,
            scorer,
        }
    }
}

#[async_trait]
impl CandidateSource for UniverseScanner {
    async fn scan(&self) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        let mut failures = 0usize;

        for instrument in &self.universe {
            let price = match self.gateway.current_price(instrument).await {
                Ok(Some(p)) if p > 0.0 => p,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Scan: price for {} failed: {}", instrument, e);
                    failures += 1;
                    continue;
                }
            };

            match self.scorer.score(instrument, price).await {
                Ok(verdict) if verdict.admit => {
                    candidates.push(Candidate::new(instrument, verdict.score, price));
                }
                Ok(_) => {}
                Err(e) => warn!("Scorer {} failed on {}: {}", self.scorer.name(), instrument, e),
            }
        }

        if !self.universe.is_empty() && failures == self.universe.len() {
            return Err(Error::Scan(format!(
                "all {} price lookups failed",
                failures
            )));
        }

        debug!(
            "Scan via {}: {} of {} instruments admitted",
            self.scorer.name(),
            candidates.len(),
            self.universe.len()
        );
        Ok(candidates)
    }
}

/// Admits a random subset with random scores; paper mode only
pub struct RandomScorer {
    rng: Mutex<StdRng>,
    admit_probability: f64,
}

impl RandomScorer {
    pub fn new(admit_probability: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            admit_probability: admit_probability.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl ScoreCandidate for RandomScorer {
    fn name(&self) -> &str {
        "random"
    }

    async fn score(&self, _instrument: &str, _price: f64) -> Result<Verdict> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        if rng.gen_bool(self.admit_probability) {
            Ok(Verdict::admit(rng.gen_range(0.0..100.0)))
        } else {
            Ok(Verdict::reject())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exchange::PaperExchange;

    /// Admits instruments whose price is above a floor, scored by price
    struct PriceFloor(f64);

    #[async_trait]
    impl ScoreCandidate for PriceFloor {
        fn name(&self) -> &str {
            "price-floor"
        }

        async fn score(&self, _instrument: &str, price: f64) -> Result<Verdict> {
            if price >= self.0 {
                Ok(Verdict::admit(price))
            } else {
                Ok(Verdict::reject())
            }
        }
    }

    fn exchange() -> Arc<PaperExchange> {
        let ex = PaperExchange::new(Arc::new(ManualClock::default()), "KRW", 0.0, 0.0);
        ex.set_price("KRW-XRP", 700.0);
        ex.set_price("KRW-SOL", 200_000.0);
        ex.set_price("KRW-DOGE", 150.0);
        Arc::new(ex)
    }

    #[tokio::test]
    async fn test_scanner_applies_scorer() {
        let ex = exchange();
        ex.hide_price("KRW-DOGE", true);
        let universe = vec!["KRW-XRP".into(), "KRW-SOL".into(), "KRW-DOGE".into()];
        let scanner = UniverseScanner::new(ex, universe, Arc::new(PriceFloor(500.0)));

        let candidates = scanner.scan().await.unwrap();

        assert_eq!(
            candidates,
            vec![
                Candidate::new("KRW-XRP", 700.0, 700.0),
                Candidate::new("KRW-SOL", 200_000.0, 200_000.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_random_scorer_is_seeded() {
        let a = RandomScorer::new(0.5, Some(42));
        let b = RandomScorer::new(0.5, Some(42));
        for _ in 0..20 {
            assert_eq!(
                a.score("KRW-XRP", 1.0).await.unwrap(),
                b.score("KRW-XRP", 1.0).await.unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_random_scorer_extremes() {
        let never = RandomScorer::new(0.0, Some(1));
        let always = RandomScorer::new(1.0, Some(1));
        assert!(!never.score("KRW-XRP", 1.0).await.unwrap().admit);
        assert!(always.score("KRW-XRP", 1.0).await.unwrap().admit);
    }
}
