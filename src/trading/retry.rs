//! Bounded retry with exponential backoff
//!
//! The delay sequence comes from `backoff`'s exponential schedule with jitter
//! disabled; waiting goes through the injected [`Clock`] so a fake clock can
//! drive the whole sequence instantly.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::clock::Clock;
use crate::config::ExecutionConfig;
use crate::error::{Error, Result};

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError {
    /// Every attempt failed or came back without an acknowledgement
    Exhausted {
        attempts: u32,
        last_error: Option<String>,
    },
    /// The exchange refused the request in a way retrying cannot fix
    Permanent(Error),
}

impl std::fmt::Display for RetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Exhausted {
                attempts,
                last_error: Some(e),
            } => write!(f, "gave up after {} attempts: {}", attempts, e),
            RetryError::Exhausted { attempts, .. } => {
                write!(f, "no acknowledgement after {} attempts", attempts)
            }
            RetryError::Permanent(e) => write!(f, "permanent failure: {}", e),
        }
    }
}

/// Retry schedule: attempt bound plus exponential delays between attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval,
            multiplier,
            max_interval: initial_interval.mul_f64(multiplier.powi(max_attempts as i32)),
        }
    }

    /// Order submission policy
    pub fn orders(config: &ExecutionConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.retry_base_ms),
            config.retry_multiplier,
        )
    }

    /// Dust liquidation policy (fixed half-second spacing)
    pub fn dust(config: &ExecutionConfig) -> Self {
        Self::new(config.dust_attempts, Duration::from_millis(500), 1.0)
    }

    /// Price lookup policy
    pub fn prices(config: &ExecutionConfig) -> Self {
        Self::new(
            config.price_attempts,
            Duration::from_millis(config.price_retry_ms),
            1.6,
        )
    }

    /// Delays slept between consecutive attempts
    pub fn delays(&self) -> Vec<Duration> {
        let mut schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.0)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build();

        (1..self.max_attempts)
            .map(|_| schedule.next_backoff().unwrap_or(self.max_interval))
            .collect()
    }

    /// Run `op` until it yields a value, hits a permanent error, or the
    /// attempt bound is reached. `Ok(None)` counts as a missing
    /// acknowledgement and is retried like a transient failure.
    pub async fn run<T, F, Fut>(&self, clock: &dyn Clock, label: &str, mut op: F) -> std::result::Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let delays = self.delays();
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match op(attempt).await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    warn!("{}: attempt {}/{} not acknowledged", label, attempt, self.max_attempts);
                }
                Err(e) if e.is_order_permanent() => {
                    warn!("{}: permanent error on attempt {}: {}", label, attempt, e);
                    return Err(RetryError::Permanent(e));
                }
                Err(e) => {
                    warn!("{}: attempt {}/{} failed: {}", label, attempt, self.max_attempts, e);
                    last_error = Some(e.to_string());
                }
            }

            if let Some(delay) = delays.get(attempt as usize - 1) {
                clock.sleep(*delay).await;
            }
        }

        Err(RetryError::Exhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn close_ms(actual: Duration, expected_ms: u64) -> bool {
        (actual.as_millis() as i128 - expected_ms as i128).abs() <= 1
    }

    #[test]
    fn test_delay_schedule_is_exponential() {
        let policy = RetryPolicy::new(5, Duration::from_millis(600), 1.5);
        let delays = policy.delays();

        assert_eq!(delays.len(), 4);
        assert!(close_ms(delays[0], 600));
        assert!(close_ms(delays[1], 900));
        assert!(close_ms(delays[2], 1350));
        assert!(close_ms(delays[3], 2025));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let clock = ManualClock::default();
        let start = clock.now();
        let policy = RetryPolicy::new(5, Duration::from_millis(600), 1.5);
        let calls = AtomicU32::new(0);

        let result = policy
            .run(&clock, "test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(Error::Gateway("503".into()))
                    } else {
                        Ok(Some(attempt))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Slept 600ms + 900ms between the three attempts
        let waited = (clock.now() - start).num_milliseconds();
        assert!((1499..=1501).contains(&waited));
    }

    #[tokio::test]
    async fn test_missing_ack_exhausts_attempts() {
        let clock = ManualClock::default();
        let policy = RetryPolicy::new(3, Duration::from_millis(100), 2.0);

        let result: std::result::Result<u32, _> =
            policy.run(&clock, "test", |_| async { Ok(None) }).await;

        match result {
            Err(RetryError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let clock = ManualClock::default();
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 2.0);
        let calls = AtomicU32::new(0);

        let result: std::result::Result<u32, _> = policy
            .run(&clock, "test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::OrderRejected("market closed".into())) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
