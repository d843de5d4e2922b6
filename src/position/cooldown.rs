//! Per-instrument re-entry blocks

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

use super::store::Position;

/// Tracks until when each instrument is blocked from new entries
#[derive(Debug, Default)]
pub struct CooldownTracker {
    until: DashMap<String, DateTime<Utc>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Position>) -> Self {
        let tracker = Self::new();
        for position in records {
            if let Some(until) = position.cooldown_until {
                tracker.set(&position.instrument, until);
            }
        }
        tracker
    }

    /// Block `instrument` until `until`; a later deadline always wins
    pub fn set(&self, instrument: &str, until: DateTime<Utc>) {
        self.until
            .entry(instrument.to_string())
            .and_modify(|current| {
                if until > *current {
                    *current = until;
                }
            })
            .or_insert(until);
    }

    pub fn is_blocked(&self, instrument: &str, now: DateTime<Utc>) -> bool {
        self.until
            .get(instrument)
            .map_or(false, |until| now < *until)
    }

    /// Time left on the block, if any
    pub fn remaining(&self, instrument: &str, now: DateTime<Utc>) -> Option<Duration> {
        let until = *self.until.get(instrument)?;
        (until - now).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Active blocks sorted by instrument
    pub fn active(&self, now: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        let mut list: Vec<(String, DateTime<Utc>)> = self
            .until
            .iter()
            .filter(|entry| now < *entry.value())
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        list.sort();
        list
    }

    /// Drop expired entries
    pub fn prune(&self, now: DateTime<Utc>) {
        self.until.retain(|_, until| now < *until);
    }
}

/// Cooldown length after a full exit: short once a partial take happened
pub fn cooldown_for(partial_take_done: bool, short: Duration, long: Duration) -> Duration {
    if partial_take_done {
        short
    } else {
        long
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_block_expires() {
        let tracker = CooldownTracker::new();
        tracker.set("KRW-XRP", at(100));

        assert!(tracker.is_blocked("KRW-XRP", at(99)));
        assert!(!tracker.is_blocked("KRW-XRP", at(100)));
        assert!(!tracker.is_blocked("KRW-SOL", at(0)));
        assert_eq!(tracker.remaining("KRW-XRP", at(40)), Some(Duration::from_secs(60)));
        assert_eq!(tracker.remaining("KRW-XRP", at(200)), None);
    }

    #[test]
    fn test_later_deadline_wins() {
        let tracker = CooldownTracker::new();
        tracker.set("KRW-XRP", at(500));
        tracker.set("KRW-XRP", at(100));
        assert!(tracker.is_blocked("KRW-XRP", at(300)));
    }

    #[test]
    fn test_rebuilt_from_records() {
        let mut closed = Position::open("KRW-XRP", 0.0, 0.0, at(0));
        closed.cooldown_until = Some(at(1800));
        let open = Position::open("KRW-SOL", 1.0, 100.0, at(0));

        let tracker = CooldownTracker::from_records([&closed, &open]);

        assert_eq!(tracker.active(at(10)), vec![("KRW-XRP".to_string(), at(1800))]);
        tracker.prune(at(2000));
        assert!(tracker.active(at(0)).is_empty());
    }

    #[test]
    fn test_cooldown_length_depends_on_partial_take() {
        let short = Duration::from_secs(30 * 60);
        let long = Duration::from_secs(90 * 60);
        assert_eq!(cooldown_for(true, short, long), short);
        assert_eq!(cooldown_for(false, short, long), long);
    }
}
