//! Position store
//!
//! Authoritative map of instrument to position record. The lock never leaves
//! this module: callers get snapshots or run a closure under the write lock.
//! Closed positions stay as records (quantity zero) so their cooldown
//! survives a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::exchange::{base_asset, ExchangeGateway};

/// One instrument's position record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Filled from the snapshot key on load
    #[serde(skip)]
    pub instrument: String,
    pub quantity: f64,
    pub average_price: f64,
    pub entry_time: DateTime<Utc>,
    pub highest_price_seen: f64,
    #[serde(default)]
    pub trailing_active: bool,
    #[serde(default)]
    pub partial_take_done: bool,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Position {
    /// Fresh position from a buy fill
    pub fn open(instrument: &str, quantity: f64, average_price: f64, at: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.to_string(),
            quantity,
            average_price,
            entry_time: at,
            highest_price_seen: average_price,
            trailing_active: false,
            partial_take_done: false,
            cooldown_until: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.quantity > 0.0
    }

    /// Unrealized change in percent at `price`
    pub fn unrealized_pct(&self, price: f64) -> f64 {
        if self.average_price <= 0.0 {
            return 0.0;
        }
        (price - self.average_price) / self.average_price * 100.0
    }

    /// Cost basis of the held quantity
    pub fn cost(&self) -> f64 {
        self.quantity * self.average_price
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map_or(false, |until| now < until)
    }

    /// Zero the record and reset its latches
    fn close(&mut self, cooldown_until: DateTime<Utc>) {
        self.quantity = 0.0;
        self.average_price = 0.0;
        self.highest_price_seen = 0.0;
        self.trailing_active = false;
        self.partial_take_done = false;
        self.cooldown_until = Some(cooldown_until);
    }
}

/// What reconciliation changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Local quantity replaced by the exchange balance
    pub adjusted: Vec<String>,
    /// Local record closed because the exchange holds nothing
    pub closed: Vec<String>,
    /// Exchange holding adopted without a local record
    pub adopted: Vec<String>,
}

/// Position store guarded by a single lock
pub struct PositionStore {
    positions: RwLock<BTreeMap<String, Position>>,
    persistence_path: Option<PathBuf>,
}

impl PositionStore {
    pub fn new(persistence_path: Option<PathBuf>) -> Self {
        Self {
            positions: RwLock::new(BTreeMap::new()),
            persistence_path,
        }
    }

    /// Copy of every record, open and closed
    pub async fn snapshot(&self) -> Vec<Position> {
        self.positions.read().await.values().cloned().collect()
    }

    /// Copy of the open positions only
    pub async fn open_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect()
    }

    pub async fn get(&self, instrument: &str) -> Option<Position> {
        self.positions.read().await.get(instrument).cloned()
    }

    pub async fn open_count(&self) -> usize {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open())
            .count()
    }

    /// Insert or replace a record
    pub async fn upsert(&self, position: Position) {
        let mut guard = self.positions.write().await;
        guard.insert(position.instrument.clone(), position);
    }

    /// Apply a buy fill: open a new position or fold the fill into the
    /// existing cost basis
    pub async fn record_buy(
        &self,
        instrument: &str,
        filled_qty: f64,
        spent: f64,
        at: DateTime<Utc>,
    ) -> Result<Position> {
        if filled_qty <= 0.0 || spent <= 0.0 {
            return Err(Error::Internal(format!(
                "invalid buy fill for {}: qty={} spent={}",
                instrument, filled_qty, spent
            )));
        }

        let mut guard = self.positions.write().await;
        let position = match guard.get_mut(instrument) {
            Some(existing) if existing.is_open() => {
                let quantity = existing.quantity + filled_qty;
                existing.average_price = (existing.cost() + spent) / quantity;
                existing.quantity = quantity;
                existing.highest_price_seen =
                    existing.highest_price_seen.max(existing.average_price);
                existing.clone()
            }
            _ => {
                let fresh = Position::open(instrument, filled_qty, spent / filled_qty, at);
                guard.insert(instrument.to_string(), fresh.clone());
                fresh
            }
        };

        debug!(
            "Recorded buy {}: qty={:.6} avg={:.4}",
            instrument, position.quantity, position.average_price
        );
        Ok(position)
    }

    /// Atomic read-modify-write of an open position; `None` when the
    /// instrument has no open position
    pub async fn update<R>(&self, instrument: &str, f: impl FnOnce(&mut Position) -> R) -> Option<R> {
        let mut guard = self.positions.write().await;
        match guard.get_mut(instrument) {
            Some(position) if position.is_open() => Some(f(position)),
            _ => None,
        }
    }

    /// Close a position only if it is still open. Returns the record as it
    /// was before closing, or `None` if someone else closed it first.
    pub async fn close_if_open(
        &self,
        instrument: &str,
        cooldown_until: DateTime<Utc>,
    ) -> Option<Position> {
        let mut guard = self.positions.write().await;
        let position = guard.get_mut(instrument).filter(|p| p.is_open())?;
        let before = position.clone();
        position.close(cooldown_until);
        info!("Closed position {}", instrument);
        Some(before)
    }

    /// Write the snapshot atomically (temp file then rename)
    pub async fn save(&self) -> Result<()> {
        let path = match &self.persistence_path {
            Some(p) => p,
            None => return Ok(()),
        };

        let (data, count) = {
            let positions = self.positions.read().await;
            let data = serde_json::to_string_pretty(&*positions)
                .map_err(|e| Error::PositionPersistence(e.to_string()))?;
            (data, positions.len())
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::PositionPersistence(e.to_string()))?;
        }

        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::PositionPersistence(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::PositionPersistence(e.to_string()))?;

        debug!("Saved {} position records to {}", count, path.display());
        Ok(())
    }

    /// Load the snapshot, replacing in-memory records
    pub async fn load(&self) -> Result<usize> {
        let path = match &self.persistence_path {
            Some(p) if p.exists() => p,
            _ => return Ok(0),
        };

        let positions = read_snapshot(path).await?;
        let mut guard = self.positions.write().await;
        *guard = positions;

        info!("Loaded {} position records from {}", guard.len(), path.display());
        Ok(guard.len())
    }

    /// Reconcile local records against live balances.
    ///
    /// The exchange wins for quantity; the local record wins for the cost
    /// basis and trailing metadata. Holdings in `universe` without a local
    /// record are adopted when the exchange reports an average buy price.
    pub async fn reconcile(
        &self,
        gateway: &dyn ExchangeGateway,
        universe: &[String],
        now: DateTime<Utc>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mut instruments: BTreeSet<String> = universe.iter().cloned().collect();
        instruments.extend(
            self.open_positions()
                .await
                .into_iter()
                .map(|p| p.instrument),
        );

        for instrument in instruments {
            let held = match gateway.balance(base_asset(&instrument)).await {
                Ok(Some(q)) => q,
                Ok(None) => {
                    warn!("Reconcile {}: balance unavailable, keeping local record", instrument);
                    continue;
                }
                Err(e) => {
                    warn!("Reconcile {}: {}, keeping local record", instrument, e);
                    continue;
                }
            };

            let local = self.get(&instrument).await.filter(|p| p.is_open());
            match local {
                Some(position) if held <= 0.0 => {
                    let until = position.cooldown_until.unwrap_or(now);
                    self.close_if_open(&instrument, until).await;
                    report.closed.push(instrument);
                }
                Some(position) => {
                    if (position.quantity - held).abs() > f64::EPSILON {
                        info!(
                            "Reconcile {}: quantity {:.6} -> {:.6}",
                            instrument, position.quantity, held
                        );
                        self.update(&instrument, |p| p.quantity = held).await;
                        report.adjusted.push(instrument);
                    }
                }
                None if held > 0.0 => {
                    let avg = match gateway.average_buy_price(&instrument).await {
                        Ok(Some(avg)) if avg > 0.0 => avg,
                        _ => {
                            warn!(
                                "Reconcile {}: holding {:.6} without a cost basis, ignoring",
                                instrument, held
                            );
                            continue;
                        }
                    };
                    let cooldown = self.get(&instrument).await.and_then(|p| p.cooldown_until);
                    let mut adopted = Position::open(&instrument, held, avg, now);
                    adopted.cooldown_until = cooldown;
                    self.upsert(adopted).await;
                    info!("Reconcile {}: adopted {:.6} @ {:.4}", instrument, held, avg);
                    report.adopted.push(instrument);
                }
                None => {}
            }
        }

        report
    }
}

/// Read a snapshot file without a store, for the `status` command
pub async fn read_snapshot(path: &Path) -> Result<BTreeMap<String, Position>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::PositionPersistence(e.to_string()))?;

    let mut positions: BTreeMap<String, Position> = serde_json::from_str(&data)
        .map_err(|e| Error::PositionPersistence(e.to_string()))?;
    for (instrument, position) in positions.iter_mut() {
        position.instrument = instrument.clone();
    }
    Ok(positions)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exchange::PaperExchange;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_record_buy_weights_cost_basis() {
        let store = PositionStore::new(None);

        store.record_buy("KRW-XRP", 10.0, 1000.0, at(0)).await.unwrap();
        let pos = store.record_buy("KRW-XRP", 10.0, 2000.0, at(5)).await.unwrap();

        assert_eq!(pos.quantity, 20.0);
        assert!((pos.average_price - 150.0).abs() < 1e-9);
        assert_eq!(pos.entry_time, at(0));
        assert_eq!(store.open_count().await, 1);
    }

    #[tokio::test]
    async fn test_record_buy_rejects_empty_fill() {
        let store = PositionStore::new(None);
        assert!(store.record_buy("KRW-XRP", 0.0, 1000.0, at(0)).await.is_err());
        assert!(store.get("KRW-XRP").await.is_none());
    }

    #[tokio::test]
    async fn test_close_if_open_is_compare_and_swap() {
        let store = PositionStore::new(None);
        store.upsert(Position::open("KRW-XRP", 5.0, 100.0, at(0))).await;

        let first = store.close_if_open("KRW-XRP", at(60)).await;
        let second = store.close_if_open("KRW-XRP", at(120)).await;

        assert_eq!(first.unwrap().quantity, 5.0);
        assert!(second.is_none());

        let record = store.get("KRW-XRP").await.unwrap();
        assert_eq!(record.quantity, 0.0);
        assert!(!record.partial_take_done);
        assert_eq!(record.cooldown_until, Some(at(60)));
        assert_eq!(store.open_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_skips_closed_records() {
        let store = PositionStore::new(None);
        store.upsert(Position::open("KRW-XRP", 5.0, 100.0, at(0))).await;
        store.close_if_open("KRW-XRP", at(60)).await;

        let touched = store.update("KRW-XRP", |p| p.trailing_active = true).await;

        assert!(touched.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("pos.json");

        let store = PositionStore::new(Some(path.clone()));
        let mut pos = Position::open("KRW-SOL", 2.0, 200_000.0, at(0));
        pos.trailing_active = true;
        pos.highest_price_seen = 210_000.0;
        store.upsert(pos.clone()).await;
        store.upsert(Position::open("KRW-XRP", 1.0, 700.0, at(0))).await;
        store.close_if_open("KRW-XRP", at(1800)).await;
        store.save().await.unwrap();

        assert!(!tmp_path(&path).exists());

        let restored = PositionStore::new(Some(path));
        assert_eq!(restored.load().await.unwrap(), 2);
        assert_eq!(restored.get("KRW-SOL").await.unwrap(), pos);
        assert_eq!(
            restored.get("KRW-XRP").await.unwrap().cooldown_until,
            Some(at(1800))
        );
    }

    #[tokio::test]
    async fn test_snapshot_uses_instrument_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos.json");
        let store = PositionStore::new(Some(path.clone()));
        store.upsert(Position::open("KRW-ADA", 3.0, 500.0, at(0))).await;
        store.save().await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let record = &raw["KRW-ADA"];
        assert_eq!(record["quantity"], 3.0);
        assert_eq!(record["average_price"], 500.0);
        assert!(record.get("instrument").is_none());
        assert!(record.get("cooldown_until").is_some());
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(Some(dir.path().join("absent.json")));
        assert_eq!(store.load().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_exchange_wins_on_quantity() {
        let clock = Arc::new(ManualClock::new(at(0)));
        let exchange = PaperExchange::new(clock, "KRW", 0.0, 0.0);
        exchange.set_price("KRW-XRP", 1000.0);
        exchange.set_price("KRW-SOL", 100.0);
        exchange.set_price("KRW-ADA", 500.0);
        exchange.seed_holding("KRW-XRP", 4.0, 900.0);
        exchange.seed_holding("KRW-ADA", 8.0, 480.0);

        let store = PositionStore::new(None);
        let mut xrp = Position::open("KRW-XRP", 5.0, 950.0, at(0));
        xrp.trailing_active = true;
        store.upsert(xrp).await;
        store.upsert(Position::open("KRW-SOL", 1.0, 100.0, at(0))).await;

        let universe = vec!["KRW-ADA".to_string()];
        let report = store.reconcile(&exchange, &universe, at(10)).await;

        assert_eq!(report.adjusted, vec!["KRW-XRP".to_string()]);
        assert_eq!(report.closed, vec!["KRW-SOL".to_string()]);
        assert_eq!(report.adopted, vec!["KRW-ADA".to_string()]);

        let xrp = store.get("KRW-XRP").await.unwrap();
        assert_eq!(xrp.quantity, 4.0);
        // Local cost basis and latches survive
        assert_eq!(xrp.average_price, 950.0);
        assert!(xrp.trailing_active);

        assert!(!store.get("KRW-SOL").await.unwrap().is_open());

        let ada = store.get("KRW-ADA").await.unwrap();
        assert_eq!(ada.average_price, 480.0);
        assert_eq!(ada.highest_price_seen, 480.0);
    }
}
