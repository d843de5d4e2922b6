//! CLI command implementations

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, Credentials};
use crate::exchange::{ExchangeGateway, PaperExchange};
use crate::notify::{ChannelSink, LogSink, MultiSink, NotificationSink, TradeEvent};
use crate::position::store::read_snapshot;
use crate::position::{CooldownTracker, PositionStore, RiskEngine};
use crate::strategy::{AdmissionController, RandomScorer, UniverseScanner};
use crate::trading::SafeOrderExecutor;

/// Share of the paper universe the random scorer admits per scan
const PAPER_ADMIT_PROBABILITY: f64 = 0.3;

/// Trade events buffered for the journal writer
const JOURNAL_CAPACITY: usize = 256;

/// Start the scanner
pub async fn start(config: &Config, paper: bool, seed: Option<u64>) -> Result<()> {
    if !paper {
        let credentials = Credentials::from_env()?;
        info!("Credentials loaded: {:?}", credentials);
        bail!(
            "no live exchange gateway is linked into this build; run with --paper to trade \
             against the in-memory exchange"
        );
    }

    warn!("Running in PAPER mode - orders go to the in-memory exchange");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let snapshot_path = PathBuf::from(&config.persistence.snapshot_path);

    // Load persisted state
    let store = Arc::new(PositionStore::new(Some(snapshot_path.clone())));
    if let Err(e) = store.load().await {
        warn!("Could not load positions: {} (starting fresh)", e);
    }
    let records = store.snapshot().await;

    // Paper account: cash, universe prices, and the holdings from the snapshot
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let exchange = Arc::new(PaperExchange::new(
        clock.clone(),
        &config.exchange.quote_currency,
        config.exchange.paper_cash,
        config.exchange.fee_rate,
    ));
    for instrument in &config.exchange.paper_universe {
        exchange.set_price(instrument, rng.gen_range(200.0..5000.0_f64).round());
    }
    for position in records.iter().filter(|p| p.is_open()) {
        if exchange.price(&position.instrument).is_none() {
            exchange.set_price(&position.instrument, position.average_price);
        }
        exchange.seed_holding(&position.instrument, position.quantity, position.average_price);
    }
    let gateway: Arc<dyn ExchangeGateway> = exchange.clone();

    let report = store
        .reconcile(gateway.as_ref(), &config.exchange.paper_universe, clock.now())
        .await;
    info!(
        "Reconciled positions: {} adjusted, {} closed, {} adopted",
        report.adjusted.len(),
        report.closed.len(),
        report.adopted.len()
    );
    let cooldowns = Arc::new(CooldownTracker::from_records(&records));

    let executor = Arc::new(SafeOrderExecutor::new(
        gateway.clone(),
        clock.clone(),
        config.execution.clone(),
        &config.exchange.quote_currency,
    ));
    let (journal_sink, journal_rx) = ChannelSink::new(JOURNAL_CAPACITY);
    let sink: Arc<dyn NotificationSink> =
        Arc::new(MultiSink::new().with(LogSink).with(journal_sink));
    let journal = tokio::spawn(journal_loop(
        journal_rx,
        PathBuf::from(&config.persistence.journal_path),
    ));

    let scanner = Arc::new(UniverseScanner::new(
        gateway.clone(),
        config.exchange.paper_universe.clone(),
        Arc::new(RandomScorer::new(PAPER_ADMIT_PROBABILITY, seed)),
    ));
    let admission = Arc::new(AdmissionController::new(
        store.clone(),
        cooldowns.clone(),
        executor.clone(),
        scanner,
        clock.clone(),
        sink.clone(),
        config.capital.clone(),
        &config.exchange.quote_currency,
    ));
    let risk = Arc::new(RiskEngine::new(
        store.clone(),
        cooldowns.clone(),
        executor.clone(),
        clock.clone(),
        sink.clone(),
        &config.risk,
        config.exchange.fee_rate,
    ));

    // Workers
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let handles = vec![
        tokio::spawn(exchange.clone().run_random_walk(
            Duration::from_millis(config.exchange.paper_price_interval_ms),
            config.exchange.paper_volatility_pct,
            seed,
            shutdown_tx.subscribe(),
        )),
        tokio::spawn(risk.run(shutdown_tx.subscribe())),
        tokio::spawn(admission.run(shutdown_tx.subscribe())),
        tokio::spawn(snapshot_loop(
            store.clone(),
            Duration::from_secs(config.persistence.snapshot_interval_secs),
            shutdown_tx.subscribe(),
        )),
    ];

    info!(
        "Scanner running: {} instruments, {} slots. Press Ctrl+C to stop.",
        config.exchange.paper_universe.len(),
        config.capital.max_open_positions
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested, waiting for workers...");
    let _ = shutdown_tx.send(());

    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Worker ended abnormally: {}", e);
        }
    }

    // The journal drains once the last sink handle is gone
    drop(sink);
    if let Err(e) = journal.await {
        warn!("Journal writer ended abnormally: {}", e);
    }

    store.save().await.context("final position snapshot failed")?;
    info!(
        "Final snapshot written to {} ({} open positions)",
        snapshot_path.display(),
        store.open_count().await
    );
    Ok(())
}

/// Save the store on a fixed interval until shutdown
async fn snapshot_loop(
    store: Arc<PositionStore>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.save().await {
                    warn!("Periodic snapshot failed: {}", e);
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Append trade events to the journal until every sender is dropped
async fn journal_loop(mut events: mpsc::Receiver<TradeEvent>, path: PathBuf) {
    while let Some(event) = events.recv().await {
        if let Err(e) = append_event(&path, &event).await {
            warn!(
                "Failed to journal {} for {}: {:#}",
                event.kind, event.instrument, e
            );
        }
    }
}

async fn append_event(path: &Path, event: &TradeEvent) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(event)?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Show open positions and cooldowns from the snapshot
pub async fn status(config: &Config) -> Result<()> {
    let path = Path::new(&config.persistence.snapshot_path);

    println!("\n=== SCANNER STATUS ===\n");
    if !path.exists() {
        println!("No snapshot at {}.", path.display());
        return Ok(());
    }

    let records = read_snapshot(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let now = Utc::now();

    let open: Vec<_> = records.values().filter(|p| p.is_open()).collect();
    let cost: f64 = open.iter().map(|p| p.cost()).sum();
    println!("Open positions: {} / {}", open.len(), config.capital.max_open_positions);
    println!("Cost basis: {:.0} {}", cost, config.exchange.quote_currency);

    println!("\n=== OPEN POSITIONS ===\n");
    if open.is_empty() {
        println!("No open positions.");
    }
    for p in &open {
        println!(
            "{:<12} qty={:<14.6} avg={:<12.4} high={:<12.4} trailing={} partial={} since {}",
            p.instrument,
            p.quantity,
            p.average_price,
            p.highest_price_seen,
            p.trailing_active,
            p.partial_take_done,
            p.entry_time.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\n=== COOLDOWNS ===\n");
    let cooldowns = CooldownTracker::from_records(records.values());
    let active = cooldowns.active(now);
    if active.is_empty() {
        println!("None.");
    }
    for (instrument, until) in active {
        println!(
            "{:<12} until {} ({}m left)",
            instrument,
            until.format("%Y-%m-%d %H:%M:%S"),
            (until - now).num_minutes()
        );
    }

    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventKind;
    use crate::position::Position;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_status_reads_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos.json");
        let store = PositionStore::new(Some(path.clone()));
        store
            .upsert(Position::open("KRW-XRP", 3.0, 700.0, Utc::now()))
            .await;
        store.save().await.unwrap();

        let mut config = Config::default();
        config.persistence.snapshot_path = path.to_string_lossy().into_owned();

        assert!(status(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.persistence.snapshot_path = dir
            .path()
            .join("missing.json")
            .to_string_lossy()
            .into_owned();

        assert!(status(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_loop_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PositionStore::new(Some(dir.path().join("pos.json"))));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(snapshot_loop(store, Duration::from_secs(3600), rx));
        tx.send(()).unwrap();

        assert_ok!(handle.await);
    }

    #[tokio::test]
    async fn test_journal_appends_events_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("trades.jsonl");
        let (sink, rx) = ChannelSink::new(8);
        let handle = tokio::spawn(journal_loop(rx, path.clone()));

        let sink = MultiSink::new().with(LogSink).with(sink);
        sink.notify(TradeEvent::new(EventKind::Buy, "KRW-XRP", 10.0, 1000.0, 0.0));
        sink.notify(
            TradeEvent::new(EventKind::Stop, "KRW-XRP", 10.0, 987.0, -1.3).with_pnl(-140.0),
        );
        drop(sink);
        assert_ok!(handle.await);

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "BUY");
        assert!(lines[0].get("pnl").is_none());
        assert_eq!(lines[1]["kind"], "STOP");
        assert_eq!(lines[1]["pnl"], -140.0);
    }
}
