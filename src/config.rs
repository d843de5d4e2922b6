//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::Error;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub capital: CapitalConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Quote currency all instruments are priced in
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    /// Taker fee rate used for realized P&L estimates (0.0005 = 0.05%)
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    /// Starting quote balance of the paper exchange
    #[serde(default = "default_paper_cash")]
    pub paper_cash: f64,
    /// Instruments listed on the paper exchange
    #[serde(default = "default_paper_universe")]
    pub paper_universe: Vec<String>,
    /// Per-step random walk volatility of paper prices, in percent
    #[serde(default = "default_paper_volatility_pct")]
    pub paper_volatility_pct: f64,
    /// Paper price update interval
    #[serde(default = "default_paper_price_interval_ms")]
    pub paper_price_interval_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            quote_currency: default_quote_currency(),
            fee_rate: default_fee_rate(),
            paper_cash: default_paper_cash(),
            paper_universe: default_paper_universe(),
            paper_volatility_pct: default_paper_volatility_pct(),
            paper_price_interval_ms: default_paper_price_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapitalConfig {
    /// Fraction of cash never committed, in percent
    #[serde(default = "default_cash_buffer_pct")]
    pub cash_buffer_pct: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Carry a shortfall cycle's budget into the next cycle instead of discarding it
    #[serde(default)]
    pub pool_shortfall: bool,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Upper bound for the scan interval while backing off after scan failures
    #[serde(default = "default_max_scan_interval_secs")]
    pub max_scan_interval_secs: u64,
    #[serde(default = "default_scan_backoff_step_secs")]
    pub scan_backoff_step_secs: u64,
    #[serde(default = "default_excluded_instruments")]
    pub excluded_instruments: Vec<String>,
    /// Candidates priced below this are ignored
    #[serde(default = "default_min_reference_price")]
    pub min_reference_price: f64,
    #[serde(default)]
    pub blackout: BlackoutConfig,
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            cash_buffer_pct: default_cash_buffer_pct(),
            max_open_positions: default_max_open_positions(),
            pool_shortfall: false,
            scan_interval_secs: default_scan_interval_secs(),
            max_scan_interval_secs: default_max_scan_interval_secs(),
            scan_backoff_step_secs: default_scan_backoff_step_secs(),
            excluded_instruments: default_excluded_instruments(),
            min_reference_price: default_min_reference_price(),
            blackout: BlackoutConfig::default(),
        }
    }
}

/// No-entry window after the exchange's daily reset
#[derive(Debug, Clone, Deserialize)]
pub struct BlackoutConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Offset of the exchange's local time from UTC
    #[serde(default = "default_blackout_utc_offset")]
    pub utc_offset_hours: i32,
    #[serde(default = "default_blackout_hour")]
    pub hour: u32,
    #[serde(default = "default_blackout_minutes")]
    pub minutes: u32,
}

impl Default for BlackoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            utc_offset_hours: default_blackout_utc_offset(),
            hour: default_blackout_hour(),
            minutes: default_blackout_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    /// Gain that arms the trailing stop
    #[serde(default = "default_trailing_activation_pct")]
    pub trailing_activation_pct: f64,
    /// Distance of the trailing line below the highest price seen
    #[serde(default = "default_trailing_pct")]
    pub trailing_pct: f64,
    /// Fraction of the position sold on the single partial take
    #[serde(default = "default_partial_take_ratio")]
    pub partial_take_ratio: f64,
    /// Emergency loss that liquidates immediately
    #[serde(default = "default_hard_stop_pct")]
    pub hard_stop_pct: f64,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Re-entry block after an exit that followed a partial take
    #[serde(default = "default_cooldown_short_mins")]
    pub cooldown_short_mins: u64,
    /// Re-entry block after any other exit
    #[serde(default = "default_cooldown_long_mins")]
    pub cooldown_long_mins: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            trailing_activation_pct: default_trailing_activation_pct(),
            trailing_pct: default_trailing_pct(),
            partial_take_ratio: default_partial_take_ratio(),
            hard_stop_pct: default_hard_stop_pct(),
            tick_ms: default_tick_ms(),
            cooldown_short_mins: default_cooldown_short_mins(),
            cooldown_long_mins: default_cooldown_long_mins(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Exchange minimum order notional in quote currency
    #[serde(default = "default_min_order_notional")]
    pub min_order_notional: f64,
    /// Balances worth less than this are liquidated whole
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: f64,
    /// Minimum spacing between orders on one instrument
    #[serde(default = "default_order_interval_ms")]
    pub order_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_confirm_poll_ms")]
    pub confirm_poll_ms: u64,
    /// Decimal places sell quantities are floored to
    #[serde(default = "default_quantity_precision")]
    pub quantity_precision: u32,
    /// Share of the buy budget actually submitted, leaving room for fees
    #[serde(default = "default_fee_headroom")]
    pub fee_headroom: f64,
    #[serde(default = "default_price_attempts")]
    pub price_attempts: u32,
    #[serde(default = "default_price_retry_ms")]
    pub price_retry_ms: u64,
    #[serde(default = "default_dust_attempts")]
    pub dust_attempts: u32,
}

impl ExecutionConfig {
    pub fn order_interval(&self) -> Duration {
        Duration::from_millis(self.order_interval_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn confirm_poll(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_ms)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            min_order_notional: default_min_order_notional(),
            dust_threshold: default_dust_threshold(),
            order_interval_ms: default_order_interval_ms(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_multiplier: default_retry_multiplier(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            confirm_poll_ms: default_confirm_poll_ms(),
            quantity_precision: default_quantity_precision(),
            fee_headroom: default_fee_headroom(),
            price_attempts: default_price_attempts(),
            price_retry_ms: default_price_retry_ms(),
            dust_attempts: default_dust_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Trade events appended one JSON object per line
    #[serde(default = "default_journal_path")]
    pub journal_path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            journal_path: default_journal_path(),
        }
    }
}

/// Exchange API credentials
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    /// Read `ACCESS_KEY` / `SECRET_KEY` from the environment
    pub fn from_env() -> crate::error::Result<Self> {
        let access_key = non_empty_env("ACCESS_KEY")?;
        let secret_key = non_empty_env("SECRET_KEY")?;
        Ok(Self {
            access_key,
            secret_key,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &mask_secret(&self.access_key))
            .field("secret_key", &"***")
            .finish()
    }
}

fn non_empty_env(name: &str) -> crate::error::Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::MissingCredentials(format!("{} not set", name))),
    }
}

// Default value functions
fn default_quote_currency() -> String {
    "KRW".into()
}

fn default_fee_rate() -> f64 {
    0.0005
}

fn default_paper_cash() -> f64 {
    1_000_000.0
}

fn default_paper_universe() -> Vec<String> {
    ["KRW-XRP", "KRW-SOL", "KRW-DOGE", "KRW-ADA", "KRW-AVAX", "KRW-LINK"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_paper_volatility_pct() -> f64 {
    0.3
}

fn default_paper_price_interval_ms() -> u64 {
    1000
}

fn default_cash_buffer_pct() -> f64 {
    10.0
}

fn default_max_open_positions() -> usize {
    2
}

fn default_scan_interval_secs() -> u64 {
    45
}

fn default_max_scan_interval_secs() -> u64 {
    90
}

fn default_scan_backoff_step_secs() -> u64 {
    15
}

fn default_excluded_instruments() -> Vec<String> {
    vec!["KRW-BTC".into(), "KRW-ETH".into()]
}

fn default_min_reference_price() -> f64 {
    100.0
}

fn default_blackout_utc_offset() -> i32 {
    9
}

fn default_blackout_hour() -> u32 {
    9
}

fn default_blackout_minutes() -> u32 {
    3
}

fn default_stop_loss_pct() -> f64 {
    1.2
}

fn default_take_profit_pct() -> f64 {
    2.5
}

fn default_trailing_activation_pct() -> f64 {
    1.0
}

fn default_trailing_pct() -> f64 {
    1.5
}

fn default_partial_take_ratio() -> f64 {
    0.5
}

fn default_hard_stop_pct() -> f64 {
    2.5
}

fn default_tick_ms() -> u64 {
    400
}

fn default_cooldown_short_mins() -> u64 {
    30
}

fn default_cooldown_long_mins() -> u64 {
    90
}

fn default_min_order_notional() -> f64 {
    5500.0
}

fn default_dust_threshold() -> f64 {
    2000.0
}

fn default_order_interval_ms() -> u64 {
    3000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    600
}

fn default_retry_multiplier() -> f64 {
    1.5
}

fn default_confirm_timeout_secs() -> u64 {
    30
}

fn default_confirm_poll_ms() -> u64 {
    600
}

fn default_quantity_precision() -> u32 {
    6
}

fn default_fee_headroom() -> f64 {
    0.999
}

fn default_price_attempts() -> u32 {
    4
}

fn default_price_retry_ms() -> u64 {
    200
}

fn default_dust_attempts() -> u32 {
    3
}

fn default_snapshot_path() -> String {
    let dir = std::env::var("PERSIST_DIR").unwrap_or_else(|_| ".".into());
    Path::new(&dir).join("pos.json").to_string_lossy().into_owned()
}

fn default_journal_path() -> String {
    let dir = std::env::var("PERSIST_DIR").unwrap_or_else(|_| ".".into());
    Path::new(&dir).join("trades.jsonl").to_string_lossy().into_owned()
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("persistence.snapshot_path", default_snapshot_path())?
            .set_default("risk.tick_ms", default_tick_ms() as i64)?
            .set_default("capital.scan_interval_secs", default_scan_interval_secs() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix SCANNER_)
            .add_source(
                config::Environment::with_prefix("SCANNER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let risk = &self.risk;
        for (name, value) in [
            ("stop_loss_pct", risk.stop_loss_pct),
            ("take_profit_pct", risk.take_profit_pct),
            ("trailing_activation_pct", risk.trailing_activation_pct),
            ("trailing_pct", risk.trailing_pct),
            ("hard_stop_pct", risk.hard_stop_pct),
        ] {
            if value <= 0.0 || value >= 100.0 {
                anyhow::bail!("{} must be between 0 and 100, got {}", name, value);
            }
        }

        if risk.partial_take_ratio <= 0.0 || risk.partial_take_ratio > 1.0 {
            anyhow::bail!("partial_take_ratio must be in (0, 1]");
        }

        if risk.tick_ms == 0 {
            anyhow::bail!("tick_ms must be positive");
        }

        if risk.hard_stop_pct <= risk.stop_loss_pct {
            tracing::warn!(
                "hard_stop_pct ({}) is not wider than stop_loss_pct ({}) - the ordinary stop will never fire",
                risk.hard_stop_pct,
                risk.stop_loss_pct
            );
        }

        // Validate capital allocation
        if self.capital.max_open_positions == 0 {
            anyhow::bail!("max_open_positions must be at least 1");
        }

        if !(0.0..100.0).contains(&self.capital.cash_buffer_pct) {
            anyhow::bail!("cash_buffer_pct must be in [0, 100)");
        }

        if self.capital.blackout.hour > 23 || self.capital.blackout.minutes > 59 {
            anyhow::bail!("blackout hour/minutes out of range");
        }

        // Validate execution limits
        let exec = &self.execution;
        if exec.min_order_notional <= 0.0 {
            anyhow::bail!("min_order_notional must be positive");
        }

        if exec.dust_threshold > exec.min_order_notional {
            anyhow::bail!(
                "dust_threshold ({}) cannot exceed min_order_notional ({})",
                exec.dust_threshold,
                exec.min_order_notional
            );
        }

        if exec.max_attempts == 0 || exec.price_attempts == 0 || exec.dust_attempts == 0 {
            anyhow::bail!("retry attempt counts must be at least 1");
        }

        if exec.retry_multiplier < 1.0 {
            anyhow::bail!("retry_multiplier must be >= 1.0");
        }

        if exec.fee_headroom <= 0.0 || exec.fee_headroom > 1.0 {
            anyhow::bail!("fee_headroom must be in (0, 1]");
        }

        if exec.confirm_poll_ms == 0 {
            anyhow::bail!("confirm_poll_ms must be positive");
        }

        if self.persistence.snapshot_interval_secs == 0 || self.exchange.paper_price_interval_ms == 0 {
            anyhow::bail!("snapshot and paper price intervals must be positive");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let credentials = match Credentials::from_env() {
            Ok(c) => format!("{:?}", c),
            Err(_) => "(not set)".to_string(),
        };

        format!(
            r#"Configuration:
  Exchange:
    quote: {}
    fee_rate: {}
    credentials: {}
  Capital:
    cash_buffer: {}%
    max_open_positions: {}
    pool_shortfall: {}
    scan_interval: {}s
    excluded: {:?}
    blackout: {} ({:02}:00 +{}m, UTC{:+})
  Risk:
    stop_loss: {}%
    hard_stop: {}%
    take_profit: {}% (partial {}%)
    trailing: activate {}% / line {}%
    tick: {}ms
    cooldown: {}m after partial / {}m otherwise
  Execution:
    min_order: {}
    dust_threshold: {}
    max_attempts: {}
    confirm_timeout: {}s
  Persistence:
    snapshot: {}
    journal: {}
"#,
            self.exchange.quote_currency,
            self.exchange.fee_rate,
            credentials,
            self.capital.cash_buffer_pct,
            self.capital.max_open_positions,
            self.capital.pool_shortfall,
            self.capital.scan_interval_secs,
            self.capital.excluded_instruments,
            self.capital.blackout.enabled,
            self.capital.blackout.hour,
            self.capital.blackout.minutes,
            self.capital.blackout.utc_offset_hours,
            self.risk.stop_loss_pct,
            self.risk.hard_stop_pct,
            self.risk.take_profit_pct,
            self.risk.partial_take_ratio * 100.0,
            self.risk.trailing_activation_pct,
            self.risk.trailing_pct,
            self.risk.tick_ms,
            self.risk.cooldown_short_mins,
            self.risk.cooldown_long_mins,
            self.execution.min_order_notional,
            self.execution.dust_threshold,
            self.execution.max_attempts,
            self.execution.confirm_timeout_secs,
            self.persistence.snapshot_path,
            self.persistence.journal_path,
        )
    }
}

/// Mask a secret for display, keeping a short prefix
fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= 4 {
        "***".to_string()
    } else {
        format!("{}***", secret.chars().take(4).collect::<String>())
    }
}
