//! Spot Scanner - position risk engine for a spot exchange account
//!
//! # WARNING
//! - Live trading moves real money. Start with `--paper`.
//! - Stops are evaluated on a polling tick; fast moves can gap through them.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use spot_scanner::cli::commands;
use spot_scanner::config::{Config, Credentials};

/// Spot Scanner - scan, enter, and supervise spot positions
#[derive(Parser)]
#[command(name = "scanner")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scanner
    Start {
        /// Trade against the in-memory paper exchange
        #[arg(long)]
        paper: bool,

        /// Seed for paper prices and scoring
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show positions and cooldowns from the snapshot
    Status,

    /// Show current configuration (secrets masked)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.json);

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let live = matches!(cli.command, Commands::Start { paper: false, .. });
    if let Err(e) = startup_checks(&config, live) {
        error!("Startup checks failed: {:#}", e);
        std::process::exit(1);
    }

    // Execute command
    let result = match cli.command {
        Commands::Start { paper, seed } => commands::start(&config, paper, seed).await,
        Commands::Status => commands::status(&config).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        "spot_scanner=info"
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
    );

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Perform startup safety checks
fn startup_checks(config: &Config, live: bool) -> Result<()> {
    info!("Performing startup checks...");

    // Missing credentials are fatal only when trading live
    if live {
        let credentials = Credentials::from_env()?;
        info!("Exchange credentials found: {:?}", credentials);
    }

    warn!(
        "Risk limits active: stop={}%, hard_stop={}%, max_open_positions={}",
        config.risk.stop_loss_pct, config.risk.hard_stop_pct, config.capital.max_open_positions
    );

    info!("Startup checks passed");
    Ok(())
}
