//! Polymarket Copy-Trade Mirror
//!
//! Watches one wallet's public activity and mirrors its trades, either on
//! the live order book or against a simulated paper ledger, with per-market
//! caps, portfolio limits and stop-loss protection.

mod api;
mod bot;
mod db;
mod error;
mod models;
mod notify;
mod trading;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{ClobClient, DataClient, PriceFeed, WsPriceFeed, MARKET_WS_URL};
use crate::bot::Bot;
use crate::db::Database;
use crate::notify::{log_notifications, NotificationSink};
use crate::trading::{validate_wallet, CopyConfig, ExecutionMode, PaperLedger};

/// Buffered pushed prices before the feed starts dropping.
const TICK_BUFFER: usize = 1024;

/// Polymarket copy-trade mirror CLI.
#[derive(Parser)]
#[command(name = "polymirror")]
#[command(about = "Mirror a Polymarket wallet's trades with risk controls", long_about = None)]
struct Cli {
    /// Database URL, overrides DATABASE_URL
    #[arg(short, long)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start mirroring a wallet
    Run {
        /// Wallet to mirror
        #[arg(short, long, env = "TRACKED_WALLET")]
        wallet: String,

        /// Simulate fills against the paper ledger
        #[arg(long)]
        paper: bool,

        /// Polling interval in milliseconds
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },

    /// Show the effective configuration
    Config,

    /// Show the paper ledger and the copy-trade journal
    Status {
        /// Number of journal rows to show
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },

    /// Wipe the paper ledger
    ResetPaper,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = CopyConfig::from_env()?;
    let database_url = cli.database.unwrap_or_else(|| config.database_url.clone());

    match cli.command {
        Commands::Run {
            wallet,
            paper,
            interval_ms,
        } => {
            if paper {
                config.paper_trading = true;
            }
            if let Some(ms) = interval_ms {
                config.poll_interval_ms = ms;
            }
            config.validate()?;
            validate_wallet(&wallet)?;

            let db = Database::new(&database_url).await?;
            let config = Arc::new(config);
            let data = Arc::new(DataClient::new()?);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            });

            let (bot, ticks) = if config.paper_trading {
                let ledger = match db.load_paper_ledger().await? {
                    Some(ledger) => {
                        info!(
                            balance = %ledger.balance(),
                            positions = ledger.open_positions(),
                            "Restored paper ledger"
                        );
                        ledger
                    }
                    None => PaperLedger::new(config.paper_starting_balance),
                };
                let mode = ExecutionMode::Paper(Arc::new(RwLock::new(ledger)));
                let bot = Bot::new(config.clone(), mode, data.clone(), data.clone(), None)
                    .with_database(db);
                (bot, None)
            } else {
                CopyConfig::require_credentials(|name| std::env::var(name).ok())?;
                let clob = Arc::new(ClobClient::from_env()?);
                let own_wallet = clob.address().to_string();
                info!(address = %own_wallet, "CLOB client initialized");

                let (tick_tx, tick_rx) = mpsc::channel(TICK_BUFFER);
                let price_feed: Option<Arc<dyn PriceFeed>> = if config.stop_loss_enabled {
                    let (feed, _task) =
                        WsPriceFeed::spawn(MARKET_WS_URL, tick_tx, shutdown_rx.clone());
                    Some(Arc::new(feed))
                } else {
                    None
                };

                let bot = Bot::new(
                    config.clone(),
                    ExecutionMode::Live(clob),
                    data.clone(),
                    data.clone(),
                    price_feed,
                )
                .with_database(db)
                .with_own_wallet(own_wallet);
                (bot, Some(tick_rx))
            };

            let (sink, rx) = NotificationSink::channel();
            tokio::spawn(log_notifications(rx));
            bot.start(&wallet, Some(sink)).await?;

            println!("\n=== Polymarket Copy-Trade Mirror ===");
            println!("Tracked wallet:   {}", wallet);
            println!("Polling interval: {}ms", config.poll_interval_ms);
            println!("Per-market cap:   ${}", config.max_bet_per_market());
            let stop_loss = if config.stop_loss_enabled {
                format!("{}%", config.stop_loss_pct)
            } else {
                "off".to_string()
            };
            println!("Stop-loss:        {}", stop_loss);
            let mode = if config.paper_trading {
                "PAPER (simulated fills)"
            } else {
                "LIVE TRADING"
            };
            println!("Mode: {}", mode);
            println!("\nPress Ctrl+C to stop.\n");

            let bot = Arc::new(bot);
            let tick_task = ticks.map(|rx| bot.spawn_tick_handler(rx));

            let stats = bot.clone().run(shutdown_rx).await;
            if let Some(task) = tick_task {
                task.abort();
            }

            println!("\n{}", stats);
        }

        Commands::Config => {
            if let Err(e) = config.validate() {
                warn!(error = %e, "Configuration is invalid");
            }
            println!("\n{}", config);
            println!("Database:         {}", database_url);
        }

        Commands::Status { limit } => {
            let db = Database::new(&database_url).await?;

            match db.load_paper_ledger().await? {
                Some(ledger) => {
                    println!("{}", ledger.stats(&Default::default()));
                    let positions: Vec<_> = ledger.positions().collect();
                    if !positions.is_empty() {
                        println!("\n=== Open Paper Positions ===");
                        for pos in positions {
                            println!(
                                "  {} {} {:.2} @ {:.3} (${:.2}){}",
                                truncate(&pos.market, 30),
                                pos.outcome,
                                pos.shares,
                                pos.avg_price,
                                pos.entry_value,
                                if pos.stop_loss_pending { " [stop pending]" } else { "" }
                            );
                        }
                    }
                }
                None => {
                    println!("No paper ledger found. Run 'polymirror run --paper' to start one.")
                }
            }

            let journal = db.copy_trade_stats().await?;
            println!("\n=== Copy Journal ===");
            println!("Total:            {}", journal.total);
            println!("Executed:         {}", journal.executed);
            println!("Failed:           {}", journal.failed);
            println!("Skipped:          {}", journal.skipped);

            let recent = db.recent_copy_trades(limit).await?;
            if !recent.is_empty() {
                println!("\n=== Recent Copies ===");
                for trade in &recent {
                    println!(
                        "  {} {} {:<4} {} @ {} [{} {}]{}",
                        trade.created_at.format("%Y-%m-%d %H:%M:%S"),
                        truncate(&trade.market, 30),
                        trade.side,
                        trade.shares,
                        trade.price,
                        trade.mode,
                        trade.status,
                        trade
                            .error_message
                            .as_deref()
                            .map(|e| format!(" {}", e))
                            .unwrap_or_default()
                    );
                }
            }
        }

        Commands::ResetPaper => {
            let db = Database::new(&database_url).await?;
            db.reset_paper_ledger().await?;
            println!("Paper ledger reset.");
        }
    }

    Ok(())
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
