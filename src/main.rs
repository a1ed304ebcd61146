//! Leveraged DCA trading engine.
//!
//! Opens positions from signals, scales into losing positions through
//! margin-call levels, and exits through take profit, stop loss, trailing
//! stops, OCO orders, and progressive targets, all gated by a safety
//! subsystem (kill switch, circuit breaker, idempotency, daily limits).

mod bot;
mod db;
mod error;
mod exchange;
mod models;
mod notify;
mod store;
mod trading;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bot::{Bot, BotConfig};
use crate::db::Database;
use crate::exchange::PaperExchange;
use crate::models::{AccountRegistry, PositionSide, TradeSignal};
use crate::notify::Notifier;
use crate::store::{MemoryStore, PositionStore};
use crate::trading::{Orchestrator, SafetyManager};

/// DCA trading engine CLI.
#[derive(Parser)]
#[command(name = "msentinel")]
#[command(about = "Leveraged DCA trading engine with safety rails", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./msentinel.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler loop
    Run {
        /// Evaluation interval in seconds
        #[arg(short, long, default_value = "5")]
        interval: u64,

        /// Webhook URL for trade notifications
        #[arg(short, long)]
        webhook: Option<String>,

        /// Paper trading balance in USD
        #[arg(short, long, default_value = "1000")]
        balance: f64,

        /// Run against an in-memory store, leaving the database untouched
        #[arg(long)]
        dry_run: bool,
    },

    /// Execute a trading signal once
    Signal {
        /// Trading symbol (e.g. BTCUSDT)
        symbol: String,

        /// LONG or SHORT
        side: String,

        /// Entry price (market price when omitted)
        #[arg(short, long)]
        entry: Option<f64>,

        /// Requested leverage (capped to the account maximum)
        #[arg(short, long, default_value = "10")]
        leverage: u32,

        /// Stop-loss price from the signal
        #[arg(short, long)]
        stop_loss: Option<f64>,

        /// Comma-separated take-profit targets
        #[arg(short, long)]
        targets: Option<String>,

        /// Owner account id
        #[arg(short, long, default_value = "default")]
        owner: String,
    },

    /// Show engine and safety status
    Status,

    /// List open positions
    Positions,

    /// Close a position at market price
    Close {
        position_id: String,

        /// Close price for the paper exchange
        #[arg(short, long)]
        price: Option<f64>,
    },

    /// Safety subsystem controls
    Safety {
        #[command(subcommand)]
        action: SafetyAction,
    },
}

#[derive(Subcommand)]
enum SafetyAction {
    /// Show the current safety state
    Status,

    /// Activate the kill switch
    Kill {
        #[arg(default_value = "Manual activation")]
        reason: String,
    },

    /// Deactivate the kill switch
    Resume,

    /// Pause trading for a duration
    Pause {
        #[arg(default_value = "60")]
        minutes: i64,

        #[arg(default_value = "Manual pause")]
        reason: String,
    },

    /// Manually reset the circuit breaker
    ResetBreaker,
}

fn parse_decimal(value: f64, what: &str) -> Result<Decimal> {
    Decimal::try_from(value).with_context(|| format!("invalid {what}: {value}"))
}

fn parse_targets(raw: &str) -> Result<Vec<Decimal>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Decimal::from_str(s).with_context(|| format!("invalid target price: {s}")))
        .collect()
}

/// Wire the orchestrator with its collaborators, restoring persisted state.
async fn build_orchestrator(
    db: Arc<Database>,
    store: Arc<dyn PositionStore>,
    exchange: Arc<PaperExchange>,
    webhook: Option<String>,
) -> Result<(Arc<Orchestrator>, Arc<RwLock<SafetyManager>>)> {
    let safety = match db.load_safety_state().await? {
        Some(state) => state,
        None => SafetyManager::default(),
    };
    let safety = Arc::new(RwLock::new(safety));

    let notifier = match webhook {
        Some(url) => Notifier::new(Some(url))?,
        None => Notifier::disabled(),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        exchange,
        store,
        safety.clone(),
        Arc::new(RwLock::new(AccountRegistry::with_default_account())),
        notifier,
    ));
    Ok((orchestrator, safety))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db = Arc::new(Database::new(&cli.database).await?);

    match cli.command {
        Commands::Run {
            interval,
            webhook,
            balance,
            dry_run,
        } => {
            let exchange = Arc::new(PaperExchange::new(parse_decimal(balance, "balance")?));
            let store: Arc<dyn PositionStore> = if dry_run {
                Arc::new(MemoryStore::new())
            } else {
                db.clone()
            };
            let (orchestrator, _) =
                build_orchestrator(db.clone(), store, exchange, webhook).await?;

            let bot = Bot::new(
                BotConfig {
                    tick_interval_secs: interval,
                },
                orchestrator,
                if dry_run { None } else { Some(db) },
            );
            bot.initialize().await?;
            bot.run().await?;
        }

        Commands::Signal {
            symbol,
            side,
            entry,
            leverage,
            stop_loss,
            targets,
            owner,
        } => {
            let side = PositionSide::parse(&side)
                .context("side must be LONG or SHORT")?;
            let exchange = Arc::new(PaperExchange::new(dec!(1000)));
            if let Some(price) = entry {
                exchange.set_price(&symbol, parse_decimal(price, "entry")?).await;
            }
            let (orchestrator, safety) =
                build_orchestrator(db.clone(), db.clone(), exchange, None).await?;
            orchestrator.restore_from_store().await?;

            let mut signal = TradeSignal::new(symbol.as_str(), side).with_leverage(leverage);
            if let Some(price) = entry {
                signal = signal.with_entry(parse_decimal(price, "entry")?);
            }
            if let Some(price) = stop_loss {
                signal = signal.with_stop_loss(parse_decimal(price, "stop loss")?);
            }
            if let Some(raw) = targets {
                signal = signal.with_targets(parse_targets(&raw)?);
            }

            match orchestrator.execute_signal(&owner, &signal).await {
                Ok(report) => {
                    println!(
                        "Opened {} {} @ {} (qty {}, {}x) -> position {}",
                        report.side.as_str(),
                        report.symbol,
                        report.entry_price,
                        report.quantity,
                        report.leverage,
                        report.position_id
                    );
                    db.log_trade_event(
                        &report.position_id,
                        &owner,
                        "position_opened",
                        &format!("Opened {} {}", report.side.as_str(), report.symbol),
                        None,
                    )
                    .await?;
                }
                Err(e) => {
                    warn!(error = %e, "signal rejected");
                    println!("Signal rejected: {e}");
                }
            }
            db.save_safety_state(&*safety.read().await).await?;
        }

        Commands::Status => {
            let counts = db.count_by_status().await?;
            println!("=== Positions ===");
            if counts.is_empty() {
                println!("(none)");
            }
            for (status, count) in counts {
                println!("{status:<18} {count}");
            }

            let mut safety = match db.load_safety_state().await? {
                Some(state) => state,
                None => SafetyManager::default(),
            };
            println!("\n=== Safety ===");
            println!("{}", safety.status_summary());

            let log = db.recent_trade_log(5).await?;
            if !log.is_empty() {
                println!("\n=== Recent activity ===");
                for row in log {
                    println!(
                        "{} {} {} {}",
                        row.created_at, row.event, row.position_id, row.message
                    );
                }
            }
        }

        Commands::Positions => {
            let positions = db.list_active().await?;
            if positions.is_empty() {
                println!("No open positions");
            }
            for p in positions {
                println!(
                    "{} {} {} qty {} avg {} status {} pnl {}",
                    p.id,
                    p.symbol,
                    p.side.as_str(),
                    p.remaining_qty,
                    p.avg_entry,
                    p.status.as_str(),
                    p.realized_pnl
                );
            }
        }

        Commands::Close { position_id, price } => {
            let exchange = Arc::new(PaperExchange::new(dec!(1000)));
            if let Some(close_price) = price {
                if let Some(position) = db.get(&position_id).await? {
                    exchange
                        .set_price(&position.symbol, parse_decimal(close_price, "price")?)
                        .await;
                }
            }
            let (orchestrator, safety) =
                build_orchestrator(db.clone(), db.clone(), exchange, None).await?;
            orchestrator.restore_from_store().await?;

            match orchestrator.close_position(&position_id, "manual close").await {
                Ok(outcome) => {
                    println!(
                        "Closed {} qty {} @ {} (pnl {})",
                        position_id, outcome.closed_qty, outcome.exit_price, outcome.pnl
                    );
                    db.log_trade_event(
                        &position_id,
                        "default",
                        "manual_closed",
                        "Manual close",
                        Some(outcome.pnl),
                    )
                    .await?;
                }
                Err(e) => println!("Close failed: {e}"),
            }
            db.save_safety_state(&*safety.read().await).await?;
        }

        Commands::Safety { action } => {
            let mut safety = match db.load_safety_state().await? {
                Some(state) => state,
                None => SafetyManager::default(),
            };
            match action {
                SafetyAction::Status => println!("{}", safety.status_summary()),
                SafetyAction::Kill { reason } => {
                    safety.activate_kill_switch(&reason);
                    println!("Kill switch activated: {reason}");
                }
                SafetyAction::Resume => {
                    safety.deactivate_kill_switch();
                    println!("Kill switch deactivated");
                }
                SafetyAction::Pause { minutes, reason } => {
                    safety.pause_trading(chrono::Duration::minutes(minutes), &reason);
                    println!("Trading paused for {minutes} minutes");
                }
                SafetyAction::ResetBreaker => {
                    safety.deactivate_circuit_breaker();
                    println!("Circuit breaker reset");
                }
            }
            db.save_safety_state(&safety).await?;
        }
    }

    info!("done");
    Ok(())
}
