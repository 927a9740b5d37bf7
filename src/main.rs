//! Signal copier
//!
//! Polls remote trading-signal sources and reconciles each configured broker
//! account against them: opens missing trades, syncs stop-loss/take-profit
//! levels and closes trades whose signal was withdrawn.

mod api;
mod bot;
mod broker;
mod config;
mod db;
mod error;
mod models;
mod telemetry;
mod trading;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bot::Supervisor;
use crate::config::{GatewayConfig, Settings};
use crate::db::Journal;
use crate::trading::TagFamily;

const DEFAULT_SEPARATOR: &str = "752";

/// Signal copier CLI.
#[derive(Parser)]
#[command(name = "sigcopier")]
#[command(about = "Copy remote trading signals onto broker accounts", long_about = None)]
struct Cli {
    /// Settings file (JSON)
    #[arg(short, long, global = true, env = "SIGCOPIER_CONFIG", default_value = "settings.json")]
    config: PathBuf,

    /// Override the signal API base URL from the settings file
    #[arg(long, global = true, env = "SIGCOPIER_SIGNAL_API_URL")]
    signal_api_url: Option<String>,

    /// Journal database URL
    #[arg(
        short,
        long,
        global = true,
        env = "SIGCOPIER_JOURNAL",
        default_value = "sqlite:./sigcopier.db?mode=rwc"
    )]
    journal: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Also write JSON logs to this file
    #[arg(long, global = true, env = "SIGCOPIER_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start reconciling every configured account
    Run {
        /// Log intended broker requests instead of sending them
        #[arg(long)]
        dry_run: bool,

        /// Run a single cycle per account, then exit
        #[arg(long)]
        once: bool,

        /// Only drive this account login
        #[arg(short, long)]
        account: Option<u64>,
    },

    /// Show the effective configuration (passwords masked)
    Config,

    /// Show journal totals and recent failed actions
    Status {
        /// Number of failed actions to list
        #[arg(short = 'n', long, default_value = "10")]
        failures: i64,
    },

    /// Compute the correlation tag of a signal
    Tag {
        /// Trader id (digits)
        trader: String,

        /// Signal id (digits)
        signal: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    telemetry::init_tracing(&cli.log_level, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Run {
            dry_run,
            once,
            account,
        } => {
            let settings = load_settings(&cli.config, cli.signal_api_url.as_deref())?;
            if let Some(login) = account {
                settings
                    .account(login)
                    .with_context(|| format!("Account {login} is not configured"))?;
            }

            let journal = match Journal::new(&cli.journal).await {
                Ok(journal) => Some(journal),
                Err(e) => {
                    warn!(error = %e, "Journal unavailable, continuing without it");
                    None
                }
            };

            println!("\n=== Signal Copier ===");
            println!("Signal API:       {}", settings.signal_api_url);
            println!("Accounts:         {}", settings.accounts.len());
            println!("Polling interval: {}s", settings.poll_interval_secs);
            println!("Mode: {}", if dry_run { "DRY RUN (no real trades)" } else { "LIVE TRADING" });
            if !once {
                println!("\nPress Ctrl+C to stop.\n");
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received shutdown signal, stopping drivers");
                    let _ = shutdown_tx.send(true);
                }
            });

            let failed = Supervisor::new(settings)
                .dry_run(dry_run)
                .once(once)
                .only_login(account)
                .with_journal(journal)
                .run(shutdown_rx)
                .await?;

            if failed > 0 {
                anyhow::bail!("{failed} account driver(s) failed to start");
            }
        }

        Commands::Config => {
            let settings = load_settings(&cli.config, cli.signal_api_url.as_deref())?;

            println!("\n=== Signal Copier Configuration ===\n");
            println!("Signal API:          {}", settings.signal_api_url);
            println!("Tag separator:       {}", settings.separator);
            println!("Poll interval:       {}s", settings.poll_interval_secs);
            println!("History window:      {} days", settings.history_days);
            println!("Fetch timeout:       {}s", settings.fetch_timeout_secs);
            println!("Broker timeout:      {}s", settings.broker_timeout_secs);
            println!("Batched fetch:       {}", settings.batch_fetch);

            for account in &settings.accounts {
                println!("\n--- Account {} ({}) ---", account.login, account.bot_name);
                println!("  Server:            {}", account.server);
                match &account.gateway {
                    GatewayConfig::Bridge { url } => println!("  Gateway:           bridge {url}"),
                    GatewayConfig::Paper { balance, quotes } => println!(
                        "  Gateway:           paper (balance {balance}, {} quotes)",
                        quotes.len()
                    ),
                }
                println!("  Volume coefficient: {}", account.volume_coefficient);
                println!("  Symbol postfix:    {:?}", account.symbol_postfix);
                println!("  Max signal age:    {} min", account.max_signal_age_minutes);
                println!("  Max price drift:   {} pips", account.max_price_drift_pips);
                println!("  Master traders:");
                for (trader, source) in &account.master_traders {
                    println!("    {trader:<20} {source}");
                }
            }

            println!("\n=== Raw (redacted) ===\n");
            println!("{}", serde_json::to_string_pretty(&settings.redacted())?);
        }

        Commands::Status { failures } => {
            let journal = Journal::new(&cli.journal).await?;
            let summary = journal.summary().await?;

            if summary.is_empty() {
                println!("No cycles journaled yet. Run 'sigcopier run' to start.");
                return Ok(());
            }

            println!("\n=== Accounts ===");
            println!(
                "\n{:<12} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
                "LOGIN", "CYCLES", "ABORTED", "CREATED", "UPDATED", "CLOSED", "FAILED", "LAST CYCLE"
            );
            println!("{}", "-".repeat(96));
            for row in &summary {
                println!(
                    "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
                    row.login,
                    row.cycles,
                    row.aborted_cycles,
                    row.creates,
                    row.updates,
                    row.closes,
                    row.failures,
                    row.last_cycle_at.as_deref().unwrap_or("Never")
                );
            }

            let failed = journal.recent_failures(failures).await?;
            if !failed.is_empty() {
                println!("\n=== Recent Failures ===");
                for action in &failed {
                    println!(
                        "  [{}] {} {} tag {} {} retcode {} ({})",
                        action.created_at,
                        action.login,
                        action.kind,
                        action.tag,
                        action.symbol,
                        action
                            .retcode
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        truncate(&action.comment, 60)
                    );
                }
            }
        }

        Commands::Tag { trader, signal } => {
            let separator = Settings::load(&cli.config)
                .map(|s| s.separator)
                .unwrap_or_else(|_| DEFAULT_SEPARATOR.to_string());

            let family = TagFamily::new(trader, separator)?;
            let tag = family.tag(&signal)?;
            println!("{tag}");
        }
    }

    Ok(())
}

fn load_settings(path: &Path, signal_api_url: Option<&str>) -> Result<Settings> {
    let mut settings = Settings::load(path)?;
    if let Some(url) = signal_api_url {
        settings.signal_api_url = url.to_string();
    }
    Ok(settings)
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
