//! Solana Copy-Trading Engine
//!
//! Watches a set of Solana wallets and mirrors their outgoing transfers onto
//! a controlled wallet, scaled by each wallet's allocation percentage.

mod db;
mod engine;
mod ledger;
mod models;
mod trading;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::db::Database;
use crate::engine::{DetectionMode, Engine, EngineConfig, EngineContext, ReconnectPolicy};
use crate::ledger::{LedgerClient, RpcLedger, RpcLedgerConfig, TimeoutLedger};
use crate::models::{asset_label, TokenId, WalletStatus};
use crate::trading::SizingConfig;

/// Solana copy-trading engine CLI.
#[derive(Parser)]
#[command(name = "solcopier")]
#[command(about = "Mirror transfers of watched Solana wallets onto your own", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "SOLCOPIER_DATABASE", default_value = "sqlite:./solcopier.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Solana JSON-RPC endpoint
    #[arg(long, env = "SOLANA_RPC_URL", default_value = ledger::DEFAULT_RPC_URL)]
    rpc_url: String,

    /// Solana PubSub endpoint (derived from the RPC URL when unset)
    #[arg(long, env = "SOLANA_WS_URL")]
    ws_url: Option<String>,

    /// Keypair file of the controlled wallet
    #[arg(long, env = "SOLANA_KEYPAIR_PATH")]
    keypair: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a wallet to monitor
    Track {
        /// Wallet address (base58)
        address: String,

        /// Allocation percentage (0-100)
        #[arg(short, long)]
        allocation: Option<Decimal>,
    },

    /// Stop monitoring a wallet
    Untrack {
        /// Wallet address (base58)
        address: String,
    },

    /// List monitored wallets
    List,

    /// Set a wallet's allocation percentage
    Allocate {
        /// Wallet address (base58)
        address: String,

        /// Allocation percentage (0-100)
        percentage: Decimal,
    },

    /// Show the SOL or token balance of a wallet
    Balance {
        /// Wallet address; defaults to the controlled wallet
        address: Option<String>,

        /// Token mint address
        #[arg(short, long)]
        token: Option<String>,
    },

    /// Start the replication engine
    Run {
        #[command(flatten)]
        engine: EngineArgs,

        /// Seconds between status tables
        #[arg(long, default_value = "30")]
        status_interval: u64,
    },

    /// Show current configuration
    Config {
        #[command(flatten)]
        engine: EngineArgs,
    },
}

/// Engine tuning flags, shared by `run` and `config`.
#[derive(clap::Args)]
struct EngineArgs {
    /// Detection mode (push or poll)
    #[arg(short, long, env = "COPY_MODE", default_value = "push")]
    mode: DetectionMode,

    /// Dry run (don't submit transfers)
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Seconds between directory reconciliations
    #[arg(long, env = "RECONCILE_INTERVAL", default_value = "10")]
    reconcile_interval: u64,

    /// Seconds between history polls (poll mode)
    #[arg(long, env = "POLL_INTERVAL", default_value = "10")]
    poll_interval: u64,

    /// History entries fetched per poll
    #[arg(long, env = "HISTORY_LIMIT", default_value = "20")]
    history_limit: usize,

    /// Seconds before a ledger call times out
    #[arg(long, env = "CALL_TIMEOUT", default_value = "15")]
    call_timeout: u64,

    /// Reconnect attempts before a wallet task gives up
    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value = "5")]
    max_attempts: u32,

    /// Smallest order worth submitting
    #[arg(long, env = "MIN_ORDER_AMOUNT", default_value = "0.000001")]
    min_order: Decimal,

    /// Largest single order
    #[arg(long, env = "MAX_ORDER_AMOUNT")]
    max_order: Option<Decimal>,
}

impl EngineArgs {
    fn to_config(&self) -> EngineConfig {
        EngineConfig {
            reconcile_interval: Duration::from_secs(self.reconcile_interval.max(1)),
            mode: self.mode,
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
            history_limit: self.history_limit,
            call_timeout: Duration::from_secs(self.call_timeout.max(1)),
            reconnect: ReconnectPolicy {
                max_attempts: self.max_attempts,
                ..Default::default()
            },
            sizing: SizingConfig {
                min_order_amount: self.min_order,
                max_order_amount: self.max_order,
            },
            dry_run: self.dry_run,
        }
    }
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

    let ledger_config = RpcLedgerConfig {
        rpc_url: cli.rpc_url.clone(),
        ws_url: cli.ws_url.clone(),
        keypair_path: cli.keypair.clone(),
        ..Default::default()
    };

    let db = Database::new(&cli.database).await?;

    match cli.command {
        Commands::Track {
            address,
            allocation,
        } => {
            let ledger = RpcLedger::new(RpcLedgerConfig {
                keypair_path: None,
                ..ledger_config
            })?;
            if !ledger.is_valid_address(&address) {
                bail!("Invalid Solana address: {}", address);
            }

            let wallet = db.add_wallet(&address, allocation).await?;
            println!(
                "Now tracking: {} ({}% allocation)",
                wallet.display_name(),
                wallet.allocation_percentage
            );
        }

        Commands::Untrack { address } => {
            db.remove_wallet(&address).await?;
            println!("Stopped tracking: {}", address.trim());
        }

        Commands::List => {
            let wallets = db.get_wallets().await?;

            if wallets.is_empty() {
                println!("No wallets being tracked. Use 'solcopier track <address>' to add one.");
                return Ok(());
            }

            println!("\n{:<46} {:>10}  {:<20}", "ADDRESS", "ALLOC%", "ADDED");
            println!("{}", "-".repeat(80));

            for wallet in wallets {
                println!(
                    "{:<46} {:>9.1}%  {:<20}",
                    wallet.address, wallet.allocation_percentage, wallet.created_at
                );
            }
        }

        Commands::Allocate {
            address,
            percentage,
        } => {
            db.set_allocation(&address, percentage).await?;
            println!("Allocation for {} set to {}%", address.trim(), percentage);
        }

        Commands::Balance { address, token } => {
            let ledger = RpcLedger::new(ledger_config)?;
            let address = match address {
                Some(address) => address,
                None if ledger.has_signer() => ledger.own_address(),
                None => bail!("No address given and no keypair configured"),
            };
            let token_id = token.map(TokenId::new);

            let balance = ledger
                .get_balance(&address, token_id.clone())
                .await
                .with_context(|| format!("Failed to fetch balance of {}", address))?;
            println!("{}: {} {}", address, balance, asset_label(token_id.as_ref()));
        }

        Commands::Run {
            engine: args,
            status_interval,
        } => {
            let config = args.to_config();

            if ledger_config.keypair_path.is_none() {
                bail!("A keypair is required to run the engine (--keypair or SOLANA_KEYPAIR_PATH)");
            }

            let wallets = db.get_wallets().await?;
            if wallets.is_empty() {
                println!("No wallets being tracked yet. Wallets added with 'solcopier track <address>' are picked up while running.");
            }

            let rpc = RpcLedger::new(ledger_config)?;
            let own_address = rpc.own_address();
            let ledger: Arc<dyn LedgerClient> =
                Arc::new(TimeoutLedger::new(Arc::new(rpc), config.call_timeout));

            println!("\n=== Solana Copy-Trading Engine ===");
            println!("Controlled wallet: {}", own_address);
            println!("Detection mode: {}", config.mode);
            println!(
                "Mode: {}",
                if config.dry_run { "DRY RUN (no real transfers)" } else { "LIVE TRADING" }
            );
            println!("Tracked wallets: {}", wallets.len());
            println!("\nPress Ctrl+C to stop.\n");

            let engine = Engine::new(EngineContext::new(ledger, Arc::new(db), config));
            engine.start().await;

            let mut ticker = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => print_status(&engine.status().await),
                }
            }

            let finals = engine.stop().await;
            println!("\nFinal status:");
            print_status(&finals);
        }

        Commands::Config { engine: args } => {
            let config = args.to_config();
            let ws_url = ledger_config.ws_endpoint();

            println!("\n=== Ledger ===");
            println!("  RPC URL:              {}", ledger_config.rpc_url);
            println!("  WebSocket URL:        {}", ws_url);
            println!(
                "  Keypair:              {}",
                ledger_config
                    .keypair_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!("  Commitment:           {}", ledger_config.commitment);

            println!("\n=== Engine ===");
            println!("  Detection Mode:       {}", config.mode);
            println!("  Dry Run:              {}", config.dry_run);
            println!("  Reconcile Interval:   {:?}", config.reconcile_interval);
            println!("  Poll Interval:        {:?}", config.poll_interval);
            println!("  History Limit:        {}", config.history_limit);
            println!("  Call Timeout:         {:?}", config.call_timeout);

            println!("\n=== Reconnect ===");
            println!("  Initial Delay:        {:?}", config.reconnect.initial_delay);
            println!("  Multiplier:           {}", config.reconnect.multiplier);
            println!("  Max Delay:            {:?}", config.reconnect.max_delay);
            println!("  Jitter:               {}", config.reconnect.jitter);
            println!("  Max Attempts:         {}", config.reconnect.max_attempts);

            println!("\n=== Sizing ===");
            println!("  Min Order:            {}", config.sizing.min_order_amount);
            println!(
                "  Max Order:            {}",
                config
                    .sizing
                    .max_order_amount
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "(none)".to_string())
            );
        }
    }

    Ok(())
}

fn print_status(statuses: &[WalletStatus]) {
    if statuses.is_empty() {
        println!("(no wallet tasks running)");
        return;
    }

    println!(
        "\n{:<14} {:<13} {:>8} {:>8} {:>8} {:>8}  {}",
        "WALLET", "STATE", "SEEN", "DONE", "FAILED", "SKIPPED", "LAST"
    );
    println!("{}", "-".repeat(80));
    for status in statuses {
        println!("{}", status);
    }
}
