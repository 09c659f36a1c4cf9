//! trader-cli - Lightweight brokerage client
//!
//! Market data, accounts and orders from the terminal, with an OAuth
//! session that refreshes itself.

mod api;
mod auth;
mod config;
mod models;

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::client::{ApiError, RequestExecutor};
use api::market_data::HistoryParams;
use auth::commands::Interaction;
use auth::AuthError;
use config::Config;

#[derive(Parser)]
#[command(name = "trader-cli")]
#[command(about = "Lightweight CLI client for a brokerage trading API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use this bearer token instead of the stored session
    #[arg(long, global = true, env = "TRADER_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config template to fill in
    Init {
        /// Overwrite an existing config file
        #[arg(short, long)]
        force: bool,
    },

    /// Authenticate with the brokerage
    Login {
        /// Re-authorize even if a valid credential is stored
        #[arg(short, long)]
        force: bool,

        /// Paste the redirected URL instead of running a local listener
        #[arg(long, conflicts_with = "no_browser")]
        manual: bool,

        /// Print the authorization URL without opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Log out and clear stored credentials
    Logout,

    /// Show current authentication status
    Status,

    /// Get quotes for one or more symbols
    Quote {
        #[arg(required = true)]
        symbols: Vec<String>,
    },

    /// Show price history for a symbol
    History {
        symbol: String,

        /// day, month, year or ytd
        #[arg(long)]
        period_type: Option<String>,

        #[arg(long)]
        period: Option<u32>,

        /// minute, daily, weekly or monthly
        #[arg(long)]
        frequency_type: Option<String>,

        #[arg(long)]
        frequency: Option<u32>,
    },

    /// List accounts with balances and positions
    Accounts,

    /// List recent orders
    Orders {
        /// Account number or hash (default: all accounts)
        #[arg(short, long)]
        account: Option<String>,

        /// How many days back to look
        #[arg(short, long, default_value = "7", value_parser = clap::value_parser!(i64).range(1..=3650))]
        days: i64,
    },

    /// Place an order described by a JSON file
    PlaceOrder {
        /// Account number or hash
        #[arg(short, long)]
        account: String,

        /// Order JSON
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Cancel an open order
    CancelOrder {
        /// Account number or hash
        #[arg(short, long)]
        account: String,

        #[arg(short, long)]
        order_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = match &cli.config {
        Some(p) => p.clone(),
        None => Config::default_path()?,
    };

    let result = run(cli.command, &config_path, cli.access_token.as_deref()).await;
    if let Err(err) = &result {
        if let Some(auth_err) = auth_failure(err) {
            auth::commands::print_manual_fallback(auth_err);
        }
    }
    result
}

async fn run(command: Commands, config_path: &Path, access_token: Option<&str>) -> Result<()> {
    if let Commands::Init { force } = command {
        return init(config_path, force);
    }
    let config = &Config::load(Some(config_path))?;

    match command {
        Commands::Init { .. } => {}
        Commands::Login {
            force,
            manual,
            no_browser,
        } => {
            let interaction = if manual {
                Interaction::Manual
            } else if no_browser {
                Interaction::NoBrowser
            } else {
                Interaction::Browser
            };
            tracing::info!("Starting authentication flow...");
            auth::login(config, force, interaction).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            auth::logout(config).await?;
        }
        Commands::Status => {
            auth::status(config).await?;
        }
        Commands::Quote { symbols } => {
            let executor = api::executor(config, access_token)?;
            api::market_data::print_quotes(&executor, &symbols).await?;
        }
        Commands::History {
            symbol,
            period_type,
            period,
            frequency_type,
            frequency,
        } => {
            let executor = api::executor(config, access_token)?;
            let params = HistoryParams {
                period_type,
                period,
                frequency_type,
                frequency,
            };
            api::market_data::print_price_history(&executor, &symbol, &params).await?;
        }
        Commands::Accounts => {
            let executor = api::executor(config, access_token)?;
            api::accounts::print_accounts(&executor).await?;
        }
        Commands::Orders { account, days } => {
            let executor = api::executor(config, access_token)?;
            for hash in account_hashes(&executor, account.as_deref()).await? {
                api::orders::print_orders(&executor, &hash, days).await?;
            }
        }
        Commands::PlaceOrder { account, file } => {
            let executor = api::executor(config, access_token)?;
            let hash = api::accounts::resolve_account_hash(&executor, &account).await?;
            tracing::info!("Placing order from {}...", file.display());
            api::orders::place_order_from_file(&executor, &hash, &file).await?;
        }
        Commands::CancelOrder { account, order_id } => {
            let executor = api::executor(config, access_token)?;
            let hash = api::accounts::resolve_account_hash(&executor, &account).await?;
            api::orders::cancel_order(&executor, &hash, order_id).await?;
            println!("Order {} cancelled.", order_id);
        }
    }

    Ok(())
}

/// Hash for `account`, or every linked account when none is given.
async fn account_hashes(executor: &RequestExecutor, account: Option<&str>) -> Result<Vec<String>> {
    match account {
        Some(a) => Ok(vec![api::accounts::resolve_account_hash(executor, a).await?]),
        None => Ok(api::accounts::get_account_numbers(executor)
            .await?
            .into_iter()
            .map(|n| n.hash_value)
            .collect()),
    }
}

/// The authentication failure behind `err`, if that is what stopped us.
fn auth_failure(err: &anyhow::Error) -> Option<&AuthError> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<AuthError>() {
            return Some(e);
        }
        match cause.downcast_ref::<ApiError>() {
            Some(ApiError::Auth(e)) => Some(e),
            _ => None,
        }
    })
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Config already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote config template to {}", path.display());
    println!("Set client_id and client_secret, then run 'trader-cli login'.");
    Ok(())
}
