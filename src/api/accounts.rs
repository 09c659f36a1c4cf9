//! Trader API: accounts and positions

use anyhow::{Context, Result};

use super::client::{ApiError, RequestExecutor};
use crate::models::{Account, AccountNumber};

/// Account numbers with their path hashes
pub async fn get_account_numbers(
    executor: &RequestExecutor,
) -> Result<Vec<AccountNumber>, ApiError> {
    executor
        .get_json("/trader/v1/accounts/accountNumbers", &[])
        .await
}

/// All linked accounts, including positions
pub async fn get_accounts(executor: &RequestExecutor) -> Result<Vec<Account>, ApiError> {
    executor
        .get_json("/trader/v1/accounts", &[("fields", "positions".to_string())])
        .await
}

/// Resolve a plain account number to its hash. A value that is already a
/// known hash is returned unchanged.
pub async fn resolve_account_hash(executor: &RequestExecutor, account: &str) -> Result<String> {
    let numbers = get_account_numbers(executor)
        .await
        .context("Failed to fetch account numbers")?;
    numbers
        .into_iter()
        .find(|n| n.account_number == account || n.hash_value == account)
        .map(|n| n.hash_value)
        .with_context(|| format!("Account '{}' not found", account))
}

/// List accounts with balances and positions (prints to stdout).
pub async fn print_accounts(executor: &RequestExecutor) -> Result<()> {
    let numbers = get_account_numbers(executor)
        .await
        .context("Failed to fetch account numbers")?;
    let accounts = get_accounts(executor)
        .await
        .context("Failed to fetch accounts")?;

    println!("\nAccounts:");
    println!("{:-<60}", "");

    if accounts.is_empty() {
        println!("  (no accounts found)");
        return Ok(());
    }

    for account in &accounts {
        let sa = &account.securities_account;
        let hash = numbers
            .iter()
            .find(|n| n.account_number == sa.account_number)
            .map(|n| n.hash_value.as_str())
            .unwrap_or("?");
        println!(
            "{} ({})",
            mask(&sa.account_number),
            sa.account_type.as_deref().unwrap_or("unknown")
        );
        println!("  Hash: {}", hash);
        if let Some(b) = &sa.current_balances {
            if let Some(v) = b.liquidation_value {
                println!("  Liquidation value: {:.2}", v);
            }
            if let Some(v) = b.cash_balance {
                println!("  Cash: {:.2}", v);
            }
        }
        for p in &sa.positions {
            println!(
                "  {:<10} {:>10} @ {:>10}  value {:>12}",
                p.instrument.symbol.as_deref().unwrap_or("?"),
                p.net_quantity(),
                p.average_price.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".into()),
                p.market_value.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".into()),
            );
        }
        println!();
    }

    Ok(())
}

/// Show only the last four digits.
fn mask(account_number: &str) -> String {
    let visible: String = account_number
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{}", visible)
}
