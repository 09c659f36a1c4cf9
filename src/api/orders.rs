//! Trader API: orders

use anyhow::{Context, Result};
use reqwest::Method;

use super::client::{ApiError, RequestExecutor};
use crate::models::{order_id_from_location, Order};

fn orders_path(account_hash: &str) -> String {
    format!("/trader/v1/accounts/{}/orders", account_hash)
}

/// Orders entered for an account within `[from, to]` (ISO-8601).
pub async fn list_orders(
    executor: &RequestExecutor,
    account_hash: &str,
    from: &str,
    to: &str,
) -> Result<Vec<Order>, ApiError> {
    executor
        .get_json(
            &orders_path(account_hash),
            &[
                ("fromEnteredTime", from.to_string()),
                ("toEnteredTime", to.to_string()),
            ],
        )
        .await
}

/// Submit an order. Returns the new order id when the server reports one
/// in the `Location` header.
pub async fn place_order(
    executor: &RequestExecutor,
    account_hash: &str,
    order: &serde_json::Value,
) -> Result<Option<i64>, ApiError> {
    let resp = executor
        .send(Method::POST, &orders_path(account_hash), &[], Some(order))
        .await?;
    let id = resp.location.as_deref().and_then(order_id_from_location);
    if id.is_none() {
        tracing::warn!("Order accepted (HTTP {}) but no order id was returned", resp.status);
    }
    Ok(id)
}

pub async fn cancel_order(
    executor: &RequestExecutor,
    account_hash: &str,
    order_id: i64,
) -> Result<(), ApiError> {
    let path = format!("{}/{}", orders_path(account_hash), order_id);
    executor.send(Method::DELETE, &path, &[], None).await?;
    Ok(())
}

/// List the last `days` of orders (prints to stdout).
pub async fn print_orders(executor: &RequestExecutor, account_hash: &str, days: i64) -> Result<()> {
    let (from, to) = order_window(chrono::Utc::now(), days)?;
    let orders = list_orders(
        executor,
        account_hash,
        &from.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        &to.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    )
    .await
    .context("Failed to fetch orders")?;

    println!("\nOrders (last {} days):", days);
    println!("{:-<80}", "");

    if orders.is_empty() {
        println!("  (no orders found)");
        return Ok(());
    }

    for order in &orders {
        println!(
            "{:<14} {:<10} {:<8} {}",
            order.order_id.map(|id| id.to_string()).unwrap_or_else(|| "?".into()),
            order.status.as_deref().unwrap_or("?"),
            order.order_type.as_deref().unwrap_or("?"),
            order.summary()
        );
        if let Some(t) = &order.entered_time {
            println!("  Entered: {}", t);
        }
    }

    Ok(())
}

/// `[now - days, now]`, rejecting spans chrono cannot represent.
fn order_window(
    now: chrono::DateTime<chrono::Utc>,
    days: i64,
) -> Result<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)> {
    let span = chrono::Duration::try_days(days)
        .with_context(|| format!("--days {} is out of range", days))?;
    let from = now
        .checked_sub_signed(span)
        .with_context(|| format!("--days {} is out of range", days))?;
    Ok((from, now))
}

/// Place an order read from a JSON file
pub async fn place_order_from_file(
    executor: &RequestExecutor,
    account_hash: &str,
    path: &std::path::Path,
) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read order file {}", path.display()))?;
    let order: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Order file {} is not valid JSON", path.display()))?;

    match place_order(executor, account_hash, &order)
        .await
        .context("Failed to place order")?
    {
        Some(id) => println!("Order placed: {}", id),
        None => println!("Order placed."),
    }
    Ok(())
}
