//! Market data: quotes and price history

use anyhow::{Context, Result};

use super::client::{ApiError, RequestExecutor};
use crate::models::{PriceHistory, QuoteResponse};

/// Optional price history shaping; unset fields use the server defaults.
#[derive(Debug, Clone, Default)]
pub struct HistoryParams {
    /// day, month, year or ytd
    pub period_type: Option<String>,
    pub period: Option<u32>,
    /// minute, daily, weekly or monthly
    pub frequency_type: Option<String>,
    pub frequency: Option<u32>,
}

impl HistoryParams {
    fn query(&self, symbol: &str) -> Vec<(&'static str, String)> {
        let mut query = vec![("symbol", symbol.to_string())];
        if let Some(v) = &self.period_type {
            query.push(("periodType", v.clone()));
        }
        if let Some(v) = self.period {
            query.push(("period", v.to_string()));
        }
        if let Some(v) = &self.frequency_type {
            query.push(("frequencyType", v.clone()));
        }
        if let Some(v) = self.frequency {
            query.push(("frequency", v.to_string()));
        }
        query
    }
}

/// Fetch quotes for one or more symbols.
pub async fn get_quotes(
    executor: &RequestExecutor,
    symbols: &[String],
) -> Result<QuoteResponse, ApiError> {
    let symbols = symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .collect::<Vec<_>>()
        .join(",");
    tracing::debug!("Fetching quotes for {}", symbols);
    executor
        .get_json("/marketdata/v1/quotes", &[("symbols", symbols)])
        .await
}

pub async fn get_price_history(
    executor: &RequestExecutor,
    symbol: &str,
    params: &HistoryParams,
) -> Result<PriceHistory, ApiError> {
    let symbol = symbol.trim().to_uppercase();
    executor
        .get_json("/marketdata/v1/pricehistory", &params.query(&symbol))
        .await
}

/// Print quotes (stdout).
pub async fn print_quotes(executor: &RequestExecutor, symbols: &[String]) -> Result<()> {
    let quotes = get_quotes(executor, symbols)
        .await
        .context("Failed to fetch quotes")?;

    println!(
        "\n{:<10} {:>12} {:>12} {:>12} {:>10} {:>14}",
        "Symbol", "Last", "Bid", "Ask", "Change", "Volume"
    );
    println!("{:-<75}", "");

    if quotes.is_empty() {
        println!("  (no quotes returned)");
        return Ok(());
    }

    for (symbol, entry) in &quotes {
        let q = entry.quote.clone().unwrap_or_default();
        println!(
            "{:<10} {:>12} {:>12} {:>12} {:>10} {:>14}",
            symbol,
            price(q.last_price),
            price(q.bid_price),
            price(q.ask_price),
            price(q.net_change),
            q.total_volume.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

pub async fn print_price_history(
    executor: &RequestExecutor,
    symbol: &str,
    params: &HistoryParams,
) -> Result<()> {
    let history = get_price_history(executor, symbol, params)
        .await
        .context("Failed to fetch price history")?;

    let name = history.symbol.as_deref().unwrap_or(symbol);
    println!("\nPrice history for {}:", name);
    println!("{:-<80}", "");

    if history.empty || history.candles.is_empty() {
        println!("  (no candles)");
        return Ok(());
    }

    println!(
        "{:<26} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "Time", "Open", "High", "Low", "Close", "Volume"
    );
    for c in &history.candles {
        let time = chrono::DateTime::from_timestamp_millis(c.datetime)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| c.datetime.to_string());
        println!(
            "{:<26} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>10}",
            time, c.open, c.high, c.low, c.close, c.volume
        );
    }
    Ok(())
}

fn price(v: Option<f64>) -> String {
    v.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".into())
}
