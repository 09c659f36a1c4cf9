//! Market data models

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Response of the quotes endpoint, keyed by symbol
pub type QuoteResponse = BTreeMap<String, QuoteEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteEntry {
    pub symbol: Option<String>,
    pub asset_main_type: Option<String>,
    pub quote: Option<Quote>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub last_price: Option<f64>,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub net_change: Option<f64>,
    pub total_volume: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceHistory {
    pub symbol: Option<String>,
    #[serde(default)]
    pub candles: Vec<Candle>,
    #[serde(default)]
    pub empty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: u64,
    /// Epoch milliseconds
    pub datetime: i64,
}
