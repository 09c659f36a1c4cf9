//! Account models

use serde::{Deserialize, Serialize};

/// Plain account number and the hash the trader endpoints expect in paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountNumber {
    pub account_number: String,
    pub hash_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub securities_account: SecuritiesAccount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritiesAccount {
    pub account_number: String,
    #[serde(rename = "type")]
    pub account_type: Option<String>,
    #[serde(default)]
    pub positions: Vec<Position>,
    pub current_balances: Option<Balances>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[serde(default)]
    pub long_quantity: f64,
    #[serde(default)]
    pub short_quantity: f64,
    pub average_price: Option<f64>,
    pub market_value: Option<f64>,
    pub instrument: Instrument,
}

impl Position {
    pub fn net_quantity(&self) -> f64 {
        self.long_quantity - self.short_quantity
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub symbol: Option<String>,
    pub asset_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balances {
    pub liquidation_value: Option<f64>,
    pub cash_balance: Option<f64>,
    pub buying_power: Option<f64>,
}
