//! Order models

use serde::{Deserialize, Serialize};

use super::Instrument;

/// An order as reported by the orders endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: Option<i64>,
    pub status: Option<String>,
    pub order_type: Option<String>,
    pub entered_time: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    #[serde(default)]
    pub order_leg_collection: Vec<OrderLeg>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Order {
    /// "BUY 10 AAPL, SELL 5 MSFT"
    pub fn summary(&self) -> String {
        self.order_leg_collection
            .iter()
            .map(|leg| {
                format!(
                    "{} {} {}",
                    leg.instruction.as_deref().unwrap_or("?"),
                    leg.quantity.unwrap_or_default(),
                    leg.instrument.symbol.as_deref().unwrap_or("?")
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLeg {
    pub instruction: Option<String>,
    pub quantity: Option<f64>,
    #[serde(default)]
    pub instrument: Instrument,
}

/// Extract the order id from a placement response `Location` header,
/// e.g. `/trader/v1/accounts/HASH/orders/1001`.
pub fn order_id_from_location(location: &str) -> Option<i64> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|id| id.parse().ok())
}
