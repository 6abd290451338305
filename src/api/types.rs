//! API response types for the Polymarket Data and CLOB APIs.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

/// Activity record from the /activity endpoint.
///
/// The feed is loosely typed; everything except `type` is optional and gets
/// validated once in [`crate::models::TradeEvent::from_activity`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResponse {
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default)]
    pub proxy_wallet: String,
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub size: Decimal,
    #[serde(default)]
    pub usdc_size: Decimal,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub event_slug: String,

    // Order-type hints, present on some records only
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub fill_type: Option<String>,
    #[serde(default)]
    pub is_market_order: Option<bool>,
    #[serde(default)]
    pub market_order: Option<bool>,
}

/// Position response from /positions endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    #[serde(default)]
    pub proxy_wallet: String,
    #[serde(default)]
    pub asset: String,
    pub condition_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub outcome: String,
    pub size: Decimal,
    #[serde(default)]
    pub avg_price: Decimal,
    #[serde(default)]
    pub cur_price: Decimal,
    #[serde(default)]
    pub initial_value: Decimal,
    #[serde(default)]
    pub current_value: Decimal,
}

/// Market record from the data API /markets?conditionId= endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketResponse {
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub resolved: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
    /// Either a JSON array or a JSON-encoded string of an array.
    #[serde(default)]
    pub outcome_prices: Option<Value>,
    #[serde(default)]
    pub resolved_price: Option<Value>,
}

/// Market from the CLOB /markets/{condition_id} endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ClobMarketResponse {
    #[serde(default)]
    pub condition_id: String,
    #[serde(default)]
    pub tokens: Vec<ClobToken>,
}

/// Outcome token inside a CLOB market.
#[derive(Debug, Clone, Deserialize)]
pub struct ClobToken {
    pub token_id: String,
    pub outcome: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub winner: Option<bool>,
}

/// Response from the CLOB /price endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceResponse {
    pub price: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_activity_parses_sparse_record() {
        let json = r#"{
            "type": "TRADE",
            "conditionId": "0xabc",
            "asset": "123",
            "side": "BUY",
            "price": 0.65,
            "size": 20,
            "usdcSize": 13,
            "timestamp": 1700000000,
            "transactionHash": "0xhash",
            "isMarketOrder": true
        }"#;

        let record: ActivityResponse = serde_json::from_str(json).unwrap();
        assert_eq!(record.activity_type, "TRADE");
        assert_eq!(record.price, dec!(0.65));
        assert_eq!(record.usdc_size, dec!(13));
        assert_eq!(record.is_market_order, Some(true));
        assert!(record.title.is_empty());
        assert!(record.order_type.is_none());
    }
}
