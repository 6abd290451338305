//! Market resolution state and outcome tokens.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::api::{ClobMarketResponse, MarketResponse};

/// Resolution state of a market as reported by the data API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketResolution {
    pub condition_id: String,

    /// `resolved` flag set, or status "Resolved" / "Closed"
    pub resolved: bool,

    /// Final price of the first outcome, only when it lies in [0, 1]
    pub settlement_price: Option<Decimal>,
}

impl MarketResolution {
    pub fn from_response(market: &MarketResponse) -> Self {
        let resolved = market.resolved == Some(true)
            || matches!(market.status.as_deref(), Some("Resolved") | Some("Closed"));

        let settlement_price = market
            .outcome_prices
            .as_ref()
            .and_then(first_outcome_price)
            .or_else(|| market.resolved_price.as_ref().and_then(decimal_from_value))
            .filter(|p| *p >= Decimal::ZERO && *p <= Decimal::ONE);

        Self {
            condition_id: market.condition_id.clone(),
            resolved,
            settlement_price,
        }
    }

    /// Settlement price, only once the market is resolved.
    pub fn final_price(&self) -> Option<Decimal> {
        if self.resolved {
            self.settlement_price
        } else {
            None
        }
    }
}

/// `outcomePrices` is either an array or a JSON string holding one.
fn first_outcome_price(value: &Value) -> Option<Decimal> {
    match value {
        Value::Array(items) => items.first().and_then(decimal_from_value),
        Value::String(s) => {
            let parsed: Value = serde_json::from_str(s).ok()?;
            match parsed {
                Value::Array(items) => items.first().and_then(decimal_from_value),
                _ => None,
            }
        }
        _ => None,
    }
}

fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// One outcome token of a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeToken {
    pub token_id: String,
    pub outcome: String,
    pub price: Option<Decimal>,
}

impl OutcomeToken {
    pub fn from_clob(market: &ClobMarketResponse) -> Vec<Self> {
        market
            .tokens
            .iter()
            .map(|t| Self {
                token_id: t.token_id.clone(),
                outcome: t.outcome.clone(),
                price: t.price,
            })
            .collect()
    }
}

/// Token for a named outcome, compared case-insensitively.
pub fn token_for_outcome<'a>(
    tokens: &'a [OutcomeToken],
    outcome: &str,
) -> Option<&'a OutcomeToken> {
    tokens
        .iter()
        .find(|t| t.outcome.eq_ignore_ascii_case(outcome))
}

/// The other side of an Up/Down market. Other outcome names have no
/// well-defined opposite here.
pub fn opposite_outcome(outcome: &str) -> Option<&'static str> {
    match outcome {
        "Up" => Some("Down"),
        "Down" => Some("Up"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn market(value: Value) -> MarketResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_resolution_from_status() {
        let m = market(json!({
            "conditionId": "0xc",
            "status": "Closed",
            "outcomePrices": "[\"1\", \"0\"]"
        }));
        let res = MarketResolution::from_response(&m);
        assert!(res.resolved);
        assert_eq!(res.final_price(), Some(dec!(1)));
    }

    #[test]
    fn test_resolved_price_fallback() {
        let m = market(json!({
            "conditionId": "0xc",
            "resolved": true,
            "resolvedPrice": 0.0
        }));
        let res = MarketResolution::from_response(&m);
        assert_eq!(res.final_price(), Some(dec!(0)));
    }

    #[test]
    fn test_out_of_range_price_ignored() {
        let m = market(json!({
            "conditionId": "0xc",
            "resolved": true,
            "outcomePrices": [1.5, 0]
        }));
        let res = MarketResolution::from_response(&m);
        assert!(res.resolved);
        assert_eq!(res.final_price(), None);
    }

    #[test]
    fn test_unresolved_has_no_final_price() {
        let m = market(json!({
            "conditionId": "0xc",
            "status": "Active",
            "outcomePrices": [0.4, 0.6]
        }));
        let res = MarketResolution::from_response(&m);
        assert!(!res.resolved);
        assert_eq!(res.settlement_price, Some(dec!(0.4)));
        assert_eq!(res.final_price(), None);
    }

    #[test]
    fn test_outcome_lookup() {
        let tokens = vec![
            OutcomeToken { token_id: "1".into(), outcome: "Up".into(), price: None },
            OutcomeToken { token_id: "2".into(), outcome: "Down".into(), price: None },
        ];
        let opposite = opposite_outcome("Up").unwrap();
        assert_eq!(token_for_outcome(&tokens, opposite).unwrap().token_id, "2");
        assert_eq!(opposite_outcome("Yes"), None);
    }
}
