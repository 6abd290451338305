//! Trade events observed on the tracked wallet.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::ActivityResponse;

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// Parse a venue side string, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type the tracked wallet appears to have used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Market,
    Limit,
    Unknown,
}

impl OrderKind {
    /// Detect the order kind from the loose hint fields on an activity record.
    fn detect(raw: &ActivityResponse) -> Self {
        let hint = raw
            .order_type
            .as_deref()
            .or(raw.fill_type.as_deref())
            .map(str::to_uppercase);

        match hint.as_deref() {
            Some("MARKET") | Some("FOK") => OrderKind::Market,
            Some("LIMIT") | Some("GTC") | Some("GTD") => OrderKind::Limit,
            _ if raw.is_market_order == Some(true) || raw.market_order == Some(true) => {
                OrderKind::Market
            }
            _ => OrderKind::Unknown,
        }
    }
}

/// A validated trade by the tracked wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Transaction hash, or a synthetic key when hashes are not required
    pub id: String,

    /// Market condition ID
    pub condition_id: String,

    /// Outcome token ID (falls back to the condition ID when absent)
    pub token_id: String,

    /// Trade direction
    pub side: TradeSide,

    /// Price per share, in [0, 1]
    pub price: Decimal,

    /// Shares traded
    pub size: Decimal,

    /// Notional in USDC
    pub usdc_size: Decimal,

    /// Outcome name (e.g. "Yes", "Up")
    pub outcome: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub slug: String,

    #[serde(default)]
    pub event_slug: String,

    pub timestamp: DateTime<Utc>,

    pub order_kind: OrderKind,
}

impl TradeEvent {
    /// Normalize a raw activity record.
    ///
    /// Returns `None` for anything that is not a BUY/SELL trade, trades
    /// without a transaction hash when `require_hash` is set, and prices
    /// outside [0, 1].
    pub fn from_activity(raw: &ActivityResponse, require_hash: bool) -> Option<Self> {
        if !raw.activity_type.eq_ignore_ascii_case("TRADE") {
            return None;
        }

        let side = TradeSide::parse(&raw.side)?;

        if require_hash && raw.transaction_hash.is_empty() {
            return None;
        }

        if raw.price < Decimal::ZERO || raw.price > Decimal::ONE {
            warn!(
                tx = %raw.transaction_hash,
                price = %raw.price,
                "Dropping trade with price outside [0, 1]"
            );
            return None;
        }

        let id = if raw.transaction_hash.is_empty() {
            format!(
                "{}-{}-{}-{}",
                raw.condition_id, raw.asset, raw.timestamp, side
            )
        } else {
            raw.transaction_hash.clone()
        };

        let token_id = if raw.asset.is_empty() {
            raw.condition_id.clone()
        } else {
            raw.asset.clone()
        };

        let timestamp = Utc
            .timestamp_opt(raw.timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now);

        Some(Self {
            id,
            condition_id: raw.condition_id.clone(),
            token_id,
            side,
            price: raw.price,
            size: raw.size,
            usdc_size: raw.usdc_size,
            outcome: raw.outcome.clone(),
            title: raw.title.clone(),
            slug: raw.slug.clone(),
            event_slug: raw.event_slug.clone(),
            timestamp,
            order_kind: OrderKind::detect(raw),
        })
    }

    /// Best human-readable market name.
    pub fn market_label(&self) -> &str {
        if !self.title.is_empty() {
            &self.title
        } else if !self.slug.is_empty() {
            &self.slug
        } else {
            "Unknown"
        }
    }

    /// Notional of the tracked trade, derived from shares when the feed
    /// omits it.
    pub fn notional(&self) -> Decimal {
        if self.usdc_size > Decimal::ZERO {
            self.usdc_size
        } else {
            self.size * self.price
        }
    }

    /// Shares the tracked wallet moved, derived from notional when absent.
    pub fn shares(&self) -> Decimal {
        if self.size > Decimal::ZERO {
            self.size
        } else if self.usdc_size > Decimal::ZERO && self.price > Decimal::ZERO {
            self.usdc_size / self.price
        } else {
            Decimal::ZERO
        }
    }
}
