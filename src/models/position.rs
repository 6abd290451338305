//! Position records: our own holdings, stop-loss coverage, and wallet
//! positions reported by the data API.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Our accumulated notional in one outcome token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub token_id: String,

    /// Market the token belongs to, used to spot resolution
    #[serde(default)]
    pub condition_id: String,

    /// Total USDC put into this token
    pub usdc_value: Decimal,

    /// Last fill that touched this position
    pub updated_at: DateTime<Utc>,
}

impl TrackedPosition {
    pub fn new(token_id: String, condition_id: String, usdc_value: Decimal) -> Self {
        Self {
            token_id,
            condition_id,
            usdc_value,
            updated_at: Utc::now(),
        }
    }

    /// Record another BUY fill.
    pub fn add(&mut self, usdc_value: Decimal) {
        self.usdc_value += usdc_value;
        self.updated_at = Utc::now();
    }

    /// Shrink after a partial exit that kept `fraction` of the shares.
    pub fn retain_fraction(&mut self, fraction: Decimal) {
        let fraction = fraction.clamp(Decimal::ZERO, Decimal::ONE);
        self.usdc_value = (self.usdc_value * fraction).round_dp(6);
        self.updated_at = Utc::now();
    }
}

/// A position under stop-loss coverage.
///
/// `pending` is the single guard against the polled and pushed paths both
/// acting on the same token. It is flipped while holding the table entry,
/// before any order is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossPosition {
    pub token_id: String,
    pub condition_id: String,

    /// Market title or slug, used for keyword filters
    pub market: String,

    pub entry_price: Decimal,
    pub shares: Decimal,

    /// entry * (1 - pct/100)
    pub stop_price: Decimal,

    pub entry_timestamp: DateTime<Utc>,

    /// Last time the polled path looked at this entry
    pub last_checked: Option<DateTime<Utc>>,

    pub pending: bool,
}

impl StopLossPosition {
    /// Register coverage for a fresh fill. `stop_loss_pct` is in percent (20 = 20%).
    pub fn new(
        token_id: String,
        condition_id: String,
        market: String,
        entry_price: Decimal,
        shares: Decimal,
        stop_loss_pct: Decimal,
    ) -> Self {
        Self {
            token_id,
            condition_id,
            market,
            entry_price,
            shares,
            stop_price: stop_price_for(entry_price, stop_loss_pct),
            entry_timestamp: Utc::now(),
            last_checked: None,
            pending: false,
        }
    }

    /// Loss from entry at `price`, in percent. Zero when entry is unknown.
    pub fn loss_pct(&self, price: Decimal) -> Decimal {
        loss_pct(self.entry_price, price)
    }

    /// Market type prefix for recurring hourly events, e.g. "bitcoin" for
    /// "bitcoin-up-or-down-june-5-3pm".
    pub fn market_prefix(&self) -> Option<&str> {
        market_prefix(&self.market)
    }
}

/// Stop price for an entry and a percentage threshold.
pub fn stop_price_for(entry_price: Decimal, stop_loss_pct: Decimal) -> Decimal {
    entry_price * (Decimal::ONE - stop_loss_pct / dec!(100))
}

/// Percentage loss from `entry` to `price`.
pub fn loss_pct(entry: Decimal, price: Decimal) -> Decimal {
    if entry <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (entry - price) / entry * dec!(100)
}

/// Text before the first '-', trimmed. `None` when there is no dash.
pub fn market_prefix(market: &str) -> Option<&str> {
    let prefix = market.split('-').next()?.trim();
    if prefix.is_empty() || prefix.len() == market.trim().len() {
        None
    } else {
        Some(prefix)
    }
}

/// A stop-loss limit order resting on the exchange (polled path, PENDING).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossOrder {
    pub token_id: String,
    pub order_id: String,
    pub stop_price: Decimal,
    pub entry_price: Decimal,
    pub shares: Decimal,
    pub placed_at: DateTime<Utc>,
}

/// A wallet's holding in one outcome token, as reported by the data API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletPosition {
    pub token_id: String,
    pub condition_id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub outcome: String,

    /// Shares held
    pub size: Decimal,

    pub avg_price: Decimal,

    #[serde(default)]
    pub cur_price: Decimal,

    /// Current market value in USDC
    #[serde(default)]
    pub current_value: Decimal,
}
