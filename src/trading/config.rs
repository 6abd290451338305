//! Copy-trading configuration.
//!
//! Every threshold is read once from the environment at startup. The
//! resulting `CopyConfig` is immutable and shared behind an `Arc`.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Hard ceiling on the stop-loss check throttle.
const MAX_STOP_CHECK_INTERVAL_MS: u64 = 300_000;

/// Floor on the poll interval; the activity API rate-limits below this.
pub const MIN_POLL_INTERVAL_MS: u64 = 5_000;

/// Credentials the live CLOB client needs.
const CLOB_CREDENTIALS: [&str; 4] = [
    "POLYMARKET_PRIVATE_KEY",
    "POLYMARKET_API_KEY",
    "POLYMARKET_API_SECRET",
    "POLYMARKET_API_PASSPHRASE",
];

/// Configuration for copy-trade eligibility, sizing, risk and stop-loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    // Modes
    pub auto_trade_enabled: bool,
    pub copy_trade_enabled: bool,
    pub copy_sell_orders: bool,

    /// Drop activity records without a transaction hash
    pub require_transaction_hash: bool,

    /// Lowercased keywords matched against market title/slug; empty = all
    pub market_filter: Vec<String>,

    /// Always place market (FOK) orders instead of limits
    pub use_market_orders: bool,

    /// Default notional per copy trade, also the venue minimum
    pub auto_trade_amount: Decimal,

    pub paper_trading: bool,
    pub paper_starting_balance: Decimal,

    // Eligibility
    pub min_tracked_trade_size: Decimal,
    pub min_tracked_confidence: Decimal,

    // Optimal confidence band
    pub optimal_confidence_min: Decimal,
    pub optimal_confidence_max: Decimal,
    pub use_optimal_filter: bool,
    pub optimal_multiplier: Decimal,

    // Size labels
    pub high_confidence_threshold: Decimal,
    pub low_confidence_threshold: Decimal,

    // Risk limits
    /// Zero falls back to `max_order_value`
    pub max_bet_amount_per_market: Decimal,
    pub max_order_value: Decimal,
    pub max_positions: usize,
    pub max_total_exposure: Decimal,

    // High-confidence add
    pub add_high_confidence_enabled: bool,
    pub add_high_confidence_min: Decimal,
    pub add_high_confidence_max: Decimal,
    pub add_high_confidence_size: Decimal,

    pub half_size_initial_trades: bool,

    // Stop-loss
    pub stop_loss_enabled: bool,

    /// Percent, 20 = 20%
    pub stop_loss_pct: Decimal,
    pub stop_loss_min_hold_ms: u64,
    pub stop_loss_check_interval_ms: u64,

    /// `0x…` entries match condition ids, the rest are keywords; empty = all
    pub stop_loss_market_filter: Vec<String>,

    pub poll_interval_ms: u64,
    pub database_url: String,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            auto_trade_enabled: true,
            copy_trade_enabled: true,
            copy_sell_orders: true,
            require_transaction_hash: true,
            market_filter: Vec::new(),
            use_market_orders: false,
            auto_trade_amount: dec!(5),
            paper_trading: false,
            paper_starting_balance: dec!(1000),
            min_tracked_trade_size: Decimal::ZERO,
            min_tracked_confidence: Decimal::ZERO,
            optimal_confidence_min: dec!(0.60),
            optimal_confidence_max: dec!(0.70),
            use_optimal_filter: false,
            optimal_multiplier: dec!(1.5),
            high_confidence_threshold: dec!(100),
            low_confidence_threshold: dec!(10),
            max_bet_amount_per_market: Decimal::ZERO,
            max_order_value: dec!(50),
            max_positions: 10,
            max_total_exposure: dec!(500),
            add_high_confidence_enabled: true,
            add_high_confidence_min: dec!(0.80),
            add_high_confidence_max: dec!(0.90),
            add_high_confidence_size: dec!(5),
            half_size_initial_trades: false,
            stop_loss_enabled: true,
            stop_loss_pct: dec!(20),
            stop_loss_min_hold_ms: 60_000,
            stop_loss_check_interval_ms: 60_000,
            stop_loss_market_filter: Vec::new(),
            poll_interval_ms: 15_000,
            database_url: "sqlite:./mirror.db?mode=rwc".to_string(),
        }
    }
}

impl CopyConfig {
    /// Load from the process environment (after `.env` has been applied).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };
        let d = Self::default();

        let config = Self {
            auto_trade_enabled: env.bool("AUTO_TRADE_ENABLED", d.auto_trade_enabled)?,
            copy_trade_enabled: env.bool("COPY_TRADE_ENABLED", d.copy_trade_enabled)?,
            copy_sell_orders: env.bool("COPY_SELL_ORDERS", d.copy_sell_orders)?,
            require_transaction_hash: env.bool("SEND_TRADES_ONLY", d.require_transaction_hash)?,
            market_filter: env.list("AUTO_TRADE_FILTER", true),
            use_market_orders: env.bool("AUTO_TRADE_USE_MARKET", d.use_market_orders)?,
            auto_trade_amount: env.decimal("AUTO_TRADE_AMOUNT_USD", d.auto_trade_amount)?,
            paper_trading: env.bool("PAPER_TRADING_ENABLED", d.paper_trading)?,
            paper_starting_balance: env
                .decimal("PAPER_STARTING_BALANCE_USD", d.paper_starting_balance)?,
            min_tracked_trade_size: env
                .decimal("MIN_TRACKED_TRADE_SIZE_USD", d.min_tracked_trade_size)?,
            min_tracked_confidence: env
                .decimal("MIN_TRACKED_CONFIDENCE_LEVEL", d.min_tracked_confidence)?,
            optimal_confidence_min: env
                .decimal("OPTIMAL_CONFIDENCE_MIN", d.optimal_confidence_min)?,
            optimal_confidence_max: env
                .decimal("OPTIMAL_CONFIDENCE_MAX", d.optimal_confidence_max)?,
            use_optimal_filter: env.bool("USE_OPTIMAL_CONFIDENCE_FILTER", d.use_optimal_filter)?,
            optimal_multiplier: env
                .decimal("OPTIMAL_CONFIDENCE_BET_MULTIPLIER", d.optimal_multiplier)?,
            high_confidence_threshold: env
                .decimal("HIGH_CONFIDENCE_THRESHOLD_USD", d.high_confidence_threshold)?,
            low_confidence_threshold: env
                .decimal("LOW_CONFIDENCE_THRESHOLD_USD", d.low_confidence_threshold)?,
            max_bet_amount_per_market: env
                .decimal("MAX_BET_AMOUNT_PER_MARKET_USD", d.max_bet_amount_per_market)?,
            max_order_value: env.decimal("MAX_ORDER_VALUE_USD", d.max_order_value)?,
            max_positions: env.parse("MAX_POSITIONS", d.max_positions)?,
            max_total_exposure: env.decimal("MAX_TOTAL_EXPOSURE_USD", d.max_total_exposure)?,
            add_high_confidence_enabled: env
                .bool("ADD_HIGH_CONFIDENCE_ENABLED", d.add_high_confidence_enabled)?,
            add_high_confidence_min: env
                .decimal("ADD_HIGH_CONFIDENCE_MIN", d.add_high_confidence_min)?,
            add_high_confidence_max: env
                .decimal("ADD_HIGH_CONFIDENCE_MAX", d.add_high_confidence_max)?,
            add_high_confidence_size: env
                .decimal("ADD_HIGH_CONFIDENCE_SIZE_USD", d.add_high_confidence_size)?,
            half_size_initial_trades: env
                .bool("USE_HALF_SIZE_INITIAL_TRADES", d.half_size_initial_trades)?,
            stop_loss_enabled: env.bool("STOP_LOSS_ENABLED", d.stop_loss_enabled)?,
            stop_loss_pct: env.decimal("STOP_LOSS_PERCENTAGE", d.stop_loss_pct)?,
            stop_loss_min_hold_ms: env
                .parse("STOP_LOSS_MIN_TIME_SINCE_ENTRY_MS", d.stop_loss_min_hold_ms)?,
            stop_loss_check_interval_ms: env
                .parse("STOP_LOSS_CHECK_INTERVAL_MS", d.stop_loss_check_interval_ms)?,
            stop_loss_market_filter: env.list("STOP_LOSS_WEBSOCKET_MARKET_FILTER", false),
            poll_interval_ms: env.parse("POLL_INTERVAL_MS", d.poll_interval_ms)?,
            database_url: (env.lookup)("DATABASE_URL").unwrap_or(d.database_url),
        };

        config.validate()?;
        Ok(config)
    }

    /// Range checks that do not depend on the run mode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(ConfigError::Invalid {
                name: "POLL_INTERVAL_MS",
                value: self.poll_interval_ms.to_string(),
                reason: format!("must be at least {MIN_POLL_INTERVAL_MS}"),
            });
        }

        if self.auto_trade_amount <= Decimal::ZERO {
            return Err(ConfigError::Invalid {
                name: "AUTO_TRADE_AMOUNT_USD",
                value: self.auto_trade_amount.to_string(),
                reason: "must be positive".to_string(),
            });
        }

        if self.stop_loss_pct <= Decimal::ZERO || self.stop_loss_pct >= dec!(100) {
            return Err(ConfigError::Invalid {
                name: "STOP_LOSS_PERCENTAGE",
                value: self.stop_loss_pct.to_string(),
                reason: "must be between 0 and 100".to_string(),
            });
        }

        if self.optimal_confidence_min > self.optimal_confidence_max {
            return Err(ConfigError::Invalid {
                name: "OPTIMAL_CONFIDENCE_MIN",
                value: self.optimal_confidence_min.to_string(),
                reason: "must not exceed OPTIMAL_CONFIDENCE_MAX".to_string(),
            });
        }

        Ok(())
    }

    /// Live trading needs the CLOB credentials to be present.
    pub fn require_credentials<F>(lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for name in CLOB_CREDENTIALS {
            match lookup(name) {
                Some(v) if !v.trim().is_empty() => {}
                _ => return Err(ConfigError::Missing { name }),
            }
        }
        Ok(())
    }

    /// Per-market notional cap.
    pub fn max_bet_per_market(&self) -> Decimal {
        if self.max_bet_amount_per_market > Decimal::ZERO {
            self.max_bet_amount_per_market
        } else {
            self.max_order_value
        }
    }

    /// Smallest notional the venue accepts.
    pub fn min_order_value(&self) -> Decimal {
        self.auto_trade_amount
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Throttle between stop-loss checks of the same position.
    pub fn stop_check_interval(&self) -> chrono::Duration {
        let ms = if self.stop_loss_enabled {
            self.stop_loss_check_interval_ms.min(MAX_STOP_CHECK_INTERVAL_MS)
        } else {
            MAX_STOP_CHECK_INTERVAL_MS
        };
        chrono::Duration::milliseconds(ms as i64)
    }

    pub fn stop_loss_min_hold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stop_loss_min_hold_ms as i64)
    }

    pub fn in_optimal_range(&self, price: Decimal) -> bool {
        price >= self.optimal_confidence_min && price <= self.optimal_confidence_max
    }

    pub fn in_high_confidence_band(&self, price: Decimal) -> bool {
        self.add_high_confidence_enabled
            && price >= self.add_high_confidence_min
            && price <= self.add_high_confidence_max
    }

    /// Market keyword filter for copy trades.
    pub fn matches_trade_filter(&self, title: &str, slug: &str) -> bool {
        if self.market_filter.is_empty() {
            return true;
        }
        let title = title.to_lowercase();
        let slug = slug.to_lowercase();
        self.market_filter
            .iter()
            .any(|kw| title.contains(kw.as_str()) || slug.contains(kw.as_str()))
    }

    /// Market filter for stop-loss coverage and price-feed subscriptions.
    pub fn matches_stop_loss_filter(&self, condition_id: &str, market: &str) -> bool {
        if self.stop_loss_market_filter.is_empty() {
            return true;
        }
        let market = market.to_lowercase();
        self.stop_loss_market_filter.iter().any(|entry| {
            if entry.starts_with("0x") {
                entry.eq_ignore_ascii_case(condition_id)
            } else {
                market.contains(&entry.to_lowercase())
            }
        })
    }
}

/// Tracked wallet must be a 0x-prefixed 20-byte hex address.
pub fn validate_wallet(wallet: &str) -> Result<(), ConfigError> {
    let hex_part = wallet.strip_prefix("0x").unwrap_or("");
    if hex_part.len() == 40 && hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            name: "TRACKED_WALLET",
            value: wallet.to_string(),
            reason: "expected 0x followed by 40 hex characters".to_string(),
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => match v.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    name,
                    value: v,
                    reason: "expected true or false".to_string(),
                }),
            },
        }
    }

    fn decimal(&self, name: &'static str, default: Decimal) -> Result<Decimal, ConfigError> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => Decimal::from_str(&v).map_err(|e| ConfigError::Invalid {
                name,
                value: v.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                value: v.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn list(&self, name: &str, lowercase: bool) -> Vec<String> {
        self.get(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| if lowercase { s.to_lowercase() } else { s.to_string() })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl std::fmt::Display for CopyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Modes:")?;
        writeln!(f, "  Auto Trade:           {}", self.auto_trade_enabled)?;
        writeln!(f, "  Copy Trade:           {}", self.copy_trade_enabled)?;
        writeln!(f, "  Copy Sells:           {}", self.copy_sell_orders)?;
        writeln!(f, "  Paper Trading:        {}", self.paper_trading)?;
        writeln!(f, "  Market Orders:        {}", self.use_market_orders)?;
        writeln!(f, "  Require Tx Hash:      {}", self.require_transaction_hash)?;

        writeln!(f, "\nSizing:")?;
        writeln!(f, "  Order Amount:         ${}", self.auto_trade_amount)?;
        writeln!(
            f,
            "  Optimal Range:        {} - {} (x{}, filter {})",
            self.optimal_confidence_min,
            self.optimal_confidence_max,
            self.optimal_multiplier,
            self.use_optimal_filter
        )?;
        writeln!(
            f,
            "  High-Conf Add:        {} - {} (${}, enabled {})",
            self.add_high_confidence_min,
            self.add_high_confidence_max,
            self.add_high_confidence_size,
            self.add_high_confidence_enabled
        )?;
        writeln!(f, "  Half-Size Initial:    {}", self.half_size_initial_trades)?;
        writeln!(f, "  Min Tracked Size:     ${}", self.min_tracked_trade_size)?;
        writeln!(f, "  Min Confidence:       {}", self.min_tracked_confidence)?;

        writeln!(f, "\nRisk Limits:")?;
        writeln!(f, "  Per-Market Cap:       ${}", self.max_bet_per_market())?;
        writeln!(f, "  Max Positions:        {}", self.max_positions)?;
        writeln!(f, "  Max Exposure:         ${}", self.max_total_exposure)?;

        writeln!(f, "\nStop-Loss:")?;
        writeln!(f, "  Enabled:              {}", self.stop_loss_enabled)?;
        writeln!(f, "  Threshold:            {}%", self.stop_loss_pct)?;
        writeln!(f, "  Min Hold:             {}s", self.stop_loss_min_hold_ms / 1000)?;
        writeln!(
            f,
            "  Check Interval:       {}s",
            self.stop_check_interval().num_seconds()
        )?;
        if !self.stop_loss_market_filter.is_empty() {
            writeln!(f, "  Market Filter:        {}", self.stop_loss_market_filter.join(", "))?;
        }

        writeln!(f, "\nPolling:")?;
        write!(f, "  Interval:             {}ms", self.poll_interval_ms)
    }
}
