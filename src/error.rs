//! Typed error taxonomy for the mirror engine.
//!
//! Plumbing code uses `anyhow`; these enums exist where callers branch on
//! the kind of failure (retry next cycle, refuse to start, tell the user to
//! fund or approve the wallet).

use thiserror::Error;

/// Activity feed failures. Always transient: the scheduler logs and retries
/// on the next cycle.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("activity feed unavailable: {0}")]
    Unavailable(String),

    #[error("activity feed returned a malformed payload: {0}")]
    Malformed(String),
}

/// Startup configuration problems. The process does not start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not set")]
    Missing { name: &'static str },

    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Classified venue rejection. The raw message is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderFailure {
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("insufficient allowance: {0}")]
    InsufficientAllowance(String),

    #[error("orderbook does not exist: {0}")]
    OrderbookMissing(String),

    #[error("{0}")]
    Other(String),
}

impl OrderFailure {
    /// Pattern-match a venue error string into a failure kind.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let raw = message.to_string();

        if lower.contains("allowance") {
            Self::InsufficientAllowance(raw)
        } else if lower.contains("balance") {
            Self::InsufficientBalance(raw)
        } else if lower.contains("orderbook") && lower.contains("does not exist") {
            Self::OrderbookMissing(raw)
        } else {
            Self::Other(raw)
        }
    }

    /// The venue message exactly as received.
    pub fn raw(&self) -> &str {
        match self {
            Self::InsufficientBalance(m)
            | Self::InsufficientAllowance(m)
            | Self::OrderbookMissing(m)
            | Self::Other(m) => m,
        }
    }

    /// What the operator should do about it.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::InsufficientBalance(_) => "fund the trading wallet with USDC",
            Self::InsufficientAllowance(_) => "approve USDC spending for the exchange contract",
            Self::OrderbookMissing(_) => "market has no orderbook yet; trade skipped",
            Self::Other(_) => "check the venue response",
        }
    }

    /// Orderbook-missing rejections are skips, not failures.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::OrderbookMissing(_))
    }
}
