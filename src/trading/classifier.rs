//! Copy-trade eligibility filter.

use rust_decimal::Decimal;

use super::CopyConfig;
use crate::models::{TradeEvent, TradeSide};

/// Why a new trade was not copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AutoTradeDisabled,
    CopyTradeDisabled,
    MissingMarket,
    SellCopyDisabled,
    FilterMismatch,
    BelowMinSize { size: Decimal, min: Decimal },
    BelowMinConfidence { price: Decimal, min: Decimal },
    BelowOptimalRange { price: Decimal, min: Decimal },
    ExecutorNotReady,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoTradeDisabled => write!(f, "auto trading disabled"),
            Self::CopyTradeDisabled => write!(f, "copy trading disabled"),
            Self::MissingMarket => write!(f, "trade has no market id"),
            Self::SellCopyDisabled => write!(f, "SELL copying disabled"),
            Self::FilterMismatch => write!(f, "market does not match filter"),
            Self::BelowMinSize { size, min } => {
                write!(f, "trade size ${} < min ${}", size.round_dp(2), min)
            }
            Self::BelowMinConfidence { price, min } => {
                write!(f, "confidence {price} < min {min}")
            }
            Self::BelowOptimalRange { price, min } => {
                write!(f, "confidence {price} below optimal minimum {min}")
            }
            Self::ExecutorNotReady => write!(f, "order client not ready"),
        }
    }
}

/// Decide whether a new trade is eligible for copying.
///
/// `executor_ready` only matters for live execution; paper mode passes `true`.
pub fn classify(
    event: &TradeEvent,
    config: &CopyConfig,
    executor_ready: bool,
) -> Result<(), SkipReason> {
    if !config.auto_trade_enabled {
        return Err(SkipReason::AutoTradeDisabled);
    }
    if !config.copy_trade_enabled {
        return Err(SkipReason::CopyTradeDisabled);
    }
    if event.condition_id.is_empty() {
        return Err(SkipReason::MissingMarket);
    }
    if event.side == TradeSide::Sell && !config.copy_sell_orders {
        return Err(SkipReason::SellCopyDisabled);
    }
    if !config.matches_trade_filter(&event.title, &event.slug) {
        return Err(SkipReason::FilterMismatch);
    }

    let size = event.notional();
    if config.min_tracked_trade_size > Decimal::ZERO && size < config.min_tracked_trade_size {
        return Err(SkipReason::BelowMinSize {
            size,
            min: config.min_tracked_trade_size,
        });
    }

    // The optimal filter replaces the plain confidence floor. Prices above
    // the optimal band still pass.
    if config.use_optimal_filter {
        if event.price < config.optimal_confidence_min {
            return Err(SkipReason::BelowOptimalRange {
                price: event.price,
                min: config.optimal_confidence_min,
            });
        }
    } else if config.min_tracked_confidence > Decimal::ZERO
        && event.price < config.min_tracked_confidence
    {
        return Err(SkipReason::BelowMinConfidence {
            price: event.price,
            min: config.min_tracked_confidence,
        });
    }

    if !config.paper_trading && !executor_ready {
        return Err(SkipReason::ExecutorNotReady);
    }

    Ok(())
}
