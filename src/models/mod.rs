//! Data models for trade events, positions, and market state.

mod market;
mod position;
mod trade;

pub use market::{opposite_outcome, token_for_outcome, MarketResolution, OutcomeToken};
pub use position::{
    loss_pct, market_prefix, stop_price_for, StopLossOrder, StopLossPosition, TrackedPosition,
    WalletPosition,
};
pub use trade::{OrderKind, TradeEvent, TradeSide};
