//! Polymarket API clients for activity polling, market lookups, streaming
//! prices and order execution.

mod clob_client;
mod data_client;
mod price_feed;
mod types;

pub use clob_client::{
    ClobClient, OrderExecutor, OrderReceipt, OrderRequest, OrderState, OrderType,
};
pub use data_client::{parse_activity, ActivityFeed, DataClient, MarketLookup, ACTIVITY_PAGE_SIZE};
pub use price_feed::{parse_ticks, PriceFeed, PriceTick, WsPriceFeed, MARKET_WS_URL};
pub use types::*;
