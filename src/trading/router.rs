//! Dispatches approved orders to the paper ledger or the live venue.
//!
//! Both paths return the same `ExecutionOutcome` so the engine handles fills
//! and rejections identically in either mode.

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::paper::{HistoryKind, PaperLedger, PositionMeta};
use super::SizedOrder;
use crate::api::{OrderExecutor, OrderRequest, OrderType};
use crate::error::OrderFailure;
use crate::models::{OrderKind, TradeEvent, TradeSide};

/// Where orders go.
#[derive(Clone)]
pub enum ExecutionMode {
    Paper(Arc<RwLock<PaperLedger>>),
    Live(Arc<dyn OrderExecutor>),
}

/// Result of routing one order, identical in shape for both modes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub paper: bool,
    pub order_id: Option<String>,

    /// Filled (paper) or requested (live) quantity
    pub shares: Decimal,
    pub value: Decimal,
    pub price: Decimal,

    /// Realized P&L, paper exits only
    pub pnl: Option<Decimal>,

    pub failure: Option<OrderFailure>,
}

impl ExecutionOutcome {
    fn failed(order: &SizedOrder, paper: bool, failure: OrderFailure) -> Self {
        Self {
            success: false,
            paper,
            order_id: None,
            shares: order.shares,
            value: order.value,
            price: order.price,
            pnl: None,
            failure: Some(failure),
        }
    }
}

pub struct ExecutionRouter {
    mode: ExecutionMode,
    use_market_orders: bool,
}

impl ExecutionRouter {
    pub fn new(mode: ExecutionMode, use_market_orders: bool) -> Self {
        Self {
            mode,
            use_market_orders,
        }
    }

    pub fn is_paper(&self) -> bool {
        matches!(self.mode, ExecutionMode::Paper(_))
    }

    /// Paper mode is always ready.
    pub fn is_ready(&self) -> bool {
        match &self.mode {
            ExecutionMode::Paper(_) => true,
            ExecutionMode::Live(executor) => executor.is_ready(),
        }
    }

    /// Live executor, when not in paper mode.
    pub fn executor(&self) -> Option<Arc<dyn OrderExecutor>> {
        match &self.mode {
            ExecutionMode::Paper(_) => None,
            ExecutionMode::Live(executor) => Some(executor.clone()),
        }
    }

    /// Order type for a copy of `event`.
    pub fn order_type_for(&self, event: &TradeEvent) -> OrderType {
        if self.use_market_orders || event.order_kind == OrderKind::Market {
            OrderType::Fok
        } else {
            OrderType::Gtc
        }
    }

    /// Route one sized order. `Err` only for transport failures on the live
    /// path; venue and ledger rejections come back as an unsuccessful outcome.
    pub async fn route(&self, order: &SizedOrder, event: &TradeEvent) -> Result<ExecutionOutcome> {
        match &self.mode {
            ExecutionMode::Paper(ledger) => Ok(self.route_paper(ledger, order, event).await),
            ExecutionMode::Live(executor) => self.route_live(executor.as_ref(), order, event).await,
        }
    }

    async fn route_paper(
        &self,
        ledger: &RwLock<PaperLedger>,
        order: &SizedOrder,
        event: &TradeEvent,
    ) -> ExecutionOutcome {
        let mut ledger = ledger.write().await;
        let result = match order.side {
            TradeSide::Buy => ledger.buy(
                &event.token_id,
                order.value,
                order.price,
                PositionMeta {
                    market: event.market_label().to_string(),
                    condition_id: event.condition_id.clone(),
                    outcome: event.outcome.clone(),
                },
            ),
            TradeSide::Sell => {
                ledger.sell(&event.token_id, order.shares, order.price, HistoryKind::Sell)
            }
        };

        match result {
            Ok(fill) => ExecutionOutcome {
                success: true,
                paper: true,
                order_id: None,
                shares: fill.shares,
                value: fill.value,
                price: fill.price,
                pnl: fill.pnl,
                failure: None,
            },
            Err(e) => {
                warn!(token = %event.token_id, error = %e, "Paper order rejected");
                ExecutionOutcome::failed(order, true, OrderFailure::classify(&e.to_string()))
            }
        }
    }

    async fn route_live(
        &self,
        executor: &dyn OrderExecutor,
        order: &SizedOrder,
        event: &TradeEvent,
    ) -> Result<ExecutionOutcome> {
        let request = OrderRequest {
            token_id: event.token_id.clone(),
            side: order.side,
            price: order.price,
            shares: order.shares,
            order_type: self.order_type_for(event),
        };

        debug!(
            token = %request.token_id,
            side = %request.side,
            order_type = ?request.order_type,
            "Routing live order"
        );

        let receipt = executor.place_order(&request).await?;
        if !receipt.success {
            let raw = receipt.error.unwrap_or_else(|| "order rejected".to_string());
            return Ok(ExecutionOutcome::failed(order, false, OrderFailure::classify(&raw)));
        }

        Ok(ExecutionOutcome {
            success: true,
            paper: false,
            order_id: receipt.order_id,
            shares: order.shares,
            value: order.value,
            price: order.price,
            pnl: None,
            failure: None,
        })
    }
}
