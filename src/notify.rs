//! Structured notification events for the presentation layer.
//!
//! The engine only emits; rendering is somebody else's job. The default
//! consumer writes every event to the log.

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::models::TradeSide;

#[derive(Debug, Clone)]
pub enum Notification {
    TradeDetected {
        market: String,
        outcome: String,
        side: TradeSide,
        price: Decimal,
        size: Decimal,
        usdc_size: Decimal,
        tx: String,
    },
    OrderPlaced {
        market: String,
        outcome: String,
        side: TradeSide,
        price: Decimal,
        shares: Decimal,
        value: Decimal,
        label: String,
        paper: bool,
        order_id: Option<String>,
    },
    OrderFailed {
        market: String,
        side: TradeSide,
        value: Decimal,
        error: String,
        hint: &'static str,
    },
    OrderSkipped {
        market: String,
        outcome: String,
        price: Decimal,
        reason: String,
    },
    OrderCapped {
        market: String,
        current: Decimal,
        cap: Decimal,
        value: Decimal,
        bumped: bool,
    },
    StopLossTriggered {
        market: String,
        token_id: String,
        entry_price: Decimal,
        price: Decimal,
        shares: Decimal,
        loss_pct: Decimal,
        paper: bool,
        resolved: bool,
    },
    PositionSettled {
        market: String,
        token_id: String,
        shares: Decimal,
        price: Decimal,
        pnl: Decimal,
    },
}

/// Sending half handed to the engine on session start.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Best effort; a closed destination is ignored.
    pub fn emit(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

/// Log every notification until all senders are gone.
pub async fn log_notifications(mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(n) = rx.recv().await {
        match n {
            Notification::TradeDetected {
                market,
                outcome,
                side,
                price,
                size,
                usdc_size,
                tx,
            } => info!(
                market = %market,
                outcome = %outcome,
                side = %side,
                price = %price,
                shares = %size,
                usdc = %usdc_size,
                tx = %tx,
                "Trade detected"
            ),
            Notification::OrderPlaced {
                market,
                outcome,
                side,
                price,
                shares,
                value,
                label,
                paper,
                order_id,
            } => info!(
                market = %market,
                outcome = %outcome,
                side = %side,
                price = %price,
                shares = %shares,
                value = %value,
                label = %label,
                paper,
                order_id = ?order_id,
                "Copy order placed"
            ),
            Notification::OrderFailed {
                market,
                side,
                value,
                error,
                hint,
            } => warn!(
                market = %market,
                side = %side,
                value = %value,
                error = %error,
                hint,
                "Copy order failed"
            ),
            Notification::OrderSkipped {
                market,
                outcome,
                price,
                reason,
            } => info!(
                market = %market,
                outcome = %outcome,
                price = %price,
                reason = %reason,
                "Copy trade skipped"
            ),
            Notification::OrderCapped {
                market,
                current,
                cap,
                value,
                bumped,
            } => info!(
                market = %market,
                current = %current,
                cap = %cap,
                value = %value,
                bumped,
                "Order size capped"
            ),
            Notification::StopLossTriggered {
                market,
                token_id,
                entry_price,
                price,
                shares,
                loss_pct,
                paper,
                resolved,
            } => warn!(
                market = %market,
                token = %token_id,
                entry = %entry_price,
                price = %price,
                shares = %shares,
                loss_pct = %loss_pct.round_dp(2),
                paper,
                resolved,
                "Stop-loss triggered"
            ),
            Notification::PositionSettled {
                market,
                token_id,
                shares,
                price,
                pnl,
            } => info!(
                market = %market,
                token = %token_id,
                shares = %shares,
                price = %price,
                pnl = %pnl,
                "Position settled"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_emit_after_receiver_dropped() {
        let (sink, rx) = NotificationSink::channel();
        drop(rx);
        sink.emit(Notification::OrderSkipped {
            market: "m".to_string(),
            outcome: "Yes".to_string(),
            price: dec!(0.5),
            reason: "test".to_string(),
        });
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (sink, mut rx) = NotificationSink::channel();
        for i in 0..3 {
            sink.emit(Notification::OrderSkipped {
                market: format!("m{i}"),
                outcome: String::new(),
                price: Decimal::ZERO,
                reason: String::new(),
            });
        }
        drop(sink);

        let mut markets = Vec::new();
        while let Some(Notification::OrderSkipped { market, .. }) = rx.recv().await {
            markets.push(market);
        }
        assert_eq!(markets, vec!["m0", "m1", "m2"]);
    }
}
