//! Portfolio risk limits applied to sized BUY orders.

use rust_decimal::Decimal;

use super::{CopyConfig, SizedOrder};
use crate::models::TradeSide;

/// Exposure state the enforcer validates against. Read-only.
#[derive(Debug, Clone, Default)]
pub struct ExposureSnapshot {
    /// Number of tokens we currently hold
    pub open_positions: usize,

    /// Notional across all positions
    pub total_exposure: Decimal,

    /// Notional already in the order's token
    pub token_exposure: Decimal,

    /// The order's token is already among the open positions
    pub token_open: bool,
}

/// Which limit was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskReason {
    PositionCount,
    TotalExposure,
    PerMarketCap,
}

impl RiskReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PositionCount => "position_count",
            Self::TotalExposure => "total_exposure",
            Self::PerMarketCap => "per_market_cap",
        }
    }
}

/// A rejected order with the numbers that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskRejection {
    pub reason: RiskReason,

    /// Value after the order would be placed (count or USD)
    pub would_be: Decimal,

    pub limit: Decimal,
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            RiskReason::PositionCount => write!(
                f,
                "{}: {} open positions would exceed max {}",
                self.reason.code(),
                self.would_be,
                self.limit
            ),
            _ => write!(
                f,
                "{}: ${} would exceed max ${}",
                self.reason.code(),
                self.would_be.round_dp(2),
                self.limit
            ),
        }
    }
}

/// Validates orders against position-count, total-exposure and per-market
/// limits. Never mutates state.
pub struct RiskCheck<'a> {
    config: &'a CopyConfig,
}

impl<'a> RiskCheck<'a> {
    pub fn new(config: &'a CopyConfig) -> Self {
        Self { config }
    }

    /// SELL orders reduce exposure and always pass.
    pub fn check(
        &self,
        order: &SizedOrder,
        snapshot: &ExposureSnapshot,
    ) -> Result<(), RiskRejection> {
        if order.side == TradeSide::Sell {
            return Ok(());
        }

        // Adding to an open token does not open a new position.
        if !snapshot.token_open && snapshot.open_positions >= self.config.max_positions {
            return Err(RiskRejection {
                reason: RiskReason::PositionCount,
                would_be: Decimal::from(snapshot.open_positions + 1),
                limit: Decimal::from(self.config.max_positions),
            });
        }

        let total = snapshot.total_exposure + order.value;
        if total > self.config.max_total_exposure {
            return Err(RiskRejection {
                reason: RiskReason::TotalExposure,
                would_be: total,
                limit: self.config.max_total_exposure,
            });
        }

        let cap = self.config.max_bet_per_market();
        let in_market = snapshot.token_exposure + order.value;
        if in_market > cap {
            return Err(RiskRejection {
                reason: RiskReason::PerMarketCap,
                would_be: in_market,
                limit: cap,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn buy(value: Decimal) -> SizedOrder {
        SizedOrder {
            side: TradeSide::Buy,
            shares: value * dec!(2),
            value,
            price: dec!(0.5),
            label: "MEDIUM SIZE".to_string(),
            high_confidence_add: false,
            capped: false,
            bumped: false,
        }
    }

    #[test]
    fn test_position_count_limit() {
        let config = CopyConfig {
            max_positions: 5,
            ..Default::default()
        };
        let check = RiskCheck::new(&config);
        let snapshot = ExposureSnapshot {
            open_positions: 5,
            total_exposure: dec!(25),
            ..Default::default()
        };

        let rejection = check.check(&buy(dec!(5)), &snapshot).unwrap_err();
        assert_eq!(rejection.reason, RiskReason::PositionCount);
        assert_eq!(rejection.reason.code(), "position_count");
        assert_eq!(rejection.limit, dec!(5));
    }

    #[test]
    fn test_add_to_open_token_ignores_count() {
        let config = CopyConfig {
            max_positions: 5,
            ..Default::default()
        };
        let check = RiskCheck::new(&config);
        let snapshot = ExposureSnapshot {
            open_positions: 5,
            total_exposure: dec!(25),
            token_exposure: dec!(5),
            token_open: true,
        };
        assert!(check.check(&buy(dec!(5)), &snapshot).is_ok());
    }

    #[test]
    fn test_total_exposure_limit() {
        let config = CopyConfig {
            max_total_exposure: dec!(30),
            ..Default::default()
        };
        let check = RiskCheck::new(&config);
        let snapshot = ExposureSnapshot {
            open_positions: 2,
            total_exposure: dec!(28),
            ..Default::default()
        };
        let rejection = check.check(&buy(dec!(5)), &snapshot).unwrap_err();
        assert_eq!(rejection.reason, RiskReason::TotalExposure);
        assert_eq!(rejection.would_be, dec!(33));
    }

    #[test]
    fn test_per_market_cap_revalidated() {
        let config = CopyConfig {
            max_bet_amount_per_market: dec!(10),
            ..Default::default()
        };
        let check = RiskCheck::new(&config);
        let snapshot = ExposureSnapshot {
            open_positions: 1,
            total_exposure: dec!(8),
            token_exposure: dec!(8),
            token_open: true,
        };
        let rejection = check.check(&buy(dec!(5)), &snapshot).unwrap_err();
        assert_eq!(rejection.reason.code(), "per_market_cap");
    }

    #[test]
    fn test_sells_always_pass() {
        let config = CopyConfig {
            max_positions: 0,
            ..Default::default()
        };
        let check = RiskCheck::new(&config);
        let mut order = buy(dec!(5));
        order.side = TradeSide::Sell;
        assert!(check.check(&order, &ExposureSnapshot::default()).is_ok());
    }
}
