//! Order sizing for copy trades.
//!
//! BUY orders come in three tiers by price: a one-time high-confidence add,
//! a default fixed-notional order (optionally scaled in the optimal band and
//! halved for initial trades), and the size label that only describes how
//! large the tracked wallet's own trade was. Every BUY is clamped to the
//! headroom left under the per-market cap.
//!
//! SELL orders mirror the fraction of its position the tracked wallet exited.

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info};

use super::CopyConfig;
use crate::models::{TradeEvent, TradeSide};

/// What the sizer needs to know about our current state in the token.
#[derive(Debug, Clone, Default)]
pub struct SizingContext {
    /// Notional we already hold in this token
    pub current_exposure: Decimal,

    /// Shares we hold in this token
    pub own_shares: Decimal,

    /// Shares the tracked wallet still holds after its SELL, when known
    pub tracked_remaining_shares: Option<Decimal>,

    /// A default-tier BUY was already copied for this token
    pub initial_placed: bool,

    /// The one high-confidence add was already placed for this token
    pub add_placed: bool,
}

/// A sized order ready for risk checks.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub side: TradeSide,

    /// Shares, rounded to 2 decimals
    pub shares: Decimal,

    /// shares * price
    pub value: Decimal,

    pub price: Decimal,

    /// Informational size label
    pub label: String,

    pub high_confidence_add: bool,

    /// Value was reduced to fit under the per-market cap
    pub capped: bool,

    /// Value was raised to the venue minimum
    pub bumped: bool,
}

/// Why an order could not be sized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizingSkip {
    /// Price is zero or negative; value cannot be determined
    InvalidPrice,
    PerMarketCapReached { current: Decimal, cap: Decimal },
    InitialAlreadyPlaced,
    HighConfidenceAddAlreadyPlaced,
    InsufficientRoom { remaining: Decimal, min: Decimal },
    /// Minimum order would overshoot the cap
    MinimumExceedsCap { current: Decimal, min: Decimal, cap: Decimal },
    NoPosition,
    /// Rounded to zero shares
    ZeroSize,
}

impl SizingSkip {
    /// Stable code for journals and notifications.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPrice => "invalid_price",
            Self::PerMarketCapReached { .. } => "per_market_cap_reached",
            Self::InitialAlreadyPlaced => "initial_already_placed",
            Self::HighConfidenceAddAlreadyPlaced => "high_confidence_add_already_placed",
            Self::InsufficientRoom { .. } => "insufficient_room",
            Self::MinimumExceedsCap { .. } => "minimum_exceeds_cap",
            Self::NoPosition => "no_position",
            Self::ZeroSize => "zero_size",
        }
    }
}

impl std::fmt::Display for SizingSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPrice => write!(f, "price is not positive"),
            Self::PerMarketCapReached { current, cap } => {
                write!(f, "position ${} already at max ${} per market", current.round_dp(2), cap)
            }
            Self::InitialAlreadyPlaced => {
                write!(f, "initial trade already placed; room reserved for high-confidence add")
            }
            Self::HighConfidenceAddAlreadyPlaced => {
                write!(f, "high-confidence add already placed for this market")
            }
            Self::InsufficientRoom { remaining, min } => {
                write!(f, "only ${} left under cap, need ${}", remaining.round_dp(2), min)
            }
            Self::MinimumExceedsCap { current, min, cap } => write!(
                f,
                "minimum order ${} on top of ${} would exceed max ${}",
                min,
                current.round_dp(2),
                cap
            ),
            Self::NoPosition => write!(f, "no position to sell"),
            Self::ZeroSize => write!(f, "order rounds to zero shares"),
        }
    }
}

/// Computes order sizes from config and per-token state.
pub struct PositionSizer<'a> {
    config: &'a CopyConfig,
}

impl<'a> PositionSizer<'a> {
    pub fn new(config: &'a CopyConfig) -> Self {
        Self { config }
    }

    /// Size a copy of `event`.
    pub fn size(&self, event: &TradeEvent, ctx: &SizingContext) -> Result<SizedOrder, SizingSkip> {
        if event.price <= Decimal::ZERO {
            return Err(SizingSkip::InvalidPrice);
        }
        match event.side {
            TradeSide::Buy => self.size_buy(event, ctx),
            TradeSide::Sell => self.size_sell(event, ctx),
        }
    }

    /// Last-moment headroom check for a high-confidence add, against fresh
    /// exposure.
    pub fn recheck_high_confidence(
        &self,
        value: Decimal,
        current_exposure: Decimal,
    ) -> Result<(), SizingSkip> {
        let remaining = (self.config.max_bet_per_market() - current_exposure).max(Decimal::ZERO);
        if value > remaining && remaining < Decimal::ONE {
            return Err(SizingSkip::InsufficientRoom {
                remaining,
                min: Decimal::ONE,
            });
        }
        Ok(())
    }

    /// Informational label from the tracked wallet's notional.
    pub fn size_label(&self, event: &TradeEvent) -> String {
        let notional = event.notional();
        let mut label = if self.config.in_optimal_range(event.price) {
            "HIGH SIZE (OPTIMAL PRICE RANGE)"
        } else if notional >= self.config.high_confidence_threshold {
            "HIGH SIZE"
        } else if notional <= self.config.low_confidence_threshold {
            "LOW SIZE"
        } else {
            "MEDIUM SIZE"
        }
        .to_string();

        if self.config.half_size_initial_trades {
            label.push_str(" (HALF-SIZE)");
        }
        label
    }

    fn size_buy(&self, event: &TradeEvent, ctx: &SizingContext) -> Result<SizedOrder, SizingSkip> {
        let cap = self.config.max_bet_per_market();
        let current = ctx.current_exposure;

        if current >= cap {
            return Err(SizingSkip::PerMarketCapReached { current, cap });
        }

        let high_confidence_add = self.config.in_high_confidence_band(event.price);
        if !high_confidence_add && ctx.initial_placed {
            return Err(SizingSkip::InitialAlreadyPlaced);
        }

        let remaining = (cap - current).max(Decimal::ZERO);

        let (mut value, label, min) = if high_confidence_add {
            if ctx.add_placed {
                return Err(SizingSkip::HighConfidenceAddAlreadyPlaced);
            }
            let add_size = self.config.add_high_confidence_size;
            let min = add_size.min(Decimal::ONE);
            if remaining < min {
                return Err(SizingSkip::InsufficientRoom { remaining, min });
            }
            (add_size.min(remaining), "HIGH CONFIDENCE ADD".to_string(), min)
        } else {
            let mut value = self.config.auto_trade_amount;
            if self.config.in_optimal_range(event.price) {
                value *= self.config.optimal_multiplier;
            }
            value = value.min(cap);

            let mut min = self.config.min_order_value();
            if self.config.half_size_initial_trades {
                value /= Decimal::TWO;
                min /= Decimal::TWO;
            }
            (value, self.size_label(event), min)
        };

        let mut capped = false;
        let mut bumped = false;

        if value > remaining {
            value = remaining;
            capped = true;
        }

        if value < min {
            if current + min > cap {
                return Err(SizingSkip::MinimumExceedsCap { current, min, cap });
            }
            value = min;
            bumped = true;
        }

        let shares = round_shares(value / event.price, event.price, remaining);
        if shares.is_zero() {
            return Err(SizingSkip::ZeroSize);
        }
        let value = shares * event.price;

        info!(
            token = %event.token_id,
            label = %label,
            value = %value,
            shares = %shares,
            remaining = %remaining,
            capped,
            bumped,
            "Sized BUY"
        );

        Ok(SizedOrder {
            side: TradeSide::Buy,
            shares,
            value,
            price: event.price,
            label,
            high_confidence_add,
            capped,
            bumped,
        })
    }

    fn size_sell(&self, event: &TradeEvent, ctx: &SizingContext) -> Result<SizedOrder, SizingSkip> {
        let own = ctx.own_shares;
        if own <= Decimal::ZERO {
            return Err(SizingSkip::NoPosition);
        }

        let price = event.price;
        let min_value = self.config.min_order_value();
        let sold = event.shares();
        let mut shares = Decimal::ZERO;

        if let (true, Some(remaining)) = (sold > Decimal::ZERO, ctx.tracked_remaining_shares) {
            let total = remaining + sold;
            if total > Decimal::ZERO {
                let fraction = sold / total;
                shares = own * fraction;
                if shares * price < min_value {
                    shares = min_value / price;
                }
                shares = shares.min(own);
                debug!(
                    token = %event.token_id,
                    fraction = %fraction,
                    tracked_total = %total,
                    "Mirroring tracked wallet exit fraction"
                );
            }
        }

        if shares.is_zero() {
            shares = if event.size > Decimal::ZERO {
                event.size.min(own)
            } else if event.usdc_size > Decimal::ZERO {
                (event.usdc_size / price).min(own)
            } else {
                (min_value / price).min(own)
            };
        }

        let mut bumped = false;
        if shares * price < min_value {
            shares = (min_value / price).min(own);
            bumped = true;
        }

        let shares = round_shares(shares, Decimal::ONE, own);
        if shares.is_zero() {
            return Err(SizingSkip::ZeroSize);
        }

        Ok(SizedOrder {
            side: TradeSide::Sell,
            shares,
            value: shares * price,
            price,
            label: "SELL".to_string(),
            high_confidence_add: false,
            capped: false,
            bumped,
        })
    }
}

/// Round shares to 2 decimals, half-up unless that pushes `shares * unit`
/// past `limit`, in which case round down.
fn round_shares(shares: Decimal, unit: Decimal, limit: Decimal) -> Decimal {
    let rounded = shares.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    if rounded * unit > limit {
        shares.round_dp_with_strategy(2, RoundingStrategy::ToZero)
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderKind;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn event(side: TradeSide, price: Decimal, size: Decimal) -> TradeEvent {
        TradeEvent {
            id: "0x1".to_string(),
            condition_id: "0xcond".to_string(),
            token_id: "tok".to_string(),
            side,
            price,
            size,
            usdc_size: size * price,
            outcome: "Yes".to_string(),
            title: String::new(),
            slug: String::new(),
            event_slug: String::new(),
            timestamp: Utc::now(),
            order_kind: OrderKind::Unknown,
        }
    }

    fn config() -> CopyConfig {
        CopyConfig {
            max_bet_amount_per_market: dec!(20),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_buy() {
        let config = config();
        let sizer = PositionSizer::new(&config);
        let order = sizer
            .size(&event(TradeSide::Buy, dec!(0.5), dec!(200)), &SizingContext::default())
            .unwrap();

        assert_eq!(order.value, dec!(5));
        assert_eq!(order.shares, dec!(10));
        assert_eq!(order.label, "HIGH SIZE");
        assert!(!order.high_confidence_add);
    }

    #[test]
    fn test_optimal_range_multiplier_and_half_size() {
        let config = CopyConfig {
            half_size_initial_trades: true,
            ..config()
        };
        let sizer = PositionSizer::new(&config);
        let order = sizer
            .size(&event(TradeSide::Buy, dec!(0.65), dec!(10)), &SizingContext::default())
            .unwrap();

        // 5 * 1.5 / 2 = 3.75 -> 5.77 shares at 0.65
        assert_eq!(order.shares, dec!(5.77));
        assert_eq!(order.value, dec!(3.7505));
        assert_eq!(order.label, "HIGH SIZE (OPTIMAL PRICE RANGE) (HALF-SIZE)");
    }

    #[test]
    fn test_buy_value_never_exceeds_headroom() {
        let config = config();
        let sizer = PositionSizer::new(&config);
        let cap = config.max_bet_per_market();

        for current in [dec!(0), dec!(9.99), dec!(14), dec!(16.3), dec!(17.5)] {
            for price in [dec!(0.33), dec!(0.5), dec!(0.67), dec!(0.85), dec!(0.99)] {
                let ctx = SizingContext {
                    current_exposure: current,
                    ..Default::default()
                };
                if let Ok(order) = sizer.size(&event(TradeSide::Buy, price, dec!(50)), &ctx) {
                    assert!(
                        order.value <= cap - current,
                        "value {} over headroom {} at price {}",
                        order.value,
                        cap - current,
                        price
                    );
                }
            }
        }
    }

    #[test]
    fn test_clamped_below_minimum_skips() {
        let config = config();
        let sizer = PositionSizer::new(&config);
        let ctx = SizingContext {
            current_exposure: dec!(17),
            ..Default::default()
        };
        let result = sizer.size(&event(TradeSide::Buy, dec!(0.5), dec!(50)), &ctx);
        assert!(matches!(result, Err(SizingSkip::MinimumExceedsCap { .. })));
    }

    #[test]
    fn test_cap_reached_early() {
        let config = config();
        let sizer = PositionSizer::new(&config);
        let ctx = SizingContext {
            current_exposure: dec!(20),
            ..Default::default()
        };
        let err = sizer
            .size(&event(TradeSide::Buy, dec!(0.5), dec!(50)), &ctx)
            .unwrap_err();
        assert_eq!(err.code(), "per_market_cap_reached");
    }

    #[test]
    fn test_initial_trade_gate() {
        let config = config();
        let sizer = PositionSizer::new(&config);
        let ctx = SizingContext {
            current_exposure: dec!(5),
            initial_placed: true,
            ..Default::default()
        };
        assert_eq!(
            sizer.size(&event(TradeSide::Buy, dec!(0.6), dec!(50)), &ctx),
            Err(SizingSkip::InitialAlreadyPlaced)
        );
        // High-confidence band still goes through
        assert!(sizer.size(&event(TradeSide::Buy, dec!(0.85), dec!(50)), &ctx).is_ok());
    }

    #[test]
    fn test_second_high_confidence_add_skipped() {
        let config = config();
        let sizer = PositionSizer::new(&config);
        let first = SizingContext {
            current_exposure: dec!(5),
            initial_placed: true,
            ..Default::default()
        };
        let order = sizer
            .size(&event(TradeSide::Buy, dec!(0.85), dec!(50)), &first)
            .unwrap();
        assert!(order.high_confidence_add);
        assert_eq!(order.label, "HIGH CONFIDENCE ADD");

        let second = SizingContext {
            current_exposure: dec!(5) + order.value,
            initial_placed: true,
            add_placed: true,
            ..Default::default()
        };
        assert_eq!(
            sizer.size(&event(TradeSide::Buy, dec!(0.88), dec!(50)), &second),
            Err(SizingSkip::HighConfidenceAddAlreadyPlaced)
        );
    }

    #[test]
    fn test_high_confidence_add_limited_to_headroom() {
        let config = config();
        let sizer = PositionSizer::new(&config);
        let ctx = SizingContext {
            current_exposure: dec!(17),
            ..Default::default()
        };
        let order = sizer
            .size(&event(TradeSide::Buy, dec!(0.80), dec!(50)), &ctx)
            .unwrap();
        assert_eq!(order.value, dec!(3));

        let full = SizingContext {
            current_exposure: dec!(19.5),
            ..Default::default()
        };
        assert!(matches!(
            sizer.size(&event(TradeSide::Buy, dec!(0.80), dec!(50)), &full),
            Err(SizingSkip::InsufficientRoom { .. })
        ));
        assert!(sizer.recheck_high_confidence(dec!(3), dec!(19.5)).is_err());
        assert!(sizer.recheck_high_confidence(dec!(3), dec!(17)).is_ok());
    }

    #[test]
    fn test_sell_mirrors_fraction() {
        let config = config();
        let sizer = PositionSizer::new(&config);
        // Tracked wallet sold 50 of 100 shares; we hold 40.
        let ctx = SizingContext {
            own_shares: dec!(40),
            tracked_remaining_shares: Some(dec!(50)),
            ..Default::default()
        };
        let order = sizer
            .size(&event(TradeSide::Sell, dec!(0.5), dec!(50)), &ctx)
            .unwrap();
        assert_eq!(order.shares, dec!(20));
        assert_eq!(order.value, dec!(10));
    }

    #[test]
    fn test_sell_never_exceeds_holdings() {
        let config = config();
        let sizer = PositionSizer::new(&config);

        for own in [dec!(0.5), dec!(3.333), dec!(7), dec!(12.345)] {
            for remaining in [None, Some(dec!(0)), Some(dec!(10)), Some(dec!(1000))] {
                let ctx = SizingContext {
                    own_shares: own,
                    tracked_remaining_shares: remaining,
                    ..Default::default()
                };
                if let Ok(order) = sizer.size(&event(TradeSide::Sell, dec!(0.37), dec!(25)), &ctx) {
                    assert!(order.shares <= own, "{} > {}", order.shares, own);
                }
            }
        }
    }

    #[test]
    fn test_sell_without_position() {
        let config = config();
        let sizer = PositionSizer::new(&config);
        assert_eq!(
            sizer.size(&event(TradeSide::Sell, dec!(0.5), dec!(10)), &SizingContext::default()),
            Err(SizingSkip::NoPosition)
        );
    }

    #[test]
    fn test_invalid_price() {
        let config = config();
        let sizer = PositionSizer::new(&config);
        assert_eq!(
            sizer.size(&event(TradeSide::Buy, dec!(0), dec!(10)), &SizingContext::default()),
            Err(SizingSkip::InvalidPrice)
        );
    }
}
