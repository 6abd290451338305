//! Stop-loss coverage for live positions.
//!
//! Each covered token moves NONE -> ACTIVE -> PENDING -> CLOSED. The polled
//! path runs once per cycle and rests a limit order at the stop price; the
//! pushed path reacts to price ticks and exits with a market order. Both
//! claim a position by flipping `pending` while holding its table entry, so
//! at most one of them ever acts on a token.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use super::CopyConfig;
use crate::api::{
    MarketLookup, OrderExecutor, OrderRequest, OrderState, OrderType, PriceFeed, PriceTick,
};
use crate::models::{market_prefix, stop_price_for, StopLossOrder, StopLossPosition, TradeSide};

/// Above this a position counts as winning no matter where it was entered.
const WINNING_PRICE: Decimal = dec!(0.9);

/// Above entry and above this also counts as winning.
const WINNING_ABOVE_ENTRY: Decimal = dec!(0.5);

/// Less than this left after an exit closes the position.
const DUST_SHARES: Decimal = dec!(0.01);

/// Trigger predicate shared by both paths.
#[derive(Debug, Clone)]
pub struct StopLossRules {
    pub stop_loss_pct: Decimal,
    pub min_hold: Duration,
}

impl StopLossRules {
    pub fn from_config(config: &CopyConfig) -> Self {
        Self {
            stop_loss_pct: config.stop_loss_pct,
            min_hold: config.stop_loss_min_hold(),
        }
    }

    /// A winning position never triggers, whatever the stop math says.
    pub fn is_winning(entry_price: Decimal, price: Decimal) -> bool {
        price > WINNING_PRICE || (price > entry_price && price > WINNING_ABOVE_ENTRY)
    }

    /// Held long enough, at or below the stop, and down at least the
    /// configured percentage.
    pub fn should_trigger(
        &self,
        entry_price: Decimal,
        stop_price: Decimal,
        entry_timestamp: DateTime<Utc>,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> bool {
        if Self::is_winning(entry_price, price) {
            return false;
        }
        if now - entry_timestamp < self.min_hold {
            return false;
        }
        if price > stop_price {
            return false;
        }
        crate::models::loss_pct(entry_price, price) >= self.stop_loss_pct
    }

    pub fn triggers(
        &self,
        position: &StopLossPosition,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> bool {
        self.should_trigger(
            position.entry_price,
            position.stop_price,
            position.entry_timestamp,
            price,
            now,
        )
    }
}

/// The stop-loss table. Every mutation of a token's entry goes through the
/// map's per-shard lock.
#[derive(Debug, Default)]
pub struct StopLossBook {
    positions: DashMap<String, StopLossPosition>,
    orders: DashMap<String, StopLossOrder>,
}

impl StopLossBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, token_id: &str) -> Option<StopLossPosition> {
        self.positions.get(token_id).map(|p| p.clone())
    }

    pub fn contains(&self, token_id: &str) -> bool {
        self.positions.contains_key(token_id)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<StopLossPosition> {
        self.positions.iter().map(|p| p.clone()).collect()
    }

    /// Drop a token's position and any stop order resting for it.
    pub fn remove(&self, token_id: &str) -> Option<StopLossPosition> {
        self.orders.remove(token_id);
        self.positions.remove(token_id).map(|(_, p)| p)
    }

    /// Move an ACTIVE position to PENDING if `decide` approves it. The check
    /// and the flag flip happen under the entry lock, before any await.
    pub fn try_claim<F>(&self, token_id: &str, decide: F) -> Option<StopLossPosition>
    where
        F: FnOnce(&StopLossPosition) -> bool,
    {
        let mut entry = self.positions.get_mut(token_id)?;
        if entry.pending || !decide(&entry) {
            return None;
        }
        entry.pending = true;
        Some(entry.clone())
    }

    /// Back to ACTIVE after a failed exit.
    pub fn release(&self, token_id: &str) {
        if let Some(mut entry) = self.positions.get_mut(token_id) {
            entry.pending = false;
        }
    }

    pub fn mark_checked(&self, token_id: &str, at: DateTime<Utc>) {
        if let Some(mut entry) = self.positions.get_mut(token_id) {
            entry.last_checked = Some(at);
        }
    }

    /// Back to ACTIVE after the exchange dropped our resting stop order.
    pub fn rearm(&self, token_id: &str) {
        self.orders.remove(token_id);
        self.release(token_id);
    }

    pub fn record_order(&self, order: StopLossOrder) {
        self.orders.insert(order.token_id.clone(), order);
    }

    pub fn has_order(&self, token_id: &str) -> bool {
        self.orders.contains_key(token_id)
    }

    pub fn orders(&self) -> Vec<StopLossOrder> {
        self.orders.iter().map(|o| o.clone()).collect()
    }

    /// Positions from an earlier hourly event of the same market series.
    pub fn stale_series(&self, condition_id: &str, market: &str) -> Vec<String> {
        let Some(prefix) = market_prefix(market) else {
            return Vec::new();
        };
        self.positions
            .iter()
            .filter(|p| p.condition_id != condition_id && p.market_prefix() == Some(prefix))
            .map(|p| p.token_id.clone())
            .collect()
    }
}

/// A position the monitor exited.
#[derive(Debug, Clone, PartialEq)]
pub struct StopLossExit {
    pub token_id: String,
    pub market: String,
    pub entry_price: Decimal,
    pub price: Decimal,
    pub shares: Decimal,
    pub loss_pct: Decimal,

    /// Shares bought while the exit was in flight, still covered
    pub remaining_shares: Decimal,

    /// Closed at the settlement price of a resolved market
    pub resolved: bool,

    pub order_id: Option<String>,
}

impl StopLossExit {
    fn new(
        position: &StopLossPosition,
        price: Decimal,
        resolved: bool,
        order_id: Option<String>,
    ) -> Self {
        Self {
            token_id: position.token_id.clone(),
            market: position.market.clone(),
            entry_price: position.entry_price,
            price,
            shares: position.shares,
            loss_pct: position.loss_pct(price),
            remaining_shares: Decimal::ZERO,
            resolved,
            order_id,
        }
    }

    pub fn realized_pnl(&self) -> Decimal {
        (self.price - self.entry_price) * self.shares
    }
}

/// Owns the stop-loss table and the feed subscriptions that go with it.
pub struct StopLossMonitor {
    config: Arc<CopyConfig>,
    rules: StopLossRules,
    book: StopLossBook,
    feed: Option<Arc<dyn PriceFeed>>,
}

impl StopLossMonitor {
    pub fn new(config: Arc<CopyConfig>, feed: Option<Arc<dyn PriceFeed>>) -> Self {
        Self {
            rules: StopLossRules::from_config(&config),
            config,
            book: StopLossBook::new(),
            feed,
        }
    }

    pub fn book(&self) -> &StopLossBook {
        &self.book
    }

    pub fn rules(&self) -> &StopLossRules {
        &self.rules
    }

    fn unsubscribe(&self, token_id: &str) {
        if let Some(feed) = &self.feed {
            feed.unsubscribe(token_id);
        }
    }

    /// Remove a token from coverage and release its subscription.
    pub fn close(&self, token_id: &str) -> Option<StopLossPosition> {
        let removed = self.book.remove(token_id);
        self.unsubscribe(token_id);
        removed
    }

    /// Retire the shares an exit sold. Anything bought while the exit was in
    /// flight stays covered and goes back to ACTIVE at its own entry.
    /// Returns the shares still covered.
    fn finish_exit(&self, token_id: &str, sold_shares: Decimal, sold_entry: Decimal) -> Decimal {
        self.book.orders.remove(token_id);
        let remaining = match self.book.positions.entry(token_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let remaining = entry.get().shares - sold_shares;
                if remaining < DUST_SHARES {
                    entry.remove();
                    Decimal::ZERO
                } else {
                    let position = entry.get_mut();
                    let cost = position.entry_price * position.shares - sold_entry * sold_shares;
                    if cost > Decimal::ZERO {
                        position.entry_price = cost / remaining;
                        position.stop_price =
                            stop_price_for(position.entry_price, self.config.stop_loss_pct);
                    }
                    position.shares = remaining;
                    position.pending = false;
                    remaining
                }
            }
            Entry::Vacant(_) => Decimal::ZERO,
        };

        if remaining.is_zero() {
            self.unsubscribe(token_id);
        } else {
            info!(
                token = %token_id,
                shares = %remaining,
                "Stop-loss kept for shares bought during exit"
            );
        }
        remaining
    }

    /// NONE -> ACTIVE after a BUY fill. Adding to a covered token folds the
    /// new shares in at a blended entry. Returns whether the token is covered.
    pub fn register(
        &self,
        token_id: &str,
        condition_id: &str,
        market: &str,
        entry_price: Decimal,
        shares: Decimal,
    ) -> bool {
        if !self.config.stop_loss_enabled
            || entry_price <= Decimal::ZERO
            || shares <= Decimal::ZERO
        {
            return false;
        }
        if !self.config.matches_stop_loss_filter(condition_id, market) {
            debug!(token = %token_id, market = %market, "Market outside stop-loss filter");
            return false;
        }

        for stale in self.book.stale_series(condition_id, market) {
            info!(
                token = %stale,
                market = %market,
                "Dropping stop-loss from an earlier event in the series"
            );
            self.close(&stale);
        }

        // Blend in place so an exit in flight keeps its PENDING claim.
        let (entry, stop, total) = match self.book.positions.entry(token_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                let total = existing.shares + shares;
                existing.entry_price =
                    (existing.entry_price * existing.shares + entry_price * shares) / total;
                existing.stop_price =
                    stop_price_for(existing.entry_price, self.config.stop_loss_pct);
                existing.shares = total;
                (existing.entry_price, existing.stop_price, total)
            }
            Entry::Vacant(vacant) => {
                let position = vacant.insert(StopLossPosition::new(
                    token_id.to_string(),
                    condition_id.to_string(),
                    market.to_string(),
                    entry_price,
                    shares,
                    self.config.stop_loss_pct,
                ));
                (position.entry_price, position.stop_price, position.shares)
            }
        };

        info!(
            token = %token_id,
            entry = %entry,
            stop = %stop.round_dp(4),
            shares = %total,
            "Stop-loss registered"
        );

        if let Some(feed) = &self.feed {
            feed.subscribe(token_id);
        }
        true
    }

    /// After our SELL: shrink coverage, or drop it when the position is gone.
    pub fn on_sell(&self, token_id: &str, remaining_shares: Decimal) {
        if remaining_shares < DUST_SHARES {
            if self.close(token_id).is_some() {
                debug!(token = %token_id, "Stop-loss released after exit");
            }
            return;
        }
        if let Some(mut entry) = self.book.positions.get_mut(token_id) {
            entry.shares = remaining_shares;
        }
    }

    /// Drop entries whose market no longer matches the filter.
    pub fn sweep_filter(&self) -> usize {
        let mismatched: Vec<String> = self
            .book
            .snapshot()
            .into_iter()
            .filter(|p| !self.config.matches_stop_loss_filter(&p.condition_id, &p.market))
            .map(|p| p.token_id)
            .collect();

        for token in &mismatched {
            warn!(token = %token, "Removed stop-loss: market no longer matches filter");
            self.close(token);
        }
        mismatched.len()
    }

    /// Drop entries whose market has resolved and return their tokens.
    /// Lookup failures leave the entry in place.
    pub async fn sweep_resolved(&self, lookup: &dyn MarketLookup) -> Vec<String> {
        let mut removed = Vec::new();
        for position in self.book.snapshot() {
            if position.condition_id.is_empty() || position.pending {
                continue;
            }
            match lookup.resolution(&position.condition_id).await {
                Ok(Some(resolution)) if resolution.resolved => {
                    info!(
                        token = %position.token_id,
                        market = %position.market,
                        "Market resolved, releasing stop-loss subscription"
                    );
                    self.close(&position.token_id);
                    removed.push(position.token_id);
                }
                Ok(_) => {}
                Err(e) => warn!(token = %position.token_id, error = %e, "Resolution lookup failed"),
            }
        }
        removed
    }

    /// Pushed path: ACTIVE -> CLOSED through a market sell.
    pub async fn handle_tick(
        &self,
        tick: &PriceTick,
        executor: &dyn OrderExecutor,
    ) -> Option<StopLossExit> {
        if !executor.is_ready() {
            return None;
        }

        let position = self.book.get(&tick.token_id)?;
        if !self.config.matches_stop_loss_filter(&position.condition_id, &position.market) {
            warn!(token = %tick.token_id, "Removed stop-loss: market no longer matches filter");
            self.close(&tick.token_id);
            return None;
        }

        let now = Utc::now();
        let claimed = self
            .book
            .try_claim(&tick.token_id, |p| self.rules.triggers(p, tick.price, now))?;

        warn!(
            token = %claimed.token_id,
            entry = %claimed.entry_price,
            price = %tick.price,
            stop = %claimed.stop_price.round_dp(4),
            loss_pct = %claimed.loss_pct(tick.price).round_dp(2),
            side = ?tick.side,
            "Streamed stop-loss triggered"
        );

        let request = OrderRequest {
            token_id: claimed.token_id.clone(),
            side: TradeSide::Sell,
            price: tick.price,
            shares: claimed.shares,
            order_type: OrderType::Fok,
        };

        match executor.place_order(&request).await {
            Ok(receipt) if receipt.success => {
                let mut exit = StopLossExit::new(&claimed, tick.price, false, receipt.order_id);
                exit.remaining_shares =
                    self.finish_exit(&claimed.token_id, claimed.shares, claimed.entry_price);
                Some(exit)
            }
            Ok(receipt) => {
                warn!(
                    token = %claimed.token_id,
                    error = receipt.error.as_deref().unwrap_or("order rejected"),
                    "Stop-loss market sell failed"
                );
                self.book.release(&claimed.token_id);
                None
            }
            Err(e) => {
                warn!(token = %claimed.token_id, error = %e, "Stop-loss market sell failed");
                self.book.release(&claimed.token_id);
                None
            }
        }
    }

    /// Polled path: ACTIVE -> PENDING by resting a limit sell at the stop.
    /// A resolved market is closed at its settlement price instead.
    pub async fn sweep_polled(
        &self,
        lookup: &dyn MarketLookup,
        executor: &dyn OrderExecutor,
        now: DateTime<Utc>,
    ) -> Vec<StopLossExit> {
        let mut exits = Vec::new();
        if !executor.is_ready() {
            return exits;
        }
        let interval = self.config.stop_check_interval();

        for position in self.book.snapshot() {
            if position.pending || self.book.has_order(&position.token_id) {
                continue;
            }
            if position.last_checked.is_some_and(|at| now - at < interval) {
                continue;
            }
            self.book.mark_checked(&position.token_id, now);

            let price = match lookup.current_price(&position.token_id).await {
                Ok(Some(p)) => p,
                Ok(None) => continue,
                Err(e) => {
                    warn!(token = %position.token_id, error = %e, "Price lookup failed");
                    continue;
                }
            };

            let Some(claimed) = self
                .book
                .try_claim(&position.token_id, |p| self.rules.triggers(p, price, now))
            else {
                continue;
            };

            let settlement = match lookup.resolution(&claimed.condition_id).await {
                Ok(resolution) => resolution.and_then(|r| r.final_price()),
                Err(e) => {
                    debug!(token = %claimed.token_id, error = %e, "Resolution lookup failed");
                    None
                }
            };
            let exit_price = settlement.unwrap_or(claimed.stop_price).round_dp(2).max(dec!(0.01));

            warn!(
                token = %claimed.token_id,
                entry = %claimed.entry_price,
                price = %price,
                exit_price = %exit_price,
                resolved = settlement.is_some(),
                "Polled stop-loss triggered"
            );

            let request = OrderRequest {
                token_id: claimed.token_id.clone(),
                side: TradeSide::Sell,
                price: exit_price,
                shares: claimed.shares,
                order_type: OrderType::Gtc,
            };

            match executor.place_order(&request).await {
                Ok(receipt) if receipt.success => match receipt.order_id {
                    Some(order_id) => self.book.record_order(StopLossOrder {
                        token_id: claimed.token_id.clone(),
                        order_id,
                        stop_price: exit_price,
                        entry_price: claimed.entry_price,
                        shares: claimed.shares,
                        placed_at: now,
                    }),
                    None => {
                        let resolved = settlement.is_some();
                        let mut exit = StopLossExit::new(&claimed, exit_price, resolved, None);
                        exit.remaining_shares = self.finish_exit(
                            &claimed.token_id,
                            claimed.shares,
                            claimed.entry_price,
                        );
                        exits.push(exit);
                    }
                },
                Ok(receipt) => {
                    warn!(
                        token = %claimed.token_id,
                        error = receipt.error.as_deref().unwrap_or("order rejected"),
                        "Stop-loss limit order failed"
                    );
                    self.book.release(&claimed.token_id);
                }
                Err(e) => {
                    warn!(token = %claimed.token_id, error = %e, "Stop-loss limit order failed");
                    self.book.release(&claimed.token_id);
                }
            }
        }
        exits
    }

    /// PENDING -> CLOSED once the resting stop order has filled, or back to
    /// ACTIVE when the exchange cancelled or expired it.
    pub async fn confirm_pending(&self, executor: &dyn OrderExecutor) -> Vec<StopLossExit> {
        let mut exits = Vec::new();
        for order in self.book.orders() {
            match executor.order_state(&order.order_id).await {
                Ok(OrderState::Filled) => {
                    let Some(position) = self.book.get(&order.token_id) else {
                        self.book.orders.remove(&order.token_id);
                        continue;
                    };
                    let mut exit = StopLossExit::new(
                        &position,
                        order.stop_price,
                        false,
                        Some(order.order_id.clone()),
                    );
                    exit.entry_price = order.entry_price;
                    exit.shares = order.shares;
                    exit.loss_pct = crate::models::loss_pct(order.entry_price, order.stop_price);
                    exit.remaining_shares =
                        self.finish_exit(&order.token_id, order.shares, order.entry_price);
                    info!(
                        token = %order.token_id,
                        order_id = %order.order_id,
                        pnl = %exit.realized_pnl().round_dp(2),
                        "Stop-loss order filled"
                    );
                    exits.push(exit);
                }
                Ok(OrderState::Cancelled) => {
                    warn!(
                        token = %order.token_id,
                        order_id = %order.order_id,
                        "Stop-loss order cancelled by the exchange, re-arming"
                    );
                    self.book.rearm(&order.token_id);
                }
                Ok(OrderState::Live) => {}
                Err(e) => warn!(
                    order_id = %order.order_id,
                    error = %e,
                    "Order status lookup failed"
                ),
            }
        }
        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::OrderReceipt;
    use crate::models::{MarketResolution, OutcomeToken};
    use anyhow::Result;
    use async_trait::async_trait;
    use dashmap::DashSet;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeFeed {
        tokens: DashSet<String>,
    }

    impl PriceFeed for FakeFeed {
        fn subscribe(&self, token_id: &str) {
            self.tokens.insert(token_id.to_string());
        }
        fn unsubscribe(&self, token_id: &str) {
            self.tokens.remove(token_id);
        }
        fn is_subscribed(&self, token_id: &str) -> bool {
            self.tokens.contains(token_id)
        }
    }

    struct FakeExecutor {
        placed: Mutex<Vec<OrderRequest>>,
        reply: OrderReceipt,
        state: OrderState,
    }

    impl FakeExecutor {
        fn accepting(order_id: Option<&str>) -> Self {
            Self {
                placed: Mutex::new(Vec::new()),
                reply: OrderReceipt {
                    success: true,
                    order_id: order_id.map(str::to_string),
                    error: None,
                },
                state: OrderState::Filled,
            }
        }
    }

    #[async_trait]
    impl OrderExecutor for FakeExecutor {
        fn is_ready(&self) -> bool {
            true
        }
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt> {
            self.placed.lock().unwrap().push(request.clone());
            Ok(self.reply.clone())
        }
        async fn order_state(&self, _order_id: &str) -> Result<OrderState> {
            Ok(self.state)
        }
    }

    /// Holds every order until the test lets it through.
    #[derive(Default)]
    struct GatedExecutor {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl OrderExecutor for GatedExecutor {
        fn is_ready(&self) -> bool {
            true
        }
        async fn place_order(&self, _request: &OrderRequest) -> Result<OrderReceipt> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(OrderReceipt {
                success: true,
                order_id: Some("o1".to_string()),
                error: None,
            })
        }
        async fn order_state(&self, _order_id: &str) -> Result<OrderState> {
            Ok(OrderState::Live)
        }
    }

    #[derive(Default)]
    struct FakeMarkets {
        prices: HashMap<String, Decimal>,
        resolved: HashMap<String, Decimal>,
    }

    #[async_trait]
    impl MarketLookup for FakeMarkets {
        async fn resolution(&self, condition_id: &str) -> Result<Option<MarketResolution>> {
            Ok(Some(MarketResolution {
                condition_id: condition_id.to_string(),
                resolved: self.resolved.contains_key(condition_id),
                settlement_price: self.resolved.get(condition_id).copied(),
            }))
        }
        async fn outcome_tokens(&self, _condition_id: &str) -> Result<Vec<OutcomeToken>> {
            Ok(Vec::new())
        }
        async fn current_price(&self, token_id: &str) -> Result<Option<Decimal>> {
            Ok(self.prices.get(token_id).copied())
        }
    }

    fn config() -> Arc<CopyConfig> {
        Arc::new(CopyConfig {
            stop_loss_pct: dec!(20),
            stop_loss_min_hold_ms: 0,
            ..Default::default()
        })
    }

    fn monitor_with_feed() -> (StopLossMonitor, Arc<FakeFeed>) {
        let feed = Arc::new(FakeFeed::default());
        let monitor = StopLossMonitor::new(config(), Some(feed.clone() as Arc<dyn PriceFeed>));
        (monitor, feed)
    }

    /// Back-date the entry so the minimum hold has passed.
    fn age(monitor: &StopLossMonitor, token: &str, minutes: i64) {
        if let Some(mut p) = monitor.book.positions.get_mut(token) {
            p.entry_timestamp = Utc::now() - Duration::minutes(minutes);
        }
    }

    #[test]
    fn test_trigger_threshold() {
        let rules = StopLossRules {
            stop_loss_pct: dec!(20),
            min_hold: Duration::milliseconds(60_000),
        };
        let entry = dec!(0.70);
        let stop = crate::models::stop_price_for(entry, dec!(20));
        let now = Utc::now();
        let held = now - Duration::minutes(5);

        // 21.4% down: triggers
        assert!(rules.should_trigger(entry, stop, held, dec!(0.55), now));
        // 18.6% down: does not
        assert!(!rules.should_trigger(entry, stop, held, dec!(0.57), now));
        // too fresh
        assert!(!rules.should_trigger(entry, stop, now, dec!(0.55), now));
    }

    #[test]
    fn test_winning_never_triggers() {
        assert!(StopLossRules::is_winning(dec!(0.6), dec!(0.95)));
        assert!(StopLossRules::is_winning(dec!(0.55), dec!(0.6)));
        assert!(!StopLossRules::is_winning(dec!(0.7), dec!(0.6)));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let book = StopLossBook::new();
        book.positions.insert(
            "tok".into(),
            StopLossPosition::new(
                "tok".into(),
                "0xc".into(),
                "m".into(),
                dec!(0.7),
                dec!(10),
                dec!(20),
            ),
        );

        assert!(book.try_claim("tok", |_| true).is_some());
        assert!(book.try_claim("tok", |_| true).is_none());

        book.release("tok");
        assert!(book.try_claim("tok", |_| false).is_none());
        assert!(book.try_claim("tok", |_| true).is_some());
    }

    #[test]
    fn test_register_subscribes_and_drops_stale_series() {
        let (monitor, feed) = monitor_with_feed();
        assert!(monitor.register("old", "0xa", "bitcoin-up-or-down-3pm", dec!(0.5), dec!(10)));
        assert!(feed.is_subscribed("old"));

        assert!(monitor.register("new", "0xb", "bitcoin-up-or-down-4pm", dec!(0.5), dec!(10)));
        assert!(!monitor.book().contains("old"));
        assert!(!feed.is_subscribed("old"));
        assert!(feed.is_subscribed("new"));
    }

    #[test]
    fn test_register_respects_filter() {
        let config = Arc::new(CopyConfig {
            stop_loss_market_filter: vec!["bitcoin".to_string()],
            ..Default::default()
        });
        let monitor = StopLossMonitor::new(config, None);
        assert!(!monitor.register("t", "0xa", "Will ETH close green?", dec!(0.5), dec!(10)));
        assert!(monitor.register("t", "0xa", "Bitcoin up or down", dec!(0.5), dec!(10)));
    }

    #[test]
    fn test_partial_sell_keeps_coverage() {
        let (monitor, feed) = monitor_with_feed();
        monitor.register("tok", "0xa", "m", dec!(0.5), dec!(10));

        monitor.on_sell("tok", dec!(4));
        assert_eq!(monitor.book().get("tok").unwrap().shares, dec!(4));

        monitor.on_sell("tok", Decimal::ZERO);
        assert!(!monitor.book().contains("tok"));
        assert!(!feed.is_subscribed("tok"));
    }

    #[tokio::test]
    async fn test_tick_closes_position() {
        let (monitor, feed) = monitor_with_feed();
        monitor.register("tok", "0xa", "m", dec!(0.70), dec!(10));
        age(&monitor, "tok", 5);
        let executor = FakeExecutor::accepting(Some("o1"));

        let tick = PriceTick {
            token_id: "tok".into(),
            price: dec!(0.57),
            side: None,
        };
        assert!(monitor.handle_tick(&tick, &executor).await.is_none());

        let tick = PriceTick {
            price: dec!(0.55),
            ..tick
        };
        let exit = monitor.handle_tick(&tick, &executor).await.unwrap();
        assert_eq!(exit.price, dec!(0.55));
        assert!(!monitor.book().contains("tok"));
        assert!(!feed.is_subscribed("tok"));

        let placed = executor.placed.lock().unwrap();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].order_type, OrderType::Fok);
    }

    #[tokio::test]
    async fn test_pending_blocks_second_path() {
        let (monitor, _feed) = monitor_with_feed();
        monitor.register("tok", "0xa", "m", dec!(0.70), dec!(10));
        age(&monitor, "tok", 5);

        // Polled path has claimed the position.
        assert!(monitor.book().try_claim("tok", |_| true).is_some());

        let executor = FakeExecutor::accepting(None);
        let tick = PriceTick {
            token_id: "tok".into(),
            price: dec!(0.40),
            side: None,
        };
        assert!(monitor.handle_tick(&tick, &executor).await.is_none());
        assert!(executor.placed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_polled_limit_then_fill() {
        let (monitor, feed) = monitor_with_feed();
        monitor.register("tok", "0xa", "m", dec!(0.70), dec!(10));
        age(&monitor, "tok", 5);

        let markets = FakeMarkets {
            prices: HashMap::from([("tok".to_string(), dec!(0.50))]),
            ..Default::default()
        };
        let executor = FakeExecutor::accepting(Some("o1"));

        let exits = monitor.sweep_polled(&markets, &executor, Utc::now()).await;
        assert!(exits.is_empty());
        assert!(monitor.book().has_order("tok"));
        assert!(monitor.book().get("tok").unwrap().pending);
        {
            let placed = executor.placed.lock().unwrap();
            assert_eq!(placed[0].order_type, OrderType::Gtc);
            assert_eq!(placed[0].price, dec!(0.56));
        }

        let exits = monitor.confirm_pending(&executor).await;
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].realized_pnl(), dec!(-1.40));
        assert!(!monitor.book().contains("tok"));
        assert!(!feed.is_subscribed("tok"));
    }

    #[tokio::test]
    async fn test_polled_uses_settlement_price_when_resolved() {
        let (monitor, _feed) = monitor_with_feed();
        monitor.register("tok", "0xa", "m", dec!(0.70), dec!(10));
        age(&monitor, "tok", 5);

        let markets = FakeMarkets {
            prices: HashMap::from([("tok".to_string(), dec!(0.10))]),
            resolved: HashMap::from([("0xa".to_string(), dec!(0.05))]),
        };
        let executor = FakeExecutor::accepting(Some("o1"));
        monitor.sweep_polled(&markets, &executor, Utc::now()).await;

        assert_eq!(executor.placed.lock().unwrap()[0].price, dec!(0.05));
    }

    #[tokio::test]
    async fn test_failed_order_releases_pending() {
        let (monitor, _feed) = monitor_with_feed();
        monitor.register("tok", "0xa", "m", dec!(0.70), dec!(10));
        age(&monitor, "tok", 5);

        let markets = FakeMarkets {
            prices: HashMap::from([("tok".to_string(), dec!(0.50))]),
            ..Default::default()
        };
        let executor = FakeExecutor {
            placed: Mutex::new(Vec::new()),
            reply: OrderReceipt::rejected("not enough balance"),
            state: OrderState::Live,
        };
        monitor.sweep_polled(&markets, &executor, Utc::now()).await;

        let position = monitor.book().get("tok").unwrap();
        assert!(!position.pending);
        assert!(!monitor.book().has_order("tok"));
    }

    #[tokio::test]
    async fn test_sweep_resolved_unsubscribes() {
        let (monitor, feed) = monitor_with_feed();
        monitor.register("tok", "0xa", "m", dec!(0.70), dec!(10));

        let markets = FakeMarkets {
            resolved: HashMap::from([("0xa".to_string(), dec!(1))]),
            ..Default::default()
        };
        assert_eq!(monitor.sweep_resolved(&markets).await, vec!["tok".to_string()]);
        assert!(!feed.is_subscribed("tok"));
    }

    #[tokio::test]
    async fn test_buy_during_market_exit_keeps_new_shares_covered() {
        let (monitor, feed) = monitor_with_feed();
        monitor.register("tok", "0xa", "m", dec!(0.70), dec!(10));
        age(&monitor, "tok", 5);

        let executor = GatedExecutor::default();
        let tick = PriceTick {
            token_id: "tok".into(),
            price: dec!(0.50),
            side: None,
        };

        let buy = async {
            executor.entered.notified().await;
            assert!(monitor.register("tok", "0xa", "m", dec!(0.50), dec!(10)));
            let position = monitor.book().get("tok").unwrap();
            assert!(position.pending);
            assert_eq!(position.shares, dec!(20));
            executor.release.notify_one();
        };
        let (exit, ()) = tokio::join!(monitor.handle_tick(&tick, &executor), buy);

        let exit = exit.unwrap();
        assert_eq!(exit.shares, dec!(10));
        assert_eq!(exit.remaining_shares, dec!(10));

        let position = monitor.book().get("tok").unwrap();
        assert_eq!(position.shares, dec!(10));
        assert_eq!(position.entry_price, dec!(0.50));
        assert_eq!(position.stop_price, dec!(0.40));
        assert!(!position.pending);
        assert!(feed.is_subscribed("tok"));
    }

    #[tokio::test]
    async fn test_buy_while_stop_order_rests_survives_fill() {
        let (monitor, feed) = monitor_with_feed();
        monitor.register("tok", "0xa", "m", dec!(0.70), dec!(10));
        age(&monitor, "tok", 5);

        let markets = FakeMarkets {
            prices: HashMap::from([("tok".to_string(), dec!(0.50))]),
            ..Default::default()
        };
        let executor = FakeExecutor::accepting(Some("o1"));
        monitor.sweep_polled(&markets, &executor, Utc::now()).await;
        assert!(monitor.book().has_order("tok"));

        monitor.register("tok", "0xa", "m", dec!(0.40), dec!(5));

        let exits = monitor.confirm_pending(&executor).await;
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].shares, dec!(10));
        assert_eq!(exits[0].realized_pnl(), dec!(-1.40));
        assert_eq!(exits[0].remaining_shares, dec!(5));

        let position = monitor.book().get("tok").unwrap();
        assert_eq!(position.shares, dec!(5));
        assert_eq!(position.entry_price, dec!(0.40));
        assert!(!position.pending);
        assert!(!monitor.book().has_order("tok"));
        assert!(feed.is_subscribed("tok"));
    }

    #[tokio::test]
    async fn test_cancelled_stop_order_is_rearmed() {
        let (monitor, _feed) = monitor_with_feed();
        monitor.register("tok", "0xa", "m", dec!(0.70), dec!(10));
        age(&monitor, "tok", 5);

        let markets = FakeMarkets {
            prices: HashMap::from([("tok".to_string(), dec!(0.50))]),
            ..Default::default()
        };
        let executor = FakeExecutor {
            state: OrderState::Cancelled,
            ..FakeExecutor::accepting(Some("o1"))
        };
        let now = Utc::now();
        monitor.sweep_polled(&markets, &executor, now).await;
        assert!(monitor.book().has_order("tok"));

        assert!(monitor.confirm_pending(&executor).await.is_empty());
        let position = monitor.book().get("tok").unwrap();
        assert!(!position.pending);
        assert!(!monitor.book().has_order("tok"));

        monitor
            .sweep_polled(&markets, &executor, now + Duration::hours(1))
            .await;
        assert_eq!(executor.placed.lock().unwrap().len(), 2);
        assert!(monitor.book().has_order("tok"));
    }
}
