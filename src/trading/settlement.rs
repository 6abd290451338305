//! Paper position exits: stop-losses and market settlement.
//!
//! Paper positions carry their own pending flag in the ledger. Settlement
//! ignores it, so a resolved market always closes at the resolution price
//! even when a stop-loss has already claimed the position.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::paper::{HistoryKind, PaperLedger, PaperPosition};
use super::stop_loss::{StopLossExit, StopLossRules};
use super::CopyConfig;
use crate::api::MarketLookup;
use crate::models::{loss_pct, opposite_outcome, stop_price_for, token_for_outcome};

/// Opposite-side buys older than this are ignored by the wrong-token check.
const RECENT_BUY_WINDOW_MINUTES: i64 = 5;

/// Buy records older than this are pruned.
const BUY_HISTORY_RETENTION_HOURS: i64 = 24;

/// One copied BUY, kept for the opposite-outcome check.
#[derive(Debug, Clone, PartialEq)]
pub struct BuyRecord {
    pub condition_id: String,
    pub outcome: String,
    pub price: Decimal,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct BuyHistory {
    records: Vec<BuyRecord>,
}

impl BuyHistory {
    pub fn record(&mut self, condition_id: &str, outcome: &str, price: Decimal, at: DateTime<Utc>) {
        self.records.push(BuyRecord {
            condition_id: condition_id.to_string(),
            outcome: outcome.to_string(),
            price,
            at,
        });
        let cutoff = at - Duration::hours(BUY_HISTORY_RETENTION_HOURS);
        self.records.retain(|r| r.at >= cutoff);
    }

    /// Prices of buys for one outcome of a market since `since`.
    pub fn recent_prices(
        &self,
        condition_id: &str,
        outcome: &str,
        since: DateTime<Utc>,
    ) -> Vec<Decimal> {
        self.records
            .iter()
            .filter(|r| {
                r.at >= since
                    && r.condition_id == condition_id
                    && r.outcome.eq_ignore_ascii_case(outcome)
            })
            .map(|r| r.price)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Best-effort check that the price we see belongs to the token we hold.
///
/// Suspicious when the opposite side was recently bought cheap while ours
/// trades near zero, or when both sides look like winners (or both like
/// losers). Can misfire either way.
pub fn wrong_token_suspected(
    entry: Decimal,
    price: Decimal,
    opposite_price: Option<Decimal>,
    opposite_recent_buys: &[Decimal],
) -> bool {
    let half = dec!(0.5);

    let bought_above_entry = opposite_recent_buys.iter().any(|p| *p > entry);
    let bought_cheap = opposite_recent_buys.iter().any(|p| *p < entry && *p < dec!(0.3));
    if bought_cheap && price < dec!(0.1) && !bought_above_entry {
        return true;
    }

    let Some(opposite) = opposite_price else {
        return false;
    };
    let both_winning = opposite > entry && opposite > half && price > entry && price > half;
    let both_losing = opposite < entry && opposite < half && price < entry && price < half;
    both_winning || both_losing
}

/// A paper position closed at market resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub token_id: String,
    pub market: String,
    pub shares: Decimal,
    pub price: Decimal,
    pub pnl: Decimal,
}

pub struct SettlementChecker {
    config: Arc<CopyConfig>,
    rules: StopLossRules,
}

impl SettlementChecker {
    pub fn new(config: Arc<CopyConfig>) -> Self {
        Self {
            rules: StopLossRules::from_config(&config),
            config,
        }
    }

    /// Close every paper position whose market has resolved.
    pub async fn settle_resolved(
        &self,
        ledger: &RwLock<PaperLedger>,
        lookup: &dyn MarketLookup,
    ) -> Vec<Settlement> {
        let positions: Vec<PaperPosition> = ledger.read().await.positions().cloned().collect();
        let mut prices: HashMap<String, Option<Decimal>> = HashMap::new();
        let mut settled = Vec::new();

        for position in positions {
            if position.condition_id.is_empty() {
                continue;
            }

            if !prices.contains_key(&position.condition_id) {
                let price = match lookup.resolution(&position.condition_id).await {
                    Ok(resolution) => resolution.and_then(|r| r.final_price()),
                    Err(e) => {
                        warn!(market = %position.market, error = %e, "Resolution lookup failed");
                        None
                    }
                };
                prices.insert(position.condition_id.clone(), price);
            }
            let Some(price) = prices.get(&position.condition_id).copied().flatten() else {
                continue;
            };

            let mut ledger = ledger.write().await;
            match ledger.settle(&position.token_id, price) {
                Ok(fill) => {
                    let pnl = fill.pnl.unwrap_or_default();
                    info!(
                        token = %position.token_id,
                        market = %position.market,
                        price = %price,
                        pnl = %pnl.round_dp(2),
                        was_pending = position.stop_loss_pending,
                        "Paper position settled"
                    );
                    settled.push(Settlement {
                        token_id: position.token_id.clone(),
                        market: position.market.clone(),
                        shares: fill.shares,
                        price,
                        pnl,
                    });
                }
                Err(e) => debug!(token = %position.token_id, error = %e, "Nothing to settle"),
            }
        }
        settled
    }

    /// Polled stop-loss over paper positions.
    pub async fn paper_stop_losses(
        &self,
        ledger: &RwLock<PaperLedger>,
        lookup: &dyn MarketLookup,
        history: &BuyHistory,
        now: DateTime<Utc>,
    ) -> Vec<StopLossExit> {
        let mut exits = Vec::new();
        if !self.config.stop_loss_enabled {
            return exits;
        }

        let interval = self.config.stop_check_interval();
        let positions: Vec<PaperPosition> = ledger.read().await.positions().cloned().collect();

        for position in positions {
            if position.stop_loss_pending || position.condition_id.is_empty() {
                continue;
            }
            if !self.config.matches_stop_loss_filter(&position.condition_id, &position.market) {
                continue;
            }
            if position.last_checked.is_some_and(|at| now - at < interval) {
                continue;
            }
            ledger.write().await.mark_checked(&position.token_id, now);

            let price = match lookup.current_price(&position.token_id).await {
                Ok(Some(p)) => p,
                Ok(None) => continue,
                Err(e) => {
                    warn!(token = %position.token_id, error = %e, "Price lookup failed");
                    continue;
                }
            };

            let entry = position.avg_price;
            let stop = stop_price_for(entry, self.config.stop_loss_pct);
            if !self
                .rules
                .should_trigger(entry, stop, position.entry_timestamp, price, now)
            {
                continue;
            }

            if self.suspect_wrong_token(&position, price, lookup, history, now).await {
                warn!(
                    token = %position.token_id,
                    market = %position.market,
                    outcome = %position.outcome,
                    price = %price,
                    "Opposite outcome disagrees with our price, skipping stop-loss"
                );
                continue;
            }

            if !ledger.write().await.try_mark_pending(&position.token_id) {
                continue;
            }

            let settlement = match lookup.resolution(&position.condition_id).await {
                Ok(resolution) => resolution.and_then(|r| r.final_price()),
                Err(e) => {
                    debug!(token = %position.token_id, error = %e, "Resolution lookup failed");
                    None
                }
            };
            let exit_price = settlement.unwrap_or(stop);

            let mut ledger = ledger.write().await;
            let sold = ledger.sell(
                &position.token_id,
                position.shares,
                exit_price,
                HistoryKind::StopLoss,
            );
            match sold {
                Ok(fill) => {
                    warn!(
                        token = %position.token_id,
                        entry = %entry,
                        price = %price,
                        exit_price = %exit_price,
                        resolved = settlement.is_some(),
                        pnl = %fill.pnl.unwrap_or_default().round_dp(2),
                        "Paper stop-loss executed"
                    );
                    exits.push(StopLossExit {
                        token_id: position.token_id.clone(),
                        market: position.market.clone(),
                        entry_price: entry,
                        price: exit_price,
                        shares: fill.shares,
                        loss_pct: loss_pct(entry, exit_price),
                        remaining_shares: Decimal::ZERO,
                        resolved: settlement.is_some(),
                        order_id: None,
                    });
                }
                Err(e) => {
                    warn!(token = %position.token_id, error = %e, "Paper stop-loss failed");
                    ledger.clear_pending(&position.token_id);
                }
            }
        }
        exits
    }

    async fn suspect_wrong_token(
        &self,
        position: &PaperPosition,
        price: Decimal,
        lookup: &dyn MarketLookup,
        history: &BuyHistory,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(opposite) = opposite_outcome(&position.outcome) else {
            return false;
        };

        let since = now - Duration::minutes(RECENT_BUY_WINDOW_MINUTES);
        let recent = history.recent_prices(&position.condition_id, opposite, since);

        let opposite_price = match lookup.outcome_tokens(&position.condition_id).await {
            Ok(tokens) => match token_for_outcome(&tokens, opposite) {
                Some(token) => lookup.current_price(&token.token_id).await.ok().flatten(),
                None => None,
            },
            Err(e) => {
                debug!(token = %position.token_id, error = %e, "Outcome token lookup failed");
                None
            }
        };

        wrong_token_suspected(position.avg_price, price, opposite_price, &recent)
    }
}
