//! Paper trading ledger.
//!
//! Simulated fills at the observed price. The shape of a fill matches what
//! the live path reports, so the rest of the engine does not care which
//! mode it runs in.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::TradeSide;

/// Remaining shares below this are treated as a closed position.
const DUST_SHARES: Decimal = dec!(0.0001);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaperError {
    #[error("insufficient paper balance: need ${needed}, have ${available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    #[error("no paper position in {0}")]
    NoPosition(String),

    #[error("invalid price {0}")]
    InvalidPrice(Decimal),

    #[error("order has no size")]
    ZeroSize,
}

/// Market metadata carried on a paper position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionMeta {
    pub market: String,
    pub condition_id: String,
    pub outcome: String,
}

/// A simulated holding in one outcome token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperPosition {
    pub token_id: String,
    pub shares: Decimal,
    pub avg_price: Decimal,

    /// Cost basis of the remaining shares
    pub entry_value: Decimal,

    pub market: String,
    pub condition_id: String,
    pub outcome: String,
    pub entry_timestamp: DateTime<Utc>,
    pub last_checked: Option<DateTime<Utc>>,
    pub stop_loss_pending: bool,
}

impl PaperPosition {
    pub fn value_at(&self, price: Decimal) -> Decimal {
        self.shares * price
    }

    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        self.value_at(price) - self.entry_value
    }
}

/// Label of a ledger history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryKind {
    Buy,
    Sell,
    StopLoss,
    Settlement,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::StopLoss => "STOP_LOSS",
            Self::Settlement => "SETTLEMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "STOP_LOSS" => Some(Self::StopLoss),
            "SETTLEMENT" => Some(Self::Settlement),
            _ => None,
        }
    }

    /// Closing entries reduce a position.
    pub fn is_exit(&self) -> bool {
        !matches!(self, Self::Buy)
    }
}

/// One append-only ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: HistoryKind,
    pub token_id: String,
    pub market: String,
    pub outcome: String,
    pub shares: Decimal,
    pub price: Decimal,
    pub value: Decimal,

    /// Realized P&L, exits only
    pub pnl: Option<Decimal>,
}

/// Result of a simulated fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperFill {
    pub token_id: String,
    pub side: TradeSide,
    pub shares: Decimal,
    pub price: Decimal,
    pub value: Decimal,
    pub pnl: Option<Decimal>,
    pub balance_after: Decimal,
}

/// In-memory simulated account.
#[derive(Debug, Clone)]
pub struct PaperLedger {
    balance: Decimal,
    starting_balance: Decimal,
    realized_pnl: Decimal,
    positions: HashMap<String, PaperPosition>,
    history: Vec<HistoryEntry>,
    started_at: DateTime<Utc>,
}

impl PaperLedger {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            balance: starting_balance,
            starting_balance,
            realized_pnl: Decimal::ZERO,
            positions: HashMap::new(),
            history: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Rebuild from a persisted snapshot.
    pub fn restore(
        balance: Decimal,
        starting_balance: Decimal,
        realized_pnl: Decimal,
        positions: Vec<PaperPosition>,
        history: Vec<HistoryEntry>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            balance,
            starting_balance,
            realized_pnl,
            positions: positions
                .into_iter()
                .map(|p| (p.token_id.clone(), p))
                .collect(),
            history,
            started_at,
        }
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn starting_balance(&self) -> Decimal {
        self.starting_balance
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn position(&self, token_id: &str) -> Option<&PaperPosition> {
        self.positions.get(token_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &PaperPosition> {
        self.positions.values()
    }

    pub fn open_positions(&self) -> usize {
        self.positions.len()
    }

    /// Cost basis across all open positions.
    pub fn total_exposure(&self) -> Decimal {
        self.positions.values().map(|p| p.entry_value).sum()
    }

    /// Simulate a BUY of `value` USDC at `price`.
    pub fn buy(
        &mut self,
        token_id: &str,
        value: Decimal,
        price: Decimal,
        meta: PositionMeta,
    ) -> Result<PaperFill, PaperError> {
        if price <= Decimal::ZERO || price > Decimal::ONE {
            return Err(PaperError::InvalidPrice(price));
        }
        if value <= Decimal::ZERO {
            return Err(PaperError::ZeroSize);
        }
        if value > self.balance {
            return Err(PaperError::InsufficientBalance {
                needed: value,
                available: self.balance,
            });
        }

        let shares = value / price;
        let now = Utc::now();

        let position = self
            .positions
            .entry(token_id.to_string())
            .or_insert_with(|| PaperPosition {
                token_id: token_id.to_string(),
                shares: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                entry_value: Decimal::ZERO,
                market: meta.market.clone(),
                condition_id: meta.condition_id.clone(),
                outcome: meta.outcome.clone(),
                entry_timestamp: now,
                last_checked: None,
                stop_loss_pending: false,
            });

        position.shares += shares;
        position.entry_value += value;
        position.avg_price = position.entry_value / position.shares;

        self.balance -= value;
        self.history.push(HistoryEntry {
            timestamp: now,
            kind: HistoryKind::Buy,
            token_id: token_id.to_string(),
            market: position.market.clone(),
            outcome: position.outcome.clone(),
            shares,
            price,
            value,
            pnl: None,
        });

        debug!(
            token = %token_id,
            shares = %shares,
            value = %value,
            balance = %self.balance,
            "Paper BUY filled"
        );

        Ok(PaperFill {
            token_id: token_id.to_string(),
            side: TradeSide::Buy,
            shares,
            price,
            value,
            pnl: None,
            balance_after: self.balance,
        })
    }

    /// Simulate selling up to `shares` at `price`.
    pub fn sell(
        &mut self,
        token_id: &str,
        shares: Decimal,
        price: Decimal,
        kind: HistoryKind,
    ) -> Result<PaperFill, PaperError> {
        if price < Decimal::ZERO || price > Decimal::ONE {
            return Err(PaperError::InvalidPrice(price));
        }
        if shares <= Decimal::ZERO {
            return Err(PaperError::ZeroSize);
        }

        let position = self
            .positions
            .get_mut(token_id)
            .ok_or_else(|| PaperError::NoPosition(token_id.to_string()))?;

        let shares = shares.min(position.shares);
        let proceeds = shares * price;
        let cost_basis = shares * position.avg_price;
        let pnl = proceeds - cost_basis;

        position.shares -= shares;
        position.entry_value -= cost_basis;
        let market = position.market.clone();
        let outcome = position.outcome.clone();

        if position.shares < DUST_SHARES {
            self.positions.remove(token_id);
        }

        self.balance += proceeds;
        self.realized_pnl += pnl;
        self.history.push(HistoryEntry {
            timestamp: Utc::now(),
            kind,
            token_id: token_id.to_string(),
            market,
            outcome,
            shares,
            price,
            value: proceeds,
            pnl: Some(pnl),
        });

        info!(
            token = %token_id,
            kind = kind.as_str(),
            shares = %shares,
            price = %price,
            pnl = %pnl,
            balance = %self.balance,
            "Paper position reduced"
        );

        Ok(PaperFill {
            token_id: token_id.to_string(),
            side: TradeSide::Sell,
            shares,
            price,
            value: proceeds,
            pnl: Some(pnl),
            balance_after: self.balance,
        })
    }

    /// Close the whole position at the resolution price. Runs regardless of
    /// any pending stop-loss on the token.
    pub fn settle(&mut self, token_id: &str, price: Decimal) -> Result<PaperFill, PaperError> {
        let shares = self
            .positions
            .get(token_id)
            .map(|p| p.shares)
            .ok_or_else(|| PaperError::NoPosition(token_id.to_string()))?;
        self.sell(token_id, shares, price, HistoryKind::Settlement)
    }

    /// Claim the stop-loss for a token. Returns `false` if it is already
    /// pending or the position is gone.
    pub fn try_mark_pending(&mut self, token_id: &str) -> bool {
        match self.positions.get_mut(token_id) {
            Some(p) if !p.stop_loss_pending => {
                p.stop_loss_pending = true;
                true
            }
            _ => false,
        }
    }

    pub fn clear_pending(&mut self, token_id: &str) {
        if let Some(p) = self.positions.get_mut(token_id) {
            p.stop_loss_pending = false;
        }
    }

    pub fn mark_checked(&mut self, token_id: &str, at: DateTime<Utc>) {
        if let Some(p) = self.positions.get_mut(token_id) {
            p.last_checked = Some(at);
        }
    }

    /// Snapshot statistics. Positions without a quote are valued at entry.
    pub fn stats(&self, prices: &HashMap<String, Decimal>) -> PaperStats {
        let unrealized: Decimal = self
            .positions
            .values()
            .map(|p| p.pnl_at(prices.get(&p.token_id).copied().unwrap_or(p.avg_price)))
            .sum();
        let equity = self.balance + self.total_exposure() + unrealized;

        let exits: Vec<&HistoryEntry> = self.history.iter().filter(|h| h.kind.is_exit()).collect();
        let winners = exits
            .iter()
            .filter(|h| h.pnl.unwrap_or_default() > Decimal::ZERO)
            .count();
        let win_rate = if exits.is_empty() {
            0.0
        } else {
            winners as f64 / exits.len() as f64
        };

        let return_pct = if self.starting_balance > Decimal::ZERO {
            (equity - self.starting_balance) / self.starting_balance
        } else {
            Decimal::ZERO
        };

        PaperStats {
            starting_balance: self.starting_balance,
            current_equity: equity,
            cash_available: self.balance,
            unrealized_pnl: unrealized,
            realized_pnl: self.realized_pnl,
            total_pnl: self.realized_pnl + unrealized,
            return_pct,
            open_positions: self.positions.len(),
            closed_trades: exits.len(),
            stop_losses: exits.iter().filter(|h| h.kind == HistoryKind::StopLoss).count(),
            settlements: exits.iter().filter(|h| h.kind == HistoryKind::Settlement).count(),
            win_rate,
            running_since: self.started_at,
        }
    }
}

/// Paper trading statistics.
#[derive(Debug, Clone)]
pub struct PaperStats {
    pub starting_balance: Decimal,
    pub current_equity: Decimal,
    pub cash_available: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub return_pct: Decimal,
    pub open_positions: usize,
    pub closed_trades: usize,
    pub stop_losses: usize,
    pub settlements: usize,
    pub win_rate: f64,
    pub running_since: DateTime<Utc>,
}

impl std::fmt::Display for PaperStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^50}", " PAPER TRADING ")?;
        writeln!(f, "Running since: {}", self.running_since.format("%Y-%m-%d %H:%M"))?;
        writeln!(f)?;
        writeln!(f, "Starting Balance: ${:.2}", self.starting_balance)?;
        writeln!(f, "Current Equity:   ${:.2}", self.current_equity)?;
        writeln!(f, "Cash Available:   ${:.2}", self.cash_available)?;
        writeln!(f)?;
        writeln!(f, "Unrealized P&L:   ${:.2}", self.unrealized_pnl)?;
        writeln!(f, "Realized P&L:     ${:.2}", self.realized_pnl)?;
        writeln!(
            f,
            "Total P&L:        ${:.2} ({:.2}%)",
            self.total_pnl,
            self.return_pct * dec!(100)
        )?;
        writeln!(f)?;
        writeln!(f, "Open Positions:   {}", self.open_positions)?;
        writeln!(f, "Closed Trades:    {}", self.closed_trades)?;
        writeln!(f, "  Stop-Losses:    {}", self.stop_losses)?;
        writeln!(f, "  Settlements:    {}", self.settlements)?;
        writeln!(f, "Win Rate:         {:.1}%", self.win_rate * 100.0)?;
        writeln!(f, "{:=^50}", "")?;
        Ok(())
    }
}
