//! SQLite persistence for the paper ledger and the copy-trade journal.
//!
//! Stores what a restart needs:
//! - Paper balance, realized P&L and open paper positions
//! - Append-only paper trade history
//! - One journal row per routed copy order
//!
//! Decimals are stored as TEXT so nothing is lost to floating point.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::trading::{HistoryEntry, HistoryKind, PaperLedger, PaperPosition};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PaperStateRow {
    balance: String,
    starting_balance: String,
    realized_pnl: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PaperPositionRow {
    token_id: String,
    shares: String,
    avg_price: String,
    entry_value: String,
    market: String,
    condition_id: String,
    outcome: String,
    entry_timestamp: DateTime<Utc>,
    last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PaperHistoryRow {
    timestamp: DateTime<Utc>,
    kind: String,
    token_id: String,
    market: String,
    outcome: String,
    shares: String,
    price: String,
    value: String,
    pnl: Option<String>,
}

/// One routed copy order.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CopyTradeRecord {
    pub id: String,
    pub source_tx: String,
    pub token_id: String,
    pub market: String,
    pub side: String,
    pub shares: String,
    pub price: String,
    pub value: String,
    /// "paper" or "live"
    pub mode: String,
    /// "executed", "failed" or "skipped"
    pub status: String,
    pub order_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Journal totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub total: i64,
    pub executed: i64,
    pub failed: i64,
    pub skipped: i64,
}

fn decimal(column: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Invalid decimal in {column}: {raw:?}"))
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                balance TEXT NOT NULL,
                starting_balance TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_positions (
                token_id TEXT PRIMARY KEY,
                shares TEXT NOT NULL,
                avg_price TEXT NOT NULL,
                entry_value TEXT NOT NULL,
                market TEXT NOT NULL DEFAULT '',
                condition_id TEXT NOT NULL DEFAULT '',
                outcome TEXT NOT NULL DEFAULT '',
                entry_timestamp TEXT NOT NULL,
                last_checked TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS paper_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                token_id TEXT NOT NULL,
                market TEXT NOT NULL DEFAULT '',
                outcome TEXT NOT NULL DEFAULT '',
                shares TEXT NOT NULL,
                price TEXT NOT NULL,
                value TEXT NOT NULL,
                pnl TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copy_trades (
                id TEXT PRIMARY KEY,
                source_tx TEXT NOT NULL,
                token_id TEXT NOT NULL,
                market TEXT NOT NULL DEFAULT '',
                side TEXT NOT NULL,
                shares TEXT NOT NULL,
                price TEXT NOT NULL,
                value TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                order_id TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_copy_trades_status ON copy_trades(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_copy_trades_token ON copy_trades(token_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Paper Ledger ====================

    /// Write the ledger snapshot. Positions are replaced; history rows not
    /// yet stored are appended.
    pub async fn save_paper_ledger(&self, ledger: &PaperLedger) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO paper_state (id, balance, starting_balance, realized_pnl, started_at, updated_at)
            VALUES (1, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                balance = excluded.balance,
                starting_balance = excluded.starting_balance,
                realized_pnl = excluded.realized_pnl,
                started_at = excluded.started_at,
                updated_at = datetime('now')
            "#,
        )
        .bind(ledger.balance().to_string())
        .bind(ledger.starting_balance().to_string())
        .bind(ledger.realized_pnl().to_string())
        .bind(ledger.started_at())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM paper_positions").execute(&mut *tx).await?;
        for p in ledger.positions() {
            sqlx::query(
                r#"
                INSERT INTO paper_positions (
                    token_id, shares, avg_price, entry_value, market,
                    condition_id, outcome, entry_timestamp, last_checked
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&p.token_id)
            .bind(p.shares.to_string())
            .bind(p.avg_price.to_string())
            .bind(p.entry_value.to_string())
            .bind(&p.market)
            .bind(&p.condition_id)
            .bind(&p.outcome)
            .bind(p.entry_timestamp)
            .bind(p.last_checked)
            .execute(&mut *tx)
            .await?;
        }

        let (stored,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM paper_history")
            .fetch_one(&mut *tx)
            .await?;
        for h in ledger.history().iter().skip(stored.max(0) as usize) {
            sqlx::query(
                r#"
                INSERT INTO paper_history (
                    timestamp, kind, token_id, market, outcome, shares, price, value, pnl
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(h.timestamp)
            .bind(h.kind.as_str())
            .bind(&h.token_id)
            .bind(&h.market)
            .bind(&h.outcome)
            .bind(h.shares.to_string())
            .bind(h.price.to_string())
            .bind(h.value.to_string())
            .bind(h.pnl.map(|p| p.to_string()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to commit paper ledger")?;
        Ok(())
    }

    /// Restore the ledger, `None` when nothing has been saved yet.
    pub async fn load_paper_ledger(&self) -> Result<Option<PaperLedger>> {
        let state: Option<PaperStateRow> = sqlx::query_as(
            "SELECT balance, starting_balance, realized_pnl, started_at FROM paper_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch paper state")?;

        let Some(state) = state else {
            return Ok(None);
        };

        let position_rows: Vec<PaperPositionRow> = sqlx::query_as(
            r#"
            SELECT token_id, shares, avg_price, entry_value, market, condition_id,
                   outcome, entry_timestamp, last_checked
            FROM paper_positions
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch paper positions")?;

        let history_rows: Vec<PaperHistoryRow> = sqlx::query_as(
            r#"
            SELECT timestamp, kind, token_id, market, outcome, shares, price, value, pnl
            FROM paper_history ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch paper history")?;

        let mut positions = Vec::with_capacity(position_rows.len());
        for row in position_rows {
            positions.push(PaperPosition {
                shares: decimal("shares", &row.shares)?,
                avg_price: decimal("avg_price", &row.avg_price)?,
                entry_value: decimal("entry_value", &row.entry_value)?,
                token_id: row.token_id,
                market: row.market,
                condition_id: row.condition_id,
                outcome: row.outcome,
                entry_timestamp: row.entry_timestamp,
                last_checked: row.last_checked,
                stop_loss_pending: false,
            });
        }

        let mut history = Vec::with_capacity(history_rows.len());
        for row in history_rows {
            let kind = HistoryKind::parse(&row.kind)
                .with_context(|| format!("Unknown history kind {:?}", row.kind))?;
            history.push(HistoryEntry {
                timestamp: row.timestamp,
                kind,
                shares: decimal("shares", &row.shares)?,
                price: decimal("price", &row.price)?,
                value: decimal("value", &row.value)?,
                pnl: row.pnl.as_deref().map(|p| decimal("pnl", p)).transpose()?,
                token_id: row.token_id,
                market: row.market,
                outcome: row.outcome,
            });
        }

        Ok(Some(PaperLedger::restore(
            decimal("balance", &state.balance)?,
            decimal("starting_balance", &state.starting_balance)?,
            decimal("realized_pnl", &state.realized_pnl)?,
            positions,
            history,
            state.started_at,
        )))
    }

    /// Wipe the paper ledger so the next session starts fresh.
    pub async fn reset_paper_ledger(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM paper_state").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM paper_positions").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM paper_history").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    // ==================== Copy Trades ====================

    pub async fn record_copy_trade(&self, record: &CopyTradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO copy_trades (
                id, source_tx, token_id, market, side, shares, price, value,
                mode, status, order_id, error_message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.source_tx)
        .bind(&record.token_id)
        .bind(&record.market)
        .bind(&record.side)
        .bind(&record.shares)
        .bind(&record.price)
        .bind(&record.value)
        .bind(&record.mode)
        .bind(&record.status)
        .bind(&record.order_id)
        .bind(&record.error_message)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to record copy trade")?;

        Ok(())
    }

    /// Most recent journal rows, newest first.
    pub async fn recent_copy_trades(&self, limit: i64) -> Result<Vec<CopyTradeRecord>> {
        sqlx::query_as::<_, CopyTradeRecord>(
            "SELECT * FROM copy_trades ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch copy trades")
    }

    pub async fn copy_trade_stats(&self) -> Result<JournalStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM copy_trades GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = JournalStats::default();
        for (status, count) in rows {
            stats.total += count;
            match status.as_str() {
                "executed" => stats.executed = count,
                "failed" => stats.failed = count,
                "skipped" => stats.skipped = count,
                _ => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::PositionMeta;
    use rust_decimal_macros::dec;

    fn journal_row(id: &str, status: &str) -> CopyTradeRecord {
        CopyTradeRecord {
            id: id.to_string(),
            source_tx: "0xabc".to_string(),
            token_id: "tok".to_string(),
            market: "m".to_string(),
            side: "BUY".to_string(),
            shares: "10".to_string(),
            price: "0.5".to_string(),
            value: "5".to_string(),
            mode: "paper".to_string(),
            status: status.to_string(),
            order_id: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_paper_ledger_persists() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        assert!(db.load_paper_ledger().await.unwrap().is_none());

        let mut ledger = PaperLedger::new(dec!(100));
        ledger
            .buy(
                "tok",
                dec!(10),
                dec!(0.5),
                PositionMeta {
                    market: "Will it rain?".to_string(),
                    condition_id: "0xc".to_string(),
                    outcome: "Yes".to_string(),
                },
            )
            .unwrap();
        db.save_paper_ledger(&ledger).await.unwrap();

        ledger
            .sell("tok", dec!(5), dec!(0.6), HistoryKind::Sell)
            .unwrap();
        db.save_paper_ledger(&ledger).await.unwrap();

        let restored = db.load_paper_ledger().await.unwrap().unwrap();
        assert_eq!(restored.balance(), ledger.balance());
        assert_eq!(restored.realized_pnl(), dec!(0.5));
        assert_eq!(restored.history().len(), 2);
        assert_eq!(restored.history()[1].kind, HistoryKind::Sell);
        assert_eq!(restored.position("tok").unwrap().shares, dec!(15));
    }

    #[tokio::test]
    async fn test_journal_stats() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.record_copy_trade(&journal_row("a", "executed")).await.unwrap();
        db.record_copy_trade(&journal_row("b", "failed")).await.unwrap();
        db.record_copy_trade(&journal_row("c", "executed")).await.unwrap();

        let stats = db.copy_trade_stats().await.unwrap();
        assert_eq!(
            stats,
            JournalStats {
                total: 3,
                executed: 2,
                failed: 1,
                skipped: 0,
            }
        );
        assert_eq!(db.recent_copy_trades(2).await.unwrap().len(), 2);
    }
}
