//! Database persistence for engine state management.
//!
//! Stores everything needed to resume after restart:
//! - Positions with their DCA levels and take-profit targets
//! - The trade log (every open, fill, and close)
//! - A snapshot of the safety-manager state
//!
//! Decimals are stored as TEXT to keep exact money arithmetic across the
//! round trip; levels and targets travel as JSON columns so every position
//! update is a single atomic statement.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::str::FromStr;

use crate::models::{Position, PositionSide, PositionStatus};
use crate::store::PositionStore;
use crate::trading::{SafetyManager, TpMode};

/// SQLite-backed store for positions, trade log, and safety state.
pub struct Database {
    pool: SqlitePool,
}

/// Raw position row; decimals and JSON blobs are decoded in
/// [`row_to_position`].
#[derive(Debug, Clone, sqlx::FromRow)]
struct PositionRow {
    id: String,
    owner_id: String,
    symbol: String,
    side: String,
    leverage: i64,
    base_order_size: String,
    entry_price: String,
    total_filled_qty: String,
    remaining_qty: String,
    total_cost: String,
    total_invested: String,
    avg_entry: String,
    max_investment: String,
    realized_pnl: String,
    dca_levels: String,
    targets: String,
    take_profit_percent: String,
    tp_mode: String,
    partial_tp_schema: String,
    partial_tp_hits: i64,
    stop_loss_percent: String,
    stop_loss_price: Option<String>,
    breakeven_sl: bool,
    status: String,
    opened_at: String,
    closed_at: Option<String>,
}

/// One trade-log record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TradeLogRow {
    pub id: i64,
    pub position_id: String,
    pub owner_id: String,
    pub event: String,
    pub message: String,
    pub pnl: Option<String>,
    pub created_at: String,
}

impl Database {
    /// Open (or create) the database and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory database for tests. A single connection keeps the shared
    /// memory database alive.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to create in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                base_order_size TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                total_filled_qty TEXT NOT NULL,
                remaining_qty TEXT NOT NULL,
                total_cost TEXT NOT NULL,
                total_invested TEXT NOT NULL,
                avg_entry TEXT NOT NULL,
                max_investment TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                dca_levels TEXT NOT NULL,
                targets TEXT NOT NULL,
                take_profit_percent TEXT NOT NULL,
                tp_mode TEXT NOT NULL,
                partial_tp_schema TEXT NOT NULL,
                partial_tp_hits INTEGER NOT NULL DEFAULT 0,
                stop_loss_percent TEXT NOT NULL,
                stop_loss_price TEXT,
                breakeven_sl INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                event TEXT NOT NULL,
                message TEXT NOT NULL,
                pnl TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS safety_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_positions_owner ON positions(owner_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trade_log_position ON trade_log(position_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Trade log ====================

    /// Append one trade-log record.
    pub async fn log_trade_event(
        &self,
        position_id: &str,
        owner_id: &str,
        event: &str,
        message: &str,
        pnl: Option<Decimal>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_log (position_id, owner_id, event, message, pnl, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(position_id)
        .bind(owner_id)
        .bind(event)
        .bind(message)
        .bind(pnl.map(|p| p.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recent trade-log records, newest first.
    pub async fn recent_trade_log(&self, limit: i64) -> Result<Vec<TradeLogRow>> {
        let rows = sqlx::query_as::<_, TradeLogRow>(
            "SELECT * FROM trade_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ==================== Safety state ====================

    /// Persist the whole safety-manager state as one snapshot row.
    pub async fn save_safety_state(&self, safety: &SafetyManager) -> Result<()> {
        let state = serde_json::to_string(safety)?;
        sqlx::query(
            r#"
            INSERT INTO safety_state (id, state, updated_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(state)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Restore the safety-manager snapshot, if one was saved.
    pub async fn load_safety_state(&self) -> Result<Option<SafetyManager>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM safety_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((state,)) => Ok(Some(
                serde_json::from_str(&state).context("Failed to decode safety state")?,
            )),
            None => Ok(None),
        }
    }

    // ==================== Position counts ====================

    /// Position counts grouped by status, for the status command.
    pub async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM positions GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}

fn parse_dec(field: &str, value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Failed to parse {field}: {value}"))
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn tp_mode_str(mode: TpMode) -> &'static str {
    match mode {
        TpMode::Whole => "whole",
        TpMode::Partial => "partial",
    }
}

fn row_to_position(row: PositionRow) -> Result<Position> {
    Ok(Position {
        id: row.id,
        owner_id: row.owner_id,
        symbol: row.symbol,
        side: PositionSide::parse(&row.side)
            .with_context(|| format!("Unknown side: {}", row.side))?,
        leverage: row.leverage as u32,
        base_order_size: parse_dec("base_order_size", &row.base_order_size)?,
        entry_price: parse_dec("entry_price", &row.entry_price)?,
        total_filled_qty: parse_dec("total_filled_qty", &row.total_filled_qty)?,
        remaining_qty: parse_dec("remaining_qty", &row.remaining_qty)?,
        total_cost: parse_dec("total_cost", &row.total_cost)?,
        total_invested: parse_dec("total_invested", &row.total_invested)?,
        avg_entry: parse_dec("avg_entry", &row.avg_entry)?,
        max_investment: parse_dec("max_investment", &row.max_investment)?,
        realized_pnl: parse_dec("realized_pnl", &row.realized_pnl)?,
        dca_levels: serde_json::from_str(&row.dca_levels).context("Failed to decode levels")?,
        targets: serde_json::from_str(&row.targets).context("Failed to decode targets")?,
        take_profit_percent: parse_dec("take_profit_percent", &row.take_profit_percent)?,
        tp_mode: match row.tp_mode.as_str() {
            "partial" => TpMode::Partial,
            _ => TpMode::Whole,
        },
        partial_tp_schema: serde_json::from_str(&row.partial_tp_schema)
            .context("Failed to decode tp schema")?,
        partial_tp_hits: row.partial_tp_hits as usize,
        stop_loss_percent: parse_dec("stop_loss_percent", &row.stop_loss_percent)?,
        stop_loss_price: row
            .stop_loss_price
            .as_deref()
            .map(|s| parse_dec("stop_loss_price", s))
            .transpose()?,
        breakeven_sl: row.breakeven_sl,
        status: PositionStatus::parse(&row.status)
            .with_context(|| format!("Unknown status: {}", row.status))?,
        opened_at: parse_time(&row.opened_at),
        closed_at: row.closed_at.as_deref().map(parse_time),
    })
}

#[async_trait]
impl PositionStore for Database {
    async fn insert(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, owner_id, symbol, side, leverage,
                base_order_size, entry_price, total_filled_qty, remaining_qty,
                total_cost, total_invested, avg_entry, max_investment, realized_pnl,
                dca_levels, targets, take_profit_percent, tp_mode, partial_tp_schema,
                partial_tp_hits, stop_loss_percent, stop_loss_price, breakeven_sl,
                status, opened_at, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.id)
        .bind(&position.owner_id)
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.leverage as i64)
        .bind(position.base_order_size.to_string())
        .bind(position.entry_price.to_string())
        .bind(position.total_filled_qty.to_string())
        .bind(position.remaining_qty.to_string())
        .bind(position.total_cost.to_string())
        .bind(position.total_invested.to_string())
        .bind(position.avg_entry.to_string())
        .bind(position.max_investment.to_string())
        .bind(position.realized_pnl.to_string())
        .bind(serde_json::to_string(&position.dca_levels)?)
        .bind(serde_json::to_string(&position.targets)?)
        .bind(position.take_profit_percent.to_string())
        .bind(tp_mode_str(position.tp_mode))
        .bind(serde_json::to_string(&position.partial_tp_schema)?)
        .bind(position.partial_tp_hits as i64)
        .bind(position.stop_loss_percent.to_string())
        .bind(position.stop_loss_price.map(|p| p.to_string()))
        .bind(position.breakeven_sl)
        .bind(position.status.as_str())
        .bind(position.opened_at.to_rfc3339())
        .bind(position.closed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context("Failed to insert position")?;
        Ok(())
    }

    async fn get(&self, position_id: &str) -> Result<Option<Position>> {
        let row = sqlx::query_as::<_, PositionRow>("SELECT * FROM positions WHERE id = ?")
            .bind(position_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_position).transpose()
    }

    async fn update(&self, position: &Position) -> Result<()> {
        // One statement so concurrent schedulers never see a torn record.
        sqlx::query(
            r#"
            UPDATE positions SET
                total_filled_qty = ?, remaining_qty = ?, total_cost = ?,
                total_invested = ?, avg_entry = ?, realized_pnl = ?,
                dca_levels = ?, targets = ?, partial_tp_hits = ?,
                stop_loss_price = ?, breakeven_sl = ?, status = ?, closed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(position.total_filled_qty.to_string())
        .bind(position.remaining_qty.to_string())
        .bind(position.total_cost.to_string())
        .bind(position.total_invested.to_string())
        .bind(position.avg_entry.to_string())
        .bind(position.realized_pnl.to_string())
        .bind(serde_json::to_string(&position.dca_levels)?)
        .bind(serde_json::to_string(&position.targets)?)
        .bind(position.partial_tp_hits as i64)
        .bind(position.stop_loss_price.map(|p| p.to_string()))
        .bind(position.breakeven_sl)
        .bind(position.status.as_str())
        .bind(position.closed_at.map(|t| t.to_rfc3339()))
        .bind(&position.id)
        .execute(&self.pool)
        .await
        .context("Failed to update position")?;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE status IN ('ACTIVE', 'PARTIALLY_CLOSED')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_position).collect()
    }

    async fn list_active_for(&self, owner_id: &str) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE owner_id = ? AND status IN ('ACTIVE', 'PARTIALLY_CLOSED')",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_position).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSide;
    use crate::trading::config::DcaConfig;
    use rust_decimal_macros::dec;

    fn sample_position() -> Position {
        Position::open(
            "user-1",
            "BTCUSDT",
            PositionSide::Long,
            dec!(100),
            10,
            &DcaConfig::default(),
            &[dec!(101), dec!(102)],
            Some(dec!(95)),
        )
    }

    #[tokio::test]
    async fn position_round_trip_preserves_exact_decimals() {
        let db = Database::in_memory().await.unwrap();
        let mut position = sample_position();
        position.check_dca_triggers(dec!(98.4));
        position.fill_level(0, dec!(98.5), dec!(10) / dec!(98.5));

        db.insert(&position).await.unwrap();
        let loaded = db.get(&position.id).await.unwrap().unwrap();

        assert_eq!(loaded.avg_entry, position.avg_entry);
        assert_eq!(loaded.total_filled_qty, position.total_filled_qty);
        assert_eq!(loaded.dca_levels.len(), position.dca_levels.len());
        assert_eq!(loaded.targets.len(), 2);
        assert_eq!(loaded.stop_loss_price, Some(dec!(95)));
        assert_eq!(loaded.side, PositionSide::Long);
    }

    #[tokio::test]
    async fn update_is_visible_to_list_active() {
        let db = Database::in_memory().await.unwrap();
        let mut position = sample_position();
        db.insert(&position).await.unwrap();
        assert_eq!(db.list_active().await.unwrap().len(), 1);

        position.close_remaining(dec!(101.5), PositionStatus::TpClosed);
        db.update(&position).await.unwrap();

        assert!(db.list_active().await.unwrap().is_empty());
        let loaded = db.get(&position.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PositionStatus::TpClosed);
        assert!(loaded.closed_at.is_some());
    }

    #[tokio::test]
    async fn list_active_for_filters_by_owner() {
        let db = Database::in_memory().await.unwrap();
        db.insert(&sample_position()).await.unwrap();

        assert_eq!(db.list_active_for("user-1").await.unwrap().len(), 1);
        assert!(db.list_active_for("user-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn safety_state_round_trips() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.load_safety_state().await.unwrap().is_none());

        let mut safety = SafetyManager::default();
        safety.activate_kill_switch("maintenance");
        db.save_safety_state(&safety).await.unwrap();

        let mut loaded = db.load_safety_state().await.unwrap().unwrap();
        assert!(!loaded.trading_allowed().allowed);

        // Snapshot updates replace the single row.
        safety.deactivate_kill_switch();
        db.save_safety_state(&safety).await.unwrap();
        let mut loaded = db.load_safety_state().await.unwrap().unwrap();
        assert!(loaded.trading_allowed().allowed);
    }

    #[tokio::test]
    async fn trade_log_appends_and_lists() {
        let db = Database::in_memory().await.unwrap();
        db.log_trade_event("pos-1", "user-1", "position_opened", "opened", None)
            .await
            .unwrap();
        db.log_trade_event("pos-1", "user-1", "stop_loss", "closed", Some(dec!(-3)))
            .await
            .unwrap();

        let rows = db.recent_trade_log(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].event, "stop_loss");
        assert_eq!(rows[0].pnl.as_deref(), Some("-3"));
    }
}
