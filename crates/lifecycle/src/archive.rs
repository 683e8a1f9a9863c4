use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use common::{Account, Position, Result};

/// Durable history of closed positions and retired account generations.
///
/// Writes are advisory: a failed insert is logged by the caller and never
/// blocks trading. Rows older than the retention window are purged by a
/// scheduled task.
pub struct Archive {
    pool: SqlitePool,
}

impl Archive {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS closed_positions (
                id               TEXT PRIMARY KEY,
                account_id       TEXT NOT NULL,
                strategy_id      TEXT,
                symbol           TEXT NOT NULL,
                side             TEXT NOT NULL,
                quantity         REAL NOT NULL,
                entry_price      REAL NOT NULL,
                exit_price       REAL NOT NULL,
                realized_pnl     REAL NOT NULL,
                opened_at        TEXT NOT NULL,
                closed_at        TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_generations (
                account_id       TEXT NOT NULL,
                generation       INTEGER NOT NULL,
                balance          REAL NOT NULL,
                total_trades     INTEGER NOT NULL,
                winning_trades   INTEGER NOT NULL,
                max_drawdown_pct REAL NOT NULL,
                archived_at      TEXT NOT NULL,
                PRIMARY KEY (account_id, generation)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!(url = database_url, "Archive ready");
        Ok(Self { pool })
    }

    pub async fn store_position(&self, position: &Position, closed_at: DateTime<Utc>) -> Result<()> {
        let side = match position.side {
            common::PositionSide::Long => "long",
            common::PositionSide::Short => "short",
        };
        sqlx::query(
            r#"
            INSERT INTO closed_positions
                (id, account_id, strategy_id, symbol, side, quantity,
                 entry_price, exit_price, realized_pnl, opened_at, closed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&position.id)
        .bind(&position.account_id)
        .bind(&position.strategy_id)
        .bind(&position.symbol)
        .bind(side)
        .bind(position.quantity)
        .bind(position.entry_price)
        .bind(position.current_price)
        .bind(position.realized_pnl)
        .bind(position.opened_at.to_rfc3339())
        .bind(closed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn store_generation(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_generations
                (account_id, generation, balance, total_trades,
                 winning_trades, max_drawdown_pct, archived_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(account_id, generation) DO NOTHING
            "#,
        )
        .bind(&account.id)
        .bind(account.generation as i64)
        .bind(account.balance)
        .bind(account.total_trades as i64)
        .bind(account.winning_trades as i64)
        .bind(account.max_drawdown_pct)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete archived rows older than `retention_days`. Returns rows removed.
    pub async fn purge_older_than(&self, retention_days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();

        let positions = sqlx::query("DELETE FROM closed_positions WHERE closed_at < ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let generations = sqlx::query("DELETE FROM account_generations WHERE archived_at < ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(positions + generations)
    }

    pub async fn closed_position_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM closed_positions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{PositionSide, PositionStatus, Venue};

    fn closed_position(id: &str) -> Position {
        Position {
            id: id.into(),
            symbol: "BTCUSD".into(),
            side: PositionSide::Long,
            quantity: 1.0,
            entry_price: 100.0,
            current_price: 110.0,
            unrealized_pnl: 0.0,
            realized_pnl: 10.0,
            strategy_id: Some("s1".into()),
            account_id: "sim".into(),
            opened_at: Utc::now(),
            status: PositionStatus::Closed,
        }
    }

    #[tokio::test]
    async fn store_is_idempotent_by_position_id() {
        let archive = Archive::connect("sqlite::memory:").await.unwrap();
        let pos = closed_position("p1");
        archive.store_position(&pos, Utc::now()).await.unwrap();
        archive.store_position(&pos, Utc::now()).await.unwrap();
        assert_eq!(archive.closed_position_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purge_removes_rows_past_retention() {
        let archive = Archive::connect("sqlite::memory:").await.unwrap();
        let old = Utc::now() - Duration::days(120);
        archive
            .store_position(&closed_position("old"), old)
            .await
            .unwrap();
        archive
            .store_position(&closed_position("fresh"), Utc::now())
            .await
            .unwrap();

        let removed = archive.purge_older_than(90).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(archive.closed_position_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn generation_snapshots_keyed_by_account_and_generation() {
        let archive = Archive::connect("sqlite::memory:").await.unwrap();
        let account = Account {
            id: "sim".into(),
            owner: "ops".into(),
            venue: Venue::Simulated,
            balance: 9_500.0,
            available_balance: 9_500.0,
            total_trades: 12,
            winning_trades: 7,
            max_drawdown_pct: 0.08,
            created_at: Utc::now(),
            generation: 1,
        };
        archive.store_generation(&account).await.unwrap();
        archive.store_generation(&account).await.unwrap(); // same generation: no-op

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM account_generations")
            .fetch_one(&archive.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }
}
