//! SQLite status ledger
//!
//! One row per (message_id, recipient) in `message_status`. Timestamps are
//! stored as epoch milliseconds, states and channels as their wire names.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{ChannelType, DeliveryState, StatusRecord};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::repository::StatusLedgerRepository;
use crate::{LedgerError, Result};

const COLUMNS: &str =
    "message_id, recipient, channel, state, updated_at, error_detail, owner_id, retry_count, created_at";

pub struct SqliteStatusLedger {
    pool: SqlitePool,
}

impl SqliteStatusLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool on `url` (e.g. `sqlite://courier.db?mode=rwc`) and create the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(url).await?;
        let ledger = Self::new(pool);
        ledger.init_schema().await?;
        Ok(ledger)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_status (
                message_id TEXT NOT NULL,
                recipient TEXT NOT NULL,
                channel TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                error_detail TEXT,
                owner_id TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, recipient)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_message_status_state ON message_status (state)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_message_status_recipient ON message_status (recipient)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_message_status_owner ON message_status (owner_id, updated_at)",
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite status ledger schema initialized");
        Ok(())
    }

    fn parse_row(row: &SqliteRow) -> Result<StatusRecord> {
        let channel: ChannelType = row.get::<String, _>("channel").parse()?;
        let state: DeliveryState = row.get::<String, _>("state").parse()?;

        Ok(StatusRecord {
            message_id: row.get("message_id"),
            recipient: row.get("recipient"),
            channel,
            state,
            updated_at: from_millis(row.get("updated_at"))?,
            error_detail: row.try_get("error_detail").ok().flatten(),
            owner_id: row.get("owner_id"),
            retry_count: row.get::<i64, _>("retry_count") as u32,
            created_at: from_millis(row.get("created_at"))?,
        })
    }

    fn parse_rows(rows: &[SqliteRow]) -> Result<Vec<StatusRecord>> {
        rows.iter().map(Self::parse_row).collect()
    }
}

fn from_millis(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ts).ok_or_else(|| LedgerError::Corrupt(format!("invalid timestamp {ts}")))
}

#[async_trait]
impl StatusLedgerRepository for SqliteStatusLedger {
    async fn save(&self, record: &StatusRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO message_status
                (message_id, recipient, channel, state, updated_at, error_detail, owner_id, retry_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (message_id, recipient) DO UPDATE SET
                channel = excluded.channel,
                state = excluded.state,
                updated_at = excluded.updated_at,
                error_detail = excluded.error_detail,
                owner_id = excluded.owner_id,
                retry_count = excluded.retry_count
            "#,
        )
        .bind(&record.message_id)
        .bind(&record.recipient)
        .bind(record.channel.as_str())
        .bind(record.state.as_str())
        .bind(record.updated_at.timestamp_millis())
        .bind(&record.error_detail)
        .bind(&record.owner_id)
        .bind(i64::from(record.retry_count))
        .bind(record.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!(key = %record.key(), state = %record.state, "Status record saved");
        Ok(())
    }

    async fn delete_by_message_id(&self, message_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM message_status WHERE message_id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_by_key(&self, message_id: &str, recipient: &str) -> Result<Option<StatusRecord>> {
        let query = format!("SELECT {COLUMNS} FROM message_status WHERE message_id = ? AND recipient = ?");
        let row = sqlx::query(&query)
            .bind(message_id)
            .bind(recipient)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_by_message_id(&self, message_id: &str) -> Result<Vec<StatusRecord>> {
        let query = format!("SELECT {COLUMNS} FROM message_status WHERE message_id = ? ORDER BY created_at, recipient");
        let rows = sqlx::query(&query).bind(message_id).fetch_all(&self.pool).await?;
        Self::parse_rows(&rows)
    }

    async fn find_by_recipient(&self, recipient: &str) -> Result<Vec<StatusRecord>> {
        let query = format!("SELECT {COLUMNS} FROM message_status WHERE recipient = ? ORDER BY created_at");
        let rows = sqlx::query(&query).bind(recipient).fetch_all(&self.pool).await?;
        Self::parse_rows(&rows)
    }

    async fn find_by_state(&self, state: DeliveryState) -> Result<Vec<StatusRecord>> {
        let query = format!("SELECT {COLUMNS} FROM message_status WHERE state = ? ORDER BY created_at");
        let rows = sqlx::query(&query).bind(state.as_str()).fetch_all(&self.pool).await?;
        Self::parse_rows(&rows)
    }

    async fn find_by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<StatusRecord>> {
        let query = format!(
            "SELECT {COLUMNS} FROM message_status WHERE updated_at >= ? AND updated_at <= ? ORDER BY created_at"
        );
        let rows = sqlx::query(&query)
            .bind(from.timestamp_millis())
            .bind(to.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;
        Self::parse_rows(&rows)
    }

    async fn find_by_owner_order_by_time_desc(&self, owner_id: &str) -> Result<Vec<StatusRecord>> {
        let query = format!("SELECT {COLUMNS} FROM message_status WHERE owner_id = ? ORDER BY updated_at DESC");
        let rows = sqlx::query(&query).bind(owner_id).fetch_all(&self.pool).await?;
        Self::parse_rows(&rows)
    }

    async fn count_by_state(&self, state: DeliveryState) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_status WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
