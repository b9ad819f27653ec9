use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::ProxyError;

/// 单个用户的调用计数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub user_id: String,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// SQLite-backed `usage_tracking` table.
#[derive(Debug, Clone)]
pub struct UsageStore {
    pool: SqlitePool,
}

impl UsageStore {
    pub async fn open(database_path: &str) -> Result<Self, ProxyError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), ProxyError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_tracking (
                user_id TEXT PRIMARY KEY,
                usage_count INTEGER NOT NULL DEFAULT 0,
                last_used_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Current count for `user_id`; a user without a row has used nothing.
    pub async fn usage_count(&self, user_id: &str) -> Result<i64, ProxyError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT usage_count FROM usage_tracking WHERE user_id = ? LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.unwrap_or(0))
    }

    pub async fn fetch(&self, user_id: &str) -> Result<Option<UsageRecord>, ProxyError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, usage_count, last_used_at
            FROM usage_tracking
            WHERE user_id = ?
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| UsageRecord {
            user_id: row.get("user_id"),
            usage_count: row.get("usage_count"),
            last_used_at: timestamp_to_datetime(row.get("last_used_at")),
        }))
    }

    /// Upserts the row for `user_id`, bumping the count by one and stamping `now`.
    pub async fn record_usage(&self, user_id: &str) -> Result<UsageRecord, ProxyError> {
        let now = Utc::now().timestamp();

        let row = sqlx::query(
            r#"
            INSERT INTO usage_tracking (user_id, usage_count, last_used_at)
            VALUES (?, 1, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                usage_count = usage_tracking.usage_count + 1,
                last_used_at = excluded.last_used_at
            RETURNING user_id, usage_count, last_used_at
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageRecord {
            user_id: row.get("user_id"),
            usage_count: row.get("usage_count"),
            last_used_at: timestamp_to_datetime(row.get("last_used_at")),
        })
    }
}

fn timestamp_to_datetime(timestamp: i64) -> Option<DateTime<Utc>> {
    if timestamp <= 0 {
        return None;
    }
    Utc.timestamp_opt(timestamp, 0).single()
}
