//! SQLite-based durable state store

use crate::core::error::StoreError;
use crate::persistence::{
    ItemWrite, Precondition, StateStore, StoreKey, StoreResult, StoredItem, WriteOutcome,
};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// SQLite state store
///
/// Conditional writes are single `INSERT .. ON CONFLICT DO NOTHING` / `UPDATE .. WHERE`
/// statements, so the check and the write are atomic inside SQLite.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if needed) a store at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Private in-memory database; a single connection keeps it alive
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("payflow");
        std::fs::create_dir_all(&db_dir)?;

        Self::new(db_dir.join("state.db")).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_items (
                pk TEXT NOT NULL,
                sk TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (pk, sk)
            );

            CREATE INDEX IF NOT EXISTS idx_state_items_status ON state_items(status);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn map_err(err: sqlx::Error) -> StoreError {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }

    fn item_from_row(row: &SqliteRow) -> StoreResult<StoredItem> {
        let pk: String = row.get("pk");
        let sk: String = row.get("sk");
        let raw_body: String = row.get("body");
        let body = serde_json::from_str(&raw_body).map_err(|e| StoreError::Corrupt {
            key: format!("{}/{}", pk, sk),
            reason: e.to_string(),
        })?;

        Ok(StoredItem {
            pk,
            sk,
            status: row.get("status"),
            version: row.get::<i64, _>("version") as u64,
            body,
        })
    }

    async fn conflict(&self, key: &StoreKey) -> StoreResult<WriteOutcome> {
        let current = self.get_item(key).await?;
        Ok(WriteOutcome::conflict_with(current.as_ref()))
    }
}

#[async_trait::async_trait]
impl StateStore for SqliteStateStore {
    async fn get_item(&self, key: &StoreKey) -> StoreResult<Option<StoredItem>> {
        let row = sqlx::query(
            r#"
            SELECT pk, sk, status, version, body
            FROM state_items
            WHERE pk = ?1 AND sk = ?2
            "#,
        )
        .bind(key.pk())
        .bind(key.sk())
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::map_err)?;

        row.as_ref().map(Self::item_from_row).transpose()
    }

    async fn put_item_conditional(
        &self,
        key: &StoreKey,
        precondition: Precondition,
        item: ItemWrite,
    ) -> StoreResult<WriteOutcome> {
        let body = item.body.to_string();

        let committed = match precondition {
            Precondition::Absent => sqlx::query(
                r#"
                INSERT INTO state_items (pk, sk, status, version, body)
                VALUES (?1, ?2, ?3, 1, ?4)
                ON CONFLICT (pk, sk) DO NOTHING
                RETURNING version
                "#,
            )
            .bind(key.pk())
            .bind(key.sk())
            .bind(&item.status)
            .bind(&body)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_err)?,
            Precondition::Status(expected) => sqlx::query(
                r#"
                UPDATE state_items
                SET status = ?3, body = ?4, version = version + 1, updated_at = datetime('now')
                WHERE pk = ?1 AND sk = ?2 AND status = ?5
                RETURNING version
                "#,
            )
            .bind(key.pk())
            .bind(key.sk())
            .bind(&item.status)
            .bind(&body)
            .bind(expected)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_err)?,
            Precondition::Version(expected) => sqlx::query(
                r#"
                UPDATE state_items
                SET status = ?3, body = ?4, version = version + 1, updated_at = datetime('now')
                WHERE pk = ?1 AND sk = ?2 AND version = ?5
                RETURNING version
                "#,
            )
            .bind(key.pk())
            .bind(key.sk())
            .bind(&item.status)
            .bind(&body)
            .bind(expected as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::map_err)?,
        };

        match committed {
            Some(row) => Ok(WriteOutcome::Committed {
                version: row.get::<i64, _>("version") as u64,
            }),
            None => self.conflict(key).await,
        }
    }

    async fn query_by_partition(&self, pk: &str) -> StoreResult<Vec<StoredItem>> {
        let rows = sqlx::query(
            r#"
            SELECT pk, sk, status, version, body
            FROM state_items
            WHERE pk = ?1
            ORDER BY sk ASC
            "#,
        )
        .bind(pk)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::map_err)?;

        rows.iter().map(Self::item_from_row).collect()
    }
}
