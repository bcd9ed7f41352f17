//! SQLite turn store.

use crate::error::{Result, StoreError};
use crate::store::TurnStore;
use crate::{ThreadId, Turn, TurnContent, TurnId, TurnRole};
use anyhow::Context as _;
use async_trait::async_trait;
use sqlx::{Row as _, SqlitePool};
use std::path::Path;
use std::sync::Arc;

/// Turn store persisted to SQLite. A row is committed before `append`
/// returns, so an acknowledged turn survives a crash.
#[derive(Debug, Clone)]
pub struct SqliteTurnStore {
    pool: SqlitePool,
}

impl SqliteTurnStore {
    /// Open (or create) the database file and run migrations.
    pub async fn connect(path: &Path) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("failed to open turn database at {}", path.display()))?;
        Self::migrate(pool).await
    }

    /// In-memory database, for tests and throwaway sessions.
    ///
    /// `sqlite::memory:` is per-connection, so the pool is capped at a
    /// single connection to keep every query on the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .with_context(|| "failed to open in-memory turn database")?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .with_context(|| "failed to run turn store migrations")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<Turn> {
    let thread_id: String = row
        .try_get("thread_id")
        .map_err(|error| StoreError::Backend(anyhow::anyhow!("bad thread_id column: {error}")))?;
    let turn_id: i64 = row
        .try_get("turn_id")
        .map_err(|error| StoreError::Backend(anyhow::anyhow!("bad turn_id column: {error}")))?;
    let role_text: String = row
        .try_get("role")
        .map_err(|error| StoreError::Backend(anyhow::anyhow!("bad role column: {error}")))?;
    let role = TurnRole::parse(&role_text).ok_or_else(|| {
        StoreError::Backend(anyhow::anyhow!("unknown role in turn row: {role_text}"))
    })?;
    let content_json: String = row
        .try_get("content")
        .map_err(|error| StoreError::Backend(anyhow::anyhow!("bad content column: {error}")))?;
    let content: TurnContent = serde_json::from_str(&content_json)
        .map_err(|error| StoreError::Backend(anyhow::anyhow!("undecodable turn content: {error}")))?;
    let parent_id: Option<i64> = row
        .try_get("parent_id")
        .map_err(|error| StoreError::Backend(anyhow::anyhow!("bad parent_id column: {error}")))?;
    let created_seq: i64 = row
        .try_get("created_seq")
        .map_err(|error| StoreError::Backend(anyhow::anyhow!("bad created_seq column: {error}")))?;
    let recorded_at = row
        .try_get("recorded_at")
        .unwrap_or_else(|_| chrono::Utc::now());

    Ok(Turn {
        id: TurnId(turn_id as u64),
        thread_id: Arc::from(thread_id.as_str()),
        role,
        content,
        parent_id: parent_id.map(|id| TurnId(id as u64)),
        created_seq: created_seq as u64,
        recorded_at,
    })
}

#[async_trait]
impl TurnStore for SqliteTurnStore {
    async fn append(
        &self,
        thread_id: &ThreadId,
        role: TurnRole,
        content: TurnContent,
        parent_id: Option<TurnId>,
    ) -> Result<TurnId> {
        let content_json = serde_json::to_string(&content)
            .map_err(|error| StoreError::Backend(anyhow::anyhow!("unencodable content: {error}")))?;

        // Id assignment and the parent check must see a consistent snapshot,
        // so both run inside the insert's transaction.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::Backend(error.into()))?;

        if let Some(parent) = parent_id {
            let exists: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM turns WHERE thread_id = ? AND turn_id = ?",
            )
            .bind(thread_id.as_ref())
            .bind(parent.0 as i64)
            .fetch_one(&mut *tx)
            .await
            .map_err(|error| StoreError::Backend(error.into()))?;
            if exists == 0 {
                return Err(StoreError::InvalidParent {
                    thread_id: thread_id.clone(),
                    parent_id: parent,
                }
                .into());
            }
        }

        let next_id: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(turn_id), 0) + 1 FROM turns WHERE thread_id = ?")
                .bind(thread_id.as_ref())
                .fetch_one(&mut *tx)
                .await
                .map_err(|error| StoreError::Backend(error.into()))?;

        sqlx::query(
            "INSERT INTO turns (thread_id, turn_id, role, content, parent_id, created_seq, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(thread_id.as_ref())
        .bind(next_id)
        .bind(role.as_str())
        .bind(&content_json)
        .bind(parent_id.map(|id| id.0 as i64))
        .bind(next_id)
        .bind(chrono::Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|error| StoreError::Backend(error.into()))?;

        tx.commit()
            .await
            .map_err(|error| StoreError::Backend(error.into()))?;

        let id = TurnId(next_id as u64);
        tracing::debug!(thread_id = %thread_id, turn_id = %id, role = %role, "turn persisted");
        Ok(id)
    }

    async fn get(&self, thread_id: &ThreadId, turn_id: TurnId) -> Result<Turn> {
        let row = sqlx::query("SELECT * FROM turns WHERE thread_id = ? AND turn_id = ?")
            .bind(thread_id.as_ref())
            .bind(turn_id.0 as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::Backend(error.into()))?;

        match row {
            Some(row) => row_to_turn(&row),
            None => Err(StoreError::NotFound {
                thread_id: thread_id.clone(),
                turn_id,
            }
            .into()),
        }
    }

    async fn children(&self, thread_id: &ThreadId, parent_id: TurnId) -> Result<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT * FROM turns WHERE thread_id = ? AND parent_id = ? ORDER BY created_seq ASC",
        )
        .bind(thread_id.as_ref())
        .bind(parent_id.0 as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Backend(error.into()))?;

        rows.iter().map(row_to_turn).collect()
    }

    async fn thread_turns(&self, thread_id: &ThreadId) -> Result<Vec<Turn>> {
        let rows =
            sqlx::query("SELECT * FROM turns WHERE thread_id = ? ORDER BY created_seq ASC")
                .bind(thread_id.as_ref())
                .fetch_all(&self.pool)
                .await
                .map_err(|error| StoreError::Backend(error.into()))?;

        rows.iter().map(row_to_turn).collect()
    }

    async fn clear(&self, thread_id: &ThreadId) -> Result<()> {
        let result = sqlx::query("DELETE FROM turns WHERE thread_id = ?")
            .bind(thread_id.as_ref())
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::Backend(error.into()))?;
        if result.rows_affected() > 0 {
            tracing::info!(thread_id = %thread_id, "thread history cleared");
        }
        Ok(())
    }
}
