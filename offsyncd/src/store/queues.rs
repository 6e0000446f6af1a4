use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use super::{Priority, StoreError};

/// Persisted form of a queued mutation. `kind` and `collection` are
/// denormalized from the payload for status queries.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRow {
    pub id: String,
    pub kind: String,
    pub collection: String,
    pub mutation: Value,
    pub timestamp: i64,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionRow {
    pub id: String,
    pub action: Value,
    pub timestamp: i64,
    pub retry_count: u32,
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterSource {
    Sync,
    Action,
}

impl DeadLetterSource {
    fn as_str(self) -> &'static str {
        match self {
            DeadLetterSource::Sync => "sync",
            DeadLetterSource::Action => "action",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "sync" => Ok(DeadLetterSource::Sync),
            "action" => Ok(DeadLetterSource::Action),
            other => Err(StoreError::InvalidSource(other.to_string())),
        }
    }
}

/// An item dropped after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: String,
    pub source: DeadLetterSource,
    pub kind: String,
    pub target: String,
    pub payload: Value,
    pub retries: u32,
    pub last_error: Option<String>,
    pub failed_at: i64,
}

#[derive(Clone)]
pub struct QueueStore {
    pool: SqlitePool,
}

impl QueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_sync_item(&self, row: &SyncRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_queue (id, kind, collection, mutation, timestamp, retries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&row.id)
        .bind(&row.kind)
        .bind(&row.collection)
        .bind(serde_json::to_string(&row.mutation)?)
        .bind(row.timestamp)
        .bind(row.retries as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rows in insertion order.
    pub async fn list_sync_items(&self) -> Result<Vec<SyncRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, kind, collection, mutation, timestamp, retries
             FROM sync_queue ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mutation: String = row.try_get("mutation")?;
            let retries: i64 = row.try_get("retries")?;
            out.push(SyncRow {
                id: row.try_get("id")?,
                kind: row.try_get("kind")?,
                collection: row.try_get("collection")?,
                mutation: serde_json::from_str(&mutation)?,
                timestamp: row.try_get("timestamp")?,
                retries: retries.max(0) as u32,
            });
        }
        Ok(out)
    }

    pub async fn update_sync_retries(&self, id: &str, retries: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE sync_queue SET retries = ?2 WHERE id = ?1")
            .bind(id)
            .bind(retries as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_sync_item(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_sync_items(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Replaces the persisted action list with `actions`, preserving order.
    pub async fn replace_actions(&self, actions: &[ActionRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_actions(&mut tx, actions).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Records `letter` and rewrites the action list without it in one
    /// transaction. On error neither table changes.
    pub async fn dead_letter_action(&self, letter: &DeadLetter, remaining: &[ActionRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_dead_letter(&mut tx, letter).await?;
        write_actions(&mut tx, remaining).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_actions(&self) -> Result<Vec<ActionRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, action, timestamp, retry_count, priority
             FROM action_queue ORDER BY position ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let action: String = row.try_get("action")?;
            let retry_count: i64 = row.try_get("retry_count")?;
            let priority: i64 = row.try_get("priority")?;
            out.push(ActionRow {
                id: row.try_get("id")?,
                action: serde_json::from_str(&action)?,
                timestamp: row.try_get("timestamp")?,
                retry_count: retry_count.max(0) as u32,
                priority: Priority::from_i64(priority)?,
            });
        }
        Ok(out)
    }

    pub async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_dead_letter(&mut tx, letter).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Moves a queued mutation to the dead-letter table. The delete and the
    /// insert commit together, so a failure leaves the row queued.
    pub async fn dead_letter_sync_item(&self, letter: &DeadLetter) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(&letter.id)
            .execute(&mut *tx)
            .await?;
        insert_dead_letter(&mut tx, letter).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, source, kind, target, payload, retries, last_error, failed_at
             FROM dead_letters ORDER BY rowid_seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let source: String = row.try_get("source")?;
            let payload: String = row.try_get("payload")?;
            let retries: i64 = row.try_get("retries")?;
            out.push(DeadLetter {
                id: row.try_get("id")?,
                source: DeadLetterSource::parse(&source)?,
                kind: row.try_get("kind")?,
                target: row.try_get("target")?,
                payload: serde_json::from_str(&payload)?,
                retries: retries.max(0) as u32,
                last_error: row.try_get("last_error")?,
                failed_at: row.try_get("failed_at")?,
            });
        }
        Ok(out)
    }

    pub async fn count_dead_letters(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn clear_dead_letters(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM dead_letters")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

async fn write_actions(tx: &mut Transaction<'_, Sqlite>, actions: &[ActionRow]) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM action_queue")
        .execute(&mut **tx)
        .await?;
    for (position, action) in actions.iter().enumerate() {
        sqlx::query(
            "INSERT INTO action_queue (position, id, action, timestamp, retry_count, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(position as i64)
        .bind(&action.id)
        .bind(serde_json::to_string(&action.action)?)
        .bind(action.timestamp)
        .bind(action.retry_count as i64)
        .bind(action.priority.as_i64())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_dead_letter(tx: &mut Transaction<'_, Sqlite>, letter: &DeadLetter) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO dead_letters (id, source, kind, target, payload, retries, last_error, failed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&letter.id)
    .bind(letter.source.as_str())
    .bind(&letter.kind)
    .bind(&letter.target)
    .bind(serde_json::to_string(&letter.payload)?)
    .bind(letter.retries as i64)
    .bind(letter.last_error.as_deref())
    .bind(letter.failed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
