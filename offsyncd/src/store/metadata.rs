//! General-purpose cache of query results and preference payloads, keyed by
//! an opaque string and carrying dependency edges for cascading
//! invalidation.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::{Priority, StoreError};
use crate::sync::clock::Clock;
use crate::sync::network::{NetworkMonitor, NetworkSpeed};

const DEFAULT_QUOTA_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    pub timestamp: i64,
    pub dependencies: Vec<String>,
    pub version: String,
    pub priority: Priority,
}

impl CacheEntry {
    pub fn age(&self, now_ms: i64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.timestamp).max(0) as u64)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheMeta {
    pub dependencies: Vec<String>,
    pub priority: Priority,
    /// Defaults to a content hash of the payload.
    pub version: Option<String>,
}

impl CacheMeta {
    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub entries: i64,
    pub payload_bytes: u64,
    pub usage_bytes: u64,
    pub quota_bytes: u64,
}

#[derive(Clone)]
pub struct MetadataCache {
    pool: SqlitePool,
    clock: Clock,
    network: NetworkMonitor,
    quota_bytes: u64,
}

impl MetadataCache {
    pub fn new(pool: SqlitePool, clock: Clock, network: NetworkMonitor) -> Self {
        Self {
            pool,
            clock,
            network,
            quota_bytes: DEFAULT_QUOTA_BYTES,
        }
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    /// Payload and write time, or `None` on a miss.
    pub async fn get(&self, key: &str) -> Result<Option<(Value, i64)>, StoreError> {
        Ok(self
            .get_entry(key)
            .await?
            .map(|entry| (entry.data, entry.timestamp)))
    }

    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT key, data, timestamp, dependencies, version, priority
             FROM cache_entries WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data: String = row.try_get("data")?;
        let dependencies: String = row.try_get("dependencies")?;
        let priority: i64 = row.try_get("priority")?;
        Ok(Some(CacheEntry {
            key: row.try_get("key")?,
            data: serde_json::from_str(&data)?,
            timestamp: row.try_get("timestamp")?,
            dependencies: serde_json::from_str(&dependencies)?,
            version: row.try_get("version")?,
            priority: Priority::from_i64(priority)?,
        }))
    }

    /// Replaces the entry under `key`. The stored timestamp never moves
    /// backwards for a key.
    pub async fn set(&self, key: &str, data: &Value, meta: CacheMeta) -> Result<CacheEntry, StoreError> {
        let payload = serde_json::to_string(data)?;
        let version = meta
            .version
            .unwrap_or_else(|| format!("{:x}", md5::compute(payload.as_bytes())));
        let dependencies = serde_json::to_string(&meta.dependencies)?;
        let now = self.clock.now_ms();

        sqlx::query(
            "INSERT INTO cache_entries (key, data, timestamp, dependencies, version, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(key) DO UPDATE SET
                data = excluded.data,
                timestamp = MAX(cache_entries.timestamp, excluded.timestamp),
                dependencies = excluded.dependencies,
                version = excluded.version,
                priority = excluded.priority",
        )
        .bind(key)
        .bind(&payload)
        .bind(now)
        .bind(&dependencies)
        .bind(&version)
        .bind(meta.priority.as_i64())
        .execute(&self.pool)
        .await?;

        let timestamp: i64 = sqlx::query("SELECT timestamp FROM cache_entries WHERE key = ?1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?
            .try_get("timestamp")?;

        Ok(CacheEntry {
            key: key.to_string(),
            data: data.clone(),
            timestamp,
            dependencies: meta.dependencies,
            version,
            priority: meta.priority,
        })
    }

    pub fn is_stale(&self, entry: &CacheEntry, max_age: Duration) -> bool {
        entry.age(self.clock.now_ms()) > self.network.effective_max_age(max_age)
    }

    pub async fn invalidate(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Breadth-first removal of `key` and every entry that transitively
    /// declared it as a dependency. Returns the keys actually removed.
    pub async fn invalidate_with_dependencies(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut pending: VecDeque<String> = VecDeque::new();
        let mut removed = Vec::new();
        visited.insert(key.to_string());
        pending.push_back(key.to_string());

        while let Some(current) = pending.pop_front() {
            for dependent in self.dependents_of(&current).await? {
                if visited.insert(dependent.clone()) {
                    pending.push_back(dependent);
                }
            }
            if self.invalidate(&current).await? {
                removed.push(current);
            }
        }

        if !removed.is_empty() {
            debug!(root = key, removed = removed.len(), "cache cascade invalidation");
        }
        Ok(removed)
    }

    async fn dependents_of(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT c.key AS key
             FROM cache_entries c, json_each(c.dependencies) d
             WHERE d.value = ?1
             ORDER BY c.key ASC",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("key").map_err(StoreError::from))
            .collect()
    }

    pub fn get_network_speed(&self) -> NetworkSpeed {
        self.network.speed()
    }

    pub async fn get_storage_status(&self) -> Result<StorageStatus, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS entries, COALESCE(SUM(LENGTH(CAST(data AS BLOB))), 0) AS payload
             FROM cache_entries",
        )
        .fetch_one(&self.pool)
        .await?;
        let entries: i64 = row.try_get("entries")?;
        let payload: i64 = row.try_get("payload")?;

        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;

        Ok(StorageStatus {
            entries,
            payload_bytes: payload.max(0) as u64,
            usage_bytes: page_count.saturating_mul(page_size).max(0) as u64,
            quota_bytes: self.quota_bytes,
        })
    }

    /// Evicts lowest-priority, oldest entries until stored payloads fit in
    /// `max_bytes`. Returns evicted keys in eviction order.
    pub async fn enforce_budget(&self, max_bytes: u64) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT key, LENGTH(CAST(data AS BLOB)) AS size FROM cache_entries
             ORDER BY priority ASC, timestamp ASC, key ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        let mut total = 0u64;
        for row in rows {
            let key: String = row.try_get("key")?;
            let size: i64 = row.try_get("size")?;
            let size = size.max(0) as u64;
            total = total.saturating_add(size);
            candidates.push((key, size));
        }

        let mut evicted = Vec::new();
        for (key, size) in candidates {
            if total <= max_bytes {
                break;
            }
            if self.invalidate(&key).await? {
                total = total.saturating_sub(size);
                evicted.push(key);
            }
        }
        Ok(evicted)
    }
}
