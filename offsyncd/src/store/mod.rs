//! Durable client-side storage backed by SQLite.
//!
//! One database holds both logical namespaces: the entity store keyed by
//! `(collection, id)` and the metadata cache keyed by an opaque string,
//! plus the rows of both replay queues and the dead-letter log.

use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

use crate::sync::{clock::Clock, network::NetworkMonitor};

pub mod entities;
pub mod metadata;
pub mod queues;

pub use entities::{CoverRecord, CoverSource, EntityInput, EntityKind, EntityRecord, EntityStore};
pub use metadata::{CacheEntry, CacheMeta, MetadataCache, StorageStatus};
pub use queues::{ActionRow, DeadLetter, DeadLetterSource, QueueStore, SyncRow};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid collection: {0}")]
    InvalidCollection(String),
    #[error("invalid priority: {0}")]
    InvalidPriority(i64),
    #[error("invalid dead-letter source: {0}")]
    InvalidSource(String),
}

/// Shared by cache entries and deferred actions. Ordering is
/// `Low < Medium < High`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Result<Self, StoreError> {
        match value {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Medium),
            2 => Ok(Priority::High),
            other => Err(StoreError::InvalidPriority(other)),
        }
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, StoreError> {
        Self::open(default_db_path()?).await
    }

    /// In-memory database pinned to a single connection so every handle
    /// sees the same data.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn entities(&self) -> EntityStore {
        EntityStore::new(self.pool.clone())
    }

    pub fn queues(&self) -> QueueStore {
        QueueStore::new(self.pool.clone())
    }

    pub fn metadata(&self, clock: Clock, network: NetworkMonitor) -> MetadataCache {
        MetadataCache::new(self.pool.clone(), clock, network)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("offsync");
    path.push("cache.db");
    Ok(path)
}
