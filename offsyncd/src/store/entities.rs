use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use offsync_core::Match;

use super::StoreError;

/// Domain collections mirrored locally for offline use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Document,
    Folder,
    Worksheet,
    LevelActivation,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Document,
        EntityKind::Folder,
        EntityKind::Worksheet,
        EntityKind::LevelActivation,
    ];

    /// Backend collection name, also used as the local namespace.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Document => "documents",
            EntityKind::Folder => "folders",
            EntityKind::Worksheet => "worksheets",
            EntityKind::LevelActivation => "level_activations",
        }
    }

    pub fn from_collection(value: &str) -> Result<Self, StoreError> {
        match value {
            "documents" => Ok(EntityKind::Document),
            "folders" => Ok(EntityKind::Folder),
            "worksheets" => Ok(EntityKind::Worksheet),
            "level_activations" => Ok(EntityKind::LevelActivation),
            other => Err(StoreError::InvalidCollection(other.to_string())),
        }
    }

    /// Metadata-cache key that query results covering this entity should
    /// list as a dependency.
    pub fn dependency_key(&self, id: &str) -> String {
        format!("{}:{}", self.collection(), id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityInput {
    pub kind: EntityKind,
    pub id: String,
    pub data: Value,
}

impl EntityInput {
    pub fn new(kind: EntityKind, id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            id: id.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub id: String,
    pub data: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverSource {
    Url(String),
    Blob(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverRecord {
    pub id: String,
    pub source: CoverSource,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Writes every entity stamped with `timestamp`. A row already holding a
    /// newer timestamp is left untouched. Returns how many rows were written.
    pub async fn save(&self, entities: &[EntityInput], timestamp: i64) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for entity in entities {
            let data = serde_json::to_string(&entity.data)?;
            let result = sqlx::query(
                "INSERT INTO entities (collection, id, data, timestamp) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(collection, id) DO UPDATE SET
                    data = excluded.data,
                    timestamp = excluded.timestamp
                 WHERE excluded.timestamp >= entities.timestamp",
            )
            .bind(entity.kind.collection())
            .bind(&entity.id)
            .bind(data)
            .bind(timestamp)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT collection, id, data, timestamp FROM entities WHERE collection = ?1 AND id = ?2",
        )
        .bind(kind.collection())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| entity_from_row(&row)).transpose()
    }

    /// Lists cached entities, optionally narrowed to one collection and to
    /// records whose fields equal every column of `filter`.
    pub async fn get_all(
        &self,
        kind: Option<EntityKind>,
        filter: Option<&Match>,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    "SELECT collection, id, data, timestamp FROM entities
                     WHERE collection = ?1 ORDER BY id ASC",
                )
                .bind(kind.collection())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT collection, id, data, timestamp FROM entities
                     ORDER BY collection ASC, id ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let record = entity_from_row(&row)?;
            if filter.is_none_or(|f| f.matches(&record.data)) {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub async fn remove(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM entities WHERE collection = ?1 AND id = ?2")
            .bind(kind.collection())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM entities")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    /// Same timestamp rule as [`EntityStore::save`]. Returns whether the
    /// cover was written.
    pub async fn save_cover(
        &self,
        id: &str,
        source: &CoverSource,
        timestamp: i64,
    ) -> Result<bool, StoreError> {
        let (url, blob) = match source {
            CoverSource::Url(url) => (Some(url.as_str()), None),
            CoverSource::Blob(bytes) => (None, Some(bytes.as_slice())),
        };
        let result = sqlx::query(
            "INSERT INTO covers (id, url, blob, timestamp) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                blob = excluded.blob,
                timestamp = excluded.timestamp
             WHERE excluded.timestamp >= covers.timestamp",
        )
        .bind(id)
        .bind(url)
        .bind(blob)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_cover(&self, id: &str) -> Result<Option<CoverRecord>, StoreError> {
        let row = sqlx::query("SELECT id, url, blob, timestamp FROM covers WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let url: Option<String> = row.try_get("url")?;
        let blob: Option<Vec<u8>> = row.try_get("blob")?;
        let source = match (url, blob) {
            (Some(url), _) => CoverSource::Url(url),
            (None, Some(blob)) => CoverSource::Blob(blob),
            (None, None) => CoverSource::Blob(Vec::new()),
        };
        Ok(Some(CoverRecord {
            id: row.try_get("id")?,
            source,
            timestamp: row.try_get("timestamp")?,
        }))
    }
}

fn entity_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EntityRecord, StoreError> {
    let collection: String = row.try_get("collection")?;
    let data: String = row.try_get("data")?;
    Ok(EntityRecord {
        kind: EntityKind::from_collection(&collection)?,
        id: row.try_get("id")?,
        data: serde_json::from_str(&data)?,
        timestamp: row.try_get("timestamp")?,
    })
}
