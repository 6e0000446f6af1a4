//! Typed remote mutations replayed by the background sync queue.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use offsync_core::{BackendError, CollectionClient, Match};

use crate::store::SyncRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

/// One of the three remote operations of the collection protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mutation {
    Create {
        table: String,
        record: Value,
    },
    Update {
        table: String,
        filter: Match,
        changes: Value,
    },
    Delete {
        table: String,
        filter: Match,
    },
}

impl Mutation {
    pub fn create(table: impl Into<String>, record: Value) -> Self {
        Mutation::Create {
            table: table.into(),
            record,
        }
    }

    pub fn update(table: impl Into<String>, filter: Match, changes: Value) -> Self {
        Mutation::Update {
            table: table.into(),
            filter,
            changes,
        }
    }

    pub fn delete(table: impl Into<String>, filter: Match) -> Self {
        Mutation::Delete {
            table: table.into(),
            filter,
        }
    }

    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Create { .. } => MutationKind::Create,
            Mutation::Update { .. } => MutationKind::Update,
            Mutation::Delete { .. } => MutationKind::Delete,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Mutation::Create { table, .. }
            | Mutation::Update { table, .. }
            | Mutation::Delete { table, .. } => table,
        }
    }

    pub async fn apply(&self, client: &CollectionClient) -> Result<(), BackendError> {
        match self {
            Mutation::Create { table, record } => client.insert(table, record).await,
            Mutation::Update {
                table,
                filter,
                changes,
            } => client.update(table, filter, changes).await,
            Mutation::Delete { table, filter } => client.delete(table, filter).await,
        }
    }
}

/// Cache dependency key invalidated after any successful replay against
/// `table`.
pub fn table_dependency_key(table: &str) -> String {
    format!("table:{table}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueItem {
    pub id: String,
    pub mutation: Mutation,
    pub timestamp: i64,
    pub retries: u32,
}

impl SyncQueueItem {
    pub fn new(mutation: Mutation, timestamp: i64) -> Self {
        Self {
            id: new_id(timestamp),
            mutation,
            timestamp,
            retries: 0,
        }
    }

    pub(crate) fn to_row(&self) -> Result<SyncRow, serde_json::Error> {
        Ok(SyncRow {
            id: self.id.clone(),
            kind: self.mutation.kind().as_str().to_string(),
            collection: self.mutation.table().to_string(),
            mutation: serde_json::to_value(&self.mutation)?,
            timestamp: self.timestamp,
            retries: self.retries,
        })
    }

    pub(crate) fn from_row(row: SyncRow) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: row.id,
            mutation: serde_json::from_value(row.mutation)?,
            timestamp: row.timestamp,
            retries: row.retries,
        })
    }
}

/// Time-prefixed random identifier shared by both queues.
pub(crate) fn new_id(timestamp: i64) -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("{timestamp}-{suffix:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mutations_serialize_with_type_tag() {
        let mutation = Mutation::update(
            "document_regions",
            Match::eq("id", "r1"),
            json!({"label": "Intro"}),
        );
        let value = serde_json::to_value(&mutation).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["table"], "document_regions");
        assert_eq!(value["filter"], json!({"id": "r1"}));
        assert_eq!(serde_json::from_value::<Mutation>(value).unwrap(), mutation);
    }

    #[test]
    fn row_conversion_denormalizes_kind_and_collection() {
        let item = SyncQueueItem::new(
            Mutation::delete("worksheets", Match::eq("id", "w1")),
            1_700,
        );
        assert!(item.id.starts_with("1700-"));
        let row = item.to_row().unwrap();
        assert_eq!(row.kind, "delete");
        assert_eq!(row.collection, "worksheets");
        assert_eq!(SyncQueueItem::from_row(row).unwrap(), item);
    }

    #[test]
    fn ids_are_unique_for_the_same_timestamp() {
        assert_ne!(new_id(5), new_id(5));
    }

    #[test]
    fn table_dependency_key_is_prefixed() {
        assert_eq!(table_dependency_key("folders"), "table:folders");
    }
}
