// Durable Store Adapter
//
// Contract for the structured document store that backs topics,
// topic offsets and consumer-group offsets. The broker never implements
// durability itself; it orchestrates whatever implements this trait.

pub mod memory;

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::InMemoryStore;

/// A single stored record.
pub type Document = serde_json::Map<String, Value>;

/// Field that uniquely identifies a document inside a collection.
pub const ID_FIELD: &str = "_id";

/// Ascending compound index over a set of fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub fields: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn unique<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            unique: true,
        }
    }
}

/// Provisioning options for a new collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CollectionOptions {
    Indexed(IndexSpec),
    TimeSeries {
        time_field: String,
        meta_field: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Gte(Value),
    Lt(Value),
}

/// Conjunction of per-field conditions. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((field.to_string(), Condition::Eq(value.into())));
        self
    }

    pub fn gte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((field.to_string(), Condition::Gte(value.into())));
        self
    }

    pub fn lt(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses.push((field.to_string(), Condition::Lt(value.into())));
        self
    }

    pub fn clauses(&self) -> &[(String, Condition)] {
        &self.clauses
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.clauses.iter().all(|(field, condition)| {
            let Some(actual) = document.get(field) else {
                return false;
            };
            match condition {
                Condition::Eq(expected) => {
                    actual == expected || compare_values(actual, expected) == Some(Ordering::Equal)
                }
                Condition::Gte(bound) => matches!(
                    compare_values(actual, bound),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
                Condition::Lt(bound) => compare_values(actual, bound) == Some(Ordering::Less),
            }
        })
    }

    /// Seed document for an upsert: every equality clause becomes a field.
    pub fn upsert_seed(&self) -> Document {
        self.clauses
            .iter()
            .filter_map(|(field, condition)| match condition {
                Condition::Eq(value) => Some((field.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Ascending sort over a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
}

impl Sort {
    pub fn ascending(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Set(String, Value),
    /// Applied only when the update inserts a new document.
    SetOnInsert(String, Value),
    Unset(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    updates: Vec<Update>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.updates.push(Update::Set(field.to_string(), value.into()));
        self
    }

    pub fn set_on_insert(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.updates.push(Update::SetOnInsert(field.to_string(), value.into()));
        self
    }

    pub fn unset(mut self, field: &str) -> Self {
        self.updates.push(Update::Unset(field.to_string()));
        self
    }

    pub fn apply(&self, document: &mut Document, inserting: bool) {
        for update in &self.updates {
            match update {
                Update::Set(field, value) => {
                    document.insert(field.clone(), value.clone());
                }
                Update::SetOnInsert(field, value) => {
                    if inserting {
                        document.insert(field.clone(), value.clone());
                    }
                }
                Update::Unset(field) => {
                    document.remove(field);
                }
            }
        }
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub upserted: bool,
}

/// One row of a max-per-group aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMax {
    pub key: Value,
    pub max: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backing database refused or dropped the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate key in `{collection}`: {key}")]
    DuplicateKey { collection: String, key: String },

    #[error("unknown collection `{0}`")]
    UnknownCollection(String),

    #[error("collection `{0}` already exists")]
    CollectionExists(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Structured document store consumed by the broker.
///
/// Reads against a collection that does not exist behave like reads
/// against an empty one. Writes require the collection to exist.
/// "No matching record" is never an error: point lookups return `None`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_collection(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> Result<(), StoreError>;

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError>;

    /// Inserts all documents or none of them.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<(), StoreError>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
    ) -> Result<Vec<Document>, StoreError>;

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
        upsert: bool,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Maximum of the numeric `max_field` for every distinct `group_key`,
    /// ordered by key.
    async fn aggregate_max_per_group(
        &self,
        collection: &str,
        group_key: &str,
        max_field: &str,
    ) -> Result<Vec<GroupMax>, StoreError>;

    async fn list_collection_names(&self) -> Result<Vec<String>, StoreError>;
}

/// Handle through which every component talks to the store.
///
/// Each call is bounded by the configured timeout; on expiry the call
/// fails with [`StoreError::Timeout`] and is not retried.
#[derive(Clone)]
pub struct Database {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl Database {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    pub async fn create_collection(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> Result<(), StoreError> {
        self.bounded(self.store.create_collection(name, options)).await
    }

    pub async fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        self.bounded(self.store.insert_one(collection, document)).await
    }

    pub async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        self.bounded(self.store.insert_many(collection, documents))
            .await
    }

    pub async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        self.bounded(self.store.find_one(collection, filter)).await
    }

    pub async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
    ) -> Result<Vec<Document>, StoreError> {
        self.bounded(self.store.find(collection, filter, sort)).await
    }

    pub async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
        upsert: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        self.bounded(self.store.update_one(collection, filter, patch, upsert))
            .await
    }

    pub async fn aggregate_max_per_group(
        &self,
        collection: &str,
        group_key: &str,
        max_field: &str,
    ) -> Result<Vec<GroupMax>, StoreError> {
        self.bounded(
            self.store
                .aggregate_max_per_group(collection, group_key, max_field),
        )
        .await
    }

    pub async fn list_collection_names(&self) -> Result<Vec<String>, StoreError> {
        self.bounded(self.store.list_collection_names()).await
    }
}

/// Total order over scalar JSON values of the same kind.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_u64(), y.as_u64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn filter_matches_equality_and_ranges() {
        let d = doc(json!({ "partition": 1, "offset": 7 }));

        assert!(Filter::new().matches(&d));
        assert!(Filter::new().eq("partition", 1).gte("offset", 7).matches(&d));
        assert!(!Filter::new().eq("partition", 0).matches(&d));
        assert!(!Filter::new().gte("offset", 8).matches(&d));
        assert!(Filter::new().lt("offset", 8).matches(&d));
        assert!(!Filter::new().eq("missing", 1).matches(&d));
    }

    #[test]
    fn patch_respects_insert_only_fields() {
        let patch = Patch::new()
            .set("uncommittedOffset", 4)
            .set_on_insert("offset", 0);

        let mut existing = doc(json!({ "offset": 2 }));
        patch.apply(&mut existing, false);
        assert_eq!(existing["offset"], json!(2));
        assert_eq!(existing["uncommittedOffset"], json!(4));

        let mut fresh = Document::new();
        patch.apply(&mut fresh, true);
        assert_eq!(fresh["offset"], json!(0));
    }

    #[test]
    fn patch_sets_and_unsets() {
        let mut d = doc(json!({ "count": 2, "pending": 9 }));
        Patch::new().set("count", 5).unset("pending").apply(&mut d, false);

        assert_eq!(d["count"], json!(5));
        assert!(!d.contains_key("pending"));
    }

    #[test]
    fn upsert_seed_keeps_only_equalities() {
        let filter = Filter::new().eq("topic", "orders").gte("offset", 3);
        let seed = filter.upsert_seed();

        assert_eq!(seed.len(), 1);
        assert_eq!(seed["topic"], json!("orders"));
    }
}
