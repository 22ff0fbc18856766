// In-Memory Document Store
//
// Reference implementation of the store contract. Keeps every collection
// in process memory and can be snapshotted to / restored from JSON so a
// broker restart can be exercised without an external database.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{
    compare_values, CollectionOptions, Document, DocumentStore, Filter, GroupMax, Patch, Sort,
    StoreError, UpdateOutcome, ID_FIELD,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Collection {
    options: CollectionOptions,
    documents: Vec<Document>,
}

impl Collection {
    /// Rejects `candidate` if it collides with a stored document on `_id`
    /// or on a unique index.
    fn check_unique(&self, name: &str, candidate: &Document) -> Result<(), StoreError> {
        let id = candidate.get(ID_FIELD);
        let unique_fields = match &self.options {
            CollectionOptions::Indexed(index) if index.unique => Some(&index.fields),
            _ => None,
        };

        for existing in &self.documents {
            if id.is_some() && existing.get(ID_FIELD) == id {
                return Err(StoreError::DuplicateKey {
                    collection: name.to_string(),
                    key: format!("{ID_FIELD}={}", id.unwrap_or(&Value::Null)),
                });
            }
            if let Some(fields) = unique_fields {
                let collides = fields
                    .iter()
                    .all(|field| match (existing.get(field), candidate.get(field)) {
                        (Some(a), Some(b)) => a == b,
                        _ => false,
                    });
                if collides {
                    let key = fields
                        .iter()
                        .map(|field| format!("{field}={}", candidate[field]))
                        .collect::<Vec<_>>()
                        .join(",");
                    return Err(StoreError::DuplicateKey {
                        collection: name.to_string(),
                        key,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Document store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<BTreeMap<String, Collection>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize every collection to JSON.
    pub fn snapshot(&self) -> Result<String, StoreError> {
        let collections = self.collections.read();
        Ok(serde_json::to_string(&*collections)?)
    }

    /// Rebuild a store from a [`snapshot`](Self::snapshot).
    pub fn from_snapshot(data: &str) -> Result<Self, StoreError> {
        let collections: BTreeMap<String, Collection> = serde_json::from_str(data)?;
        Ok(Self {
            collections: RwLock::new(collections),
        })
    }
}

fn with_id(mut document: Document) -> Document {
    document
        .entry(ID_FIELD)
        .or_insert_with(|| Value::String(Uuid::new_v4().simple().to_string()));
    document
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create_collection(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(StoreError::CollectionExists(name.to_string()));
        }
        collections.insert(
            name.to_string(),
            Collection {
                options,
                documents: Vec::new(),
            },
        );
        Ok(())
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        self.insert_many(collection, vec![document]).await
    }

    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write();
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?;

        // Validate the whole batch against a scratch copy before touching
        // the stored documents.
        let mut staged = Collection {
            options: target.options.clone(),
            documents: Vec::with_capacity(documents.len()),
        };
        for document in documents.into_iter().map(with_id) {
            target.check_unique(collection, &document)?;
            staged.check_unique(collection, &document)?;
            staged.documents.push(document);
        }
        target.documents.extend(staged.documents);
        Ok(())
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read();
        Ok(collections.get(collection).and_then(|c| {
            c.documents.iter().find(|document| filter.matches(document)).cloned()
        }))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
    ) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read();
        let Some(c) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut found: Vec<Document> = c
            .documents
            .iter()
            .filter(|document| filter.matches(document))
            .cloned()
            .collect();
        if let Some(sort) = sort {
            found.sort_by(|a, b| match (a.get(&sort.field), b.get(&sort.field)) {
                (Some(a), Some(b)) => compare_values(a, b).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (None, None) => std::cmp::Ordering::Equal,
            });
        }
        Ok(found)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
        upsert: bool,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut collections = self.collections.write();
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?;

        if let Some(document) = target
            .documents
            .iter_mut()
            .find(|document| filter.matches(document))
        {
            patch.apply(document, false);
            return Ok(UpdateOutcome {
                matched: 1,
                upserted: false,
            });
        }

        if !upsert {
            return Ok(UpdateOutcome::default());
        }

        let mut document = filter.upsert_seed();
        patch.apply(&mut document, true);
        let document = with_id(document);
        target.check_unique(collection, &document)?;
        target.documents.push(document);
        Ok(UpdateOutcome {
            matched: 0,
            upserted: true,
        })
    }

    async fn aggregate_max_per_group(
        &self,
        collection: &str,
        group_key: &str,
        max_field: &str,
    ) -> Result<Vec<GroupMax>, StoreError> {
        let collections = self.collections.read();
        let Some(c) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut groups: Vec<GroupMax> = Vec::new();
        for document in &c.documents {
            let (Some(key), Some(value)) = (
                document.get(group_key),
                document.get(max_field).and_then(Value::as_u64),
            ) else {
                continue;
            };
            match groups.iter_mut().find(|g| &g.key == key) {
                Some(group) => group.max = group.max.max(value),
                None => groups.push(GroupMax {
                    key: key.clone(),
                    max: value,
                }),
            }
        }
        groups.sort_by(|a, b| compare_values(&a.key, &b.key).unwrap_or(std::cmp::Ordering::Equal));
        Ok(groups)
    }

    async fn list_collection_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.collections.read().keys().cloned().collect())
    }
}
