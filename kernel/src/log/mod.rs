// Event Log
//
// Appends events to a topic's collection under offsets handed out by the
// offset manager, and serves consumer-group polls starting from the
// group's committed position.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::offset::{Offset, OffsetError, OffsetManager, TopicPartition};
use crate::store::{Database, Document, Filter, Sort, StoreError, ID_FIELD};
use crate::topic::Partition;

/// An appended event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub partition: Partition,
    pub offset: Offset,
    pub event_type: String,
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    fn to_document(&self) -> Result<Document, LogError> {
        let Value::Object(mut document) = serde_json::to_value(self).map_err(StoreError::from)?
        else {
            return Err(LogError::CorruptEvent("event did not encode to an object".into()));
        };
        if let Some(id) = document.remove("id") {
            document.insert(ID_FIELD.to_string(), id);
        }
        Ok(document)
    }

    fn from_document(mut document: Document) -> Result<Self, LogError> {
        if let Some(id) = document.remove(ID_FIELD) {
            document.insert("id".to_string(), id);
        }
        serde_json::from_value(Value::Object(document))
            .map_err(|e| LogError::CorruptEvent(e.to_string()))
    }
}

/// Producer payload. The offset is assigned by the broker; the id is
/// generated when absent or empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    pub partition: Partition,
    pub event_type: String,
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
}

impl NewEvent {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("corrupt event: {0}")]
    CorruptEvent(String),

    #[error("offset error: {0}")]
    Offsets(#[from] OffsetError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

type GroupKey = (String, TopicPartition);

pub struct EventLog {
    db: Database,
    offsets: Arc<OffsetManager>,
    /// Present when polls of one group on one partition are serialized.
    poll_locks: Option<DashMap<GroupKey, Arc<AsyncMutex<()>>>>,
}

impl EventLog {
    pub fn new(db: Database, offsets: Arc<OffsetManager>, serialize_polls: bool) -> Self {
        Self {
            db,
            offsets,
            poll_locks: serialize_polls.then(DashMap::new),
        }
    }

    /// Append an event and return its offset.
    ///
    /// If the insert fails after assignment, the assigned offset is never
    /// reused and the partition shows a gap there.
    pub async fn append(&self, event: NewEvent) -> Result<Offset, LogError> {
        let partition = event.topic_partition();
        let offset = self.offsets.assign_next_offset(&partition)?;

        let record = Event {
            id: event
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            partition: event.partition,
            offset,
            event_type: event.event_type,
            entity_id: event.entity_id,
            timestamp: event.timestamp,
        };

        if let Err(e) = self
            .db
            .insert_one(&partition.topic, record.to_document()?)
            .await
        {
            warn!(%partition, offset, error = %e, "append failed, offset skipped");
            return Err(e.into());
        }

        debug!(%partition, offset, id = %record.id, "event appended");
        Ok(offset)
    }

    /// Events at or after the group's committed offset, in offset order.
    ///
    /// A non-empty batch moves the group's uncommitted offset past its last
    /// event. Until the group commits, the same batch is served again.
    pub async fn list(
        &self,
        group: &str,
        partition: &TopicPartition,
    ) -> Result<Vec<Event>, LogError> {
        let Some(locks) = &self.poll_locks else {
            return self.list_unguarded(group, partition).await;
        };

        let key = (group.to_string(), partition.clone());
        let lock = Arc::clone(locks.entry(key.clone()).or_default().value());
        let guard = Arc::clone(&lock).lock_owned().await;
        let listed = self.list_unguarded(group, partition).await;
        drop(guard);
        drop(lock);

        // Drop the entry once no other poll holds or waits on it.
        locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        listed
    }

    async fn list_unguarded(
        &self,
        group: &str,
        partition: &TopicPartition,
    ) -> Result<Vec<Event>, LogError> {
        let position = self.offsets.get_group_position(group, partition).await?;
        let filter = Filter::new()
            .eq("partition", partition.partition)
            .gte("offset", position.committed);
        let documents = self
            .db
            .find(&partition.topic, &filter, Some(&Sort::ascending("offset")))
            .await?;
        let events = documents
            .into_iter()
            .map(Event::from_document)
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(last) = events.last() {
            let next = last.offset.checked_add(1).ok_or_else(|| {
                LogError::CorruptEvent(format!("offset {} has no successor", last.offset))
            })?;
            self.offsets.advance_uncommitted(group, partition, next).await?;
        }
        debug!(group, %partition, from = position.committed, count = events.len(), "polled");
        Ok(events)
    }
}
