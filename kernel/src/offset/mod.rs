// Offset Manager
//
// Owns the two offset families of the broker:
// - topic offsets: next offset to assign per (topic, partition), served
//   from an in-memory cache and persisted lazily;
// - consumer-group offsets: committed and uncommitted read position per
//   (group, topic, partition), persisted on every change.
//
// The cache is authoritative until restart. The persisted topic offset
// never exceeds the cached value; reconciliation repairs the cache when
// the log is found ahead of it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::store::{Database, Document, Filter, GroupMax, Patch, StoreError};
use crate::topic::Partition;

/// Zero-based position of an event within its partition.
pub type Offset = u64;

pub const TOPIC_OFFSETS: &str = "topicOffsets";
pub const CONSUMER_GROUP_OFFSETS: &str = "consumerGroupOffsets";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: Partition,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: Partition) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicOffsetRecord {
    topic: String,
    partition: Partition,
    offset: Offset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerGroupOffsetRecord {
    consumer_group: String,
    topic: String,
    partition: Partition,
    #[serde(default)]
    offset: Offset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uncommitted_offset: Option<Offset>,
}

/// Read position of a consumer group on one partition.
///
/// An unseen group sits at the beginning of the log with nothing pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPosition {
    pub committed: Offset,
    pub uncommitted: Option<Offset>,
}

/// A cache entry raised by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRaise {
    pub partition: TopicPartition,
    pub from: Offset,
    pub to: Offset,
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetError {
    #[error("unknown partition {0}")]
    UnknownPartition(TopicPartition),

    #[error("offset space exhausted for {0}")]
    Exhausted(TopicPartition),

    #[error("corrupt record in `{collection}`: {reason}")]
    CorruptRecord {
        collection: &'static str,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Next-offset counter for one partition, behind its exclusive guard.
///
/// The guard is synchronous and never held across a store call.
#[derive(Debug)]
pub struct PartitionCounter {
    next: Mutex<Offset>,
}

impl PartitionCounter {
    fn new(next: Offset) -> Self {
        Self {
            next: Mutex::new(next),
        }
    }

    pub fn peek(&self) -> Offset {
        *self.next.lock()
    }

    fn take(&self) -> Option<Offset> {
        let mut next = self.next.lock();
        let assigned = *next;
        *next = assigned.checked_add(1)?;
        Some(assigned)
    }

    /// Raise the counter to `target`, returning the previous value if it moved.
    fn raise_to(&self, target: Offset) -> Option<Offset> {
        let mut next = self.next.lock();
        if target > *next {
            let previous = *next;
            *next = target;
            Some(previous)
        } else {
            None
        }
    }
}

pub struct OffsetManager {
    db: Database,
    // Entries are only ever added, never replaced.
    cache: DashMap<TopicPartition, Arc<PartitionCounter>>,
}

impl OffsetManager {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cache: DashMap::new(),
        }
    }

    fn counter(&self, partition: &TopicPartition) -> Option<Arc<PartitionCounter>> {
        self.cache
            .get(partition)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Insert a counter if absent and raise it to at least `next`.
    fn register(&self, partition: TopicPartition, next: Offset) -> Arc<PartitionCounter> {
        let counter = Arc::clone(
            self.cache
                .entry(partition)
                .or_insert_with(|| Arc::new(PartitionCounter::new(next)))
                .value(),
        );
        counter.raise_to(next);
        counter
    }

    pub fn knows(&self, partition: &TopicPartition) -> bool {
        self.cache.contains_key(partition)
    }

    pub fn cached_next_offset(&self, partition: &TopicPartition) -> Option<Offset> {
        self.counter(partition).map(|c| c.peek())
    }

    pub fn partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<_> = self.cache.iter().map(|e| e.key().clone()).collect();
        partitions.sort();
        partitions
    }

    /// Persist a zero offset for each partition of a new topic and
    /// register it in the cache.
    ///
    /// The records go in with one all-or-nothing insert, so a topic either
    /// has every partition seeded or none.
    pub async fn seed_topic(&self, topic: &str, partitions: Partition) -> Result<(), OffsetError> {
        let records = (0..partitions)
            .map(|partition| {
                to_document(&TopicOffsetRecord {
                    topic: topic.to_string(),
                    partition,
                    offset: 0,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.db.insert_many(TOPIC_OFFSETS, records).await?;

        for partition in 0..partitions {
            self.register(TopicPartition::new(topic, partition), 0);
        }
        Ok(())
    }

    /// Number of persisted offset records for `topic`.
    pub async fn seeded_partitions(&self, topic: &str) -> Result<usize, OffsetError> {
        let records = self
            .db
            .find(TOPIC_OFFSETS, &Filter::new().eq("topic", topic), None)
            .await?;
        Ok(records.len())
    }

    /// Load every persisted topic offset into the cache.
    pub async fn load(&self) -> Result<Vec<TopicPartition>, OffsetError> {
        let documents = self.db.find(TOPIC_OFFSETS, &Filter::new(), None).await?;

        let mut loaded = Vec::with_capacity(documents.len());
        for document in documents {
            let record: TopicOffsetRecord = decode(TOPIC_OFFSETS, document)?;
            let partition = TopicPartition::new(record.topic, record.partition);
            self.register(partition.clone(), record.offset);
            loaded.push(partition);
        }
        loaded.sort();
        debug!(partitions = loaded.len(), "loaded topic offsets");
        Ok(loaded)
    }

    /// Hand out the next offset for a partition.
    ///
    /// Serialized per partition by the counter's guard; never touches
    /// the store.
    pub fn assign_next_offset(&self, partition: &TopicPartition) -> Result<Offset, OffsetError> {
        let counter = self
            .counter(partition)
            .ok_or_else(|| OffsetError::UnknownPartition(partition.clone()))?;
        counter
            .take()
            .ok_or_else(|| OffsetError::Exhausted(partition.clone()))
    }

    /// Raise cached (and persisted) next offsets to one past the highest
    /// offset actually present in each topic's log.
    ///
    /// Idempotent: a second run over the same log raises nothing.
    pub async fn rebuild_from_log(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<Vec<OffsetRaise>, OffsetError> {
        let wanted: BTreeSet<&TopicPartition> = partitions.iter().collect();
        let topics: BTreeSet<&str> = partitions.iter().map(|p| p.topic.as_str()).collect();

        let mut raised = Vec::new();
        for topic in topics {
            let maxima = self
                .db
                .aggregate_max_per_group(topic, "partition", "offset")
                .await?;

            for GroupMax { key, max } in maxima {
                let Some(partition) = partition_key(&key) else {
                    warn!(topic, key = %key, "ignoring log entries with an invalid partition");
                    continue;
                };
                let partition = TopicPartition::new(topic, partition);
                if !wanted.contains(&partition) {
                    warn!(%partition, "log holds events for a partition without offset state");
                    continue;
                }

                let next = max
                    .checked_add(1)
                    .ok_or_else(|| OffsetError::Exhausted(partition.clone()))?;
                let counter = self.register(partition.clone(), 0);
                if let Some(previous) = counter.raise_to(next) {
                    self.persist_topic_offset(&partition, next).await?;
                    info!(%partition, from = previous, to = next, "raised offset cache to match log");
                    raised.push(OffsetRaise {
                        partition,
                        from: previous,
                        to: next,
                    });
                }
            }
        }
        Ok(raised)
    }

    async fn persist_topic_offset(
        &self,
        partition: &TopicPartition,
        next: Offset,
    ) -> Result<(), OffsetError> {
        let filter = Filter::new()
            .eq("topic", partition.topic.as_str())
            .eq("partition", partition.partition);
        self.db
            .update_one(TOPIC_OFFSETS, &filter, &Patch::new().set("offset", next), true)
            .await?;
        Ok(())
    }

    /// Persist every cached next offset that is ahead of its stored copy.
    ///
    /// Returns how many records moved.
    pub async fn checkpoint(&self) -> Result<usize, OffsetError> {
        let snapshot: Vec<(TopicPartition, Offset)> = self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().peek()))
            .collect();

        let mut moved = 0;
        for (partition, next) in snapshot {
            let filter = Filter::new()
                .eq("topic", partition.topic.as_str())
                .eq("partition", partition.partition)
                .lt("offset", next);
            let outcome = self
                .db
                .update_one(TOPIC_OFFSETS, &filter, &Patch::new().set("offset", next), false)
                .await?;
            if outcome.matched > 0 {
                moved += 1;
            }
        }
        info!(moved, "checkpointed topic offsets");
        Ok(moved)
    }

    fn group_filter(group: &str, partition: &TopicPartition) -> Filter {
        Filter::new()
            .eq("consumerGroup", group)
            .eq("topic", partition.topic.as_str())
            .eq("partition", partition.partition)
    }

    pub async fn get_group_position(
        &self,
        group: &str,
        partition: &TopicPartition,
    ) -> Result<GroupPosition, OffsetError> {
        let found = self
            .db
            .find_one(CONSUMER_GROUP_OFFSETS, &Self::group_filter(group, partition))
            .await?;
        let Some(document) = found else {
            return Ok(GroupPosition::default());
        };
        let record: ConsumerGroupOffsetRecord = decode(CONSUMER_GROUP_OFFSETS, document)?;
        Ok(GroupPosition {
            committed: record.offset,
            uncommitted: record.uncommitted_offset,
        })
    }

    /// Overwrite the group's uncommitted position, creating the record
    /// with a committed offset of 0 if needed. Last writer wins.
    pub async fn advance_uncommitted(
        &self,
        group: &str,
        partition: &TopicPartition,
        uncommitted: Offset,
    ) -> Result<(), OffsetError> {
        let patch = Patch::new()
            .set("uncommittedOffset", uncommitted)
            .set_on_insert("offset", 0);
        self.db
            .update_one(
                CONSUMER_GROUP_OFFSETS,
                &Self::group_filter(group, partition),
                &patch,
                true,
            )
            .await?;
        debug!(group, %partition, uncommitted, "advanced uncommitted offset");
        Ok(())
    }

    /// Promote the uncommitted position to the committed offset.
    ///
    /// Returns the new committed offset, or `None` when nothing was pending.
    /// The committed offset never moves backwards.
    pub async fn commit(
        &self,
        group: &str,
        partition: &TopicPartition,
    ) -> Result<Option<Offset>, OffsetError> {
        let position = self.get_group_position(group, partition).await?;
        let Some(pending) = position.uncommitted else {
            debug!(group, %partition, "nothing to commit");
            return Ok(None);
        };
        if pending < position.committed {
            warn!(
                group,
                %partition,
                pending,
                committed = position.committed,
                "uncommitted offset behind committed offset"
            );
        }
        let committed = pending.max(position.committed);

        let patch = Patch::new()
            .set("offset", committed)
            .unset("uncommittedOffset");
        self.db
            .update_one(
                CONSUMER_GROUP_OFFSETS,
                &Self::group_filter(group, partition),
                &patch,
                false,
            )
            .await?;
        info!(group, %partition, committed, "committed consumer group offset");
        Ok(Some(committed))
    }
}

fn partition_key(key: &Value) -> Option<Partition> {
    key.as_u64().and_then(|p| Partition::try_from(p).ok())
}

fn to_document<T: Serialize>(record: &T) -> Result<Document, OffsetError> {
    match serde_json::to_value(record).map_err(StoreError::from)? {
        Value::Object(document) => Ok(document),
        other => Err(OffsetError::CorruptRecord {
            collection: TOPIC_OFFSETS,
            reason: format!("expected an object, got {other}"),
        }),
    }
}

fn decode<T: DeserializeOwned>(
    collection: &'static str,
    document: Document,
) -> Result<T, OffsetError> {
    serde_json::from_value(Value::Object(document)).map_err(|e| OffsetError::CorruptRecord {
        collection,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::provision_system_collections;
    use crate::store::{CollectionOptions, IndexSpec, InMemoryStore};
    use crate::topic::ORDERING_INDEX;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    async fn manager() -> (Database, Arc<OffsetManager>) {
        let db = Database::new(Arc::new(InMemoryStore::new()), Duration::from_secs(5));
        provision_system_collections(&db).await.unwrap();
        db.create_collection(
            "orders",
            CollectionOptions::Indexed(IndexSpec::unique(ORDERING_INDEX)),
        )
        .await
        .unwrap();
        let offsets = Arc::new(OffsetManager::new(db.clone()));
        offsets.seed_topic("orders", 2).await.unwrap();
        (db, offsets)
    }

    async fn write_event(db: &Database, partition: Partition, offset: Offset) {
        let document = match json!({ "partition": partition, "offset": offset }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        db.insert_one("orders", document).await.unwrap();
    }

    async fn persisted_offset(db: &Database, partition: Partition) -> Offset {
        let document = db
            .find_one(
                TOPIC_OFFSETS,
                &Filter::new().eq("topic", "orders").eq("partition", partition),
            )
            .await
            .unwrap()
            .unwrap();
        document["offset"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn assignment_increments_per_partition() {
        let (_, offsets) = manager().await;
        let p0 = TopicPartition::new("orders", 0);
        let p1 = TopicPartition::new("orders", 1);

        assert_eq!(offsets.assign_next_offset(&p0).unwrap(), 0);
        assert_eq!(offsets.assign_next_offset(&p0).unwrap(), 1);
        assert_eq!(offsets.assign_next_offset(&p1).unwrap(), 0);
        assert_eq!(offsets.cached_next_offset(&p0), Some(2));
    }

    #[tokio::test]
    async fn unknown_partition_is_rejected() {
        let (_, offsets) = manager().await;
        let err = offsets
            .assign_next_offset(&TopicPartition::new("orders", 9))
            .unwrap_err();
        assert!(matches!(err, OffsetError::UnknownPartition(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_assignment_never_repeats_an_offset() {
        let (_, offsets) = manager().await;
        let partition = TopicPartition::new("orders", 0);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let offsets = Arc::clone(&offsets);
            let partition = partition.clone();
            handles.push(tokio::spawn(async move {
                (0..250)
                    .map(|_| offsets.assign_next_offset(&partition).unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for offset in handle.await.unwrap() {
                assert!(seen.insert(offset), "offset {offset} assigned twice");
            }
        }
        assert_eq!(seen.len(), 2000);
        assert!(seen.iter().all(|&o| o < 2000));
    }

    #[tokio::test]
    async fn rebuild_raises_cache_and_persists() {
        let (db, offsets) = manager().await;
        write_event(&db, 0, 0).await;
        write_event(&db, 0, 1).await;
        write_event(&db, 0, 2).await;

        let partitions = offsets.partitions();
        let raised = offsets.rebuild_from_log(&partitions).await.unwrap();
        assert_eq!(
            raised,
            vec![OffsetRaise {
                partition: TopicPartition::new("orders", 0),
                from: 0,
                to: 3,
            }]
        );
        assert_eq!(
            offsets.cached_next_offset(&TopicPartition::new("orders", 0)),
            Some(3)
        );
        assert_eq!(persisted_offset(&db, 0).await, 3);

        // Second pass is a no-op.
        assert!(offsets.rebuild_from_log(&partitions).await.unwrap().is_empty());
        assert_eq!(persisted_offset(&db, 0).await, 3);
    }

    #[tokio::test]
    async fn rebuild_rejects_a_log_at_the_end_of_the_offset_space() {
        let (db, offsets) = manager().await;
        write_event(&db, 1, u64::MAX).await;

        let err = offsets
            .rebuild_from_log(&offsets.partitions())
            .await
            .unwrap_err();
        assert!(matches!(err, OffsetError::Exhausted(p) if p == TopicPartition::new("orders", 1)));
        assert_eq!(
            offsets.cached_next_offset(&TopicPartition::new("orders", 1)),
            Some(0)
        );
    }

    #[test]
    fn exhausted_counter_stops_assigning() {
        let counter = PartitionCounter::new(u64::MAX);
        assert_eq!(counter.take(), None);
        assert_eq!(counter.peek(), u64::MAX);
    }

    #[tokio::test]
    async fn rebuild_never_lowers_the_cache() {
        let (db, offsets) = manager().await;
        let p0 = TopicPartition::new("orders", 0);
        for _ in 0..5 {
            offsets.assign_next_offset(&p0).unwrap();
        }
        write_event(&db, 0, 1).await;

        let raised = offsets.rebuild_from_log(&offsets.partitions()).await.unwrap();
        assert!(raised.is_empty());
        assert_eq!(offsets.cached_next_offset(&p0), Some(5));
    }

    #[tokio::test]
    async fn load_restores_persisted_offsets() {
        let (db, offsets) = manager().await;
        let p1 = TopicPartition::new("orders", 1);
        for _ in 0..4 {
            offsets.assign_next_offset(&p1).unwrap();
        }
        assert_eq!(offsets.checkpoint().await.unwrap(), 1);
        assert_eq!(persisted_offset(&db, 1).await, 4);

        let restarted = OffsetManager::new(db.clone());
        let loaded = restarted.load().await.unwrap();
        assert_eq!(
            loaded,
            vec![TopicPartition::new("orders", 0), p1.clone()]
        );
        assert_eq!(restarted.cached_next_offset(&p1), Some(4));
    }

    #[tokio::test]
    async fn checkpoint_is_raise_only() {
        let (db, offsets) = manager().await;
        assert_eq!(offsets.checkpoint().await.unwrap(), 0);

        offsets
            .assign_next_offset(&TopicPartition::new("orders", 0))
            .unwrap();
        assert_eq!(offsets.checkpoint().await.unwrap(), 1);
        assert_eq!(offsets.checkpoint().await.unwrap(), 0);
        assert_eq!(persisted_offset(&db, 0).await, 1);
    }

    #[tokio::test]
    async fn unseen_group_starts_at_zero() {
        let (_, offsets) = manager().await;
        let position = offsets
            .get_group_position("g1", &TopicPartition::new("orders", 0))
            .await
            .unwrap();
        assert_eq!(position, GroupPosition::default());
        assert_eq!(position.committed, 0);
        assert_eq!(position.uncommitted, None);
    }

    #[tokio::test]
    async fn commit_promotes_and_clears_uncommitted() {
        let (_, offsets) = manager().await;
        let partition = TopicPartition::new("orders", 0);

        offsets.advance_uncommitted("g1", &partition, 3).await.unwrap();
        assert_eq!(
            offsets.get_group_position("g1", &partition).await.unwrap(),
            GroupPosition {
                committed: 0,
                uncommitted: Some(3),
            }
        );

        assert_eq!(offsets.commit("g1", &partition).await.unwrap(), Some(3));
        assert_eq!(
            offsets.get_group_position("g1", &partition).await.unwrap(),
            GroupPosition {
                committed: 3,
                uncommitted: None,
            }
        );

        // Nothing pending: commit is a no-op.
        assert_eq!(offsets.commit("g1", &partition).await.unwrap(), None);
        assert_eq!(
            offsets
                .get_group_position("g1", &partition)
                .await
                .unwrap()
                .committed,
            3
        );
    }

    #[tokio::test]
    async fn groups_are_tracked_independently() {
        let (_, offsets) = manager().await;
        let partition = TopicPartition::new("orders", 0);

        offsets.advance_uncommitted("g1", &partition, 2).await.unwrap();
        offsets.commit("g1", &partition).await.unwrap();

        let other = offsets.get_group_position("g2", &partition).await.unwrap();
        assert_eq!(other, GroupPosition::default());
    }
}
