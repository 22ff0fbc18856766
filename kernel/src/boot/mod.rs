// Bootstrap & Reconciliation
//
// Runs once, before the broker accepts traffic:
// 1. provision the system collections,
// 2. load persisted topic offsets into the cache,
// 3. raise the cache wherever a topic's log is ahead of it,
// 4. report topic collections left without offsets by an interrupted
//    create; creating the topic again finishes them.
//
// Every failure here is fatal to the process.

use tracing::{info, warn};

use crate::offset::{
    OffsetError, OffsetManager, OffsetRaise, TopicPartition, CONSUMER_GROUP_OFFSETS,
    TOPIC_OFFSETS,
};
use crate::store::{CollectionOptions, Database, IndexSpec, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("provisioning `{collection}` failed: {source}")]
    Provisioning {
        collection: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("offset recovery failed: {0}")]
    Offsets(#[from] OffsetError),
}

/// What bootstrap found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootReport {
    pub partitions: Vec<TopicPartition>,
    pub raised: Vec<OffsetRaise>,
    /// Topic collections with no offset records. Not served until created again.
    pub unseeded: Vec<String>,
}

/// Create `topicOffsets` and `consumerGroupOffsets` if they are missing.
pub async fn provision_system_collections(db: &Database) -> Result<(), BootError> {
    let existing = db.list_collection_names().await?;
    let wanted = [
        (TOPIC_OFFSETS, vec!["topic", "partition"]),
        (
            CONSUMER_GROUP_OFFSETS,
            vec!["consumerGroup", "topic", "partition"],
        ),
    ];

    for (collection, fields) in wanted {
        if existing.iter().any(|name| name == collection) {
            continue;
        }
        let options = CollectionOptions::Indexed(IndexSpec::unique(fields));
        match db.create_collection(collection, options).await {
            Ok(()) | Err(StoreError::CollectionExists(_)) => {
                info!(collection, "provisioned system collection");
            }
            Err(source) => return Err(BootError::Provisioning { collection, source }),
        }
    }
    Ok(())
}

/// Bring the offset cache in line with the durable state.
pub async fn bootstrap(db: &Database, offsets: &OffsetManager) -> Result<BootReport, BootError> {
    provision_system_collections(db).await?;

    let partitions = offsets.load().await?;
    let raised = offsets.rebuild_from_log(&partitions).await?;

    let mut unseeded: Vec<String> = db
        .list_collection_names()
        .await?
        .into_iter()
        .filter(|name| name != TOPIC_OFFSETS && name != CONSUMER_GROUP_OFFSETS)
        .filter(|name| !partitions.iter().any(|p| &p.topic == name))
        .collect();
    unseeded.sort();
    for topic in &unseeded {
        warn!(topic = %topic, "topic collection has no offsets, create it again to finish");
    }

    info!(
        partitions = partitions.len(),
        raised = raised.len(),
        "offset cache reconciled with log"
    );
    Ok(BootReport {
        partitions,
        raised,
        unseeded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Filter, InMemoryStore};
    use crate::topic::ORDERING_INDEX;
    use crate::topic::{Topic, TopicRegistry};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn database() -> Database {
        Database::new(Arc::new(InMemoryStore::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let db = database();
        provision_system_collections(&db).await.unwrap();
        provision_system_collections(&db).await.unwrap();

        let mut names = db.list_collection_names().await.unwrap();
        names.sort();
        assert_eq!(names, vec![CONSUMER_GROUP_OFFSETS, TOPIC_OFFSETS]);
    }

    #[tokio::test]
    async fn fresh_store_boots_empty() {
        let db = database();
        let offsets = OffsetManager::new(db.clone());

        let report = bootstrap(&db, &offsets).await.unwrap();
        assert_eq!(report, BootReport::default());
    }

    #[tokio::test]
    async fn restart_recovers_offsets_lost_with_the_cache() {
        let db = database();
        provision_system_collections(&db).await.unwrap();
        let before_crash = Arc::new(OffsetManager::new(db.clone()));
        TopicRegistry::new(db.clone(), Arc::clone(&before_crash))
            .create(&Topic::new("orders", 2))
            .await
            .unwrap();

        // Two events reach the log; the cache dies with the process.
        for offset in 0..2u64 {
            let document = match json!({ "_id": format!("e{offset}"), "partition": 1, "offset": offset }) {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            };
            db.insert_one("orders", document).await.unwrap();
        }
        drop(before_crash);

        let offsets = OffsetManager::new(db.clone());
        let report = bootstrap(&db, &offsets).await.unwrap();

        let p1 = TopicPartition::new("orders", 1);
        assert_eq!(report.partitions.len(), 2);
        assert_eq!(
            report.raised,
            vec![OffsetRaise {
                partition: p1.clone(),
                from: 0,
                to: 2,
            }]
        );
        assert_eq!(offsets.cached_next_offset(&p1), Some(2));
        assert_eq!(offsets.assign_next_offset(&p1).unwrap(), 2);

        let persisted = db
            .find_one(
                TOPIC_OFFSETS,
                &Filter::new().eq("topic", "orders").eq("partition", 1),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted["offset"], json!(2));
    }

    #[tokio::test]
    async fn collections_without_offsets_are_reported() {
        let db = database();
        provision_system_collections(&db).await.unwrap();
        let seeded = Arc::new(OffsetManager::new(db.clone()));
        TopicRegistry::new(db.clone(), Arc::clone(&seeded))
            .create(&Topic::new("orders", 1))
            .await
            .unwrap();
        db.create_collection(
            "payments",
            CollectionOptions::Indexed(IndexSpec::unique(ORDERING_INDEX)),
        )
        .await
        .unwrap();

        let offsets = Arc::new(OffsetManager::new(db.clone()));
        let report = bootstrap(&db, &offsets).await.unwrap();
        assert_eq!(report.unseeded, vec!["payments".to_string()]);
        assert!(!offsets.knows(&TopicPartition::new("payments", 0)));

        TopicRegistry::new(db.clone(), Arc::clone(&offsets))
            .create(&Topic::new("payments", 2))
            .await
            .unwrap();
        let report = bootstrap(&db, &OffsetManager::new(db.clone())).await.unwrap();
        assert!(report.unseeded.is_empty());
        assert_eq!(report.partitions.len(), 3);
    }
}
