// Topic Registry
//
// Provisions a topic's log collection with its (partition, offset)
// ordering index and seeds one persisted offset record per partition.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::offset::{OffsetError, OffsetManager, CONSUMER_GROUP_OFFSETS, TOPIC_OFFSETS};
use crate::store::{CollectionOptions, Database, IndexSpec, StoreError};

/// Partition number within a topic.
pub type Partition = u8;

/// Fields of the ordering index every topic collection carries.
pub const ORDERING_INDEX: [&str; 2] = ["partition", "offset"];

/// A named, partitioned log. The partition count is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub partitions: Partition,
}

impl Topic {
    pub fn new(name: impl Into<String>, partitions: Partition) -> Self {
        Self {
            name: name.into(),
            partitions,
        }
    }

    pub fn validate(&self) -> Result<(), TopicError> {
        if self.name.trim().is_empty() {
            return Err(TopicError::Invalid("topic name must not be empty".into()));
        }
        if self.name == TOPIC_OFFSETS || self.name == CONSUMER_GROUP_OFFSETS {
            return Err(TopicError::Invalid(format!(
                "`{}` is a reserved collection name",
                self.name
            )));
        }
        if self.partitions == 0 {
            return Err(TopicError::Invalid(
                "partition count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    #[error("invalid topic: {0}")]
    Invalid(String),

    #[error("topic `{0}` already exists")]
    AlreadyExists(String),

    /// Collection creation or offset seeding failed. Creating the topic
    /// again finishes a collection that was left without offsets.
    #[error("provisioning topic `{topic}` failed: {source}")]
    Provisioning {
        topic: String,
        #[source]
        source: StoreError,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("offset seeding failed: {0}")]
    Offsets(#[from] OffsetError),
}

pub struct TopicRegistry {
    db: Database,
    offsets: Arc<OffsetManager>,
}

impl TopicRegistry {
    pub fn new(db: Database, offsets: Arc<OffsetManager>) -> Self {
        Self { db, offsets }
    }

    pub async fn exists(&self, name: &str) -> Result<bool, TopicError> {
        let names = self.db.list_collection_names().await?;
        Ok(names.iter().any(|n| n == name))
    }

    /// Create the topic's collection and seed its partition offsets at 0.
    ///
    /// A collection left without offset records by an earlier failed
    /// creation is finished rather than rejected.
    pub async fn create(&self, topic: &Topic) -> Result<(), TopicError> {
        topic.validate()?;
        if self.exists(&topic.name).await? {
            if self.offsets.seeded_partitions(&topic.name).await? > 0 {
                return Err(TopicError::AlreadyExists(topic.name.clone()));
            }
            warn!(topic = %topic.name, "resuming interrupted topic creation");
        } else {
            let options = CollectionOptions::Indexed(IndexSpec::unique(ORDERING_INDEX));
            match self.db.create_collection(&topic.name, options).await {
                Ok(()) => {}
                Err(StoreError::CollectionExists(name)) => {
                    return Err(TopicError::AlreadyExists(name));
                }
                Err(source) => return Err(provisioning_failed(topic, source)),
            }
        }

        match self.offsets.seed_topic(&topic.name, topic.partitions).await {
            Ok(()) => {}
            Err(OffsetError::Store(source)) => return Err(provisioning_failed(topic, source)),
            Err(e) => return Err(e.into()),
        }

        info!(topic = %topic.name, partitions = topic.partitions, "topic created");
        Ok(())
    }
}

fn provisioning_failed(topic: &Topic, source: StoreError) -> TopicError {
    error!(topic = %topic.name, error = %source, "topic provisioning failed");
    TopicError::Provisioning {
        topic: topic.name.clone(),
        source,
    }
}
