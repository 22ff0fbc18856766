// Broker
//
// Context handle wiring the store, topic registry, offset manager and
// event log together, plus the four operations offered to a front end:
// create-topic, notify (produce), poll and commit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::boot::{bootstrap, BootError, BootReport};
use crate::config::BrokerConfig;
use crate::log::{Event, EventLog, LogError, NewEvent};
use crate::offset::{GroupPosition, Offset, OffsetError, OffsetManager, TopicPartition};
use crate::store::{Database, DocumentStore, StoreError};
use crate::topic::{Partition, Topic, TopicError, TopicRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Request {
    CreateTopic {
        name: String,
        partitions: Partition,
    },
    Notify(NewEvent),
    Poll {
        consumer_group: String,
        topic: String,
        partition: Partition,
    },
    Commit {
        consumer_group: String,
        topic: String,
        partition: Partition,
    },
}

impl Request {
    pub fn parse(raw: &str) -> Result<Self, BrokerError> {
        serde_json::from_str(raw).map_err(|e| BrokerError::Malformed(e.to_string()))
    }

    pub fn from_value(raw: Value) -> Result<Self, BrokerError> {
        serde_json::from_value(raw).map_err(|e| BrokerError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum Response {
    TopicCreated { name: String },
    Produced { offset: Offset },
    Events { events: Vec<Event> },
    Committed { offset: Option<Offset> },
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Offset(#[from] OffsetError),

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Failure as reported to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: String,
    pub message: String,
}

impl BrokerError {
    /// Stable error code for the front end.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Malformed(_) => "malformed_request",
            BrokerError::Invalid(_) | BrokerError::Topic(TopicError::Invalid(_)) => {
                "invalid_request"
            }
            BrokerError::Topic(TopicError::AlreadyExists(_)) => "topic_exists",
            BrokerError::Topic(TopicError::Store(e)) => store_code(e),
            BrokerError::Topic(TopicError::Offsets(e))
            | BrokerError::Offset(e)
            | BrokerError::Log(LogError::Offsets(e)) => offset_code(e),
            BrokerError::Log(LogError::Store(e)) => store_code(e),
            BrokerError::Topic(TopicError::Provisioning { .. })
            | BrokerError::Log(LogError::CorruptEvent(_)) => "store_failure",
        }
    }

    pub fn reply(&self) -> ErrorReply {
        ErrorReply {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

fn offset_code(error: &OffsetError) -> &'static str {
    match error {
        OffsetError::UnknownPartition(_) => "unknown_partition",
        OffsetError::Store(e) => store_code(e),
        OffsetError::Exhausted(_) | OffsetError::CorruptRecord { .. } => "store_failure",
    }
}

fn store_code(error: &StoreError) -> &'static str {
    match error {
        StoreError::Timeout(_) => "store_timeout",
        _ => "store_failure",
    }
}

pub struct Broker {
    config: BrokerConfig,
    topics: TopicRegistry,
    offsets: Arc<OffsetManager>,
    log: EventLog,
}

impl Broker {
    /// Bootstrap against `store` and return a broker ready for traffic.
    ///
    /// Offsets are reconciled with the log before this returns.
    pub async fn start(
        store: Arc<dyn DocumentStore>,
        config: BrokerConfig,
    ) -> Result<(Self, BootReport), BootError> {
        let db = Database::new(store, config.store_timeout());
        let offsets = Arc::new(OffsetManager::new(db.clone()));
        let report = bootstrap(&db, &offsets).await?;

        let broker = Self {
            topics: TopicRegistry::new(db.clone(), Arc::clone(&offsets)),
            log: EventLog::new(db, Arc::clone(&offsets), config.serialize_polls),
            offsets,
            config,
        };
        info!(partitions = report.partitions.len(), "broker ready");
        Ok((broker, report))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn offsets(&self) -> &OffsetManager {
        &self.offsets
    }

    pub async fn handle(&self, request: Request) -> Result<Response, BrokerError> {
        match request {
            Request::CreateTopic { name, partitions } => {
                self.create_topic(Topic::new(name.clone(), partitions)).await?;
                Ok(Response::TopicCreated { name })
            }
            Request::Notify(event) => {
                let offset = self.produce(event).await?;
                Ok(Response::Produced { offset })
            }
            Request::Poll {
                consumer_group,
                topic,
                partition,
            } => {
                let events = self
                    .poll(&consumer_group, &TopicPartition::new(topic, partition))
                    .await?;
                Ok(Response::Events { events })
            }
            Request::Commit {
                consumer_group,
                topic,
                partition,
            } => {
                let offset = self
                    .commit(&consumer_group, &TopicPartition::new(topic, partition))
                    .await?;
                Ok(Response::Committed { offset })
            }
        }
    }

    pub async fn create_topic(&self, topic: Topic) -> Result<(), BrokerError> {
        self.topics.create(&topic).await?;
        Ok(())
    }

    pub async fn produce(&self, event: NewEvent) -> Result<Offset, BrokerError> {
        Ok(self.log.append(event).await?)
    }

    pub async fn poll(
        &self,
        group: &str,
        partition: &TopicPartition,
    ) -> Result<Vec<Event>, BrokerError> {
        self.check_group_target(group, partition)?;
        Ok(self.log.list(group, partition).await?)
    }

    pub async fn commit(
        &self,
        group: &str,
        partition: &TopicPartition,
    ) -> Result<Option<Offset>, BrokerError> {
        self.check_group_target(group, partition)?;
        Ok(self.offsets.commit(group, partition).await?)
    }

    pub async fn group_position(
        &self,
        group: &str,
        partition: &TopicPartition,
    ) -> Result<GroupPosition, BrokerError> {
        self.check_group_target(group, partition)?;
        Ok(self.offsets.get_group_position(group, partition).await?)
    }

    /// Persist cached topic offsets. Call before shutting down.
    pub async fn checkpoint(&self) -> Result<usize, BrokerError> {
        Ok(self.offsets.checkpoint().await?)
    }

    fn check_group_target(
        &self,
        group: &str,
        partition: &TopicPartition,
    ) -> Result<(), BrokerError> {
        if group.trim().is_empty() {
            return Err(BrokerError::Invalid(
                "consumer group must not be empty".into(),
            ));
        }
        if !self.offsets.knows(partition) {
            return Err(OffsetError::UnknownPartition(partition.clone()).into());
        }
        Ok(())
    }
}
