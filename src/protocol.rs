//! Offset fetch/commit request and response messages.
//!
//! These are the logical shapes exchanged with the coordinator broker. Encoding them
//! on the wire is the transport's job; this crate only builds and inspects them.

use crate::types::{Offset, PartitionId, TopicName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Numeric error codes a broker attaches to per-partition results.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[error("No error")]
    NoError,
    #[error("An unexpected server error occurred")]
    Unknown,
    #[error("The requested offset is outside the range of offsets maintained by the server")]
    OffsetOutOfRange,
    #[error("This server does not host this topic-partition")]
    UnknownTopicOrPartition,
    #[error("There is no leader for this topic-partition as we are in the middle of a leadership election")]
    LeaderNotAvailable,
    #[error("This server is not the leader for that topic-partition")]
    NotLeaderForPartition,
    #[error("The request timed out")]
    RequestTimedOut,
    #[error("The metadata field of the offset request was too large")]
    OffsetMetadataTooLarge,
    #[error("The broker is still loading offsets after a leader change for that offset's topic partition")]
    OffsetsLoadInProgress,
    #[error("The offset's topic has not yet been created")]
    ConsumerCoordinatorNotAvailable,
    #[error("The broker is not the coordinator for this consumer group")]
    NotCoordinatorForConsumer,
    #[error("The generation id provided is not the current generation")]
    IllegalGeneration,
    #[error("The member id is not in the current generation")]
    UnknownMemberId,
    #[error("The client is not authorized to access this group")]
    GroupAuthorizationFailed,
}

impl ErrorCode {
    /// Map a numeric code to its variant. Codes this crate does not know map to `Unknown`.
    pub fn from_code(code: i16) -> Self {
        match code {
            0 => ErrorCode::NoError,
            1 => ErrorCode::OffsetOutOfRange,
            3 => ErrorCode::UnknownTopicOrPartition,
            5 => ErrorCode::LeaderNotAvailable,
            6 => ErrorCode::NotLeaderForPartition,
            7 => ErrorCode::RequestTimedOut,
            12 => ErrorCode::OffsetMetadataTooLarge,
            14 => ErrorCode::OffsetsLoadInProgress,
            15 => ErrorCode::ConsumerCoordinatorNotAvailable,
            16 => ErrorCode::NotCoordinatorForConsumer,
            22 => ErrorCode::IllegalGeneration,
            25 => ErrorCode::UnknownMemberId,
            30 => ErrorCode::GroupAuthorizationFailed,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn code(&self) -> i16 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::Unknown => -1,
            ErrorCode::OffsetOutOfRange => 1,
            ErrorCode::UnknownTopicOrPartition => 3,
            ErrorCode::LeaderNotAvailable => 5,
            ErrorCode::NotLeaderForPartition => 6,
            ErrorCode::RequestTimedOut => 7,
            ErrorCode::OffsetMetadataTooLarge => 12,
            ErrorCode::OffsetsLoadInProgress => 14,
            ErrorCode::ConsumerCoordinatorNotAvailable => 15,
            ErrorCode::NotCoordinatorForConsumer => 16,
            ErrorCode::IllegalGeneration => 22,
            ErrorCode::UnknownMemberId => 25,
            ErrorCode::GroupAuthorizationFailed => 30,
        }
    }

    /// Codes meaning the partition's offsets now live on another broker.
    /// These heal by re-resolving the coordinator and are never surfaced to callers.
    pub fn is_coordinator_moved(&self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownTopicOrPartition
                | ErrorCode::NotLeaderForPartition
                | ErrorCode::LeaderNotAvailable
        )
    }

    pub fn is_retriable(&self) -> bool {
        self.is_coordinator_moved()
            || matches!(
                self,
                ErrorCode::RequestTimedOut
                    | ErrorCode::OffsetsLoadInProgress
                    | ErrorCode::ConsumerCoordinatorNotAvailable
                    | ErrorCode::NotCoordinatorForConsumer
            )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetFetchRequest {
    pub version: i16,
    pub group: String,
    pub partitions: HashMap<TopicName, Vec<PartitionId>>,
}

impl OffsetFetchRequest {
    pub fn new(version: i16, group: impl Into<String>) -> Self {
        Self {
            version,
            group: group.into(),
            partitions: HashMap::new(),
        }
    }

    pub fn add_partition(&mut self, topic: &str, partition: PartitionId) {
        self.partitions
            .entry(topic.to_string())
            .or_default()
            .push(partition);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetFetchBlock {
    pub offset: Offset,
    pub metadata: String,
    pub error: ErrorCode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OffsetFetchResponse {
    pub blocks: HashMap<TopicName, HashMap<PartitionId, OffsetFetchBlock>>,
}

impl OffsetFetchResponse {
    pub fn block(&self, topic: &str, partition: PartitionId) -> Option<&OffsetFetchBlock> {
        self.blocks.get(topic)?.get(&partition)
    }

    pub fn add_block(&mut self, topic: &str, partition: PartitionId, block: OffsetFetchBlock) {
        self.blocks
            .entry(topic.to_string())
            .or_default()
            .insert(partition, block);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetCommitBlock {
    pub offset: Offset,
    pub timestamp: i64,
    pub metadata: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetCommitRequest {
    pub version: i16,
    pub group: String,
    pub blocks: HashMap<TopicName, HashMap<PartitionId, OffsetCommitBlock>>,
}

impl OffsetCommitRequest {
    pub fn new(version: i16, group: impl Into<String>) -> Self {
        Self {
            version,
            group: group.into(),
            blocks: HashMap::new(),
        }
    }

    pub fn add_block(
        &mut self,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
        timestamp: i64,
        metadata: String,
    ) {
        self.blocks.entry(topic.to_string()).or_default().insert(
            partition,
            OffsetCommitBlock {
                offset,
                timestamp,
                metadata,
            },
        );
    }

    pub fn block(&self, topic: &str, partition: PartitionId) -> Option<&OffsetCommitBlock> {
        self.blocks.get(topic)?.get(&partition)
    }

    /// Number of partition blocks across all topics
    pub fn len(&self) -> usize {
        self.blocks.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OffsetCommitResponse {
    pub errors: HashMap<TopicName, HashMap<PartitionId, ErrorCode>>,
}

impl OffsetCommitResponse {
    pub fn add_error(&mut self, topic: &str, partition: PartitionId, code: ErrorCode) {
        self.errors
            .entry(topic.to_string())
            .or_default()
            .insert(partition, code);
    }
}
