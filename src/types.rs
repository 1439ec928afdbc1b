use serde::{Deserialize, Serialize};
use std::fmt;

pub type BrokerId = i32;
pub type TopicName = String;
pub type PartitionId = i32;
pub type Offset = i64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: TopicName,
    pub partition: PartitionId,
}

impl TopicPartition {
    pub fn new(topic: impl Into<TopicName>, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// Lifecycle of a partition offset manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionState {
    /// Coordinator resolution and initial fetch in progress
    Initializing,
    /// Attached to a broker offset manager
    Active,
    /// Re-resolving the coordinator after a rebalance signal
    Resolving,
    /// Coordinator resolution retry budget exhausted
    Failed,
    /// Closed by the caller
    Closed,
}

impl PartitionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PartitionState::Failed | PartitionState::Closed)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Initializing => "initializing",
            PartitionState::Active => "active",
            PartitionState::Resolving => "resolving",
            PartitionState::Failed => "failed",
            PartitionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
