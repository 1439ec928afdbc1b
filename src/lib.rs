//! Consumer-group offset tracking.
//!
//! An [`OffsetManager`] hands out one [`PartitionOffsetManager`] per topic/partition.
//! Offsets set on those handles are committed in periodic batches, one batch per
//! coordinating broker, and partitions follow the group coordinator when it moves.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mock;
pub mod offset;
pub mod protocol;
pub mod types;

pub use client::{CoordinatorClient, OffsetBroker};
pub use config::{OffsetManagerConfig, RetryConfig};
pub use error::{OffsetError, Result};
pub use offset::{ErrorStream, OffsetManager, PartitionOffsetManager};
pub use types::{BrokerId, Offset, PartitionId, PartitionState, TopicPartition};
