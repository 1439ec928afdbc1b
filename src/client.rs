use crate::{
    config::OffsetManagerConfig,
    error::Result,
    protocol::{OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest, OffsetFetchResponse},
    types::BrokerId,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Cluster client the offset manager uses to locate a group's coordinator.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Ask the cluster which broker currently coordinates `group` and cache the answer
    async fn refresh_coordinator(&self, group: &str) -> Result<()>;

    /// Return a connection to the cached coordinator for `group`
    async fn coordinator(&self, group: &str) -> Result<Arc<dyn OffsetBroker>>;

    fn is_closed(&self) -> bool;

    fn config(&self) -> &OffsetManagerConfig;
}

/// Connection to a single broker able to serve offset requests.
///
/// A broker offset manager owns its broker exclusively; once `close` is called the
/// handle is never used again.
#[async_trait]
pub trait OffsetBroker: Send + Sync {
    fn id(&self) -> BrokerId;

    async fn fetch_offset(&self, request: OffsetFetchRequest) -> Result<OffsetFetchResponse>;

    async fn commit_offset(&self, request: OffsetCommitRequest) -> Result<OffsetCommitResponse>;

    async fn close(&self) -> Result<()>;
}
