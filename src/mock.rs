//! Scriptable in-memory coordinator client and broker.
//!
//! Used by the crate's own tests and by applications that want to exercise offset
//! tracking without a cluster.

use crate::{
    client::{CoordinatorClient, OffsetBroker},
    config::OffsetManagerConfig,
    error::{OffsetError, Result},
    protocol::{
        ErrorCode, OffsetCommitRequest, OffsetCommitResponse, OffsetFetchBlock,
        OffsetFetchRequest, OffsetFetchResponse,
    },
    types::{BrokerId, Offset, PartitionId, TopicPartition},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// In-memory broker that stores committed offsets and can be told to misbehave.
#[derive(Debug)]
pub struct MockBroker {
    id: BrokerId,
    offsets: Mutex<HashMap<TopicPartition, OffsetFetchBlock>>,
    omitted_fetches: Mutex<HashSet<TopicPartition>>,
    commit_errors: Mutex<HashMap<TopicPartition, ErrorCode>>,
    omitted_commits: Mutex<HashSet<TopicPartition>>,
    commits: Mutex<Vec<OffsetCommitRequest>>,
    fail_commits: AtomicBool,
    fail_fetches: AtomicBool,
    fetch_count: AtomicUsize,
    closed: AtomicBool,
}

impl MockBroker {
    pub fn new(id: BrokerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            offsets: Mutex::new(HashMap::new()),
            omitted_fetches: Mutex::new(HashSet::new()),
            commit_errors: Mutex::new(HashMap::new()),
            omitted_commits: Mutex::new(HashSet::new()),
            commits: Mutex::new(Vec::new()),
            fail_commits: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
            fetch_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Seed the committed offset returned by the next fetch
    pub fn set_committed(&self, topic: &str, partition: PartitionId, offset: Offset, metadata: &str) {
        self.offsets.lock().insert(
            TopicPartition::new(topic, partition),
            OffsetFetchBlock {
                offset,
                metadata: metadata.to_string(),
                error: ErrorCode::NoError,
            },
        );
    }

    /// Make fetches for this partition return `code`
    pub fn set_fetch_error(&self, topic: &str, partition: PartitionId, code: ErrorCode) {
        self.offsets.lock().insert(
            TopicPartition::new(topic, partition),
            OffsetFetchBlock {
                offset: -1,
                metadata: String::new(),
                error: code,
            },
        );
    }

    /// Leave this partition out of fetch responses
    pub fn omit_from_fetch(&self, topic: &str, partition: PartitionId) {
        self.omitted_fetches.lock().insert(TopicPartition::new(topic, partition));
    }

    /// Make commits for this partition report `code` until cleared
    pub fn set_commit_error(&self, topic: &str, partition: PartitionId, code: ErrorCode) {
        self.commit_errors.lock().insert(TopicPartition::new(topic, partition), code);
    }

    pub fn clear_commit_error(&self, topic: &str, partition: PartitionId) {
        self.commit_errors.lock().remove(&TopicPartition::new(topic, partition));
    }

    /// Leave this partition out of commit responses
    pub fn omit_from_commit(&self, topic: &str, partition: PartitionId) {
        self.omitted_commits.lock().insert(TopicPartition::new(topic, partition));
    }

    /// Fail every commit at the transport level
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Fail every fetch at the transport level
    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Commit requests received so far, oldest first
    pub fn commits(&self) -> Vec<OffsetCommitRequest> {
        self.commits.lock().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().len()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Most recently committed offset for a partition, if any
    pub fn last_committed(&self, topic: &str, partition: PartitionId) -> Option<Offset> {
        self.commits
            .lock()
            .iter()
            .rev()
            .find_map(|request| request.block(topic, partition).map(|b| b.offset))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OffsetBroker for MockBroker {
    fn id(&self) -> BrokerId {
        self.id
    }

    async fn fetch_offset(&self, request: OffsetFetchRequest) -> Result<OffsetFetchResponse> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() || self.fail_fetches.load(Ordering::SeqCst) {
            return Err(OffsetError::Transport(format!("broker {} unreachable", self.id)));
        }

        let offsets = self.offsets.lock();
        let omitted = self.omitted_fetches.lock();
        let mut response = OffsetFetchResponse::default();
        for (topic, partitions) in &request.partitions {
            for &partition in partitions {
                let key = TopicPartition::new(topic.clone(), partition);
                if omitted.contains(&key) {
                    continue;
                }
                let block = offsets.get(&key).cloned().unwrap_or(OffsetFetchBlock {
                    offset: -1,
                    metadata: String::new(),
                    error: ErrorCode::NoError,
                });
                response.add_block(topic, partition, block);
            }
        }
        Ok(response)
    }

    async fn commit_offset(&self, request: OffsetCommitRequest) -> Result<OffsetCommitResponse> {
        if self.is_closed() || self.fail_commits.load(Ordering::SeqCst) {
            return Err(OffsetError::Transport(format!("broker {} connection reset", self.id)));
        }

        let mut response = OffsetCommitResponse::default();
        {
            let errors = self.commit_errors.lock();
            let omitted = self.omitted_commits.lock();
            let mut offsets = self.offsets.lock();
            for (topic, blocks) in &request.blocks {
                for (&partition, block) in blocks {
                    let key = TopicPartition::new(topic.clone(), partition);
                    if omitted.contains(&key) {
                        continue;
                    }
                    let code = errors.get(&key).copied().unwrap_or(ErrorCode::NoError);
                    if code == ErrorCode::NoError {
                        offsets.insert(
                            key,
                            OffsetFetchBlock {
                                offset: block.offset,
                                metadata: block.metadata.clone(),
                                error: ErrorCode::NoError,
                            },
                        );
                    }
                    response.add_error(topic, partition, code);
                }
            }
        }

        debug!(broker = self.id, partitions = request.len(), "Mock broker accepted commit");
        self.commits.lock().push(request);
        Ok(response)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Coordinator client whose answer can be changed at runtime.
pub struct MockCoordinatorClient {
    config: OffsetManagerConfig,
    coordinator: Mutex<Option<Arc<MockBroker>>>,
    closed: AtomicBool,
    refresh_failures: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl MockCoordinatorClient {
    pub fn new(config: OffsetManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            coordinator: Mutex::new(None),
            closed: AtomicBool::new(false),
            refresh_failures: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        })
    }

    pub fn with_coordinator(config: OffsetManagerConfig, broker: Arc<MockBroker>) -> Arc<Self> {
        let client = Self::new(config);
        client.set_coordinator(broker);
        client
    }

    pub fn set_coordinator(&self, broker: Arc<MockBroker>) {
        *self.coordinator.lock() = Some(broker);
    }

    pub fn clear_coordinator(&self) {
        *self.coordinator.lock() = None;
    }

    /// Fail the next `count` refresh calls
    pub fn fail_next_refreshes(&self, count: usize) {
        self.refresh_failures.store(count, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinatorClient for MockCoordinatorClient {
    async fn refresh_coordinator(&self, group: &str) -> Result<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(OffsetError::ClosedClient);
        }

        let remaining = self.refresh_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.refresh_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(OffsetError::Coordinator(format!(
                "coordinator for group {} not available",
                group
            )));
        }
        Ok(())
    }

    async fn coordinator(&self, group: &str) -> Result<Arc<dyn OffsetBroker>> {
        match self.coordinator.lock().clone() {
            Some(broker) => Ok(broker as Arc<dyn OffsetBroker>),
            None => Err(OffsetError::Coordinator(format!(
                "no coordinator known for group {}",
                group
            ))),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn config(&self) -> &OffsetManagerConfig {
        &self.config
    }
}
