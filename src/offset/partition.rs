use crate::{
    backoff::Backoff,
    error::{OffsetError, Result},
    offset::{broker::BrokerOffsetManager, manager::Registry},
    protocol::{ErrorCode, OffsetFetchRequest},
    types::{BrokerId, Offset, PartitionId, PartitionState, TopicPartition},
};
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tracks the committed offset of one topic/partition for a consumer group.
///
/// The offset and metadata set here are picked up by the next periodic flush of the
/// broker offset manager this partition is attached to. You MUST call
/// [`close`](Self::close) (or [`async_close`](Self::async_close)) when done: the
/// background task is not stopped when the handle is dropped.
#[derive(Clone)]
pub struct PartitionOffsetManager {
    inner: Arc<PartitionInner>,
}

/// Stream of errors reported by a partition offset manager.
///
/// Ends once the manager is closed and every buffered error has been read.
pub struct ErrorStream {
    receiver: mpsc::Receiver<OffsetError>,
}

/// Depth-1 rebalance slot: raising while a signal is pending is a no-op.
pub(crate) struct RebalanceSignal {
    tx: mpsc::Sender<()>,
}

struct OffsetState {
    offset: Offset,
    metadata: String,
}

struct Selection {
    state: PartitionState,
    broker: Option<Arc<BrokerOffsetManager>>,
}

pub(crate) struct PartitionInner {
    id: u64,
    topic: String,
    partition: PartitionId,
    registry: Arc<Registry>,
    // Offset/metadata and coordinator selection are locked independently so that
    // setters never wait on a rebalance and flushes never wait on selection.
    offsets: Mutex<OffsetState>,
    selection: Mutex<Selection>,
    errors_tx: Mutex<Option<mpsc::Sender<OffsetError>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<OffsetError>>>,
    rebalance: RebalanceSignal,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RebalanceSignal {
    pub(crate) fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Returns `false` if a signal was already pending or the receiver is gone.
    pub(crate) fn raise(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

impl PartitionInner {
    pub(crate) fn new(
        registry: Arc<Registry>,
        topic: &str,
        partition: PartitionId,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (errors_tx, errors_rx) = mpsc::channel(registry.config.channel_buffer_size);
        let (rebalance, rebalance_rx) = RebalanceSignal::new();

        let inner = Arc::new(Self {
            id: registry.next_partition_id(),
            topic: topic.to_string(),
            partition,
            registry,
            offsets: Mutex::new(OffsetState {
                offset: 0,
                metadata: String::new(),
            }),
            selection: Mutex::new(Selection {
                state: PartitionState::Initializing,
                broker: None,
            }),
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            rebalance,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        });
        (inner, rebalance_rx)
    }

    /// Resolve the coordinator, fetch the committed offset, attach, and spawn the
    /// rebalance loop. Returns once the initial offset is known.
    pub(crate) async fn start(
        registry: Arc<Registry>,
        topic: &str,
        partition: PartitionId,
    ) -> Result<Arc<Self>> {
        let (pom, rebalance_rx) = Self::new(registry, topic, partition);

        let bom = pom.resolve_coordinator().await?;
        if let Err(err) = pom.fetch_initial_offset(&bom).await {
            pom.release_broker();
            return Err(err);
        }

        // Attach only after the fetch so a flush never commits an unset offset
        if let Err(err) = bom.attach(pom.clone()).await {
            pom.handle_error(err);
            pom.trigger_rebalance();
        }
        pom.set_state(PartitionState::Active);

        let task = tokio::spawn(pom.clone().run(rebalance_rx));
        *pom.task.lock() = Some(task);

        debug!(
            topic = %pom.topic,
            partition = pom.partition,
            broker = bom.broker_id(),
            "Partition offset manager started"
        );
        Ok(pom)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn partition(&self) -> PartitionId {
        self.partition
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn state(&self) -> PartitionState {
        self.selection.lock().state
    }

    fn set_state(&self, state: PartitionState) {
        let mut selection = self.selection.lock();
        if !selection.state.is_terminal() {
            selection.state = state;
        }
    }

    /// Consistent (offset, metadata) pair for a commit request
    pub(crate) fn snapshot(&self) -> (Offset, String) {
        let offsets = self.offsets.lock();
        (offsets.offset, offsets.metadata.clone())
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn trigger_rebalance(&self) {
        if self.rebalance.raise() {
            debug!(topic = %self.topic, partition = self.partition, "Rebalance scheduled");
        } else {
            debug!(topic = %self.topic, partition = self.partition, "Rebalance already pending");
        }
    }

    pub(crate) fn handle_error(&self, err: OffsetError) {
        self.registry.metrics.errors_reported.inc();

        if !self.registry.config.return_errors {
            warn!(
                topic = %self.topic,
                partition = self.partition,
                error = %err,
                "Partition offset manager error"
            );
            return;
        }

        let sender = self.errors_tx.lock().clone();
        match sender {
            Some(sender) => match sender.try_send(err) {
                Ok(()) => {}
                Err(TrySendError::Full(err)) => warn!(
                    topic = %self.topic,
                    partition = self.partition,
                    error = %err,
                    "Error channel full, dropping error"
                ),
                Err(TrySendError::Closed(err)) => debug!(
                    topic = %self.topic,
                    partition = self.partition,
                    error = %err,
                    "Error channel closed, dropping error"
                ),
            },
            None => debug!(
                topic = %self.topic,
                partition = self.partition,
                error = %err,
                "Partition offset manager closed, dropping error"
            ),
        }
    }

    async fn run(self: Arc<Self>, mut rebalance_rx: mpsc::Receiver<()>) {
        let mut backoff = Backoff::new(&self.registry.config.retry);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                signal = rebalance_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }

            self.set_state(PartitionState::Resolving);
            self.registry.metrics.rebalances.inc();

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.select_broker() => result,
            };

            match result {
                Ok(broker) => {
                    backoff.reset();
                    self.set_state(PartitionState::Active);
                    info!(
                        topic = %self.topic,
                        partition = self.partition,
                        broker,
                        "Offset coordinator resolved"
                    );
                }
                Err(err) => {
                    warn!(
                        topic = %self.topic,
                        partition = self.partition,
                        attempt = backoff.attempts() + 1,
                        error = %err,
                        "Failed to resolve offset coordinator"
                    );
                    self.handle_error(err);

                    match backoff.next_delay() {
                        Some(delay) => {
                            tokio::select! {
                                _ = self.shutdown.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                            self.trigger_rebalance();
                        }
                        None => {
                            let attempts = backoff.attempts() + 1;
                            error!(
                                topic = %self.topic,
                                partition = self.partition,
                                attempts,
                                "Giving up on offset coordinator resolution"
                            );
                            self.handle_error(OffsetError::RetriesExhausted { attempts });
                            self.selection.lock().state = PartitionState::Failed;
                            break;
                        }
                    }
                }
            }
        }

        self.finish();
    }

    /// Tear down on task exit. The state is made terminal before the registry slot is
    /// freed so a concurrent registration never installs a dead manager.
    fn finish(&self) {
        {
            let mut selection = self.selection.lock();
            if !selection.state.is_terminal() {
                selection.state = PartitionState::Closed;
            }
        }
        self.shutdown.cancel();
        self.release_broker();
        self.registry.remove_partition(&self.topic, self.partition, self.id);
        self.errors_tx.lock().take();

        debug!(topic = %self.topic, partition = self.partition, "Partition offset manager stopped");
    }

    async fn select_broker(self: &Arc<Self>) -> Result<BrokerId> {
        let bom = self.resolve_coordinator().await?;
        bom.attach(self.clone()).await?;
        Ok(bom.broker_id())
    }

    async fn resolve_coordinator(&self) -> Result<Arc<BrokerOffsetManager>> {
        self.release_broker();

        let client = &self.registry.client;
        let group = &self.registry.config.group;
        client.refresh_coordinator(group).await?;
        let broker = client.coordinator(group).await?;

        let bom = self.registry.ref_broker(broker);
        self.selection.lock().broker = Some(bom.clone());
        Ok(bom)
    }

    fn release_broker(&self) {
        let previous = self.selection.lock().broker.take();
        if let Some(bom) = previous {
            bom.detach(self.id);
            self.registry.unref_broker(&bom);
        }
    }

    async fn fetch_initial_offset(&self, bom: &BrokerOffsetManager) -> Result<()> {
        let config = &self.registry.config;
        let mut request = OffsetFetchRequest::new(config.fetch_version, config.group.clone());
        request.add_partition(&self.topic, self.partition);

        let response = bom.broker().fetch_offset(request).await?;
        let block = response
            .block(&self.topic, self.partition)
            .ok_or(OffsetError::IncompleteResponse)?;

        match block.error {
            ErrorCode::NoError => {
                let mut offsets = self.offsets.lock();
                offsets.offset = block.offset;
                offsets.metadata = block.metadata.clone();
                Ok(())
            }
            code => Err(OffsetError::Broker { code }),
        }
    }
}

impl PartitionOffsetManager {
    pub(crate) fn new(inner: Arc<PartitionInner>) -> Self {
        Self { inner }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn partition(&self) -> PartitionId {
        self.inner.partition
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.inner.topic.clone(), self.inner.partition)
    }

    pub fn offset(&self) -> Offset {
        self.inner.offsets.lock().offset
    }

    pub fn set_offset(&self, offset: Offset) {
        self.inner.offsets.lock().offset = offset;
    }

    pub fn metadata(&self) -> String {
        self.inner.offsets.lock().metadata.clone()
    }

    pub fn set_metadata(&self, metadata: impl Into<String>) {
        self.inner.offsets.lock().metadata = metadata.into();
    }

    pub fn state(&self) -> PartitionState {
        self.inner.state()
    }

    /// Broker currently coordinating this partition's offsets
    pub fn coordinator(&self) -> Option<BrokerId> {
        self.inner
            .selection
            .lock()
            .broker
            .as_ref()
            .map(|bom| bom.broker_id())
    }

    /// Take the error stream. Only the first call returns `Some`.
    ///
    /// Errors are only delivered here when `return_errors` is enabled; otherwise they
    /// are logged.
    pub fn errors(&self) -> Option<ErrorStream> {
        self.inner
            .errors_rx
            .lock()
            .take()
            .map(|receiver| ErrorStream { receiver })
    }

    /// Stop the background task without waiting for it.
    pub fn async_close(&self) {
        self.inner.shutdown();
    }

    /// Stop the background task, detach from the coordinator's broker offset manager
    /// and free the registry slot. Errors still buffered (and not taken via
    /// [`errors`](Self::errors)) are returned as [`OffsetError::Errors`].
    pub async fn close(&self) -> Result<()> {
        self.async_close();

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(
                    topic = %self.inner.topic,
                    partition = self.inner.partition,
                    error = %e,
                    "Partition offset manager task failed"
                );
            }
        }
        self.inner.selection.lock().state = PartitionState::Closed;

        let mut pending = Vec::new();
        let receiver = self.inner.errors_rx.lock().take();
        if let Some(mut receiver) = receiver {
            while let Ok(err) = receiver.try_recv() {
                pending.push(err);
            }
        }

        info!(
            topic = %self.inner.topic,
            partition = self.inner.partition,
            "Partition offset manager closed"
        );

        if pending.is_empty() {
            Ok(())
        } else {
            Err(OffsetError::Errors(pending))
        }
    }
}

impl std::fmt::Debug for PartitionOffsetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionOffsetManager")
            .field("topic", &self.inner.topic)
            .field("partition", &self.inner.partition)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl ErrorStream {
    pub async fn recv(&mut self) -> Option<OffsetError> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OffsetError> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for ErrorStream {
    type Item = OffsetError;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::OffsetManagerConfig,
        mock::{MockBroker, MockCoordinatorClient},
        offset::OffsetManager,
    };
    use proptest::prelude::*;

    fn test_registry(return_errors: bool, buffer: usize) -> Arc<Registry> {
        let mut config = OffsetManagerConfig::for_group("test-group");
        config.return_errors = return_errors;
        config.channel_buffer_size = buffer;
        let client = MockCoordinatorClient::new(config);
        OffsetManager::from_client(client).unwrap().registry().clone()
    }

    #[test]
    fn test_rebalance_signal_coalesces() {
        let (signal, mut rx) = RebalanceSignal::new();

        assert!(signal.raise());
        assert!(!signal.raise());
        assert!(!signal.raise());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // Slot is free again once consumed
        assert!(signal.raise());
    }

    #[test]
    fn test_rebalance_signal_after_receiver_dropped() {
        let (signal, rx) = RebalanceSignal::new();
        drop(rx);
        assert!(!signal.raise());
    }

    #[test]
    fn test_new_partition_defaults() {
        let (inner, _rx) = PartitionInner::new(test_registry(false, 4), "orders", 3);
        let pom = PartitionOffsetManager::new(inner);

        assert_eq!(pom.topic(), "orders");
        assert_eq!(pom.partition(), 3);
        assert_eq!(pom.offset(), 0);
        assert_eq!(pom.metadata(), "");
        assert_eq!(pom.state(), PartitionState::Initializing);
        assert_eq!(pom.coordinator(), None);
        assert_eq!(pom.topic_partition(), TopicPartition::new("orders", 3));
    }

    #[test]
    fn test_snapshot_reflects_setters() {
        let (inner, _rx) = PartitionInner::new(test_registry(false, 4), "orders", 0);
        let pom = PartitionOffsetManager::new(inner.clone());

        pom.set_offset(17);
        pom.set_metadata("checkpoint");
        assert_eq!(inner.snapshot(), (17, "checkpoint".to_string()));
    }

    #[test]
    fn test_errors_stream_taken_once() {
        let (inner, _rx) = PartitionInner::new(test_registry(true, 4), "orders", 0);
        let pom = PartitionOffsetManager::new(inner);

        assert!(pom.errors().is_some());
        assert!(pom.errors().is_none());
    }

    #[test]
    fn test_handle_error_respects_return_errors() {
        let (inner, _rx) = PartitionInner::new(test_registry(false, 4), "orders", 0);
        let pom = PartitionOffsetManager::new(inner.clone());
        let mut errors = pom.errors().unwrap();

        inner.handle_error(OffsetError::IncompleteResponse);
        assert!(errors.try_recv().is_none());
        assert_eq!(inner.registry.metrics.errors_reported.get(), 1);

        let (inner, _rx) = PartitionInner::new(test_registry(true, 4), "orders", 0);
        let pom = PartitionOffsetManager::new(inner.clone());
        let mut errors = pom.errors().unwrap();

        inner.handle_error(OffsetError::IncompleteResponse);
        assert_eq!(errors.try_recv(), Some(OffsetError::IncompleteResponse));
    }

    #[test]
    fn test_full_error_channel_drops_instead_of_blocking() {
        let (inner, _rx) = PartitionInner::new(test_registry(true, 2), "orders", 0);
        let pom = PartitionOffsetManager::new(inner.clone());

        for _ in 0..5 {
            inner.handle_error(OffsetError::IncompleteResponse);
        }

        let mut errors = pom.errors().unwrap();
        assert!(errors.try_recv().is_some());
        assert!(errors.try_recv().is_some());
        assert!(errors.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_drains_buffered_errors() {
        let (inner, _rx) = PartitionInner::new(test_registry(true, 4), "orders", 0);
        let pom = PartitionOffsetManager::new(inner.clone());

        inner.handle_error(OffsetError::IncompleteResponse);
        inner.handle_error(OffsetError::Broker { code: ErrorCode::OffsetMetadataTooLarge });

        match pom.close().await {
            Err(OffsetError::Errors(errors)) => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0], OffsetError::IncompleteResponse);
            }
            other => panic!("expected drained errors, got {:?}", other),
        }
        assert!(inner.is_closed());
    }

    #[tokio::test]
    async fn test_fetch_initial_offset_outcomes() {
        let registry = test_registry(false, 4);
        let broker = MockBroker::new(1);
        broker.set_committed("orders", 0, 42, "m");
        broker.omit_from_fetch("orders", 1);
        broker.set_fetch_error("orders", 2, ErrorCode::OffsetsLoadInProgress);

        let bom = registry.ref_broker(broker.clone());

        let (inner, _rx) = PartitionInner::new(registry.clone(), "orders", 0);
        inner.fetch_initial_offset(&bom).await.unwrap();
        assert_eq!(inner.snapshot(), (42, "m".to_string()));

        let (inner, _rx) = PartitionInner::new(registry.clone(), "orders", 1);
        assert_eq!(
            inner.fetch_initial_offset(&bom).await,
            Err(OffsetError::IncompleteResponse)
        );

        let (inner, _rx) = PartitionInner::new(registry.clone(), "orders", 2);
        assert_eq!(
            inner.fetch_initial_offset(&bom).await,
            Err(OffsetError::Broker { code: ErrorCode::OffsetsLoadInProgress })
        );

        registry.unref_broker(&bom);
    }

    proptest! {
        #[test]
        fn set_offset_then_offset_returns_value(values in proptest::collection::vec(any::<i64>(), 1..32)) {
            let (inner, _rx) = PartitionInner::new(test_registry(false, 4), "orders", 0);
            let pom = PartitionOffsetManager::new(inner.clone());
            for value in &values {
                pom.set_offset(*value);
                prop_assert_eq!(pom.offset(), *value);
            }
            prop_assert_eq!(inner.snapshot().0, *values.last().unwrap());
        }
    }
}
