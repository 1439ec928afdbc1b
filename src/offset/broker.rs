use crate::{
    client::OffsetBroker,
    error::{OffsetError, Result},
    metrics::OffsetMetrics,
    offset::{manager::Registry, partition::PartitionInner},
    protocol::{ErrorCode, OffsetCommitRequest, OffsetCommitResponse},
    types::BrokerId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub(crate) enum BrokerCommand {
    Attach(Arc<PartitionInner>),
    Detach(u64),
}

/// Batches the offsets of every partition coordinated by one broker into a single
/// periodic commit, and routes the per-partition results back.
pub(crate) struct BrokerOffsetManager {
    broker_id: BrokerId,
    broker: Arc<dyn OffsetBroker>,
    registry: Weak<Registry>,
    group: String,
    commit_version: i16,
    commit_interval: Duration,
    metrics: Arc<OffsetMetrics>,
    commands: mpsc::Sender<BrokerCommand>,
    // Only modified while holding the registry lock
    refs: AtomicUsize,
    shutdown: CancellationToken,
}

type Subscriptions = HashMap<u64, Arc<PartitionInner>>;

impl BrokerOffsetManager {
    pub(crate) fn spawn(registry: &Arc<Registry>, broker: Arc<dyn OffsetBroker>) -> Arc<Self> {
        let (bom, commands) = Self::new(registry, broker);
        tokio::spawn(bom.clone().run(commands));
        bom
    }

    pub(crate) fn new(
        registry: &Arc<Registry>,
        broker: Arc<dyn OffsetBroker>,
    ) -> (Arc<Self>, mpsc::Receiver<BrokerCommand>) {
        // Depth 1: an attaching partition waits until the loop takes it
        let (commands, receiver) = mpsc::channel(1);
        let bom = Arc::new(Self {
            broker_id: broker.id(),
            broker,
            registry: Arc::downgrade(registry),
            group: registry.config.group.clone(),
            commit_version: registry.config.commit_version,
            commit_interval: registry.config.commit_interval(),
            metrics: registry.metrics.clone(),
            commands,
            refs: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });
        (bom, receiver)
    }

    pub(crate) fn broker_id(&self) -> BrokerId {
        self.broker_id
    }

    pub(crate) fn broker(&self) -> &Arc<dyn OffsetBroker> {
        &self.broker
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire(&self) -> usize {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn release(&self) -> usize {
        let previous = self.refs.fetch_sub(1, Ordering::SeqCst);
        previous.saturating_sub(1)
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Hand a partition to the broker loop. Waits until the loop accepts it.
    pub(crate) async fn attach(&self, pom: Arc<PartitionInner>) -> Result<()> {
        self.commands
            .send(BrokerCommand::Attach(pom))
            .await
            .map_err(|_| OffsetError::BrokerClosed {
                broker: self.broker_id,
            })
    }

    pub(crate) fn detach(&self, id: u64) {
        // Best effort: closed partitions are also pruned at the next flush
        let _ = self.commands.try_send(BrokerCommand::Detach(id));
    }

    async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<BrokerCommand>) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.commit_interval, self.commit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut subscriptions = Subscriptions::new();

        info!(broker = self.broker_id, group = %self.group, "Broker offset manager started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    commands.close();
                    while let Ok(command) = commands.try_recv() {
                        if let BrokerCommand::Attach(pom) = command {
                            pom.trigger_rebalance();
                        }
                    }
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.flush(&mut subscriptions).await {
                        self.abort(err, subscriptions, commands).await;
                        return;
                    }
                }
                command = commands.recv() => match command {
                    Some(BrokerCommand::Attach(pom)) => {
                        debug!(
                            broker = self.broker_id,
                            topic = pom.topic(),
                            partition = pom.partition(),
                            "Partition attached"
                        );
                        subscriptions.insert(pom.id(), pom);
                    }
                    Some(BrokerCommand::Detach(id)) => {
                        subscriptions.remove(&id);
                    }
                    None => break,
                },
            }
        }

        info!(broker = self.broker_id, "Broker offset manager stopped");
    }

    /// One batched commit round trip for every attached partition.
    ///
    /// Returns an error only for a transport-level failure of the whole request;
    /// per-partition failures are routed to the affected partitions.
    async fn flush(&self, subscriptions: &mut Subscriptions) -> Result<()> {
        subscriptions.retain(|_, pom| !pom.is_closed());
        if subscriptions.is_empty() {
            return Ok(());
        }

        let request = self.construct_request(subscriptions);
        let partitions = request.len();
        let started = Instant::now();

        let response = match self.broker.commit_offset(request).await {
            Ok(response) => response,
            Err(err) => {
                self.metrics.commit_failures.inc();
                return Err(err);
            }
        };

        self.metrics.commits_sent.inc();
        self.metrics
            .commit_latency
            .observe(started.elapsed().as_secs_f64());

        subscriptions.retain(|_, pom| self.handle_commit_result(pom, &response));

        debug!(
            broker = self.broker_id,
            partitions,
            remaining = subscriptions.len(),
            "Flushed offsets"
        );
        Ok(())
    }

    fn construct_request(&self, subscriptions: &Subscriptions) -> OffsetCommitRequest {
        let mut request = OffsetCommitRequest::new(self.commit_version, self.group.clone());
        let timestamp = chrono::Utc::now().timestamp_millis();
        for pom in subscriptions.values() {
            let (offset, metadata) = pom.snapshot();
            request.add_block(pom.topic(), pom.partition(), offset, timestamp, metadata);
        }
        request
    }

    /// Returns whether the partition stays subscribed.
    fn handle_commit_result(&self, pom: &PartitionInner, response: &OffsetCommitResponse) -> bool {
        let code = match response
            .errors
            .get(pom.topic())
            .and_then(|partitions| partitions.get(&pom.partition()))
        {
            Some(code) => *code,
            None => {
                pom.handle_error(OffsetError::IncompleteResponse);
                pom.trigger_rebalance();
                return false;
            }
        };

        match code {
            ErrorCode::NoError => {
                self.metrics.partitions_committed.inc();
                true
            }
            code if code.is_coordinator_moved() => {
                debug!(
                    broker = self.broker_id,
                    topic = pom.topic(),
                    partition = pom.partition(),
                    error = %code,
                    "Coordinator moved"
                );
                pom.trigger_rebalance();
                false
            }
            code => {
                pom.handle_error(OffsetError::Broker { code });
                pom.trigger_rebalance();
                false
            }
        }
    }

    /// Fatal commit failure: leave the registry, close the connection and send every
    /// subscribed or pending partition off to find a new coordinator.
    async fn abort(
        self: &Arc<Self>,
        err: OffsetError,
        subscriptions: Subscriptions,
        mut commands: mpsc::Receiver<BrokerCommand>,
    ) {
        error!(
            broker = self.broker_id,
            partitions = subscriptions.len(),
            error = %err,
            "Offset commit failed, abandoning broker"
        );
        self.metrics.broker_aborts.inc();

        // Closing first means no attach can land after the drain below
        commands.close();
        self.shutdown.cancel();

        if let Some(registry) = self.registry.upgrade() {
            registry.abandon_broker(self);
        }
        if let Err(close_err) = self.broker.close().await {
            debug!(broker = self.broker_id, error = %close_err, "Failed to close broker");
        }

        for pom in subscriptions.values() {
            pom.handle_error(err.clone());
            pom.trigger_rebalance();
        }

        while let Ok(command) = commands.try_recv() {
            if let BrokerCommand::Attach(pom) = command {
                pom.handle_error(err.clone());
                pom.trigger_rebalance();
            }
        }
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

    struct Fixture {
        registry: Arc<Registry>,
        broker: Arc<MockBroker>,
    }

    fn fixture() -> Fixture {
        let mut config = OffsetManagerConfig::for_group("test-group");
        config.return_errors = true;
        let broker = MockBroker::new(1);
        let client = MockCoordinatorClient::with_coordinator(config, broker.clone());
        let registry = OffsetManager::from_client(client).unwrap().registry().clone();
        Fixture { registry, broker }
    }

    fn partition(
        registry: &Arc<Registry>,
        topic: &str,
        partition: i32,
    ) -> (Arc<PartitionInner>, mpsc::Receiver<()>) {
        PartitionInner::new(registry.clone(), topic, partition)
    }

    fn take_errors(pom: &Arc<PartitionInner>) -> crate::offset::ErrorStream {
        crate::offset::PartitionOffsetManager::new(pom.clone())
            .errors()
            .unwrap()
    }

    #[tokio::test]
    async fn test_flush_batches_all_subscriptions() {
        let f = fixture();
        let (bom, _commands) = BrokerOffsetManager::new(&f.registry, f.broker.clone());

        let (a, _ra) = partition(&f.registry, "orders", 0);
        let (b, _rb) = partition(&f.registry, "orders", 1);
        let (c, _rc) = partition(&f.registry, "payments", 0);
        crate::offset::PartitionOffsetManager::new(a.clone()).set_offset(10);
        crate::offset::PartitionOffsetManager::new(b.clone()).set_offset(20);
        crate::offset::PartitionOffsetManager::new(c.clone()).set_metadata("meta");

        let mut subscriptions = Subscriptions::new();
        for pom in [&a, &b, &c] {
            subscriptions.insert(pom.id(), pom.clone());
        }

        bom.flush(&mut subscriptions).await.unwrap();

        let commits = f.broker.commits();
        assert_eq!(commits.len(), 1);
        let request = &commits[0];
        assert_eq!(request.group, "test-group");
        assert_eq!(request.len(), 3);
        assert_eq!(request.block("orders", 0).unwrap().offset, 10);
        assert_eq!(request.block("orders", 1).unwrap().offset, 20);
        assert_eq!(request.block("payments", 0).unwrap().metadata, "meta");
        assert_eq!(subscriptions.len(), 3);
        assert_eq!(f.registry.metrics.commits_sent.get(), 1);
        assert_eq!(f.registry.metrics.partitions_committed.get(), 3);
    }

    #[tokio::test]
    async fn test_flush_skips_round_trip_without_subscriptions() {
        let f = fixture();
        let (bom, _commands) = BrokerOffsetManager::new(&f.registry, f.broker.clone());

        let (closed, _rx) = partition(&f.registry, "orders", 0);
        closed.shutdown();

        let mut subscriptions = Subscriptions::new();
        subscriptions.insert(closed.id(), closed.clone());

        bom.flush(&mut subscriptions).await.unwrap();
        assert!(subscriptions.is_empty());
        assert_eq!(f.broker.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_demultiplexes_partition_results() {
        let f = fixture();
        let (bom, _commands) = BrokerOffsetManager::new(&f.registry, f.broker.clone());

        f.broker.set_commit_error("orders", 1, ErrorCode::NotLeaderForPartition);
        f.broker.set_commit_error("orders", 2, ErrorCode::OffsetMetadataTooLarge);
        f.broker.omit_from_commit("orders", 3);

        let (ok, mut ok_rebalance) = partition(&f.registry, "orders", 0);
        let (moved, mut moved_rebalance) = partition(&f.registry, "orders", 1);
        let (failed, mut failed_rebalance) = partition(&f.registry, "orders", 2);
        let (missing, mut missing_rebalance) = partition(&f.registry, "orders", 3);

        let mut ok_errors = take_errors(&ok);
        let mut moved_errors = take_errors(&moved);
        let mut failed_errors = take_errors(&failed);
        let mut missing_errors = take_errors(&missing);

        let mut subscriptions = Subscriptions::new();
        for pom in [&ok, &moved, &failed, &missing] {
            subscriptions.insert(pom.id(), pom.clone());
        }

        bom.flush(&mut subscriptions).await.unwrap();

        assert_eq!(subscriptions.len(), 1);
        assert!(subscriptions.contains_key(&ok.id()));

        assert!(ok_errors.try_recv().is_none());
        assert!(ok_rebalance.try_recv().is_err());

        // Coordinator moved: rebalance without surfacing an error
        assert!(moved_errors.try_recv().is_none());
        assert!(moved_rebalance.try_recv().is_ok());

        assert_eq!(
            failed_errors.try_recv(),
            Some(OffsetError::Broker { code: ErrorCode::OffsetMetadataTooLarge })
        );
        assert!(failed_rebalance.try_recv().is_ok());

        assert_eq!(missing_errors.try_recv(), Some(OffsetError::IncompleteResponse));
        assert!(missing_rebalance.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_flush_missing_topic_is_incomplete() {
        let f = fixture();
        let (bom, _commands) = BrokerOffsetManager::new(&f.registry, f.broker.clone());
        let (pom, mut rebalance) = partition(&f.registry, "orders", 0);
        let mut errors = take_errors(&pom);

        let response = OffsetCommitResponse::default();
        assert!(!bom.handle_commit_result(&pom, &response));
        assert_eq!(errors.try_recv(), Some(OffsetError::IncompleteResponse));
        assert!(rebalance.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_transport_failure_is_returned() {
        let f = fixture();
        let (bom, _commands) = BrokerOffsetManager::new(&f.registry, f.broker.clone());
        let (pom, _rx) = partition(&f.registry, "orders", 0);

        let mut subscriptions = Subscriptions::new();
        subscriptions.insert(pom.id(), pom.clone());

        f.broker.fail_commits(true);
        let result = bom.flush(&mut subscriptions).await;
        assert!(matches!(result, Err(OffsetError::Transport(_))));
        assert_eq!(f.registry.metrics.commit_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_abort_notifies_subscribed_and_pending_partitions() {
        let f = fixture();
        // Loop not running, so the attach below stays pending in the channel
        let (idle, commands) = BrokerOffsetManager::new(&f.registry, f.broker.clone());

        let (subscribed, mut subscribed_rebalance) = partition(&f.registry, "orders", 0);
        let (pending, mut pending_rebalance) = partition(&f.registry, "orders", 1);
        let mut subscribed_errors = take_errors(&subscribed);
        let mut pending_errors = take_errors(&pending);

        idle.attach(pending.clone()).await.unwrap();

        let mut subscriptions = Subscriptions::new();
        subscriptions.insert(subscribed.id(), subscribed.clone());

        let err = OffsetError::Transport("connection reset".to_string());
        idle.abort(err.clone(), subscriptions, commands).await;

        assert!(f.broker.is_closed());
        assert!(idle.is_shut_down());
        assert_eq!(subscribed_errors.try_recv(), Some(err.clone()));
        assert!(subscribed_rebalance.try_recv().is_ok());
        assert_eq!(pending_errors.try_recv(), Some(err));
        assert!(pending_rebalance.try_recv().is_ok());
        assert_eq!(f.registry.metrics.broker_aborts.get(), 1);

        // Attaching after the drain fails instead of hanging
        let (late, _rx) = partition(&f.registry, "orders", 2);
        assert_eq!(
            idle.attach(late).await,
            Err(OffsetError::BrokerClosed { broker: 1 })
        );
    }

    #[tokio::test]
    async fn test_refcount_helpers() {
        let f = fixture();
        let (bom, _commands) = BrokerOffsetManager::new(&f.registry, f.broker.clone());
        assert_eq!(bom.refs(), 0);
        assert_eq!(bom.acquire(), 1);
        assert_eq!(bom.acquire(), 2);
        assert_eq!(bom.release(), 1);
        assert_eq!(bom.refs(), 1);
        assert_eq!(bom.broker_id(), 1);
    }
}
