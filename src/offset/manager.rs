use crate::{
    client::{CoordinatorClient, OffsetBroker},
    config::OffsetManagerConfig,
    error::{OffsetError, Result},
    metrics::OffsetMetrics,
    offset::{
        broker::BrokerOffsetManager,
        partition::{PartitionInner, PartitionOffsetManager},
    },
    types::{BrokerId, PartitionId, TopicPartition},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tracks consumed offsets for one consumer group.
///
/// Creates one [`PartitionOffsetManager`] per managed topic/partition and shares one
/// broker-level batching task between all partitions whose coordinator is the same
/// broker.
#[derive(Clone)]
pub struct OffsetManager {
    inner: Arc<Registry>,
}

pub(crate) struct Registry {
    pub(crate) client: Arc<dyn CoordinatorClient>,
    pub(crate) config: Arc<OffsetManagerConfig>,
    pub(crate) metrics: Arc<OffsetMetrics>,
    next_id: AtomicU64,
    // Held only for map mutation, never across I/O or a channel send
    maps: Mutex<Maps>,
}

#[derive(Default)]
struct Maps {
    partitions: HashMap<String, HashMap<PartitionId, Arc<PartitionInner>>>,
    brokers: HashMap<BrokerId, Arc<BrokerOffsetManager>>,
}

enum Registration {
    Registered,
    Occupied,
    Terminated,
}

impl Maps {
    fn partition_count(&self) -> usize {
        self.partitions.values().map(HashMap::len).sum()
    }
}

impl Registry {
    pub(crate) fn next_partition_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_managing(&self, topic: &str, partition: PartitionId) -> bool {
        self.maps
            .lock()
            .partitions
            .get(topic)
            .map_or(false, |partitions| partitions.contains_key(&partition))
    }

    fn register_partition(&self, pom: &Arc<PartitionInner>) -> Registration {
        let mut maps = self.maps.lock();
        // A manager whose task already ended has freed (or never taken) its slot
        if pom.state().is_terminal() {
            return Registration::Terminated;
        }

        let topic_managers = maps.partitions.entry(pom.topic().to_string()).or_default();
        if topic_managers.contains_key(&pom.partition()) {
            return Registration::Occupied;
        }
        topic_managers.insert(pom.partition(), pom.clone());

        let count = maps.partition_count();
        self.metrics.managed_partitions.set(count as i64);
        Registration::Registered
    }

    /// Free a partition slot, but only if `id` still owns it.
    pub(crate) fn remove_partition(&self, topic: &str, partition: PartitionId, id: u64) {
        let mut maps = self.maps.lock();
        let Some(topic_managers) = maps.partitions.get_mut(topic) else {
            return;
        };
        if topic_managers.get(&partition).map(|pom| pom.id()) != Some(id) {
            return;
        }

        topic_managers.remove(&partition);
        if topic_managers.is_empty() {
            maps.partitions.remove(topic);
        }
        let count = maps.partition_count();
        self.metrics.managed_partitions.set(count as i64);
    }

    pub(crate) fn ref_broker(self: &Arc<Self>, broker: Arc<dyn OffsetBroker>) -> Arc<BrokerOffsetManager> {
        let mut maps = self.maps.lock();

        let broker_id = broker.id();
        let bom = maps
            .brokers
            .entry(broker_id)
            .or_insert_with(|| BrokerOffsetManager::spawn(self, broker))
            .clone();
        let refs = bom.acquire();

        self.metrics.active_brokers.set(maps.brokers.len() as i64);
        debug!(broker = broker_id, refs, "Referenced broker offset manager");
        bom
    }

    pub(crate) fn unref_broker(&self, bom: &Arc<BrokerOffsetManager>) {
        let mut maps = self.maps.lock();

        let refs = bom.release();
        if refs == 0 {
            bom.shutdown();
            let current = maps
                .brokers
                .get(&bom.broker_id())
                .map_or(false, |existing| Arc::ptr_eq(existing, bom));
            if current {
                maps.brokers.remove(&bom.broker_id());
            }
        }

        self.metrics.active_brokers.set(maps.brokers.len() as i64);
        debug!(broker = bom.broker_id(), refs, "Released broker offset manager");
    }

    /// Drop an aborted broker manager from the registry regardless of its references.
    pub(crate) fn abandon_broker(&self, bom: &Arc<BrokerOffsetManager>) {
        let mut maps = self.maps.lock();

        let current = maps
            .brokers
            .get(&bom.broker_id())
            .map_or(false, |existing| Arc::ptr_eq(existing, bom));
        if current {
            maps.brokers.remove(&bom.broker_id());
        }

        self.metrics.active_brokers.set(maps.brokers.len() as i64);
        warn!(broker = bom.broker_id(), "Abandoned broker offset manager");
    }
}

impl OffsetManager {
    /// Create an offset manager from a coordinator client, using the client's configuration.
    pub fn from_client(client: Arc<dyn CoordinatorClient>) -> Result<Self> {
        // Check the client before looking at anything else
        if client.is_closed() {
            return Err(OffsetError::ClosedClient);
        }

        let config = client.config().clone();
        config.validate()?;
        let metrics = OffsetMetrics::new()?;

        info!(group = %config.group, "Created offset manager");

        Ok(Self {
            inner: Arc::new(Registry {
                client,
                config: Arc::new(config),
                metrics,
                next_id: AtomicU64::new(0),
                maps: Mutex::new(Maps::default()),
            }),
        })
    }

    /// Start tracking `topic`/`partition`.
    ///
    /// Resolves the group's coordinator and fetches the committed offset before
    /// returning. Fails with a configuration error if the partition is already managed.
    pub async fn manage_partition(
        &self,
        topic: &str,
        partition: PartitionId,
    ) -> Result<PartitionOffsetManager> {
        let registry = &self.inner;

        if registry.client.is_closed() {
            return Err(OffsetError::ClosedClient);
        }
        if registry.is_managing(topic, partition) {
            return Err(already_managed(topic, partition));
        }

        let pom = PartitionInner::start(registry.clone(), topic, partition).await?;

        match registry.register_partition(&pom) {
            Registration::Registered => {
                info!(
                    group = %registry.config.group,
                    topic,
                    partition,
                    offset = pom.snapshot().0,
                    "Managing partition offsets"
                );
            }
            Registration::Occupied => {
                // Lost a race with a concurrent call for the same partition
                pom.shutdown();
                return Err(already_managed(topic, partition));
            }
            Registration::Terminated => {
                warn!(topic, partition, "Partition offset manager stopped before registration");
            }
        }

        Ok(PartitionOffsetManager::new(pom))
    }

    /// Close every managed partition and wait for their tasks to stop.
    pub async fn close(&self) -> Result<()> {
        let managed: Vec<Arc<PartitionInner>> = {
            let maps = self.inner.maps.lock();
            maps.partitions
                .values()
                .flat_map(|partitions| partitions.values().cloned())
                .collect()
        };

        let mut errors = Vec::new();
        for pom in managed {
            match PartitionOffsetManager::new(pom).close().await {
                Ok(()) => {}
                Err(OffsetError::Errors(pending)) => errors.extend(pending),
                Err(err) => errors.push(err),
            }
        }

        info!(group = %self.inner.config.group, "Offset manager closed");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OffsetError::Errors(errors))
        }
    }

    pub fn group(&self) -> &str {
        &self.inner.config.group
    }

    pub fn config(&self) -> &OffsetManagerConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Arc<OffsetMetrics> {
        self.inner.metrics.clone()
    }

    pub fn is_managing(&self, topic: &str, partition: PartitionId) -> bool {
        self.inner.is_managing(topic, partition)
    }

    pub fn managed_partitions(&self) -> Vec<TopicPartition> {
        let maps = self.inner.maps.lock();
        let mut managed: Vec<TopicPartition> = maps
            .partitions
            .iter()
            .flat_map(|(topic, partitions)| {
                partitions
                    .keys()
                    .map(move |&partition| TopicPartition::new(topic.clone(), partition))
            })
            .collect();
        managed.sort();
        managed
    }

    /// Reference count of the live broker offset manager for `broker_id`, if any
    pub fn broker_refs(&self, broker_id: BrokerId) -> Option<usize> {
        self.inner
            .maps
            .lock()
            .brokers
            .get(&broker_id)
            .map(|bom| bom.refs())
    }

    pub fn active_brokers(&self) -> Vec<BrokerId> {
        let mut brokers: Vec<BrokerId> = self.inner.maps.lock().brokers.keys().copied().collect();
        brokers.sort_unstable();
        brokers
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.inner
    }
}

fn already_managed(topic: &str, partition: PartitionId) -> OffsetError {
    OffsetError::Configuration(format!(
        "That topic/partition is already being managed: {}:{}",
        topic, partition
    ))
}
