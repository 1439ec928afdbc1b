use crate::error::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Prometheus metrics for one offset manager and its broker/partition managers.
pub struct OffsetMetrics {
    pub commits_sent: IntCounter,
    pub commit_failures: IntCounter,
    pub partitions_committed: IntCounter,
    pub rebalances: IntCounter,
    pub errors_reported: IntCounter,
    pub broker_aborts: IntCounter,
    pub commit_latency: Histogram,
    pub active_brokers: IntGauge,
    pub managed_partitions: IntGauge,
    pub registry: Registry,
}

impl OffsetMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let commits_sent = IntCounter::new(
            "offset_commits_total",
            "Total number of batched offset commit requests sent",
        )?;

        let commit_failures = IntCounter::new(
            "offset_commit_failures_total",
            "Offset commit requests that failed at the transport level",
        )?;

        let partitions_committed = IntCounter::new(
            "offset_partitions_committed_total",
            "Partition offsets acknowledged by a coordinator",
        )?;

        let rebalances = IntCounter::new(
            "offset_rebalances_total",
            "Coordinator re-resolutions triggered for partitions",
        )?;

        let errors_reported = IntCounter::new(
            "offset_errors_reported_total",
            "Errors reported by partition offset managers",
        )?;

        let broker_aborts = IntCounter::new(
            "offset_broker_aborts_total",
            "Broker offset managers abandoned after a fatal commit failure",
        )?;

        let commit_latency = Histogram::with_opts(HistogramOpts::new(
            "offset_commit_latency_seconds",
            "Offset commit round trip latency",
        ))?;

        let active_brokers = IntGauge::new(
            "offset_active_brokers",
            "Number of live broker offset managers",
        )?;

        let managed_partitions = IntGauge::new(
            "offset_managed_partitions",
            "Number of registered partition offset managers",
        )?;

        registry.register(Box::new(commits_sent.clone()))?;
        registry.register(Box::new(commit_failures.clone()))?;
        registry.register(Box::new(partitions_committed.clone()))?;
        registry.register(Box::new(rebalances.clone()))?;
        registry.register(Box::new(errors_reported.clone()))?;
        registry.register(Box::new(broker_aborts.clone()))?;
        registry.register(Box::new(commit_latency.clone()))?;
        registry.register(Box::new(active_brokers.clone()))?;
        registry.register(Box::new(managed_partitions.clone()))?;

        Ok(Arc::new(Self {
            commits_sent,
            commit_failures,
            partitions_committed,
            rebalances,
            errors_reported,
            broker_aborts,
            commit_latency,
            active_brokers,
            managed_partitions,
            registry,
        }))
    }
}
