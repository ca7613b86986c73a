use std::collections::BTreeMap;

use crate::stats::key::TxnGroupKey;
use crate::stats::latency::{median_of, LatencyBuffer};
use crate::types::PartitionId;

/// Where a transaction's coordinator ran relative to its initiator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Locality {
    /// Coordinator site lives on the initiator's host.
    Local,
    Remote,
}

/// A latency value tagged with whether it was measured or inferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LatencyEstimate {
    pub value_ns: u64,
    pub is_estimate: bool,
}

impl LatencyEstimate {
    pub fn actual(value_ns: u64) -> Self {
        Self {
            value_ns,
            is_estimate: false,
        }
    }

    pub fn estimate(value_ns: u64) -> Self {
        Self {
            value_ns,
            is_estimate: true,
        }
    }
}

/// Reconciled latencies for one group. Always satisfies `remote >= local >= 1`.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupLatency {
    pub local: LatencyEstimate,
    pub remote: LatencyEstimate,
    /// Median over every observed transaction latency, local or remote.
    /// Used to order groups when building the worst-case schedule.
    pub observed_median_ns: u64,
    /// Per-partition remote network latency where any was recorded.
    pub partition_penalties: BTreeMap<PartitionId, LatencyEstimate>,
}

impl GroupLatency {
    /// Extra cost paid when `partition` is not on the initiator's host.
    pub fn remote_penalty(&self, partition: PartitionId) -> LatencyEstimate {
        if let Some(penalty) = self.partition_penalties.get(&partition) {
            return *penalty;
        }
        LatencyEstimate {
            value_ns: self.remote.value_ns - self.local.value_ns,
            is_estimate: self.local.is_estimate || self.remote.is_estimate,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PartitionLatency {
    buffer: LatencyBuffer,
    measured: bool,
}

/// Latency statistics for one (sub-)group of a `WorkloadSample`.
#[derive(Debug, Clone)]
pub struct TxnGroupLatencyStats {
    key: TxnGroupKey,
    transactions: u64,
    local: LatencyBuffer,
    remote: LatencyBuffer,
    partitions: BTreeMap<PartitionId, PartitionLatency>,
    reconciled: Option<GroupLatency>,
}

impl TxnGroupLatencyStats {
    pub fn new(key: TxnGroupKey) -> Self {
        Self {
            key,
            transactions: 0,
            local: LatencyBuffer::default(),
            remote: LatencyBuffer::default(),
            partitions: BTreeMap::new(),
            reconciled: None,
        }
    }

    pub fn key(&self) -> &TxnGroupKey {
        &self.key
    }

    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    pub fn local_samples(&self) -> usize {
        self.local.len()
    }

    pub fn remote_samples(&self) -> usize {
        self.remote.len()
    }

    /// Record one completed transaction. Latencies below 1ns are clamped to 1.
    pub fn record_transaction(&mut self, latency_ns: i64, locality: Locality) {
        let latency_ns = clamp_latency(latency_ns);
        self.transactions += 1;
        match locality {
            Locality::Local => self.local.push(latency_ns),
            Locality::Remote => self.remote.push(latency_ns),
        }
        self.reconciled = None;
    }

    /// Record the network latency of reaching `partition` remotely.
    ///
    /// A partition's buffer counts as measured once any non-estimate sample
    /// arrives.
    pub fn record_remote_partition_latency(
        &mut self,
        partition: PartitionId,
        latency_ns: i64,
        is_estimate: bool,
    ) {
        let entry = self.partitions.entry(partition).or_default();
        entry.buffer.push(clamp_latency(latency_ns));
        entry.measured |= !is_estimate;
        self.reconciled = None;
    }

    /// Reconciled latencies, if `reconcile` ran since the last insert.
    pub fn latency(&self) -> Option<&GroupLatency> {
        self.reconciled.as_ref()
    }

    /// Derive missing local/remote latencies and enforce `remote >= local`.
    pub fn reconcile(&mut self) -> &GroupLatency {
        let local_median = self.local.median();
        let remote_median = self.remote.median();

        let (local, remote) = match (local_median, remote_median) {
            (Some(local), Some(remote)) if remote < local => {
                // Local execution slower than remote: the cluster is saturated
                // enough that the local measurement is itself inflated.
                tracing::warn!(
                    group = %self.key,
                    local_ns = local,
                    remote_ns = remote,
                    "remote latency below local latency; widening remote to 2x local"
                );
                (
                    LatencyEstimate::actual(local),
                    LatencyEstimate::estimate(local.saturating_mul(2)),
                )
            }
            (Some(local), Some(remote)) => {
                (LatencyEstimate::actual(local), LatencyEstimate::actual(remote))
            }
            (Some(local), None) => (
                LatencyEstimate::actual(local),
                LatencyEstimate::estimate(local.saturating_mul(2)),
            ),
            (None, Some(remote)) => (
                LatencyEstimate::estimate(((remote + 1) / 2).max(1)),
                LatencyEstimate::actual(remote),
            ),
            // Only partition network samples were recorded for this group.
            (None, None) => (LatencyEstimate::estimate(1), LatencyEstimate::estimate(2)),
        };
        debug_assert!(
            local.value_ns >= 1 && remote.value_ns >= local.value_ns,
            "latency derivation invariant violated for {}",
            self.key
        );

        let observed_median_ns = if self.local.is_empty() && self.remote.is_empty() {
            local.value_ns
        } else {
            let mut all = Vec::with_capacity(self.local.len() + self.remote.len());
            all.extend_from_slice(self.local.samples());
            all.extend_from_slice(self.remote.samples());
            median_of(&all)
        };

        let partition_penalties = self
            .partitions
            .iter_mut()
            .filter_map(|(partition, entry)| {
                let median = entry.buffer.median()?;
                let estimate = LatencyEstimate {
                    value_ns: median,
                    is_estimate: !entry.measured,
                };
                Some((*partition, estimate))
            })
            .collect();

        self.reconciled.insert(GroupLatency {
            local,
            remote,
            observed_median_ns,
            partition_penalties,
        })
    }
}

fn clamp_latency(latency_ns: i64) -> u64 {
    latency_ns.max(1) as u64
}
