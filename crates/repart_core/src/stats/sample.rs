use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::stats::group::{Locality, TxnGroupLatencyStats};
use crate::stats::key::TxnGroupKey;
use crate::types::{HostId, PartitionId};

/// Index of a (sub-)group inside a `WorkloadSample`.
pub type GroupId = usize;

/// Default per-group sample cap.
pub const DEFAULT_MAX_SAMPLES_PER_GROUP: usize = 1_000;

/// One epoch's grouped latency statistics.
///
/// Each key maps to one or more sub-groups: once the most recently opened
/// sub-group holds `max_samples_per_group` transactions, the next transaction
/// opens a fresh sub-group with the same key. Sub-groups are never merged;
/// per-key lookups always address the most recently opened one.
#[derive(Debug, Clone)]
pub struct WorkloadSample {
    max_samples_per_group: usize,
    groups: Vec<TxnGroupLatencyStats>,
    by_key: HashMap<TxnGroupKey, Vec<GroupId>>,
    single_partition: Vec<GroupId>,
    multi_partition: Vec<GroupId>,
    procedures: HashSet<Arc<str>>,
}

impl Default for WorkloadSample {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SAMPLES_PER_GROUP)
    }
}

impl WorkloadSample {
    pub fn new(max_samples_per_group: usize) -> Self {
        Self {
            max_samples_per_group: max_samples_per_group.max(1),
            groups: Vec::new(),
            by_key: HashMap::new(),
            single_partition: Vec::new(),
            multi_partition: Vec::new(),
            procedures: HashSet::new(),
        }
    }

    /// Shared handle for a procedure name, allocated once per distinct name.
    pub fn intern(&mut self, procedure: &str) -> Arc<str> {
        if let Some(existing) = self.procedures.get(procedure) {
            return existing.clone();
        }
        let name: Arc<str> = Arc::from(procedure);
        self.procedures.insert(name.clone());
        name
    }

    pub fn single_partition_key(
        &mut self,
        procedure: &str,
        initiator_host: HostId,
        partition: PartitionId,
    ) -> TxnGroupKey {
        TxnGroupKey::single(self.intern(procedure), initiator_host, partition)
    }

    pub fn multi_partition_key(&mut self, procedure: &str, initiator_host: HostId) -> TxnGroupKey {
        TxnGroupKey::every(self.intern(procedure), initiator_host)
    }

    /// Record one transaction against `key`, opening a new sub-group when the
    /// current one is full.
    pub fn record_transaction(
        &mut self,
        key: &TxnGroupKey,
        latency_ns: i64,
        locality: Locality,
    ) -> GroupId {
        let cap = self.max_samples_per_group as u64;
        let id = match self.latest_id(key) {
            Some(id) if self.groups[id].transactions() < cap => id,
            _ => self.open_group(key),
        };
        self.groups[id].record_transaction(latency_ns, locality);
        id
    }

    /// Record remote network latency to `partition` for the most recent
    /// sub-group of `key`, creating one if the key has not been seen.
    pub fn record_remote_partition_latency(
        &mut self,
        key: &TxnGroupKey,
        partition: PartitionId,
        latency_ns: i64,
        is_estimate: bool,
    ) -> GroupId {
        let id = match self.latest_id(key) {
            Some(id) => id,
            None => self.open_group(key),
        };
        self.groups[id].record_remote_partition_latency(partition, latency_ns, is_estimate);
        id
    }

    /// Reconcile every group. Must run before the sample is scheduled or
    /// optimized.
    pub fn reconcile(&mut self) {
        for group in &mut self.groups {
            group.reconcile();
        }
    }

    pub fn group(&self, id: GroupId) -> &TxnGroupLatencyStats {
        &self.groups[id]
    }

    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &TxnGroupLatencyStats)> {
        self.groups.iter().enumerate()
    }

    /// Most recently opened sub-group for `key`.
    pub fn latest(&self, key: &TxnGroupKey) -> Option<&TxnGroupLatencyStats> {
        self.latest_id(key).map(|id| &self.groups[id])
    }

    /// Every sub-group for `key`, oldest first.
    pub fn subgroups(&self, key: &TxnGroupKey) -> &[GroupId] {
        self.by_key.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn single_partition_groups(&self) -> &[GroupId] {
        &self.single_partition
    }

    pub fn multi_partition_groups(&self) -> &[GroupId] {
        &self.multi_partition
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn total_transactions(&self) -> u64 {
        self.groups.iter().map(|group| group.transactions()).sum()
    }

    /// Share of groups that are single-partition; 0 for an empty sample.
    pub fn best_case_probability(&self) -> f64 {
        let single = self.single_partition.len();
        let total = single + self.multi_partition.len();
        if total == 0 {
            return 0.0;
        }
        single as f64 / total as f64
    }

    /// Drop every group. Interned procedure names are kept across epochs.
    pub fn clear(&mut self) {
        self.groups.clear();
        self.by_key.clear();
        self.single_partition.clear();
        self.multi_partition.clear();
    }

    fn latest_id(&self, key: &TxnGroupKey) -> Option<GroupId> {
        self.by_key.get(key).and_then(|ids| ids.last().copied())
    }

    fn open_group(&mut self, key: &TxnGroupKey) -> GroupId {
        let id = self.groups.len();
        self.groups.push(TxnGroupLatencyStats::new(key.clone()));
        self.by_key.entry(key.clone()).or_default().push(id);
        if key.is_single_partition() {
            self.single_partition.push(id);
        } else {
            self.multi_partition.push(id);
        }
        id
    }
}
