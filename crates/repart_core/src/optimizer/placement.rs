use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{HostId, PartitionId};

/// Partition-to-host assignment, keyed by host.
///
/// Hosts with no partitions may be present. A well-formed placement holds each
/// partition on exactly one host; `insert` moves a partition if it was already
/// placed elsewhere.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Placement(BTreeMap<HostId, BTreeSet<PartitionId>>);

impl Placement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host without assigning partitions to it.
    pub fn add_host(&mut self, host: HostId) {
        self.0.entry(host).or_default();
    }

    pub fn insert(&mut self, host: HostId, partition: PartitionId) {
        for partitions in self.0.values_mut() {
            partitions.remove(&partition);
        }
        self.0.entry(host).or_default().insert(partition);
    }

    pub fn host_of(&self, partition: PartitionId) -> Option<HostId> {
        self.0
            .iter()
            .find(|(_, partitions)| partitions.contains(&partition))
            .map(|(host, _)| *host)
    }

    pub fn partitions_on(&self, host: HostId) -> Option<&BTreeSet<PartitionId>> {
        self.0.get(&host)
    }

    pub fn hosts(&self) -> impl Iterator<Item = HostId> + '_ {
        self.0.keys().copied()
    }

    pub fn partitions(&self) -> BTreeSet<PartitionId> {
        self.0.values().flatten().copied().collect()
    }

    pub fn partition_count(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HostId, &BTreeSet<PartitionId>)> {
        self.0.iter().map(|(host, partitions)| (*host, partitions))
    }

    /// Partition -> host view.
    pub fn by_partition(&self) -> BTreeMap<PartitionId, HostId> {
        self.iter()
            .flat_map(|(host, partitions)| partitions.iter().map(move |p| (*p, host)))
            .collect()
    }

    /// Partitions of `self` whose host differs in `target` (or that `target`
    /// does not place at all), with their current and new hosts.
    pub fn moves_to(&self, target: &Placement) -> Vec<(PartitionId, HostId, Option<HostId>)> {
        let target_hosts = target.by_partition();
        self.by_partition()
            .into_iter()
            .filter_map(|(partition, host)| {
                let dest = target_hosts.get(&partition).copied();
                (dest != Some(host)).then_some((partition, host, dest))
            })
            .collect()
    }

    /// Number of `(partition, host)` pairs of `self` that `target` drops.
    pub fn moved_count(&self, target: &Placement) -> usize {
        self.moves_to(target).len()
    }

    pub fn max_partitions_per_host(&self) -> usize {
        self.0.values().map(BTreeSet::len).max().unwrap_or(0)
    }

    pub fn into_inner(self) -> BTreeMap<HostId, BTreeSet<PartitionId>> {
        self.0
    }
}

impl From<BTreeMap<HostId, BTreeSet<PartitionId>>> for Placement {
    fn from(map: BTreeMap<HostId, BTreeSet<PartitionId>>) -> Self {
        Self(map)
    }
}

impl FromIterator<(HostId, PartitionId)> for Placement {
    fn from_iter<I: IntoIterator<Item = (HostId, PartitionId)>>(iter: I) -> Self {
        let mut placement = Placement::new();
        for (host, partition) in iter {
            placement.insert(host, partition);
        }
        placement
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (host, partitions) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{host}:{partitions:?}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement(pairs: &[(HostId, PartitionId)]) -> Placement {
        pairs.iter().copied().collect()
    }

    #[test]
    fn insert_moves_partition_between_hosts() {
        let mut p = placement(&[(100, 101), (200, 201)]);
        p.insert(200, 101);
        assert_eq!(p.host_of(101), Some(200));
        assert_eq!(p.partitions_on(100).map(BTreeSet::len), Some(0));
        assert_eq!(p.partition_count(), 2);
    }

    #[test]
    fn moves_report_changed_and_dropped_partitions() {
        let current = placement(&[(100, 101), (100, 102), (200, 201), (200, 202)]);
        let target = placement(&[(100, 101), (100, 201), (200, 102)]);
        assert_eq!(
            current.moves_to(&target),
            vec![(102, 100, Some(200)), (201, 200, Some(100)), (202, 200, None)]
        );
        assert_eq!(current.moved_count(&current), 0);
    }

    #[test]
    fn display_lists_hosts_in_order() {
        let p = placement(&[(200, 201), (100, 102), (100, 101)]);
        assert_eq!(p.to_string(), "100:{101, 102} 200:{201}");
    }
}
