//! Point-in-time view of the cluster's hosts and sites.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::optimizer::Placement;
use crate::types::{HostId, PartitionId, SiteId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
    /// Cluster-unique site id.
    pub site: SiteId,
    /// Host the site runs on.
    pub host: HostId,
    /// Partition the site is mapped to in the catalog. Spare slots have none.
    pub partition: Option<PartitionId>,
    /// Serving. Down sites are copy targets.
    pub up: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    hosts: BTreeSet<HostId>,
    sites: BTreeMap<SiteId, SiteInfo>,
}

impl TopologySnapshot {
    pub fn new(hosts: impl IntoIterator<Item = HostId>, sites: impl IntoIterator<Item = SiteInfo>) -> Self {
        let mut snapshot = Self {
            hosts: hosts.into_iter().collect(),
            sites: BTreeMap::new(),
        };
        for site in sites {
            snapshot.hosts.insert(site.host);
            snapshot.sites.insert(site.site, site);
        }
        snapshot
    }

    pub fn hosts(&self) -> &BTreeSet<HostId> {
        &self.hosts
    }

    pub fn site(&self, site: SiteId) -> Option<&SiteInfo> {
        self.sites.get(&site)
    }

    pub fn sites(&self) -> impl Iterator<Item = &SiteInfo> {
        self.sites.values()
    }

    pub fn host_of_site(&self, site: SiteId) -> Option<HostId> {
        self.sites.get(&site).map(|info| info.host)
    }

    pub fn partition_of_site(&self, site: SiteId) -> Option<PartitionId> {
        self.sites.get(&site).and_then(|info| info.partition)
    }

    pub fn sites_on_host(&self, host: HostId) -> impl Iterator<Item = &SiteInfo> {
        self.sites.values().filter(move |info| info.host == host)
    }

    pub fn up_sites_for(&self, partition: PartitionId) -> impl Iterator<Item = &SiteInfo> {
        self.sites
            .values()
            .filter(move |info| info.up && info.partition == Some(partition))
    }

    /// Up site for `partition` on `host`, if one exists.
    pub fn live_site_on_host(&self, host: HostId, partition: PartitionId) -> Option<SiteId> {
        self.up_sites_for(partition)
            .find(|info| info.host == host)
            .map(|info| info.site)
    }

    pub fn down_sites_on_host(&self, host: HostId) -> impl Iterator<Item = &SiteInfo> {
        self.sites_on_host(host).filter(|info| !info.up)
    }

    /// Placement implied by the up sites. A partition with up sites on more
    /// than one host (a copy in flight) is attributed to its lowest-numbered
    /// up site. Every known host appears, even with no partitions.
    pub fn current_placement(&self) -> Placement {
        let mut placement = Placement::new();
        for host in &self.hosts {
            placement.add_host(*host);
        }
        let mut seen = BTreeSet::new();
        for info in self.sites.values() {
            let Some(partition) = info.partition else {
                continue;
            };
            if info.up && seen.insert(partition) {
                placement.insert(info.host, partition);
            }
        }
        placement
    }

    pub fn set_site_up(&mut self, site: SiteId, up: bool) -> bool {
        match self.sites.get_mut(&site) {
            Some(info) => {
                info.up = up;
                true
            }
            None => false,
        }
    }

    pub fn assign_site(&mut self, site: SiteId, partition: PartitionId) -> bool {
        match self.sites.get_mut(&site) {
            Some(info) => {
                info.partition = Some(partition);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(site: SiteId, host: HostId, partition: Option<PartitionId>, up: bool) -> SiteInfo {
        SiteInfo {
            site,
            host,
            partition,
            up,
        }
    }

    fn two_host_cluster() -> TopologySnapshot {
        TopologySnapshot::new(
            [100, 200, 300],
            [
                site(1, 100, Some(101), true),
                site(2, 100, Some(102), true),
                site(3, 100, None, false),
                site(4, 200, Some(201), true),
                site(5, 200, Some(101), false),
                site(6, 200, None, false),
            ],
        )
    }

    #[test]
    fn derives_placement_from_up_sites() {
        let topology = two_host_cluster();
        let placement = topology.current_placement();
        assert_eq!(placement.host_of(101), Some(100));
        assert_eq!(placement.host_of(201), Some(200));
        assert_eq!(placement.partitions_on(300).map(BTreeSet::len), Some(0));
        assert_eq!(placement.partition_count(), 3);
    }

    #[test]
    fn lookups() {
        let mut topology = two_host_cluster();
        assert_eq!(topology.host_of_site(5), Some(200));
        assert_eq!(topology.partition_of_site(3), None);
        assert_eq!(topology.live_site_on_host(200, 101), None);
        let down: Vec<SiteId> = topology.down_sites_on_host(200).map(|s| s.site).collect();
        assert_eq!(down, vec![5, 6]);

        assert!(topology.set_site_up(5, true));
        assert_eq!(topology.live_site_on_host(200, 101), Some(5));
        // Both copies up: lowest site wins.
        assert_eq!(topology.current_placement().host_of(101), Some(100));
        assert!(!topology.set_site_up(42, true));
    }
}
