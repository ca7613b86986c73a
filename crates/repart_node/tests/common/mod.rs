#![allow(dead_code)]

use std::time::Duration;

use repart_core::RepartitionConfig;
use repart_node::sim::ClusterLayout;
use repart_node::workload::WorkloadProfile;

/// Two hosts with two partitions each and one spare slot per host.
/// Sites: 1(100,101) 2(100,102) 3(100 spare) 4(200,201) 5(200,202) 6(200 spare).
pub fn layout() -> ClusterLayout {
    ClusterLayout {
        hosts: 2,
        partitions_per_host: 2,
        spare_sites_per_host: 1,
    }
}

/// Partition 201 is hot and mostly driven from host 100.
pub fn profile() -> WorkloadProfile {
    let layout = layout();
    WorkloadProfile::skewed(&layout.host_ids(), layout.partitions_per_host)
}

pub fn config() -> RepartitionConfig {
    RepartitionConfig {
        epoch_length: Duration::from_secs(1),
        post_repartition_ignore_epochs: 3,
        migration_timeout: Duration::from_secs(10),
        ..RepartitionConfig::default()
    }
}

pub const COPY_DELAY: Duration = Duration::from_millis(200);
