//! Seeded synthetic workload.
//!
//! Each procedure has a weight, a partition set and an initiator rule. The
//! generator classifies every transaction against the live topology: work
//! that runs on a site of the initiator's host pays only its base latency,
//! anything else pays one network hop per remote partition touched.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use repart_core::{HostId, MessageStats, PartitionId, SiteId, TopologySnapshot, TxnRecord};

/// Largest batch handed to the controller in one message.
pub const MAX_BATCH_RECORDS: usize = 100;

#[derive(Clone, Debug, PartialEq)]
pub enum Initiator {
    /// Initiated from whichever host currently serves the partition.
    FollowPartition,
    /// Initiated from `host` with probability `affinity`, otherwise from a
    /// uniformly random host.
    Home { host: HostId, affinity: f64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcedureProfile {
    pub name: String,
    pub weight: u32,
    /// Single-partition procedures pick one of these per transaction;
    /// multi-partition ones touch all of them.
    pub partitions: Vec<PartitionId>,
    pub single_partition: bool,
    pub initiator: Initiator,
    pub base_latency_ns: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadProfile {
    pub procedures: Vec<ProcedureProfile>,
    /// One-way cost of a cross-host message.
    pub network_latency_ns: i64,
    /// Uniform jitter added to every latency, in `0..=jitter_ns`.
    pub jitter_ns: i64,
}

impl WorkloadProfile {
    /// Background local traffic on every partition plus one hot partition
    /// (the first partition of the last host) driven from the first host.
    pub fn skewed(hosts: &[HostId], partitions_per_host: usize) -> Self {
        let partitions: Vec<PartitionId> = hosts
            .iter()
            .flat_map(|host| (1..=partitions_per_host as u64).map(move |offset| host + offset))
            .collect();
        let first = hosts.first().copied().unwrap_or_default();
        let last = hosts.last().copied().unwrap_or_default();
        let hot = last + 1;

        let mut procedures = vec![
            ProcedureProfile {
                name: "Lookup".to_string(),
                weight: 3,
                partitions: partitions.clone(),
                single_partition: true,
                initiator: Initiator::FollowPartition,
                base_latency_ns: 2_000_000,
            },
            ProcedureProfile {
                name: "Checkout".to_string(),
                weight: 6,
                partitions: vec![hot],
                single_partition: true,
                initiator: Initiator::Home {
                    host: first,
                    affinity: 0.95,
                },
                base_latency_ns: 2_000_000,
            },
        ];
        if partitions.len() > 1 {
            procedures.push(ProcedureProfile {
                name: "Audit".to_string(),
                weight: 1,
                partitions: partitions.iter().copied().take(2).collect(),
                single_partition: false,
                initiator: Initiator::Home {
                    host: first,
                    affinity: 0.8,
                },
                base_latency_ns: 4_000_000,
            });
        }
        Self {
            procedures,
            network_latency_ns: 10_000_000,
            jitter_ns: 500_000,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.procedures.is_empty(), "workload has no procedures");
        anyhow::ensure!(
            self.procedures.iter().any(|p| p.weight > 0),
            "workload has no procedure with a positive weight"
        );
        for procedure in &self.procedures {
            anyhow::ensure!(
                !procedure.partitions.is_empty(),
                "procedure {} touches no partitions",
                procedure.name
            );
            if let Initiator::Home { affinity, .. } = procedure.initiator {
                anyhow::ensure!(
                    (0.0..=1.0).contains(&affinity),
                    "procedure {} affinity must be within [0, 1] (got {affinity})",
                    procedure.name
                );
            }
        }
        anyhow::ensure!(self.network_latency_ns >= 0, "network latency must be >= 0");
        anyhow::ensure!(self.jitter_ns >= 0, "jitter must be >= 0");
        Ok(())
    }
}

pub struct WorkloadGenerator {
    rng: SmallRng,
    profile: WorkloadProfile,
    total_weight: u32,
    next_txn_id: u64,
    /// Logical clock for message timestamps.
    clock_ns: i64,
}

impl WorkloadGenerator {
    pub fn new(profile: WorkloadProfile, seed: u64) -> anyhow::Result<Self> {
        profile.validate()?;
        let total_weight = profile.procedures.iter().map(|p| p.weight).sum();
        Ok(Self {
            rng: SmallRng::seed_from_u64(seed),
            profile,
            total_weight,
            next_txn_id: 1,
            clock_ns: 0,
        })
    }

    pub fn generated(&self) -> u64 {
        self.next_txn_id - 1
    }

    /// Generate `count` records against `topology`. Records touching a
    /// partition with no up site are not produced.
    pub fn next_records(&mut self, count: usize, topology: &TopologySnapshot) -> Vec<TxnRecord> {
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(record) = self.next_record(topology) {
                records.push(record);
            }
        }
        records
    }

    pub fn next_record(&mut self, topology: &TopologySnapshot) -> Option<TxnRecord> {
        let procedure = self.pick_procedure().clone();
        let hosts: Vec<HostId> = topology.hosts().iter().copied().collect();
        if hosts.is_empty() {
            return None;
        }

        let touched: Vec<PartitionId> = if procedure.single_partition {
            let idx = self.rng.gen_range(0..procedure.partitions.len());
            vec![procedure.partitions[idx]]
        } else {
            procedure.partitions.clone()
        };
        let mut placed = Vec::with_capacity(touched.len());
        for partition in &touched {
            let site = topology.up_sites_for(*partition).next()?;
            placed.push((*partition, site.site, site.host));
        }

        let initiator_host = match &procedure.initiator {
            Initiator::FollowPartition => placed[0].2,
            Initiator::Home { host, affinity } => {
                if self.rng.gen_bool(*affinity) {
                    *host
                } else {
                    hosts[self.rng.gen_range(0..hosts.len())]
                }
            }
        };
        let initiator_site = initiator_site(topology, initiator_host);

        let start_ns = self.clock_ns;
        let network = self.profile.network_latency_ns;
        let mut messages = Vec::new();
        let mut remote_hops = 0i64;
        for (_, site, host) in &placed {
            if *host == initiator_host {
                continue;
            }
            remote_hops += 1;
            messages.push(MessageStats {
                sender_site: initiator_site,
                receiver_site: *site,
                send_time_ns: start_ns,
                receive_time_ns: start_ns + network,
            });
        }

        let (coordinator_site, partition) = if procedure.single_partition {
            (placed[0].1, Some(placed[0].0))
        } else {
            (initiator_site, None)
        };
        let jitter = if self.profile.jitter_ns > 0 {
            self.rng.gen_range(0..=self.profile.jitter_ns)
        } else {
            0
        };
        let latency_ns = procedure.base_latency_ns + remote_hops * network + jitter;

        let txn_id = self.next_txn_id;
        self.next_txn_id += 1;
        self.clock_ns += latency_ns;

        Some(TxnRecord {
            txn_id,
            procedure: procedure.name,
            is_single_partition: procedure.single_partition,
            partition,
            initiator_host,
            initiator_site,
            coordinator_site,
            latency_ns,
            messages,
        })
    }

    fn pick_procedure(&mut self) -> &ProcedureProfile {
        let mut ticket = self.rng.gen_range(0..self.total_weight);
        for procedure in &self.profile.procedures {
            if ticket < procedure.weight {
                return procedure;
            }
            ticket -= procedure.weight;
        }
        // Weights sum to total_weight, so the loop always returns.
        &self.profile.procedures[0]
    }
}

/// The initiator runs on the lowest-numbered up site of its host, or site 0
/// when the host has none.
fn initiator_site(topology: &TopologySnapshot, host: HostId) -> SiteId {
    topology
        .sites_on_host(host)
        .filter(|info| info.up)
        .map(|info| info.site)
        .min()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ClusterLayout;

    fn layout() -> ClusterLayout {
        ClusterLayout {
            hosts: 2,
            partitions_per_host: 2,
            spare_sites_per_host: 1,
        }
    }

    fn generator(seed: u64) -> WorkloadGenerator {
        let layout = layout();
        WorkloadGenerator::new(
            WorkloadProfile::skewed(&layout.host_ids(), layout.partitions_per_host),
            seed,
        )
        .expect("valid profile")
    }

    #[test]
    fn same_seed_same_records() {
        let topology = layout().initial_topology();
        let a = generator(9).next_records(200, &topology);
        let b = generator(9).next_records(200, &topology);
        assert_eq!(a, b);
        assert_eq!(a.len(), 200);
    }

    #[test]
    fn remote_work_pays_network_latency() {
        let topology = layout().initial_topology();
        let mut generator = generator(1);
        let records = generator.next_records(500, &topology);
        assert_eq!(generator.generated(), 500);

        for record in &records {
            let hops = record.messages.len() as i64;
            assert!(record.latency_ns >= 2_000_000 + hops * 10_000_000, "{record:?}");
            for message in &record.messages {
                assert_ne!(topology.host_of_site(message.receiver_site), Some(record.initiator_host));
            }
            if record.procedure == "Lookup" {
                assert!(record.messages.is_empty());
                assert_eq!(topology.host_of_site(record.coordinator_site), Some(record.initiator_host));
            }
        }
        let remote_checkouts = records
            .iter()
            .filter(|r| r.procedure == "Checkout" && r.initiator_host == 100)
            .count();
        assert!(remote_checkouts > 0);
        assert!(records
            .iter()
            .filter(|r| r.procedure == "Checkout" && r.initiator_host == 100)
            .all(|r| r.partition == Some(201) && r.messages.len() == 1));
    }

    #[test]
    fn partitions_without_live_sites_produce_nothing() {
        let mut topology = layout().initial_topology();
        for site in 1..=6 {
            topology.set_site_up(site, false);
        }
        assert!(generator(3).next_records(50, &topology).is_empty());
    }

    #[test]
    fn rejects_bad_affinity() {
        let mut profile = WorkloadProfile::skewed(&[100, 200], 2);
        profile.procedures[1].initiator = Initiator::Home {
            host: 100,
            affinity: 1.5,
        };
        assert!(WorkloadGenerator::new(profile, 0).is_err());
    }
}
