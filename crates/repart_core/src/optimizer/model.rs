//! Integer-program formulation of the placement problem.
//!
//! Binary `p[i][j]` is expressed as `assignment[i] = Some(j)`: partition
//! index `i` on host index `j`. Each group's latency variable is a function of
//! the assignment:
//! - single-partition: `n*local + n*penalty(partition) * [host(partition) != initiator]`
//! - multi-partition: `n*local + max_p n*penalty(p) * [host(p) != initiator]`
//!
//! `best` and `worst` are the schedule-graph totals over those variables and
//! the objective is `prob*best + (1 - prob)*worst`.

use std::collections::BTreeSet;

use crate::optimizer::Placement;
use crate::schedule::ScheduleGraph;
use crate::stats::{GroupId, PartitionScope, WorkloadSample};
use crate::types::{HostId, PartitionId};

#[derive(Debug, Clone)]
enum Penalty {
    /// Partition index, or `None` when the partition is not placed anywhere.
    Single { partition: Option<usize>, cost: f64 },
    /// Cost per partition index.
    Every { costs: Vec<f64> },
}

#[derive(Debug, Clone)]
struct GroupTerm {
    base: f64,
    initiator: Option<usize>,
    penalty: Penalty,
}

/// Placement problem built from one reconciled `WorkloadSample`.
#[derive(Debug, Clone)]
pub struct PlacementModel {
    hosts: Vec<HostId>,
    partitions: Vec<PartitionId>,
    terms: Vec<GroupTerm>,
    best: ScheduleGraph,
    worst: ScheduleGraph,
    best_case_probability: f64,
}

impl PlacementModel {
    /// Index every host in `hosts` and `current`, and every partition
    /// `current` places. The sample must be reconciled.
    pub fn new(
        sample: &WorkloadSample,
        current: &Placement,
        hosts: impl IntoIterator<Item = HostId>,
    ) -> Self {
        let hosts: Vec<HostId> = hosts
            .into_iter()
            .chain(current.hosts())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let partitions: Vec<PartitionId> = current.partitions().into_iter().collect();

        let terms = sample
            .groups()
            .map(|(_, group)| {
                let key = group.key();
                let n = group.transactions() as f64;
                let Some(latency) = group.latency() else {
                    debug_assert!(false, "sample must be reconciled before modeling");
                    return GroupTerm {
                        base: 0.0,
                        initiator: None,
                        penalty: Penalty::Every {
                            costs: vec![0.0; partitions.len()],
                        },
                    };
                };
                let penalty = match key.scope() {
                    PartitionScope::Single(partition) => Penalty::Single {
                        partition: partitions.binary_search(&partition).ok(),
                        cost: n * latency.remote_penalty(partition).value_ns as f64,
                    },
                    PartitionScope::Every => Penalty::Every {
                        costs: partitions
                            .iter()
                            .map(|p| n * latency.remote_penalty(*p).value_ns as f64)
                            .collect(),
                    },
                };
                GroupTerm {
                    base: n * latency.local.value_ns as f64,
                    initiator: hosts.binary_search(&key.initiator_host()).ok(),
                    penalty,
                }
            })
            .collect();

        Self {
            hosts,
            partitions,
            terms,
            best: ScheduleGraph::best_case(sample),
            worst: ScheduleGraph::worst_case(sample),
            best_case_probability: sample.best_case_probability(),
        }
    }

    pub fn hosts(&self) -> &[HostId] {
        &self.hosts
    }

    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    pub fn host_index(&self, host: HostId) -> Option<usize> {
        self.hosts.binary_search(&host).ok()
    }

    /// Assignment vector for `placement`; partitions it does not place are
    /// left unassigned.
    pub fn assignment_of(&self, placement: &Placement) -> Vec<Option<usize>> {
        let by_partition = placement.by_partition();
        self.partitions
            .iter()
            .map(|p| by_partition.get(p).and_then(|host| self.host_index(*host)))
            .collect()
    }

    pub fn decode(&self, assignment: &[Option<usize>]) -> Placement {
        let mut placement = Placement::new();
        for (idx, host) in assignment.iter().enumerate() {
            if let Some(host) = host {
                placement.insert(self.hosts[*host], self.partitions[idx]);
            }
        }
        placement
    }

    /// Objective under `assignment`. Unassigned partitions are costed as if
    /// co-located with every initiator, so over a partial assignment this is
    /// a lower bound on every completion.
    pub fn objective(&self, assignment: &[Option<usize>]) -> f64 {
        let costs: Vec<f64> = self
            .terms
            .iter()
            .map(|term| group_cost(term, assignment))
            .collect();
        self.objective_from_costs(&costs)
    }

    /// Sum of penalty mass each host would save by holding `partition`,
    /// indexed like `hosts()`. Used to order the search.
    pub(crate) fn affinity(&self, partition: usize) -> Vec<f64> {
        let mut affinity = vec![0.0; self.hosts.len()];
        for term in &self.terms {
            let Some(initiator) = term.initiator else {
                continue;
            };
            affinity[initiator] += match &term.penalty {
                Penalty::Single {
                    partition: Some(p),
                    cost,
                } if *p == partition => *cost,
                Penalty::Every { costs } => costs[partition],
                Penalty::Single { .. } => 0.0,
            };
        }
        affinity
    }

    fn objective_from_costs(&self, costs: &[f64]) -> f64 {
        let cost = |group: GroupId| costs[group];
        let prob = self.best_case_probability;
        prob * self.best.total_time(cost) + (1.0 - prob) * self.worst.total_time(cost)
    }
}

fn group_cost(term: &GroupTerm, assignment: &[Option<usize>]) -> f64 {
    let remote = |partition: Option<usize>| -> bool {
        match (term.initiator, partition.and_then(|p| assignment[p])) {
            (None, _) => true,
            (Some(_), None) => partition.is_none(),
            (Some(initiator), Some(host)) => host != initiator,
        }
    };
    match &term.penalty {
        Penalty::Single { partition, cost } => {
            if remote(*partition) {
                term.base + cost
            } else {
                term.base
            }
        }
        Penalty::Every { costs } => {
            let max = costs
                .iter()
                .enumerate()
                .filter(|(idx, _)| remote(Some(*idx)))
                .map(|(_, cost)| *cost)
                .fold(0.0, f64::max);
            term.base + max
        }
    }
}

/// Objective value of `placement` for `sample` (reconciled): the weighted
/// best/worst schedule estimate the optimizer minimizes.
pub fn estimated_execution_time(sample: &WorkloadSample, placement: &Placement) -> f64 {
    let model = PlacementModel::new(sample, placement, placement.hosts());
    model.objective(&model.assignment_of(placement))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Locality;

    fn placement(pairs: &[(HostId, PartitionId)]) -> Placement {
        pairs.iter().copied().collect()
    }

    #[test]
    fn single_partition_group_pays_penalty_only_when_remote() {
        let mut sample = WorkloadSample::default();
        let key = sample.single_partition_key("Proc1", 100, 101);
        for _ in 0..4 {
            sample.record_transaction(&key, 10, Locality::Local);
        }
        sample.reconcile();

        // local 10, remote 20 -> penalty 10, n = 4
        let local = placement(&[(100, 101), (200, 201)]);
        let remote = placement(&[(200, 101), (100, 201)]);
        assert_eq!(estimated_execution_time(&sample, &local), 40.0);
        assert_eq!(estimated_execution_time(&sample, &remote), 80.0);
    }

    #[test]
    fn multi_partition_group_pays_slowest_remote_partition() {
        let mut sample = WorkloadSample::default();
        let key = sample.multi_partition_key("Proc3", 100);
        sample.record_transaction(&key, 10, Locality::Local);
        sample.record_remote_partition_latency(&key, 201, 7, false);
        sample.record_remote_partition_latency(&key, 202, 15, false);
        sample.reconcile();

        let p = placement(&[(100, 101), (200, 201), (200, 202)]);
        assert_eq!(estimated_execution_time(&sample, &p), 25.0);
        let p = placement(&[(100, 101), (100, 202), (200, 201)]);
        assert_eq!(estimated_execution_time(&sample, &p), 17.0);
    }

    #[test]
    fn unplaced_partition_and_unknown_initiator_are_remote() {
        let mut sample = WorkloadSample::default();
        let orphan = sample.single_partition_key("Proc1", 100, 999);
        sample.record_transaction(&orphan, 10, Locality::Local);
        let stranger = sample.single_partition_key("Proc2", 700, 101);
        sample.record_transaction(&stranger, 10, Locality::Local);
        sample.reconcile();

        let p = placement(&[(100, 101)]);
        // Both groups sit on different partitions: max(20, 20).
        assert_eq!(estimated_execution_time(&sample, &p), 20.0);
    }

    #[test]
    fn partial_assignment_bounds_completions_from_below() {
        let mut sample = WorkloadSample::default();
        let a = sample.single_partition_key("Proc1", 100, 101);
        let b = sample.multi_partition_key("Proc3", 200);
        sample.record_transaction(&a, 10, Locality::Local);
        sample.record_transaction(&b, 30, Locality::Local);
        sample.reconcile();

        let current = placement(&[(100, 101), (200, 201)]);
        let model = PlacementModel::new(&sample, &current, [100, 200]);
        let bound = model.objective(&[None, Some(1)]);
        for host in 0..2 {
            assert!(model.objective(&[Some(host), Some(1)]) >= bound);
        }
        assert_eq!(model.decode(&[Some(1), Some(0)]), placement(&[(200, 101), (100, 201)]));
    }
}
