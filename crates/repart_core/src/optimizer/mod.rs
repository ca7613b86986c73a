//! Partition placement optimizer.
//!
//! `PlacementModel` formulates the problem; `PlacementOptimizer` solves it
//! exactly with depth-first branch-and-bound over the partition-to-host
//! assignment:
//! - constraint 1 holds by construction (one host per partition)
//! - capacity and migration-size constraints prune infeasible branches
//! - the objective over a partial assignment is an admissible lower bound
//!
//! The current placement seeds the incumbent when it is feasible, so a
//! returned estimate never exceeds the current one. `max_search_nodes` caps
//! the search; a capped search returns the best placement found so far.

use std::collections::BTreeSet;

use crate::stats::WorkloadSample;
use crate::types::HostId;

mod model;
mod placement;

pub use model::{estimated_execution_time, PlacementModel};
pub use placement::Placement;

/// Relative improvement below which a candidate does not replace the incumbent.
const IMPROVEMENT_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptimizerLimits {
    /// Capacity of every host, in partitions.
    pub max_partitions_per_host: usize,
    /// Partitions that may change host relative to the input placement.
    pub max_partitions_moved: usize,
    /// Branch-and-bound node budget per solve. 0 means unbounded.
    pub max_search_nodes: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlacementResult {
    /// Candidate assignment; every host of the input appears, possibly empty.
    pub host_to_partitions: Placement,
    /// Objective value of the candidate (weighted best/worst schedule time).
    pub estimated_execution_time: f64,
    /// Partitions whose host differs from the input placement.
    pub partitions_moved: usize,
    /// False when the node budget ran out before the search space was exhausted.
    pub exhaustive: bool,
    /// Search nodes expanded, for logs and tuning `max_search_nodes`.
    pub nodes_explored: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct PlacementOptimizer {
    limits: OptimizerLimits,
}

impl PlacementOptimizer {
    pub fn new(limits: OptimizerLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> OptimizerLimits {
        self.limits
    }

    /// Minimize the weighted best/worst execution time over placements of the
    /// partitions in `current` onto `hosts` (plus the hosts `current` names).
    ///
    /// Returns `None` when no placement satisfies the capacity and migration
    /// constraints. The sample must be reconciled.
    pub fn find_optimum_partitioning(
        &self,
        sample: &WorkloadSample,
        current: &Placement,
        hosts: &BTreeSet<HostId>,
    ) -> Option<PlacementResult> {
        let model = PlacementModel::new(sample, current, hosts.iter().copied());
        let mut search = Search::new(&model, current, self.limits);
        search.run();

        let Search {
            incumbent,
            nodes,
            truncated,
            ..
        } = search;
        let (assignment, objective) = incumbent?;
        let host_to_partitions = model.decode(&assignment);
        let partitions_moved = current.moved_count(&host_to_partitions);
        tracing::debug!(
            partitions = model.partitions().len(),
            hosts = model.hosts().len(),
            nodes,
            truncated,
            objective,
            partitions_moved,
            "placement search finished"
        );
        Some(PlacementResult {
            host_to_partitions,
            estimated_execution_time: objective,
            partitions_moved,
            exhaustive: !truncated,
            nodes_explored: nodes,
        })
    }
}

struct Search<'a> {
    model: &'a PlacementModel,
    limits: OptimizerLimits,
    /// Host index each partition currently occupies.
    home: Vec<Option<usize>>,
    /// Partition indices in branching order.
    order: Vec<usize>,
    /// Candidate host indices per partition, best first.
    choices: Vec<Vec<usize>>,
    assignment: Vec<Option<usize>>,
    load: Vec<usize>,
    moved: usize,
    incumbent: Option<(Vec<Option<usize>>, f64)>,
    nodes: u64,
    truncated: bool,
}

impl<'a> Search<'a> {
    fn new(model: &'a PlacementModel, current: &Placement, limits: OptimizerLimits) -> Self {
        let home = model.assignment_of(current);
        let n_partitions = model.partitions().len();
        let n_hosts = model.hosts().len();

        let affinity: Vec<Vec<f64>> = (0..n_partitions).map(|p| model.affinity(p)).collect();
        let mut order: Vec<usize> = (0..n_partitions).collect();
        // Heaviest partitions first: their placement moves the bound most.
        order.sort_by(|a, b| {
            let mass = |p: usize| affinity[p].iter().sum::<f64>();
            mass(*b).total_cmp(&mass(*a)).then(a.cmp(b))
        });
        let choices = (0..n_partitions)
            .map(|p| {
                let mut hosts: Vec<usize> = (0..n_hosts).collect();
                hosts.sort_by(|a, b| {
                    let stays = |h: usize| home[p] == Some(h);
                    stays(*b)
                        .cmp(&stays(*a))
                        .then(affinity[p][*b].total_cmp(&affinity[p][*a]))
                        .then(a.cmp(b))
                });
                hosts
            })
            .collect();

        let mut search = Self {
            model,
            limits,
            home,
            order,
            choices,
            assignment: vec![None; n_partitions],
            load: vec![0; n_hosts],
            moved: 0,
            incumbent: None,
            nodes: 0,
            truncated: false,
        };
        search.seed_with_current();
        search
    }

    fn seed_with_current(&mut self) {
        if self.home.iter().any(Option::is_none) {
            return;
        }
        let mut load = vec![0usize; self.load.len()];
        for host in self.home.iter().flatten() {
            load[*host] += 1;
        }
        if load.iter().any(|l| *l > self.limits.max_partitions_per_host) {
            return;
        }
        let objective = self.model.objective(&self.home);
        self.incumbent = Some((self.home.clone(), objective));
    }

    fn run(&mut self) {
        let n_partitions = self.assignment.len();
        if n_partitions > self.load.len() * self.limits.max_partitions_per_host {
            return;
        }
        self.branch(0);
    }

    fn branch(&mut self, depth: usize) {
        if self.truncated {
            return;
        }
        self.nodes += 1;
        if self.limits.max_search_nodes > 0 && self.nodes > self.limits.max_search_nodes {
            self.truncated = true;
            return;
        }

        let bound = self.model.objective(&self.assignment);
        if let Some((_, best)) = &self.incumbent {
            if bound >= *best - best.abs() * IMPROVEMENT_EPSILON {
                return;
            }
        }
        if depth == self.order.len() {
            self.incumbent = Some((self.assignment.clone(), bound));
            return;
        }

        let partition = self.order[depth];
        for slot in 0..self.choices[partition].len() {
            let host = self.choices[partition][slot];
            if self.load[host] >= self.limits.max_partitions_per_host {
                continue;
            }
            let moves = usize::from(self.home[partition] != Some(host));
            if self.moved + moves > self.limits.max_partitions_moved {
                continue;
            }
            self.assignment[partition] = Some(host);
            self.load[host] += 1;
            self.moved += moves;
            self.branch(depth + 1);
            self.moved -= moves;
            self.load[host] -= 1;
            self.assignment[partition] = None;
            if self.truncated {
                return;
            }
        }
    }
}
