//! Schedule graphs bounding the execution time of a workload sample.
//!
//! A graph is a chain of nodes built on two assumptions:
//! - single-partition transactions on different partitions run concurrently
//! - a multi-partition transaction blocks every other transaction
//!
//! `SerialNode`s hold one transaction group and occupy the chain
//! exclusively. `ConcurrentNode`s hold one serial chain per partition, run in
//! parallel. Nodes live in an arena and link by index.

use std::collections::BTreeMap;

use crate::stats::{GroupId, PartitionScope, WorkloadSample};
use crate::types::PartitionId;

/// Index of a node in a graph's arena.
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeChain {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl NodeChain {
    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    pub fn tail(&self) -> Option<NodeId> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Serial(GroupId),
    Concurrent(BTreeMap<PartitionId, NodeChain>),
}

#[derive(Debug, Clone)]
pub struct ScheduleNode {
    pub kind: NodeKind,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
}

/// Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct ScheduleGraph {
    nodes: Vec<ScheduleNode>,
    chain: NodeChain,
}

impl ScheduleGraph {
    /// Lowest-time ordering: all single-partition groups in one concurrent
    /// block (serial per partition), then every multi-partition group in
    /// sample order.
    pub fn best_case(sample: &WorkloadSample) -> Self {
        let mut graph = GraphBuilder::default();
        let single = sample.single_partition_groups();
        if !single.is_empty() {
            let block = graph.push_concurrent();
            for &group in single {
                graph.push_into_concurrent(block, sample, group);
            }
        }
        for &group in sample.multi_partition_groups() {
            graph.push_serial(group);
        }
        graph.finish()
    }

    /// Highest-time ordering: groups sorted by descending median latency and
    /// strictly interleaved single/multi. Leftover single-partition groups get
    /// one concurrent block each; leftover multi-partition groups stay serial.
    pub fn worst_case(sample: &WorkloadSample) -> Self {
        let single = sorted_by_median_desc(sample, sample.single_partition_groups());
        let multi = sorted_by_median_desc(sample, sample.multi_partition_groups());

        let mut graph = GraphBuilder::default();
        let paired = single.len().min(multi.len());
        for idx in 0..paired {
            graph.push_serial(single[idx]);
            graph.push_serial(multi[idx]);
        }
        for &group in &single[paired..] {
            let block = graph.push_concurrent();
            graph.push_into_concurrent(block, sample, group);
        }
        for &group in &multi[paired..] {
            graph.push_serial(group);
        }
        graph.finish()
    }

    pub fn chain(&self) -> NodeChain {
        self.chain
    }

    pub fn node(&self, id: NodeId) -> &ScheduleNode {
        &self.nodes[id]
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Walk the top-level chain from head to tail.
    pub fn iter(&self) -> ChainIter<'_> {
        self.iter_chain(self.chain)
    }

    pub fn iter_chain(&self, chain: NodeChain) -> ChainIter<'_> {
        ChainIter {
            graph: self,
            next: chain.head,
        }
    }

    /// Total execution time given each group's latency (already multiplied
    /// by its transaction count). A serial node adds its group's cost; a
    /// concurrent node adds the cost of its slowest partition chain.
    pub fn total_time<F>(&self, group_cost: F) -> f64
    where
        F: Fn(GroupId) -> f64,
    {
        self.iter()
            .map(|(_, node)| match &node.kind {
                NodeKind::Serial(group) => group_cost(*group),
                NodeKind::Concurrent(chains) => chains
                    .values()
                    .map(|chain| self.chain_time(*chain, &group_cost))
                    .fold(0.0, f64::max),
            })
            .sum()
    }

    fn chain_time<F>(&self, chain: NodeChain, group_cost: &F) -> f64
    where
        F: Fn(GroupId) -> f64,
    {
        self.iter_chain(chain)
            .map(|(_, node)| match &node.kind {
                NodeKind::Serial(group) => group_cost(*group),
                // Partition chains only ever hold serial nodes.
                NodeKind::Concurrent(_) => 0.0,
            })
            .sum()
    }
}

pub struct ChainIter<'a> {
    graph: &'a ScheduleGraph,
    next: Option<NodeId>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = (NodeId, &'a ScheduleNode);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let node = &self.graph.nodes[id];
        self.next = node.next;
        Some((id, node))
    }
}

#[derive(Default)]
struct GraphBuilder {
    nodes: Vec<ScheduleNode>,
    chain: NodeChain,
}

impl GraphBuilder {
    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(ScheduleNode {
            kind,
            prev: None,
            next: None,
        });
        id
    }

    fn link(nodes: &mut [ScheduleNode], chain: &mut NodeChain, id: NodeId) {
        match chain.tail {
            Some(tail) => {
                nodes[tail].next = Some(id);
                nodes[id].prev = Some(tail);
            }
            None => chain.head = Some(id),
        }
        chain.tail = Some(id);
        chain.len += 1;
    }

    fn push_serial(&mut self, group: GroupId) -> NodeId {
        let id = self.alloc(NodeKind::Serial(group));
        Self::link(&mut self.nodes, &mut self.chain, id);
        id
    }

    fn push_concurrent(&mut self) -> NodeId {
        let id = self.alloc(NodeKind::Concurrent(BTreeMap::new()));
        Self::link(&mut self.nodes, &mut self.chain, id);
        id
    }

    /// Append a single-partition group to its partition's chain in `block`.
    fn push_into_concurrent(&mut self, block: NodeId, sample: &WorkloadSample, group: GroupId) {
        let PartitionScope::Single(partition) = sample.group(group).key().scope() else {
            debug_assert!(false, "only single-partition groups run concurrently");
            return;
        };
        let mut chain = match &self.nodes[block].kind {
            NodeKind::Concurrent(chains) => chains.get(&partition).copied().unwrap_or_default(),
            NodeKind::Serial(_) => return,
        };
        let id = self.alloc(NodeKind::Serial(group));
        Self::link(&mut self.nodes, &mut chain, id);
        if let NodeKind::Concurrent(chains) = &mut self.nodes[block].kind {
            chains.insert(partition, chain);
        }
    }

    fn finish(self) -> ScheduleGraph {
        ScheduleGraph {
            nodes: self.nodes,
            chain: self.chain,
        }
    }
}

fn sorted_by_median_desc(sample: &WorkloadSample, groups: &[GroupId]) -> Vec<GroupId> {
    let mut sorted = groups.to_vec();
    // Stable sort keeps sample order among equal medians.
    sorted.sort_by_key(|&group| {
        std::cmp::Reverse(
            sample
                .group(group)
                .latency()
                .map(|latency| latency.observed_median_ns)
                .unwrap_or(0),
        )
    });
    sorted
}
