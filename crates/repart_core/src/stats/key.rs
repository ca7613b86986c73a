use std::fmt;
use std::sync::Arc;

use crate::types::{HostId, PartitionId};

/// Which partitions a transaction group touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionScope {
    Single(PartitionId),
    /// Multi-partition transactions always touch every partition.
    Every,
}

/// Identity of a transaction group: procedure, initiator host and partition
/// scope.
///
/// Immutable value type. The procedure name is shared (`Arc<str>`), so
/// cloning a key never copies the string; `WorkloadSample` interns names so
/// equal procedures share one allocation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnGroupKey {
    procedure: Arc<str>,
    initiator_host: HostId,
    scope: PartitionScope,
}

impl TxnGroupKey {
    pub fn single(procedure: Arc<str>, initiator_host: HostId, partition: PartitionId) -> Self {
        Self {
            procedure,
            initiator_host,
            scope: PartitionScope::Single(partition),
        }
    }

    pub fn every(procedure: Arc<str>, initiator_host: HostId) -> Self {
        Self {
            procedure,
            initiator_host,
            scope: PartitionScope::Every,
        }
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn initiator_host(&self) -> HostId {
        self.initiator_host
    }

    pub fn scope(&self) -> PartitionScope {
        self.scope
    }

    pub fn is_single_partition(&self) -> bool {
        matches!(self.scope, PartitionScope::Single(_))
    }

    pub fn partition(&self) -> Option<PartitionId> {
        match self.scope {
            PartitionScope::Single(partition) => Some(partition),
            PartitionScope::Every => None,
        }
    }
}

impl fmt::Display for TxnGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            PartitionScope::Single(partition) => write!(
                f,
                "{}@{}/p{}",
                self.procedure, self.initiator_host, partition
            ),
            PartitionScope::Every => write!(f, "{}@{}/all", self.procedure, self.initiator_host),
        }
    }
}
