//! Shared identifiers and collaborator contracts.
//!
//! The controller never talks to the rest of the cluster directly: topology
//! reads, partition copies and fault reports all go through the traits below
//! so the execution layer (or a simulation) can supply them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::topology::TopologySnapshot;

/// Physical host identifier.
pub type HostId = u64;
/// Execution site identifier (one partition replica on one host).
pub type SiteId = u64;
/// Partition identifier, the unit of placement.
pub type PartitionId = u64;

/// One live partition copy: move `partition` from `src_site` on `src_host`
/// onto the (currently down) `dest_site` on `dest_host`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MoveRequest {
    pub partition: PartitionId,
    /// Host currently serving the partition.
    pub src_host: HostId,
    /// Up site copied from; reported failed once the run completes.
    pub src_site: SiteId,
    pub dest_host: HostId,
    /// Down site copied into; also the identity of the ack.
    pub dest_site: SiteId,
}

/// Completion signal for one dispatched move. Identity only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MoveAck {
    pub dest_site: SiteId,
}

/// Read access to the catalog/topology collaborator.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Whether the cluster has finished initializing.
    async fn is_initialized(&self) -> bool;

    /// Current hosts, sites, site->partition and site up/down flags.
    async fn snapshot(&self) -> anyhow::Result<TopologySnapshot>;
}

/// The stop-and-copy executor. Dispatch is fire-and-forget; completion comes
/// back to the controller as a `MoveDone` message.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    async fn start_move(&self, request: MoveRequest) -> anyhow::Result<()>;
}

/// Fault-reporting collaborator used to retire superseded source sites.
#[async_trait]
pub trait FaultReporter: Send + Sync {
    async fn report_site_failed(&self, host: HostId, site: SiteId) -> anyhow::Result<()>;
}
