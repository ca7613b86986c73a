//! Turning a placement decision into live partition copies.
//!
//! A run moves through three steps:
//! 1. `plan`: diff current vs target placement into `(source, destination)`
//!    site pairs; pairs with no usable site are skipped and reported
//! 2. `execute`: dispatch each move to the executor; completion arrives later
//!    as one `MoveAck` per move
//! 3. `on_all_complete`: once every dispatched move is acknowledged, report
//!    each superseded source site as failed to finalize the cutover

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::optimizer::Placement;
use crate::topology::{SiteInfo, TopologySnapshot};
use crate::types::{FaultReporter, HostId, MigrationExecutor, MoveAck, MoveRequest, PartitionId, SiteId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The target placement does not place the partition anywhere.
    NotInTarget,
    /// No down site left on the destination host.
    NoDestinationSite,
    /// No up site holds the partition outside the destination host.
    NoSourceSite,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::NotInTarget => "partition missing from target placement",
            SkipReason::NoDestinationSite => "no down site available on destination host",
            SkipReason::NoSourceSite => "no live source site",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkippedMove {
    pub partition: PartitionId,
    pub dest_host: Option<HostId>,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    pub moves: Vec<MoveRequest>,
    pub skipped: Vec<SkippedMove>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

/// Diff `current` against `target` into move requests, ordered by partition.
///
/// Partitions that already have a live site on their destination host need no
/// copy. Destination sites prefer a down site already mapped to the partition,
/// then an unmapped one, then any other down site; a site is used at most once.
pub fn plan(current: &Placement, target: &Placement, topology: &TopologySnapshot) -> MigrationPlan {
    let mut result = MigrationPlan::default();
    let mut claimed: BTreeSet<SiteId> = BTreeSet::new();

    for (partition, from_host, dest_host) in current.moves_to(target) {
        let Some(dest_host) = dest_host else {
            skip(&mut result, partition, None, SkipReason::NotInTarget);
            continue;
        };
        if topology.live_site_on_host(dest_host, partition).is_some() {
            tracing::debug!(partition, dest_host, "partition already live on destination host");
            continue;
        }

        let dest_site = topology
            .down_sites_on_host(dest_host)
            .filter(|info| !claimed.contains(&info.site))
            .min_by_key(|info| destination_rank(info, partition));
        let Some(dest_site) = dest_site.map(|info| info.site) else {
            skip(&mut result, partition, Some(dest_host), SkipReason::NoDestinationSite);
            continue;
        };

        let source = topology
            .up_sites_for(partition)
            .filter(|info| info.host != dest_host)
            .min_by_key(|info| (info.host != from_host, info.site));
        let Some(source) = source else {
            skip(&mut result, partition, Some(dest_host), SkipReason::NoSourceSite);
            continue;
        };

        claimed.insert(dest_site);
        result.moves.push(MoveRequest {
            partition,
            src_host: source.host,
            src_site: source.site,
            dest_host,
            dest_site,
        });
    }
    result
}

fn destination_rank(info: &SiteInfo, partition: PartitionId) -> (u8, SiteId) {
    let rank = match info.partition {
        Some(p) if p == partition => 0,
        None => 1,
        Some(_) => 2,
    };
    (rank, info.site)
}

fn skip(plan: &mut MigrationPlan, partition: PartitionId, dest_host: Option<HostId>, reason: SkipReason) {
    tracing::warn!(partition, dest_host = ?dest_host, %reason, "skipping partition move");
    plan.skipped.push(SkippedMove {
        partition,
        dest_host,
        reason,
    });
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Progress { remaining: usize },
    Complete,
    /// Not an outstanding move of this run (unknown or duplicate).
    Ignored,
}

/// One in-flight migration. Outstanding moves are keyed by destination site.
#[derive(Debug, Clone)]
pub struct MigrationRun {
    plan: MigrationPlan,
    outstanding: BTreeMap<SiteId, MoveRequest>,
    completed: Vec<MoveRequest>,
}

impl MigrationRun {
    pub fn new(plan: MigrationPlan) -> Self {
        Self {
            plan,
            outstanding: BTreeMap::new(),
            completed: Vec::new(),
        }
    }

    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Dispatch every planned move. Moves the executor rejects are logged and
    /// dropped; returns how many were dispatched.
    pub async fn execute(&mut self, executor: &dyn MigrationExecutor) -> usize {
        for request in self.plan.moves.clone() {
            match executor.start_move(request).await {
                Ok(()) => {
                    tracing::info!(
                        partition = request.partition,
                        src_host = request.src_host,
                        src_site = request.src_site,
                        dest_host = request.dest_host,
                        dest_site = request.dest_site,
                        "dispatched partition move"
                    );
                    self.outstanding.insert(request.dest_site, request);
                }
                Err(err) => {
                    tracing::warn!(
                        partition = request.partition,
                        dest_site = request.dest_site,
                        error = ?err,
                        "failed to dispatch partition move"
                    );
                }
            }
        }
        self.outstanding.len()
    }

    pub fn on_ack(&mut self, ack: MoveAck) -> AckOutcome {
        let Some(request) = self.outstanding.remove(&ack.dest_site) else {
            tracing::warn!(dest_site = ack.dest_site, "ignoring ack for unknown or finished move");
            return AckOutcome::Ignored;
        };
        tracing::info!(
            partition = request.partition,
            dest_site = request.dest_site,
            remaining = self.outstanding.len(),
            "partition move acknowledged"
        );
        self.completed.push(request);
        if self.outstanding.is_empty() {
            AckOutcome::Complete
        } else {
            AckOutcome::Progress {
                remaining: self.outstanding.len(),
            }
        }
    }

    /// Report every completed move's source site as failed. Returns the number
    /// of sites reported; reporting errors are logged and skipped.
    pub async fn on_all_complete(&self, reporter: &dyn FaultReporter) -> usize {
        let sources: BTreeSet<(HostId, SiteId)> = self
            .completed
            .iter()
            .map(|request| (request.src_host, request.src_site))
            .collect();
        let mut reported = 0;
        for (host, site) in sources {
            match reporter.report_site_failed(host, site).await {
                Ok(()) => {
                    tracing::info!(host, site, "retired superseded source site");
                    reported += 1;
                }
                Err(err) => {
                    tracing::warn!(host, site, error = ?err, "failed to report superseded source site");
                }
            }
        }
        reported
    }
}
