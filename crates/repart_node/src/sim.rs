//! In-process simulated cluster.
//!
//! Implements every collaborator the controller needs: topology reads, the
//! stop-and-copy executor and the fault reporter. Each host gets a fixed set
//! of site slots; every partition starts with one up site on its home host
//! and the remaining slots are down spares. A copy marks the destination slot
//! up after `copy_delay` and acknowledges on the controller's channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use repart_core::{
    ControllerMessage, FaultReporter, HostId, MigrationExecutor, MoveAck, MoveRequest,
    Placement, SiteId, SiteInfo, Topology, TopologySnapshot,
};
use tokio::sync::mpsc;

/// Shape of a simulated cluster. Host `i` (0-based) has id `(i + 1) * 100`
/// and initially holds partitions `id + 1 ..= id + partitions_per_host`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterLayout {
    pub hosts: usize,
    pub partitions_per_host: usize,
    pub spare_sites_per_host: usize,
}

impl ClusterLayout {
    pub fn host_ids(&self) -> Vec<HostId> {
        (1..=self.hosts as u64).map(|i| i * 100).collect()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.hosts > 0, "--hosts must be > 0");
        anyhow::ensure!(self.partitions_per_host > 0, "--partitions-per-host must be > 0");
        anyhow::ensure!(
            self.partitions_per_host < 100,
            "--partitions-per-host must be < 100"
        );
        Ok(())
    }

    /// Initial topology: partition sites first, then spares, numbered from 1.
    pub fn initial_topology(&self) -> TopologySnapshot {
        let mut sites = Vec::new();
        let mut next_site: SiteId = 1;
        for host in self.host_ids() {
            for offset in 1..=self.partitions_per_host as u64 {
                sites.push(SiteInfo {
                    site: next_site,
                    host,
                    partition: Some(host + offset),
                    up: true,
                });
                next_site += 1;
            }
            for _ in 0..self.spare_sites_per_host {
                sites.push(SiteInfo {
                    site: next_site,
                    host,
                    partition: None,
                    up: false,
                });
                next_site += 1;
            }
        }
        TopologySnapshot::new(self.host_ids(), sites)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub moves_started: u64,
    pub moves_finished: u64,
    pub sites_failed: u64,
}

pub struct SimCluster {
    topology: Arc<Mutex<TopologySnapshot>>,
    initialized: AtomicBool,
    copy_delay: Duration,
    acks: mpsc::WeakSender<ControllerMessage>,
    moves_started: AtomicU64,
    moves_finished: Arc<AtomicU64>,
    sites_failed: AtomicU64,
}

impl SimCluster {
    /// Acks go to `acks` for as long as some other handle keeps the channel
    /// open; the cluster itself never keeps the controller alive.
    pub fn new(
        layout: ClusterLayout,
        copy_delay: Duration,
        acks: &mpsc::Sender<ControllerMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            topology: Arc::new(Mutex::new(layout.initial_topology())),
            initialized: AtomicBool::new(true),
            copy_delay,
            acks: acks.downgrade(),
            moves_started: AtomicU64::new(0),
            moves_finished: Arc::new(AtomicU64::new(0)),
            sites_failed: AtomicU64::new(0),
        })
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Relaxed);
    }

    pub fn topology_now(&self) -> TopologySnapshot {
        lock(&self.topology).clone()
    }

    pub fn placement(&self) -> Placement {
        lock(&self.topology).current_placement()
    }

    pub fn stats(&self) -> SimStats {
        SimStats {
            moves_started: self.moves_started.load(Ordering::Relaxed),
            moves_finished: self.moves_finished.load(Ordering::Relaxed),
            sites_failed: self.sites_failed.load(Ordering::Relaxed),
        }
    }
}

fn lock(topology: &Mutex<TopologySnapshot>) -> MutexGuard<'_, TopologySnapshot> {
    topology
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Topology for SimCluster {
    async fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    async fn snapshot(&self) -> anyhow::Result<TopologySnapshot> {
        Ok(self.topology_now())
    }
}

#[async_trait]
impl MigrationExecutor for SimCluster {
    async fn start_move(&self, request: MoveRequest) -> anyhow::Result<()> {
        {
            let mut topology = lock(&self.topology);
            let Some(dest) = topology.site(request.dest_site).copied() else {
                anyhow::bail!("unknown destination site {}", request.dest_site);
            };
            anyhow::ensure!(
                dest.host == request.dest_host && !dest.up,
                "destination site {} is not a down site on host {}",
                request.dest_site,
                request.dest_host
            );
            let source_ok = topology.site(request.src_site).is_some_and(|src| {
                src.up && src.host == request.src_host && src.partition == Some(request.partition)
            });
            anyhow::ensure!(
                source_ok,
                "source site {} does not serve partition {}",
                request.src_site,
                request.partition
            );
            // Reserve the slot while the copy runs.
            topology.assign_site(request.dest_site, request.partition);
        }
        self.moves_started.fetch_add(1, Ordering::Relaxed);

        let topology = Arc::clone(&self.topology);
        let finished = Arc::clone(&self.moves_finished);
        let acks = self.acks.clone();
        let delay = self.copy_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut topology = lock(&topology);
                topology.assign_site(request.dest_site, request.partition);
                topology.set_site_up(request.dest_site, true);
            }
            finished.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                partition = request.partition,
                dest_site = request.dest_site,
                "copy finished"
            );

            let ack = MoveAck {
                dest_site: request.dest_site,
            };
            let Some(tx) = acks.upgrade() else {
                tracing::debug!(dest_site = ack.dest_site, "controller channel closed; dropping ack");
                return;
            };
            if tx.send(ControllerMessage::MoveDone(ack)).await.is_err() {
                tracing::debug!(dest_site = ack.dest_site, "controller gone; dropping ack");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl FaultReporter for SimCluster {
    async fn report_site_failed(&self, host: HostId, site: SiteId) -> anyhow::Result<()> {
        let mut topology = lock(&self.topology);
        let Some(info) = topology.site(site).copied() else {
            anyhow::bail!("unknown site {site}");
        };
        anyhow::ensure!(info.host == host, "site {site} is not on host {host}");
        topology.set_site_up(site, false);
        self.sites_failed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(host, site, partition = ?info.partition, "site marked failed");
        Ok(())
    }
}
