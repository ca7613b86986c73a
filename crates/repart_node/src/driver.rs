//! Wires a `SimCluster`, a telemetry source and a `RepartitionController`
//! together and reports what happened.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use repart_core::controller;
use repart_core::{
    ControllerMessage, ControllerMetrics, ControllerMetricsSnapshot, Placement, RepartitionConfig,
    RepartitionController, TxnRecord,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::sim::{ClusterLayout, SimCluster, SimStats};
use crate::workload::{WorkloadGenerator, WorkloadProfile, MAX_BATCH_RECORDS};

#[derive(Clone, Debug)]
pub struct SimulationOptions {
    pub layout: ClusterLayout,
    pub profile: WorkloadProfile,
    pub seed: u64,
    pub copy_delay: Duration,
    pub duration: Duration,
    /// Telemetry is generated and sent once per tick.
    pub tick: Duration,
    pub txns_per_tick: usize,
    pub config: RepartitionConfig,
}

#[derive(Clone, Debug)]
pub struct ReplayOptions {
    pub layout: ClusterLayout,
    pub copy_delay: Duration,
    /// Pause between consecutive batches.
    pub batch_interval: Duration,
    /// Keep the controller running this long after the last batch.
    pub settle: Duration,
    pub config: RepartitionConfig,
}

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub initial: Placement,
    pub final_placement: Placement,
    pub records_sent: u64,
    pub sim: SimStats,
    pub metrics: ControllerMetricsSnapshot,
    pub metrics_text: String,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "initial_placement={}", self.initial)?;
        writeln!(f, "final_placement={}", self.final_placement)?;
        writeln!(f, "records_sent={}", self.records_sent)?;
        writeln!(f, "sim_moves_started={}", self.sim.moves_started)?;
        writeln!(f, "sim_moves_finished={}", self.sim.moves_finished)?;
        writeln!(f, "sim_sites_failed={}", self.sim.sites_failed)?;
        f.write_str(&self.metrics_text)
    }
}

struct Harness {
    tx: mpsc::Sender<ControllerMessage>,
    sim: Arc<SimCluster>,
    metrics: Arc<ControllerMetrics>,
    controller: JoinHandle<anyhow::Result<()>>,
    initial: Placement,
    records_sent: u64,
}

impl Harness {
    fn start(layout: ClusterLayout, copy_delay: Duration, config: RepartitionConfig) -> anyhow::Result<Self> {
        layout.validate()?;
        let (tx, rx) = controller::channel(&config);
        let sim = SimCluster::new(layout, copy_delay, &tx);
        let controller = RepartitionController::new(config, sim.clone(), sim.clone(), sim.clone())
            .context("build repartition controller")?;
        let metrics = controller.metrics();
        let initial = sim.placement();
        tracing::info!(placement = %initial, "simulated cluster ready");
        Ok(Self {
            tx,
            sim,
            metrics,
            controller: tokio::spawn(controller.run(rx)),
            initial,
            records_sent: 0,
        })
    }

    /// Send `records` in batches of at most `MAX_BATCH_RECORDS`. An empty
    /// vector goes out as one empty batch.
    async fn send(&mut self, mut records: Vec<TxnRecord>) -> anyhow::Result<()> {
        if records.is_empty() {
            return self.send_batch(records).await;
        }
        while !records.is_empty() {
            let rest = records.split_off(records.len().min(MAX_BATCH_RECORDS));
            let count = records.len() as u64;
            self.send_batch(records).await?;
            self.records_sent += count;
            records = rest;
        }
        Ok(())
    }

    async fn send_batch(&self, batch: Vec<TxnRecord>) -> anyhow::Result<()> {
        self.tx
            .send(ControllerMessage::Telemetry(batch))
            .await
            .context("controller stopped accepting telemetry")
    }

    async fn finish(self) -> anyhow::Result<RunSummary> {
        drop(self.tx);
        self.controller
            .await
            .context("controller task panicked")?
            .context("controller failed")?;
        let summary = RunSummary {
            initial: self.initial,
            final_placement: self.sim.placement(),
            records_sent: self.records_sent,
            sim: self.sim.stats(),
            metrics: self.metrics.snapshot(),
            metrics_text: self.metrics.render_text(),
        };
        tracing::info!(
            placement = %summary.final_placement,
            repartitions = summary.metrics.repartitions(),
            migrations = summary.metrics.migrations_completed,
            records = summary.records_sent,
            "run finished"
        );
        Ok(summary)
    }
}

/// Drive generated traffic against a simulated cluster for `duration`.
pub async fn run_simulation(options: SimulationOptions) -> anyhow::Result<RunSummary> {
    anyhow::ensure!(!options.tick.is_zero(), "tick must be non-zero");
    let mut generator = WorkloadGenerator::new(options.profile, options.seed)?;
    let mut harness = Harness::start(options.layout, options.copy_delay, options.config)?;

    let deadline = Instant::now() + options.duration;
    let mut ticker = tokio::time::interval(options.tick);
    loop {
        ticker.tick().await;
        if Instant::now() >= deadline {
            break;
        }
        let topology = harness.sim.topology_now();
        let records = generator.next_records(options.txns_per_tick, &topology);
        harness.send(records).await?;
    }
    harness.finish().await
}

/// Feed a recorded trace to a fresh simulated cluster.
pub async fn replay_trace(records: Vec<TxnRecord>, options: ReplayOptions) -> anyhow::Result<RunSummary> {
    let mut harness = Harness::start(options.layout, options.copy_delay, options.config)?;
    let mut records = records.into_iter().peekable();
    while records.peek().is_some() {
        let batch: Vec<TxnRecord> = records.by_ref().take(MAX_BATCH_RECORDS).collect();
        harness.send(batch).await?;
        if !options.batch_interval.is_zero() {
            tokio::time::sleep(options.batch_interval).await;
        }
    }
    tokio::time::sleep(options.settle).await;
    harness.finish().await
}

/// Generate `count` records against the layout's initial topology.
pub fn generate_trace(
    layout: ClusterLayout,
    profile: WorkloadProfile,
    seed: u64,
    count: usize,
) -> anyhow::Result<Vec<TxnRecord>> {
    layout.validate()?;
    let topology = layout.initial_topology();
    let mut generator = WorkloadGenerator::new(profile, seed)?;
    Ok(generator.next_records(count, &topology))
}
