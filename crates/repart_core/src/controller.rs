//! Epoch-driven repartition controller.
//!
//! One task owns the controller and is the only writer of its statistics,
//! history and migration state. Telemetry batches and move acknowledgements
//! arrive on the same bounded channel; the loop waits on it with the epoch
//! deadline as timeout, so epochs advance even with no traffic.
//!
//! States:
//! - `StartupWait`: poll the topology until the cluster reports initialized
//! - `Collecting`: fold telemetry into the epoch ledger. At each epoch
//!   boundary either burn one ignore epoch (cooldown) or decide
//! - `Migrating`: telemetry is discarded; acknowledgements are counted until
//!   the run completes or stalls past `migration_timeout`

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::RepartitionConfig;
use crate::hysteresis::{DecisionGate, Verdict};
use crate::metrics::{ControllerMetrics, Phase};
use crate::migration::{self, AckOutcome, MigrationRun};
use crate::optimizer::{estimated_execution_time, PlacementOptimizer};
use crate::stats::WorkloadSample;
use crate::telemetry::{ControllerMessage, TelemetryLedger, TxnRecord};
use crate::types::{FaultReporter, MigrationExecutor, MoveAck, Topology};

#[derive(Debug)]
pub enum ControllerState {
    StartupWait,
    /// Cooldown while `ignore_epochs > 0`.
    Collecting { ignore_epochs: u64 },
    Migrating {
        run: MigrationRun,
        /// Ignore epochs to apply once the run finishes.
        ignore_after: u64,
        last_progress: Instant,
    },
}

impl ControllerState {
    pub fn phase(&self) -> Phase {
        match self {
            ControllerState::StartupWait => Phase::StartupWait,
            ControllerState::Collecting { ignore_epochs: 0 } => Phase::Collecting,
            ControllerState::Collecting { .. } => Phase::Cooldown,
            ControllerState::Migrating { .. } => Phase::Migrating,
        }
    }
}

/// Create the inbound channel sized per `config`.
pub fn channel(
    config: &RepartitionConfig,
) -> (mpsc::Sender<ControllerMessage>, mpsc::Receiver<ControllerMessage>) {
    mpsc::channel(config.channel_capacity)
}

pub struct RepartitionController {
    config: RepartitionConfig,
    topology: Arc<dyn Topology>,
    executor: Arc<dyn MigrationExecutor>,
    faults: Arc<dyn FaultReporter>,
    metrics: Arc<ControllerMetrics>,
    state: ControllerState,
    ledger: TelemetryLedger,
    sample: WorkloadSample,
    gate: DecisionGate,
    optimizer: PlacementOptimizer,
    epoch: u64,
}

impl RepartitionController {
    pub fn new(
        config: RepartitionConfig,
        topology: Arc<dyn Topology>,
        executor: Arc<dyn MigrationExecutor>,
        faults: Arc<dyn FaultReporter>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            topology,
            executor,
            faults,
            metrics: Arc::new(ControllerMetrics::default()),
            state: ControllerState::StartupWait,
            ledger: TelemetryLedger::new(config.max_retained_records()),
            sample: WorkloadSample::new(config.max_samples_per_group),
            gate: DecisionGate::new(config.gate()),
            optimizer: PlacementOptimizer::new(config.optimizer_limits()),
            epoch: 0,
        })
    }

    pub fn metrics(&self) -> Arc<ControllerMetrics> {
        self.metrics.clone()
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Drive the controller until the inbound channel closes.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<ControllerMessage>) -> anyhow::Result<()> {
        self.wait_for_startup().await;

        let epoch_length = self.config.epoch_length;
        let mut deadline = Instant::now() + epoch_length;
        loop {
            match tokio::time::timeout_at(deadline, inbox.recv()).await {
                Ok(Some(message)) => self.handle_message(message).await,
                Ok(None) => {
                    tracing::info!(epoch = self.epoch, "controller inbox closed; stopping");
                    self.metrics.set_phase(Phase::Stopped);
                    return Ok(());
                }
                Err(_) => {
                    self.on_epoch_boundary().await;
                    let now = Instant::now();
                    deadline += epoch_length;
                    if deadline <= now {
                        // A long solve overran the next epoch; restart the clock.
                        deadline = now + epoch_length;
                    }
                }
            }
        }
    }

    async fn wait_for_startup(&mut self) {
        self.set_state(ControllerState::StartupWait);
        while !self.topology.is_initialized().await {
            tokio::time::sleep(self.config.startup_poll_interval).await;
        }
        tracing::info!(
            ignore_epochs = self.config.startup_ignore_epochs,
            "cluster initialized; starting repartition epochs"
        );
        self.set_state(ControllerState::Collecting {
            ignore_epochs: self.config.startup_ignore_epochs,
        });
        self.metrics.touch();
    }

    pub async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Telemetry(batch) => self.on_telemetry(batch),
            ControllerMessage::MoveDone(ack) => self.on_move_done(ack).await,
        }
    }

    fn on_telemetry(&mut self, batch: Vec<TxnRecord>) {
        self.metrics.record_batch(batch.len());
        if batch.is_empty() {
            tracing::debug!(epoch = self.epoch, "empty telemetry batch");
            self.ledger.fold_batch(batch);
            return;
        }
        match self.state {
            ControllerState::Collecting { .. } => {
                self.ledger.fold_batch(batch);
            }
            ControllerState::Migrating { .. } => {
                tracing::trace!(records = batch.len(), "discarding telemetry during migration");
            }
            ControllerState::StartupWait => {}
        }
    }

    async fn on_move_done(&mut self, ack: MoveAck) {
        let ControllerState::Migrating {
            run,
            ignore_after,
            last_progress,
        } = &mut self.state
        else {
            tracing::warn!(dest_site = ack.dest_site, "move acknowledgement outside a migration");
            self.metrics.record_ack(false);
            return;
        };

        match run.on_ack(ack) {
            AckOutcome::Ignored => self.metrics.record_ack(false),
            AckOutcome::Progress { .. } => {
                *last_progress = Instant::now();
                self.metrics.record_ack(true);
            }
            AckOutcome::Complete => {
                self.metrics.record_ack(true);
                let retired = run.on_all_complete(self.faults.as_ref()).await;
                let ignore_epochs = *ignore_after;
                tracing::info!(
                    epoch = self.epoch,
                    retired,
                    ignore_epochs,
                    "migration complete"
                );
                self.metrics.record_migration_completed();
                self.set_state(ControllerState::Collecting { ignore_epochs });
            }
        }
    }

    /// Close the current epoch.
    pub async fn on_epoch_boundary(&mut self) {
        self.epoch += 1;
        self.metrics.record_epoch();

        match self.state {
            ControllerState::StartupWait => {}
            ControllerState::Collecting { ignore_epochs } if ignore_epochs > 0 => {
                tracing::debug!(epoch = self.epoch, remaining = ignore_epochs - 1, "ignoring epoch");
                self.ledger.clear();
                self.set_state(ControllerState::Collecting {
                    ignore_epochs: ignore_epochs - 1,
                });
            }
            ControllerState::Collecting { .. } => {
                self.metrics.set_phase(Phase::Deciding);
                if let Err(err) = self.decide().await {
                    tracing::warn!(epoch = self.epoch, error = ?err, "repartition decision failed");
                }
                self.ledger.clear();
                self.metrics.set_phase(self.state.phase());
            }
            ControllerState::Migrating { .. } => self.check_migration_progress(),
        }
    }

    fn check_migration_progress(&mut self) {
        let ControllerState::Migrating {
            run,
            ignore_after,
            last_progress,
        } = &self.state
        else {
            return;
        };
        let timeout = self.config.migration_timeout;
        let idle = last_progress.elapsed();
        if timeout.is_zero() || idle < timeout {
            return;
        }
        tracing::error!(
            epoch = self.epoch,
            outstanding = run.outstanding(),
            idle_ms = idle.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "abandoning stalled migration"
        );
        let ignore_epochs = *ignore_after;
        self.metrics.record_migration_timeout();
        self.set_state(ControllerState::Collecting { ignore_epochs });
    }

    async fn decide(&mut self) -> anyhow::Result<()> {
        let topology = self.topology.snapshot().await?;

        self.sample.clear();
        let replay = self.ledger.replay_into(&mut self.sample, &topology);
        if self.sample.is_empty() {
            tracing::debug!(epoch = self.epoch, "no telemetry this epoch");
            return Ok(());
        }
        self.sample.reconcile();

        let current = topology.current_placement();
        let current_estimate = estimated_execution_time(&self.sample, &current);
        self.metrics.record_decision(current_estimate);
        tracing::debug!(
            epoch = self.epoch,
            groups = self.sample.len(),
            local = replay.local,
            remote = replay.remote,
            estimate = current_estimate,
            "evaluating placement"
        );

        let sample = &self.sample;
        let optimizer = &self.optimizer;
        let verdict = self.gate.evaluate(current_estimate, || {
            optimizer.find_optimum_partitioning(sample, &current, topology.hosts())
        });

        let (reason, candidate) = match verdict {
            Verdict::Infeasible => {
                self.metrics.record_infeasible();
                return Ok(());
            }
            Verdict::Hold { .. } => return Ok(()),
            Verdict::Repartition { reason, candidate } => (reason, candidate),
        };
        let candidate = match candidate {
            Some(candidate) => candidate,
            None => match optimizer.find_optimum_partitioning(sample, &current, topology.hosts()) {
                Some(candidate) => candidate,
                None => {
                    tracing::warn!(epoch = self.epoch, %reason, "no feasible placement to move to");
                    self.metrics.record_infeasible();
                    return Ok(());
                }
            },
        };

        let plan = migration::plan(&current, &candidate.host_to_partitions, &topology);
        let skipped = plan.skipped.len();
        if plan.is_empty() {
            tracing::info!(
                epoch = self.epoch,
                %reason,
                skipped,
                "candidate placement needs no moves"
            );
            self.metrics.record_moves(0, skipped);
            self.metrics.record_empty_plan();
            return Ok(());
        }

        tracing::info!(
            epoch = self.epoch,
            %reason,
            current = current_estimate,
            estimate = candidate.estimated_execution_time,
            moves = plan.moves.len(),
            skipped,
            placement = %candidate.host_to_partitions,
            "starting repartition"
        );
        let mut run = MigrationRun::new(plan);
        let dispatched = run.execute(self.executor.as_ref()).await;
        self.metrics.record_moves(dispatched, skipped);
        if dispatched == 0 {
            tracing::warn!(epoch = self.epoch, "no partition move could be dispatched");
            return Ok(());
        }
        self.metrics.record_repartition(reason);
        self.set_state(ControllerState::Migrating {
            run,
            ignore_after: self.config.post_repartition_ignore_epochs,
            last_progress: Instant::now(),
        });
        Ok(())
    }

    fn set_state(&mut self, state: ControllerState) {
        self.state = state;
        self.metrics.set_phase(self.state.phase());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::telemetry::MessageStats;
    use crate::topology::{SiteInfo, TopologySnapshot};
    use crate::types::{HostId, MoveRequest, PartitionId, SiteId};

    struct StaticTopology {
        snapshot: TopologySnapshot,
        polls_until_ready: AtomicUsize,
    }

    #[async_trait]
    impl Topology for StaticTopology {
        async fn is_initialized(&self) -> bool {
            self.polls_until_ready
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_err()
        }

        async fn snapshot(&self) -> anyhow::Result<TopologySnapshot> {
            Ok(self.snapshot.clone())
        }
    }

    #[derive(Default)]
    struct Recorder {
        moves: Mutex<Vec<MoveRequest>>,
        failed: Mutex<Vec<(HostId, SiteId)>>,
    }

    #[async_trait]
    impl MigrationExecutor for Recorder {
        async fn start_move(&self, request: MoveRequest) -> anyhow::Result<()> {
            self.moves.lock().unwrap().push(request);
            Ok(())
        }
    }

    #[async_trait]
    impl FaultReporter for Recorder {
        async fn report_site_failed(&self, host: HostId, site: SiteId) -> anyhow::Result<()> {
            self.failed.lock().unwrap().push((host, site));
            Ok(())
        }
    }

    fn site(site: SiteId, host: HostId, partition: Option<PartitionId>, up: bool) -> SiteInfo {
        SiteInfo {
            site,
            host,
            partition,
            up,
        }
    }

    /// Partition 101 lives on host 200 but is mostly used from host 100.
    fn misplaced_cluster() -> TopologySnapshot {
        TopologySnapshot::new(
            [100, 200],
            [
                site(1, 100, Some(102), true),
                site(2, 100, Some(201), true),
                site(3, 100, None, false),
                site(4, 200, Some(101), true),
                site(5, 200, Some(202), true),
                site(6, 200, None, false),
            ],
        )
    }

    fn config() -> RepartitionConfig {
        RepartitionConfig {
            epoch_length: Duration::from_secs(1),
            max_partitions_per_host: 3,
            max_partitions_moved: 1,
            post_repartition_ignore_epochs: 2,
            migration_timeout: Duration::ZERO,
            ..Default::default()
        }
    }

    fn hot_partition_batch() -> Vec<TxnRecord> {
        let mut batch = Vec::new();
        for txn_id in 0..20 {
            batch.push(TxnRecord {
                txn_id,
                procedure: "Proc1".to_string(),
                is_single_partition: true,
                partition: Some(101),
                initiator_host: 100,
                initiator_site: 1,
                coordinator_site: 4,
                latency_ns: 12_000_000,
                messages: vec![MessageStats {
                    sender_site: 1,
                    receiver_site: 4,
                    send_time_ns: 0,
                    receive_time_ns: 10_000_000,
                }],
            });
        }
        for txn_id in 20..25 {
            batch.push(TxnRecord {
                txn_id,
                procedure: "Proc1".to_string(),
                is_single_partition: true,
                partition: Some(101),
                initiator_host: 200,
                initiator_site: 5,
                coordinator_site: 4,
                latency_ns: 3_000_000,
                messages: Vec::new(),
            });
        }
        batch
    }

    fn controller(
        config: RepartitionConfig,
        polls_until_ready: usize,
    ) -> (RepartitionController, Arc<Recorder>) {
        let topology = Arc::new(StaticTopology {
            snapshot: misplaced_cluster(),
            polls_until_ready: AtomicUsize::new(polls_until_ready),
        });
        let recorder = Arc::new(Recorder::default());
        let controller = RepartitionController::new(config, topology, recorder.clone(), recorder.clone())
            .expect("valid config");
        (controller, recorder)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn gain_triggers_migration_then_cooldown() {
        let (controller, recorder) = controller(config(), 3);
        let metrics = controller.metrics();
        let (tx, rx) = channel(&config());
        let task = tokio::spawn(controller.run(rx));

        tx.send(ControllerMessage::Telemetry(hot_partition_batch()))
            .await
            .unwrap();
        wait_until(|| !recorder.moves.lock().unwrap().is_empty()).await;

        assert_eq!(
            *recorder.moves.lock().unwrap(),
            vec![MoveRequest {
                partition: 101,
                src_host: 200,
                src_site: 4,
                dest_host: 100,
                dest_site: 3,
            }]
        );
        assert_eq!(metrics.phase(), Phase::Migrating);
        assert_eq!(metrics.snapshot().repartitions_gain, 1);

        // Telemetry during migration is dropped; a stray ack is ignored.
        tx.send(ControllerMessage::Telemetry(hot_partition_batch()))
            .await
            .unwrap();
        tx.send(ControllerMessage::MoveDone(MoveAck { dest_site: 99 }))
            .await
            .unwrap();
        assert!(recorder.failed.lock().unwrap().is_empty());

        tx.send(ControllerMessage::MoveDone(MoveAck { dest_site: 3 }))
            .await
            .unwrap();
        wait_until(|| !recorder.failed.lock().unwrap().is_empty()).await;
        assert_eq!(*recorder.failed.lock().unwrap(), vec![(200, 4)]);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.phase, Phase::Cooldown);
        assert_eq!(snapshot.migrations_completed, 1);
        assert_eq!(snapshot.acks_ignored, 1);

        wait_until(|| metrics.phase() == Phase::Collecting).await;
        drop(tx);
        task.await.unwrap().unwrap();
        assert_eq!(metrics.phase(), Phase::Stopped);
        assert_eq!(recorder.moves.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn infeasible_placement_starts_no_migration() {
        let config = RepartitionConfig {
            max_partitions_per_host: 1,
            ..config()
        };
        let (controller, recorder) = controller(config, 0);
        let metrics = controller.metrics();
        let (tx, rx) = channel(&config);
        let task = tokio::spawn(controller.run(rx));

        tx.send(ControllerMessage::Telemetry(Vec::new())).await.unwrap();
        tx.send(ControllerMessage::Telemetry(hot_partition_batch()))
            .await
            .unwrap();
        wait_until(|| metrics.snapshot().infeasible_solves == 1).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.empty_batches, 1);
        assert_eq!(snapshot.phase, Phase::Collecting);
        assert!(recorder.moves.lock().unwrap().is_empty());

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_migration_is_abandoned_without_failing_sources() {
        let config = RepartitionConfig {
            migration_timeout: Duration::from_secs(3),
            ..config()
        };
        let (controller, recorder) = controller(config, 0);
        let metrics = controller.metrics();
        let (tx, rx) = channel(&config);
        let task = tokio::spawn(controller.run(rx));

        tx.send(ControllerMessage::Telemetry(hot_partition_batch()))
            .await
            .unwrap();
        wait_until(|| metrics.snapshot().migration_timeouts == 1).await;

        assert_eq!(metrics.phase(), Phase::Cooldown);
        assert!(recorder.failed.lock().unwrap().is_empty());

        // The late ack no longer belongs to a run.
        tx.send(ControllerMessage::MoveDone(MoveAck { dest_site: 3 }))
            .await
            .unwrap();
        wait_until(|| metrics.snapshot().acks_ignored == 1).await;

        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn startup_ignore_epochs_delay_first_decision() {
        let config = RepartitionConfig {
            startup_ignore_epochs: 2,
            ..config()
        };
        let (mut controller, recorder) = controller(config, 0);
        controller.wait_for_startup().await;
        assert_eq!(controller.state().phase(), Phase::Cooldown);

        for _ in 0..2 {
            controller
                .handle_message(ControllerMessage::Telemetry(hot_partition_batch()))
                .await;
            controller.on_epoch_boundary().await;
            assert!(recorder.moves.lock().unwrap().is_empty());
        }
        assert_eq!(controller.state().phase(), Phase::Collecting);

        controller
            .handle_message(ControllerMessage::Telemetry(hot_partition_batch()))
            .await;
        controller.on_epoch_boundary().await;
        assert_eq!(controller.state().phase(), Phase::Migrating);
        assert_eq!(controller.epoch(), 3);
        assert_eq!(recorder.moves.lock().unwrap().len(), 1);
    }

    /// Purely local traffic on partition 102; nothing to gain by moving.
    fn local_batch(latency_ns: i64) -> Vec<TxnRecord> {
        (100..110)
            .map(|txn_id| TxnRecord {
                txn_id,
                procedure: "Proc2".to_string(),
                is_single_partition: true,
                partition: Some(102),
                initiator_host: 100,
                initiator_site: 1,
                coordinator_site: 1,
                latency_ns,
                messages: Vec::new(),
            })
            .collect()
    }

    /// Run enough steady epochs to fill the estimate history.
    async fn fill_history(controller: &mut RepartitionController, recorder: &Recorder) {
        controller.wait_for_startup().await;
        for _ in 0..config().history_len {
            controller
                .handle_message(ControllerMessage::Telemetry(local_batch(2_000_000)))
                .await;
            controller.on_epoch_boundary().await;
        }
        assert!(controller.gate.history().is_full());
        assert!(recorder.moves.lock().unwrap().is_empty());
        assert_eq!(controller.state().phase(), Phase::Collecting);
    }

    #[tokio::test(start_paused = true)]
    async fn outlier_epoch_solves_and_migrates() {
        let (mut controller, recorder) = controller(config(), 0);
        let metrics = controller.metrics();
        fill_history(&mut controller, &recorder).await;
        assert_eq!(metrics.snapshot().decisions, 30);

        let mut spike = local_batch(2_000_000);
        spike.extend(hot_partition_batch());
        controller
            .handle_message(ControllerMessage::Telemetry(spike))
            .await;
        controller.on_epoch_boundary().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.repartitions_outlier, 1);
        assert_eq!(snapshot.repartitions_gain, 0);
        assert_eq!(snapshot.phase, Phase::Migrating);
        assert_eq!(
            *recorder.moves.lock().unwrap(),
            vec![MoveRequest {
                partition: 101,
                src_host: 200,
                src_site: 4,
                dest_host: 100,
                dest_site: 3,
            }]
        );
        // The spike stays out of the window.
        assert_eq!(controller.gate.history().len(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn outlier_with_optimal_placement_is_an_empty_plan() {
        let (mut controller, recorder) = controller(config(), 0);
        let metrics = controller.metrics();
        fill_history(&mut controller, &recorder).await;

        controller
            .handle_message(ControllerMessage::Telemetry(local_batch(20_000_000)))
            .await;
        controller.on_epoch_boundary().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.empty_plans, 1);
        assert_eq!(snapshot.repartitions(), 0);
        assert_eq!(snapshot.phase, Phase::Collecting);
        assert_eq!(controller.state().phase(), Phase::Collecting);
        assert!(recorder.moves.lock().unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_config() {
        let topology = Arc::new(StaticTopology {
            snapshot: TopologySnapshot::default(),
            polls_until_ready: AtomicUsize::new(0),
        });
        let recorder = Arc::new(Recorder::default());
        let config = RepartitionConfig {
            history_len: 0,
            ..Default::default()
        };
        assert!(RepartitionController::new(config, topology, recorder.clone(), recorder).is_err());
    }
}
