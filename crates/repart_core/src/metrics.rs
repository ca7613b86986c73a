//! In-process counters for the repartition controller.
//!
//! Lock-free and `Arc`-shared: the controller loop writes, watchdogs and
//! status endpoints read. `last_progress_unix_ms` advances on every epoch
//! boundary and migration acknowledgement, so a stuck loop shows up as a
//! growing `stalled_for`.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::hysteresis::RepartitionReason;

/// Controller phase as exposed to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    StartupWait,
    Collecting,
    Cooldown,
    Deciding,
    Migrating,
    Stopped,
}

impl Phase {
    fn as_u8(self) -> u8 {
        match self {
            Phase::StartupWait => 0,
            Phase::Collecting => 1,
            Phase::Cooldown => 2,
            Phase::Deciding => 3,
            Phase::Migrating => 4,
            Phase::Stopped => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::StartupWait,
            1 => Phase::Collecting,
            2 => Phase::Cooldown,
            3 => Phase::Deciding,
            4 => Phase::Migrating,
            _ => Phase::Stopped,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::StartupWait => "startup_wait",
            Phase::Collecting => "collecting",
            Phase::Cooldown => "cooldown",
            Phase::Deciding => "deciding",
            Phase::Migrating => "migrating",
            Phase::Stopped => "stopped",
        })
    }
}

#[derive(Debug, Default)]
pub struct ControllerMetrics {
    phase: AtomicU8,
    /// Completed epochs, ignored ones included.
    epochs: AtomicU64,
    /// Epochs that reached the decision gate.
    decisions: AtomicU64,
    repartitions_outlier: AtomicU64,
    repartitions_gain: AtomicU64,
    repartitions_starvation: AtomicU64,
    infeasible_solves: AtomicU64,
    /// Gate passed but the plan had nothing to move.
    empty_plans: AtomicU64,
    moves_skipped: AtomicU64,
    moves_dispatched: AtomicU64,
    moves_acked: AtomicU64,
    acks_ignored: AtomicU64,
    migrations_completed: AtomicU64,
    migration_timeouts: AtomicU64,
    telemetry_records: AtomicU64,
    empty_batches: AtomicU64,
    /// Bit pattern of the last current-placement estimate (f64).
    last_estimate_bits: AtomicU64,
    last_progress_unix_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerMetricsSnapshot {
    /// Phase at snapshot time.
    pub phase: Phase,
    /// Completed epochs, ignored ones included.
    pub epochs: u64,
    /// Epochs that reached the decision gate with a non-empty sample.
    pub decisions: u64,
    /// Migrations started because the estimate was an outlier.
    pub repartitions_outlier: u64,
    /// Migrations started because the candidate cleared the minimum gain.
    pub repartitions_gain: u64,
    /// Migrations started after too many epochs without one.
    pub repartitions_starvation: u64,
    /// Solves that found no placement within the limits.
    pub infeasible_solves: u64,
    /// Decisions whose candidate needed no moves.
    pub empty_plans: u64,
    /// Moves dropped while planning (no destination or source site).
    pub moves_skipped: u64,
    /// Moves accepted by the migration executor.
    pub moves_dispatched: u64,
    /// Acks that matched an outstanding move.
    pub moves_acked: u64,
    /// Unknown, duplicate or late acks.
    pub acks_ignored: u64,
    /// Runs whose every move was acknowledged.
    pub migrations_completed: u64,
    /// Runs abandoned after `migration_timeout` without progress.
    pub migration_timeouts: u64,
    /// Telemetry records received, in any phase.
    pub telemetry_records: u64,
    /// Telemetry batches with no records.
    pub empty_batches: u64,
    /// Current-placement estimate from the latest decision.
    pub last_estimate: f64,
    /// Wall-clock time of the latest progress mark. 0 before the first.
    pub last_progress_unix_ms: u64,
}

impl ControllerMetricsSnapshot {
    pub fn repartitions(&self) -> u64 {
        self.repartitions_outlier + self.repartitions_gain + self.repartitions_starvation
    }
}

impl ControllerMetrics {
    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::Relaxed);
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn record_epoch(&self) {
        self.epochs.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_decision(&self, estimate: f64) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
        self.last_estimate_bits
            .store(estimate.to_bits(), Ordering::Relaxed);
    }

    pub fn record_repartition(&self, reason: RepartitionReason) {
        let counter = match reason {
            RepartitionReason::Outlier => &self.repartitions_outlier,
            RepartitionReason::Gain => &self.repartitions_gain,
            RepartitionReason::Starvation => &self.repartitions_starvation,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_infeasible(&self) {
        self.infeasible_solves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_plan(&self) {
        self.empty_plans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_moves(&self, dispatched: usize, skipped: usize) {
        self.moves_dispatched
            .fetch_add(dispatched as u64, Ordering::Relaxed);
        self.moves_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_ack(&self, accepted: bool) {
        if accepted {
            self.moves_acked.fetch_add(1, Ordering::Relaxed);
            self.touch();
        } else {
            self.acks_ignored.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_migration_completed(&self) {
        self.migrations_completed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_migration_timeout(&self) {
        self.migration_timeouts.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_batch(&self, records: usize) {
        if records == 0 {
            self.empty_batches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.telemetry_records
                .fetch_add(records as u64, Ordering::Relaxed);
        }
    }

    /// Mark forward progress now.
    pub fn touch(&self) {
        self.last_progress_unix_ms
            .store(unix_ms(SystemTime::now()), Ordering::Relaxed);
    }

    /// Time since the last recorded progress, measured at `now`. `None` before
    /// the first progress mark.
    pub fn stalled_for(&self, now: SystemTime) -> Option<Duration> {
        let last = self.last_progress_unix_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some(Duration::from_millis(unix_ms(now).saturating_sub(last)))
    }

    pub fn snapshot(&self) -> ControllerMetricsSnapshot {
        ControllerMetricsSnapshot {
            phase: self.phase(),
            epochs: self.epochs.load(Ordering::Relaxed),
            decisions: self.decisions.load(Ordering::Relaxed),
            repartitions_outlier: self.repartitions_outlier.load(Ordering::Relaxed),
            repartitions_gain: self.repartitions_gain.load(Ordering::Relaxed),
            repartitions_starvation: self.repartitions_starvation.load(Ordering::Relaxed),
            infeasible_solves: self.infeasible_solves.load(Ordering::Relaxed),
            empty_plans: self.empty_plans.load(Ordering::Relaxed),
            moves_skipped: self.moves_skipped.load(Ordering::Relaxed),
            moves_dispatched: self.moves_dispatched.load(Ordering::Relaxed),
            moves_acked: self.moves_acked.load(Ordering::Relaxed),
            acks_ignored: self.acks_ignored.load(Ordering::Relaxed),
            migrations_completed: self.migrations_completed.load(Ordering::Relaxed),
            migration_timeouts: self.migration_timeouts.load(Ordering::Relaxed),
            telemetry_records: self.telemetry_records.load(Ordering::Relaxed),
            empty_batches: self.empty_batches.load(Ordering::Relaxed),
            last_estimate: f64::from_bits(self.last_estimate_bits.load(Ordering::Relaxed)),
            last_progress_unix_ms: self.last_progress_unix_ms.load(Ordering::Relaxed),
        }
    }

    /// Plain `key=value` lines.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        format!(
            "phase={}\nepochs={}\ndecisions={}\nrepartitions_outlier={}\nrepartitions_gain={}\nrepartitions_starvation={}\ninfeasible_solves={}\nempty_plans={}\nmoves_skipped={}\nmoves_dispatched={}\nmoves_acked={}\nacks_ignored={}\nmigrations_completed={}\nmigration_timeouts={}\ntelemetry_records={}\nempty_batches={}\nlast_estimate={}\nlast_progress_unix_ms={}\n",
            s.phase,
            s.epochs,
            s.decisions,
            s.repartitions_outlier,
            s.repartitions_gain,
            s.repartitions_starvation,
            s.infeasible_solves,
            s.empty_plans,
            s.moves_skipped,
            s.moves_dispatched,
            s.moves_acked,
            s.acks_ignored,
            s.migrations_completed,
            s.migration_timeouts,
            s.telemetry_records,
            s.empty_batches,
            s.last_estimate,
            s.last_progress_unix_ms,
        )
    }
}

fn unix_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = ControllerMetrics::default();
        assert_eq!(metrics.phase(), Phase::StartupWait);
        metrics.set_phase(Phase::Migrating);
        metrics.record_repartition(RepartitionReason::Gain);
        metrics.record_repartition(RepartitionReason::Outlier);
        metrics.record_moves(3, 1);
        metrics.record_ack(true);
        metrics.record_ack(false);
        metrics.record_batch(0);
        metrics.record_batch(12);
        metrics.record_decision(42.5);

        let s = metrics.snapshot();
        assert_eq!(s.phase, Phase::Migrating);
        assert_eq!(s.repartitions(), 2);
        assert_eq!((s.moves_dispatched, s.moves_skipped), (3, 1));
        assert_eq!((s.moves_acked, s.acks_ignored), (1, 1));
        assert_eq!((s.telemetry_records, s.empty_batches), (12, 1));
        assert_eq!(s.last_estimate, 42.5);
        assert!(metrics.render_text().contains("phase=migrating\n"));
    }

    #[test]
    fn stalled_for_measures_from_last_progress() {
        let metrics = ControllerMetrics::default();
        assert_eq!(metrics.stalled_for(SystemTime::now()), None);
        metrics.touch();
        let later = SystemTime::now() + Duration::from_secs(5);
        let stalled = metrics.stalled_for(later).expect("progress recorded");
        assert!(stalled >= Duration::from_millis(4_900));
    }
}
