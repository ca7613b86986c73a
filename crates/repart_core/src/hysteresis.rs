//! Decision gate applied to each epoch's execution-time estimate.
//!
//! Rules, in order:
//! - outlier: with a full history window, an estimate above
//!   `mean + k * stddev` forces a repartition without consulting the
//!   optimizer. Outliers are kept out of the window.
//! - gain: the optimizer's estimate is at most `current * (1 - min_gain)`.
//! - starvation: the optimizer's estimate beats the current one and no
//!   repartition happened for `starvation_epochs` decisions.

use std::collections::VecDeque;
use std::fmt;

use crate::optimizer::PlacementResult;

/// Bounded FIFO of past estimates with population mean/stddev.
#[derive(Debug, Clone)]
pub struct EstimateHistory {
    capacity: usize,
    values: VecDeque<f64>,
}

impl EstimateHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn stddev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = self
            .values
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / self.values.len() as f64;
        Some(variance.sqrt())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateConfig {
    pub history_len: usize,
    pub outlier_stddevs: f64,
    pub min_gain_pct: u32,
    pub starvation_epochs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepartitionReason {
    Outlier,
    Gain,
    Starvation,
}

impl fmt::Display for RepartitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RepartitionReason::Outlier => "outlier",
            RepartitionReason::Gain => "gain",
            RepartitionReason::Starvation => "starvation",
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    /// `candidate` is `None` for the outlier rule, which never solves.
    Repartition {
        reason: RepartitionReason,
        candidate: Option<PlacementResult>,
    },
    Hold {
        candidate: PlacementResult,
    },
    /// The optimizer found no feasible placement.
    Infeasible,
}

#[derive(Debug, Clone)]
pub struct DecisionGate {
    config: GateConfig,
    history: EstimateHistory,
    epochs_without_repartition: u64,
}

impl DecisionGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            history: EstimateHistory::new(config.history_len),
            epochs_without_repartition: 0,
        }
    }

    pub fn history(&self) -> &EstimateHistory {
        &self.history
    }

    pub fn epochs_without_repartition(&self) -> u64 {
        self.epochs_without_repartition
    }

    /// Largest candidate estimate that passes the gain rule:
    /// `current * (1 - min_gain_pct / 100)`.
    pub fn gain_threshold(&self, current: f64) -> f64 {
        let min_gain = f64::from(self.config.min_gain_pct.min(100)) / 100.0;
        current * (1.0 - min_gain)
    }

    /// Decide on this epoch's `current` estimate. `solve` runs the optimizer
    /// and is only called when the outlier rule does not fire.
    pub fn evaluate<F>(&mut self, current: f64, solve: F) -> Verdict
    where
        F: FnOnce() -> Option<PlacementResult>,
    {
        if let Some(limit) = self.outlier_limit() {
            if current > limit {
                tracing::info!(current, limit, "estimate is an outlier; forcing repartition");
                self.epochs_without_repartition = 0;
                return Verdict::Repartition {
                    reason: RepartitionReason::Outlier,
                    candidate: None,
                };
            }
        }
        self.history.push(current);

        let Some(candidate) = solve() else {
            tracing::info!(current, "no feasible placement this epoch");
            return Verdict::Infeasible;
        };
        let estimate = candidate.estimated_execution_time;

        let reason = if estimate <= self.gain_threshold(current) {
            Some(RepartitionReason::Gain)
        } else if estimate < current
            && self.epochs_without_repartition >= self.config.starvation_epochs
        {
            Some(RepartitionReason::Starvation)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                tracing::info!(
                    %reason,
                    current,
                    estimate,
                    epochs_without_repartition = self.epochs_without_repartition,
                    "repartition gate passed"
                );
                self.epochs_without_repartition = 0;
                Verdict::Repartition {
                    reason,
                    candidate: Some(candidate),
                }
            }
            None => {
                self.epochs_without_repartition += 1;
                tracing::debug!(
                    current,
                    estimate,
                    epochs_without_repartition = self.epochs_without_repartition,
                    "holding placement"
                );
                Verdict::Hold { candidate }
            }
        }
    }

    fn outlier_limit(&self) -> Option<f64> {
        if !self.history.is_full() {
            return None;
        }
        let mean = self.history.mean()?;
        let stddev = self.history.stddev()?;
        Some(mean + self.config.outlier_stddevs * stddev)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::optimizer::Placement;

    fn config() -> GateConfig {
        GateConfig {
            history_len: 30,
            outlier_stddevs: 2.0,
            min_gain_pct: 20,
            starvation_epochs: 60,
        }
    }

    fn candidate(estimate: f64) -> PlacementResult {
        PlacementResult {
            host_to_partitions: Placement::new(),
            estimated_execution_time: estimate,
            partitions_moved: 1,
            exhaustive: true,
            nodes_explored: 1,
        }
    }

    fn reason(verdict: &Verdict) -> Option<RepartitionReason> {
        match verdict {
            Verdict::Repartition { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    #[test]
    fn history_is_bounded_fifo() {
        let mut history = EstimateHistory::new(3);
        for value in [1.0, 2.0, 3.0, 10.0] {
            history.push(value);
        }
        assert!(history.is_full());
        assert_eq!(history.mean(), Some(5.0));
        let stddev = history.stddev().expect("stddev");
        assert!((stddev - (38.0f64 / 3.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn outlier_triggers_without_invoking_optimizer() {
        let mut gate = DecisionGate::new(config());
        for _ in 0..30 {
            gate.evaluate(1000.0, || Some(candidate(1000.0)));
        }
        let solved = Cell::new(false);
        let verdict = gate.evaluate(3000.0, || {
            solved.set(true);
            None
        });
        assert_eq!(reason(&verdict), Some(RepartitionReason::Outlier));
        assert!(!solved.get());
        // Outliers stay out of the window.
        assert_eq!(gate.history().mean(), Some(1000.0));
    }

    #[test]
    fn outlier_rule_waits_for_full_window() {
        let mut gate = DecisionGate::new(config());
        for _ in 0..29 {
            gate.evaluate(1000.0, || Some(candidate(1000.0)));
        }
        let verdict = gate.evaluate(3000.0, || Some(candidate(2900.0)));
        assert!(matches!(verdict, Verdict::Hold { .. }));
    }

    #[test]
    fn gain_boundary_is_inclusive() {
        let mut gate = DecisionGate::new(config());
        assert_eq!(gate.gain_threshold(1000.0), 800.0);
        let verdict = gate.evaluate(1000.0, || Some(candidate(800.0)));
        assert_eq!(reason(&verdict), Some(RepartitionReason::Gain));

        let mut gate = DecisionGate::new(config());
        let verdict = gate.evaluate(1000.0, || Some(candidate(810.0)));
        assert!(matches!(verdict, Verdict::Hold { .. }));
        assert_eq!(gate.epochs_without_repartition(), 1);
    }

    #[test]
    fn gain_boundary_holds_for_values_that_do_not_round_evenly() {
        for current in [3.0, 7.0, 1000.0, 1234.567, 12_345_678.0, 40_000_003.0] {
            let mut gate = DecisionGate::new(config());
            let verdict = gate.evaluate(current, || Some(candidate(current * 0.80)));
            assert_eq!(
                reason(&verdict),
                Some(RepartitionReason::Gain),
                "current={current} threshold={}",
                gate.gain_threshold(current)
            );

            let mut gate = DecisionGate::new(config());
            let verdict = gate.evaluate(current, || Some(candidate(current * 0.81)));
            assert!(matches!(verdict, Verdict::Hold { .. }), "current={current}");
        }
    }

    #[test]
    fn starvation_accepts_small_gain_after_threshold() {
        let mut gate = DecisionGate::new(GateConfig {
            starvation_epochs: 3,
            ..config()
        });
        for _ in 0..3 {
            let verdict = gate.evaluate(1000.0, || Some(candidate(950.0)));
            assert!(matches!(verdict, Verdict::Hold { .. }));
        }
        let verdict = gate.evaluate(1000.0, || Some(candidate(950.0)));
        assert_eq!(reason(&verdict), Some(RepartitionReason::Starvation));
        assert_eq!(gate.epochs_without_repartition(), 0);

        // No improvement at all never starves into a move.
        for _ in 0..5 {
            let verdict = gate.evaluate(1000.0, || Some(candidate(1000.0)));
            assert!(matches!(verdict, Verdict::Hold { .. }));
        }
    }

    #[test]
    fn infeasible_solve_leaves_counters_alone() {
        let mut gate = DecisionGate::new(config());
        assert_eq!(gate.evaluate(1000.0, || None), Verdict::Infeasible);
        assert_eq!(gate.epochs_without_repartition(), 0);
        assert_eq!(gate.history().len(), 1);
    }
}
