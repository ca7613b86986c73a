use std::time::Duration;

use crate::hysteresis::GateConfig;
use crate::optimizer::OptimizerLimits;
use crate::stats::DEFAULT_MAX_SAMPLES_PER_GROUP;

/// Raw records retained per epoch, per unit of `max_samples_per_group`.
pub const RETAINED_RECORDS_PER_GROUP_SAMPLE: usize = 64;

/// Tunables for the repartition controller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RepartitionConfig {
    /// Length of one collection epoch.
    pub epoch_length: Duration,
    /// Poll interval while waiting for the cluster to initialize.
    pub startup_poll_interval: Duration,
    pub max_partitions_per_host: usize,
    /// Upper bound on partitions moved by one decision.
    pub max_partitions_moved: usize,
    /// Estimates kept for the outlier rule's rolling mean/stddev.
    pub history_len: usize,
    pub outlier_stddevs: f64,
    /// Minimum improvement, in percent, for the gain rule.
    pub min_gain_pct: u32,
    pub starvation_epochs: u64,
    /// Epochs ignored after startup before the first decision.
    pub startup_ignore_epochs: u64,
    /// Epochs ignored after a repartition while the cluster settles.
    pub post_repartition_ignore_epochs: u64,
    pub max_samples_per_group: usize,
    /// Branch-and-bound node budget per solve. 0 means unbounded.
    pub max_search_nodes: u64,
    /// Abandon a migration with no acknowledgement progress for this long.
    /// Set to 0 to disable.
    pub migration_timeout: Duration,
    /// Inbound channel capacity.
    pub channel_capacity: usize,
}

impl Default for RepartitionConfig {
    fn default() -> Self {
        Self {
            epoch_length: Duration::from_secs(1),
            startup_poll_interval: Duration::from_millis(100),
            max_partitions_per_host: 8,
            max_partitions_moved: 2,
            history_len: 30,
            outlier_stddevs: 2.0,
            min_gain_pct: 20,
            starvation_epochs: 60,
            startup_ignore_epochs: 0,
            post_repartition_ignore_epochs: 40,
            max_samples_per_group: DEFAULT_MAX_SAMPLES_PER_GROUP,
            max_search_nodes: 200_000,
            migration_timeout: Duration::from_secs(300),
            channel_capacity: 1024,
        }
    }
}

impl RepartitionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.epoch_length.is_zero() {
            anyhow::bail!("epoch length must be non-zero");
        }
        if self.startup_poll_interval.is_zero() {
            anyhow::bail!("startup poll interval must be non-zero");
        }
        if self.max_partitions_per_host == 0 {
            anyhow::bail!("max partitions per host must be at least 1");
        }
        if self.history_len == 0 {
            anyhow::bail!("history length must be at least 1");
        }
        if !self.outlier_stddevs.is_finite() || self.outlier_stddevs < 0.0 {
            anyhow::bail!(
                "outlier threshold must be a non-negative number of standard deviations (got {})",
                self.outlier_stddevs
            );
        }
        if self.min_gain_pct > 100 {
            anyhow::bail!("minimum gain must be a percentage (got {})", self.min_gain_pct);
        }
        if self.max_samples_per_group == 0 {
            anyhow::bail!("max samples per group must be at least 1");
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("channel capacity must be at least 1");
        }
        Ok(())
    }

    pub fn gate(&self) -> GateConfig {
        GateConfig {
            history_len: self.history_len,
            outlier_stddevs: self.outlier_stddevs,
            min_gain_pct: self.min_gain_pct,
            starvation_epochs: self.starvation_epochs,
        }
    }

    pub fn optimizer_limits(&self) -> OptimizerLimits {
        OptimizerLimits {
            max_partitions_per_host: self.max_partitions_per_host,
            max_partitions_moved: self.max_partitions_moved,
            max_search_nodes: self.max_search_nodes,
        }
    }

    pub fn max_retained_records(&self) -> usize {
        self.max_samples_per_group
            .saturating_mul(RETAINED_RECORDS_PER_GROUP_SAMPLE)
    }
}
