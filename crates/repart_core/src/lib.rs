//! Adaptive live repartitioning for a partitioned in-memory database.
//!
//! Telemetry flows through the crate as follows:
//! 1. `telemetry`: per-transaction records, folded into an epoch ledger
//! 2. `stats`: grouped local/remote latency estimates
//! 3. `schedule`: best/worst-case execution-time bounds
//! 4. `hysteresis` + `optimizer`: decide whether a better placement is worth it
//! 5. `migration`: copy partitions and retire superseded sites
//!
//! `controller` owns the loop; `types` holds the collaborator traits the
//! surrounding cluster implements.

pub mod config;
pub mod controller;
pub mod hysteresis;
pub mod metrics;
pub mod migration;
pub mod optimizer;
pub mod schedule;
pub mod stats;
pub mod telemetry;
pub mod topology;
pub mod types;

pub use config::RepartitionConfig;
pub use controller::{ControllerState, RepartitionController};
pub use metrics::{ControllerMetrics, ControllerMetricsSnapshot, Phase};
pub use optimizer::{Placement, PlacementOptimizer, PlacementResult};
pub use telemetry::{ControllerMessage, MessageStats, TxnRecord};
pub use topology::{SiteInfo, TopologySnapshot};
pub use types::{FaultReporter, HostId, MigrationExecutor, MoveAck, MoveRequest, PartitionId, SiteId, Topology};
