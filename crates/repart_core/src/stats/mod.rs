//! Per-epoch latency statistics.
//!
//! Raw per-transaction latencies are grouped by `TxnGroupKey` into
//! `TxnGroupLatencyStats`, held by a `WorkloadSample`. At the end of an epoch
//! `WorkloadSample::reconcile` derives whichever of local/remote latency was
//! never observed:
//! - remote missing: `2 x local`
//! - local missing: `max(1, round(0.5 x remote))`
//! - remote below local: remote widened to `2 x local`
//!
//! Derived values are tagged as estimates so the scheduler and optimizer can
//! tell measured from inferred cost.

mod group;
mod key;
mod latency;
mod sample;

pub use group::{GroupLatency, LatencyEstimate, Locality, TxnGroupLatencyStats};
pub use key::{PartitionScope, TxnGroupKey};
pub use latency::LatencyBuffer;
pub use sample::{GroupId, WorkloadSample, DEFAULT_MAX_SAMPLES_PER_GROUP};
