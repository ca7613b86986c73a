//! Per-transaction telemetry from the execution layer and its per-epoch
//! ledger.
//!
//! Records are folded into the ledger as batches arrive and replayed into a
//! `WorkloadSample` at decision time, classified against the topology
//! snapshot taken for that decision.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::stats::{Locality, WorkloadSample};
use crate::topology::TopologySnapshot;
use crate::types::{HostId, MoveAck, PartitionId, SiteId};

/// Network timing for one message a transaction sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStats {
    pub sender_site: SiteId,
    /// Its partition is the one the measured latency is charged to.
    pub receiver_site: SiteId,
    /// Sender clock at send.
    pub send_time_ns: i64,
    /// Receiver clock at receipt.
    pub receive_time_ns: i64,
}

/// One transaction completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRecord {
    /// Execution-layer transaction id; only used in logs.
    pub txn_id: u64,
    /// Stored procedure name.
    pub procedure: String,
    pub is_single_partition: bool,
    /// Target partition of a single-partition transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionId>,
    /// Host the client request arrived on.
    pub initiator_host: HostId,
    pub initiator_site: SiteId,
    /// Site that ran the transaction. Local iff it lives on `initiator_host`.
    pub coordinator_site: SiteId,
    /// End-to-end latency as seen by the initiator.
    pub latency_ns: i64,
    /// Cross-site messages sent on the transaction's behalf.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessageStats>,
}

/// Everything the controller receives on its inbound channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerMessage {
    Telemetry(Vec<TxnRecord>),
    MoveDone(MoveAck),
}

/// Snapshot of one epoch's ledger counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Batches received, empty ones included.
    pub batches: u64,
    pub empty_batches: u64,
    /// Records received, retained or not.
    pub records: u64,
    pub single_partition: u64,
    pub multi_partition: u64,
    /// Raw records held for replay.
    pub retained: usize,
    /// Records counted but not retained once the cap was hit.
    pub dropped: u64,
    /// Single-partition record count per target partition.
    pub per_partition: BTreeMap<PartitionId, u64>,
}

/// Per-epoch accumulation of telemetry. Raw records are retained up to
/// `max_retained`; the rest are counted and dropped.
#[derive(Debug, Clone)]
pub struct TelemetryLedger {
    max_retained: usize,
    retained: Vec<TxnRecord>,
    counters: LedgerSnapshot,
}

impl TelemetryLedger {
    pub fn new(max_retained: usize) -> Self {
        Self {
            max_retained,
            retained: Vec::new(),
            counters: LedgerSnapshot::default(),
        }
    }

    /// Fold one batch. Returns false for an empty batch, which is only
    /// counted.
    pub fn fold_batch(&mut self, batch: Vec<TxnRecord>) -> bool {
        self.counters.batches += 1;
        if batch.is_empty() {
            self.counters.empty_batches += 1;
            return false;
        }
        for record in batch {
            self.counters.records += 1;
            if record.is_single_partition {
                self.counters.single_partition += 1;
            } else {
                self.counters.multi_partition += 1;
            }
            if let Some(partition) = record.partition {
                *self.counters.per_partition.entry(partition).or_default() += 1;
            }
            if self.retained.len() < self.max_retained {
                self.retained.push(record);
            } else {
                self.counters.dropped += 1;
            }
        }
        true
    }

    pub fn records(&self) -> &[TxnRecord] {
        &self.retained
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            retained: self.retained.len(),
            ..self.counters.clone()
        }
    }

    pub fn clear(&mut self) {
        self.retained.clear();
        self.counters = LedgerSnapshot::default();
    }

    /// Replay retained records into `sample`.
    pub fn replay_into(&self, sample: &mut WorkloadSample, topology: &TopologySnapshot) -> ReplayStats {
        replay_records(&self.retained, sample, topology)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records whose coordinator ran on the initiator's host.
    pub local: u64,
    /// Everything else, unknown coordinators included.
    pub remote: u64,
    /// Skipped single-partition records without a partition.
    pub malformed: u64,
    /// Measured per-partition remote latency samples recorded.
    pub partition_latencies: u64,
}

/// Classify each record and fold it into `sample`.
///
/// A record is local iff its coordinator site lives on its initiator host;
/// unknown coordinator sites count as remote. Each message received on a host
/// other than the initiator's yields a measured remote latency sample for the
/// receiving site's partition.
pub fn replay_records(
    records: &[TxnRecord],
    sample: &mut WorkloadSample,
    topology: &TopologySnapshot,
) -> ReplayStats {
    let mut stats = ReplayStats::default();
    for record in records {
        let key = match (record.is_single_partition, record.partition) {
            (true, Some(partition)) => {
                sample.single_partition_key(&record.procedure, record.initiator_host, partition)
            }
            (true, None) => {
                tracing::warn!(
                    txn_id = record.txn_id,
                    procedure = %record.procedure,
                    initiator = record.initiator_host,
                    "single-partition record without a partition; skipping"
                );
                stats.malformed += 1;
                continue;
            }
            (false, _) => sample.multi_partition_key(&record.procedure, record.initiator_host),
        };

        let locality = match topology.host_of_site(record.coordinator_site) {
            Some(host) if host == record.initiator_host => Locality::Local,
            _ => Locality::Remote,
        };
        match locality {
            Locality::Local => stats.local += 1,
            Locality::Remote => stats.remote += 1,
        }
        sample.record_transaction(&key, record.latency_ns, locality);

        for message in &record.messages {
            let Some(receiver_host) = topology.host_of_site(message.receiver_site) else {
                continue;
            };
            if receiver_host == record.initiator_host {
                continue;
            }
            let Some(partition) = topology.partition_of_site(message.receiver_site) else {
                continue;
            };
            let latency_ns = message.receive_time_ns.saturating_sub(message.send_time_ns);
            sample.record_remote_partition_latency(&key, partition, latency_ns, false);
            stats.partition_latencies += 1;
        }
    }
    stats
}
