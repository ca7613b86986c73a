//! Trace round trip: generate, write, read back and replay.
//!
//! Verification:
//! - The JSON-lines file reproduces the generated records exactly.
//! - Replaying it through a fresh controller moves the hot partition.

mod common;

use std::time::Duration;

use repart_node::driver::{generate_trace, replay_trace, ReplayOptions};
use repart_node::trace::{read_trace, write_trace};

#[tokio::test(start_paused = true)]
async fn recorded_trace_replays_into_a_repartition() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("trace.jsonl");

    let records = generate_trace(common::layout(), common::profile(), 7, 3_000).expect("generate");
    assert_eq!(records.len(), 3_000);
    assert_eq!(write_trace(&path, &records).expect("write"), 3_000);
    let loaded = read_trace(&path).expect("read");
    assert_eq!(loaded, records);

    let summary = replay_trace(
        loaded,
        ReplayOptions {
            layout: common::layout(),
            copy_delay: common::COPY_DELAY,
            batch_interval: Duration::from_millis(100),
            settle: Duration::from_secs(3),
            config: common::config(),
        },
    )
    .await
    .expect("replay");

    assert_eq!(summary.records_sent, 3_000);
    assert_eq!(summary.final_placement.host_of(201), Some(100));
    assert!(summary.metrics.migrations_completed >= 1);
}
