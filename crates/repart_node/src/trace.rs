//! JSON-lines telemetry traces: one `TxnRecord` per line.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use repart_core::TxnRecord;

pub fn write_trace<'a>(
    path: &Path,
    records: impl IntoIterator<Item = &'a TxnRecord>,
) -> anyhow::Result<usize> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    let mut written = 0usize;
    for record in records {
        serde_json::to_writer(&mut out, record)
            .with_context(|| format!("encode txn {}", record.txn_id))?;
        out.write_all(b"\n")
            .with_context(|| format!("write {}", path.display()))?;
        written += 1;
    }
    out.flush()
        .with_context(|| format!("flush {}", path.display()))?;
    Ok(written)
}

/// Read a trace back. Blank lines are skipped; a malformed line fails the
/// whole read with its line number.
pub fn read_trace(path: &Path) -> anyhow::Result<Vec<TxnRecord>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: TxnRecord = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_bad_line_number() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.jsonl");
        std::fs::write(
            &path,
            "{\"txn_id\":1,\"procedure\":\"P\",\"is_single_partition\":false,\"initiator_host\":100,\"initiator_site\":1,\"coordinator_site\":1,\"latency_ns\":5}\n\nnot json\n",
        )
        .expect("write");
        let err = read_trace(&path).expect_err("malformed line");
        assert!(format!("{err:#}").contains("line 3"), "{err:#}");
    }

    #[test]
    fn missing_file_names_path() {
        let err = read_trace(Path::new("/nonexistent/trace.jsonl")).expect_err("missing");
        assert!(format!("{err:#}").contains("/nonexistent/trace.jsonl"));
    }
}
