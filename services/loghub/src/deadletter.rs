//! Dead-letter file for records that failed to persist after retry.
//!
//! One JSON record per line (NDJSON), append-only. The file exists for
//! offline recovery tooling; the service itself never reads it back.

use loghub_protocol::LogRecord;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct DeadLetter {
    path: PathBuf,
}

impl DeadLetter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DeadLetter { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `records` as NDJSON lines; returns how many were written.
    ///
    /// A record that fails to serialize is skipped (it was already
    /// sanitized, so this only happens for non-finite floats).
    pub fn append(&self, records: &[LogRecord]) -> std::io::Result<u64> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut written = 0u64;
        let mut buf = String::new();
        for record in records {
            if let Ok(line) = serde_json::to_string(record) {
                buf.push_str(&line);
                buf.push('\n');
                written += 1;
            }
        }
        file.write_all(buf.as_bytes())?;
        file.flush()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loghub_protocol::{Level, Metadata};

    #[test]
    fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dl = DeadLetter::new(dir.path().join("dead-letter.ndjson"));
        let records: Vec<LogRecord> = (0..3)
            .map(|i| LogRecord {
                id: i,
                timestamp: Utc::now(),
                level: Level::Error,
                source: "mcp_calls".to_owned(),
                message: format!("failed {i}"),
                metadata: Metadata::new(),
                tags: Vec::new(),
                trace_id: None,
            })
            .collect();
        assert_eq!(dl.append(&records).expect("append"), 3);
        assert_eq!(dl.append(&records[..1]).expect("append"), 1);

        let contents = std::fs::read_to_string(dl.path()).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        for line in lines {
            let parsed: LogRecord = serde_json::from_str(line).expect("each line is a record");
            assert_eq!(parsed.source, "mcp_calls");
        }
    }
}
