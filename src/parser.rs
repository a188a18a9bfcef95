//! Default line parser and record sinks.
//!
//! [`AccessLogParser`] reads newline-terminated lines, pulls the request
//! time out of the common/combined log format (`[10/Oct/2000:13:55:36
//! -0700]`) and forwards `(timestamp, raw line)` records to a
//! [`RecordSink`]. Field extraction beyond the timestamp is left to
//! whatever consumes the records.
//!
//! A trailing line without its `\n` is left unconsumed so the next pass can
//! pick it up once it is complete.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::models::{LogRecord, ParseSummary, ParseWindow, ScanReport};
use crate::traits::{LineParser, RecordSink};

const DEFAULT_BATCH_SIZE: usize = 500;
const CLF_TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

pub struct AccessLogParser {
    sink: Arc<dyn RecordSink>,
    batch_size: usize,
}

impl AccessLogParser {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self {
            sink,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl LineParser for AccessLogParser {
    async fn parse_lines(
        &self,
        reader: &mut (dyn AsyncBufRead + Send + Unpin),
        website_id: &str,
        source_id: &str,
        report: &mut ScanReport,
        window: ParseWindow,
    ) -> Result<ParseSummary> {
        let mut summary = ParseSummary::default();
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .await
                .context("Failed to read log stream")?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            summary.bytes_consumed += n as u64;

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }

            let Some(timestamp) = extract_timestamp(line) else {
                report.lines_rejected += 1;
                continue;
            };
            if !window.admits(timestamp) {
                continue;
            }

            summary.records += 1;
            summary.observe(timestamp);
            batch.push(LogRecord {
                website_id: website_id.to_string(),
                source_id: source_id.to_string(),
                timestamp,
                line: line.to_string(),
            });
            if batch.len() >= self.batch_size {
                self.sink.write_records(&batch).await?;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            self.sink.write_records(&batch).await?;
        }
        Ok(summary)
    }
}

/// Unix timestamp of the first bracketed common-log time field, falling
/// back to an RFC 3339 first token (`2024-05-01T10:00:00Z ...`).
pub fn extract_timestamp(line: &str) -> Option<i64> {
    let mut rest = line;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else {
            break;
        };
        if let Ok(ts) = DateTime::parse_from_str(&after[..close], CLF_TIME_FORMAT) {
            return Some(ts.timestamp());
        }
        rest = &after[close + 1..];
    }

    let first = line.split_whitespace().next()?;
    DateTime::parse_from_rfc3339(first)
        .ok()
        .map(|ts| ts.timestamp())
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.records.lock().iter().map(|r| r.line.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write_records(&self, records: &[LogRecord]) -> Result<()> {
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}

/// Writes one JSON object per record, to stdout or an append-mode file.
pub struct JsonLinesSink {
    out: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl JsonLinesSink {
    pub fn stdout() -> Self {
        Self {
            out: tokio::sync::Mutex::new(Box::new(tokio::io::stdout())),
        }
    }

    pub async fn file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open output file: {}", path.display()))?;
        Ok(Self {
            out: tokio::sync::Mutex::new(Box::new(file)),
        })
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn write_records(&self, records: &[LogRecord]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        let mut out = self.out.lock().await;
        out.write_all(&buf).await?;
        out.flush().await?;
        Ok(())
    }
}
