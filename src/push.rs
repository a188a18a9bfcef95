//! Ingestion push boundary.
//!
//! Agent sources do not get pulled by the scanner; their lines arrive here
//! in batches. The tail agent resubmits a whole batch after any failed
//! push, so every line is fingerprinted and checked against the shared
//! [`DedupCache`] before it reaches the parser.
//!
//! Two identical lines inside the dedup TTL are indistinguishable from a
//! resubmission and only the first is kept.
//!
//! Fresh lines reach the parser in chunks of [`INGEST_CHUNK_LINES`]. When a
//! chunk fails, its fingerprints and those of every later chunk are
//! forgotten so the retry delivers them; earlier chunks are already in the
//! sink and stay marked.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::dedup::DedupCache;
use crate::models::{ParseWindow, ScanReport};
use crate::traits::LineParser;

/// Lines per parser call, matching the default sink batch.
pub const INGEST_CHUNK_LINES: usize = 500;

/// One pushed batch of raw lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestBatch {
    pub website_id: String,
    pub source_id: String,
    #[serde(default)]
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    /// Lines handed to the parser.
    pub accepted: u64,
    /// Lines dropped as already seen.
    pub duplicates: u64,
    /// Records the parser forwarded.
    pub records: u64,
    /// Accepted lines without a recognisable timestamp.
    pub rejected: u64,
}

pub struct PushIngestor {
    dedup: Arc<DedupCache>,
    parser: Arc<dyn LineParser>,
}

impl PushIngestor {
    pub fn new(dedup: Arc<DedupCache>, parser: Arc<dyn LineParser>) -> Self {
        Self { dedup, parser }
    }

    pub async fn ingest(&self, batch: &IngestBatch) -> Result<IngestResult> {
        if batch.website_id.trim().is_empty() {
            bail!("website_id must not be empty");
        }
        if batch.source_id.trim().is_empty() {
            bail!("source_id must not be empty");
        }

        let mut result = IngestResult::default();
        let mut fresh: Vec<(&str, String)> = Vec::new();
        for line in &batch.lines {
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                continue;
            }
            let fingerprint = line_fingerprint(&batch.website_id, &batch.source_id, line);
            if self.dedup.seen(&fingerprint) {
                result.duplicates += 1;
                continue;
            }
            fresh.push((line, fingerprint));
        }
        result.accepted = fresh.len() as u64;

        if fresh.is_empty() {
            debug!(
                website = %batch.website_id,
                source = %batch.source_id,
                duplicates = result.duplicates,
                "push batch had nothing new"
            );
            return Ok(result);
        }

        let mut report = ScanReport::new(&batch.website_id);
        for (index, chunk) in fresh.chunks(INGEST_CHUNK_LINES).enumerate() {
            let mut buf = Vec::new();
            for (line, _) in chunk {
                buf.extend_from_slice(line.as_bytes());
                buf.push(b'\n');
            }
            let mut reader: &[u8] = &buf;
            let parsed = self
                .parser
                .parse_lines(
                    &mut reader,
                    &batch.website_id,
                    &batch.source_id,
                    &mut report,
                    ParseWindow::unbounded(),
                )
                .await;

            match parsed {
                Ok(summary) => result.records += summary.records,
                Err(e) => {
                    // Let the agent's retry deliver the rest again
                    let delivered = index * INGEST_CHUNK_LINES;
                    for (_, fingerprint) in &fresh[delivered..] {
                        self.dedup.forget(fingerprint);
                    }
                    warn!(
                        website = %batch.website_id,
                        source = %batch.source_id,
                        delivered,
                        undelivered = fresh.len() - delivered,
                        error = %format!("{:#}", e),
                        "push batch rejected by parser"
                    );
                    return Err(e);
                }
            }
        }
        result.rejected = report.lines_rejected;
        debug!(
            website = %batch.website_id,
            source = %batch.source_id,
            accepted = result.accepted,
            duplicates = result.duplicates,
            records = result.records,
            "push batch ingested"
        );
        Ok(result)
    }
}

/// Hex SHA-256 of `website ␀ source ␀ line`.
pub fn line_fingerprint(website_id: &str, source_id: &str, line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(website_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(line.as_bytes());
    hex::encode(hasher.finalize())
}
