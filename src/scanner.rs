//! Incremental scan pass over one website's sources.
//!
//! For every poll-mode source the scanner lists targets, then walks each
//! target through a small state machine driven only by cheap metadata
//! (size, modification time, etag):
//!
//! ```text
//!   stored state ──▶ reset? ──▶ plan ──┬─▶ Unchanged   (compressed, same size+etag/mtime)
//!                                      ├─▶ UpToDate    (cursor already at size)
//!                                      └─▶ Read{start} ──▶ open ──▶ gunzip? ──▶ parse ──▶ persist
//! ```
//!
//! Sources and targets are processed sequentially. A failure on one target
//! is recorded in the [`ScanReport`] and the pass moves on; state is only
//! written after the parser has accepted the bytes, so a failed or
//! cancelled pass leaves the previous cursor untouched.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, SourceMode, WebsiteConfig};
use crate::db;
use crate::error::{SourceError, SourceResult};
use crate::migrate;
use crate::models::{ParseSummary, ParseWindow, ScanReport, TargetMeta, TargetRef, TargetState};
use crate::parser::{AccessLogParser, JsonLinesSink};
use crate::sources::build_source;
use crate::store::{SqliteStateStore, TargetStateStore};
use crate::stream::{gunzip, skip_bytes, ByteStream};
use crate::traits::{LineParser, LogSource, RecordSink};

pub const DEFAULT_RECENT_WINDOW_DAYS: i64 = 7;

pub struct Scanner {
    store: Arc<dyn TargetStateStore>,
    parser: Arc<dyn LineParser>,
    recent_window: Duration,
}

/// What one target pass amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOutcome {
    /// Compressed object whose size and etag (or mtime) still match.
    Unchanged,
    /// Cursor already at the reported size; only metadata was refreshed.
    UpToDate,
    Parsed(ParseSummary),
}

/// Read strategy chosen for a target before any bytes are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPlan {
    Unchanged,
    UpToDate,
    Read { start: u64 },
}

impl Scanner {
    pub fn new(store: Arc<dyn TargetStateStore>, parser: Arc<dyn LineParser>) -> Self {
        Self {
            store,
            parser,
            recent_window: Duration::days(DEFAULT_RECENT_WINDOW_DAYS),
        }
    }

    /// Backfill floor for targets seen for the first time.
    pub fn with_recent_window_days(mut self, days: i64) -> Self {
        if days > 0 {
            self.recent_window = Duration::days(days);
        }
        self
    }

    /// Run one pass over every poll-mode source of `website`.
    pub async fn scan_website(
        &self,
        website: &WebsiteConfig,
        cancel: &CancellationToken,
    ) -> ScanReport {
        let mut report = ScanReport::new(&website.id);

        for source_config in &website.sources {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if source_config.mode == SourceMode::Stream {
                debug!(
                    website = %website.id,
                    source = %source_config.id,
                    "skipping stream-mode source"
                );
                continue;
            }
            let source = match build_source(&website.id, source_config) {
                Ok(source) => source,
                Err(e) => {
                    warn!(
                        website = %website.id,
                        source = %source_config.id,
                        error = %format!("{:#}", e),
                        "source unavailable"
                    );
                    report.record_failure(&source_config.id, None, &e);
                    continue;
                }
            };
            self.scan_source(source.as_ref(), &mut report, cancel).await;
            if report.cancelled {
                break;
            }
        }

        info!(
            website = %website.id,
            targets = report.targets_scanned,
            unchanged = report.targets_unchanged,
            records = report.records_parsed,
            bytes = report.bytes_consumed,
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "scan pass finished"
        );
        report
    }

    /// Scan every target of one source, accumulating into `report`.
    pub async fn scan_source(
        &self,
        source: &dyn LogSource,
        report: &mut ScanReport,
        cancel: &CancellationToken,
    ) {
        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = source.list_targets() => Some(result),
        };
        let targets = match listed {
            None => {
                report.cancelled = true;
                return;
            }
            Some(Ok(targets)) => targets,
            Some(Err(e)) => {
                let e = anyhow::Error::from(e).context("failed to list targets");
                warn!(
                    website = %report.website_id,
                    source = %source.id(),
                    error = %format!("{:#}", e),
                    "listing failed"
                );
                report.record_failure(source.id(), None, &e);
                return;
            }
        };
        debug!(
            website = %report.website_id,
            source = %source.id(),
            targets = targets.len(),
            "listed targets"
        );

        for target in &targets {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.scan_target(source, target, report) => Some(result),
            };
            match outcome {
                None => {
                    info!(website = %report.website_id, target = %target.key, "scan cancelled");
                    report.cancelled = true;
                    return;
                }
                Some(Ok(outcome)) => {
                    report.targets_scanned += 1;
                    match outcome {
                        TargetOutcome::Unchanged | TargetOutcome::UpToDate => {
                            report.targets_unchanged += 1;
                        }
                        TargetOutcome::Parsed(summary) => {
                            report.records_parsed += summary.records;
                            report.bytes_consumed += summary.bytes_consumed;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        website = %report.website_id,
                        source = %source.id(),
                        target = %target.key,
                        error = %format!("{:#}", e),
                        "target scan failed"
                    );
                    report.record_failure(source.id(), Some(&target.key), &e);
                }
            }
        }
    }

    /// Advance one target and persist its new state.
    pub async fn scan_target(
        &self,
        source: &dyn LogSource,
        target: &TargetRef,
        report: &mut ScanReport,
    ) -> Result<TargetOutcome> {
        let mut meta = target.meta.clone();
        if meta.is_bare() {
            meta = source
                .stat(target)
                .await
                .with_context(|| format!("failed to stat {}", target.key))?;
        }

        let state_key = target.state_key();
        let stored = self.store.get(&target.website_id, &state_key).await?;
        let mut known = stored.is_some();
        let mut state = stored.unwrap_or_default();
        if state.recent_cutoff_ts == 0 {
            state.recent_cutoff_ts = (Utc::now() - self.recent_window).timestamp();
        }

        if known && needs_reset(&state, &meta) {
            info!(
                website = %target.website_id,
                target = %target.key,
                last_size = state.last_size,
                size = meta.size,
                "target rotated or truncated, resetting cursor"
            );
            state = state.reset();
            known = false;
        }

        let start = match plan_read(&state, &meta, known) {
            ReadPlan::Unchanged => return Ok(TargetOutcome::Unchanged),
            ReadPlan::UpToDate => {
                state.observe(&meta);
                self.store
                    .set(&target.website_id, &state_key, &state)
                    .await?;
                return Ok(TargetOutcome::UpToDate);
            }
            ReadPlan::Read { start } => start,
        };

        let stream = open_at(source, target, start)
            .await
            .with_context(|| format!("failed to open {}", target.key))?;
        let stream = if meta.compressed {
            gunzip(stream)
        } else {
            stream
        };
        let mut reader = BufReader::new(stream);

        let window = if known {
            ParseWindow::unbounded()
        } else {
            ParseWindow::since(state.recent_cutoff_ts)
        };
        let summary = self
            .parser
            .parse_lines(
                &mut reader,
                &target.website_id,
                &target.source_id,
                report,
                window,
            )
            .await
            .with_context(|| format!("failed to read {}", target.key))?;

        state.record_parsed_range(summary.min_ts, summary.max_ts);
        state.widen_last_timestamp(meta.mod_time_unix());
        state.last_offset = if meta.compressed {
            meta.size
        } else {
            start + summary.bytes_consumed
        };
        state.backfill_done = true;
        state.observe(&meta);
        self.store
            .set(&target.website_id, &state_key, &state)
            .await?;

        if summary.records > 0 {
            info!(
                website = %target.website_id,
                source = %target.source_id,
                target = %target.key,
                records = summary.records,
                offset = state.last_offset,
                "target scanned"
            );
        }
        Ok(TargetOutcome::Parsed(summary))
    }
}

/// Metadata-only rotation/truncation check against a stored state.
///
/// `meta` must be resolved (bare listings are `stat`ed first), so a size of
/// zero is a real truncation. Same-size content replacement on a backend
/// without etags goes unnoticed.
pub fn needs_reset(state: &TargetState, meta: &TargetMeta) -> bool {
    let shrank = state.last_size > 0 && meta.size < state.last_size;
    let replaced = !meta.etag.is_empty()
        && !state.last_etag.is_empty()
        && meta.etag != state.last_etag
        && meta.size <= state.last_size;
    let stale_offset = state.last_offset > meta.size;
    shrank || replaced || stale_offset
}

/// A compressed object is unchanged when its size matches and either its
/// etag matches or, lacking an etag, its modification time does.
pub fn compressed_unchanged(state: &TargetState, meta: &TargetMeta) -> bool {
    if meta.size != state.last_size {
        return false;
    }
    if meta.etag.is_empty() {
        meta.mod_time_unix() == state.last_mod_time
    } else {
        meta.etag == state.last_etag
    }
}

/// Choose how to read a target. `known` is false on first encounter and
/// right after a reset.
pub fn plan_read(state: &TargetState, meta: &TargetMeta, known: bool) -> ReadPlan {
    if meta.compressed {
        if known && compressed_unchanged(state, meta) {
            return ReadPlan::Unchanged;
        }
        return ReadPlan::Read { start: 0 };
    }

    let start = if known { state.last_offset } else { 0 };
    if meta.size > 0 && start >= meta.size {
        return ReadPlan::UpToDate;
    }
    ReadPlan::Read { start }
}

/// Open `target` positioned at `start`, falling back to a from-the-start
/// read plus skip when the backend refuses ranges.
async fn open_at(source: &dyn LogSource, target: &TargetRef, start: u64) -> Result<ByteStream> {
    match source.open_range(target, start, None).await {
        Ok(stream) => Ok(stream),
        Err(SourceError::RangeNotSupported) => {
            debug!(
                source = %source.id(),
                target = %target.key,
                skip = start,
                "range read unavailable, reading from start"
            );
            let mut stream = open_from_start(source, target).await?;
            skip_bytes(&mut stream, start)
                .await
                .with_context(|| format!("failed to skip {} bytes", start))?;
            Ok(stream)
        }
        Err(e) => Err(e.into()),
    }
}

async fn open_from_start(source: &dyn LogSource, target: &TargetRef) -> SourceResult<ByteStream> {
    match source.open_stream(target).await {
        Err(SourceError::StreamNotSupported) => source.open_range(target, 0, None).await,
        other => other,
    }
}

/// One scan pass per selected website against the SQLite state store,
/// writing records as JSON lines. Returns `false` if any website reported
/// failures or the pass was interrupted.
///
/// The summary goes to stdout when records are written to a file, and to
/// stderr when stdout carries the records.
pub async fn run_scan(
    config: &Config,
    website: Option<&str>,
    output: Option<&Path>,
) -> Result<bool> {
    let websites = config.select_websites(website)?;

    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = Arc::new(SqliteStateStore::new(pool.clone()));

    let sink: Arc<dyn RecordSink> = match output {
        Some(path) => Arc::new(JsonLinesSink::file(path).await?),
        None => Arc::new(JsonLinesSink::stdout()),
    };
    let scanner = Scanner::new(store, Arc::new(AccessLogParser::new(sink)))
        .with_recent_window_days(config.scan.recent_window_days);

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut ok = true;
    for website in websites {
        let report = scanner.scan_website(website, &cancel).await;
        let summary = format_summary(&report);
        if output.is_some() {
            println!("{}", summary);
        } else {
            eprintln!("{}", summary);
        }
        ok &= report.is_success();
        if report.cancelled {
            break;
        }
    }

    ctrl_c.abort();
    pool.close().await;
    Ok(ok)
}

fn format_summary(report: &ScanReport) -> String {
    let mut out = format!(
        "{}: {} targets scanned ({} unchanged), {} records parsed, {} bytes consumed, {} lines rejected, {} failures",
        report.website_id,
        report.targets_scanned,
        report.targets_unchanged,
        report.records_parsed,
        report.bytes_consumed,
        report.lines_rejected,
        report.failures.len()
    );
    if report.cancelled {
        out.push_str(" (cancelled)");
    }
    for failure in &report.failures {
        let target = failure.target.as_deref().unwrap_or("-");
        out.push_str(&format!(
            "\n  FAILED {} {}: {}",
            failure.source_id, target, failure.message
        ));
    }
    out
}
