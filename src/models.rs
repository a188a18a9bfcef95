//! Core data models used throughout logscan.
//!
//! These types describe the scannable objects a backend exposes, the
//! persisted cursor kept for each of them, and the summaries that flow
//! between the scanner and the line parser.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SourceError, SourceResult};

/// Backend variant behind a configured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SourceType {
    Local,
    Sftp,
    S3,
    Agent,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Local => "local",
            SourceType::Sftp => "sftp",
            SourceType::S3 => "s3",
            SourceType::Agent => "agent",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for SourceType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(SourceType::Local),
            "sftp" => Ok(SourceType::Sftp),
            "s3" => Ok(SourceType::S3),
            "agent" => Ok(SourceType::Agent),
            other => Err(format!(
                "unknown source type '{}'. Must be local, sftp, s3, or agent",
                other
            )),
        }
    }
}

/// Whether a deployment lets backends serve byte-range reads.
///
/// `Full` is enforced at the backend boundary: any read that would need a
/// range fails with [`SourceError::RangeNotSupported`], which sends the
/// scanner down its read-from-start-and-skip path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum RangePolicy {
    #[default]
    Auto,
    Range,
    Full,
}

impl RangePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangePolicy::Auto => "auto",
            RangePolicy::Range => "range",
            RangePolicy::Full => "full",
        }
    }

    /// Reject reads that need a byte range when the policy forbids them.
    pub fn check(&self, start: u64, end: Option<u64>) -> SourceResult<()> {
        if *self == RangePolicy::Full && (start > 0 || end.is_some()) {
            return Err(SourceError::RangeNotSupported);
        }
        Ok(())
    }
}

impl TryFrom<String> for RangePolicy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(RangePolicy::Auto),
            "range" => Ok(RangePolicy::Range),
            "full" => Ok(RangePolicy::Full),
            other => Err(format!(
                "unknown range_policy '{}'. Must be auto, range, or full",
                other
            )),
        }
    }
}

/// Compression policy for a source's targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Compression {
    /// Infer from a case-insensitive `.gz` suffix on the key.
    #[default]
    Auto,
    Gz,
    None,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Auto => "auto",
            Compression::Gz => "gz",
            Compression::None => "none",
        }
    }

    /// Decide whether `key` names a compressed object under this policy.
    pub fn applies_to(&self, key: &str) -> bool {
        match self {
            Compression::Gz => true,
            Compression::None => false,
            Compression::Auto => key.to_ascii_lowercase().ends_with(".gz"),
        }
    }
}

impl TryFrom<String> for Compression {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Compression::Auto),
            "gz" | "gzip" => Ok(Compression::Gz),
            "none" => Ok(Compression::None),
            other => Err(format!(
                "unknown compression '{}'. Must be auto, gz, or none",
                other
            )),
        }
    }
}

/// How a source's targets are selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// A single literal path.
    Path(String),
    /// A glob pattern (`*`, `?`, `[...]`, `{a,b}`; `*` never crosses `/`).
    Pattern(String),
}

impl Selection {
    pub fn as_str(&self) -> &str {
        match self {
            Selection::Path(p) | Selection::Pattern(p) => p,
        }
    }
}

/// Metadata snapshot for one target, as reported by its backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetMeta {
    /// Authoritative backend-reported length in bytes.
    pub size: u64,
    pub mod_time: Option<DateTime<Utc>>,
    /// Opaque change token; empty when the backend has none.
    pub etag: String,
    pub compressed: bool,
}

impl TargetMeta {
    /// A bare reference carries no size, modification time or etag.
    pub fn is_bare(&self) -> bool {
        self.size == 0 && self.mod_time.is_none() && self.etag.is_empty()
    }

    /// Modification time as Unix seconds, `0` when unknown.
    pub fn mod_time_unix(&self) -> i64 {
        self.mod_time.map(|t| t.timestamp()).unwrap_or(0)
    }
}

/// One scannable object produced by a listing call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub website_id: String,
    pub source_id: String,
    /// Backend-specific locator (path or object key).
    pub key: String,
    pub meta: TargetMeta,
}

impl TargetRef {
    /// Key under which this target's [`TargetState`] is stored.
    pub fn state_key(&self) -> String {
        build_target_state_key(&self.source_id, &self.key)
    }
}

/// Compose the `source_id:key` state key. An empty source id yields the bare key.
pub fn build_target_state_key(source_id: &str, key: &str) -> String {
    if source_id.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", source_id, key)
    }
}

/// Persisted read cursor for one target.
///
/// Timestamps are Unix seconds with `0` meaning "not yet observed".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    /// Bytes already consumed from the start of the target.
    pub last_offset: u64,
    pub last_size: u64,
    pub last_etag: String,
    pub last_mod_time: i64,
    pub parsed_min_ts: i64,
    pub parsed_max_ts: i64,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    /// Backfill floor, set once on first encounter.
    pub recent_cutoff_ts: i64,
    pub backfill_done: bool,
}

impl TargetState {
    /// Discard the cursor and change-detection history.
    ///
    /// The timestamp bounds and the backfill floor survive a rotation.
    pub fn reset(&self) -> TargetState {
        TargetState {
            parsed_min_ts: self.parsed_min_ts,
            parsed_max_ts: self.parsed_max_ts,
            first_timestamp: self.first_timestamp,
            last_timestamp: self.last_timestamp,
            recent_cutoff_ts: self.recent_cutoff_ts,
            ..TargetState::default()
        }
    }

    /// Overwrite the last-observed metadata with a fresh snapshot.
    pub fn observe(&mut self, meta: &TargetMeta) {
        self.last_size = meta.size;
        self.last_etag = meta.etag.clone();
        self.last_mod_time = meta.mod_time_unix();
    }

    /// Fold the record timestamps of one pass into the stored bounds.
    ///
    /// Minimums only move down and maximums only move up; `0` inputs are
    /// ignored.
    pub fn record_parsed_range(&mut self, min_ts: i64, max_ts: i64) {
        if min_ts > 0 {
            if self.parsed_min_ts == 0 || min_ts < self.parsed_min_ts {
                self.parsed_min_ts = min_ts;
            }
            if self.first_timestamp == 0 || min_ts < self.first_timestamp {
                self.first_timestamp = min_ts;
            }
        }
        if max_ts > 0 {
            if max_ts > self.parsed_max_ts {
                self.parsed_max_ts = max_ts;
            }
            self.widen_last_timestamp(max_ts);
        }
    }

    pub fn widen_last_timestamp(&mut self, ts: i64) {
        if ts > self.last_timestamp {
            self.last_timestamp = ts;
        }
    }
}

/// Timestamp filter applied by the line parser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseWindow {
    /// Records strictly older than this are not forwarded.
    pub min_ts: Option<i64>,
}

impl ParseWindow {
    pub fn unbounded() -> Self {
        Self { min_ts: None }
    }

    pub fn since(min_ts: i64) -> Self {
        Self {
            min_ts: (min_ts > 0).then_some(min_ts),
        }
    }

    pub fn admits(&self, ts: i64) -> bool {
        self.min_ts.map_or(true, |min| ts >= min)
    }
}

/// What the line parser reports back for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseSummary {
    pub records: u64,
    pub bytes_consumed: u64,
    /// `0` when no record was forwarded.
    pub min_ts: i64,
    pub max_ts: i64,
}

impl ParseSummary {
    pub fn observe(&mut self, ts: i64) {
        if self.min_ts == 0 || ts < self.min_ts {
            self.min_ts = ts;
        }
        if ts > self.max_ts {
            self.max_ts = ts;
        }
    }
}

/// A raw log line forwarded downstream with its parsed timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub website_id: String,
    pub source_id: String,
    pub timestamp: i64,
    pub line: String,
}

/// A soft failure recorded during a scan pass.
#[derive(Debug, Clone, Serialize)]
pub struct ScanFailure {
    pub source_id: String,
    pub target: Option<String>,
    pub message: String,
}

/// Per-website result accumulator for one scan pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub website_id: String,
    pub targets_scanned: u64,
    pub targets_unchanged: u64,
    pub records_parsed: u64,
    pub bytes_consumed: u64,
    /// Lines the parser could not attach a timestamp to.
    pub lines_rejected: u64,
    pub failures: Vec<ScanFailure>,
    pub cancelled: bool,
}

impl ScanReport {
    pub fn new(website_id: &str) -> Self {
        Self {
            website_id: website_id.to_string(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    pub fn record_failure(
        &mut self,
        source_id: &str,
        target: Option<&str>,
        error: &anyhow::Error,
    ) {
        self.failures.push(ScanFailure {
            source_id: source_id.to_string(),
            target: target.map(str::to_string),
            message: format!("{:#}", error),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_detection() {
        assert!(Compression::Auto.applies_to("/var/log/nginx/access.log.2.gz"));
        assert!(Compression::Auto.applies_to("logs/ACCESS.LOG.GZ"));
        assert!(!Compression::Auto.applies_to("/var/log/nginx/access.log"));
        assert!(Compression::Gz.applies_to("access.log"));
        assert!(!Compression::None.applies_to("access.log.gz"));
    }

    #[test]
    fn test_enum_values_are_case_insensitive() {
        assert_eq!(
            RangePolicy::try_from(" FULL ".to_string()).unwrap(),
            RangePolicy::Full
        );
        assert_eq!(
            Compression::try_from("Gz".to_string()).unwrap(),
            Compression::Gz
        );
        assert_eq!(
            SourceType::try_from("S3".to_string()).unwrap(),
            SourceType::S3
        );
        assert!(RangePolicy::try_from("sometimes".to_string()).is_err());
    }

    #[test]
    fn test_full_policy_rejects_ranges() {
        assert!(RangePolicy::Full.check(0, None).is_ok());
        assert!(matches!(
            RangePolicy::Full.check(10, None),
            Err(SourceError::RangeNotSupported)
        ));
        assert!(matches!(
            RangePolicy::Full.check(0, Some(5)),
            Err(SourceError::RangeNotSupported)
        ));
        assert!(RangePolicy::Auto.check(10, Some(20)).is_ok());
    }

    #[test]
    fn test_state_key() {
        assert_eq!(build_target_state_key("nginx", "/a.log"), "nginx:/a.log");
        assert_eq!(build_target_state_key("", "/a.log"), "/a.log");
    }

    #[test]
    fn test_reset_keeps_bounds_and_cutoff() {
        let state = TargetState {
            last_offset: 100,
            last_size: 100,
            last_etag: "abc".into(),
            last_mod_time: 77,
            parsed_min_ts: 10,
            parsed_max_ts: 50,
            first_timestamp: 10,
            last_timestamp: 60,
            recent_cutoff_ts: 42,
            backfill_done: true,
        };
        let reset = state.reset();
        assert_eq!(reset.last_offset, 0);
        assert_eq!(reset.last_size, 0);
        assert!(reset.last_etag.is_empty());
        assert_eq!(reset.last_mod_time, 0);
        assert!(!reset.backfill_done);
        assert_eq!((reset.parsed_min_ts, reset.parsed_max_ts), (10, 50));
        assert_eq!((reset.first_timestamp, reset.last_timestamp), (10, 60));
        assert_eq!(reset.recent_cutoff_ts, 42);
    }

    #[test]
    fn test_parsed_range_only_widens() {
        let mut state = TargetState::default();
        state.record_parsed_range(200, 300);
        state.record_parsed_range(250, 280);
        assert_eq!((state.parsed_min_ts, state.parsed_max_ts), (200, 300));
        state.record_parsed_range(100, 400);
        assert_eq!((state.parsed_min_ts, state.parsed_max_ts), (100, 400));
        assert_eq!((state.first_timestamp, state.last_timestamp), (100, 400));
        state.record_parsed_range(0, 0);
        assert_eq!((state.parsed_min_ts, state.parsed_max_ts), (100, 400));
    }

    #[test]
    fn test_parse_window() {
        assert!(ParseWindow::unbounded().admits(1));
        assert!(ParseWindow::since(0).admits(1));
        let window = ParseWindow::since(100);
        assert!(!window.admits(99));
        assert!(window.admits(100));
    }
}
