//! Extension seams of the scanning pipeline.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               LogSource                  │
//! │  ┌───────┐ ┌──────┐ ┌──────┐ ┌────────┐  │
//! │  │ Local │ │ SFTP │ │  S3  │ │ Agent  │  │
//! │  └───────┘ └──────┘ └──────┘ └────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        Scanner::scan_website()
//!                ▼
//!     LineParser ──▶ RecordSink
//! ```
//!
//! Every backend implements all four [`LogSource`] operations. An operation
//! a backend cannot serve fails with [`SourceError::RangeNotSupported`] or
//! [`SourceError::StreamNotSupported`] instead of being left out, so the
//! scanner keeps one code path for every backend.
//!
//! [`SourceError::RangeNotSupported`]: crate::error::SourceError::RangeNotSupported
//! [`SourceError::StreamNotSupported`]: crate::error::SourceError::StreamNotSupported

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncBufRead;

use crate::error::SourceResult;
use crate::models::{
    LogRecord, ParseSummary, ParseWindow, ScanReport, SourceType, TargetMeta, TargetRef,
};
use crate::stream::ByteStream;

/// A storage backend that exposes log targets for incremental reading.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use logscan::error::{SourceError, SourceResult};
/// use logscan::models::{SourceType, TargetMeta, TargetRef};
/// use logscan::stream::ByteStream;
/// use logscan::traits::LogSource;
///
/// pub struct EmptySource;
///
/// #[async_trait]
/// impl LogSource for EmptySource {
///     fn id(&self) -> &str { "empty" }
///     fn source_type(&self) -> SourceType { SourceType::Agent }
///
///     async fn list_targets(&self) -> SourceResult<Vec<TargetRef>> { Ok(vec![]) }
///
///     async fn open_range(&self, _: &TargetRef, _: u64, _: Option<u64>) -> SourceResult<ByteStream> {
///         Err(SourceError::RangeNotSupported)
///     }
///
///     async fn open_stream(&self, _: &TargetRef) -> SourceResult<ByteStream> {
///         Err(SourceError::StreamNotSupported)
///     }
///
///     async fn stat(&self, _: &TargetRef) -> SourceResult<TargetMeta> {
///         Err(SourceError::StreamNotSupported)
///     }
/// }
/// ```
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Source id, unique within its website.
    fn id(&self) -> &str;

    fn source_type(&self) -> SourceType;

    /// Enumerate everything currently matching the source's selection rule.
    ///
    /// Returns a fresh snapshot on every call.
    async fn list_targets(&self) -> SourceResult<Vec<TargetRef>>;

    /// Open a stream positioned at `start`.
    ///
    /// `end` is exclusive; `None` reads to the current end of the target.
    async fn open_range(
        &self,
        target: &TargetRef,
        start: u64,
        end: Option<u64>,
    ) -> SourceResult<ByteStream>;

    /// Open a whole-object stream from the beginning.
    async fn open_stream(&self, target: &TargetRef) -> SourceResult<ByteStream>;

    /// Fetch authoritative current metadata for `target`.
    async fn stat(&self, target: &TargetRef) -> SourceResult<TargetMeta>;
}

/// Consumer of raw log bytes.
///
/// The scanner only looks at the returned [`ParseSummary`]; what happens to
/// the records is up to the implementation.
#[async_trait]
pub trait LineParser: Send + Sync {
    /// Parse newline-delimited records from `reader`.
    ///
    /// `bytes_consumed` in the summary must count only bytes the parser is
    /// done with, so the caller can resume from `start + bytes_consumed`.
    /// Records older than `window.min_ts` are not forwarded.
    async fn parse_lines(
        &self,
        reader: &mut (dyn AsyncBufRead + Send + Unpin),
        website_id: &str,
        source_id: &str,
        report: &mut ScanReport,
        window: ParseWindow,
    ) -> Result<ParseSummary>;
}

/// Destination for parsed records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write_records(&self, records: &[LogRecord]) -> Result<()>;
}
