use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use logscan::config::parse_config;
use logscan::connector_fs::LocalSource;
use logscan::db;
use logscan::error::{SourceError, SourceResult};
use logscan::migrate;
use logscan::models::{
    RangePolicy, ScanReport, Selection, SourceType, TargetMeta, TargetRef, TargetState,
};
use logscan::parser::{AccessLogParser, MemorySink};
use logscan::scanner::{Scanner, TargetOutcome};
use logscan::store::{MemoryStateStore, SqliteStateStore, TargetStateStore};
use logscan::stream::ByteStream;
use logscan::traits::LogSource;

fn line_at(ts: DateTime<Utc>, path: &str) -> String {
    format!(
        "10.0.0.1 - - [{}] \"GET {} HTTP/1.1\" 200 512\n",
        ts.format("%d/%b/%Y:%H:%M:%S +0000"),
        path
    )
}

fn recent_line(path: &str) -> String {
    line_at(Utc::now() - Duration::minutes(5), path)
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

struct FakeObject {
    data: Vec<u8>,
    etag: String,
    mod_time: Option<DateTime<Utc>>,
    compressed: bool,
}

/// In-memory backend with switchable capabilities and failure injection.
struct FakeSource {
    id: String,
    objects: Mutex<BTreeMap<String, FakeObject>>,
    range_policy: RangePolicy,
    supports_stream: bool,
    fail_listing: bool,
    fail_open: Option<String>,
    bare_listing: bool,
    range_opens: AtomicUsize,
    stream_opens: AtomicUsize,
    stats: AtomicUsize,
}

impl FakeSource {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            range_policy: RangePolicy::Auto,
            supports_stream: true,
            fail_listing: false,
            fail_open: None,
            bare_listing: false,
            range_opens: AtomicUsize::new(0),
            stream_opens: AtomicUsize::new(0),
            stats: AtomicUsize::new(0),
        }
    }

    fn put(&self, key: &str, data: Vec<u8>, etag: &str, compressed: bool) {
        self.put_at(key, data, etag, compressed, Some(Utc::now()));
    }

    fn put_at(
        &self,
        key: &str,
        data: Vec<u8>,
        etag: &str,
        compressed: bool,
        mod_time: Option<DateTime<Utc>>,
    ) {
        self.objects.lock().insert(
            key.to_string(),
            FakeObject {
                data,
                etag: etag.to_string(),
                mod_time,
                compressed,
            },
        );
    }

    fn append(&self, key: &str, more: &[u8]) {
        if let Some(object) = self.objects.lock().get_mut(key) {
            object.data.extend_from_slice(more);
        }
    }

    fn meta(object: &FakeObject) -> TargetMeta {
        TargetMeta {
            size: object.data.len() as u64,
            mod_time: object.mod_time,
            etag: object.etag.clone(),
            compressed: object.compressed,
        }
    }

    fn bytes(&self, key: &str) -> SourceResult<Vec<u8>> {
        if self.fail_open.as_deref() == Some(key) {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "permission denied",
            )));
        }
        self.objects
            .lock()
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| SourceError::Io(std::io::ErrorKind::NotFound.into()))
    }
}

#[async_trait]
impl LogSource for FakeSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::S3
    }

    async fn list_targets(&self) -> SourceResult<Vec<TargetRef>> {
        if self.fail_listing {
            return Err(SourceError::Config("listing refused".to_string()));
        }
        Ok(self
            .objects
            .lock()
            .iter()
            .map(|(key, object)| TargetRef {
                website_id: "site".to_string(),
                source_id: self.id.clone(),
                key: key.clone(),
                meta: if self.bare_listing {
                    TargetMeta::default()
                } else {
                    Self::meta(object)
                },
            })
            .collect())
    }

    async fn open_range(
        &self,
        target: &TargetRef,
        start: u64,
        end: Option<u64>,
    ) -> SourceResult<ByteStream> {
        self.range_opens.fetch_add(1, Ordering::SeqCst);
        self.range_policy.check(start, end)?;
        let data = self.bytes(&target.key)?;
        let start = (start as usize).min(data.len());
        Ok(Box::pin(std::io::Cursor::new(data[start..].to_vec())))
    }

    async fn open_stream(&self, target: &TargetRef) -> SourceResult<ByteStream> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        if !self.supports_stream {
            return Err(SourceError::StreamNotSupported);
        }
        Ok(Box::pin(std::io::Cursor::new(self.bytes(&target.key)?)))
    }

    async fn stat(&self, target: &TargetRef) -> SourceResult<TargetMeta> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .get(&target.key)
            .map(Self::meta)
            .ok_or_else(|| SourceError::Io(std::io::ErrorKind::NotFound.into()))
    }
}

fn scanner() -> (Scanner, Arc<MemoryStateStore>, Arc<MemorySink>) {
    let store = Arc::new(MemoryStateStore::new());
    let sink = Arc::new(MemorySink::new());
    let scanner = Scanner::new(store.clone(), Arc::new(AccessLogParser::new(sink.clone())));
    (scanner, store, sink)
}

async fn scan(scanner: &Scanner, source: &dyn LogSource) -> ScanReport {
    let mut report = ScanReport::new("site");
    scanner
        .scan_source(source, &mut report, &CancellationToken::new())
        .await;
    report
}

async fn stored(store: &MemoryStateStore, source: &str, key: &str) -> TargetState {
    store
        .get("site", &format!("{}:{}", source, key))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_range_incapable_backend_reads_from_start_and_skips() {
    let mut source = FakeSource::new("bucket");
    source.range_policy = RangePolicy::Full;
    let first = recent_line("/a");
    source.put("access.log", first.clone().into_bytes(), "", false);

    let (scanner, store, sink) = scanner();
    let report = scan(&scanner, &source).await;
    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(report.records_parsed, 1);
    assert_eq!(source.stream_opens.load(Ordering::SeqCst), 0);

    let second = recent_line("/b");
    source.append("access.log", second.as_bytes());
    let report = scan(&scanner, &source).await;
    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(report.records_parsed, 1);
    assert_eq!(report.bytes_consumed, second.len() as u64);
    assert_eq!(source.stream_opens.load(Ordering::SeqCst), 1);

    let lines = sink.lines();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].contains("GET /b"));
    assert_eq!(
        stored(&store, "bucket", "access.log").await.last_offset,
        (first.len() + second.len()) as u64
    );
}

#[tokio::test]
async fn test_fallback_uses_range_from_zero_without_stream_support() {
    let mut source = FakeSource::new("bucket");
    source.range_policy = RangePolicy::Full;
    source.supports_stream = false;
    source.put("access.log", recent_line("/a").into_bytes(), "", false);

    let (scanner, _store, sink) = scanner();
    scan(&scanner, &source).await;
    source.append("access.log", recent_line("/b").as_bytes());
    let report = scan(&scanner, &source).await;

    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(report.records_parsed, 1);
    assert_eq!(source.stream_opens.load(Ordering::SeqCst), 1);
    // open_range(start) refused, then open_range(0) accepted, on top of the first pass
    assert_eq!(source.range_opens.load(Ordering::SeqCst), 3);
    assert_eq!(sink.len(), 2);
}

#[tokio::test]
async fn test_listing_failure_is_recorded() {
    let mut source = FakeSource::new("bucket");
    source.fail_listing = true;

    let (scanner, store, _sink) = scanner();
    let report = scan(&scanner, &source).await;
    assert!(!report.is_success());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].source_id, "bucket");
    assert!(report.failures[0].target.is_none());
    assert!(report.failures[0].message.contains("listing refused"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_failed_target_does_not_stop_the_pass() {
    let mut source = FakeSource::new("bucket");
    source.fail_open = Some("a.log".to_string());
    source.put("a.log", recent_line("/a").into_bytes(), "", false);
    source.put("b.log", recent_line("/b").into_bytes(), "", false);

    let (scanner, store, sink) = scanner();
    let report = scan(&scanner, &source).await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target.as_deref(), Some("a.log"));
    assert_eq!(report.targets_scanned, 1);
    assert_eq!(sink.len(), 1);
    // No state for the failed target, so the next pass retries it whole
    assert!(store
        .get("site", "bucket:a.log")
        .await
        .unwrap()
        .is_none());
    assert!(stored(&store, "bucket", "b.log").await.backfill_done);
}

#[tokio::test]
async fn test_compressed_target_rescanned_only_on_change() {
    let source = FakeSource::new("bucket");
    let plain = format!("{}{}", recent_line("/a"), recent_line("/b"));
    let packed = gzip(plain.as_bytes());
    let packed_len = packed.len() as u64;
    source.put("access.log.1.gz", packed, "\"v1\"", true);

    let (scanner, store, sink) = scanner();
    let report = scan(&scanner, &source).await;
    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(report.records_parsed, 2);
    assert_eq!(
        stored(&store, "bucket", "access.log.1.gz").await.last_offset,
        packed_len
    );

    let report = scan(&scanner, &source).await;
    assert_eq!(report.targets_unchanged, 1);
    assert_eq!(report.records_parsed, 0);
    assert_eq!(sink.len(), 2);

    // Replaced with more content: the whole object is read again
    let plain = format!("{}{}", plain, recent_line("/c"));
    source.put("access.log.1.gz", gzip(plain.as_bytes()), "\"v2\"", true);
    let report = scan(&scanner, &source).await;
    assert_eq!(report.targets_unchanged, 0);
    assert_eq!(report.records_parsed, 3);
    assert_eq!(sink.len(), 5);
}

#[tokio::test]
async fn test_compressed_target_without_etag_compares_mod_time() {
    let source = FakeSource::new("sftp");
    let packed = gzip(recent_line("/a").as_bytes());
    let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    source.put_at("old.gz", packed.clone(), "", true, Some(t1));

    let (scanner, _store, sink) = scanner();
    scan(&scanner, &source).await;
    let report = scan(&scanner, &source).await;
    assert_eq!(report.targets_unchanged, 1);

    source.put_at("old.gz", packed, "", true, Some(t1 + Duration::seconds(1)));
    let report = scan(&scanner, &source).await;
    assert_eq!(report.targets_unchanged, 0);
    assert_eq!(sink.len(), 2);
}

#[tokio::test]
async fn test_rotated_object_resets_cursor() {
    let source = FakeSource::new("bucket");
    let old = format!("{}{}", recent_line("/a"), recent_line("/b"));
    source.put("access.log", old.into_bytes(), "\"v1\"", false);

    let (scanner, store, sink) = scanner();
    scan(&scanner, &source).await;

    // Same name, new shorter content
    let fresh = recent_line("/c");
    source.put("access.log", fresh.clone().into_bytes(), "\"v2\"", false);
    let report = scan(&scanner, &source).await;
    assert_eq!(report.records_parsed, 1);
    assert!(sink.lines()[2].contains("GET /c"));

    let state = stored(&store, "bucket", "access.log").await;
    assert_eq!(state.last_offset, fresh.len() as u64);
    assert_eq!(state.last_etag, "\"v2\"");
}

#[tokio::test]
async fn test_local_truncation_rereads_from_start() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("access.log");
    std::fs::write(
        &path,
        format!("{}{}{}", recent_line("/a"), recent_line("/b"), recent_line("/c")),
    )
    .unwrap();
    let source = LocalSource::new("site", "nginx", Selection::Path(path.display().to_string()));

    let (scanner, _store, sink) = scanner();
    let report = scan(&scanner, &source).await;
    assert_eq!(report.records_parsed, 3);

    std::fs::write(&path, recent_line("/d")).unwrap();
    let report = scan(&scanner, &source).await;
    assert_eq!(report.records_parsed, 1);
    assert!(sink.lines()[3].contains("GET /d"));
}

#[tokio::test]
async fn test_truncate_to_empty_then_regrow_reads_everything() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("access.log");
    std::fs::write(&path, recent_line("/a").repeat(3)).unwrap();
    let key = path.display().to_string();
    let source = LocalSource::new("site", "nginx", Selection::Path(key.clone()));

    let (scanner, store, sink) = scanner();
    let report = scan(&scanner, &source).await;
    assert_eq!(report.records_parsed, 3);

    // copytruncate leaves an empty file behind
    std::fs::write(&path, "").unwrap();
    let report = scan(&scanner, &source).await;
    assert!(report.is_success(), "{:?}", report.failures);
    let state = stored(&store, "nginx", &key).await;
    assert_eq!(state.last_offset, 0);
    assert_eq!(state.last_size, 0);

    // New content grows past the old cursor
    std::fs::write(&path, recent_line("/b").repeat(6)).unwrap();
    let report = scan(&scanner, &source).await;
    assert_eq!(report.records_parsed, 6);
    assert_eq!(sink.len(), 9);
    assert!(sink.lines()[3].contains("GET /b"));
}

#[tokio::test]
async fn test_rotation_only_widens_timestamp_bounds() {
    let source = FakeSource::new("bucket");
    let t1 = Utc::now() - Duration::hours(2);
    let t2 = Utc::now() - Duration::hours(1);
    source.put(
        "access.log",
        format!("{}{}", line_at(t1, "/a"), line_at(t2, "/b")).into_bytes(),
        "\"v1\"",
        false,
    );

    let (scanner, store, _sink) = scanner();
    scan(&scanner, &source).await;
    let before = stored(&store, "bucket", "access.log").await;
    assert_eq!(before.first_timestamp, t1.timestamp());

    source.put("access.log", recent_line("/c").into_bytes(), "\"v2\"", false);
    let report = scan(&scanner, &source).await;
    assert_eq!(report.records_parsed, 1);

    let after = stored(&store, "bucket", "access.log").await;
    assert_eq!(after.last_etag, "\"v2\"");
    assert!(after.parsed_min_ts <= before.parsed_min_ts);
    assert!(after.first_timestamp <= before.first_timestamp);
    assert!(after.parsed_max_ts >= before.parsed_max_ts);
    assert!(after.last_timestamp >= before.last_timestamp);
    assert_eq!(after.recent_cutoff_ts, before.recent_cutoff_ts);
}

#[tokio::test]
async fn test_rescan_without_changes_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("access.log");
    std::fs::write(&path, recent_line("/a")).unwrap();
    let source = LocalSource::new("site", "nginx", Selection::Path(path.display().to_string()));

    let (scanner, store, sink) = scanner();
    scan(&scanner, &source).await;
    let before = stored(&store, "nginx", &path.display().to_string()).await;

    for _ in 0..3 {
        let report = scan(&scanner, &source).await;
        assert!(report.is_success());
        assert_eq!(report.targets_unchanged, 1);
        assert_eq!(report.records_parsed, 0);
    }
    assert_eq!(sink.len(), 1);
    let after = stored(&store, "nginx", &path.display().to_string()).await;
    assert_eq!(after.last_offset, before.last_offset);
    assert_eq!(after.recent_cutoff_ts, before.recent_cutoff_ts);
}

#[tokio::test]
async fn test_partial_trailing_line_is_resumed() {
    let source = FakeSource::new("bucket");
    let complete = recent_line("/a");
    let partial = recent_line("/b");
    let (head, tail) = partial.split_at(20);
    source.put(
        "access.log",
        format!("{}{}", complete, head).into_bytes(),
        "",
        false,
    );

    let (scanner, store, sink) = scanner();
    let report = scan(&scanner, &source).await;
    assert_eq!(report.records_parsed, 1);
    assert_eq!(
        stored(&store, "bucket", "access.log").await.last_offset,
        complete.len() as u64
    );

    source.append("access.log", tail.as_bytes());
    let report = scan(&scanner, &source).await;
    assert_eq!(report.records_parsed, 1);
    assert_eq!(sink.lines()[1], partial.trim_end());
}

#[tokio::test]
async fn test_backfill_floor_and_timestamp_bounds() {
    let source = FakeSource::new("bucket");
    let ancient = line_at(Utc::now() - Duration::days(30), "/old");
    let t1 = Utc::now() - Duration::hours(2);
    let t2 = Utc::now() - Duration::hours(1);
    let mod_time = Utc::now();
    source.put_at(
        "access.log",
        format!("{}{}{}", ancient, line_at(t1, "/a"), line_at(t2, "/b")).into_bytes(),
        "",
        false,
        Some(mod_time),
    );

    let (scanner, store, sink) = scanner();
    let report = scan(&scanner, &source).await;
    assert_eq!(report.records_parsed, 2);
    assert_eq!(sink.len(), 2);
    assert!(sink.records().iter().all(|r| !r.line.contains("/old")));

    let state = stored(&store, "bucket", "access.log").await;
    assert_eq!(state.parsed_min_ts, t1.timestamp());
    assert_eq!(state.parsed_max_ts, t2.timestamp());
    assert_eq!(state.first_timestamp, t1.timestamp());
    assert_eq!(state.last_timestamp, mod_time.timestamp());
    assert!(state.recent_cutoff_ts > 0);
    assert!(state.backfill_done);
    // Filtered lines still advance the cursor
    assert_eq!(state.last_offset, state.last_size);

    // Once known, appended lines are not held to the backfill floor
    source.append("access.log", ancient.as_bytes());
    let report = scan(&scanner, &source).await;
    assert_eq!(report.records_parsed, 1);
    let state = stored(&store, "bucket", "access.log").await;
    assert!(state.parsed_min_ts < t1.timestamp());
    assert_eq!(state.parsed_max_ts, t2.timestamp());
}

#[tokio::test]
async fn test_bare_listing_is_stated() {
    let mut source = FakeSource::new("bucket");
    source.bare_listing = true;
    source.put("access.log", recent_line("/a").into_bytes(), "", false);

    let (scanner, _store, _sink) = scanner();
    let target = source.list_targets().await.unwrap().remove(0);
    let mut report = ScanReport::new("site");
    let outcome = scanner
        .scan_target(&source, &target, &mut report)
        .await
        .unwrap();
    assert!(matches!(outcome, TargetOutcome::Parsed(s) if s.records == 1));
    assert_eq!(source.stats.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_pass_persists_nothing() {
    let source = FakeSource::new("bucket");
    source.put("access.log", recent_line("/a").into_bytes(), "", false);

    let (scanner, store, sink) = scanner();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut report = ScanReport::new("site");
    scanner.scan_source(&source, &mut report, &cancel).await;

    assert!(report.cancelled);
    assert!(!report.is_success());
    assert!(store.is_empty());
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_scan_website_skips_stream_sources() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("access.log");
    std::fs::write(&path, format!("{}{}", recent_line("/a"), "garbage\n")).unwrap();

    let config = parse_config(&format!(
        r#"
[[websites]]
id = "main"

[[websites.sources]]
id = "nginx"
type = "local"
path = "{}"

[[websites.sources]]
id = "pushed"
type = "agent"
mode = "stream"
"#,
        path.display()
    ))
    .unwrap();

    let (scanner, _store, sink) = scanner();
    let report = scanner
        .scan_website(&config.websites[0], &CancellationToken::new())
        .await;
    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(report.website_id, "main");
    assert_eq!(report.targets_scanned, 1);
    assert_eq!(report.records_parsed, 1);
    assert_eq!(report.lines_rejected, 1);
    assert_eq!(sink.records()[0].source_id, "nginx");
}

#[tokio::test]
async fn test_sqlite_state_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("state.sqlite");
    let log_path = tmp.path().join("access.log");
    std::fs::write(&log_path, recent_line("/a")).unwrap();
    let source = LocalSource::new(
        "site",
        "nginx",
        Selection::Path(log_path.display().to_string()),
    );

    for expected in [1, 0] {
        let pool = db::connect_path(&db_path).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        let sink = Arc::new(MemorySink::new());
        let scanner = Scanner::new(
            Arc::new(SqliteStateStore::new(pool.clone())),
            Arc::new(AccessLogParser::new(sink.clone())),
        );
        let report = scan(&scanner, &source).await;
        assert!(report.is_success(), "{:?}", report.failures);
        assert_eq!(report.records_parsed, expected);
        pool.close().await;
    }
}
