//! Lightweight tailing agent.
//!
//! Follows local log files and pushes new lines to a logscan ingest server
//! (`POST /api/ingest/logs`). Per path it keeps a byte offset and any
//! unterminated trailing fragment; a file that shrinks below the offset is
//! treated as rotated and re-read from the start. Compressed (`.gz`) paths
//! are ignored.
//!
//! Delivery is at-least-once: a failed push keeps the whole batch pending
//! and resubmits it later. The server's dedup cache absorbs the repeats.
//! While the server stays unreachable at most `max_pending` lines are held;
//! beyond that the oldest are dropped with a warning.
//!
//! ```toml
//! server = "http://collector:8089"
//! access_key = "s3cret"
//! website_id = "main"
//! paths = ["/var/log/nginx/access.log"]
//! ```

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::push::IngestBatch;
use crate::server::ACCESS_KEY_HEADER;

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub server: String,
    #[serde(default)]
    pub access_key: Option<String>,
    pub website_id: String,
    #[serde(default = "default_source_id")]
    pub source_id: String,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_source_id() -> String {
    "agent".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_flush_interval_ms() -> u64 {
    2000
}
fn default_batch_size() -> usize {
    200
}
fn default_max_pending() -> usize {
    10_000
}

pub fn load_agent_config(path: &Path) -> Result<AgentConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read agent config: {}", path.display()))?;
    parse_agent_config(&content)
}

pub fn parse_agent_config(content: &str) -> Result<AgentConfig> {
    let mut config: AgentConfig =
        toml::from_str(content).with_context(|| "Failed to parse agent config")?;

    if config.server.trim().is_empty() {
        bail!("server must not be empty");
    }
    if config.website_id.trim().is_empty() {
        bail!("website_id must not be empty");
    }
    if config.paths.is_empty() {
        bail!("paths must not be empty");
    }
    if config.source_id.trim().is_empty() {
        config.source_id = default_source_id();
    }
    if config.poll_interval_ms == 0 {
        config.poll_interval_ms = default_poll_interval_ms();
    }
    if config.flush_interval_ms == 0 {
        config.flush_interval_ms = default_flush_interval_ms();
    }
    if config.batch_size == 0 {
        config.batch_size = default_batch_size();
    }
    if config.max_pending == 0 {
        config.max_pending = default_max_pending();
    }
    // A full batch must fit in the buffer
    config.max_pending = config.max_pending.max(config.batch_size);
    Ok(config)
}

/// Read position and buffered partial line for one followed file.
#[derive(Debug, Default)]
pub struct FileCursor {
    pub offset: u64,
    partial: Vec<u8>,
}

impl FileCursor {
    /// Split newly read bytes into complete, non-empty lines, buffering an
    /// unterminated tail for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.offset += chunk.len() as u64;
        self.partial.extend_from_slice(chunk);

        let Some(last_newline) = self.partial.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        complete
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    fn rewind(&mut self) {
        self.offset = 0;
        self.partial.clear();
    }
}

/// Read whatever was appended to `path` since the cursor's offset.
pub async fn read_new_lines(path: &Path, cursor: &mut FileCursor) -> Result<Vec<String>> {
    let size = tokio::fs::metadata(path).await?.len();
    if size < cursor.offset {
        debug!(path = %path.display(), size, offset = cursor.offset, "file shrank, rewinding");
        cursor.rewind();
    }
    if size == cursor.offset {
        return Ok(Vec::new());
    }

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(cursor.offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(cursor.feed(&buf))
}

/// Posts batches to the ingest endpoint.
pub struct Pusher {
    client: reqwest::Client,
    endpoint: String,
    access_key: Option<String>,
    website_id: String,
    source_id: String,
}

impl Pusher {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(PUSH_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/ingest/logs", config.server.trim_end_matches('/')),
            access_key: config
                .access_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
            website_id: config.website_id.clone(),
            source_id: config.source_id.clone(),
        })
    }

    pub async fn push(&self, lines: &[String]) -> Result<()> {
        let batch = IngestBatch {
            website_id: self.website_id.clone(),
            source_id: self.source_id.clone(),
            lines: lines.to_vec(),
        };
        let mut req = self.client.post(&self.endpoint).json(&batch);
        if let Some(ref key) = self.access_key {
            req = req.header(ACCESS_KEY_HEADER, key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("push failed (HTTP {}): {}", status.as_u16(), body);
        }
        Ok(())
    }
}

/// Follow the configured paths until `cancel` fires, then attempt one last
/// flush.
pub async fn run_agent(config: &AgentConfig, cancel: CancellationToken) -> Result<()> {
    let pusher = Pusher::new(config)?;
    let mut cursors: HashMap<PathBuf, FileCursor> = HashMap::new();
    let mut pending: Vec<String> = Vec::with_capacity(config.batch_size);

    let mut poll = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
    let mut flush = tokio::time::interval(Duration::from_millis(config.flush_interval_ms));

    info!(
        server = %config.server,
        website = %config.website_id,
        source = %config.source_id,
        paths = config.paths.len(),
        "tail agent started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = poll.tick() => {
                for path in &config.paths {
                    if path.to_string_lossy().to_ascii_lowercase().ends_with(".gz") {
                        continue;
                    }
                    let cursor = cursors.entry(path.clone()).or_default();
                    match read_new_lines(path, cursor).await {
                        Ok(lines) => pending.extend(lines),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "failed to read log file");
                            continue;
                        }
                    }
                    let dropped = cap_pending(&mut pending, config.max_pending);
                    if dropped > 0 {
                        warn!(
                            dropped,
                            max_pending = config.max_pending,
                            "pending buffer full, dropped oldest lines"
                        );
                    }
                    if pending.len() >= config.batch_size {
                        flush_pending(&pusher, &mut pending).await;
                    }
                }
            }
            _ = flush.tick() => flush_pending(&pusher, &mut pending).await,
        }
    }

    flush_pending(&pusher, &mut pending).await;
    if !pending.is_empty() {
        warn!(lines = pending.len(), "tail agent stopped with undelivered lines");
    }
    info!("tail agent stopped");
    Ok(())
}

/// Trim `pending` to its newest `max` lines. Returns how many were dropped.
pub fn cap_pending(pending: &mut Vec<String>, max: usize) -> usize {
    let excess = pending.len().saturating_sub(max);
    pending.drain(..excess);
    excess
}

async fn flush_pending(pusher: &Pusher, pending: &mut Vec<String>) {
    if pending.is_empty() {
        return;
    }
    match pusher.push(pending).await {
        Ok(()) => {
            debug!(lines = pending.len(), "pushed batch");
            pending.clear();
        }
        Err(e) => warn!(
            lines = pending.len(),
            error = %format!("{:#}", e),
            "push failed, will retry"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_feed_buffers_partial_line() {
        let mut cursor = FileCursor::default();
        assert_eq!(cursor.feed(b"first\r\nsec"), vec!["first"]);
        assert_eq!(cursor.feed(b"ond\n\nthi"), vec!["second"]);
        assert!(cursor.feed(b"rd").is_empty());
        assert_eq!(cursor.feed(b"\n"), vec!["third"]);
        assert_eq!(cursor.offset, 21);
    }

    #[test]
    fn test_agent_config_defaults_and_validation() {
        let config = parse_agent_config(
            "server = \"http://localhost:8089\"\nwebsite_id = \"main\"\npaths = [\"/a.log\"]\n",
        )
        .unwrap();
        assert_eq!(config.source_id, "agent");
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.flush_interval_ms, 2000);
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.max_pending, 10_000);

        let small = parse_agent_config(
            "server = \"x\"\nwebsite_id = \"m\"\npaths = [\"/a\"]\nbatch_size = 50\nmax_pending = 10\n",
        )
        .unwrap();
        assert_eq!(small.max_pending, 50);

        assert!(parse_agent_config("server = \"x\"\nwebsite_id = \"main\"\n").is_err());
        assert!(parse_agent_config("server = \"\"\nwebsite_id = \"m\"\npaths = [\"/a\"]\n").is_err());
    }

    #[test]
    fn test_cap_pending_drops_oldest() {
        let mut pending: Vec<String> = (0..5).map(|i| format!("line {}", i)).collect();
        assert_eq!(cap_pending(&mut pending, 3), 2);
        assert_eq!(pending, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(cap_pending(&mut pending, 3), 0);
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn test_read_new_lines_follows_and_rewinds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("access.log");
        std::fs::write(&path, "one\ntw").unwrap();

        let mut cursor = FileCursor::default();
        assert_eq!(read_new_lines(&path, &mut cursor).await.unwrap(), vec!["one"]);
        assert!(read_new_lines(&path, &mut cursor).await.unwrap().is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"o\nthree\n").unwrap();
        drop(file);
        assert_eq!(
            read_new_lines(&path, &mut cursor).await.unwrap(),
            vec!["two", "three"]
        );

        // Truncation drops the offset and any buffered fragment
        std::fs::write(&path, "new\n").unwrap();
        assert_eq!(read_new_lines(&path, &mut cursor).await.unwrap(), vec!["new"]);
        assert_eq!(cursor.offset, 4);
    }
}
