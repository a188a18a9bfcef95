//! SFTP backend.
//!
//! Each operation opens its own SSH session, so a source holds no live
//! connection between scans. `ssh2` is blocking; every call runs on the
//! blocking thread pool. Range reads keep their session on a dedicated
//! blocking task that pumps file chunks through a bounded channel, and the
//! session closes once the returned stream is dropped or fully read.
//!
//! Only password and private-key-file authentication are supported. Host
//! keys are not verified.
//!
//! ```toml
//! [[websites.sources]]
//! id = "edge"
//! type = "sftp"
//! pattern = "/var/log/nginx/access.log*"
//!
//! [websites.sources.sftp]
//! host = "edge-1.internal"
//! user = "logs"
//! key_file = "~/.ssh/id_ed25519"
//! ```

use std::io::{self, Read, Seek, SeekFrom};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use globset::GlobBuilder;
use ssh2::{FileStat, Session, Sftp};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::config::SftpConfig;
use crate::error::{SourceError, SourceResult};
use crate::models::{Compression, RangePolicy, Selection, SourceType, TargetMeta, TargetRef};
use crate::stream::ByteStream;
use crate::traits::LogSource;

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;

/// A [`LogSource`] over files on a remote host reached through SFTP.
pub struct SftpSource {
    website_id: String,
    id: String,
    selection: Selection,
    compression: Compression,
    range_policy: RangePolicy,
    params: Arc<SftpParams>,
}

/// Connection parameters, shared with blocking tasks.
#[derive(Debug, Clone)]
struct SftpParams {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key_file: Option<PathBuf>,
}

impl SftpSource {
    pub fn new(
        website_id: impl Into<String>,
        id: impl Into<String>,
        selection: Selection,
        config: &SftpConfig,
    ) -> SourceResult<Self> {
        if config.host.trim().is_empty() {
            return Err(SourceError::Config("sftp host is required".to_string()));
        }
        Ok(Self {
            website_id: website_id.into(),
            id: id.into(),
            selection,
            compression: Compression::Auto,
            range_policy: RangePolicy::Auto,
            params: Arc::new(SftpParams {
                host: config.host.clone(),
                port: if config.port == 0 { 22 } else { config.port },
                user: config.user.clone(),
                password: config.password.clone().filter(|p| !p.is_empty()),
                key_file: config
                    .key_file
                    .as_deref()
                    .filter(|k| !k.is_empty())
                    .map(expand_home),
            }),
        })
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_range_policy(mut self, range_policy: RangePolicy) -> Self {
        self.range_policy = range_policy;
        self
    }

    fn meta_from(&self, key: &str, stat: &FileStat) -> TargetMeta {
        TargetMeta {
            size: stat.size.unwrap_or(0),
            mod_time: stat
                .mtime
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single()),
            etag: String::new(),
            compressed: self.compression.applies_to(key),
        }
    }

    fn target(&self, key: String, stat: &FileStat) -> TargetRef {
        TargetRef {
            website_id: self.website_id.clone(),
            source_id: self.id.clone(),
            meta: self.meta_from(&key, stat),
            key,
        }
    }

    /// Start a blocking reader task and hand back its stream once the file
    /// is open and positioned.
    async fn spawn_reader(
        &self,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> SourceResult<ByteStream> {
        let params = self.params.clone();
        let path = PathBuf::from(key);
        let (ready_tx, ready_rx) = oneshot::channel::<SourceResult<()>>();
        let (chunk_tx, chunk_rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);

        tokio::task::spawn_blocking(move || {
            let opened = (|| -> SourceResult<_> {
                let conn = SftpConnection::open(&params)?;
                let mut file = conn.sftp.open(&path)?;
                if start > 0 {
                    file.seek(SeekFrom::Start(start))?;
                }
                Ok((conn, file))
            })();
            let (_conn, mut file) = match opened {
                Ok(opened) => {
                    let _ = ready_tx.send(Ok(()));
                    opened
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let mut remaining = end.map(|end| end.saturating_sub(start));
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let want = match remaining {
                    Some(0) => break,
                    Some(n) => CHUNK_SIZE.min(n as usize),
                    None => CHUNK_SIZE,
                };
                let chunk = match file.read(&mut buf[..want]) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(ref mut left) = remaining {
                            *left -= n as u64;
                        }
                        Ok(Bytes::copy_from_slice(&buf[..n]))
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
                let failed = chunk.is_err();
                // A closed channel means the consumer dropped the stream
                if chunk_tx.blocking_send(chunk).is_err() || failed {
                    break;
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(SourceError::Io(io::Error::other(
                    "sftp reader task exited before opening the file",
                )))
            }
        }

        let chunks = futures::stream::unfold(chunk_rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        Ok(Box::pin(StreamReader::new(chunks)))
    }
}

#[async_trait]
impl LogSource for SftpSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Sftp
    }

    async fn list_targets(&self) -> SourceResult<Vec<TargetRef>> {
        let params = self.params.clone();
        let selection = self.selection.clone();

        let entries = tokio::task::spawn_blocking(move || {
            let conn = SftpConnection::open(&params)?;
            list_selection(&conn.sftp, selection)
        })
        .await??;

        Ok(entries
            .into_iter()
            .map(|(key, stat)| self.target(key, &stat))
            .collect())
    }

    async fn open_range(
        &self,
        target: &TargetRef,
        start: u64,
        end: Option<u64>,
    ) -> SourceResult<ByteStream> {
        self.range_policy.check(start, end)?;
        self.spawn_reader(&target.key, start, end).await
    }

    async fn open_stream(&self, target: &TargetRef) -> SourceResult<ByteStream> {
        self.spawn_reader(&target.key, 0, None).await
    }

    async fn stat(&self, target: &TargetRef) -> SourceResult<TargetMeta> {
        let params = self.params.clone();
        let path = PathBuf::from(&target.key);
        let stat = tokio::task::spawn_blocking(move || -> SourceResult<FileStat> {
            let conn = SftpConnection::open(&params)?;
            Ok(conn.sftp.stat(&path)?)
        })
        .await??;
        Ok(self.meta_from(&target.key, &stat))
    }
}

/// An authenticated session plus its SFTP channel.
struct SftpConnection {
    sftp: Sftp,
    _session: Session,
}

impl SftpConnection {
    fn open(params: &SftpParams) -> SourceResult<Self> {
        if params.password.is_none() && params.key_file.is_none() {
            return Err(SourceError::Auth("sftp auth missing".to_string()));
        }

        let addr = (params.host.as_str(), params.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                SourceError::Config(format!("cannot resolve {}:{}", params.host, params.port))
            })?;
        let tcp = TcpStream::connect_timeout(&addr, DIAL_TIMEOUT)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(DIAL_TIMEOUT.as_millis() as u32);
        session.handshake()?;

        if let Some(ref password) = params.password {
            if let Err(e) = session.userauth_password(&params.user, password) {
                debug!(host = %params.host, error = %e, "sftp password auth rejected");
            }
        }
        if !session.authenticated() {
            if let Some(ref key_file) = params.key_file {
                session.userauth_pubkey_file(&params.user, None, key_file, None)?;
            }
        }
        if !session.authenticated() {
            return Err(SourceError::Auth(format!(
                "{}@{} rejected the configured credentials",
                params.user, params.host
            )));
        }
        session.set_timeout(0);

        let sftp = session.sftp()?;
        Ok(Self {
            sftp,
            _session: session,
        })
    }
}

fn list_selection(sftp: &Sftp, selection: Selection) -> SourceResult<Vec<(String, FileStat)>> {
    match selection {
        Selection::Path(path) => match sftp.stat(Path::new(&path)) {
            Ok(stat) if !stat.is_dir() => Ok(vec![(path, stat)]),
            Ok(_) => Ok(Vec::new()),
            Err(e) => {
                debug!(path = %path, error = %e, "sftp target not found");
                Ok(Vec::new())
            }
        },
        Selection::Pattern(pattern) => list_pattern(sftp, &pattern),
    }
}

/// Expand a pattern by listing its parent directory (non-recursive) and
/// matching each entry's basename.
fn list_pattern(sftp: &Sftp, pattern: &str) -> SourceResult<Vec<(String, FileStat)>> {
    let (dir, base) = split_pattern(pattern);
    let matcher = GlobBuilder::new(base)
        .literal_separator(true)
        .build()?
        .compile_matcher();

    let mut matches = Vec::new();
    for (path, stat) in sftp.readdir(Path::new(dir))? {
        if stat.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if matcher.is_match(name) {
            matches.push((join_remote(dir, name), stat));
        }
    }
    matches.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(matches)
}

/// Split a remote pattern into its directory and basename parts.
fn split_pattern(pattern: &str) -> (&str, &str) {
    match pattern.rfind('/') {
        Some(0) => ("/", &pattern[1..]),
        Some(i) => (&pattern[..i], &pattern[i + 1..]),
        None => (".", pattern),
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    match dir {
        "." => name.to_string(),
        d if d.ends_with('/') => format!("{}{}", d, name),
        d => format!("{}/{}", d, name),
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(password: Option<&str>, key_file: Option<&str>) -> SftpConfig {
        SftpConfig {
            host: "127.0.0.1".into(),
            port: 0,
            user: "logs".into(),
            password: password.map(str::to_string),
            key_file: key_file.map(str::to_string),
        }
    }

    #[test]
    fn test_split_pattern() {
        assert_eq!(
            split_pattern("/var/log/nginx/access.log*"),
            ("/var/log/nginx", "access.log*")
        );
        assert_eq!(split_pattern("/access.log"), ("/", "access.log"));
        assert_eq!(split_pattern("access.log*"), (".", "access.log*"));
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/var/log", "a.log"), "/var/log/a.log");
        assert_eq!(join_remote("/", "a.log"), "/a.log");
        assert_eq!(join_remote(".", "a.log"), "a.log");
    }

    #[test]
    fn test_port_defaults_to_22() {
        let source = SftpSource::new(
            "site",
            "edge",
            Selection::Path("/a.log".into()),
            &config(Some("pw"), None),
        )
        .unwrap();
        assert_eq!(source.params.port, 22);
    }

    #[test]
    fn test_missing_host_is_rejected() {
        let mut cfg = config(Some("pw"), None);
        cfg.host = " ".into();
        assert!(matches!(
            SftpSource::new("site", "edge", Selection::Path("/a.log".into()), &cfg),
            Err(SourceError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_before_dialing() {
        let source = SftpSource::new(
            "site",
            "edge",
            Selection::Pattern("/var/log/*.log".into()),
            &config(None, Some("")),
        )
        .unwrap();
        match source.list_targets().await {
            Err(SourceError::Auth(msg)) => assert_eq!(msg, "sftp auth missing"),
            other => panic!("expected auth error, got {:?}", other.map(|t| t.len())),
        }
    }

    #[tokio::test]
    async fn test_full_policy_checked_before_connecting() {
        let source = SftpSource::new(
            "site",
            "edge",
            Selection::Path("/a.log".into()),
            &config(Some("pw"), None),
        )
        .unwrap()
        .with_range_policy(RangePolicy::Full);
        let target = TargetRef {
            website_id: "site".into(),
            source_id: "edge".into(),
            key: "/a.log".into(),
            meta: TargetMeta::default(),
        };
        assert!(matches!(
            source.open_range(&target, 10, None).await,
            Err(SourceError::RangeNotSupported)
        ));
    }
}
