//! Configuration parsing and validation.
//!
//! logscan is configured via a TOML file (default: `config/logscan.toml`).
//! Every scalar section has defaults, so a minimal file only declares its
//! websites and their sources:
//!
//! ```toml
//! [db]
//! path = "./data/logscan.sqlite"
//!
//! [[websites]]
//! id = "main"
//!
//! [[websites.sources]]
//! id = "nginx"
//! type = "local"
//! pattern = "/var/log/nginx/access.log*"
//! ```
//!
//! Validation runs at load time; any error is fatal for the command.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::{Compression, RangePolicy, Selection, SourceType};

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub websites: Vec<WebsiteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/logscan.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// Backfill floor applied on a target's first encounter.
    #[serde(default = "default_recent_window_days")]
    pub recent_window_days: i64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            recent_window_days: default_recent_window_days(),
        }
    }
}

fn default_recent_window_days() -> i64 {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_max_entries() -> usize {
    100_000
}
fn default_ttl_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// When set, pushes must carry a matching `X-Logscan-Key` header.
    #[serde(default)]
    pub access_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            access_key: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8089".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebsiteConfig {
    pub id: String,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// Whether a source is pulled by scans or fed by pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum SourceMode {
    #[default]
    Poll,
    Stream,
}

impl SourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMode::Poll => "poll",
            SourceMode::Stream => "stream",
        }
    }
}

impl TryFrom<String> for SourceMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "poll" => Ok(SourceMode::Poll),
            "stream" => Ok(SourceMode::Stream),
            other => Err(format!("unknown mode '{}'. Must be poll or stream", other)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub range_policy: RangePolicy,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub sftp: Option<SftpConfig>,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl SourceConfig {
    /// The selection rule; a pattern wins over a literal path.
    pub fn selection(&self) -> Option<Selection> {
        match (&self.pattern, &self.path) {
            (Some(p), _) if !p.trim().is_empty() => Some(Selection::Pattern(p.clone())),
            (_, Some(p)) if !p.trim().is_empty() => Some(Selection::Path(p.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

fn default_sftp_port() -> u16 {
    22
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Config {
    pub fn website(&self, id: &str) -> Option<&WebsiteConfig> {
        self.websites.iter().find(|w| w.id == id)
    }

    /// Websites selected by an optional `--website` filter.
    pub fn select_websites(&self, filter: Option<&str>) -> Result<Vec<&WebsiteConfig>> {
        match filter {
            Some(id) => match self.website(id) {
                Some(w) => Ok(vec![w]),
                None => bail!("Unknown website: '{}'", id),
            },
            None => Ok(self.websites.iter().collect()),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.scan.recent_window_days <= 0 {
        bail!("scan.recent_window_days must be > 0");
    }
    if config.dedup.max_entries == 0 {
        bail!("dedup.max_entries must be > 0");
    }
    if config.dedup.ttl_secs == 0 {
        bail!("dedup.ttl_secs must be > 0");
    }
    if config.websites.is_empty() {
        bail!("at least one [[websites]] entry is required");
    }

    let mut website_ids = HashSet::new();
    for website in &config.websites {
        if website.id.trim().is_empty() {
            bail!("websites.id must not be empty");
        }
        if !website_ids.insert(website.id.as_str()) {
            bail!("duplicate website id: '{}'", website.id);
        }

        let mut source_ids = HashSet::new();
        for source in &website.sources {
            if source.id.trim().is_empty() {
                bail!("website '{}': source id must not be empty", website.id);
            }
            if !source_ids.insert(source.id.as_str()) {
                bail!(
                    "website '{}': duplicate source id '{}'",
                    website.id,
                    source.id
                );
            }
            validate_source(&website.id, source)?;
        }
    }
    Ok(())
}

fn validate_source(website_id: &str, source: &SourceConfig) -> Result<()> {
    let name = format!("website '{}' source '{}'", website_id, source.id);
    match source.source_type {
        SourceType::Local => {
            if source.selection().is_none() {
                bail!("{}: local sources need a path or pattern", name);
            }
        }
        SourceType::Sftp => {
            if source.selection().is_none() {
                bail!("{}: sftp sources need a path or pattern", name);
            }
            let Some(sftp) = &source.sftp else {
                bail!("{}: missing [websites.sources.sftp] section", name);
            };
            if sftp.host.trim().is_empty() || sftp.user.trim().is_empty() {
                bail!("{}: sftp.host and sftp.user are required", name);
            }
            let has_password = sftp.password.as_deref().is_some_and(|p| !p.is_empty());
            let has_key = sftp.key_file.as_deref().is_some_and(|k| !k.is_empty());
            if !has_password && !has_key {
                bail!("{}: sftp needs a password or key_file", name);
            }
        }
        SourceType::S3 => {
            let Some(s3) = &source.s3 else {
                bail!("{}: missing [websites.sources.s3] section", name);
            };
            if s3.bucket.trim().is_empty() {
                bail!("{}: s3.bucket is required", name);
            }
        }
        SourceType::Agent => {}
    }
    Ok(())
}
