//! Local filesystem backend.
//!
//! Targets are a literal path or the expansion of a glob pattern such as
//! `/var/log/nginx/access.log*`. Expansion walks from the longest literal
//! directory prefix of the pattern; `*` and `?` never cross a `/`, while
//! `**` matches any number of directories.
//!
//! Listing is best-effort: entries that vanish or cannot be stat'ed between
//! expansion and metadata lookup are skipped. Opening such a target later
//! is a hard error.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::GlobBuilder;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::SourceResult;
use crate::models::{Compression, RangePolicy, Selection, SourceType, TargetMeta, TargetRef};
use crate::stream::ByteStream;
use crate::traits::LogSource;

/// A [`LogSource`] over files on the local machine.
pub struct LocalSource {
    website_id: String,
    id: String,
    selection: Selection,
    compression: Compression,
    range_policy: RangePolicy,
}

impl LocalSource {
    pub fn new(website_id: impl Into<String>, id: impl Into<String>, selection: Selection) -> Self {
        Self {
            website_id: website_id.into(),
            id: id.into(),
            selection,
            compression: Compression::Auto,
            range_policy: RangePolicy::Auto,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_range_policy(mut self, range_policy: RangePolicy) -> Self {
        self.range_policy = range_policy;
        self
    }

    fn meta_from(&self, key: &str, metadata: &std::fs::Metadata) -> TargetMeta {
        TargetMeta {
            size: metadata.len(),
            mod_time: metadata.modified().ok().map(DateTime::<Utc>::from),
            etag: String::new(),
            compressed: self.compression.applies_to(key),
        }
    }
}

#[async_trait]
impl LogSource for LocalSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::Local
    }

    async fn list_targets(&self) -> SourceResult<Vec<TargetRef>> {
        let paths = match &self.selection {
            Selection::Pattern(pattern) => {
                let pattern = pattern.clone();
                tokio::task::spawn_blocking(move || expand_glob(&pattern)).await??
            }
            Selection::Path(path) => vec![PathBuf::from(path)],
        };

        let mut targets = Vec::with_capacity(paths.len());
        for path in paths {
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    debug!(
                        source = %self.id,
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable target"
                    );
                    continue;
                }
            };
            let key = path.to_string_lossy().to_string();
            targets.push(TargetRef {
                website_id: self.website_id.clone(),
                source_id: self.id.clone(),
                meta: self.meta_from(&key, &metadata),
                key,
            });
        }
        Ok(targets)
    }

    async fn open_range(
        &self,
        target: &TargetRef,
        start: u64,
        end: Option<u64>,
    ) -> SourceResult<ByteStream> {
        self.range_policy.check(start, end)?;

        let mut file = File::open(&target.key).await?;
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        match end {
            Some(end) if end > start => Ok(Box::pin(file.take(end - start))),
            _ => Ok(Box::pin(file)),
        }
    }

    async fn open_stream(&self, target: &TargetRef) -> SourceResult<ByteStream> {
        let file = File::open(&target.key).await?;
        Ok(Box::pin(file))
    }

    async fn stat(&self, target: &TargetRef) -> SourceResult<TargetMeta> {
        let metadata = tokio::fs::metadata(&target.key).await?;
        Ok(self.meta_from(&target.key, &metadata))
    }
}

/// Expand a glob pattern into the sorted list of matching paths.
///
/// A pattern without glob metacharacters yields itself when it exists.
/// Unreadable directories are skipped.
pub fn expand_glob(pattern: &str) -> SourceResult<Vec<PathBuf>> {
    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()?
        .compile_matcher();

    let (root, depth) = glob_root(pattern);
    if depth == Some(0) {
        return Ok(if root.exists() { vec![root] } else { Vec::new() });
    }

    let relative = root.as_os_str().is_empty();
    let walk_root = if relative { PathBuf::from(".") } else { root };

    let mut walker = WalkDir::new(&walk_root).min_depth(1).follow_links(true);
    if let Some(depth) = depth {
        walker = walker.max_depth(depth);
    }

    let mut matches = Vec::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        let path = if relative {
            entry.path().strip_prefix(".").unwrap_or(entry.path())
        } else {
            entry.path()
        };
        if matcher.is_match(path) {
            matches.push(path.to_path_buf());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Split a pattern into its literal directory prefix and the number of
/// path components left to match (`None` when `**` allows any depth).
fn glob_root(pattern: &str) -> (PathBuf, Option<usize>) {
    let mut root = PathBuf::new();
    let mut remaining = 0usize;
    let mut unbounded = false;
    let mut in_glob = false;

    for component in Path::new(pattern).components() {
        let text = component.as_os_str().to_string_lossy();
        let is_glob = matches!(component, Component::Normal(_)) && has_glob_meta(&text);
        if !in_glob && !is_glob {
            root.push(component.as_os_str());
            continue;
        }
        in_glob = true;
        remaining += 1;
        if text.contains("**") {
            unbounded = true;
        }
    }

    let depth = if unbounded { None } else { Some(remaining) };
    (root, depth)
}

fn has_glob_meta(text: &str) -> bool {
    text.contains(['*', '?', '[', '{'])
}
