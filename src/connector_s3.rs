//! Object-store backend (Amazon S3 and S3-compatible services).
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication:
//!
//! - listing uses `ListObjectsV2` and follows `NextContinuationToken` until
//!   the bucket prefix is exhausted; any failed page fails the whole call,
//! - range reads send a `Range: bytes=<start>-[<end>]` header on `GetObject`,
//! - `stat` issues `HeadObject`.
//!
//! # Configuration
//!
//! ```toml
//! [[websites.sources]]
//! id = "cdn"
//! type = "s3"
//! pattern = "logs/access-*.gz"
//!
//! [websites.sources.s3]
//! bucket = "edge-logs"
//! prefix = "logs/"
//! region = "us-east-1"
//! # endpoint = "http://localhost:9000"   # MinIO; switches to path-style URLs
//! ```
//!
//! Credentials come from `access_key` / `secret_key` in the source config,
//! falling back to `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the
//! optional `AWS_SESSION_TOKEN`.
//!
//! # Pattern matching
//!
//! A pattern matches a key when it matches either the full key or, applied
//! as its last path segment, the key's basename. So `access-*.gz` selects
//! `logs/2024/access-01.gz` without spelling out the directories.

use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use globset::{GlobBuilder, GlobMatcher};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, ETAG, LAST_MODIFIED, RANGE};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::config::S3Config;
use crate::error::{SourceError, SourceResult};
use crate::models::{Compression, RangePolicy, SourceType, TargetMeta, TargetRef};
use crate::stream::ByteStream;
use crate::traits::LogSource;

type HmacSha256 = Hmac<Sha256>;

/// A [`LogSource`] over objects in an S3 bucket.
pub struct S3Source {
    website_id: String,
    id: String,
    bucket: String,
    prefix: String,
    region: String,
    endpoint: Option<String>,
    pattern: Option<KeyPattern>,
    creds: AwsCredentials,
    compression: Compression,
    range_policy: RangePolicy,
    client: reqwest::Client,
}

impl S3Source {
    /// Create an S3 source from its configuration block.
    ///
    /// Fails if the pattern is malformed or no credentials are available.
    pub fn new(
        website_id: impl Into<String>,
        id: impl Into<String>,
        config: &S3Config,
        pattern: Option<&str>,
    ) -> SourceResult<Self> {
        let creds = match (&config.access_key, &config.secret_key) {
            (Some(access), Some(secret)) if !access.is_empty() && !secret.is_empty() => {
                AwsCredentials {
                    access_key_id: access.clone(),
                    secret_access_key: secret.clone(),
                    session_token: None,
                }
            }
            _ => AwsCredentials::from_env()?,
        };

        Ok(Self {
            website_id: website_id.into(),
            id: id.into(),
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            region: config.region.clone(),
            endpoint: config
                .endpoint
                .as_ref()
                .map(|e| e.trim_end_matches('/').to_string())
                .filter(|e| !e.is_empty()),
            pattern: pattern.map(KeyPattern::new).transpose()?,
            creds,
            compression: Compression::Auto,
            range_policy: RangePolicy::Auto,
            client: reqwest::Client::new(),
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

    /// Host, base URL and canonical URI prefix for this bucket.
    ///
    /// A custom endpoint (MinIO, LocalStack) uses path-style addressing;
    /// AWS uses virtual-hosted `<bucket>.s3.<region>.amazonaws.com`.
    fn addressing(&self) -> (String, String, String) {
        match &self.endpoint {
            Some(endpoint) => {
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                let base = if endpoint.starts_with("http://") || endpoint.starts_with("https://")
                {
                    endpoint.clone()
                } else {
                    format!("https://{}", endpoint)
                };
                (host, base, format!("/{}", uri_encode(&self.bucket)))
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                let base = format!("https://{}", host);
                (host, base, String::new())
            }
        }
    }

    /// Build a SigV4-signed request for `key` (or the bucket root).
    fn signed_request(
        &self,
        method: Method,
        key: Option<&str>,
        query_params: &[(String, String)],
    ) -> reqwest::RequestBuilder {
        let (host, base, bucket_path) = self.addressing();

        let encoded_key = key
            .map(|k| k.split('/').map(uri_encode).collect::<Vec<_>>().join("/"))
            .unwrap_or_default();
        let canonical_uri = format!("{}/{}", bucket_path, encoded_key);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        // Canonical query string must be sorted by key
        let mut sorted_params = query_params.to_vec();
        sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex_sha256(b"");

        let mut headers = vec![
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}{}", base, canonical_uri);
        if !canonical_querystring.is_empty() {
            url = format!("{}?{}", url, canonical_querystring);
        }

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        req
    }

    /// List every object under the prefix, following continuation tokens.
    async fn list_objects(&self) -> SourceResult<Vec<S3Object>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query_params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !self.prefix.is_empty() {
                query_params.push(("prefix".to_string(), self.prefix.clone()));
            }
            if let Some(ref token) = continuation_token {
                query_params.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .signed_request(Method::GET, None, &query_params)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(failure("ListObjectsV2", resp).await);
            }

            let xml_body = resp.text().await?;
            let page = parse_list_objects_response(&xml_body);
            debug!(
                source = %self.id,
                bucket = %self.bucket,
                objects = page.objects.len(),
                truncated = page.is_truncated,
                "listed S3 page"
            );
            objects.extend(page.objects);

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn get_object(
        &self,
        target: &TargetRef,
        range: Option<String>,
    ) -> SourceResult<ByteStream> {
        let mut req = self.signed_request(Method::GET, Some(&target.key), &[]);
        let ranged = range.is_some();
        if let Some(range) = range {
            req = req.header(RANGE, range);
        }

        let resp = req.send().await?;
        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK if !ranged => {}
            // The server ignored the Range header and is sending the whole object
            StatusCode::OK => return Err(SourceError::RangeNotSupported),
            _ => return Err(failure("GetObject", resp).await),
        }

        let body = resp.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }

    fn meta_for(
        &self,
        key: &str,
        size: u64,
        mod_time: Option<DateTime<Utc>>,
        etag: &str,
    ) -> TargetMeta {
        TargetMeta {
            size,
            mod_time,
            etag: etag.trim_matches('"').to_string(),
            compressed: self.compression.applies_to(key),
        }
    }
}

#[async_trait]
impl LogSource for S3Source {
    fn id(&self) -> &str {
        &self.id
    }

    fn source_type(&self) -> SourceType {
        SourceType::S3
    }

    async fn list_targets(&self) -> SourceResult<Vec<TargetRef>> {
        let objects = self.list_objects().await?;
        let mut targets = Vec::new();
        for obj in objects {
            if let Some(ref pattern) = self.pattern {
                if !pattern.matches(&obj.key) {
                    continue;
                }
            }
            targets.push(TargetRef {
                website_id: self.website_id.clone(),
                source_id: self.id.clone(),
                meta: self.meta_for(&obj.key, obj.size, obj.last_modified, &obj.etag),
                key: obj.key,
            });
        }
        targets.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(targets)
    }

    async fn open_range(
        &self,
        target: &TargetRef,
        start: u64,
        end: Option<u64>,
    ) -> SourceResult<ByteStream> {
        self.range_policy.check(start, end)?;
        let range = range_header(start, end, self.range_policy, target.meta.size);
        self.get_object(target, range).await
    }

    async fn open_stream(&self, target: &TargetRef) -> SourceResult<ByteStream> {
        self.get_object(target, None).await
    }

    async fn stat(&self, target: &TargetRef) -> SourceResult<TargetMeta> {
        let resp = self
            .signed_request(Method::HEAD, Some(&target.key), &[])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(failure("HeadObject", resp).await);
        }
        let headers = resp.headers();
        // HEAD bodies are empty, so the length must come from the header itself
        let size = header_str(headers, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let mod_time = header_str(headers, LAST_MODIFIED.as_str())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let etag = header_str(headers, ETAG.as_str()).unwrap_or_default();
        Ok(self.meta_for(&target.key, size, mod_time, etag))
    }
}

/// Build the `Range` header for a read, if one is needed.
///
/// `end` is exclusive; HTTP ranges are inclusive. Under
/// [`RangePolicy::Range`] a header is sent even for whole-object reads,
/// except on an empty object where any range is unsatisfiable (416).
pub fn range_header(
    start: u64,
    end: Option<u64>,
    policy: RangePolicy,
    size: u64,
) -> Option<String> {
    match end {
        Some(end) if end > start => Some(format!("bytes={}-{}", start, end - 1)),
        _ if start == 0 && size == 0 => None,
        _ if start > 0 || policy == RangePolicy::Range => Some(format!("bytes={}-", start)),
        _ => None,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn failure(operation: &'static str, resp: reqwest::Response) -> SourceError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    SourceError::S3 {
        operation,
        status,
        message: body.chars().take(500).collect(),
    }
}

// ============ Key pattern ============

/// Glob matched against the full key or, by its last segment, the basename.
struct KeyPattern {
    full: GlobMatcher,
    base: GlobMatcher,
}

impl KeyPattern {
    fn new(pattern: &str) -> SourceResult<Self> {
        let base_pattern = pattern.rsplit('/').next().unwrap_or(pattern);
        Ok(Self {
            full: GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()?
                .compile_matcher(),
            base: GlobBuilder::new(base_pattern)
                .literal_separator(true)
                .build()?
                .compile_matcher(),
        })
    }

    fn matches(&self, key: &str) -> bool {
        if self.full.is_match(key) {
            return true;
        }
        let basename = key.rsplit('/').next().unwrap_or(key);
        self.base.is_match(basename)
    }
}

// ============ AWS Credentials ============

/// AWS credentials from the source config or the environment.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    fn from_env() -> SourceResult<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            SourceError::Config(
                "no s3 access_key configured and AWS_ACCESS_KEY_ID is not set".to_string(),
            )
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            SourceError::Config(
                "no s3 secret_key configured and AWS_SECRET_ACCESS_KEY is not set".to_string(),
            )
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing ============

/// Metadata for a single object from a `ListObjectsV2` page.
#[derive(Debug)]
struct S3Object {
    key: String,
    last_modified: Option<DateTime<Utc>>,
    etag: String,
    size: u64,
}

struct ListPage {
    objects: Vec<S3Object>,
    is_truncated: bool,
    next_token: Option<String>,
}

/// Parse a `ListObjectsV2` XML response. Directory placeholders are dropped.
fn parse_list_objects_response(xml: &str) -> ListPage {
    let mut objects = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken").map(|t| xml_unescape(&t));

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = xml_unescape(&extract_xml_value(block, "Key").unwrap_or_default());
        if key.is_empty() || key.ends_with('/') {
            continue;
        }

        objects.push(S3Object {
            key,
            last_modified: extract_xml_value(block, "LastModified")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            etag: xml_unescape(&extract_xml_value(block, "ETag").unwrap_or_default())
                .trim_matches('"')
                .to_string(),
            size: extract_xml_value(block, "Size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0),
        });
    }

    ListPage {
        objects,
        is_truncated,
        next_token,
    }
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let value_start = xml.find(&open)? + open.len();
    let end = xml[value_start..].find(&close)?;
    Some(xml[value_start..value_start + end].to_string())
}

fn xml_unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
