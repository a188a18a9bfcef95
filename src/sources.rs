//! Backend construction from configuration, plus the `sources` and
//! `targets` CLI listings.

use anyhow::{anyhow, Context, Result};

use crate::config::{Config, SourceConfig, SourceMode};
use crate::connector_agent::AgentSource;
use crate::connector_fs::LocalSource;
use crate::connector_s3::S3Source;
use crate::connector_sftp::SftpSource;
use crate::models::SourceType;
use crate::traits::LogSource;

/// Build the backend for one configured source.
pub fn build_source(website_id: &str, config: &SourceConfig) -> Result<Box<dyn LogSource>> {
    let missing_selection =
        || anyhow!("source '{}' has neither a path nor a pattern", config.id);

    let source: Box<dyn LogSource> = match config.source_type {
        SourceType::Local => {
            let selection = config.selection().ok_or_else(missing_selection)?;
            Box::new(
                LocalSource::new(website_id, &config.id, selection)
                    .with_compression(config.compression)
                    .with_range_policy(config.range_policy),
            )
        }
        SourceType::Sftp => {
            let selection = config.selection().ok_or_else(missing_selection)?;
            let sftp = config
                .sftp
                .as_ref()
                .ok_or_else(|| anyhow!("source '{}' is missing its sftp section", config.id))?;
            Box::new(
                SftpSource::new(website_id, &config.id, selection, sftp)
                    .with_context(|| format!("Failed to configure source '{}'", config.id))?
                    .with_compression(config.compression)
                    .with_range_policy(config.range_policy),
            )
        }
        SourceType::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .ok_or_else(|| anyhow!("source '{}' is missing its s3 section", config.id))?;
            Box::new(
                S3Source::new(website_id, &config.id, s3, config.pattern.as_deref())
                    .with_context(|| format!("Failed to configure source '{}'", config.id))?
                    .with_compression(config.compression)
                    .with_range_policy(config.range_policy),
            )
        }
        SourceType::Agent => Box::new(AgentSource::new(&config.id)),
    };
    Ok(source)
}

pub fn list_sources(config: &Config) -> Result<()> {
    println!(
        "{:<16} {:<16} {:<8} {:<8} {:<8} SELECTION",
        "WEBSITE", "SOURCE", "TYPE", "MODE", "RANGE"
    );
    for website in &config.websites {
        for source in &website.sources {
            let selection = match (source.source_type, &source.s3) {
                (SourceType::S3, Some(s3)) => format!(
                    "s3://{}/{}{}",
                    s3.bucket,
                    s3.prefix,
                    source.pattern.as_deref().unwrap_or("")
                ),
                _ => source
                    .selection()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|| "-".to_string()),
            };
            println!(
                "{:<16} {:<16} {:<8} {:<8} {:<8} {}",
                website.id,
                source.id,
                source.source_type.as_str(),
                source.mode.as_str(),
                source.range_policy.as_str(),
                selection
            );
        }
    }
    Ok(())
}

/// Print the targets each poll-mode source currently exposes.
///
/// A source that cannot be listed is reported inline and does not stop the
/// listing of the others.
pub async fn list_targets(config: &Config, website: Option<&str>) -> Result<()> {
    println!(
        "{:<16} {:<16} {:>12} {:<20} {:<5} {:<34} KEY",
        "WEBSITE", "SOURCE", "SIZE", "MODIFIED", "GZ", "ETAG"
    );
    for website in config.select_websites(website)? {
        for source_config in &website.sources {
            if source_config.mode == SourceMode::Stream {
                continue;
            }
            let listed = match build_source(&website.id, source_config) {
                Ok(source) => source.list_targets().await.map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };
            let targets = match listed {
                Ok(targets) => targets,
                Err(e) => {
                    println!(
                        "{:<16} {:<16} error: {:#}",
                        website.id, source_config.id, e
                    );
                    continue;
                }
            };
            for target in targets {
                let modified = target
                    .meta
                    .mod_time
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let etag = if target.meta.etag.is_empty() {
                    "-"
                } else {
                    target.meta.etag.as_str()
                };
                println!(
                    "{:<16} {:<16} {:>12} {:<20} {:<5} {:<34} {}",
                    website.id,
                    source_config.id,
                    target.meta.size,
                    modified,
                    target.meta.compressed,
                    etag,
                    target.key
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_build_each_source_type() {
        let config = parse_config(
            r#"
[[websites]]
id = "main"

[[websites.sources]]
id = "nginx"
type = "local"
path = "/var/log/nginx/access.log"

[[websites.sources]]
id = "edge"
type = "sftp"
pattern = "/var/log/nginx/access.log*"

[websites.sources.sftp]
host = "edge-1"
user = "logs"
password = "secret"

[[websites.sources]]
id = "cdn"
type = "s3"
pattern = "access-*.gz"

[websites.sources.s3]
bucket = "edge-logs"
access_key = "AKIDEXAMPLE"
secret_key = "wJalrXUtnFEMI"

[[websites.sources]]
id = "agent"
type = "agent"
mode = "stream"
"#,
        )
        .unwrap();

        let website = &config.websites[0];
        let built: Vec<(String, SourceType)> = website
            .sources
            .iter()
            .map(|s| {
                let source = build_source(&website.id, s).unwrap();
                (source.id().to_string(), source.source_type())
            })
            .collect();
        assert_eq!(
            built,
            vec![
                ("nginx".to_string(), SourceType::Local),
                ("edge".to_string(), SourceType::Sftp),
                ("cdn".to_string(), SourceType::S3),
                ("agent".to_string(), SourceType::Agent),
            ]
        );
    }
}
