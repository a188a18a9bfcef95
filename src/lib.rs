//! # logscan
//!
//! An incremental, multi-source web access-log scanning engine.
//!
//! logscan discovers log files on several kinds of storage (local disk, SFTP
//! servers, S3-compatible object stores), remembers how far it has read each
//! one, and on every pass parses only what is new. Rotated or truncated files
//! are detected and re-read; compressed files are rescanned whole only when
//! they change. Agent sources push lines over HTTP instead of being polled.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌────────────┐   ┌─────────────┐
//! │ Sources          │──▶│  Scanner   │──▶│ LineParser  │──▶ RecordSink
//! │ Local/SFTP/S3    │   │ per-target │   │ (timestamps)│
//! └──────────────────┘   └─────┬──────┘   └─────────────┘
//!                              │                 ▲
//!                              ▼                 │
//!                       ┌─────────────┐   ┌─────────────┐
//!                       │ TargetState │   │ PushIngestor│◀── tail agent
//!                       │ store       │   │ + DedupCache│    (HTTP)
//!                       └─────────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! logscan init                     # create database
//! logscan sources                  # show configured sources
//! logscan scan --output out.jsonl  # one incremental pass
//! logscan serve                    # accept pushed lines
//! logscan tail --agent-config agent.toml
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`traits`] | Source, parser and sink seams |
//! | [`connector_fs`] | Local filesystem backend |
//! | [`connector_sftp`] | SFTP backend |
//! | [`connector_s3`] | S3-compatible object store backend |
//! | [`connector_agent`] | Push-only agent backend |
//! | [`scanner`] | Per-target incremental scan |
//! | [`store`] | Target state persistence |
//! | [`dedup`] | Bounded TTL dedup cache |
//! | [`push`] | Push ingestion boundary |
//! | [`server`] | HTTP ingest endpoint |
//! | [`tail`] | Tailing agent |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod connector_agent;
pub mod connector_fs;
pub mod connector_s3;
pub mod connector_sftp;
pub mod db;
pub mod dedup;
pub mod error;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod push;
pub mod scanner;
pub mod server;
pub mod sources;
pub mod store;
pub mod stream;
pub mod tail;
pub mod traits;
