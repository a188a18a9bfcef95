//! # logscan CLI
//!
//! The `logscan` binary drives one-shot scan passes, the push ingest server
//! and the tailing agent.
//!
//! ## Usage
//!
//! ```bash
//! logscan --config ./config/logscan.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `logscan init` | Create the SQLite database and run schema migrations |
//! | `logscan sources` | List configured websites and sources |
//! | `logscan targets` | List the targets each poll source currently exposes |
//! | `logscan scan` | Run one incremental scan pass |
//! | `logscan serve` | Start the HTTP push endpoint |
//! | `logscan tail` | Follow local files and push new lines to a server |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use logscan::config;
use logscan::dedup::DedupCache;
use logscan::logging;
use logscan::migrate;
use logscan::parser::{AccessLogParser, JsonLinesSink};
use logscan::push::PushIngestor;
use logscan::scanner;
use logscan::server;
use logscan::sources;
use logscan::tail;
use logscan::traits::RecordSink;

/// logscan: incremental web access-log scanning.
///
/// All commands except `tail` read a TOML configuration file given by
/// `--config`. See `config/logscan.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "logscan",
    about = "Incremental multi-source web access-log scanner",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/logscan.toml")]
    config: PathBuf,

    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List configured websites and sources.
    Sources,

    /// List the targets each poll source currently exposes.
    Targets {
        /// Only list targets for this website.
        #[arg(long)]
        website: Option<String>,
    },

    /// Run one incremental scan pass.
    ///
    /// Records are written as JSON lines to stdout, or appended to `--output`.
    /// Exits non-zero if any source or target failed.
    Scan {
        /// Only scan this website.
        #[arg(long)]
        website: Option<String>,

        /// Append records to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Start the HTTP push endpoint.
    Serve {
        /// Append pushed records to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Follow local log files and push new lines to a logscan server.
    Tail {
        /// Path to the agent configuration file (TOML).
        #[arg(long, default_value = "./config/agent.toml")]
        agent_config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose)?;

    // The agent has its own config file
    if let Commands::Tail { agent_config } = &cli.command {
        let agent = tail::load_agent_config(agent_config)?;
        tail::run_agent(&agent, shutdown_token()).await?;
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Targets { website } => {
            sources::list_targets(&cfg, website.as_deref()).await?;
        }
        Commands::Scan { website, output } => {
            let ok = scanner::run_scan(&cfg, website.as_deref(), output.as_deref()).await?;
            if !ok {
                bail!("scan finished with failures");
            }
        }
        Commands::Serve { output } => {
            let sink: Arc<dyn RecordSink> = match output {
                Some(path) => Arc::new(JsonLinesSink::file(&path).await?),
                None => Arc::new(JsonLinesSink::stdout()),
            };
            let ingestor = Arc::new(PushIngestor::new(
                Arc::new(DedupCache::from_config(&cfg.dedup)),
                Arc::new(AccessLogParser::new(sink)),
            ));
            server::run_server(&cfg, ingestor).await?;
        }
        Commands::Tail { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}
