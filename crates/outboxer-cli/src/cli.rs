//! Command-line arguments.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use outboxer_core::config::{ConfigurationBuilder, WorkerMode};
use outboxer_core::domain::NewEvent;
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "outboxer", version, about = "Transactional outbox consumer")]
pub struct Cli {
    /// TOML configuration file.
    #[arg(short = 'C', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// PostgreSQL connection string.
    #[arg(short = 'd', long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Outbox table name.
    #[arg(short = 't', long, global = true)]
    pub table: Option<String>,

    /// Number of workers.
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Seconds to wait for workers before aborting them.
    #[arg(long)]
    pub shutdown_timeout: Option<f64>,

    /// Worker backend: `threaded` or `fiber`.
    #[arg(long)]
    pub worker: Option<WorkerMode>,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Consume the outbox until INT or TERM (default).
    Run,
    /// Create the outbox table, indexes and inbox table.
    Migrate,
    /// Insert one event.
    Enqueue(EnqueueArgs),
    /// Print backlog counts as JSON.
    Counts,
}

#[derive(Debug, Args)]
pub struct EnqueueArgs {
    /// Event type.
    #[arg(long = "type")]
    pub event_type: String,

    /// JSON payload after the change.
    #[arg(long)]
    pub after: Option<String>,

    /// JSON payload before the change.
    #[arg(long)]
    pub before: Option<String>,

    /// JSON metadata (correlation ids and the like).
    #[arg(long)]
    pub metadata: Option<String>,

    #[arg(long)]
    pub group: Option<String>,

    #[arg(long)]
    pub unique_id: Option<String>,
}

impl EnqueueArgs {
    pub fn to_event(&self) -> anyhow::Result<NewEvent> {
        let mut event = NewEvent::new(&self.event_type);
        if let Some(after) = &self.after {
            event = event.after(parse_json("--after", after)?);
        }
        if let Some(before) = &self.before {
            event = event.before(parse_json("--before", before)?);
        }
        if let Some(metadata) = &self.metadata {
            event = event.metadata(parse_json("--metadata", metadata)?);
        }
        if let Some(group) = &self.group {
            event = event.group(group);
        }
        if let Some(unique_id) = &self.unique_id {
            event = event.unique_id(unique_id);
        }
        Ok(event)
    }
}

fn parse_json(flag: &str, raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{flag} is not valid JSON"))
}

impl Cli {
    /// Flags win over the configuration file.
    pub fn apply_overrides(
        &self,
        mut builder: ConfigurationBuilder,
    ) -> anyhow::Result<ConfigurationBuilder> {
        if let Some(url) = &self.database_url {
            builder = builder.database_url(url);
        }
        if let Some(table) = &self.table {
            builder = builder.table(table);
        }
        if let Some(concurrency) = self.concurrency {
            builder = builder.concurrency(concurrency);
        }
        if let Some(secs) = self.shutdown_timeout {
            let timeout = Duration::try_from_secs_f64(secs)
                .with_context(|| format!("--shutdown-timeout {secs} is not a valid duration"))?;
            builder = builder.shutdown_timeout(timeout);
        }
        if let Some(mode) = self.worker {
            builder = builder.worker_mode(mode);
        }
        Ok(builder)
    }
}
