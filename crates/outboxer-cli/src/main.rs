mod cli;
mod handlers;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use outboxer_core::config::{FileSettings, PluginRegistry};
use outboxer_core::impls::PgOutboxStore;
use outboxer_core::ports::OutboxStore;
use outboxer_core::{Application, Configuration};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let file = match &cli.config {
        Some(path) => FileSettings::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FileSettings::default(),
    };
    let config = build_configuration(&cli, &file)?;
    let settings = config.settings();

    let url = settings
        .database_url
        .clone()
        .context("no database url: pass --database-url or set DATABASE_URL")?;
    let store = PgOutboxStore::connect(&url, settings).await?;

    match &cli.command {
        None | Some(Command::Run) => run(Arc::new(store), config).await,
        Some(Command::Migrate) => {
            store.install_schema().await?;
            Ok(())
        }
        Some(Command::Enqueue(args)) => {
            let id = store.enqueue(&args.to_event()?).await?;
            info!(event_id = %id, event_type = %args.event_type, "event enqueued");
            println!("{id}");
            Ok(())
        }
        Some(Command::Counts) => {
            let counts = store.counts(settings.max_attempts).await?;
            println!("{}", serde_json::to_string(&counts)?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt().with_target(false).with_env_filter(filter).init();
}

fn build_configuration(cli: &Cli, file: &FileSettings) -> anyhow::Result<Configuration> {
    let registry = PluginRegistry::with_builtin();
    let builder = Configuration::builder().apply_file(file, &registry)?;
    let builder = handlers::register(builder, &file.handlers)?;
    let builder = cli.apply_overrides(builder)?;
    Ok(builder.build()?)
}

async fn run(store: Arc<PgOutboxStore>, config: Configuration) -> anyhow::Result<()> {
    if config.handlers().is_empty() {
        warn!("no handlers configured, claimed events will be discarded");
    }
    info!(
        table = %config.settings().table,
        concurrency = config.settings().concurrency,
        "starting outboxer"
    );

    let app = Application::new(store, Arc::new(config));
    app.start()?;

    let received = shutdown_signal().await;
    info!(signal = received, "shutdown requested");
    app.stop().await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal as unix_signal};

    let mut term = match unix_signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(error = %err, "cannot listen for TERM, waiting for INT only");
            let _ = signal::ctrl_c().await;
            return "INT";
        }
    };
    tokio::select! {
        _ = signal::ctrl_c() => "INT",
        _ = term.recv() => "TERM",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = signal::ctrl_c().await;
    "INT"
}
