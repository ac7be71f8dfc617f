//! vk-daemon: Headless bridge between a vault of task notes and the task
//! service.
//!
//! Polls the service for status changes and writes them into note
//! frontmatter, while watching the vault for notes being linked, edited or
//! removed.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vk_daemon::{Args, Daemon, DaemonSettings, FileWatcher, HttpTaskClient, NativeFs};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.default_log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting vk-daemon");
    info!("Vault path: {:?}", args.vault);
    info!("Task service: {}", args.service_url);

    let vault_path = args
        .vault
        .canonicalize()
        .with_context(|| format!("Vault not found: {}", args.vault.display()))?;

    let client = HttpTaskClient::new(args.request_timeout())?;
    let settings = DaemonSettings {
        service_url: args.service_url.clone(),
        projects: args.projects.clone(),
        push_unlinked: args.push_unlinked,
        debug: args.verbose,
    };

    let (daemon, updates) = Daemon::start(
        NativeFs::new(vault_path.clone()),
        client,
        args.poller_config(),
        settings,
    )
    .await?;
    info!("Indexed {} linked note(s)", daemon.index().len());

    let mut watcher = FileWatcher::new(vault_path)?;
    info!("File watcher started");

    info!("Daemon running. Press Ctrl+C to stop.");
    daemon
        .run(updates, watcher.event_rx(), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    info!("Shutting down");
    Ok(())
}
