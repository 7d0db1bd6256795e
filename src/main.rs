//! treewatch - watch directory trees and log every change.
//!
//! Entry point for the treewatch command line tool.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use treewatch::observability::init_tracing;
use treewatch::{
    DirectoryWatcher, Error, ExecutionMode, Notification, Result, ServiceConfig, Subscriber,
    WatchService,
};

/// Watch directory trees and report created, modified and deleted entries.
#[derive(Parser, Debug)]
#[command(name = "treewatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directories to watch
    #[arg(required = true, env = "TREEWATCH_PATHS", value_delimiter = ',')]
    paths: Vec<PathBuf>,

    /// Only report paths matching these globs
    #[arg(short, long, env = "TREEWATCH_INCLUDE", value_delimiter = ',')]
    include: Vec<String>,

    /// Never report paths matching these globs
    #[arg(short, long, env = "TREEWATCH_EXCLUDE", value_delimiter = ',')]
    exclude: Vec<String>,

    /// File with one exclude glob per line
    #[arg(long, env = "TREEWATCH_IGNORE_FILE")]
    ignore_file: Option<PathBuf>,

    /// Number of worker threads
    #[arg(short, long, env = "TREEWATCH_THREADS", default_value = "1")]
    threads: usize,

    /// Drive the watch loop by polling at this interval instead of using workers
    #[arg(long, env = "TREEWATCH_POLL_INTERVAL_MS", conflicts_with = "threads")]
    poll_interval_ms: Option<u64>,

    /// Path separator used by globs
    #[arg(long, env = "TREEWATCH_SEPARATOR")]
    separator: Option<char>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TREEWATCH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, env = "TREEWATCH_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mode = match cli.poll_interval_ms {
        Some(_) => ExecutionMode::Polling,
        None => ExecutionMode::ThreadPool {
            threads: cli.threads,
        },
    };
    let config = ServiceConfig {
        mode,
        separator: cli.separator,
        log_level: cli.log_level.clone(),
    };
    config.validate()?;

    init_tracing(&config.log_level, cli.log_json);

    tracing::info!("treewatch v{} starting...", env!("CARGO_PKG_VERSION"));
    tracing::debug!(?config, "Configuration loaded");

    let service = Arc::new(WatchService::new(&config)?);
    let mut watchers = Vec::with_capacity(cli.paths.len());

    for path in &cli.paths {
        let watcher = service.new_watcher(path)?;
        apply_filters(&watcher, &cli)?;
        watcher.subscribe(Subscriber::on_any(log_notification));
        watcher.on_error(|e| tracing::warn!(error = %e, "Notification not delivered"));
        watchers.push(watcher);
    }

    let poller = cli.poll_interval_ms.map(|ms| {
        let service = Arc::clone(&service);
        tokio::task::spawn_blocking(move || poll_loop(&service, Duration::from_millis(ms)))
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::internal(format!("failed to listen for shutdown signal: {e}")))?;

    tracing::info!("Shutting down");
    for watcher in &watchers {
        let stats = watcher.stats();
        tracing::info!(
            path = %watcher.path().display(),
            dispatched = stats.dispatched,
            failures = stats.callback_failures,
            "Watcher statistics"
        );
    }
    service.close();

    if let Some(poller) = poller {
        poller
            .await
            .map_err(|e| Error::internal(format!("poll loop failed: {e}")))?;
    }

    Ok(())
}

fn apply_filters(watcher: &DirectoryWatcher, cli: &Cli) -> Result<()> {
    for glob in &cli.include {
        watcher.include(glob)?;
    }
    for glob in &cli.exclude {
        watcher.exclude(glob)?;
    }
    if let Some(file) = &cli.ignore_file {
        let loaded = watcher.exclude_from_file(file)?;
        tracing::debug!(file = %file.display(), loaded, "Loaded ignore file");
    }
    Ok(())
}

#[allow(clippy::unnecessary_wraps)]
fn log_notification(notification: &Notification) -> anyhow::Result<()> {
    tracing::info!(
        kind = %notification.kind(),
        root = %notification.root().display(),
        path = %notification.path().display(),
        "Change detected"
    );
    Ok(())
}

fn poll_loop(service: &WatchService, interval: Duration) {
    while !service.is_closed() {
        match service.poll() {
            Ok(0) => std::thread::sleep(interval),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Poll loop stopped");
                return;
            }
        }
    }
}
