use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use fiscalwatch_core::{KindRegistry, SqlRepository, WatchConfig, WatchService};

const DEFAULT_FILTER: &str = "fiscalwatch=info,fiscalwatch_core=info";

#[derive(Parser)]
#[command(
    name = "fiscalwatch",
    about = "Ingest fiscal XML documents dropped into a watched folder",
    version
)]
struct Cli {
    /// Settings file (JSON)
    #[arg(short, long, env = "FISCALWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Process files already in the watch folder, then exit
    #[arg(long)]
    once: bool,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("fiscalwatch").join("config.json"))
}

fn load_config(explicit: Option<&Path>) -> Result<WatchConfig> {
    let path = explicit.map(Path::to_path_buf).or_else(default_config_path);

    match path {
        Some(path) if explicit.is_some() || path.is_file() => WatchConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        _ => {
            let mut config = WatchConfig::default();
            config
                .apply_env()
                .context("Invalid FISCALWATCH_* environment settings")?;
            Ok(config)
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Stderr always; the log file too when one is configured. The guard must
/// outlive the service or buffered lines are lost.
fn init_tracing(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let mut guard = None;

    let file_layer = log_file.and_then(|path| {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path.file_name()?;
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: failed to create log directory {}: {e}", dir.display());
            return None;
        }
        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, g) = tracing_appender::non_blocking(appender);
        guard = Some(g);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter()),
        )
    });

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}

/// Ctrl-C everywhere, SIGTERM too on unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let _log_guard = init_tracing(config.log_file.as_deref());

    config.validate().context("Invalid configuration")?;

    let registry = Arc::new(KindRegistry::default());
    let repository = Arc::new(SqlRepository::from_config(&config, &registry));

    if config.is_storage_configured() {
        if let Err(e) = repository.test_connection().await {
            tracing::error!(error = %e, "Storage connection test failed");
        }
    } else {
        tracing::warn!("No connection string configured; every document will go to the error folder");
    }

    let service = WatchService::new(config, registry, repository);

    if cli.once {
        let found = service.run_once().await.context("Initial scan failed")?;
        tracing::info!(files = found, "Single pass finished");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let service = service.spawn(cancel.clone()).wait();
    tokio::pin!(service);

    tokio::select! {
        result = &mut service => return result.context("Watcher service failed"),
        signal = shutdown_signal() => {
            signal.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested");
        }
    }

    cancel.cancel();
    service.await.context("Watcher service failed")
}
