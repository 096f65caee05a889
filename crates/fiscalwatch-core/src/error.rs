use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::repository::StorageError;

/// Failures that stop the service before the watch loop is running.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Watch directory unavailable: {}", .0.display())]
    WatchDirUnavailable(PathBuf),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while handling one file. All of these end in
/// the error directory; none of them reach the watch loop.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to read file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Malformed XML: {0}")]
    Parse(#[from] roxmltree::Error),

    #[error("Unknown document kind")]
    UnknownKind,

    #[error(transparent)]
    Storage(#[from] StorageError),
}
