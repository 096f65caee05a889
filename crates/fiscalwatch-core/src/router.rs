use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::WatchConfig;

/// Result of handling one file; picks the destination directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Succeeded,
    Failed { detail: Option<String> },
}

impl ProcessingOutcome {
    pub fn failed(detail: impl Into<String>) -> Self {
        Self::Failed {
            detail: Some(detail.into()),
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "processed",
            Self::Failed { .. } => "error",
        }
    }
}

/// Moves handled files out of the watch directory without ever overwriting.
pub struct FileRouter {
    processed_dir: PathBuf,
    error_dir: PathBuf,
    dir_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileRouter {
    pub fn new(processed_dir: impl Into<PathBuf>, error_dir: impl Into<PathBuf>) -> Self {
        Self {
            processed_dir: processed_dir.into(),
            error_dir: error_dir.into(),
            dir_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self::new(config.processed_dir.clone(), config.error_dir.clone())
    }

    pub fn destination_dir(&self, outcome: &ProcessingOutcome) -> &Path {
        if outcome.is_success() {
            &self.processed_dir
        } else {
            &self.error_dir
        }
    }

    fn dir_lock(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .dir_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(dir.to_path_buf()).or_default().clone()
    }

    /// Moves `source` into the directory chosen by `outcome`, returning where it landed.
    pub async fn relocate(&self, source: &Path, outcome: &ProcessingOutcome) -> io::Result<PathBuf> {
        let file_name = source.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a file path: {}", source.display()),
            )
        })?;
        let dir = self.destination_dir(outcome).to_path_buf();

        let lock = self.dir_lock(&dir);
        let _guard = lock.lock().await;

        let source = source.to_path_buf();
        let name = file_name.to_os_string();
        tokio::task::spawn_blocking(move || -> io::Result<PathBuf> {
            std::fs::create_dir_all(&dir)?;
            let destination = free_destination(&dir, &name)?;
            move_file(&source, &destination)?;
            Ok(destination)
        })
        .await
        .map_err(io::Error::other)?
    }
}

fn split_name(file_name: &OsStr) -> (String, String) {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

/// Suffix `n` when `candidate` is `<stem>_<n><ext>`.
fn suffix_of(candidate: &str, stem: &str, ext: &str) -> Option<u64> {
    candidate
        .strip_prefix(stem)?
        .strip_prefix('_')?
        .strip_suffix(ext)?
        .parse()
        .ok()
}

/// First name in `dir` that is free: the original name, else `<stem>_<n><ext>`
/// with `n` above every suffix already present for that stem.
pub fn free_destination(dir: &Path, file_name: &OsStr) -> io::Result<PathBuf> {
    let plain = dir.join(file_name);
    if !plain.try_exists()? {
        return Ok(plain);
    }

    let (stem, ext) = split_name(file_name);
    let highest = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .filter_map(|e| suffix_of(&e.file_name().to_string_lossy(), &stem, &ext))
        .max()
        .unwrap_or(0);

    let mut n = highest;
    loop {
        n = n.checked_add(1).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("no free name left for {stem}{ext}"),
            )
        })?;
        let candidate = dir.join(format!("{stem}_{n}{ext}"));
        if !candidate.try_exists()? {
            return Ok(candidate);
        }
    }
}

/// Rename when possible; across volumes fall back to [`copy_then_replace`].
fn move_file(source: &Path, destination: &Path) -> io::Result<()> {
    match std::fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            tracing::debug!(path = %source.display(), "Cross-device move, copying");
            copy_then_replace(source, destination)
        }
        Err(e) => Err(e),
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    destination.with_file_name(format!(
        ".{}.partial",
        destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ))
}

/// Copy to a hidden partial file next to the destination, rename it into
/// place, then remove the source. Exactly one copy survives or the move fails.
fn copy_then_replace(source: &Path, destination: &Path) -> io::Result<()> {
    let partial = partial_path(destination);

    if let Err(e) = std::fs::copy(source, &partial) {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }
    if let Err(e) = std::fs::rename(&partial, destination) {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }
    if let Err(e) = std::fs::remove_file(source) {
        let _ = std::fs::remove_file(destination);
        return Err(e);
    }
    Ok(())
}
