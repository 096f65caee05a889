use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Debounce applied before a newly announced file is first read.
pub const MIN_DEBOUNCE_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Unsupported storage engine: {0}")]
    UnsupportedEngine(String),
}

/// Storage engines the repository knows how to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageEngine {
    #[default]
    Sqlite,
    Postgres,
}

impl StorageEngine {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl std::fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StorageEngine {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            _ => Err(ConfigError::UnsupportedEngine(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for StorageEngine {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Settings for one pipeline run. Loaded once at startup and never re-read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default, alias = "WatchFolder")]
    pub watch_dir: PathBuf,

    #[serde(default, alias = "ProcessedFolder")]
    pub processed_dir: PathBuf,

    #[serde(default, alias = "ErrorFolder")]
    pub error_dir: PathBuf,

    #[serde(default, alias = "DatabaseType")]
    pub database_type: StorageEngine,

    /// Empty means storage is not configured; every insert then fails fast.
    #[serde(default, alias = "ConnectionString")]
    pub connection_string: String,

    #[serde(default, alias = "LogFilePath", deserialize_with = "empty_path_as_none")]
    pub log_file: Option<PathBuf>,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

const fn default_debounce_ms() -> u64 {
    MIN_DEBOUNCE_MS
}

fn empty_path_as_none<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<PathBuf>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()).map(PathBuf::from))
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            watch_dir: PathBuf::new(),
            processed_dir: PathBuf::new(),
            error_dir: PathBuf::new(),
            database_type: StorageEngine::default(),
            connection_string: String::new(),
            log_file: None,
            debounce_ms: MIN_DEBOUNCE_MS,
        }
    }
}

impl WatchConfig {
    /// Convenience constructor used by tests and embedders; storage left unconfigured.
    pub fn new(
        watch_dir: impl Into<PathBuf>,
        processed_dir: impl Into<PathBuf>,
        error_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            processed_dir: processed_dir.into(),
            error_dir: error_dir.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_storage(mut self, engine: StorageEngine, connection_string: impl Into<String>) -> Self {
        self.database_type = engine;
        self.connection_string = connection_string.into();
        self
    }

    #[must_use]
    pub fn with_debounce_ms(mut self, ms: u64) -> Self {
        self.debounce_ms = ms;
        self
    }

    /// Parse a settings document. Accepts either the bare settings object or
    /// one wrapped in a `ServiceConfiguration` section.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let section = match value.get("ServiceConfiguration") {
            Some(inner) => inner.clone(),
            None => value,
        };
        Ok(serde_json::from_value(section)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&text)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Environment variables win over the file.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("FISCALWATCH_WATCH_DIR") {
            self.watch_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FISCALWATCH_PROCESSED_DIR") {
            self.processed_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FISCALWATCH_ERROR_DIR") {
            self.error_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FISCALWATCH_DATABASE_TYPE") {
            self.database_type = v.parse()?;
        }
        if let Ok(v) = std::env::var("FISCALWATCH_CONNECTION_STRING") {
            self.connection_string = v;
        }
        if let Ok(v) = std::env::var("FISCALWATCH_LOG_FILE") {
            self.log_file = Some(PathBuf::from(v)).filter(|p| !p.as_os_str().is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("watch_dir"));
        }
        if self.processed_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("processed_dir"));
        }
        if self.error_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("error_dir"));
        }
        Ok(())
    }

    pub fn is_storage_configured(&self) -> bool {
        !self.connection_string.trim().is_empty()
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.max(MIN_DEBOUNCE_MS))
    }

    /// Create the watch, processed, error and log directories when absent.
    /// Individual failures are logged; the caller decides what is fatal.
    pub fn ensure_directories(&self) {
        let log_dir = self
            .log_file
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty());

        let dirs = [
            ("watch", Some(self.watch_dir.as_path())),
            ("processed", Some(self.processed_dir.as_path())),
            ("error", Some(self.error_dir.as_path())),
            ("log", log_dir),
        ];

        for (label, dir) in dirs {
            let Some(dir) = dir else { continue };
            if dir.is_dir() {
                continue;
            }
            match std::fs::create_dir_all(dir) {
                Ok(()) => tracing::info!(path = %dir.display(), "Created {label} directory"),
                Err(e) => {
                    tracing::error!(path = %dir.display(), error = %e, "Failed to create {label} directory");
                }
            }
        }
    }
}
