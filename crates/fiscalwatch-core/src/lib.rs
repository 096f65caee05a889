pub mod config;
pub mod document;
pub mod error;
pub mod kind;
pub mod record;
pub mod repository;
pub mod router;
pub mod watcher;

pub use config::{ConfigError, StorageEngine, WatchConfig};
pub use document::RawDocument;
pub use error::{Error, ProcessError, Result};
pub use kind::{DocumentKind, KindHandler, KindRegistry, NfceHandler, SatCfeHandler};
pub use record::{ExtractedRecord, FieldValue, TableSchema};
pub use repository::{DocumentRepository, SqlRepository, StorageError};
pub use router::{FileRouter, ProcessingOutcome};
pub use watcher::{start, ProcessingReport, ServiceHandle, WatchService};
