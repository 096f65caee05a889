use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::WatchConfig;
use crate::document::{decode_xml, RawDocument};
use crate::error::{Error, ProcessError, Result};
use crate::kind::{DocumentKind, KindRegistry};
use crate::repository::{DocumentRepository, SqlRepository, StorageError};
use crate::router::{FileRouter, ProcessingOutcome};

/// Only files with this extension are picked up.
pub const WATCHED_EXTENSION: &str = "xml";

/// What happened to one file.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub path: PathBuf,
    pub kind: DocumentKind,
    pub outcome: ProcessingOutcome,
    /// Where the file ended up; `None` when the move itself failed.
    pub destination: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    Missing,
    NotAFile,
    Locked,
}

/// Removes the path from the in-flight set when the handler is done.
struct Claim {
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.path);
        }
    }
}

/// Watches one directory and drives every arriving file through
/// classify, extract, persist and relocate.
pub struct WatchService {
    config: WatchConfig,
    registry: Arc<KindRegistry>,
    repository: Arc<dyn DocumentRepository>,
    router: FileRouter,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

impl WatchService {
    pub fn new(
        config: WatchConfig,
        registry: Arc<KindRegistry>,
        repository: Arc<dyn DocumentRepository>,
    ) -> Self {
        let router = FileRouter::from_config(&config);
        Self {
            config,
            registry,
            repository,
            router,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Default kinds and an `sqlx` repository built from the config.
    pub fn from_config(config: WatchConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(KindRegistry::default());
        let repository = Arc::new(SqlRepository::from_config(&config, &registry));
        Ok(Self::new(config, registry, repository))
    }

    fn claim(&self, path: &Path) -> Option<Claim> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(path.to_path_buf()) {
            return None;
        }
        Some(Claim {
            in_flight: Arc::clone(&self.in_flight),
            path: path.to_path_buf(),
        })
    }

    fn prepare(&self) -> Result<()> {
        self.config.validate()?;
        self.config.ensure_directories();
        if !self.config.watch_dir.is_dir() {
            return Err(Error::WatchDirUnavailable(self.config.watch_dir.clone()));
        }
        Ok(())
    }

    /// Waits out the debounce, checks the writer is done, then ingests.
    /// Returns `None` when the attempt was abandoned and the file left alone.
    pub async fn process_file(&self, path: &Path) -> Option<ProcessingReport> {
        tokio::time::sleep(self.config.debounce()).await;

        match readiness(path).await {
            Readiness::Ready => {}
            Readiness::Missing => {
                tracing::warn!(path = %path.display(), "File no longer exists");
                return None;
            }
            Readiness::NotAFile => {
                tracing::warn!(path = %path.display(), "Not a regular file, skipping");
                return None;
            }
            Readiness::Locked => {
                tracing::warn!(path = %path.display(), "File is locked by another writer");
                return None;
            }
        }

        Some(self.ingest_file(path).await)
    }

    /// Classify, extract, persist and relocate one file. Every failure ends
    /// with the file in the error directory.
    pub async fn ingest_file(&self, path: &Path) -> ProcessingReport {
        tracing::info!(path = %path.display(), "Processing file");

        let (kind, result) = self.ingest(path).await;
        let outcome = match result {
            Ok(rows) => {
                tracing::info!(path = %path.display(), %kind, rows, "File ingested");
                ProcessingOutcome::Succeeded
            }
            Err(e) => {
                match &e {
                    ProcessError::UnknownKind => {
                        tracing::warn!(path = %path.display(), "Unknown document kind");
                    }
                    ProcessError::Storage(StorageError::NotConfigured) => {
                        tracing::warn!(path = %path.display(), %kind, "Storage is not configured");
                    }
                    ProcessError::Storage(err) => {
                        tracing::error!(path = %path.display(), %kind, error = %err, "Persistence failed");
                    }
                    ProcessError::Read(_) | ProcessError::Parse(_) => {
                        tracing::error!(path = %path.display(), error = %e, "Unreadable document");
                    }
                }
                ProcessingOutcome::failed(e.to_string())
            }
        };

        let destination = match self.router.relocate(path, &outcome).await {
            Ok(dest) => {
                tracing::info!(
                    path = %path.display(),
                    destination = %dest.display(),
                    "File moved to {} folder",
                    outcome.label()
                );
                Some(dest)
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to move file");
                None
            }
        };

        ProcessingReport {
            path: path.to_path_buf(),
            kind,
            outcome,
            destination,
        }
    }

    async fn ingest(&self, path: &Path) -> (DocumentKind, std::result::Result<u64, ProcessError>) {
        let text = match tokio::fs::read(path).await.and_then(decode_xml) {
            Ok(text) => text,
            Err(e) => return (DocumentKind::Unknown, Err(e.into())),
        };

        let (kind, record) = {
            let doc = match RawDocument::parse(&text, path) {
                Ok(doc) => doc,
                Err(e) => return (DocumentKind::Unknown, Err(e.into())),
            };

            let kind = self.registry.classify(&doc);
            tracing::info!(path = %path.display(), %kind, "Detected document kind");

            let Some(handler) = self.registry.handler(kind) else {
                return (kind, Err(ProcessError::UnknownKind));
            };
            (kind, handler.extract(&doc, &doc.file_name()))
        };

        if record.is_partial() {
            tracing::warn!(
                path = %path.display(),
                %kind,
                fields = ?record.defaulted,
                "Missing fields stored with default values"
            );
        }

        let result = self.repository.insert(kind, &record).await;
        (kind, result.map_err(ProcessError::from))
    }

    /// Processes every matching file already in the watch directory, one at a time.
    pub async fn initial_scan(&self, cancel: &CancellationToken) -> usize {
        tracing::info!(path = %self.config.watch_dir.display(), "Performing initial scan of watch folder");

        let files = match list_watched_files(&self.config.watch_dir).await {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(error = %e, "Error during initial scan");
                return 0;
            }
        };
        tracing::info!(count = files.len(), "Found XML files in watch folder");

        for file in &files {
            if cancel.is_cancelled() {
                tracing::info!("Initial scan interrupted by shutdown");
                break;
            }
            if let Some(_claim) = self.claim(file) {
                self.process_file(file).await;
            }
        }

        tracing::info!("Initial scan completed");
        files.len()
    }

    /// Directory setup plus the initial scan, without watching afterwards.
    pub async fn run_once(&self) -> Result<usize> {
        self.prepare()?;
        Ok(self.initial_scan(&CancellationToken::new()).await)
    }

    fn arm_watcher(
        &self,
        tx: mpsc::UnboundedSender<notify::Result<Event>>,
    ) -> notify::Result<RecommendedWatcher> {
        let mut watcher = notify::recommended_watcher(move |res| {
            // Never block the notification thread.
            let _ = tx.send(res);
        })?;
        watcher.watch(&self.config.watch_dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    fn dispatch(self: &Arc<Self>, path: PathBuf, tasks: &mut JoinSet<()>) {
        let Some(claim) = self.claim(&path) else {
            tracing::debug!(path = %path.display(), "Already being processed");
            return;
        };

        let service = Arc::clone(self);
        tasks.spawn(async move {
            let _claim = claim;
            service.process_file(&path).await;
        });
    }

    async fn on_event(self: &Arc<Self>, event: Event, tasks: &mut JoinSet<()>) {
        if event.need_rescan() {
            tracing::warn!("Watcher dropped events, rescanning watch folder");
            match list_watched_files(&self.config.watch_dir).await {
                Ok(files) => files.into_iter().for_each(|f| self.dispatch(f, tasks)),
                Err(e) => tracing::error!(error = %e, "Rescan failed"),
            }
            return;
        }

        for path in event_paths(&event) {
            if !is_watched_file(&path) {
                continue;
            }
            match event.kind {
                EventKind::Create(_) => tracing::info!(path = %path.display(), "New file detected"),
                _ => tracing::info!(path = %path.display(), "File changed"),
            }
            self.dispatch(path, tasks);
        }
    }

    /// Runs until `cancel` fires. Stops taking new events on cancellation and
    /// waits for files already in progress.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            watch_dir = %self.config.watch_dir.display(),
            engine = %self.config.database_type,
            "XML file watcher service starting"
        );
        self.prepare()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Armed before the scan so nothing slips between the two.
        let watcher = match self.arm_watcher(tx) {
            Ok(w) => {
                tracing::info!(path = %self.config.watch_dir.display(), "File system watcher armed");
                Some(w)
            }
            Err(e) => {
                tracing::error!(error = %e, "Error setting up file system watcher");
                None
            }
        };

        self.initial_scan(&cancel).await;
        tracing::info!("XML file watcher service started");

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "File handler panicked");
                    }
                }
                event = rx.recv() => match event {
                    Some(Ok(event)) => self.on_event(event, &mut tasks).await,
                    Some(Err(e)) => tracing::error!(error = %e, "File system watcher error"),
                    None => {
                        // No watcher: nothing more will arrive.
                        cancel.cancelled().await;
                        break;
                    }
                },
            }
        }

        drop(watcher);
        tracing::info!(in_flight = tasks.len(), "Stopping; waiting for files in progress");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "File handler panicked");
            }
        }
        tracing::info!("XML file watcher service stopped");
        Ok(())
    }

    /// Spawns [`WatchService::run`] on the current runtime.
    pub fn spawn(self, cancel: CancellationToken) -> ServiceHandle {
        let service = Arc::new(self);
        let join = tokio::spawn(service.run(cancel.clone()));
        ServiceHandle { cancel, join }
    }
}

/// Builds the default service from `config` and starts it. Must be called
/// inside a tokio runtime.
pub fn start(config: WatchConfig) -> Result<ServiceHandle> {
    Ok(WatchService::from_config(config)?.spawn(CancellationToken::new()))
}

/// Handle to a running service.
pub struct ServiceHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<()>>,
}

impl ServiceHandle {
    /// Signals shutdown and waits for in-flight files to finish.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.wait().await
    }

    pub async fn wait(self) -> Result<()> {
        self.join.await?
    }
}

pub fn is_watched_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(WATCHED_EXTENSION))
}

/// Paths of an event worth processing: creations, content changes and
/// renames into the directory.
fn event_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Name(RenameMode::To)) => {
            event.paths.clone()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().cloned().into_iter().collect()
        }
        _ => Vec::new(),
    }
}

async fn list_watched_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_watched_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Opens the file and tries to take an exclusive lock on it.
async fn readiness(path: &Path) -> Readiness {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use fs2::FileExt;

        match std::fs::metadata(&path) {
            Ok(meta) if !meta.is_file() => return Readiness::NotAFile,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Readiness::Missing,
            Err(_) => return Readiness::Locked,
        }
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Readiness::Missing,
            Err(_) => return Readiness::Locked,
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                Readiness::Ready
            }
            Err(_) => Readiness::Locked,
        }
    })
    .await
    .unwrap_or(Readiness::Locked)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind};
    use tempfile::TempDir;

    use super::*;
    use crate::config::StorageEngine;

    struct Fixture {
        _tmp: TempDir,
        config: WatchConfig,
    }

    fn fixture(connection: Option<&str>) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut config = WatchConfig::new(
            tmp.path().join("in"),
            tmp.path().join("ok"),
            tmp.path().join("err"),
        );
        if let Some(c) = connection {
            let db = tmp.path().join(c);
            config = config.with_storage(StorageEngine::Sqlite, db.to_string_lossy());
        }
        config.ensure_directories();
        Fixture { _tmp: tmp, config }
    }

    fn service(f: &Fixture) -> WatchService {
        WatchService::from_config(f.config.clone()).unwrap()
    }

    const SAT: &str = r#"<CFe><infCFe Id="CFe1"><total><vCFe>3.00</vCFe></total></infCFe></CFe>"#;

    #[test]
    fn test_extension_filter() {
        assert!(is_watched_file(Path::new("/in/a.xml")));
        assert!(is_watched_file(Path::new("/in/A.XML")));
        assert!(!is_watched_file(Path::new("/in/a.xml.tmp")));
        assert!(!is_watched_file(Path::new("/in/a")));
    }

    #[test]
    fn test_event_paths() {
        let p = PathBuf::from("/in/a.xml");

        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(p.clone());
        assert_eq!(event_paths(&create), vec![p.clone()]);

        let write = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(p.clone());
        assert_eq!(event_paths(&write), vec![p.clone()]);

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/in/a.tmp"))
            .add_path(p.clone());
        assert_eq!(event_paths(&rename), vec![p.clone()]);

        let touch = Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)))
            .add_path(p.clone());
        assert!(event_paths(&touch).is_empty());

        let read = Event::new(EventKind::Access(AccessKind::Any)).add_path(p);
        assert!(event_paths(&read).is_empty());
    }

    #[test]
    fn test_claim_is_exclusive_per_path() {
        let f = fixture(None);
        let svc = service(&f);
        let path = Path::new("/in/a.xml");

        let first = svc.claim(path);
        assert!(first.is_some());
        assert!(svc.claim(path).is_none());
        assert!(svc.claim(Path::new("/in/b.xml")).is_some());

        drop(first);
        assert!(svc.claim(path).is_some());
    }

    #[tokio::test]
    async fn test_unknown_kind_goes_to_error_dir() {
        let f = fixture(Some("fiscal.db"));
        let svc = service(&f);
        let path = f.config.watch_dir.join("invoice.xml");
        fs::write(&path, "<invoice><total>1</total></invoice>").unwrap();

        let report = svc.ingest_file(&path).await;

        assert_eq!(report.kind, DocumentKind::Unknown);
        assert!(!report.outcome.is_success());
        assert_eq!(report.destination, Some(f.config.error_dir.join("invoice.xml")));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_malformed_xml_goes_to_error_dir() {
        let f = fixture(Some("fiscal.db"));
        let svc = service(&f);
        let path = f.config.watch_dir.join("broken.xml");
        fs::write(&path, "<CFe><infCFe>").unwrap();

        let report = svc.ingest_file(&path).await;

        assert!(!report.outcome.is_success());
        assert!(f.config.error_dir.join("broken.xml").exists());
    }

    #[tokio::test]
    async fn test_known_kind_goes_to_processed_dir() {
        let f = fixture(Some("fiscal.db"));
        let svc = service(&f);
        let path = f.config.watch_dir.join("cupom.xml");
        fs::write(&path, SAT).unwrap();

        let report = svc.ingest_file(&path).await;

        assert_eq!(report.kind, DocumentKind::SatCfe);
        assert_eq!(report.outcome, ProcessingOutcome::Succeeded);
        assert!(f.config.processed_dir.join("cupom.xml").exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_abandoned() {
        let f = fixture(Some("fiscal.db"));
        let svc = service(&f);

        let report = svc.process_file(&f.config.watch_dir.join("ghost.xml")).await;
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn test_locked_file_is_left_in_place() {
        use fs2::FileExt;

        let f = fixture(Some("fiscal.db"));
        let svc = service(&f);
        let path = f.config.watch_dir.join("busy.xml");
        fs::write(&path, SAT).unwrap();

        let writer = fs::File::open(&path).unwrap();
        writer.lock_exclusive().unwrap();

        let report = svc.process_file(&path).await;
        assert!(report.is_none());
        assert!(path.exists());

        writer.unlock().unwrap();
        let report = svc.process_file(&path).await.unwrap();
        assert!(report.outcome.is_success());
    }

    #[tokio::test]
    async fn test_directory_named_like_xml_is_left_alone() {
        let f = fixture(Some("fiscal.db"));
        let svc = service(&f);
        let dir = f.config.watch_dir.join("batch.xml");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("inner.txt"), "keep").unwrap();

        assert!(svc.process_file(&dir).await.is_none());
        assert!(dir.join("inner.txt").exists());
        assert!(!f.config.error_dir.join("batch.xml").exists());
    }

    #[tokio::test]
    async fn test_latin1_document_is_ingested() {
        let f = fixture(Some("fiscal.db"));
        let svc = service(&f);
        let path = f.config.watch_dir.join("latin1.xml");
        let mut bytes = br#"<?xml version="1.0" encoding="ISO-8859-1"?><CFe><infCFe Id="CFe9"><emit><xNome>Padaria S"#.to_vec();
        bytes.push(0xE3); // a with tilde
        bytes.extend_from_slice(b"o Jo");
        bytes.push(0xE3);
        bytes.extend_from_slice(b"o</xNome></emit></infCFe></CFe>");
        fs::write(&path, bytes).unwrap();

        let report = svc.ingest_file(&path).await;

        assert_eq!(report.kind, DocumentKind::SatCfe);
        assert!(report.outcome.is_success());
    }

    #[tokio::test]
    async fn test_run_once_scans_existing_files() {
        let f = fixture(Some("fiscal.db"));
        fs::write(f.config.watch_dir.join("a.xml"), SAT).unwrap();
        fs::write(f.config.watch_dir.join("b.xml"), "not xml at all").unwrap();
        fs::write(f.config.watch_dir.join("notes.txt"), "ignored").unwrap();

        let found = service(&f).run_once().await.unwrap();

        assert_eq!(found, 2);
        assert!(f.config.processed_dir.join("a.xml").exists());
        assert!(f.config.error_dir.join("b.xml").exists());
        assert!(f.config.watch_dir.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let config = WatchConfig::new("", "ok", "err");
        assert!(matches!(
            WatchService::from_config(config),
            Err(Error::Config(_))
        ));
    }
}
