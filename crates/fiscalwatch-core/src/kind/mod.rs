mod nfce;
mod satcfe;

use serde::{Deserialize, Serialize};

pub use nfce::NfceHandler;
pub use satcfe::SatCfeHandler;

use crate::document::RawDocument;
use crate::record::{ExtractedRecord, TableSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Unknown,
    /// Consumer electronic invoice (`nfeProc` / `NFe`).
    Nfce,
    /// SAT fiscal coupon (`CFe` / `infCFe`).
    SatCfe,
}

impl DocumentKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Nfce => "nfce",
            Self::SatCfe => "sat_cfe",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recognised document kind: how to spot it, how to read it, where it goes.
pub trait KindHandler: Send + Sync {
    fn kind(&self) -> DocumentKind;

    /// Decides from the root element and its marker child alone.
    fn matches(&self, doc: &RawDocument<'_>) -> bool;

    /// Never fails: absent fields are defaulted inside the record.
    fn extract(&self, doc: &RawDocument<'_>, source_file_name: &str) -> ExtractedRecord;

    fn table(&self) -> &'static TableSchema;
}

/// Registered handlers, consulted in registration order.
pub struct KindRegistry {
    handlers: Vec<Box<dyn KindHandler>>,
}

impl KindRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Box<dyn KindHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn classify(&self, doc: &RawDocument<'_>) -> DocumentKind {
        self.handlers
            .iter()
            .find(|h| h.matches(doc))
            .map_or(DocumentKind::Unknown, |h| h.kind())
    }

    pub fn handler(&self, kind: DocumentKind) -> Option<&dyn KindHandler> {
        self.handlers
            .iter()
            .find(|h| h.kind() == kind)
            .map(|h| h.as_ref())
    }

    pub fn table(&self, kind: DocumentKind) -> Option<&'static TableSchema> {
        self.handler(kind).map(|h| h.table())
    }

    pub fn kinds(&self) -> impl Iterator<Item = DocumentKind> + '_ {
        self.handlers.iter().map(|h| h.kind())
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
            .with_handler(Box::new(NfceHandler))
            .with_handler(Box::new(SatCfeHandler))
    }
}

/// Strips the literal kind prefix some `Id` attributes carry ahead of the access key.
fn access_key<'a>(id: &'a str, prefix: &str) -> &'a str {
    let id = id.trim();
    id.strip_prefix(prefix).unwrap_or(id)
}
