use crate::document::{child, descend, text_at, RawDocument};
use crate::record::{
    parse_iso8601, ColumnDef, ExtractedRecord, RecordBuilder, TableSchema, PROCESSED_AT_COLUMN,
    SOURCE_FILE_COLUMN,
};

use super::{access_key, DocumentKind, KindHandler};

pub const NFE_NAMESPACE: &str = "http://www.portalfiscal.inf.br/nfe";

static COLUMNS: [ColumnDef; 7] = [
    ColumnDef::text("chave_nfe", 100).indexed(),
    ColumnDef::text("cnpj", 20).indexed(),
    ColumnDef::text("razao_social", 255),
    ColumnDef::timestamp("data_emissao").indexed(),
    ColumnDef::decimal("valor_total"),
    ColumnDef::text(SOURCE_FILE_COLUMN, 255),
    ColumnDef::timestamp(PROCESSED_AT_COLUMN),
];

pub static TABLE: TableSchema = TableSchema {
    name: "nfce_documents",
    columns: &COLUMNS,
};

/// NFC-e processed invoices. Every element lives in the portal fiscal namespace.
pub struct NfceHandler;

impl KindHandler for NfceHandler {
    fn kind(&self) -> DocumentKind {
        DocumentKind::Nfce
    }

    fn matches(&self, doc: &RawDocument<'_>) -> bool {
        doc.root_name() == "nfeProc" && doc.root_has_child("NFe")
    }

    fn extract(&self, doc: &RawDocument<'_>, source_file_name: &str) -> ExtractedRecord {
        let ns = Some(NFE_NAMESPACE);
        let inf = descend(doc.root(), ns, &["NFe", "infNFe"]);

        let key = inf
            .and_then(|n| n.attribute("Id"))
            .map(|id| access_key(id, "NFe"));
        let emit = inf.and_then(|n| child(n, ns, "emit"));

        RecordBuilder::new(DocumentKind::Nfce, &TABLE)
            .text("chave_nfe", key)
            .text("cnpj", emit.and_then(|n| text_at(n, ns, &["CNPJ"])))
            .text("razao_social", emit.and_then(|n| text_at(n, ns, &["xNome"])))
            .timestamp_with(
                "data_emissao",
                inf.and_then(|n| text_at(n, ns, &["ide", "dhEmi"])),
                parse_iso8601,
            )
            .decimal(
                "valor_total",
                inf.and_then(|n| text_at(n, ns, &["total", "ICMSTot", "vNF"])),
            )
            .finish(source_file_name)
    }

    fn table(&self) -> &'static TableSchema {
        &TABLE
    }
}
