use crate::document::{child, text_at, RawDocument};
use crate::record::{
    parse_compact, ColumnDef, ExtractedRecord, RecordBuilder, TableSchema, PROCESSED_AT_COLUMN,
    SOURCE_FILE_COLUMN,
};

use super::{access_key, DocumentKind, KindHandler};

static COLUMNS: [ColumnDef; 7] = [
    ColumnDef::text("chave_cfe", 100).indexed(),
    ColumnDef::text("cnpj", 20).indexed(),
    ColumnDef::text("razao_social", 255),
    ColumnDef::timestamp("data_emissao").indexed(),
    ColumnDef::decimal("valor_total"),
    ColumnDef::text(SOURCE_FILE_COLUMN, 255),
    ColumnDef::timestamp(PROCESSED_AT_COLUMN),
];

pub static TABLE: TableSchema = TableSchema {
    name: "sat_cfe_documents",
    columns: &COLUMNS,
};

/// SAT CF-e coupons. Unqualified element names throughout.
pub struct SatCfeHandler;

impl KindHandler for SatCfeHandler {
    fn kind(&self) -> DocumentKind {
        DocumentKind::SatCfe
    }

    fn matches(&self, doc: &RawDocument<'_>) -> bool {
        doc.root_name() == "CFe" && doc.root_has_child("infCFe")
    }

    fn extract(&self, doc: &RawDocument<'_>, source_file_name: &str) -> ExtractedRecord {
        let inf = child(doc.root(), None, "infCFe");

        let key = inf
            .and_then(|n| n.attribute("Id"))
            .map(|id| access_key(id, "CFe"));
        let emit = inf.and_then(|n| child(n, None, "emit"));

        // dEmi and hEmi are stored apart; the timestamp needs both.
        let issued = inf.and_then(|n| {
            let date = text_at(n, None, &["ide", "dEmi"])?;
            let time = text_at(n, None, &["ide", "hEmi"])?;
            Some(format!("{} {}", date.trim(), time.trim()))
        });

        RecordBuilder::new(DocumentKind::SatCfe, &TABLE)
            .text("chave_cfe", key)
            .text("cnpj", emit.and_then(|n| text_at(n, None, &["CNPJ"])))
            .text("razao_social", emit.and_then(|n| text_at(n, None, &["xNome"])))
            .timestamp_with("data_emissao", issued.as_deref(), parse_compact)
            .decimal("valor_total", inf.and_then(|n| text_at(n, None, &["total", "vCFe"])))
            .finish(source_file_name)
    }

    fn table(&self) -> &'static TableSchema {
        &TABLE
    }
}
