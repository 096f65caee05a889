use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::kind::DocumentKind;

/// Column holding the name of the file a row came from.
pub const SOURCE_FILE_COLUMN: &str = "arquivo_origem";
/// Column holding the moment the row was extracted.
pub const PROCESSED_AT_COLUMN: &str = "data_processamento";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Decimal,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub column_type: ColumnType,
    /// Maximum length for text columns, used in DDL.
    pub max_len: u16,
    pub indexed: bool,
}

impl ColumnDef {
    #[must_use]
    pub const fn text(name: &'static str, max_len: u16) -> Self {
        Self {
            name,
            column_type: ColumnType::Text,
            max_len,
            indexed: false,
        }
    }

    #[must_use]
    pub const fn decimal(name: &'static str) -> Self {
        Self {
            name,
            column_type: ColumnType::Decimal,
            max_len: 0,
            indexed: false,
        }
    }

    #[must_use]
    pub const fn timestamp(name: &'static str) -> Self {
        Self {
            name,
            column_type: ColumnType::Timestamp,
            max_len: 0,
            indexed: false,
        }
    }

    #[must_use]
    pub const fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
}

/// Destination table of one document kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
}

impl TableSchema {
    pub fn indexed_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.indexed)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Decimal(Decimal),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    #[must_use]
    pub fn default_for(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Text => Self::Text(String::new()),
            ColumnType::Decimal => Self::Decimal(Decimal::ZERO),
            ColumnType::Timestamp => Self::Timestamp(min_timestamp()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub const fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

/// Flat row extracted from one document. Holds a value for every column of
/// its kind's table, in column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub kind: DocumentKind,
    fields: Vec<(String, FieldValue)>,
    /// Columns that were absent or unparseable in the source and hold defaults.
    pub defaulted: Vec<String>,
}

impl ExtractedRecord {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn text(&self, name: &str) -> &str {
        self.get(name).and_then(FieldValue::as_text).unwrap_or_default()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn is_partial(&self) -> bool {
        !self.defaulted.is_empty()
    }
}

/// Builds an [`ExtractedRecord`] against a table schema. Fields never set
/// fall back to the column type's default when the record is finished.
pub struct RecordBuilder {
    kind: DocumentKind,
    schema: &'static TableSchema,
    values: Vec<Option<FieldValue>>,
    defaulted: Vec<String>,
}

impl RecordBuilder {
    #[must_use]
    pub fn new(kind: DocumentKind, schema: &'static TableSchema) -> Self {
        Self {
            kind,
            schema,
            values: vec![None; schema.columns.len()],
            defaulted: Vec::new(),
        }
    }

    fn slot(&self, name: &str) -> Option<usize> {
        self.schema.columns.iter().position(|c| c.name == name)
    }

    fn put(&mut self, name: &str, value: FieldValue) {
        if let Some(i) = self.slot(name) {
            self.values[i] = Some(value);
        } else {
            tracing::debug!(column = name, table = self.schema.name, "Ignoring undeclared column");
        }
    }

    fn mark_defaulted(&mut self, name: &str) {
        if !self.defaulted.iter().any(|n| n == name) {
            self.defaulted.push(name.to_string());
        }
    }

    #[must_use]
    pub fn text(mut self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.put(name, FieldValue::Text(v.trim().to_string())),
            None => self.mark_defaulted(name),
        }
        self
    }

    #[must_use]
    pub fn decimal(mut self, name: &str, raw: Option<&str>) -> Self {
        match raw.and_then(parse_decimal) {
            Some(v) => self.put(name, FieldValue::Decimal(v)),
            None => self.mark_defaulted(name),
        }
        self
    }

    /// Timestamp parsed with a kind-specific parser; failure keeps the minimum date.
    #[must_use]
    pub fn timestamp_with(
        mut self,
        name: &str,
        raw: Option<&str>,
        parse: impl Fn(&str) -> Option<NaiveDateTime>,
    ) -> Self {
        match raw.and_then(|r| parse(r.trim())) {
            Some(v) => self.put(name, FieldValue::Timestamp(v)),
            None => self.mark_defaulted(name),
        }
        self
    }

    #[must_use]
    pub fn timestamp(mut self, name: &str, value: NaiveDateTime) -> Self {
        self.put(name, FieldValue::Timestamp(value));
        self
    }

    /// Stamps source file name and processing time, fills defaults.
    pub fn finish(mut self, source_file_name: &str) -> ExtractedRecord {
        self.put(SOURCE_FILE_COLUMN, FieldValue::Text(source_file_name.to_string()));
        self.put(PROCESSED_AT_COLUMN, FieldValue::Timestamp(Local::now().naive_local()));

        let fields = self
            .schema
            .columns
            .iter()
            .zip(self.values)
            .map(|(col, value)| {
                let value = value.unwrap_or_else(|| FieldValue::default_for(col.column_type));
                (col.name.to_string(), value)
            })
            .collect();

        ExtractedRecord {
            kind: self.kind,
            fields,
            defaulted: self.defaulted,
        }
    }
}

/// `0001-01-01 00:00:00`, the value stored for dates that are missing or unreadable.
#[must_use]
pub fn min_timestamp() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN)
}

/// Amounts in fiscal XML always use `.` as separator.
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw.trim()).ok()
}

/// ISO-8601 timestamp; keeps the wall-clock time written in the document.
pub fn parse_iso8601(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Compact `yyyyMMdd HHmmss` timestamp.
pub fn parse_compact(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y%m%d %H%M%S").ok()
}
