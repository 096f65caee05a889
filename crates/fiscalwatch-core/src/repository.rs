use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::postgres::PgConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use thiserror::Error;

use crate::config::{StorageEngine, WatchConfig};
use crate::kind::{DocumentKind, KindRegistry};
use crate::record::{ColumnType, ExtractedRecord, FieldValue, TableSchema};

const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const SQLITE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage connection string is not configured")]
    NotConfigured,

    #[error("Failed to connect to {engine}: {source}")]
    Connection {
        engine: StorageEngine,
        #[source]
        source: sqlx::Error,
    },

    #[error("Statement failed on {table}: {source}")]
    Statement {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("No table registered for document kind {0}")]
    UnregisteredKind(DocumentKind),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence boundary for extracted records.
#[async_trait::async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Creates the kind's table and indexes when missing. Safe to call before every insert.
    async fn ensure_schema(&self, kind: DocumentKind) -> StorageResult<()>;

    /// Stores one record, returning the number of rows written.
    async fn insert(&self, kind: DocumentKind, record: &ExtractedRecord) -> StorageResult<u64>;
}

enum Conn {
    Sqlite(SqliteConnection),
    Postgres(PgConnection),
}

impl Conn {
    async fn close(self) {
        let result = match self {
            Self::Sqlite(c) => c.close().await,
            Self::Postgres(c) => c.close().await,
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "Error closing storage connection");
        }
    }
}

/// `sqlx`-backed repository. Opens one connection per call and closes it afterwards.
pub struct SqlRepository {
    engine: StorageEngine,
    connection_string: String,
    tables: HashMap<DocumentKind, &'static TableSchema>,
    ensured: Mutex<HashSet<DocumentKind>>,
    schema_lock: tokio::sync::Mutex<()>,
}

impl SqlRepository {
    pub fn new(
        engine: StorageEngine,
        connection_string: impl Into<String>,
        registry: &KindRegistry,
    ) -> Self {
        let tables = registry
            .kinds()
            .filter_map(|k| registry.table(k).map(|t| (k, t)))
            .collect();

        Self {
            engine,
            connection_string: connection_string.into(),
            tables,
            ensured: Mutex::new(HashSet::new()),
            schema_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(config: &WatchConfig, registry: &KindRegistry) -> Self {
        Self::new(config.database_type, config.connection_string.clone(), registry)
    }

    fn table(&self, kind: DocumentKind) -> StorageResult<&'static TableSchema> {
        self.tables
            .get(&kind)
            .copied()
            .ok_or(StorageError::UnregisteredKind(kind))
    }

    fn is_ensured(&self, kind: DocumentKind) -> bool {
        self.ensured
            .lock()
            .map(|set| set.contains(&kind))
            .unwrap_or(false)
    }

    fn mark_ensured(&self, kind: DocumentKind, ensured: bool) {
        if let Ok(mut set) = self.ensured.lock() {
            if ensured {
                set.insert(kind);
            } else {
                set.remove(&kind);
            }
        }
    }

    async fn connect(&self) -> StorageResult<Conn> {
        let raw = self.connection_string.trim();
        if raw.is_empty() {
            return Err(StorageError::NotConfigured);
        }

        let connection_error = |source| StorageError::Connection {
            engine: self.engine,
            source,
        };

        match self.engine {
            StorageEngine::Sqlite => {
                let options = if raw.starts_with("sqlite:") {
                    SqliteConnectOptions::from_str(raw).map_err(connection_error)?
                } else {
                    SqliteConnectOptions::new().filename(raw)
                };
                let conn = options
                    .create_if_missing(true)
                    .busy_timeout(SQLITE_BUSY_TIMEOUT)
                    .connect()
                    .await
                    .map_err(connection_error)?;
                Ok(Conn::Sqlite(conn))
            }
            StorageEngine::Postgres => {
                let conn = PgConnection::connect(raw).await.map_err(connection_error)?;
                Ok(Conn::Postgres(conn))
            }
        }
    }

    /// Opens and closes a connection, reporting whether storage is reachable.
    pub async fn test_connection(&self) -> StorageResult<()> {
        let conn = self.connect().await?;
        conn.close().await;
        tracing::info!(engine = %self.engine, "Storage connection test successful");
        Ok(())
    }

    /// Rows stored for `kind`. The table is created first when missing.
    pub async fn count(&self, kind: DocumentKind) -> StorageResult<i64> {
        let table = self.table(kind)?;
        self.ensure_schema(kind).await?;

        let sql = format!("SELECT COUNT(*) FROM {}", table.name);
        let mut conn = self.connect().await?;
        let result = match &mut conn {
            Conn::Sqlite(c) => sqlx::query_scalar::<_, i64>(&sql).fetch_one(&mut *c).await,
            Conn::Postgres(c) => sqlx::query_scalar::<_, i64>(&sql).fetch_one(&mut *c).await,
        };
        conn.close().await;

        result.map_err(|source| StorageError::Statement {
            table: table.name,
            source,
        })
    }

    async fn create_table(&self, conn: &mut Conn, table: &'static TableSchema) -> StorageResult<()> {
        let statement_error = |source| StorageError::Statement {
            table: table.name,
            source,
        };

        for sql in schema_statements(self.engine, table) {
            let result = match conn {
                Conn::Sqlite(c) => sqlx::query(&sql).execute(&mut *c).await.map(|_| ()),
                Conn::Postgres(c) => sqlx::query(&sql).execute(&mut *c).await.map(|_| ()),
            };
            result.map_err(statement_error)?;
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentRepository for SqlRepository {
    async fn ensure_schema(&self, kind: DocumentKind) -> StorageResult<()> {
        let table = self.table(kind)?;
        if self.is_ensured(kind) {
            return Ok(());
        }

        // Two first arrivals of the same kind must not race on DDL.
        let _guard = self.schema_lock.lock().await;
        if self.is_ensured(kind) {
            return Ok(());
        }

        let mut conn = self.connect().await?;
        let result = self.create_table(&mut conn, table).await;
        conn.close().await;
        result?;

        self.mark_ensured(kind, true);
        tracing::debug!(table = table.name, "Table schema ensured");
        Ok(())
    }

    async fn insert(&self, kind: DocumentKind, record: &ExtractedRecord) -> StorageResult<u64> {
        let table = self.table(kind)?;
        if self.connection_string.trim().is_empty() {
            return Err(StorageError::NotConfigured);
        }

        self.ensure_schema(kind).await?;

        let sql = insert_statement(self.engine, table);
        let mut conn = self.connect().await?;

        let result = match &mut conn {
            Conn::Sqlite(c) => {
                let mut query = sqlx::query::<sqlx::Sqlite>(&sql);
                for (_, value) in record.fields() {
                    query = match value {
                        FieldValue::Text(s) => query.bind(s.clone()),
                        FieldValue::Decimal(d) => query.bind(stored_amount(*d).to_string()),
                        FieldValue::Timestamp(t) => {
                            query.bind(t.format(SQLITE_TIMESTAMP_FORMAT).to_string())
                        }
                    };
                }
                query.execute(&mut *c).await.map(|r| r.rows_affected())
            }
            Conn::Postgres(c) => {
                let mut query = sqlx::query::<sqlx::Postgres>(&sql);
                for (_, value) in record.fields() {
                    query = match value {
                        FieldValue::Text(s) => query.bind(s.clone()),
                        FieldValue::Decimal(d) => query.bind(stored_amount(*d)),
                        FieldValue::Timestamp(t) => query.bind(*t),
                    };
                }
                query.execute(&mut *c).await.map(|r| r.rows_affected())
            }
        };
        conn.close().await;

        match result {
            Ok(rows) => {
                tracing::info!(table = table.name, rows, "Document inserted");
                Ok(rows)
            }
            Err(source) => {
                // The table may have been dropped behind our back; re-check next time.
                self.mark_ensured(kind, false);
                Err(StorageError::Statement {
                    table: table.name,
                    source,
                })
            }
        }
    }
}

/// Two places, half away from zero, as `NUMERIC(18,2)` rounds.
fn stored_amount(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn column_sql_type(engine: StorageEngine, column_type: ColumnType, max_len: u16) -> String {
    match (engine, column_type) {
        (StorageEngine::Sqlite, _) => "TEXT".to_string(),
        (StorageEngine::Postgres, ColumnType::Text) => format!("VARCHAR({max_len})"),
        (StorageEngine::Postgres, ColumnType::Decimal) => "NUMERIC(18,2)".to_string(),
        (StorageEngine::Postgres, ColumnType::Timestamp) => "TIMESTAMP".to_string(),
    }
}

/// `CREATE ... IF NOT EXISTS` statements for the table and its lookup indexes.
pub fn schema_statements(engine: StorageEngine, table: &TableSchema) -> Vec<String> {
    let id_column = match engine {
        StorageEngine::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        StorageEngine::Postgres => "id BIGSERIAL PRIMARY KEY",
    };

    let columns: Vec<String> = std::iter::once(id_column.to_string())
        .chain(table.columns.iter().map(|c| {
            format!(
                "{} {} NOT NULL",
                c.name,
                column_sql_type(engine, c.column_type, c.max_len)
            )
        }))
        .collect();

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table.name,
        columns.join(", ")
    )];

    statements.extend(table.indexed_columns().map(|c| {
        format!(
            "CREATE INDEX IF NOT EXISTS ix_{table}_{column} ON {table} ({column})",
            table = table.name,
            column = c.name
        )
    }));

    statements
}

/// Parameterized insert covering every column of the table.
pub fn insert_statement(engine: StorageEngine, table: &TableSchema) -> String {
    let names: Vec<&str> = table.column_names().collect();
    let placeholders: Vec<String> = (1..=names.len())
        .map(|i| match engine {
            StorageEngine::Sqlite => "?".to_string(),
            StorageEngine::Postgres => format!("${i}"),
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name,
        names.join(", "),
        placeholders.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::document::RawDocument;
    use crate::kind::{KindHandler, NfceHandler, SatCfeHandler};

    fn sqlite_repo(dir: &TempDir) -> SqlRepository {
        let db = dir.path().join("fiscal.db");
        SqlRepository::new(
            StorageEngine::Sqlite,
            db.to_string_lossy(),
            &KindRegistry::default(),
        )
    }

    fn sat_record(key: &str, amount: &str) -> ExtractedRecord {
        let xml = format!(
            r#"<CFe><infCFe Id="CFe{key}"><emit><xNome>Loja d'Ávila; DROP TABLE x;--</xNome></emit><total><vCFe>{amount}</vCFe></total></infCFe></CFe>"#
        );
        let path = Path::new("cupom.xml");
        let doc = RawDocument::parse(&xml, path).unwrap();
        SatCfeHandler.extract(&doc, "cupom.xml")
    }

    #[test]
    fn test_schema_statements_sqlite() {
        let stmts = schema_statements(StorageEngine::Sqlite, NfceHandler.table());

        assert_eq!(stmts.len(), 4);
        assert!(stmts[0].starts_with("CREATE TABLE IF NOT EXISTS nfce_documents"));
        assert!(stmts[0].contains("chave_nfe TEXT NOT NULL"));
        assert!(stmts[1].contains("ix_nfce_documents_chave_nfe"));
        assert!(stmts[2].contains("ix_nfce_documents_cnpj"));
        assert!(stmts[3].contains("ix_nfce_documents_data_emissao"));
    }

    #[test]
    fn test_schema_statements_postgres() {
        let stmts = schema_statements(StorageEngine::Postgres, SatCfeHandler.table());

        assert!(stmts[0].contains("id BIGSERIAL PRIMARY KEY"));
        assert!(stmts[0].contains("valor_total NUMERIC(18,2) NOT NULL"));
        assert!(stmts[0].contains("cnpj VARCHAR(20) NOT NULL"));
        assert!(stmts[0].contains("data_emissao TIMESTAMP NOT NULL"));
    }

    #[test]
    fn test_insert_statement_placeholders() {
        let sqlite = insert_statement(StorageEngine::Sqlite, NfceHandler.table());
        assert!(sqlite.ends_with("VALUES (?, ?, ?, ?, ?, ?, ?)"));

        let pg = insert_statement(StorageEngine::Postgres, NfceHandler.table());
        assert!(pg.ends_with("VALUES ($1, $2, $3, $4, $5, $6, $7)"));
    }

    #[tokio::test]
    async fn test_not_configured_fails_fast() {
        let repo = SqlRepository::new(StorageEngine::Postgres, "  ", &KindRegistry::default());
        let record = sat_record("1", "1.00");

        assert!(matches!(
            repo.insert(DocumentKind::SatCfe, &record).await,
            Err(StorageError::NotConfigured)
        ));
        assert!(matches!(
            repo.ensure_schema(DocumentKind::SatCfe).await,
            Err(StorageError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind_has_no_table() {
        let dir = TempDir::new().unwrap();
        let repo = sqlite_repo(&dir);

        assert!(matches!(
            repo.ensure_schema(DocumentKind::Unknown).await,
            Err(StorageError::UnregisteredKind(DocumentKind::Unknown))
        ));
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let repo = sqlite_repo(&dir);

        repo.ensure_schema(DocumentKind::Nfce).await.unwrap();
        repo.ensure_schema(DocumentKind::Nfce).await.unwrap();

        // A fresh repository has an empty cache and meets an existing table.
        let again = sqlite_repo(&dir);
        again.ensure_schema(DocumentKind::Nfce).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_round_trip() {
        let dir = TempDir::new().unwrap();
        let repo = sqlite_repo(&dir);
        let record = sat_record("3524", "99.90");

        let rows = repo.insert(DocumentKind::SatCfe, &record).await.unwrap();
        assert_eq!(rows, 1);

        let mut conn = SqliteConnection::connect(&format!(
            "sqlite:{}",
            dir.path().join("fiscal.db").display()
        ))
        .await
        .unwrap();
        let (key, name, total): (String, String, String) = sqlx::query_as(
            "SELECT chave_cfe, razao_social, valor_total FROM sat_cfe_documents",
        )
        .fetch_one(&mut conn)
        .await
        .unwrap();

        assert_eq!(key, "3524");
        assert_eq!(name, "Loja d'Ávila; DROP TABLE x;--");
        assert_eq!(Decimal::from_str(&total).unwrap(), Decimal::new(9990, 2));
    }

    #[tokio::test]
    async fn test_insert_recreates_dropped_table() {
        let dir = TempDir::new().unwrap();
        let repo = sqlite_repo(&dir);
        repo.insert(DocumentKind::SatCfe, &sat_record("1", "1"))
            .await
            .unwrap();

        let mut conn = SqliteConnection::connect(&format!(
            "sqlite:{}",
            dir.path().join("fiscal.db").display()
        ))
        .await
        .unwrap();
        sqlx::query("DROP TABLE sat_cfe_documents")
            .execute(&mut conn)
            .await
            .unwrap();
        conn.close().await.unwrap();

        let first = repo.insert(DocumentKind::SatCfe, &sat_record("2", "2")).await;
        assert!(matches!(first, Err(StorageError::Statement { .. })));

        let second = repo.insert(DocumentKind::SatCfe, &sat_record("3", "3")).await;
        assert_eq!(second.unwrap(), 1);
    }

    #[test]
    fn test_amount_rounds_half_away_from_zero() {
        assert_eq!(stored_amount(Decimal::new(12345, 3)), Decimal::new(1235, 2));
        assert_eq!(stored_amount(Decimal::new(12335, 3)), Decimal::new(1234, 2));
        assert_eq!(stored_amount(Decimal::new(-5, 3)), Decimal::new(-1, 2));
        assert_eq!(stored_amount(Decimal::new(1250, 2)), Decimal::new(1250, 2));
    }

    #[tokio::test]
    async fn test_sqlite_amount_keeps_two_places() {
        let dir = TempDir::new().unwrap();
        let repo = sqlite_repo(&dir);
        repo.insert(DocumentKind::SatCfe, &sat_record("1", "12.345"))
            .await
            .unwrap();

        let mut conn = SqliteConnection::connect(&format!(
            "sqlite:{}",
            dir.path().join("fiscal.db").display()
        ))
        .await
        .unwrap();
        let total: String = sqlx::query_scalar("SELECT valor_total FROM sat_cfe_documents")
            .fetch_one(&mut conn)
            .await
            .unwrap();

        assert_eq!(total, "12.35");
    }

    #[tokio::test]
    async fn test_count_per_kind() {
        let dir = TempDir::new().unwrap();
        let repo = sqlite_repo(&dir);

        assert_eq!(repo.count(DocumentKind::SatCfe).await.unwrap(), 0);
        repo.insert(DocumentKind::SatCfe, &sat_record("1", "1"))
            .await
            .unwrap();
        repo.insert(DocumentKind::SatCfe, &sat_record("1", "1"))
            .await
            .unwrap();

        assert_eq!(repo.count(DocumentKind::SatCfe).await.unwrap(), 2);
        assert_eq!(repo.count(DocumentKind::Nfce).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connection_check() {
        let dir = TempDir::new().unwrap();
        sqlite_repo(&dir).test_connection().await.unwrap();

        let unconfigured = SqlRepository::new(StorageEngine::Sqlite, "", &KindRegistry::default());
        assert!(matches!(
            unconfigured.test_connection().await,
            Err(StorageError::NotConfigured)
        ));
    }
}
