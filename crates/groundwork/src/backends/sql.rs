//! Relational Backend Implementation
//!
//! Runs on the sqlx `Any` driver so one implementation serves PostgreSQL,
//! MySQL and SQLite; the dialect is picked from the connection URL and only
//! changes how templated queries are rendered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::tokenizer::{Location, Token, TokenWithLocation, Tokenizer};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyQueryResult, AnyRow};
use sqlx::{Any, AnyPool, Column, Row, Transaction};
use tracing::{debug, warn};

use super::StateTables;
use crate::driver::{Capabilities, Driver, DriverKind, Handle, LockAttempt, LockRecord, StoredRecord};
use crate::error::{DriverError, DriverResult};
use crate::migrations::definitions::MigrationRecord;
use crate::sql::{Ident, SqlDialect, SqlQuery, SqlValue};
use crate::sql;

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct SqlDriverOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub tables: StateTables,
}

impl Default for SqlDriverOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            tables: StateTables::default(),
        }
    }
}

/// Result of a write statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

impl From<AnyQueryResult> for ExecResult {
    fn from(result: AnyQueryResult) -> Self {
        Self {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        }
    }
}

/// Relational driver over a sqlx connection pool
#[derive(Clone)]
pub struct SqlDriver {
    pool: AnyPool,
    dialect: SqlDialect,
    tables: Arc<StateTables>,
}

impl std::fmt::Debug for SqlDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlDriver")
            .field("dialect", &self.dialect)
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

impl SqlDriver {
    /// Connect with default pool options
    pub async fn connect(url: &str) -> DriverResult<Self> {
        Self::connect_with(url, SqlDriverOptions::default()).await
    }

    pub async fn connect_with(url: &str, options: SqlDriverOptions) -> DriverResult<Self> {
        let dialect = SqlDialect::from_url(url).ok_or_else(|| {
            DriverError::Connection(format!("Unsupported database URL scheme: {}", redact(url)))
        })?;
        options.tables.validate()?;

        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| DriverError::Connection(format!("Failed to connect to {}: {}", redact(url), e)))?;

        debug!("Connected to {} database", dialect);

        Ok(Self {
            pool,
            dialect,
            tables: Arc::new(options.tables),
        })
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn tables(&self) -> &StateTables {
        &self.tables
    }

    fn new_handle(&self, executor: Executor) -> SqlHandle {
        SqlHandle {
            executor,
            dialect: self.dialect,
            tables: Arc::clone(&self.tables),
        }
    }
}

#[async_trait]
impl Driver for SqlDriver {
    type Handle = SqlHandle;

    const SCRIPT_EXTENSION: &'static str = "sql";

    fn kind(&self) -> DriverKind {
        DriverKind::Sql
    }

    fn capabilities(&self) -> Capabilities {
        capabilities_for(self.dialect)
    }

    async fn prepare(&self) -> DriverResult<()> {
        let migrations = self.dialect.quote_identifier(&self.tables.migrations);
        let lock = self.dialect.quote_identifier(&self.tables.lock);

        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id VARCHAR(255) PRIMARY KEY, applied_at VARCHAR(64) NOT NULL)",
                migrations
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY, locked INTEGER NOT NULL DEFAULT 0, holder VARCHAR(255), acquired_at VARCHAR(64))",
                lock
            ),
            self.dialect
                .insert_ignore(&lock, "(id, locked) VALUES (1, 0)"),
        ];

        let mut handle = self.handle().await?;
        for statement in &statements {
            handle.execute_statement(statement).await?;
        }
        Ok(())
    }

    async fn handle(&self) -> DriverResult<SqlHandle> {
        Ok(self.new_handle(Executor::Pool(self.pool.clone())))
    }

    async fn begin(&self) -> DriverResult<SqlHandle> {
        let tx = self.pool.begin().await?;
        debug!("Beginning transaction");
        Ok(self.new_handle(Executor::Tx(tx)))
    }

    async fn commit(&self, handle: SqlHandle) -> DriverResult<()> {
        match handle.executor {
            Executor::Tx(tx) => tx
                .commit()
                .await
                .map_err(|e| DriverError::TransactionAbort(format!("Failed to commit transaction: {}", e))),
            Executor::Pool(_) => Ok(()),
        }
    }

    async fn rollback(&self, handle: SqlHandle) -> DriverResult<()> {
        match handle.executor {
            Executor::Tx(tx) => {
                debug!("Rolling back transaction");
                tx.rollback()
                    .await
                    .map_err(|e| DriverError::TransactionAbort(format!("Failed to roll back transaction: {}", e)))
            }
            Executor::Pool(_) => Ok(()),
        }
    }

    async fn close(&self) -> DriverResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn capabilities_for(dialect: SqlDialect) -> Capabilities {
    Capabilities {
        supports_atomicity: dialect.transactional_ddl(),
    }
}

enum Executor {
    Pool(AnyPool),
    Tx(Transaction<'static, Any>),
}

/// Handle to a relational store, either autocommit or inside a transaction
pub struct SqlHandle {
    executor: Executor,
    dialect: SqlDialect,
    tables: Arc<StateTables>,
}

impl SqlHandle {
    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn is_transactional(&self) -> bool {
        matches!(self.executor, Executor::Tx(_))
    }

    /// Execute a write statement
    pub async fn exec(&mut self, query: &SqlQuery) -> DriverResult<ExecResult> {
        let text = self.render(query)?;
        debug!(sql = %text, params = query.params().len(), "exec");

        let bound = bind_params(sqlx::query(&text), query.params());
        let result = match &mut self.executor {
            Executor::Pool(pool) => bound.execute(&*pool).await?,
            Executor::Tx(tx) => bound.execute(&mut **tx).await?,
        };
        Ok(result.into())
    }

    /// Fetch all rows, each deserialized from a column-name → value object
    pub async fn query<T: DeserializeOwned>(&mut self, query: &SqlQuery) -> DriverResult<Vec<T>> {
        let rows = self.fetch_rows(query).await?;
        rows.iter()
            .map(|row| serde_json::from_value(row_to_json(row)).map_err(DriverError::from))
            .collect()
    }

    /// Fetch the first row, if any
    pub async fn query_one<T: DeserializeOwned>(&mut self, query: &SqlQuery) -> DriverResult<Option<T>> {
        Ok(self.query(query).await?.into_iter().next())
    }

    async fn fetch_rows(&mut self, query: &SqlQuery) -> DriverResult<Vec<AnyRow>> {
        let text = self.render(query)?;
        debug!(sql = %text, params = query.params().len(), "query");

        let bound = bind_params(sqlx::query(&text), query.params());
        let rows = match &mut self.executor {
            Executor::Pool(pool) => bound.fetch_all(&*pool).await?,
            Executor::Tx(tx) => bound.fetch_all(&mut **tx).await?,
        };
        Ok(rows)
    }

    fn render(&self, query: &SqlQuery) -> DriverResult<String> {
        if !query.is_validated() {
            return Err(DriverError::Query(
                "Refusing to execute a query that was not built from a template".to_string(),
            ));
        }
        Ok(query.render(self.dialect))
    }

    async fn execute_statement(&mut self, statement: &str) -> DriverResult<ExecResult> {
        debug!(sql = %statement, "exec_raw");
        let query = sqlx::query(statement);
        let result = match &mut self.executor {
            Executor::Pool(pool) => query.execute(&*pool).await?,
            Executor::Tx(tx) => query.execute(&mut **tx).await?,
        };
        Ok(result.into())
    }

    fn migrations_table(&self) -> Ident {
        Ident::new(self.tables.migrations.clone())
    }

    fn lock_table(&self) -> Ident {
        Ident::new(self.tables.lock.clone())
    }
}

#[derive(Deserialize)]
struct LockRow {
    locked: i64,
    holder: Option<String>,
    acquired_at: Option<String>,
}

#[async_trait]
impl Handle for SqlHandle {
    async fn exec_raw(&mut self, script: &str) -> DriverResult<()> {
        for statement in split_statements(script, self.dialect) {
            self.execute_statement(&statement).await?;
        }
        Ok(())
    }

    async fn applied_records(&mut self) -> DriverResult<Vec<StoredRecord>> {
        let query = sql!("SELECT id, applied_at FROM {} ORDER BY id", self.migrations_table())?;
        self.query(&query).await
    }

    async fn insert_record(&mut self, record: &MigrationRecord) -> DriverResult<()> {
        let query = sql!(
            "INSERT INTO {} (id, applied_at) VALUES ({}, {})",
            self.migrations_table(),
            record.id.as_str(),
            format_timestamp(&record.applied_at),
        )?;
        self.exec(&query).await?;
        Ok(())
    }

    async fn delete_record(&mut self, id: &str) -> DriverResult<bool> {
        let query = sql!("DELETE FROM {} WHERE id = {}", self.migrations_table(), id)?;
        Ok(self.exec(&query).await?.rows_affected > 0)
    }

    async fn try_lock(&mut self, holder: &str, at: DateTime<Utc>) -> DriverResult<LockAttempt> {
        let query = sql!(
            "UPDATE {} SET locked = 1, holder = {}, acquired_at = {} WHERE id = 1 AND locked = 0",
            self.lock_table(),
            holder,
            format_timestamp(&at),
        )?;

        if self.exec(&query).await?.rows_affected == 1 {
            Ok(LockAttempt::Acquired)
        } else {
            Ok(LockAttempt::Held(self.lock_state().await?))
        }
    }

    async fn unlock(&mut self, holder: &str) -> DriverResult<bool> {
        let query = sql!(
            "UPDATE {} SET locked = 0, holder = NULL, acquired_at = NULL WHERE id = 1 AND locked = 1 AND holder = {}",
            self.lock_table(),
            holder,
        )?;
        Ok(self.exec(&query).await?.rows_affected == 1)
    }

    async fn force_unlock(&mut self) -> DriverResult<()> {
        let query = sql!(
            "UPDATE {} SET locked = 0, holder = NULL, acquired_at = NULL WHERE id = 1",
            self.lock_table(),
        )?;
        self.exec(&query).await?;
        Ok(())
    }

    async fn lock_state(&mut self) -> DriverResult<LockRecord> {
        let query = sql!(
            "SELECT locked, holder, acquired_at FROM {} WHERE id = 1",
            self.lock_table()
        )?;

        let Some(row) = self.query_one::<LockRow>(&query).await? else {
            return Ok(LockRecord::default());
        };

        Ok(LockRecord {
            locked: row.locked != 0,
            holder: row.holder,
            acquired_at: row
                .acquired_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Strip credentials before a URL reaches a log line or error message
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("****"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Any, AnyArguments<'q>>,
    params: &[SqlValue],
) -> sqlx::query::Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::Bytes(b) => query.bind(b.clone()),
            // The Any driver has no native json/timestamp/uuid encoding
            SqlValue::Json(j) => query.bind(j.to_string()),
            SqlValue::Timestamp(dt) => query.bind(format_timestamp(dt)),
            SqlValue::Uuid(u) => query.bind(u.to_string()),
        };
    }
    query
}

fn row_to_json(row: &AnyRow) -> JsonValue {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        object.insert(column.name().to_string(), column_to_json(row, column.ordinal()));
    }
    JsonValue::Object(object)
}

fn column_to_json(row: &AnyRow, index: usize) -> JsonValue {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(JsonValue::from).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(index) {
        return value.map(JsonValue::from).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<i16>, _>(index) {
        return value.map(JsonValue::from).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(JsonValue::Bool).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map(JsonValue::String).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return value
            .map(|bytes| JsonValue::Array(bytes.into_iter().map(JsonValue::from).collect()))
            .unwrap_or(JsonValue::Null);
    }
    warn!("Column {} has a type that cannot be decoded; returning null", index);
    JsonValue::Null
}

fn tokenizer_dialect(dialect: SqlDialect) -> Box<dyn Dialect> {
    match dialect {
        SqlDialect::PostgreSQL => Box::new(PostgreSqlDialect {}),
        SqlDialect::MySQL => Box::new(MySqlDialect {}),
        SqlDialect::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Split a script into individual statements.
///
/// Semicolons inside string literals, quoted identifiers and comments do not
/// split. Chunks holding only whitespace or comments are dropped. Statements
/// are sliced from the original text, so literals keep their exact escaping.
pub fn split_statements(script: &str, dialect: SqlDialect) -> Vec<String> {
    let tokenizer_dialect = tokenizer_dialect(dialect);
    let tokens = match Tokenizer::new(tokenizer_dialect.as_ref(), script).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!("SQL tokenizing failed, using naive semicolon splitting: {}", e);
            return naive_split(script);
        }
    };

    let lines = LineOffsets::new(script);
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_content = false;

    for TokenWithLocation { token, location } in tokens {
        match token {
            Token::SemiColon => {
                let Some(end) = lines.byte_offset(script, location).filter(|&i| script[i..].starts_with(';')) else {
                    warn!("SQL token location out of step with the script, using naive semicolon splitting");
                    return naive_split(script);
                };
                if has_content {
                    statements.push(script[start..end].trim().to_string());
                }
                start = end + 1;
                has_content = false;
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => has_content = true,
        }
    }
    if has_content {
        statements.push(script[start..].trim().to_string());
    }

    statements
}

fn naive_split(script: &str) -> Vec<String> {
    script
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Byte offset of each line start, for turning tokenizer locations
/// (1-based line and character column) back into string indices
struct LineOffsets(Vec<usize>);

impl LineOffsets {
    fn new(script: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(script.match_indices('\n').map(|(i, _)| i + 1));
        Self(starts)
    }

    fn byte_offset(&self, script: &str, location: Location) -> Option<usize> {
        let line_start = *self.0.get(usize::try_from(location.line).ok()?.checked_sub(1)?)?;
        let column = usize::try_from(location.column).ok()?.checked_sub(1)?;
        script[line_start..]
            .char_indices()
            .nth(column)
            .map(|(i, _)| line_start + i)
    }
}
