//! Adapter between bb8 and the sqlx::Postgres driver, plus the source and
//! destination connectors built on it.
use anyhow::{Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, ConnectOptions, Connection, Row as _, TypeInfo};
use std::sync::Arc;
use std::time::Duration;

use super::schema::{Schema, SqlType, coerce, quote_ident, quote_qualified};
use crate::config::{CONNECT_TIMEOUT, MAX_BIND_PARAMS, METADATA_TABLE, PING_TIMEOUT};
use crate::pipeline::connector::{Destination, Source};
use crate::pipeline::error::{ExtractError, LoadError};
use crate::snapshot::{MetadataRecord, Row, Snapshot, Value};

pub type Bb8Connection<'a> = bb8::PooledConnection<'a, ConnectionManager>;

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

#[cfg(test)]
type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

/// Inner pool variants
#[derive(Debug, Clone)]
enum PoolInner {
    Postgres(bb8::Pool<ConnectionManager>),
    #[cfg(test)]
    Sqlite(sqlx::SqlitePool),
}

/// Connection that can be either Postgres or SQLite
pub enum PoolConnection {
    Postgres(Bb8Connection<'static>),
    #[cfg(test)]
    Sqlite(sqlx::pool::PoolConnection<sqlx::Sqlite>),
}

/// A source or destination database
#[derive(Debug, Clone)]
pub struct Pool {
    inner: PoolInner,
}

#[derive(Builder)]
pub struct PoolArgs {
    connect_options: PgConnectOptions,
    #[builder(default = "0")]
    min_idle: u32,
    #[builder(default = "4")]
    max_pool_size: u32,
}

pub async fn pool(args: PoolArgs) -> Result<Pool> {
    let PoolArgs {
        connect_options,
        min_idle,
        max_pool_size,
    } = args;

    tracing::debug!(
        host = connect_options.get_host(),
        database = connect_options.get_database(),
        "building connection pool"
    );

    let conn_manager = ConnectionManager::new(connect_options);

    // No connection retries inside the pool: an unreachable database is
    // reported on the first acquire.
    let bb8_pool = bb8::Builder::new()
        .min_idle(min_idle)
        .max_size(max_pool_size)
        .connection_timeout(CONNECT_TIMEOUT)
        .retry_connection(false)
        .max_lifetime(Duration::from_secs(60 * 55))
        .build(conn_manager)
        .await
        .context("Failed to create connection pool")?;

    Ok(Pool {
        inner: PoolInner::Postgres(bb8_pool),
    })
}

fn run_error(e: bb8::RunError<sqlx::Error>) -> sqlx::Error {
    match e {
        bb8::RunError::User(e) => e,
        bb8::RunError::TimedOut => sqlx::Error::PoolTimedOut,
    }
}

impl Pool {
    /// Create an in-memory SQLite pool for testing
    ///
    /// Limited to one connection: every connection to `sqlite::memory:` opens
    /// its own database.
    #[cfg(test)]
    pub async fn sqlite_in_memory() -> Result<Self, sqlx::Error> {
        let sqlite_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Pool {
            inner: PoolInner::Sqlite(sqlite_pool),
        })
    }

    pub async fn acquire(&self) -> Result<PoolConnection, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let conn = pool.get_owned().await.map_err(run_error)?;
                Ok(PoolConnection::Postgres(conn))
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                let conn = pool.acquire().await?;
                Ok(PoolConnection::Sqlite(conn))
            }
        }
    }

    /// Execute a statement (for DDL like CREATE TABLE) - works for both Postgres and SQLite
    pub async fn execute_query(&self, sql: &str) -> Result<(), sqlx::Error> {
        match self.acquire().await? {
            PoolConnection::Postgres(mut conn) => {
                sqlx::query(sql).execute(&mut *conn).await?;
            }
            #[cfg(test)]
            PoolConnection::Sqlite(mut conn) => {
                sqlx::query(sql).execute(&mut *conn).await?;
            }
        }
        Ok(())
    }

    /// Create the load metadata table if it does not exist yet
    pub async fn ensure_metadata_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  \"table_name\" TEXT PRIMARY KEY,\n  \"load_timestamp\" TIMESTAMP,\n  \"rows_imported\" BIGINT\n)",
            quote_ident(METADATA_TABLE)
        );
        self.execute_query(&ddl)
            .await
            .with_context(|| format!("Failed to create metadata table '{METADATA_TABLE}'"))
    }
}

#[async_trait]
impl Source for Pool {
    async fn read_table(&self, table_name: &str) -> Result<Snapshot, ExtractError> {
        let sql = format!("SELECT * FROM {}", quote_qualified(table_name));
        let query_error = |source: sqlx::Error| ExtractError::Query {
            table: table_name.to_string(),
            source: source.into(),
        };

        // The connection goes back to the pool when `conn` drops, on every path.
        let conn = self
            .acquire()
            .await
            .map_err(|source| ExtractError::Connection {
                table: table_name.to_string(),
                source: source.into(),
            })?;

        match conn {
            PoolConnection::Postgres(mut conn) => {
                // Simple-query protocol: every column arrives as text and is
                // decoded by its source type name.
                let pg_conn: &mut PgConnection = &mut conn;
                let rows = sqlx::Executor::fetch_all(pg_conn, sqlx::raw_sql(&sql))
                    .await
                    .map_err(query_error)?;
                rows_to_snapshot(&rows, pg_row_values).map_err(query_error)
            }
            #[cfg(test)]
            PoolConnection::Sqlite(mut conn) => {
                let rows = sqlx::query(&sql)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(query_error)?;
                rows_to_snapshot(&rows, sqlite_row_values).map_err(query_error)
            }
        }
    }
}

#[async_trait]
impl Destination for Pool {
    async fn replace_table(
        &self,
        staging_table: &str,
        snapshot: &Snapshot,
    ) -> Result<u64, LoadError> {
        let schema = Schema::infer(snapshot);
        let expected = snapshot.len() as u64;

        let conn = self.acquire().await.map_err(|source| LoadError::Connection {
            table: staging_table.to_string(),
            source,
        })?;

        let written = match conn {
            PoolConnection::Postgres(mut conn) => {
                let plan = staging_plan(staging_table, &schema, snapshot, Dialect::Postgres);
                replace_table_postgres(&mut conn, &plan, &schema, expected).await
            }
            #[cfg(test)]
            PoolConnection::Sqlite(mut conn) => {
                let plan = staging_plan(staging_table, &schema, snapshot, Dialect::Sqlite);
                replace_table_sqlite(&mut conn, &plan, &schema, expected).await
            }
        }
        .map_err(|source| LoadError::Staging {
            staging_table: staging_table.to_string(),
            source,
        })?;

        if written != expected {
            return Err(LoadError::RowCountMismatch {
                staging_table: staging_table.to_string(),
                expected,
                written,
            });
        }

        Ok(written)
    }

    async fn upsert_metadata(&self, record: &MetadataRecord) -> Result<(), LoadError> {
        let sql = upsert_metadata_statement();
        let metadata_error = |source| LoadError::Metadata {
            table: record.table_name.clone(),
            source,
        };

        let conn = self.acquire().await.map_err(|source| LoadError::Connection {
            table: record.table_name.clone(),
            source,
        })?;

        match conn {
            PoolConnection::Postgres(mut conn) => {
                sqlx::query(&sql)
                    .bind(&record.table_name)
                    .bind(record.load_timestamp)
                    .bind(record.rows_imported)
                    .execute(&mut *conn)
                    .await
                    .map_err(metadata_error)?;
            }
            #[cfg(test)]
            PoolConnection::Sqlite(mut conn) => {
                let sqlite_sql = convert_to_sqlite_placeholders(&sql);
                sqlx::query(&sqlite_sql)
                    .bind(&record.table_name)
                    .bind(record.load_timestamp)
                    .bind(record.rows_imported)
                    .execute(&mut *conn)
                    .await
                    .map_err(metadata_error)?;
            }
        }

        Ok(())
    }
}

/// Insert-or-update of one audit row keyed on `table_name`
fn upsert_metadata_statement() -> String {
    format!(
        "INSERT INTO {} (\"table_name\", \"load_timestamp\", \"rows_imported\") \
         VALUES ($1, $2, $3) \
         ON CONFLICT (\"table_name\") DO UPDATE SET \
         \"load_timestamp\" = EXCLUDED.\"load_timestamp\", \
         \"rows_imported\" = EXCLUDED.\"rows_imported\"",
        quote_ident(METADATA_TABLE)
    )
}

/// Number of rows per INSERT statement that stays under the bind limit
fn rows_per_statement(num_columns: usize) -> usize {
    (MAX_BIND_PARAMS / num_columns.max(1)).max(1)
}

/// Build a multi-row INSERT: INSERT INTO t (c1, c2) VALUES ($1, $2), ($3, $4), ...
///
/// Columns whose values are bound as text get an explicit CAST on Postgres.
fn insert_statement(
    staging_table: &str,
    schema: &Schema,
    row_count: usize,
    use_pg_cast: bool,
) -> String {
    if schema.columns.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES", quote_ident(staging_table));
    }

    let column_list: Vec<String> = schema.columns.iter().map(|c| quote_ident(&c.name)).collect();

    let mut value_groups = Vec::with_capacity(row_count);
    let mut param_idx = 1;

    for _ in 0..row_count {
        let placeholders: Vec<String> = schema
            .columns
            .iter()
            .map(|col| {
                let placeholder = format!("${}", param_idx);
                param_idx += 1;
                if use_pg_cast && col.sql_type.needs_text_cast() {
                    format!("CAST({} AS {})", placeholder, col.sql_type.to_postgres())
                } else {
                    placeholder
                }
            })
            .collect();
        value_groups.push(format!("({})", placeholders.join(", ")));
    }

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(staging_table),
        column_list.join(", "),
        value_groups.join(", ")
    )
}

/// SQL dialect a staging plan is rendered for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Postgres,
    #[cfg(test)]
    Sqlite,
}

/// Statements that rebuild a staging table, in execution order
struct StagingPlan<'a> {
    /// DROP TABLE IF EXISTS, then CREATE TABLE
    ddl: [String; 2],
    /// One multi-row INSERT per chunk, with the rows it binds
    inserts: Vec<(String, &'a [Row])>,
}

fn staging_plan<'a>(
    staging_table: &str,
    schema: &Schema,
    snapshot: &'a Snapshot,
    dialect: Dialect,
) -> StagingPlan<'a> {
    let ddl = [
        format!("DROP TABLE IF EXISTS {}", quote_ident(staging_table)),
        schema.create_table_ddl(staging_table),
    ];

    // DEFAULT VALUES inserts exactly one row
    let chunk_size = if schema.columns.is_empty() {
        1
    } else {
        rows_per_statement(schema.columns.len())
    };

    let inserts = snapshot
        .rows()
        .chunks(chunk_size)
        .map(|rows| {
            let sql = insert_statement(
                staging_table,
                schema,
                rows.len(),
                dialect == Dialect::Postgres,
            );
            let sql = match dialect {
                Dialect::Postgres => sql,
                #[cfg(test)]
                Dialect::Sqlite => convert_to_sqlite_placeholders(&sql),
            };
            (sql, rows)
        })
        .collect();

    StagingPlan { ddl, inserts }
}

/// Commit when every expected row was written, roll back otherwise.
/// Returns whether the transaction was committed.
async fn commit_if_complete<DB: sqlx::Database>(
    tx: sqlx::Transaction<'_, DB>,
    written: u64,
    expected: u64,
) -> Result<bool, sqlx::Error> {
    if written == expected {
        tx.commit().await?;
        Ok(true)
    } else {
        tx.rollback().await?;
        Ok(false)
    }
}

/// Run a staging plan in one transaction; returns the number of rows written
async fn replace_table_postgres(
    conn: &mut PgConnection,
    plan: &StagingPlan<'_>,
    schema: &Schema,
    expected: u64,
) -> Result<u64, sqlx::Error> {
    let mut tx = conn.begin().await?;

    for statement in &plan.ddl {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    let mut written = 0u64;
    for (sql, rows) in &plan.inserts {
        let mut query = sqlx::query(sql);
        for row in rows.iter() {
            for (value, col) in row.iter().zip(&schema.columns) {
                query = bind_postgres(query, coerce(value, col.sql_type), col.sql_type);
            }
        }
        written += query.execute(&mut *tx).await?.rows_affected();
    }

    commit_if_complete(tx, written, expected).await?;
    Ok(written)
}

#[cfg(test)]
async fn replace_table_sqlite(
    conn: &mut sqlx::SqliteConnection,
    plan: &StagingPlan<'_>,
    schema: &Schema,
    expected: u64,
) -> Result<u64, sqlx::Error> {
    let mut tx = conn.begin().await?;

    for statement in &plan.ddl {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    let mut written = 0u64;
    for (sql, rows) in &plan.inserts {
        let mut query = sqlx::query(sql);
        for row in rows.iter() {
            for (value, col) in row.iter().zip(&schema.columns) {
                query = bind_sqlite(query, coerce(value, col.sql_type));
            }
        }
        written += query.execute(&mut *tx).await?.rows_affected();
    }

    commit_if_complete(tx, written, expected).await?;
    Ok(written)
}

/// Bind a value already coerced to its column type
fn bind_postgres(query: PgQuery<'_>, value: Value, sql_type: SqlType) -> PgQuery<'_> {
    match value {
        Value::Null => bind_null_postgres(query, sql_type),
        Value::Bool(v) => query.bind(v),
        Value::Int(v) => query.bind(v),
        Value::Float(v) => query.bind(v),
        Value::Decimal(v) | Value::Text(v) => query.bind(v),
        Value::Date(v) => query.bind(v),
        Value::Timestamp(v) => query.bind(v),
    }
}

/// Bind NULL with the parameter type Postgres expects for the column
fn bind_null_postgres(query: PgQuery<'_>, sql_type: SqlType) -> PgQuery<'_> {
    match sql_type {
        SqlType::Boolean => query.bind(None::<bool>),
        SqlType::BigInt => query.bind(None::<i64>),
        SqlType::DoublePrecision => query.bind(None::<f64>),
        SqlType::Date => query.bind(None::<chrono::NaiveDate>),
        SqlType::Timestamp => query.bind(None::<chrono::NaiveDateTime>),
        // NUMERIC is bound as text behind a CAST
        SqlType::Numeric | SqlType::Text => query.bind(None::<String>),
    }
}

#[cfg(test)]
fn bind_sqlite(query: SqliteQuery<'_>, value: Value) -> SqliteQuery<'_> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(v),
        Value::Int(v) => query.bind(v),
        Value::Float(v) => query.bind(v),
        Value::Decimal(v) | Value::Text(v) => query.bind(v),
        Value::Date(v) => query.bind(v),
        Value::Timestamp(v) => query.bind(v),
    }
}

/// Convert Postgres-style placeholders ($1, $2, ...) to SQLite-style (?, ?, ...)
#[cfg(test)]
fn convert_to_sqlite_placeholders(sql: &str) -> String {
    let mut result = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            // Skip the dollar sign and any following digits
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                chars.next();
            }
            result.push('?');
        } else {
            result.push(ch);
        }
    }

    result
}

/// Collect decoded rows into a snapshot; column names come from the first row
fn rows_to_snapshot<R: sqlx::Row>(
    rows: &[R],
    decode: fn(&R) -> Result<Row, sqlx::Error>,
) -> Result<Snapshot, sqlx::Error> {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut snapshot = Snapshot::new(columns);
    for row in rows {
        snapshot
            .push_row(decode(row)?)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    }
    Ok(snapshot)
}

/// Decode a text-format Postgres row using each column's type name
fn pg_row_values(row: &PgRow) -> Result<Row, sqlx::Error> {
    row.columns()
        .iter()
        .map(|column| -> Result<Value, sqlx::Error> {
            let text: Option<String> = row.try_get_unchecked(column.ordinal())?;
            Ok(match text {
                None => Value::Null,
                Some(text) => Value::from_text(column.type_info().name(), &text),
            })
        })
        .collect()
}

/// Decode a SQLite row by each value's storage class, refined by the
/// declared column type for booleans and dates
#[cfg(test)]
fn sqlite_row_values(row: &sqlx::sqlite::SqliteRow) -> Result<Row, sqlx::Error> {
    use sqlx::ValueRef;

    row.columns()
        .iter()
        .map(|column| -> Result<Value, sqlx::Error> {
            let idx = column.ordinal();
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                return Ok(Value::Null);
            }
            let storage = raw.type_info().name().to_string();
            let declared = column.type_info().name();

            Ok(match storage.as_str() {
                "INTEGER" => {
                    let v: i64 = row.try_get_unchecked(idx)?;
                    if declared.eq_ignore_ascii_case("BOOLEAN") {
                        Value::Bool(v != 0)
                    } else {
                        Value::Int(v)
                    }
                }
                "REAL" => Value::Float(row.try_get_unchecked(idx)?),
                "BLOB" => {
                    let bytes: Vec<u8> = row.try_get_unchecked(idx)?;
                    Value::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => {
                    let text: String = row.try_get_unchecked(idx)?;
                    Value::from_text(declared, &text)
                }
            })
        })
        .collect()
}

/// bb8 manager opening plain sqlx Postgres connections
pub struct ConnectionManager {
    connect_options: Arc<PgConnectOptions>,
}

impl ConnectionManager {
    pub fn new(connect_options: PgConnectOptions) -> Self {
        Self {
            connect_options: Arc::new(connect_options),
        }
    }
}

impl bb8::ManageConnection for ConnectionManager {
    type Connection = PgConnection;
    type Error = sqlx::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        match tokio::time::timeout(CONNECT_TIMEOUT, self.connect_options.connect()).await {
            Ok(result) => result,
            Err(_) => Err(sqlx::Error::PoolTimedOut),
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        // A hung ping counts as a dead connection
        match tokio::time::timeout(PING_TIMEOUT, conn.ping()).await {
            Ok(result) => result,
            Err(_) => Err(sqlx::Error::PoolTimedOut),
        }
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        // No synchronous liveness check exists for PgConnection; is_valid covers it.
        false
    }
}
