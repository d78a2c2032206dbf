//! SQL Server source: bb8 pool of tiberius clients and the `ColumnData`
//! decoding that turns result rows into snapshot values.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use std::time::Duration;
use tiberius::{Client, ColumnData, FromSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::config::{CONNECT_TIMEOUT, PING_TIMEOUT};
use crate::pipeline::connector::Source;
use crate::pipeline::error::{ExtractError, SourceError};
use crate::snapshot::{Row, Snapshot, Value};

type TdsClient = Client<Compat<TcpStream>>;

/// Source database reached over TDS
#[derive(Clone)]
pub struct SqlServerSource {
    pool: bb8::Pool<TiberiusManager>,
}

/// Build a SQL Server connection pool
///
/// Nothing connects until the first table is read.
pub async fn pool(config: tiberius::Config, max_pool_size: u32) -> Result<SqlServerSource> {
    tracing::debug!(addr = %config.get_addr(), "building SQL Server connection pool");

    let pool = bb8::Builder::new()
        .min_idle(0)
        .max_size(max_pool_size)
        .connection_timeout(CONNECT_TIMEOUT)
        .retry_connection(false)
        .max_lifetime(Duration::from_secs(60 * 55))
        .build(TiberiusManager::new(config))
        .await
        .context("Failed to create SQL Server connection pool")?;

    Ok(SqlServerSource { pool })
}

#[async_trait]
impl Source for SqlServerSource {
    async fn read_table(&self, table_name: &str) -> Result<Snapshot, ExtractError> {
        let sql = format!("SELECT * FROM {}", quote_bracketed(table_name));

        let mut conn = self.pool.get().await.map_err(|e| ExtractError::Connection {
            table: table_name.to_string(),
            source: match e {
                bb8::RunError::User(e) => SourceError::SqlServer(e),
                bb8::RunError::TimedOut => SourceError::PoolTimedOut,
            },
        })?;

        read_snapshot(&mut conn, &sql)
            .await
            .map_err(|e| ExtractError::Query {
                table: table_name.to_string(),
                source: e.into(),
            })
    }
}

async fn read_snapshot(
    client: &mut TdsClient,
    sql: &str,
) -> Result<Snapshot, tiberius::error::Error> {
    let rows = client.simple_query(sql).await?.into_first_result().await?;

    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let mut snapshot = Snapshot::new(columns);
    for row in rows {
        let values = row
            .into_iter()
            .map(|data| column_value(&data))
            .collect::<Result<Row, _>>()?;
        snapshot
            .push_row(values)
            .map_err(|e| tiberius::error::Error::Conversion(e.to_string().into()))?;
    }
    Ok(snapshot)
}

/// Convert one TDS column value into a snapshot value
///
/// DECIMAL and MONEY keep their exact digits as text. DATETIMEOFFSET is
/// normalized to UTC; TIME, UNIQUEIDENTIFIER and XML become text and
/// VARBINARY becomes lowercase hex.
fn column_value(data: &ColumnData<'static>) -> Result<Value, tiberius::error::Error> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| Value::Int(i64::from(v))),
        ColumnData::I16(v) => v.map(|v| Value::Int(i64::from(v))),
        ColumnData::I32(v) => v.map(|v| Value::Int(i64::from(v))),
        ColumnData::I64(v) => v.map(Value::Int),
        ColumnData::F32(v) => v.map(|v| Value::Float(f64::from(v))),
        ColumnData::F64(v) => v.map(Value::Float),
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| Value::Text(s.to_string())),
        ColumnData::Numeric(v) => v.as_ref().map(|n| Value::Decimal(n.to_string())),
        ColumnData::Guid(v) => v.as_ref().map(|g| Value::Text(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|bytes| {
            Value::Text(bytes.iter().map(|b| format!("{b:02x}")).collect())
        }),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|xml| Value::Text((**xml).clone().into_string())),
        ColumnData::Date(_) => NaiveDate::from_sql(data)?.map(Value::Date),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(Value::Timestamp)
        }
        ColumnData::DateTimeOffset(_) => {
            DateTime::<FixedOffset>::from_sql(data)?.map(|dt| Value::Timestamp(dt.naive_utc()))
        }
        ColumnData::Time(_) => NaiveTime::from_sql(data)?.map(|t| Value::Text(t.to_string())),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Quote a possibly schema-qualified name with SQL Server brackets (`[dbo].[DimProduct]`)
fn quote_bracketed(name: &str) -> String {
    name.split('.')
        .map(|part| format!("[{}]", part.replace(']', "]]")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Adapter between bb8 and a tiberius client over a tokio TCP stream
pub struct TiberiusManager {
    config: tiberius::Config,
}

impl TiberiusManager {
    pub fn new(config: tiberius::Config) -> Self {
        Self { config }
    }

    async fn open(&self) -> Result<TdsClient, tiberius::error::Error> {
        let mut config = self.config.clone();
        loop {
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true)?;

            match Client::connect(config.clone(), tcp.compat_write()).await {
                // Azure SQL may hand the login over to another node
                Err(tiberius::error::Error::Routing { host, port }) => {
                    tracing::debug!(%host, port, "following SQL Server redirect");
                    config.host(&host);
                    config.port(port);
                }
                result => return result,
            }
        }
    }
}

impl bb8::ManageConnection for TiberiusManager {
    type Connection = TdsClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        match tokio::time::timeout(CONNECT_TIMEOUT, self.open()).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "SQL Server connect timed out",
            )
            .into()),
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        let ping = async {
            conn.simple_query("SELECT 1").await?.into_row().await?;
            Ok::<(), tiberius::error::Error>(())
        };
        match tokio::time::timeout(PING_TIMEOUT, ping).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "SQL Server ping timed out",
            )
            .into()),
        }
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
