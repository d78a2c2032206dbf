//! Configuration for the stage loader
//!
//! Tunable constants live here next to the connection settings that are
//! handed to the pool constructors at startup.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use tiberius::{AuthMethod, EncryptionLevel};

// ============================================================================
// Connection Pool Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Pipeline Configuration
// ============================================================================

/// Timeout for a single extract or load step
///
/// Full-table reads of fact tables and the matching staging inserts are the
/// slowest statements this tool issues.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(600); // 10 minutes

/// Upper bound on bind parameters in a single multi-row INSERT
///
/// Postgres allows 65535 and bundled SQLite 32766.
pub const MAX_BIND_PARAMS: usize = 30_000;

/// Destination table holding one audit row per source table
pub const METADATA_TABLE: &str = "etl_metadata";

/// Prefix of the staging table a source table is copied into
pub const STAGING_PREFIX: &str = "stg_";

/// Tables copied when no explicit list is configured, in processing order
pub const DEFAULT_TABLES: [&str; 5] = [
    "DimProduct",
    "DimProductSubcategory",
    "DimProductCategory",
    "DimSalesTerritory",
    "FactInternetSales",
];

/// Name of the staging table for a source table
pub fn staging_table_name(table_name: &str) -> String {
    format!("{STAGING_PREFIX}{table_name}")
}

// ============================================================================
// Connection Settings
// ============================================================================

/// Database engine the tables are extracted from
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SourceKind {
    /// Microsoft SQL Server over TDS
    #[value(name = "sqlserver")]
    SqlServer,
    Postgres,
}

impl SourceKind {
    pub fn default_port(&self) -> u16 {
        match self {
            SourceKind::SqlServer => 1433,
            SourceKind::Postgres => 5432,
        }
    }
}

/// Where and how to connect to one database
#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    /// libpq-style ssl mode: disable, allow, prefer, require, verify-ca, verify-full
    pub ssl_mode: String,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("ssl_mode", &self.ssl_mode)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    fn parsed_ssl_mode(&self) -> Result<PgSslMode> {
        self.ssl_mode
            .parse()
            .with_context(|| format!("Invalid ssl mode '{}'", self.ssl_mode))
    }

    /// Build sqlx connect options from this config
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let ssl_mode = self.parsed_ssl_mode()?;

        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username)
            .password(&self.password)
            .ssl_mode(ssl_mode))
    }

    /// Build a tiberius config for SQL Server from this config
    ///
    /// The ssl mode maps onto TDS encryption: `disable` turns TLS off,
    /// `require` and the `verify-*` modes demand it, the rest encrypt the
    /// login only. Certificates are checked only by the `verify-*` modes.
    pub fn tiberius_config(&self) -> Result<tiberius::Config> {
        let ssl_mode = self.parsed_ssl_mode()?;

        let mut config = tiberius::Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(&self.database);
        config.authentication(AuthMethod::sql_server(&self.username, &self.password));
        config.encryption(match ssl_mode {
            PgSslMode::Disable => EncryptionLevel::NotSupported,
            PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => {
                EncryptionLevel::Required
            }
            _ => EncryptionLevel::Off,
        });
        if !matches!(ssl_mode, PgSslMode::VerifyCa | PgSslMode::VerifyFull) {
            config.trust_cert();
        }

        Ok(config)
    }

    /// `host:port/database`, safe to log
    pub fn display_target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}
