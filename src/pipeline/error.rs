use std::time::Duration;

use thiserror::Error;

/// Driver error from whichever database engine the source runs on
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Postgres(#[from] sqlx::Error),

    #[error(transparent)]
    SqlServer(#[from] tiberius::error::Error),

    #[error("timed out waiting for a source connection")]
    PoolTimedOut,
}

/// Failure reading a table from the source database
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("could not connect to source while extracting '{table}'")]
    Connection {
        table: String,
        #[source]
        source: SourceError,
    },

    #[error("query against source table '{table}' failed")]
    Query {
        table: String,
        #[source]
        source: SourceError,
    },

    #[error("extracting '{table}' timed out after {timeout:?}")]
    Timeout { table: String, timeout: Duration },
}

/// Failure writing a snapshot or its audit record to the destination
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not connect to destination while loading '{table}'")]
    Connection {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("replacing staging table '{staging_table}' failed")]
    Staging {
        staging_table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("upserting load metadata for '{table}' failed")]
    Metadata {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("staging table '{staging_table}' received {written} rows, expected {expected}")]
    RowCountMismatch {
        staging_table: String,
        expected: u64,
        written: u64,
    },

    #[error("loading '{table}' timed out after {timeout:?}")]
    Timeout { table: String, timeout: Duration },
}

/// Root cause message of an error chain, for one-line log output
pub fn root_cause(err: &(dyn std::error::Error + 'static)) -> String {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

/// `err` followed by its root cause, or just `err` when it has no source
pub fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    match err.source() {
        Some(_) => format!("{}: {}", err, root_cause(err)),
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_table() {
        let err = ExtractError::Query {
            table: "DimProduct".to_string(),
            source: sqlx::Error::RowNotFound.into(),
        };
        assert!(err.to_string().contains("DimProduct"));

        let err = LoadError::RowCountMismatch {
            staging_table: "stg_DimProduct".to_string(),
            expected: 10,
            written: 7,
        };
        assert_eq!(
            err.to_string(),
            "staging table 'stg_DimProduct' received 7 rows, expected 10"
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = LoadError::Timeout {
            table: "FactInternetSales".to_string(),
            timeout: Duration::from_secs(600),
        };
        assert_eq!(
            err.to_string(),
            "loading 'FactInternetSales' timed out after 600s"
        );

        let err = ExtractError::Timeout {
            table: "DimProduct".to_string(),
            timeout: Duration::from_millis(50),
        };
        assert_eq!(err.to_string(), "extracting 'DimProduct' timed out after 50ms");
    }

    #[test]
    fn test_root_cause_walks_sources() {
        let err = LoadError::Metadata {
            table: "DimProduct".to_string(),
            source: sqlx::Error::PoolTimedOut,
        };
        assert_eq!(root_cause(&err), sqlx::Error::PoolTimedOut.to_string());
    }

    #[test]
    fn test_describe_appends_root_cause_only_when_present() {
        let err = LoadError::Timeout {
            table: "T".to_string(),
            timeout: Duration::from_secs(600),
        };
        assert_eq!(describe(&err), "loading 'T' timed out after 600s");

        let err = LoadError::RowCountMismatch {
            staging_table: "stg_T".to_string(),
            expected: 3,
            written: 2,
        };
        assert_eq!(describe(&err), "staging table 'stg_T' received 2 rows, expected 3");

        let err = ExtractError::Query {
            table: "T".to_string(),
            source: SourceError::PoolTimedOut,
        };
        assert_eq!(
            describe(&err),
            "query against source table 'T' failed: timed out waiting for a source connection"
        );
    }
}
