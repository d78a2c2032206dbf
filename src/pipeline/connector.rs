use async_trait::async_trait;

use super::error::{ExtractError, LoadError};
use crate::snapshot::{MetadataRecord, Snapshot};

/// A database the pipeline can read whole tables from
#[async_trait]
pub trait Source: Send + Sync {
    /// Read every row of `table_name` with an unfiltered `SELECT *`
    ///
    /// Implementations acquire a connection for the duration of the call and
    /// release it on every exit path.
    async fn read_table(&self, table_name: &str) -> Result<Snapshot, ExtractError>;
}

/// A database the pipeline writes staging tables and audit records to
#[async_trait]
pub trait Destination: Send + Sync {
    /// Drop `staging_table` if present, recreate it from the snapshot's
    /// inferred schema and insert every row. Returns the number of rows written.
    async fn replace_table(&self, staging_table: &str, snapshot: &Snapshot)
    -> Result<u64, LoadError>;

    /// Insert the record, or overwrite `load_timestamp` and `rows_imported`
    /// of the existing record with the same `table_name`
    async fn upsert_metadata(&self, record: &MetadataRecord) -> Result<(), LoadError>;
}
