use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{info, warn};

use super::connector::Destination;
use super::error::{LoadError, root_cause};
use crate::config::{QUERY_TIMEOUT, staging_table_name};
use crate::snapshot::{MetadataRecord, Snapshot};

/// What a successful load wrote
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReceipt {
    pub staging_table: String,
    pub rows_imported: u64,
    pub load_timestamp: NaiveDateTime,
}

/// Writes snapshots into staging tables and records each load in the
/// metadata table
pub struct Loader {
    destination: Arc<dyn Destination>,
    timeout: Duration,
}

impl Loader {
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        Self {
            destination,
            timeout: QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the staging table for `table_name` with `snapshot`, then upsert
    /// its metadata record
    ///
    /// The metadata record is written only after the staging table has been
    /// committed with every row of the snapshot, so a record always describes
    /// data that is really there. The two writes are not atomic: if the upsert
    /// fails the staging table is already replaced and the previous record
    /// stays in place.
    pub async fn load(&self, snapshot: Snapshot, table_name: &str) -> Result<LoadReceipt, LoadError> {
        let result = self.replace_and_record(&snapshot, table_name).await;

        match &result {
            Ok(receipt) => info!(
                table = table_name,
                staging_table = %receipt.staging_table,
                rows = receipt.rows_imported,
                "Data imported successfully for {}",
                table_name
            ),
            Err(e) => warn!(
                table = table_name,
                error = %root_cause(e),
                "Data load error for {}: {}",
                table_name,
                e
            ),
        }

        result
    }

    async fn replace_and_record(
        &self,
        snapshot: &Snapshot,
        table_name: &str,
    ) -> Result<LoadReceipt, LoadError> {
        let staging_table = staging_table_name(table_name);

        let written = self
            .within_timeout(
                table_name,
                self.destination.replace_table(&staging_table, snapshot),
            )
            .await?;

        let expected = snapshot.len() as u64;
        if written != expected {
            return Err(LoadError::RowCountMismatch {
                staging_table,
                expected,
                written,
            });
        }

        let record = MetadataRecord::now(table_name, snapshot.len());
        self.within_timeout(table_name, self.destination.upsert_metadata(&record))
            .await?;

        Ok(LoadReceipt {
            staging_table,
            rows_imported: written,
            load_timestamp: record.load_timestamp,
        })
    }

    async fn within_timeout<T>(
        &self,
        table_name: &str,
        step: impl Future<Output = Result<T, LoadError>>,
    ) -> Result<T, LoadError> {
        tokio::time::timeout(self.timeout, step)
            .await
            .unwrap_or_else(|_| {
                Err(LoadError::Timeout {
                    table: table_name.to_string(),
                    timeout: self.timeout,
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Value;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Destination keeping staging tables and metadata in memory
    #[derive(Default)]
    struct MemoryDestination {
        staging: Mutex<HashMap<String, Snapshot>>,
        metadata: Mutex<HashMap<String, MetadataRecord>>,
        fail_staging: bool,
        fail_metadata: bool,
        /// Rows silently dropped from every staging write
        drop_rows: u64,
    }

    #[async_trait]
    impl Destination for MemoryDestination {
        async fn replace_table(
            &self,
            staging_table: &str,
            snapshot: &Snapshot,
        ) -> Result<u64, LoadError> {
            if self.fail_staging {
                return Err(LoadError::Staging {
                    staging_table: staging_table.to_string(),
                    source: sqlx::Error::PoolClosed,
                });
            }
            self.staging
                .lock()
                .unwrap()
                .insert(staging_table.to_string(), snapshot.clone());
            Ok((snapshot.len() as u64).saturating_sub(self.drop_rows))
        }

        async fn upsert_metadata(&self, record: &MetadataRecord) -> Result<(), LoadError> {
            if self.fail_metadata {
                return Err(LoadError::Metadata {
                    table: record.table_name.clone(),
                    source: sqlx::Error::PoolClosed,
                });
            }
            self.metadata
                .lock()
                .unwrap()
                .insert(record.table_name.clone(), record.clone());
            Ok(())
        }
    }

    fn rows(n: i64) -> Snapshot {
        Snapshot::with_rows(
            vec!["id".to_string()],
            (0..n).map(|i| vec![Value::Int(i)]).collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_load_writes_staging_and_metadata() {
        let destination = Arc::new(MemoryDestination::default());
        let loader = Loader::new(destination.clone());

        let receipt = loader.load(rows(3), "T1").await.unwrap();

        assert_eq!(receipt.staging_table, "stg_T1");
        assert_eq!(receipt.rows_imported, 3);
        assert_eq!(destination.staging.lock().unwrap()["stg_T1"].len(), 3);

        let metadata = destination.metadata.lock().unwrap();
        assert_eq!(metadata["T1"].rows_imported, 3);
        assert_eq!(metadata["T1"].load_timestamp, receipt.load_timestamp);
    }

    #[tokio::test]
    async fn test_second_load_overwrites_first() {
        let destination = Arc::new(MemoryDestination::default());
        let loader = Loader::new(destination.clone());

        loader.load(rows(10), "T1").await.unwrap();
        loader.load(rows(7), "T1").await.unwrap();

        assert_eq!(destination.staging.lock().unwrap()["stg_T1"].len(), 7);
        let metadata = destination.metadata.lock().unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata["T1"].rows_imported, 7);
    }

    #[tokio::test]
    async fn test_empty_snapshot_records_zero_rows() {
        let destination = Arc::new(MemoryDestination::default());
        let loader = Loader::new(destination.clone());

        let receipt = loader.load(rows(0), "T1").await.unwrap();

        assert_eq!(receipt.rows_imported, 0);
        assert_eq!(destination.metadata.lock().unwrap()["T1"].rows_imported, 0);
    }

    #[tokio::test]
    async fn test_staging_failure_skips_metadata() {
        let destination = Arc::new(MemoryDestination {
            fail_staging: true,
            ..Default::default()
        });
        let loader = Loader::new(destination.clone());

        let err = loader.load(rows(3), "T1").await.unwrap_err();

        assert!(matches!(err, LoadError::Staging { .. }));
        assert!(destination.metadata.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_failure_leaves_staging_current_and_record_stale() {
        let destination = Arc::new(MemoryDestination::default());
        Loader::new(destination.clone())
            .load(rows(10), "T1")
            .await
            .unwrap();
        let previous = destination.metadata.lock().unwrap()["T1"].clone();

        let failing = Arc::new(MemoryDestination {
            fail_metadata: true,
            staging: Mutex::new(destination.staging.lock().unwrap().clone()),
            metadata: Mutex::new(destination.metadata.lock().unwrap().clone()),
            ..Default::default()
        });
        let err = Loader::new(failing.clone())
            .load(rows(7), "T1")
            .await
            .unwrap_err();

        assert!(matches!(err, LoadError::Metadata { ref table, .. } if table == "T1"));
        assert_eq!(failing.staging.lock().unwrap()["stg_T1"].len(), 7);
        assert_eq!(failing.metadata.lock().unwrap()["T1"], previous);
    }

    #[tokio::test]
    async fn test_short_write_is_row_count_mismatch() {
        let destination = Arc::new(MemoryDestination {
            drop_rows: 1,
            ..Default::default()
        });
        let loader = Loader::new(destination.clone());

        let err = loader.load(rows(3), "T1").await.unwrap_err();

        assert!(matches!(
            err,
            LoadError::RowCountMismatch { ref staging_table, expected: 3, written: 2 }
                if staging_table == "stg_T1"
        ));
        assert!(destination.metadata.lock().unwrap().is_empty());
    }

    /// Destination whose staging writes never finish
    struct HangingDestination {
        metadata_writes: Mutex<u32>,
    }

    #[async_trait]
    impl Destination for HangingDestination {
        async fn replace_table(
            &self,
            _staging_table: &str,
            _snapshot: &Snapshot,
        ) -> Result<u64, LoadError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(0)
        }

        async fn upsert_metadata(&self, _record: &MetadataRecord) -> Result<(), LoadError> {
            *self.metadata_writes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_staging_step_times_out() {
        let destination = Arc::new(HangingDestination {
            metadata_writes: Mutex::new(0),
        });
        let loader = Loader::new(destination.clone()).with_timeout(Duration::from_millis(50));

        let err = loader.load(rows(3), "FactInternetSales").await.unwrap_err();

        assert!(matches!(
            err,
            LoadError::Timeout { ref table, timeout }
                if table == "FactInternetSales" && timeout == Duration::from_millis(50)
        ));
        assert_eq!(*destination.metadata_writes.lock().unwrap(), 0);
    }
}
