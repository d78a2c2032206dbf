use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::connector::Source;
use super::error::{ExtractError, root_cause};
use crate::config::QUERY_TIMEOUT;
use crate::snapshot::Snapshot;

/// Reads whole tables from the source database
pub struct Extractor {
    source: Arc<dyn Source>,
    timeout: Duration,
}

impl Extractor {
    pub fn new(source: Arc<dyn Source>) -> Self {
        Self {
            source,
            timeout: QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Materialize every row of `table_name`
    ///
    /// Failures are logged here and returned to the caller, which decides
    /// whether to carry on with the next table.
    pub async fn extract(&self, table_name: &str) -> Result<Snapshot, ExtractError> {
        let result = tokio::time::timeout(self.timeout, self.source.read_table(table_name))
            .await
            .unwrap_or_else(|_| {
                Err(ExtractError::Timeout {
                    table: table_name.to_string(),
                    timeout: self.timeout,
                })
            });

        match &result {
            Ok(snapshot) => info!(
                table = table_name,
                rows = snapshot.len(),
                columns = snapshot.columns().len(),
                "extracted table"
            ),
            Err(e) => warn!(
                table = table_name,
                error = %root_cause(e),
                "Data extract error for {}: {}",
                table_name,
                e
            ),
        }

        result
    }
}
