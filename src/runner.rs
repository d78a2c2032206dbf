//! High-level runner API for the staging loader.
//!
//! This module provides the public interface used by the CLI: it sets up the
//! source and destination pools, makes sure the metadata table exists and runs
//! the pipeline over the configured tables.
//!
//! Callers with their own connectors can assemble a [`Pipeline`] directly from
//! a [`Source`] and a [`Destination`].

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

use crate::db::Pool;
use crate::db::pool::PoolArgsBuilder;

pub use crate::config::{
    ConnectionConfig, DEFAULT_TABLES, METADATA_TABLE, SourceKind, staging_table_name,
};
pub use crate::pipeline::{
    Destination, ExtractError, Extractor, LoadError, LoadReceipt, Loader, Pipeline, Source,
    SourceError, TableOutcome, TableReport,
};
pub use crate::snapshot::{MetadataRecord, Snapshot, Value};
pub use crate::telemetry::{RunStats, TableLine};

/// Arguments for a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineArgs {
    /// Engine the source database runs on
    pub source_kind: SourceKind,
    pub source: ConnectionConfig,
    pub destination: ConnectionConfig,

    /// Source tables to copy, processed in this order
    pub tables: Vec<String>,

    /// Hide the progress bar
    pub quiet: bool,

    // Test-only: inject pre-created pools (for SQLite testing)
    #[cfg(test)]
    pub test_source_pool: Option<Pool>,
    #[cfg(test)]
    pub test_destination_pool: Option<Pool>,
}

/// Result of a completed pipeline run
#[derive(Debug)]
pub struct RunResult {
    pub run_id: String,
    pub reports: Vec<TableReport>,
    pub stats: RunStats,
    pub duration: Duration,
}

impl RunResult {
    /// Whether any table failed to extract or load
    pub fn has_failures(&self) -> bool {
        self.reports.iter().any(|r| r.outcome.is_failure())
    }

    pub fn summary(&self) -> RunSummary<'_> {
        RunSummary {
            run_id: &self.run_id,
            duration_ms: self.duration.as_millis() as u64,
            success: !self.has_failures(),
            stats: &self.stats,
        }
    }
}

/// Serializable view of a run, printed by `--json`
#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    pub run_id: &'a str,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(flatten)]
    pub stats: &'a RunStats,
}

/// Run the pipeline with the specified arguments
///
/// Only setup problems (bad connection settings, an unreachable destination,
/// a metadata table that cannot be created) are returned as errors. Failures
/// of individual tables are reported in [`RunResult::reports`].
///
/// # Example
///
/// ```no_run
/// use stage_loader::runner::{
///     ConnectionConfig, DEFAULT_TABLES, PipelineArgs, SourceKind, run_pipeline,
/// };
///
/// # async fn example() -> anyhow::Result<()> {
/// let connection = |port: u16, database: &str| ConnectionConfig {
///     host: "localhost".to_string(),
///     port,
///     database: database.to_string(),
///     username: "etl".to_string(),
///     password: "secret".to_string(),
///     ssl_mode: "prefer".to_string(),
/// };
///
/// let args = PipelineArgs {
///     source_kind: SourceKind::SqlServer,
///     source: connection(1433, "AdventureWorksDW2019"),
///     destination: connection(5432, "AdventureWorks"),
///     tables: DEFAULT_TABLES.iter().map(|t| t.to_string()).collect(),
///     quiet: true,
/// };
///
/// let result = run_pipeline(args).await?;
/// println!("Loaded {} rows in {:?}", result.stats.rows_loaded, result.duration);
/// # Ok(())
/// # }
/// ```
pub async fn run_pipeline(args: PipelineArgs) -> Result<RunResult> {
    let started = Instant::now();
    let run_id = Uuid::new_v4().to_string();

    info!(
        run_id = %run_id,
        source_kind = ?args.source_kind,
        source = %args.source.display_target(),
        destination = %args.destination.display_target(),
        tables = args.tables.len(),
        "starting run"
    );

    // Create connection pools (or use test pools if provided)
    #[cfg(test)]
    let source: Arc<dyn Source> = match args.test_source_pool {
        Some(pool) => Arc::new(pool),
        None => open_source(args.source_kind, &args.source)
            .await
            .context("source database")?,
    };
    #[cfg(test)]
    let destination_pool = match args.test_destination_pool {
        Some(pool) => pool,
        None => connect(&args.destination)
            .await
            .context("destination database")?,
    };

    #[cfg(not(test))]
    let source = open_source(args.source_kind, &args.source)
        .await
        .context("source database")?;
    #[cfg(not(test))]
    let destination_pool = connect(&args.destination)
        .await
        .context("destination database")?;

    destination_pool.ensure_metadata_table().await?;

    let pipeline = Pipeline::new(
        Extractor::new(source),
        Loader::new(Arc::new(destination_pool)),
        args.tables,
    )
    .quiet(args.quiet);

    let reports = pipeline.run().await;
    let stats = RunStats::from_reports(&reports);
    let duration = started.elapsed();

    info!(
        run_id = %run_id,
        loaded = stats.tables_loaded,
        empty = stats.tables_empty,
        failed = stats.tables_failed,
        rows = stats.rows_loaded,
        duration_ms = duration.as_millis() as u64,
        "run finished"
    );

    Ok(RunResult {
        run_id,
        reports,
        stats,
        duration,
    })
}

async fn open_source(kind: SourceKind, config: &ConnectionConfig) -> Result<Arc<dyn Source>> {
    Ok(match kind {
        SourceKind::SqlServer => {
            Arc::new(crate::db::mssql::pool(config.tiberius_config()?, 4).await?)
        }
        SourceKind::Postgres => Arc::new(connect(config).await?),
    })
}

async fn connect(config: &ConnectionConfig) -> Result<Pool> {
    let pool_args = PoolArgsBuilder::default()
        .connect_options(config.connect_options()?)
        .build()?;
    crate::db::pool::pool(pool_args).await
}
