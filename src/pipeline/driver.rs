use std::error::Error;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use super::error::{ExtractError, LoadError};
use super::extractor::Extractor;
use super::loader::Loader;

/// How processing one table ended
#[derive(Debug)]
pub enum TableOutcome {
    /// Staging table replaced and metadata upserted
    Loaded { rows: u64 },
    /// Source returned no rows, nothing was written
    Empty,
    ExtractFailed(ExtractError),
    LoadFailed(LoadError),
}

impl TableOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            TableOutcome::Loaded { .. } => "loaded",
            TableOutcome::Empty => "empty",
            TableOutcome::ExtractFailed(_) => "extract_failed",
            TableOutcome::LoadFailed(_) => "load_failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TableOutcome::ExtractFailed(_) | TableOutcome::LoadFailed(_)
        )
    }

    pub fn rows(&self) -> u64 {
        match self {
            TableOutcome::Loaded { rows } => *rows,
            _ => 0,
        }
    }

    pub fn error(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TableOutcome::ExtractFailed(e) => Some(e),
            TableOutcome::LoadFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of one table together with how long it took
#[derive(Debug)]
pub struct TableReport {
    pub table: String,
    pub outcome: TableOutcome,
    pub duration: Duration,
}

/// Runs extract then load for each configured table, in order
pub struct Pipeline {
    extractor: Extractor,
    loader: Loader,
    tables: Vec<String>,
    quiet: bool,
}

impl Pipeline {
    pub fn new(extractor: Extractor, loader: Loader, tables: Vec<String>) -> Self {
        Self {
            extractor,
            loader,
            tables,
            quiet: false,
        }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Process every table, one at a time. A failed table is recorded in
    /// its report and never stops the tables after it.
    pub async fn run(&self) -> Vec<TableReport> {
        let progress = self.progress_bar();
        let mut reports = Vec::with_capacity(self.tables.len());

        for table in &self.tables {
            progress.set_message(table.clone());

            let started = Instant::now();
            let outcome = self.process_table(table).await;
            let duration = started.elapsed();

            info!(
                table = %table,
                status = outcome.status(),
                rows = outcome.rows(),
                duration_ms = duration.as_millis() as u64,
                "table finished"
            );

            reports.push(TableReport {
                table: table.clone(),
                outcome,
                duration,
            });
            progress.inc(1);
        }

        progress.finish_with_message("done");
        reports
    }

    async fn process_table(&self, table: &str) -> TableOutcome {
        info!(table, "extracting");
        let snapshot = match self.extractor.extract(table).await {
            Ok(snapshot) => snapshot,
            Err(e) => return TableOutcome::ExtractFailed(e),
        };

        if snapshot.is_empty() {
            info!(table, "source returned no rows, skipping load");
            return TableOutcome::Empty;
        }

        info!(table, rows = snapshot.len(), "loading");
        match self.loader.load(snapshot, table).await {
            Ok(receipt) => TableOutcome::Loaded {
                rows: receipt.rows_imported,
            },
            Err(e) => TableOutcome::LoadFailed(e),
        }
    }

    fn progress_bar(&self) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(self.tables.len() as u64);
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] Tables: [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar
    }
}
