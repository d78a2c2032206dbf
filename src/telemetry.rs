use serde::Serialize;

use crate::pipeline::{TableOutcome, TableReport};
use crate::pipeline::error::describe;

/// Summary line for one table in a run
#[derive(Debug, Clone, Serialize)]
pub struct TableLine {
    pub table: String,
    pub status: &'static str,
    pub rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Statistics aggregated from table reports
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunStats {
    pub tables_loaded: usize,
    pub tables_empty: usize,
    pub tables_failed: usize,
    pub rows_loaded: u64,
    pub tables: Vec<TableLine>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_reports(reports: &[TableReport]) -> Self {
        let mut stats = Self::new();
        for report in reports {
            stats.update(report);
        }
        stats
    }

    /// Update stats with a finished table
    pub fn update(&mut self, report: &TableReport) {
        let outcome = &report.outcome;
        match outcome {
            TableOutcome::Loaded { .. } => self.tables_loaded += 1,
            TableOutcome::Empty => self.tables_empty += 1,
            TableOutcome::ExtractFailed(_) | TableOutcome::LoadFailed(_) => {
                self.tables_failed += 1
            }
        }
        self.rows_loaded += outcome.rows();

        self.tables.push(TableLine {
            table: report.table.clone(),
            status: outcome.status(),
            rows: outcome.rows(),
            error: outcome.error().map(describe),
            duration_ms: report.duration.as_millis() as u64,
        });
    }

    /// Calculate percentile from per-table durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.tables.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.tables.iter().map(|t| t.duration_ms).collect();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ExtractError, LoadError};
    use std::time::Duration;

    fn report(table: &str, outcome: TableOutcome, millis: u64) -> TableReport {
        TableReport {
            table: table.to_string(),
            outcome,
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn test_counts_by_outcome() {
        let reports = vec![
            report("A", TableOutcome::Loaded { rows: 3 }, 10),
            report("B", TableOutcome::Empty, 5),
            report(
                "C",
                TableOutcome::ExtractFailed(ExtractError::Query {
                    table: "C".to_string(),
                    source: sqlx::Error::RowNotFound.into(),
                }),
                7,
            ),
            report("D", TableOutcome::Loaded { rows: 4 }, 20),
        ];

        let stats = RunStats::from_reports(&reports);

        assert_eq!(stats.tables_loaded, 2);
        assert_eq!(stats.tables_empty, 1);
        assert_eq!(stats.tables_failed, 1);
        assert_eq!(stats.rows_loaded, 7);
        assert_eq!(stats.tables[2].status, "extract_failed");
        assert!(stats.tables[2].error.as_deref().unwrap().contains("'C'"));
        assert!(stats.tables[0].error.is_none());
    }

    #[test]
    fn test_error_line_without_source_is_not_repeated() {
        let reports = vec![report(
            "T",
            TableOutcome::LoadFailed(LoadError::Timeout {
                table: "T".to_string(),
                timeout: Duration::from_millis(250),
            }),
            250,
        )];

        let stats = RunStats::from_reports(&reports);

        assert_eq!(
            stats.tables[0].error.as_deref(),
            Some("loading 'T' timed out after 250ms")
        );
    }

    #[test]
    fn test_percentiles() {
        let reports: Vec<_> = (1..=10)
            .map(|i| report("T", TableOutcome::Loaded { rows: 1 }, i * 100))
            .collect();
        let stats = RunStats::from_reports(&reports);

        assert_eq!(stats.get_percentiles(), (Some(500), Some(900), Some(1000)));
        assert_eq!(stats.percentile(0.0), Some(100));
    }

    #[test]
    fn test_percentile_without_tables() {
        assert_eq!(RunStats::new().percentile(50.0), None);
    }

    #[test]
    fn test_serializes_without_empty_error() {
        let stats = RunStats::from_reports(&[report("A", TableOutcome::Empty, 1)]);
        let json = serde_json::to_value(&stats).unwrap();

        assert_eq!(json["tables_empty"], 1);
        assert_eq!(json["tables"][0]["status"], "empty");
        assert!(json["tables"][0].get("error").is_none());
    }
}
