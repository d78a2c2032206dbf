//! In-memory table snapshots passed from the extractor to the loader

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

/// A single cell read from the source
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact numeric, kept in its textual form so no precision is lost
    Decimal(String),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Decode a value that arrived in text form, using the source column type
    /// name to pick the representation. Values that do not parse as their
    /// declared type are kept as text.
    pub fn from_text(type_name: &str, text: &str) -> Value {
        let upper = type_name.to_ascii_uppercase();
        let parsed = match upper.as_str() {
            "BOOL" | "BOOLEAN" => match text {
                "t" | "true" | "TRUE" | "1" => Some(Value::Bool(true)),
                "f" | "false" | "FALSE" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            "INT2" | "INT4" | "INT8" | "SMALLINT" | "INTEGER" | "BIGINT" | "INT" | "OID" => {
                text.trim().parse().ok().map(Value::Int)
            }
            "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE PRECISION" | "FLOAT" => {
                text.trim().parse().ok().map(Value::Float)
            }
            "NUMERIC" | "DECIMAL" => {
                let trimmed = text.trim();
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(|_| Value::Decimal(trimmed.to_string()))
            }
            "DATE" => NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                .ok()
                .map(Value::Date),
            "TIMESTAMP" | "DATETIME" | "TIMESTAMP WITHOUT TIME ZONE" => {
                Self::parse_timestamp(text.trim()).map(Value::Timestamp)
            }
            _ => None,
        };

        parsed.unwrap_or_else(|| Value::Text(text.to_string()))
    }

    fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
        TIMESTAMP_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Decimal(v) | Value::Text(v) => f.write_str(v),
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Value::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

/// One row, positionally aligned with [`Snapshot::columns`]
pub type Row = Vec<Value>;

/// Error returned when a row does not match the snapshot's column count
#[derive(Debug, Error)]
#[error("row has {actual} values but the snapshot has {expected} columns")]
pub struct RowWidthMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Every row of a table as returned by the source query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Snapshot {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a snapshot from columns and rows, checking every row's width
    pub fn with_rows(columns: Vec<String>, rows: Vec<Row>) -> Result<Self, RowWidthMismatch> {
        let mut snapshot = Self::new(columns);
        for row in rows {
            snapshot.push_row(row)?;
        }
        Ok(snapshot)
    }

    pub fn push_row(&mut self, row: Row) -> Result<(), RowWidthMismatch> {
        if row.len() != self.columns.len() {
            return Err(RowWidthMismatch {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in row `row_idx`
    pub fn get(&self, row_idx: usize, column: &str) -> Option<&Value> {
        let col_idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row_idx).and_then(|row| row.get(col_idx))
    }

    /// Values of one column across all rows
    pub fn column_values(&self, col_idx: usize) -> impl Iterator<Item = &Value> {
        self.rows.iter().filter_map(move |row| row.get(col_idx))
    }
}

/// Audit row describing the most recent load of a source table
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub table_name: String,
    pub load_timestamp: NaiveDateTime,
    pub rows_imported: i64,
}

impl MetadataRecord {
    /// Record for a load of `rows_imported` rows happening now (UTC)
    pub fn now(table_name: &str, rows_imported: usize) -> Self {
        Self {
            table_name: table_name.to_string(),
            load_timestamp: chrono::Utc::now().naive_utc(),
            rows_imported: rows_imported as i64,
        }
    }
}
