use chrono::NaiveTime;

use crate::snapshot::{Snapshot, Value};

/// SQL data type of a staging column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Boolean,
    BigInt,
    DoublePrecision,
    Numeric,
    Text,
    Date,
    Timestamp,
}

impl SqlType {
    /// Returns the Postgres type name
    pub fn to_postgres(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::BigInt => "BIGINT",
            SqlType::DoublePrecision => "DOUBLE PRECISION",
            SqlType::Numeric => "NUMERIC",
            SqlType::Text => "TEXT",
            SqlType::Date => "DATE",
            SqlType::Timestamp => "TIMESTAMP",
        }
    }

    /// Type of a single value, `None` for NULL
    pub fn of(value: &Value) -> Option<SqlType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(SqlType::Boolean),
            Value::Int(_) => Some(SqlType::BigInt),
            Value::Float(_) => Some(SqlType::DoublePrecision),
            Value::Decimal(_) => Some(SqlType::Numeric),
            Value::Text(_) => Some(SqlType::Text),
            Value::Date(_) => Some(SqlType::Date),
            Value::Timestamp(_) => Some(SqlType::Timestamp),
        }
    }

    /// Find the most specific common type that accommodates both types
    pub fn common_type(&self, other: &SqlType) -> SqlType {
        if self == other {
            return *self;
        }

        use SqlType::*;
        match (self, other) {
            (Boolean, BigInt) | (BigInt, Boolean) => BigInt,
            (Boolean, Numeric) | (Numeric, Boolean) => Numeric,
            (Boolean, DoublePrecision) | (DoublePrecision, Boolean) => DoublePrecision,

            (BigInt, Numeric) | (Numeric, BigInt) => Numeric,
            (BigInt, DoublePrecision) | (DoublePrecision, BigInt) => DoublePrecision,
            (Numeric, DoublePrecision) | (DoublePrecision, Numeric) => DoublePrecision,

            (Date, Timestamp) | (Timestamp, Date) => Timestamp,

            _ => Text,
        }
    }

    /// Whether Postgres needs an explicit CAST for a value bound as text
    pub fn needs_text_cast(&self) -> bool {
        matches!(self, SqlType::Numeric)
    }
}

/// A column in a schema
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
}

/// A staging table schema (collection of columns)
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    /// Infer a schema from the values of a snapshot
    ///
    /// Each column gets the common type of its non-null values; a column with
    /// no non-null values is TEXT. Nothing is carried over from earlier loads.
    pub fn infer(snapshot: &Snapshot) -> Schema {
        let columns = snapshot
            .columns()
            .iter()
            .enumerate()
            .map(|(col_idx, name)| {
                let (sql_type, nullable) = Self::infer_column_type(snapshot.column_values(col_idx));
                Column {
                    name: name.clone(),
                    sql_type,
                    nullable,
                }
            })
            .collect();

        Schema { columns }
    }

    fn infer_column_type<'a>(values: impl Iterator<Item = &'a Value>) -> (SqlType, bool) {
        let mut inferred_type: Option<SqlType> = None;
        let mut has_nulls = false;

        for value in values {
            match SqlType::of(value) {
                Some(val_type) => {
                    inferred_type = Some(match inferred_type {
                        None => val_type,
                        Some(current) => current.common_type(&val_type),
                    });
                }
                None => has_nulls = true,
            }
        }

        match inferred_type {
            Some(sql_type) => (sql_type, has_nulls),
            // All-null or no rows at all
            None => (SqlType::Text, true),
        }
    }

    /// Generate the DDL statement creating a table with this schema
    pub fn create_table_ddl(&self, table_name: &str) -> String {
        let mut ddl = format!("CREATE TABLE {} (\n", quote_ident(table_name));

        let column_defs: Vec<String> = self
            .columns
            .iter()
            .map(|col| {
                let nullable_clause = if col.nullable { "" } else { " NOT NULL" };
                format!(
                    "  {} {}{}",
                    quote_ident(&col.name),
                    col.sql_type.to_postgres(),
                    nullable_clause
                )
            })
            .collect();

        ddl.push_str(&column_defs.join(",\n"));
        ddl.push_str("\n)");

        ddl
    }
}

/// Quote an identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified name part by part (`dbo.DimProduct`)
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

/// Convert a value to the representation bound for a column of `target` type
///
/// The target always comes from [`Schema::infer`] over the same values, so
/// every conversion here follows one of the promotions in
/// [`SqlType::common_type`].
pub fn coerce(value: &Value, target: SqlType) -> Value {
    match (target, value) {
        (_, Value::Null) => Value::Null,

        (SqlType::BigInt, Value::Bool(b)) => Value::Int(i64::from(*b)),

        (SqlType::DoublePrecision, Value::Bool(b)) => Value::Float(if *b { 1.0 } else { 0.0 }),
        (SqlType::DoublePrecision, Value::Int(i)) => Value::Float(*i as f64),
        (SqlType::DoublePrecision, Value::Decimal(d)) => {
            d.parse().map(Value::Float).unwrap_or(Value::Null)
        }

        (SqlType::Numeric, Value::Bool(b)) => Value::Decimal(i64::from(*b).to_string()),
        (SqlType::Numeric, Value::Int(i)) => Value::Decimal(i.to_string()),

        (SqlType::Timestamp, Value::Date(d)) => Value::Timestamp(d.and_time(NaiveTime::default())),

        (SqlType::Text, other) if !matches!(other, Value::Text(_)) => {
            Value::Text(other.to_string())
        }

        (_, other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn snapshot(columns: &[&str], rows: Vec<Vec<Value>>) -> Snapshot {
        Snapshot::with_rows(columns.iter().map(|c| c.to_string()).collect(), rows).unwrap()
    }

    #[test]
    fn test_type_promotion() {
        assert_eq!(
            SqlType::Boolean.common_type(&SqlType::BigInt),
            SqlType::BigInt
        );
        assert_eq!(
            SqlType::BigInt.common_type(&SqlType::DoublePrecision),
            SqlType::DoublePrecision
        );
        assert_eq!(
            SqlType::BigInt.common_type(&SqlType::Numeric),
            SqlType::Numeric
        );
        assert_eq!(
            SqlType::Date.common_type(&SqlType::Timestamp),
            SqlType::Timestamp
        );
        assert_eq!(SqlType::BigInt.common_type(&SqlType::Text), SqlType::Text);
        assert_eq!(SqlType::Date.common_type(&SqlType::BigInt), SqlType::Text);
    }

    #[test]
    fn test_infer_schema() {
        let snapshot = snapshot(
            &["ProductKey", "EnglishProductName", "ListPrice", "StartDate"],
            vec![
                vec![
                    Value::Int(1),
                    Value::Text("Adjustable Race".to_string()),
                    Value::Null,
                    Value::Date(NaiveDate::from_ymd_opt(2003, 7, 1).unwrap()),
                ],
                vec![
                    Value::Int(210),
                    Value::Text("HL Road Frame - Black, 58".to_string()),
                    Value::Decimal("1431.50".to_string()),
                    Value::Date(NaiveDate::from_ymd_opt(2002, 6, 1).unwrap()),
                ],
            ],
        );

        let schema = Schema::infer(&snapshot);

        assert_eq!(schema.columns.len(), 4);
        assert_eq!(schema.columns[0].sql_type, SqlType::BigInt);
        assert!(!schema.columns[0].nullable);
        assert_eq!(schema.columns[1].sql_type, SqlType::Text);
        assert_eq!(schema.columns[2].sql_type, SqlType::Numeric);
        assert!(schema.columns[2].nullable);
        assert_eq!(schema.columns[3].sql_type, SqlType::Date);
    }

    #[test]
    fn test_all_null_and_empty_columns_are_text() {
        let all_null = snapshot(&["a"], vec![vec![Value::Null], vec![Value::Null]]);
        let schema = Schema::infer(&all_null);
        assert_eq!(schema.columns[0].sql_type, SqlType::Text);
        assert!(schema.columns[0].nullable);

        let no_rows = Snapshot::new(vec!["a".to_string()]);
        let schema = Schema::infer(&no_rows);
        assert_eq!(schema.columns[0].sql_type, SqlType::Text);
    }

    #[test]
    fn test_mixed_types_promote_to_text() {
        let snapshot = snapshot(
            &["value"],
            vec![
                vec![Value::Int(123)],
                vec![Value::Text("hello".to_string())],
                vec![Value::Int(456)],
            ],
        );

        let schema = Schema::infer(&snapshot);
        assert_eq!(schema.columns[0].sql_type, SqlType::Text);
    }

    #[test]
    fn test_generate_ddl() {
        let schema = Schema {
            columns: vec![
                Column {
                    name: "id".to_string(),
                    sql_type: SqlType::BigInt,
                    nullable: false,
                },
                Column {
                    name: "name".to_string(),
                    sql_type: SqlType::Text,
                    nullable: true,
                },
                Column {
                    name: "balance".to_string(),
                    sql_type: SqlType::DoublePrecision,
                    nullable: true,
                },
            ],
        };

        let ddl = schema.create_table_ddl("stg_customers");

        assert!(ddl.contains("CREATE TABLE \"stg_customers\""));
        assert!(ddl.contains("\"id\" BIGINT NOT NULL"));
        assert!(ddl.contains("\"name\" TEXT"));
        assert!(!ddl.contains("\"name\" TEXT NOT NULL"));
        assert!(ddl.contains("\"balance\" DOUBLE PRECISION"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("DimProduct"), "\"DimProduct\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_qualified("dbo.DimProduct"), "\"dbo\".\"DimProduct\"");
    }

    #[test]
    fn test_coerce_follows_promotions() {
        assert_eq!(coerce(&Value::Int(3), SqlType::DoublePrecision), Value::Float(3.0));
        assert_eq!(
            coerce(&Value::Int(3), SqlType::Numeric),
            Value::Decimal("3".to_string())
        );
        assert_eq!(coerce(&Value::Bool(true), SqlType::BigInt), Value::Int(1));
        assert_eq!(
            coerce(&Value::Int(7), SqlType::Text),
            Value::Text("7".to_string())
        );
        assert_eq!(coerce(&Value::Null, SqlType::BigInt), Value::Null);

        let date = NaiveDate::from_ymd_opt(2013, 1, 28).unwrap();
        assert_eq!(
            coerce(&Value::Date(date), SqlType::Timestamp),
            Value::Timestamp(date.and_hms_opt(0, 0, 0).unwrap())
        );
    }
}
