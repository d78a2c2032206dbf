//! Database layer - connection pooling, source reads, staging writes and schema inference

pub mod mssql;
pub mod pool;
pub mod schema;

pub use mssql::SqlServerSource;
pub use pool::Pool;
