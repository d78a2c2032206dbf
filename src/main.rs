use clap::Parser;
use stage_loader::runner::{
    ConnectionConfig, DEFAULT_TABLES, PipelineArgs, RunResult, SourceKind, run_pipeline,
};
use std::process::ExitCode;

/// Copy source tables into `stg_` staging tables and record each load
#[derive(Parser, Clone)]
#[command(version, about)]
struct Args {
    /// Source database engine
    #[arg(long, env = "ETL_SOURCE_KIND", value_enum, default_value = "sqlserver")]
    source_kind: SourceKind,

    /// Source database host
    #[arg(long, env = "ETL_SOURCE_HOST", default_value = "localhost")]
    source_host: String,

    /// Source database port [default: 1433 for sqlserver, 5432 for postgres]
    #[arg(long, env = "ETL_SOURCE_PORT")]
    source_port: Option<u16>,

    /// Source database name
    #[arg(long, env = "ETL_SOURCE_DATABASE", default_value = "AdventureWorksDW2019")]
    source_database: String,

    /// Destination database host
    #[arg(long, env = "ETL_DEST_HOST", default_value = "localhost")]
    dest_host: String,

    /// Destination database port
    #[arg(long, env = "ETL_DEST_PORT", default_value = "5432")]
    dest_port: u16,

    /// Destination database name
    #[arg(long, env = "ETL_DEST_DATABASE", default_value = "AdventureWorks")]
    dest_database: String,

    /// Username for both databases
    #[arg(short, long, env = "PGUID")]
    username: String,

    /// Password for both databases
    #[arg(long, env = "PGPASS", hide_env_values = true)]
    password: String,

    /// SSL mode (disable, allow, prefer, require, verify-ca, verify-full)
    #[arg(long, env = "ETL_SSL_MODE", default_value = "prefer")]
    ssl_mode: String,

    /// Comma-separated source tables, loaded in order
    #[arg(short, long, env = "ETL_TABLES", value_delimiter = ',')]
    tables: Option<Vec<String>>,

    /// Quiet mode - no progress bar, warnings only
    #[arg(short, long)]
    quiet: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn connection(&self, host: &str, port: u16, database: &str) -> ConnectionConfig {
        ConnectionConfig {
            host: host.to_string(),
            port,
            database: database.to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
            ssl_mode: self.ssl_mode.clone(),
        }
    }

    fn source_port(&self) -> u16 {
        self.source_port
            .unwrap_or_else(|| self.source_kind.default_port())
    }

    fn tables(&self) -> Vec<String> {
        let tables: Vec<String> = self
            .tables
            .iter()
            .flatten()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if tables.is_empty() {
            DEFAULT_TABLES.iter().map(|t| t.to_string()).collect()
        } else {
            tables
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    // Initialize tracing based on quiet mode
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if args.quiet || args.json {
        EnvFilter::new("stage_loader=warn,sqlx=off")
    } else {
        EnvFilter::new("stage_loader=info,sqlx=off")
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let source = args.connection(&args.source_host, args.source_port(), &args.source_database);
    let destination = args.connection(&args.dest_host, args.dest_port, &args.dest_database);
    let tables = args.tables();

    if !args.quiet && !args.json {
        println!("Staging Loader");
        println!("==============");
        println!("Source: {} ({:?})", source.display_target(), args.source_kind);
        println!("Destination: {}", destination.display_target());
        println!("Tables: {}", tables.join(", "));
        println!();
    }

    let pipeline_args = PipelineArgs {
        source_kind: args.source_kind,
        source,
        destination,
        tables,
        quiet: args.quiet || args.json,
    };

    let result = run_pipeline(pipeline_args).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result.summary())?);
    } else {
        print_summary(&result);
    }

    Ok(if result.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_summary(result: &RunResult) {
    let stats = &result.stats;

    println!();
    println!("Run Summary");
    println!("===========");
    println!("Run ID: {}", result.run_id);
    for line in &stats.tables {
        match &line.error {
            Some(error) => println!("  {:<28} {:<15} {}", line.table, line.status, error),
            None => println!(
                "  {:<28} {:<15} {} rows ({} ms)",
                line.table, line.status, line.rows, line.duration_ms
            ),
        }
    }
    println!("Tables loaded: {}", stats.tables_loaded);
    println!("Tables empty: {}", stats.tables_empty);
    println!("Tables failed: {}", stats.tables_failed);
    println!("Rows loaded: {}", stats.rows_loaded);
    println!("Duration: {:.2}s", result.duration.as_secs_f64());

    if let (Some(p50), Some(p90), Some(p99)) = stats.get_percentiles() {
        println!("Table time: p50={}ms p90={}ms p99={}ms", p50, p90, p99);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args =
            Args::try_parse_from(["stage-loader", "--username", "etl", "--password", "pw"])
                .unwrap();

        assert_eq!(args.source_kind, SourceKind::SqlServer);
        assert_eq!(args.source_port(), 1433);
        assert_eq!(args.source_database, "AdventureWorksDW2019");
        assert_eq!(args.dest_database, "AdventureWorks");
        assert_eq!(args.ssl_mode, "prefer");
        assert_eq!(args.tables(), DEFAULT_TABLES.map(String::from).to_vec());
    }

    #[test]
    fn test_source_port_follows_source_kind() {
        let args = Args::try_parse_from([
            "stage-loader",
            "--username",
            "etl",
            "--password",
            "pw",
            "--source-kind",
            "postgres",
        ])
        .unwrap();
        assert_eq!(args.source_kind, SourceKind::Postgres);
        assert_eq!(args.source_port(), 5432);

        let args = Args::try_parse_from([
            "stage-loader",
            "--username",
            "etl",
            "--password",
            "pw",
            "--source-port",
            "14330",
        ])
        .unwrap();
        assert_eq!(args.source_port(), 14330);

        assert!(
            Args::try_parse_from([
                "stage-loader",
                "--username",
                "etl",
                "--password",
                "pw",
                "--source-kind",
                "oracle",
            ])
            .is_err()
        );
    }

    #[test]
    fn test_table_list_is_split_on_commas() {
        let args = Args::try_parse_from([
            "stage-loader",
            "--username",
            "etl",
            "--password",
            "pw",
            "--tables",
            "DimProduct, FactInternetSales,",
        ])
        .unwrap();

        assert_eq!(args.tables(), vec!["DimProduct", "FactInternetSales"]);
    }

    #[test]
    fn test_connection_uses_shared_credentials() {
        let args = Args::try_parse_from([
            "stage-loader",
            "--username",
            "etl",
            "--password",
            "pw",
            "--dest-host",
            "warehouse",
            "--dest-port",
            "6543",
        ])
        .unwrap();

        let destination = args.connection(&args.dest_host, args.dest_port, &args.dest_database);
        assert_eq!(destination.display_target(), "warehouse:6543/AdventureWorks");
        assert_eq!(destination.username, "etl");
        assert_eq!(destination.password, "pw");
    }
}
