use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use seodaily_sync::{run_sync_once_from_env, PipelineConfig, SinkChoice, TableStatus};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "seodaily")]
#[command(about = "Daily SEO metrics sync into a spreadsheet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, merge and write every enabled provider once.
    Run {
        /// Process this date (YYYY-MM-DD) instead of today minus the lookback.
        #[arg(long)]
        date: Option<String>,
        #[arg(long, value_enum, default_value_t = SinkArg::Auto)]
        sink: SinkArg,
    },
    /// Print the date a run would process.
    ResolveDate {
        #[arg(long)]
        date: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkArg {
    Auto,
    Sheets,
    Csv,
}

impl From<SinkArg> for SinkChoice {
    fn from(arg: SinkArg) -> Self {
        match arg {
            SinkArg::Auto => SinkChoice::Auto,
            SinkArg::Sheets => SinkChoice::Sheets,
            SinkArg::Csv => SinkChoice::Csv,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .filter(|level| !level.trim().is_empty())
                .and_then(|level| EnvFilter::try_new(level.trim().to_ascii_lowercase()).ok())
        })
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let command = cli.command.unwrap_or(Commands::Run {
        date: None,
        sink: SinkArg::Auto,
    });

    match command {
        Commands::Run { date, sink } => {
            let summary = run_sync_once_from_env(date, sink.into()).await?;
            println!(
                "sync complete: run_id={} target_date={} sink={}",
                summary.run_id, summary.target_date, summary.sink
            );
            for table in &summary.tables {
                let status = match &table.status {
                    TableStatus::Written { table_rows, .. } => format!("written ({table_rows} rows)"),
                    TableStatus::SkippedEmpty => "skipped (no rows)".to_string(),
                    TableStatus::Failed { error } => format!("failed: {error}"),
                };
                println!(
                    "  {} -> {}: fetched={} origin={:?} {status}",
                    table.provider_id, table.table, table.fetched_rows, table.origin
                );
            }
            if !summary.is_success() {
                bail!("failed tables: {}", summary.failed_tables().join(", "));
            }
        }
        Commands::ResolveDate { date } => {
            let config = PipelineConfig::from_env()?.with_target_date(date);
            println!("{}", config.resolve_target_date()?);
        }
    }

    Ok(())
}
