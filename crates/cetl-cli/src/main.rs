use anyhow::{Context, Result};
use cetl_core::TableName;
use cetl_sync::{DbConfig, PgLoader, SyncConfig};
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "cetl")]
#[command(about = "Extract customers from an HTTP JSON source and upsert them into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, transform and upsert once (default)
    Run(RunArgs),
    /// Create the target table if it does not exist
    EnsureTable {
        /// Target table (overrides CETL_TABLE)
        #[arg(long)]
        table: Option<String>,
    },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Source URL returning a JSON array (overrides CETL_SOURCE_URL)
    #[arg(long)]
    url: Option<String>,
    /// Target table (overrides CETL_TABLE)
    #[arg(long)]
    table: Option<String>,
}

fn parse_table(name: &str) -> Result<TableName> {
    TableName::parse(name).with_context(|| format!("invalid table name {name:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = cetl_sync::load_dotenv()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    if let Some(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;
    let db = DbConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            if let Some(url) = args.url {
                config.source_url = url;
            }
            if let Some(table) = args.table {
                config.table = parse_table(&table)?;
            }
            let summary = cetl_sync::run_sync_once(config, &db).await?;
            match &summary.loaded {
                Some(loaded) => println!(
                    "sync complete: run_id={} records={} upserted={} table={}",
                    summary.run_id, summary.transformed_records, loaded.upserted_rows, loaded.table
                ),
                None => println!("sync complete: run_id={} no data to load", summary.run_id),
            }
        }
        Commands::EnsureTable { table } => {
            let table = match table {
                Some(table) => parse_table(&table)?,
                None => config.table,
            };
            let loader = PgLoader::connect_lazy(&db);
            loader.ensure_target(&table).await?;
            println!("table ready: {}", table.qualified(loader.schema()).display_name());
        }
    }

    Ok(())
}
