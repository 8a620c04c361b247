use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use traitsync_storage::{BackoffPolicy, HttpClientConfig, PgRecordStore, PoliteFetcher};
use traitsync_sync::{build_store, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "traitsync-cli")]
#[command(about = "Trait snapshot sync command-line interface")]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion and print its status
    Ingest,
    /// Create the Postgres tables at DATABASE_URL
    Migrate,
    /// Serve the JSON API, with the scheduler when enabled
    Serve,
    /// Fetch one page politely and print the body
    Fetch {
        url: String,
        #[arg(long, default_value_t = 0)]
        retries: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let status = traitsync_sync::run_ingestion_from_env().await?;
            println!("{}", serde_json::to_string(&status)?);
            if !status.is_done() {
                std::process::exit(1);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config
                .database_url
                .context("DATABASE_URL must be set to run migrations")?;
            PgRecordStore::connect(&url).await?.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            traitsync_web::serve_from_env().await?;
        }
        Commands::Fetch { url, retries } => {
            let config = SyncConfig::from_env();
            let store = build_store(&config).await?;
            let fetcher = PoliteFetcher::new(HttpClientConfig {
                user_agent: config.user_agent.clone(),
                ..Default::default()
            })?
            .with_ledger(store);

            let backoff = BackoffPolicy {
                max_retries: retries,
                ..Default::default()
            };
            let fetched = fetcher.fetch_with_retry(&url, &backoff).await;
            fetcher.flush().await;
            let body = fetched?;
            info!(%url, bytes = body.len(), "fetched page");
            println!("{body}");
        }
    }

    Ok(())
}
