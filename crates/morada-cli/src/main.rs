use anyhow::Result;
use clap::{Parser, Subcommand};
use morada_storage::PgListingStore;
use morada_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "morada")]
#[command(about = "Apartment listing tracker for Florianópolis housing portals")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every configured portal once and upsert what it finds.
    Run,
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = morada_sync::run_from_env().await?;
            println!(
                "run complete: run_id={} sources={} listings={} inserted={} updated={}",
                summary.run_id,
                summary.sources.len(),
                summary.listings(),
                summary.inserted(),
                summary.updated()
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgListingStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
