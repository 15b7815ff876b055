use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flus_storage::PgLinkStore;
use flus_sync::{context_from_config, CredentialVault, SyncConfig, SyncEngine};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "flus-cli")]
#[command(about = "Bank link and transaction sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API, worker pool and (if enabled) the scheduler.
    Serve,
    /// Apply the schema to DATABASE_URL.
    Migrate,
    /// Sync one linked item now and print the report.
    Sync { item_id: String },
    /// Retry revoke-and-delete for every item pending removal.
    RetryRemovals,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => flus_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgLinkStore::connect(&config.database_url, 2)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying schema")?;
            info!("schema applied");
        }
        Commands::Sync { item_id } => {
            let config = SyncConfig::from_env();
            let ctx = context_from_config(&config).await?;
            let report = SyncEngine::new(ctx)
                .sync(&item_id)
                .await
                .with_context(|| format!("syncing {item_id}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::RetryRemovals => {
            let config = SyncConfig::from_env();
            let ctx = context_from_config(&config).await?;
            let sweep = CredentialVault::new(&ctx)
                .retry_pending_removals()
                .await
                .context("retrying pending removals")?;
            println!(
                "removal sweep: attempted={} deleted={} still_pending={}",
                sweep.attempted, sweep.deleted, sweep.still_pending
            );
        }
    }

    Ok(())
}
