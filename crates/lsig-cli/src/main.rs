use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lsig_catalog::CatalogStore;
use lsig_sync::{build_scheduler, WatchConfig, WatchPipeline};
use lsig_web::AppState;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "lsig-cli")]
#[command(about = "LeadSignal source watcher command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ensure the catalog schema exists.
    Init,
    /// Run one watch pass over all enabled sources.
    Sync,
    /// Run the watcher on its cron cadence until interrupted.
    Watch,
    /// Serve the dashboard.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Init => {
            let store = CatalogStore::connect(&config.database_url).await?;
            store.initialize().await?;
            println!("catalog initialized at {}", config.database_url);
        }
        Commands::Sync => {
            let pipeline = WatchPipeline::from_config(&config).await?;
            let summary = pipeline.run_once().await?;
            let (new, changed, removed) = summary.totals();
            println!(
                "watch run complete: run_id={} sources={} failed={} new={} changed={} removed={}",
                summary.run_id,
                summary.sources_attempted,
                summary.sources_failed,
                new,
                changed,
                removed
            );
        }
        Commands::Watch => {
            let pipeline = Arc::new(WatchPipeline::from_config(&config).await?);
            let mut sched = build_scheduler(pipeline, &config.watch_cron).await?;
            sched.start().await?;
            info!(cron = %config.watch_cron, "watcher started; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            sched.shutdown().await?;
        }
        Commands::Serve => {
            let port: u16 = std::env::var("LSIG_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000);
            let store = CatalogStore::connect(&config.database_url).await?;
            store.initialize().await?;
            let state = AppState::new(store, config.sources_path.clone());
            info!(port, "dashboard listening");
            lsig_web::serve(state, port).await?;
        }
    }

    Ok(())
}
