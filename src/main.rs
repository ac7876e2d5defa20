use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tracing::info;

mod config;
mod db;
mod engine;
mod pipeline;
mod projections;
mod venues;

use config::{Command, Config};
use db::Database;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    match config.command {
        Command::Decide { date } => {
            let run_date = date.unwrap_or_else(|| Utc::now().date_naive());
            let venues = config::load_venues(&config.venues_file)?;
            let feeds = venues::build_feeds(&venues, config.fetch_timeout_secs)?;
            info!("Decision run for {} across {} venue(s)", run_date, feeds.len());
            pipeline::decide::run(&config, &db, &feeds, run_date).await?;
        }
        Command::CollectCloses { date } => {
            let run_date = date.unwrap_or_else(|| Utc::now().date_naive());
            let venues = config::load_venues(&config.venues_file)?;
            let feeds = venues::build_feeds(&venues, config.fetch_timeout_secs)?;
            pipeline::closing::run(&db, &feeds, run_date).await?;
        }
        Command::Grade { date } => {
            let run_date = date.unwrap_or_else(|| Utc::now().date_naive());
            let venues = config::load_venues(&config.venues_file)?;
            let feeds = venues::build_feeds(&venues, config.fetch_timeout_secs)?;
            pipeline::grade::run(&config, &db, &feeds, run_date).await?;
        }
        Command::Replay => {
            let balance = db.replay_ledger(config.starting_bankroll)?;
            info!(
                "Ledger replay consistent: {} entries, balance ${:.2}",
                db.ledger_entries()?.len(),
                balance
            );
            println!("{balance:.2}");
        }
    }

    Ok(())
}
