//! SpendGuard - ledger and spend-authorization engine
//!
//! Runs the background scheduler (liquidation sweeps, hold expiry,
//! reconciliation) against PostgreSQL when `postgres_url` is configured, or
//! against in-memory stores with paper providers otherwise.
//!
//! ```text
//! spendguard [--env dev] [--once]
//! ```

use std::sync::Arc;

use anyhow::Context;

use spendguard::config::AppConfig;
use spendguard::db::Database;
use spendguard::providers::{PaperSettlementFeed, PaperVenue};
use spendguard::{AppState, JobScheduler, Providers};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn use_once_mode() -> bool {
    std::env::args().any(|a| a == "--once")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config =
        AppConfig::load(&env).with_context(|| format!("loading config for env '{env}'"))?;
    let _log_guard = spendguard::logging::init_logging(&app_config);

    tracing::info!("Starting SpendGuard in {} mode", env);

    // Real venue and settlement adapters plug in behind the provider traits;
    // this binary ships with the paper implementations.
    let venue = Arc::new(PaperVenue::new());
    let providers = Providers {
        venue: venue.clone(),
        prices: venue,
        settlement: Arc::new(PaperSettlementFeed::new()),
    };

    let state = match app_config.postgres_url.clone() {
        Some(url) => {
            let db = Database::connect(&url)
                .await
                .context("connecting to PostgreSQL")?;
            db.health_check().await.context("PostgreSQL health check")?;
            db.init_schema().await.context("initializing schema")?;
            AppState::postgres(&db, app_config, providers)
        }
        None => {
            tracing::warn!("postgres_url not set, using in-memory stores");
            AppState::in_memory(app_config, providers)
        }
    };

    let scheduler = JobScheduler::new(state);
    if use_once_mode() {
        let run = scheduler.run_once().await;
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }
    scheduler.run().await
}
