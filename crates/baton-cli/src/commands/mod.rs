//! CLI command implementations.

pub mod jobs;
pub mod worker;

use anyhow::{Context, Result};
use baton_config::{WorkerConfig, load_worker_config};
use baton_db::{PgJobStore, create_pool, run_migrations};
use tracing::info;

/// Connection URLs given on the command line or through the environment.
pub struct Urls {
    pub database: Option<String>,
    pub redis: Option<String>,
}

impl Urls {
    /// The database URL, preferring the command line over the config file.
    pub fn database(&self, config: Option<&WorkerConfig>) -> Result<String> {
        self.database
            .clone()
            .or_else(|| config.and_then(|c| c.database_url.clone()))
            .context("No database URL: set DATABASE_URL or a `database` node in the config")
    }

    pub fn redis(&self, config: &WorkerConfig) -> Result<String> {
        self.redis
            .clone()
            .or_else(|| config.redis_url.clone())
            .context("No Redis URL: set REDIS_URL or a `redis` node in the config")
    }
}

async fn connect_store(database_url: &str, max_connections: u32) -> Result<PgJobStore> {
    info!("Connecting to database...");
    let pool = create_pool(database_url, max_connections)
        .await
        .context("Failed to connect to database")?;
    Ok(PgJobStore::new(pool))
}

pub async fn migrate(urls: &Urls) -> Result<()> {
    let pool = create_pool(&urls.database(None)?, 1)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool).await?;
    println!("Migrations applied");
    Ok(())
}

pub fn validate(path: &str) -> Result<()> {
    match load_worker_config(path) {
        Ok(config) => {
            println!(
                "Configuration is valid: {} job(s), {} singleton(s)",
                config.jobs.len(),
                config.singletons.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
