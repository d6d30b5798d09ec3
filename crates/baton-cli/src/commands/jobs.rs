//! Job definition management.

use anyhow::{Context, Result};
use baton_config::load_worker_config;
use baton_db::JobAdmin;

use super::{Urls, connect_store};

/// Upsert every `job` in the config file.
pub async fn apply(urls: &Urls, path: &str) -> Result<()> {
    let config = load_worker_config(path)
        .with_context(|| format!("Failed to load config file: {}", path))?;
    let store = connect_store(&urls.database(Some(&config))?, 1).await?;

    for definition in &config.jobs {
        let job = store
            .upsert_definition(definition)
            .await
            .with_context(|| format!("Failed to apply job {}", definition.name))?;
        println!(
            "✓ {} ({} \"{}\") next run at {}",
            job.name, job.executor, job.expression, job.next_time
        );
    }
    println!("{} job(s) applied", config.jobs.len());
    Ok(())
}

pub async fn list(urls: &Urls, json: bool) -> Result<()> {
    let store = connect_store(&urls.database(None)?, 1).await?;
    let jobs = store.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs defined");
        return Ok(());
    }
    println!(
        "{:<24} {:<10} {:<8} {:<8} {:<20} NEXT RUN",
        "NAME", "EXECUTOR", "STATUS", "VERSION", "SCHEDULE"
    );
    for job in jobs {
        println!(
            "{:<24} {:<10} {:<8} {:<8} {:<20} {}",
            job.name,
            job.executor,
            job.status.as_str(),
            job.version,
            job.expression,
            job.next_time
        );
    }
    Ok(())
}

pub async fn set_paused(urls: &Urls, name: &str, paused: bool) -> Result<()> {
    let store = connect_store(&urls.database(None)?, 1).await?;
    let job = store.set_paused(name, paused).await?;
    if paused {
        println!("Paused {}", job.name);
    } else {
        println!("Resumed {}, next run at {}", job.name, job.next_time);
    }
    Ok(())
}
