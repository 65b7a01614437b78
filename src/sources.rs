//! Sources command: list configured connectors with health, checkpoint,
//! and last job status.

use anyhow::Result;

use crate::config::Config;
use crate::connector::Connector;
use crate::connector_discord::DiscordConnector;
use crate::connector_github::GithubConnector;
use crate::connector_slack::SlackConnector;
use crate::db;
use crate::jobs;

pub async fn run_sources(config: &Config) -> Result<()> {
    // Build each connector individually so one missing token does not
    // hide the rest of the listing.
    let mut connectors: Vec<(String, crate::error::Result<Box<dyn Connector>>)> = Vec::new();

    for (name, cfg) in &config.connectors.github {
        let id = format!("github:{}", name);
        let built = GithubConnector::new(name.clone(), cfg.clone())
            .map(|c| Box::new(c) as Box<dyn Connector>);
        connectors.push((id, built));
    }
    for (name, cfg) in &config.connectors.slack {
        let id = format!("slack:{}", name);
        let built = SlackConnector::new(name.clone(), cfg.clone())
            .map(|c| Box::new(c) as Box<dyn Connector>);
        connectors.push((id, built));
    }
    for (name, cfg) in &config.connectors.discord {
        let id = format!("discord:{}", name);
        let built = DiscordConnector::new(name.clone(), cfg.clone())
            .map(|c| Box::new(c) as Box<dyn Connector>);
        connectors.push((id, built));
    }

    if connectors.is_empty() {
        println!("No connectors configured.");
        return Ok(());
    }

    let pool = db::connect(config).await?;

    println!(
        "{:<24} {:<12} {:<12} {:<20} DESCRIPTION",
        "CONNECTOR", "HEALTH", "CHECKPOINT", "LAST JOB"
    );

    for (connector_id, built) in &connectors {
        let checkpoint = jobs::get_checkpoint(&pool, connector_id).await?;
        let checkpoint_display = if checkpoint > 0 {
            format_date(checkpoint)
        } else {
            "-".to_string()
        };

        let last_job = jobs::last_for_connector(&pool, connector_id).await?;
        let last_job_display = match &last_job {
            Some(job) => {
                let when = job.finished_at.or(job.started_at).map(format_date);
                match when {
                    Some(date) => format!("{} {}", job.status, date),
                    None => job.status.to_string(),
                }
            }
            None => "never".to_string(),
        };

        match built {
            Ok(connector) => {
                let health = match connector.health_check().await {
                    Ok(()) => "OK".to_string(),
                    Err(err) => {
                        println!(
                            "{:<24} {:<12} {:<12} {:<20} {}",
                            connector_id,
                            "FAILED",
                            checkpoint_display,
                            last_job_display,
                            connector.describe()
                        );
                        println!("    {}", err);
                        continue;
                    }
                };
                println!(
                    "{:<24} {:<12} {:<12} {:<20} {}",
                    connector_id,
                    health,
                    checkpoint_display,
                    last_job_display,
                    connector.describe()
                );
            }
            Err(err) => {
                println!(
                    "{:<24} {:<12} {:<12} {:<20} -",
                    connector_id, "UNAVAILABLE", checkpoint_display, last_job_display
                );
                println!("    {}", err);
            }
        }
    }

    pool.close().await;
    Ok(())
}

/// Run the jobs command: print recent sync jobs, newest first.
pub async fn run_jobs(config: &Config, limit: Option<i64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let jobs = jobs::list(&pool, limit.unwrap_or(20)).await?;

    if jobs.is_empty() {
        println!("No jobs yet.");
        pool.close().await;
        return Ok(());
    }

    println!(
        "{:<36} {:<24} {:<10} {:<12} NOTE",
        "JOB", "CONNECTOR", "STATUS", "CHECKPOINT"
    );
    for job in &jobs {
        let note = job.error_message.as_deref().unwrap_or("");
        println!(
            "{:<36} {:<24} {:<10} {:<12} {}",
            job.id, job.connector_id, job.status, job.checkpoint, note
        );
    }

    pool.close().await;
    Ok(())
}

fn format_date(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}
