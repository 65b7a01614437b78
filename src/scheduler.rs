//! Job scheduler: a small worker pool that claims pending sync jobs
//! under a lease and drives each one through the full lifecycle of
//! health check, paginated fetch, normalization, and processing.
//!
//! One supervisor task reclaims expired leases and enqueues connectors
//! that are due; `scheduler.workers` worker tasks poll for pending jobs.
//! The conditional claim in the job store means workers never step on
//! each other, and a worker that dies mid-job loses its lease and the
//! job is reclaimed on the next sweep.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::connector::{Connector, ConnectorRegistry};
use crate::db;
use crate::error::{Error, Result};
use crate::extract::{self, Extractor};
use crate::jobs;
use crate::models::{IngestionJob, JobStatus};
use crate::processor::{self, Processor};
use crate::retry::{retry_with_backoff, shutdown_pair, RetryPolicy, Shutdown};

/// What one sync run fetched and produced.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub pages: usize,
    pub events_fetched: usize,
    /// Events dropped because normalization rejected them.
    pub events_dropped: usize,
    pub groups_total: usize,
    pub groups_failed: usize,
    pub entities_written: usize,
    pub relationships_written: usize,
    /// Durable checkpoint after the run.
    pub checkpoint: i64,
}

#[derive(Clone)]
pub struct Scheduler {
    pool: SqlitePool,
    registry: Arc<ConnectorRegistry>,
    processor: Arc<Processor>,
    policy: RetryPolicy,
    workers: usize,
    poll_interval: Duration,
    lease_secs: i64,
    page_size: usize,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<ConnectorRegistry>,
        processor: Arc<Processor>,
        config: &Config,
    ) -> Self {
        Self {
            pool,
            registry,
            processor,
            policy: RetryPolicy::from_config(&config.retry),
            workers: config.scheduler.workers,
            poll_interval: Duration::from_secs(config.scheduler.poll_secs),
            lease_secs: config.scheduler.lease_secs,
            page_size: config.scheduler.page_size,
        }
    }

    /// Queue a sync for every connector whose suggested interval has
    /// elapsed since its last finished job. Returns how many jobs were
    /// created.
    pub async fn enqueue_due(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut enqueued = 0;

        for connector in self.registry.connectors() {
            let connector_id = connector.connector_id();
            let last = jobs::last_for_connector(&self.pool, &connector_id).await?;

            let due = match &last {
                None => true,
                Some(job) if !job.status.is_terminal() => false,
                Some(job) => {
                    let finished = job.finished_at.unwrap_or(0);
                    // Matches the Display form of the rate-limit error
                    // recorded at finish time.
                    let rate_limited = job
                        .error_message
                        .as_deref()
                        .map(|m| m.starts_with("rate limited"))
                        .unwrap_or(false);
                    let delay = connector.next_sync_delay(rate_limited).as_secs() as i64;
                    now >= finished + delay
                }
            };

            if due {
                let (job, created) = jobs::enqueue(&self.pool, &connector_id).await?;
                if created {
                    enqueued += 1;
                    tracing::debug!(connector = %connector_id, job = %job.id, "scheduled sync");
                }
            }
        }

        Ok(enqueued)
    }

    /// Run the worker pool until shutdown is triggered. Jobs already
    /// started are finished; nothing new is claimed afterwards.
    pub async fn run(&self, shutdown: Shutdown) -> Result<()> {
        tracing::info!(workers = self.workers, "scheduler started");

        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let scheduler = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                scheduler.worker_loop(worker_id, shutdown).await;
            }));
        }

        let mut shutdown_wait = shutdown.clone();
        loop {
            if let Err(err) = jobs::reclaim_expired(&self.pool).await {
                tracing::warn!(error = %err, "lease reclaim sweep failed");
            }
            if let Err(err) = self.enqueue_due().await {
                tracing::warn!(error = %err, "scheduling sweep failed");
            }

            tokio::select! {
                _ = shutdown_wait.triggered() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: Shutdown) {
        let mut shutdown_wait = shutdown.clone();
        loop {
            if shutdown.is_triggered() {
                break;
            }

            let job = match jobs::lease_next(&self.pool, self.lease_secs).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown_wait.triggered() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    continue;
                }
                Err(err) => {
                    tracing::warn!(worker = worker_id, error = %err, "job poll failed");
                    tokio::select! {
                        _ = shutdown_wait.triggered() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    continue;
                }
            };

            self.run_job(job, &shutdown).await;
        }
        tracing::debug!(worker = worker_id, "worker stopped");
    }

    /// Run a claimed job to completion and record the terminal status.
    /// The job must already be leased by the caller.
    pub async fn run_job(
        &self,
        job: IngestionJob,
        shutdown: &Shutdown,
    ) -> (JobStatus, Option<SyncSummary>) {
        let connector_id = job.connector_id.clone();
        tracing::info!(job = %job.id, connector = %connector_id, "sync started");

        let connector = match self.registry.find(&connector_id) {
            Some(connector) => connector,
            None => {
                self.finish_job(
                    &job,
                    JobStatus::Failed,
                    job.checkpoint,
                    Some(format!("no connector configured as '{}'", connector_id)),
                )
                .await;
                return (JobStatus::Failed, None);
            }
        };

        match self.run_sync(connector, &job, shutdown).await {
            Ok(summary) => {
                let (status, message) = if summary.groups_failed > 0 {
                    (
                        JobStatus::Partial,
                        Some(format!(
                            "{} of {} groups failed and will be refetched",
                            summary.groups_failed, summary.groups_total
                        )),
                    )
                } else {
                    (JobStatus::Completed, None)
                };
                tracing::info!(
                    job = %job.id,
                    connector = %connector_id,
                    status = %status,
                    events = summary.events_fetched,
                    dropped = summary.events_dropped,
                    entities = summary.entities_written,
                    relationships = summary.relationships_written,
                    checkpoint = summary.checkpoint,
                    "sync finished"
                );
                self.finish_job(&job, status, summary.checkpoint, message).await;
                (status, Some(summary))
            }
            Err(err) => {
                let checkpoint = jobs::get_checkpoint(&self.pool, &connector_id)
                    .await
                    .unwrap_or(job.checkpoint);
                tracing::warn!(job = %job.id, connector = %connector_id, error = %err, "sync failed");
                self.finish_job(&job, JobStatus::Failed, checkpoint, Some(err.to_string()))
                    .await;
                (JobStatus::Failed, None)
            }
        }
    }

    async fn finish_job(
        &self,
        job: &IngestionJob,
        status: JobStatus,
        checkpoint: i64,
        message: Option<String>,
    ) {
        match jobs::finish(&self.pool, &job.id, status, checkpoint, message.as_deref()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job = %job.id, "job lease was reclaimed before finish; result discarded");
            }
            Err(err) => {
                tracing::warn!(job = %job.id, error = %err, "failed to record job result");
            }
        }
    }

    /// One full sync: health check, then fetch pages from the durable
    /// checkpoint until a short page. Each page is normalized, stored,
    /// and processed before the next fetch; the lease is renewed per
    /// page so long backfills survive their initial lease window.
    pub async fn run_sync(
        &self,
        connector: &dyn Connector,
        job: &IngestionJob,
        shutdown: &Shutdown,
    ) -> Result<SyncSummary> {
        let connector_id = connector.connector_id();

        retry_with_backoff(&self.policy, shutdown, &connector_id, || {
            connector.health_check()
        })
        .await?;

        let mut summary = SyncSummary::default();
        // The checkpoints table is the single source of truth; the job
        // row only snapshots it for the status surface. Reading it here
        // (not the snapshot) keeps a pre-reset pending job from skipping
        // a full refetch.
        let mut since = jobs::get_checkpoint(&self.pool, &connector_id).await?;
        // Once a group fails, the durable checkpoint stays pinned before
        // the failed range even though the run keeps going.
        let mut checkpoint_pinned = false;

        loop {
            if shutdown.is_triggered() {
                return Err(Error::Cancelled {
                    connector: connector_id,
                });
            }

            let page = retry_with_backoff(&self.policy, shutdown, &connector_id, || {
                connector.fetch_events(since, self.page_size)
            })
            .await?;

            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            let page_max_ts = page
                .iter()
                .map(|e| e.timestamp.timestamp())
                .max()
                .unwrap_or(since);
            summary.pages += 1;
            summary.events_fetched += page_len;

            let mut normalized = Vec::with_capacity(page_len);
            for raw in &page {
                match connector.normalize(raw) {
                    Ok(event) => normalized.push(event),
                    Err(err) => {
                        summary.events_dropped += 1;
                        tracing::warn!(
                            connector = %connector_id,
                            event = %raw.id,
                            error = %err,
                            "dropping event that failed normalization"
                        );
                    }
                }
            }

            processor::store_events(&self.pool, &normalized).await?;
            let outcome = self.processor.process_batch(&normalized).await?;
            summary.groups_total += outcome.groups_total;
            summary.groups_failed += outcome.groups_failed;
            summary.entities_written += outcome.entities_written;
            summary.relationships_written += outcome.relationships_written;

            // On a clean page the checkpoint covers the raw page maximum, so
            // events dropped by normalization are never refetched. On a page
            // with failures it stops before the earliest failed group.
            let page_checkpoint = if outcome.groups_failed == 0 {
                Some(page_max_ts)
            } else {
                outcome.safe_checkpoint
            };
            if let Some(safe) = page_checkpoint {
                if !checkpoint_pinned {
                    jobs::set_checkpoint(&self.pool, &connector_id, safe).await?;
                }
            }
            if outcome.groups_failed > 0 {
                checkpoint_pinned = true;
            }

            match jobs::renew_lease(&self.pool, &job.id, self.lease_secs).await {
                Ok(true) => {}
                Ok(false) => {
                    // The sweep reclaimed this job while we held it;
                    // whatever we would report next is already stale.
                    tracing::warn!(job = %job.id, "lease lost mid-run; abandoning job");
                    return Err(Error::Cancelled {
                        connector: connector_id,
                    });
                }
                Err(err) => {
                    tracing::warn!(job = %job.id, error = %err, "lease renewal failed");
                }
            }

            if page_len < self.page_size {
                break;
            }
            if page_max_ts <= since {
                tracing::warn!(
                    connector = %connector_id,
                    since,
                    "fetch made no timestamp progress; stopping pagination"
                );
                break;
            }
            since = page_max_ts;
        }

        summary.checkpoint = jobs::get_checkpoint(&self.pool, &connector_id).await?;
        Ok(summary)
    }
}

// ============ CLI commands ============

/// Run the scheduler daemon until SIGINT or SIGTERM.
pub async fn run_daemon(config: &Config) -> anyhow::Result<()> {
    let registry = Arc::new(ConnectorRegistry::from_config(config)?);
    if registry.is_empty() {
        anyhow::bail!(
            "No connectors configured. Add [connectors.github.<name>] (or slack/discord) to the config."
        );
    }

    let pool = db::connect(config).await?;
    let scheduler = build_scheduler(config, &pool, Arc::clone(&registry))?;

    let (handle, shutdown) = shutdown_pair();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        handle.trigger();
    });

    println!(
        "Scheduler running with {} workers over {} connectors. Ctrl+C to stop.",
        config.scheduler.workers,
        registry.len()
    );
    scheduler.run(shutdown).await?;
    pool.close().await;
    Ok(())
}

/// Run one connector sync to completion in the foreground.
pub async fn run_sync_once(
    config: &Config,
    connector_id: &str,
    full: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    let registry = Arc::new(ConnectorRegistry::from_config(config)?);
    let connector = registry.find(connector_id).ok_or_else(|| {
        let available: Vec<String> = registry
            .connectors()
            .iter()
            .map(|c| c.connector_id())
            .collect();
        anyhow::anyhow!(
            "Unknown connector: '{}'. Available: {}",
            connector_id,
            available.join(", ")
        )
    })?;

    let pool = db::connect(config).await?;
    let (_handle, shutdown) = shutdown_pair();

    if dry_run {
        let policy = RetryPolicy::from_config(&config.retry);
        connector.health_check().await?;
        let since = if full {
            0
        } else {
            jobs::get_checkpoint(&pool, connector_id).await?
        };
        let page = retry_with_backoff(&policy, &shutdown, connector_id, || {
            connector.fetch_events(since, config.scheduler.page_size)
        })
        .await?;

        let mut dropped = 0usize;
        let mut normalized = Vec::with_capacity(page.len());
        for raw in &page {
            match connector.normalize(raw) {
                Ok(event) => normalized.push(event),
                Err(_) => dropped += 1,
            }
        }
        let groups = processor::group_events(&normalized);

        println!("sync {} (dry-run)", connector_id);
        println!("  events fetched: {}", page.len());
        println!("  dropped by normalization: {}", dropped);
        println!("  event groups: {}", groups.len());
        pool.close().await;
        return Ok(());
    }

    if full {
        jobs::reset_checkpoint(&pool, connector_id).await?;
    }

    let scheduler = build_scheduler(config, &pool, Arc::clone(&registry))?;

    let (job, created) = jobs::enqueue(&pool, connector_id).await?;
    if !created && job.status == JobStatus::Running {
        anyhow::bail!(
            "A sync for {} is already running (job {}).",
            connector_id,
            job.id
        );
    }
    if !jobs::lease(&pool, &job.id, config.scheduler.lease_secs).await? {
        anyhow::bail!("Job {} was claimed by another worker.", job.id);
    }

    let (status, summary) = scheduler.run_job(job.clone(), &shutdown).await;

    if let Some(summary) = &summary {
        println!("sync {}", connector_id);
        println!("  events fetched: {}", summary.events_fetched);
        println!("  dropped by normalization: {}", summary.events_dropped);
        println!(
            "  groups processed: {} ({} failed)",
            summary.groups_total, summary.groups_failed
        );
        println!("  entities written: {}", summary.entities_written);
        println!("  relationships written: {}", summary.relationships_written);
        println!("  checkpoint: {}", summary.checkpoint);
    }

    if status == JobStatus::Failed {
        let reason = jobs::get(&pool, &job.id)
            .await?
            .and_then(|j| j.error_message)
            .unwrap_or_else(|| "unknown error".to_string());
        pool.close().await;
        anyhow::bail!("sync {} failed: {}", connector_id, reason);
    }

    println!("ok");
    pool.close().await;
    Ok(())
}

fn build_scheduler(
    config: &Config,
    pool: &SqlitePool,
    registry: Arc<ConnectorRegistry>,
) -> anyhow::Result<Scheduler> {
    let extractor: Arc<dyn Extractor> = Arc::from(extract::create_extractor(&config.extraction)?);
    let processor = Arc::new(Processor::new(
        pool.clone(),
        extractor,
        config.embedding.clone(),
        Duration::from_secs(config.extraction.timeout_secs),
    ));
    Ok(Scheduler::new(
        pool.clone(),
        registry,
        processor,
        config,
    ))
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
