//! Integration tests for job leasing, checkpoint safety, and the
//! scheduler's containment of failing extraction groups.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use devgraph::config::Config;
use devgraph::connector::{Connector, ConnectorRegistry};
use devgraph::db;
use devgraph::error::{Error, Result};
use devgraph::extract::{EventGroup, Extraction, Extractor, RulesExtractor};
use devgraph::graph::GraphStore;
use devgraph::jobs;
use devgraph::migrate;
use devgraph::models::{EntityKind, EventKind, JobStatus, NormalizedEvent, PlatformEvent};
use devgraph::processor::Processor;
use devgraph::retry::shutdown_pair;
use devgraph::scheduler::Scheduler;
use sqlx::SqlitePool;
use tempfile::TempDir;

// ─── Test extractors ────────────────────────────────────────────────

/// Delegates to the rules extractor but fails any group whose events
/// mention the marker.
struct FailingExtractor {
    marker: String,
}

#[async_trait]
impl Extractor for FailingExtractor {
    fn name(&self) -> &str {
        "failing"
    }

    async fn extract(&self, group: &EventGroup) -> Result<Extraction> {
        if group.events.iter().any(|e| e.content.contains(&self.marker)) {
            return Err(Error::Extraction {
                group: group.key.clone(),
                reason: "scripted failure".to_string(),
            });
        }
        RulesExtractor.extract(group).await
    }
}

/// Never answers; exists to prove the per-group timeout fires.
struct StalledExtractor;

#[async_trait]
impl Extractor for StalledExtractor {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn extract(&self, _group: &EventGroup) -> Result<Extraction> {
        tokio::time::sleep(Duration::from_secs(300)).await;
        Ok(Extraction::default())
    }
}

// ─── Test connector ─────────────────────────────────────────────────

/// Serves a fixed script of standalone commits.
struct ScriptedConnector {
    events: Vec<PlatformEvent>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn name(&self) -> &str {
        "pipe"
    }

    fn platform(&self) -> &str {
        "script"
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch_events(&self, since: i64, limit: usize) -> Result<Vec<PlatformEvent>> {
        let mut page: Vec<PlatformEvent> = self
            .events
            .iter()
            .filter(|e| e.timestamp.timestamp() > since)
            .cloned()
            .collect();
        page.sort_by_key(|e| e.timestamp);
        page.truncate(limit);
        Ok(page)
    }

    fn normalize(&self, event: &PlatformEvent) -> Result<NormalizedEvent> {
        Ok(NormalizedEvent {
            platform_id: format!("script:pipe:commit:{}", event.id),
            connector: "script:pipe".to_string(),
            event_kind: EventKind::Commit,
            timestamp: event.timestamp,
            author: event.author.clone(),
            content: event.content.clone(),
            thread_id: None,
            parent_id: None,
            file_refs: vec![],
            feature_refs: vec![],
            metadata: serde_json::Value::Null,
        })
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn test_config(tmp: &TempDir) -> Config {
    let db_path = tmp.path().join("devgraph.sqlite");
    let config_content = format!(
        r#"
[db]
path = "{}"

[scheduler]
workers = 1
poll_secs = 1
lease_secs = 60
page_size = 100
"#,
        db_path.display()
    );
    toml::from_str(&config_content).unwrap()
}

async fn setup(tmp: &TempDir) -> (Config, SqlitePool) {
    let cfg = test_config(tmp);
    migrate::run_migrations(&cfg).await.unwrap();
    let pool = db::connect(&cfg).await.unwrap();
    (cfg, pool)
}

fn commit_event(n: usize, author: &str, content: &str, ts: i64) -> NormalizedEvent {
    NormalizedEvent {
        platform_id: format!("script:pipe:commit:{:03}", n),
        connector: "script:pipe".to_string(),
        event_kind: EventKind::Commit,
        timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
        author: Some(author.to_string()),
        content: content.to_string(),
        thread_id: None,
        parent_id: None,
        file_refs: vec![],
        feature_refs: vec![],
        metadata: serde_json::Value::Null,
    }
}

fn raw_commit(id: &str, author: &str, content: &str, ts: i64) -> PlatformEvent {
    PlatformEvent {
        id: id.to_string(),
        kind: "commit".to_string(),
        timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
        author: Some(author.to_string()),
        content: content.to_string(),
        metadata: serde_json::json!({}),
        references: vec![],
    }
}

fn make_scheduler(
    cfg: &Config,
    pool: &SqlitePool,
    connector: ScriptedConnector,
    extractor: Arc<dyn Extractor>,
) -> Scheduler {
    let mut registry = ConnectorRegistry::new();
    registry.register(Box::new(connector));
    let processor = Arc::new(Processor::new(
        pool.clone(),
        extractor,
        cfg.embedding.clone(),
        Duration::from_secs(30),
    ));
    Scheduler::new(pool.clone(), Arc::new(registry), processor, cfg)
}

// ─── Job store tests ────────────────────────────────────────────────

/// Prove that a connector has at most one queued or running job.
#[tokio::test]
async fn test_one_active_job_per_connector() {
    let tmp = TempDir::new().unwrap();
    let (_cfg, pool) = setup(&tmp).await;

    let (first, created) = jobs::enqueue(&pool, "script:pipe").await.unwrap();
    assert!(created);

    // A second enqueue while the first is pending returns the same job
    let (second, created) = jobs::enqueue(&pool, "script:pipe").await.unwrap();
    assert!(!created);
    assert_eq!(second.id, first.id);

    assert!(jobs::lease(&pool, &first.id, 60).await.unwrap());
    let (third, created) = jobs::enqueue(&pool, "script:pipe").await.unwrap();
    assert!(!created, "a running job still blocks new ones");
    assert_eq!(third.id, first.id);

    assert!(jobs::finish(&pool, &first.id, JobStatus::Completed, 0, None)
        .await
        .unwrap());
    let (fourth, created) = jobs::enqueue(&pool, "script:pipe").await.unwrap();
    assert!(created, "a terminal job frees the connector");
    assert_ne!(fourth.id, first.id);
}

/// Prove that each pending job is claimed by exactly one worker.
#[tokio::test]
async fn test_lease_next_claims_each_job_once() {
    let tmp = TempDir::new().unwrap();
    let (_cfg, pool) = setup(&tmp).await;

    for name in ["script:a", "script:b", "script:c"] {
        jobs::enqueue(&pool, name).await.unwrap();
    }

    let mut claimed = Vec::new();
    for _ in 0..3 {
        let job = jobs::lease_next(&pool, 60).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.lease_expires_at.is_some());
        claimed.push(job.id);
    }
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), 3, "no job may be claimed twice");

    assert!(jobs::lease_next(&pool, 60).await.unwrap().is_none());
}

/// Prove that a job whose lease lapsed is failed by the sweep, and that
/// a late finish from the original worker is discarded.
#[tokio::test]
async fn test_expired_leases_are_reclaimed() {
    let tmp = TempDir::new().unwrap();
    let (_cfg, pool) = setup(&tmp).await;

    let (job, _) = jobs::enqueue(&pool, "script:pipe").await.unwrap();
    // A negative lease is already expired when claimed
    assert!(jobs::lease(&pool, &job.id, -5).await.unwrap());

    assert_eq!(jobs::reclaim_expired(&pool).await.unwrap(), 1);
    let reclaimed = jobs::get(&pool, &job.id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status, JobStatus::Failed);
    assert!(reclaimed
        .error_message
        .as_deref()
        .unwrap()
        .contains("lease expired"));

    // The worker that lost the lease cannot overwrite the reclaim
    let finished = jobs::finish(&pool, &job.id, JobStatus::Completed, 500, None)
        .await
        .unwrap();
    assert!(!finished);
    let job = jobs::get(&pool, &job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    // A healthy lease is not touched by the sweep
    let (job, _) = jobs::enqueue(&pool, "script:pipe").await.unwrap();
    assert!(jobs::lease(&pool, &job.id, 60).await.unwrap());
    assert_eq!(jobs::reclaim_expired(&pool).await.unwrap(), 0);
}

/// Prove that checkpoints only move forward, and that only an explicit
/// reset can rewind one.
#[tokio::test]
async fn test_checkpoints_only_move_forward() {
    let tmp = TempDir::new().unwrap();
    let (_cfg, pool) = setup(&tmp).await;

    assert_eq!(jobs::get_checkpoint(&pool, "script:pipe").await.unwrap(), 0);

    jobs::set_checkpoint(&pool, "script:pipe", 100).await.unwrap();
    jobs::set_checkpoint(&pool, "script:pipe", 50).await.unwrap();
    assert_eq!(
        jobs::get_checkpoint(&pool, "script:pipe").await.unwrap(),
        100,
        "a lower write must not rewind the checkpoint"
    );

    jobs::set_checkpoint(&pool, "script:pipe", 200).await.unwrap();
    assert_eq!(jobs::get_checkpoint(&pool, "script:pipe").await.unwrap(), 200);

    jobs::reset_checkpoint(&pool, "script:pipe").await.unwrap();
    assert_eq!(jobs::get_checkpoint(&pool, "script:pipe").await.unwrap(), 0);
}

// ─── Batch containment tests ────────────────────────────────────────

/// Prove that one failing group does not poison its batch: the others
/// persist and the safe checkpoint stops just before the failed range.
#[tokio::test]
async fn test_failed_group_pins_batch_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = setup(&tmp).await;

    let extractor: Arc<dyn Extractor> = Arc::new(FailingExtractor {
        marker: "poison".to_string(),
    });
    let processor = Processor::new(
        pool.clone(),
        extractor,
        cfg.embedding.clone(),
        Duration::from_secs(30),
    );

    // Ten standalone commits; the one at ts 500 fails extraction
    let events: Vec<NormalizedEvent> = (0..10)
        .map(|n| {
            let content = if n == 4 {
                "poison pill".to_string()
            } else {
                format!("routine change {}", n)
            };
            commit_event(n, &format!("dev{}", n), &content, (n as i64 + 1) * 100)
        })
        .collect();

    let outcome = processor.process_batch(&events).await.unwrap();
    assert_eq!(outcome.events_total, 10);
    assert_eq!(outcome.groups_total, 10);
    assert_eq!(outcome.groups_failed, 1);
    assert_eq!(
        outcome.safe_checkpoint,
        Some(499),
        "checkpoint must stop just before the earliest failed event"
    );

    // The nine healthy groups persisted their contributors
    let store = GraphStore::new(pool.clone());
    assert!(store
        .find_entity(EntityKind::Contributor, "dev3")
        .await
        .unwrap()
        .is_some());
    assert!(
        store
            .find_entity(EntityKind::Contributor, "dev4")
            .await
            .unwrap()
            .is_none(),
        "the failed group must persist nothing"
    );
    assert_eq!(outcome.entities_written, 9);
}

/// Prove that a group stuck in extraction is timed out and counted as
/// failed instead of hanging the batch.
#[tokio::test]
async fn test_extraction_timeout_counts_as_failure() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = setup(&tmp).await;

    let extractor: Arc<dyn Extractor> = Arc::new(StalledExtractor);
    let processor = Processor::new(
        pool.clone(),
        extractor,
        cfg.embedding.clone(),
        Duration::from_millis(50),
    );

    let events = vec![commit_event(0, "ana", "routine change", 100)];
    let outcome = processor.process_batch(&events).await.unwrap();

    assert_eq!(outcome.groups_failed, 1);
    assert_eq!(outcome.safe_checkpoint, Some(99));
    assert_eq!(outcome.entities_written, 0);
}

// ─── Scheduler tests ────────────────────────────────────────────────

/// Prove that a sync with failed groups finishes as partial, pins the
/// durable checkpoint before the failed range, and refetches that range
/// on the next run.
#[tokio::test]
async fn test_partial_sync_pins_checkpoint_and_refetches() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = setup(&tmp).await;

    let connector = ScriptedConnector {
        events: vec![
            raw_commit("c1", "ana", "routine change", 100),
            raw_commit("c2", "ben", "poison pill", 200),
            raw_commit("c3", "cam", "another routine change", 300),
        ],
    };
    let extractor: Arc<dyn Extractor> = Arc::new(FailingExtractor {
        marker: "poison".to_string(),
    });
    let scheduler = make_scheduler(&cfg, &pool, connector, extractor);

    let (job, _) = jobs::enqueue(&pool, "script:pipe").await.unwrap();
    assert!(jobs::lease(&pool, &job.id, 60).await.unwrap());
    let (_handle, shutdown) = shutdown_pair();
    let (status, summary) = scheduler.run_job(job.clone(), &shutdown).await;
    let summary = summary.unwrap();

    assert_eq!(status, JobStatus::Partial);
    assert_eq!(summary.groups_failed, 1);
    assert_eq!(
        summary.checkpoint, 199,
        "durable checkpoint must stay before the failed group"
    );
    assert_eq!(jobs::get_checkpoint(&pool, "script:pipe").await.unwrap(), 199);

    let job = jobs::get(&pool, &job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Partial);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("1 of 3 groups failed"));

    // The next run re-fetches the pinned range
    let (job, _) = jobs::enqueue(&pool, "script:pipe").await.unwrap();
    assert!(jobs::lease(&pool, &job.id, 60).await.unwrap());
    let (_, summary) = scheduler.run_job(job, &shutdown).await;
    assert_eq!(summary.unwrap().events_fetched, 2);
}

/// Prove the scheduling sweep: a connector that never ran is enqueued
/// once, an active job blocks re-enqueueing, and finished connectors are
/// only due again after their interval (stretched after a rate limit).
#[tokio::test]
async fn test_enqueue_due_respects_intervals() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = setup(&tmp).await;

    let connector = ScriptedConnector { events: vec![] };
    let extractor: Arc<dyn Extractor> = Arc::new(RulesExtractor);
    let scheduler = make_scheduler(&cfg, &pool, connector, extractor);

    assert_eq!(scheduler.enqueue_due().await.unwrap(), 1, "never-ran is due");
    assert_eq!(scheduler.enqueue_due().await.unwrap(), 0, "active job blocks");

    let job = jobs::lease_next(&pool, 60).await.unwrap().unwrap();
    jobs::finish(&pool, &job.id, JobStatus::Completed, 0, None)
        .await
        .unwrap();
    assert_eq!(
        scheduler.enqueue_due().await.unwrap(),
        0,
        "just-finished connector is not due yet"
    );

    // Pretend the job ran two minutes ago: past the normal interval.
    // created_at moves too so the next job is unambiguously the latest.
    let past = chrono::Utc::now().timestamp() - 120;
    sqlx::query("UPDATE jobs SET finished_at = ?, created_at = ? WHERE id = ?")
        .bind(past)
        .bind(past)
        .bind(&job.id)
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(scheduler.enqueue_due().await.unwrap(), 1);

    // A rate-limited finish stretches the interval past two minutes
    let job = jobs::lease_next(&pool, 60).await.unwrap().unwrap();
    jobs::finish(
        &pool,
        &job.id,
        JobStatus::Failed,
        0,
        Some("rate limited by script:pipe after 3 attempts"),
    )
    .await
    .unwrap();
    sqlx::query("UPDATE jobs SET finished_at = ? WHERE id = ?")
        .bind(past)
        .bind(&job.id)
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(
        scheduler.enqueue_due().await.unwrap(),
        0,
        "rate-limited connector backs off longer"
    );

    // Well past the stretched interval it is due again
    let long_ago = chrono::Utc::now().timestamp() - 400;
    sqlx::query("UPDATE jobs SET finished_at = ? WHERE id = ?")
        .bind(long_ago)
        .bind(&job.id)
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(scheduler.enqueue_due().await.unwrap(), 1);
}

/// Prove the daemon loop end to end: the supervisor enqueues the due
/// connector, a worker runs it, and shutdown stops the pool cleanly.
#[tokio::test]
async fn test_daemon_processes_queue_and_stops() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = setup(&tmp).await;

    let connector = ScriptedConnector {
        events: vec![raw_commit("c1", "ana", "daemon smoke change", 100)],
    };
    let extractor: Arc<dyn Extractor> = Arc::new(RulesExtractor);
    let scheduler = make_scheduler(&cfg, &pool, connector, extractor);

    let (handle, shutdown) = shutdown_pair();
    let daemon = tokio::spawn(async move { scheduler.run(shutdown).await });

    let mut finished = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(job) = jobs::last_for_connector(&pool, "script:pipe").await.unwrap() {
            if job.status.is_terminal() {
                finished = Some(job);
                break;
            }
        }
    }
    let job = finished.expect("daemon should finish the job within 5 seconds");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(jobs::get_checkpoint(&pool, "script:pipe").await.unwrap(), 100);

    handle.trigger();
    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon should stop after shutdown")
        .unwrap()
        .unwrap();
}
