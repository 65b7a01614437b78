//! Integration tests for the ingestion pipeline.
//!
//! A scripted in-memory connector is driven through the real scheduler,
//! processor, and graph store against a temporary SQLite database. These
//! tests prove that platform events become knowledge entities, that
//! re-syncing is idempotent, and that bad events are contained.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use devgraph::config::Config;
use devgraph::connector::{Connector, ConnectorRegistry};
use devgraph::db;
use devgraph::error::{Error, Result};
use devgraph::extract::create_extractor;
use devgraph::graph::GraphStore;
use devgraph::jobs;
use devgraph::migrate;
use devgraph::models::{EntityKind, EventKind, JobStatus, NormalizedEvent, PlatformEvent};
use devgraph::processor::Processor;
use devgraph::query::fetch_context;
use devgraph::retry::shutdown_pair;
use devgraph::scheduler::{Scheduler, SyncSummary};
use sqlx::SqlitePool;
use tempfile::TempDir;

// ─── Test connector ─────────────────────────────────────────────────

/// A connector that serves a fixed script of platform events.
struct ScriptedConnector {
    name: String,
    events: Vec<PlatformEvent>,
}

impl ScriptedConnector {
    fn new(name: &str, events: Vec<PlatformEvent>) -> Self {
        Self {
            name: name.to_string(),
            events,
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn name(&self) -> &str {
        &self.name
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
        if event.kind == "corrupt" {
            return Err(Error::Normalization {
                platform: "script".to_string(),
                reason: "unreadable payload".to_string(),
            });
        }
        let event_kind = match event.kind.as_str() {
            "commit" => EventKind::Commit,
            _ => EventKind::Message,
        };
        Ok(NormalizedEvent {
            platform_id: format!("{}:{}:{}", self.connector_id(), event.kind, event.id),
            connector: self.connector_id(),
            event_kind,
            timestamp: event.timestamp,
            author: event.author.clone(),
            content: event.content.clone(),
            thread_id: event
                .metadata
                .get("thread")
                .and_then(|v| v.as_str())
                .map(String::from),
            parent_id: None,
            file_refs: event
                .references
                .iter()
                .filter(|r| r.contains('/'))
                .cloned()
                .collect(),
            feature_refs: event
                .references
                .iter()
                .filter(|r| r.starts_with('#'))
                .cloned()
                .collect(),
            metadata: event.metadata.clone(),
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

fn make_scheduler(cfg: &Config, pool: &SqlitePool, connectors: Vec<ScriptedConnector>) -> Scheduler {
    let mut registry = ConnectorRegistry::new();
    for connector in connectors {
        registry.register(Box::new(connector));
    }
    let extractor = Arc::from(create_extractor(&cfg.extraction).unwrap());
    let processor = Arc::new(Processor::new(
        pool.clone(),
        extractor,
        cfg.embedding.clone(),
        Duration::from_secs(cfg.extraction.timeout_secs),
    ));
    Scheduler::new(pool.clone(), Arc::new(registry), processor, cfg)
}

/// Enqueue, lease, and run one job for the connector, returning the
/// terminal status and summary.
async fn run_connector(
    scheduler: &Scheduler,
    pool: &SqlitePool,
    connector_id: &str,
) -> (JobStatus, SyncSummary) {
    let (job, _created) = jobs::enqueue(pool, connector_id).await.unwrap();
    assert!(
        jobs::lease(pool, &job.id, 60).await.unwrap(),
        "test worker should win the lease"
    );
    let (_handle, shutdown) = shutdown_pair();
    let (status, summary) = scheduler.run_job(job, &shutdown).await;
    (status, summary.expect("run_sync should produce a summary"))
}

fn commit(id: &str, author: &str, content: &str, ts: i64, refs: Vec<&str>) -> PlatformEvent {
    PlatformEvent {
        id: id.to_string(),
        kind: "commit".to_string(),
        timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
        author: Some(author.to_string()),
        content: content.to_string(),
        metadata: serde_json::json!({}),
        references: refs.into_iter().map(String::from).collect(),
    }
}

fn message(id: &str, thread: &str, author: &str, content: &str, ts: i64, refs: Vec<&str>) -> PlatformEvent {
    PlatformEvent {
        id: id.to_string(),
        kind: "message".to_string(),
        timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
        author: Some(author.to_string()),
        content: content.to_string(),
        metadata: serde_json::json!({ "thread": thread }),
        references: refs.into_iter().map(String::from).collect(),
    }
}

fn corrupt(id: &str, ts: i64) -> PlatformEvent {
    PlatformEvent {
        id: id.to_string(),
        kind: "corrupt".to_string(),
        timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
        author: None,
        content: String::new(),
        metadata: serde_json::json!({}),
        references: vec![],
    }
}

/// Two commits on one feature plus a short decision thread.
fn limiter_script() -> Vec<PlatformEvent> {
    vec![
        commit(
            "c1",
            "ana",
            "Add rate limiter for #42",
            1_000,
            vec!["#42", "src/limiter.rs"],
        ),
        commit(
            "c2",
            "ben",
            "Tune limiter thresholds for #42",
            2_000,
            vec!["#42", "src/limiter.rs"],
        ),
        message(
            "m1",
            "t9",
            "ana",
            "Decision: cap retries at three for #42",
            3_000,
            vec!["#42"],
        ),
        message("m2", "t9", "ben", "sounds right", 3_010, vec![]),
    ]
}

async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

// ─── Tests ──────────────────────────────────────────────────────────

/// Prove that a connector's events flow through sync into knowledge
/// entities, relationships, and typed payloads.
#[tokio::test]
async fn test_sync_builds_graph_from_platform_events() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = setup(&tmp).await;
    let scheduler = make_scheduler(&cfg, &pool, vec![ScriptedConnector::new("pipe", limiter_script())]);

    let (status, summary) = run_connector(&scheduler, &pool, "script:pipe").await;

    assert_eq!(status, JobStatus::Completed);
    assert_eq!(summary.events_fetched, 4);
    assert_eq!(summary.events_dropped, 0);
    assert_eq!(summary.groups_total, 2, "one feature group, one thread");
    assert_eq!(summary.groups_failed, 0);
    assert_eq!(summary.checkpoint, 3_010);
    assert_eq!(
        jobs::get_checkpoint(&pool, "script:pipe").await.unwrap(),
        3_010
    );

    let job = jobs::last_for_connector(&pool, "script:pipe")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.error_message.is_none());
    assert!(job.finished_at.is_some());

    // Feature, file, two contributors, discussion, decision
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM entities").await, 6);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM relationships").await, 7);

    let store = GraphStore::new(pool.clone());
    let feature = store
        .find_entity(EntityKind::Feature, "#42")
        .await
        .unwrap()
        .expect("feature entity");
    let file = store
        .find_entity(EntityKind::File, "src/limiter.rs")
        .await
        .unwrap()
        .expect("file entity");
    assert!(store
        .find_entity(EntityKind::Contributor, "ana")
        .await
        .unwrap()
        .is_some());
    assert!(store
        .find_entity(EntityKind::Contributor, "ben")
        .await
        .unwrap()
        .is_some());

    // The thread anchors a discussion keyed by its group label
    let discussion = store
        .find_entity(EntityKind::Discussion, "thread:script:pipe:t9")
        .await
        .unwrap()
        .expect("discussion entity");
    let summary_payload = store
        .get_discussion(&discussion.id)
        .await
        .unwrap()
        .expect("discussion payload");
    assert_eq!(summary_payload.participants, vec!["ana", "ben"]);
    assert_eq!(summary_payload.source_event_ids.len(), 2);

    // The decision marker in the thread produced a decision record
    let decision_id: String = sqlx::query_scalar("SELECT id FROM entities WHERE kind = 'decision'")
        .fetch_one(&pool)
        .await
        .unwrap();
    let record = store
        .get_decision(&decision_id)
        .await
        .unwrap()
        .expect("decision payload");
    assert!(record.title.contains("cap retries"));
    assert_eq!(record.decided_at, 3_000);

    // Both commits are in the file's history
    let history = store.file_history(&file.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].changed_at, 2_000, "newest change first");

    // The feature is wired to the file it touches
    let paths = store
        .traverse(&feature.id, &[devgraph::models::RelationKind::RelatesTo], 1)
        .await
        .unwrap();
    assert!(paths
        .iter()
        .filter_map(|p| p.terminal())
        .any(|e| e.id == file.id));
}

/// Prove that running the same sync again moves no data: the checkpoint
/// filters fetches, and a forced refetch only re-upserts.
#[tokio::test]
async fn test_resync_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = setup(&tmp).await;
    let scheduler = make_scheduler(&cfg, &pool, vec![ScriptedConnector::new("pipe", limiter_script())]);

    let (status, _) = run_connector(&scheduler, &pool, "script:pipe").await;
    assert_eq!(status, JobStatus::Completed);

    let entities = count(&pool, "SELECT COUNT(*) FROM entities").await;
    let relationships = count(&pool, "SELECT COUNT(*) FROM relationships").await;
    let events = count(&pool, "SELECT COUNT(*) FROM events").await;
    assert_eq!(events, 4);

    // Incremental re-sync fetches nothing past the checkpoint
    let (status, summary) = run_connector(&scheduler, &pool, "script:pipe").await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(summary.events_fetched, 0);

    // A forced full refetch re-processes everything without duplicating
    jobs::reset_checkpoint(&pool, "script:pipe").await.unwrap();
    let (status, summary) = run_connector(&scheduler, &pool, "script:pipe").await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(summary.events_fetched, 4);

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM entities").await, entities);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM relationships").await,
        relationships
    );
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM events").await, events);
}

/// Prove that an event normalization cannot read is dropped without
/// failing the sync, and is never fetched again.
#[tokio::test]
async fn test_corrupt_events_are_dropped_and_not_refetched() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = setup(&tmp).await;
    let events = vec![
        commit("c1", "ana", "Fix parser for #5", 100, vec!["#5"]),
        corrupt("junk", 200),
    ];
    let scheduler = make_scheduler(&cfg, &pool, vec![ScriptedConnector::new("pipe", events)]);

    let (status, summary) = run_connector(&scheduler, &pool, "script:pipe").await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(summary.events_fetched, 2);
    assert_eq!(summary.events_dropped, 1);
    assert_eq!(
        summary.checkpoint, 200,
        "checkpoint must cover the dropped event"
    );
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM events").await, 1);

    let (status, summary) = run_connector(&scheduler, &pool, "script:pipe").await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(summary.events_fetched, 0, "dropped event must stay behind the checkpoint");
}

/// Prove that connectors keep independent checkpoints and event streams.
#[tokio::test]
async fn test_connectors_track_independent_checkpoints() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = setup(&tmp).await;
    let scheduler = make_scheduler(
        &cfg,
        &pool,
        vec![
            ScriptedConnector::new("alpha", vec![commit("a1", "ana", "alpha work", 500, vec![])]),
            ScriptedConnector::new("beta", vec![commit("b1", "ben", "beta work", 900, vec![])]),
        ],
    );

    let (status, _) = run_connector(&scheduler, &pool, "script:alpha").await;
    assert_eq!(status, JobStatus::Completed);
    let (status, _) = run_connector(&scheduler, &pool, "script:beta").await;
    assert_eq!(status, JobStatus::Completed);

    assert_eq!(jobs::get_checkpoint(&pool, "script:alpha").await.unwrap(), 500);
    assert_eq!(jobs::get_checkpoint(&pool, "script:beta").await.unwrap(), 900);

    let alpha_events =
        count(&pool, "SELECT COUNT(*) FROM events WHERE connector_id = 'script:alpha'").await;
    let beta_events =
        count(&pool, "SELECT COUNT(*) FROM events WHERE connector_id = 'script:beta'").await;
    assert_eq!(alpha_events, 1);
    assert_eq!(beta_events, 1);

    // Beta's higher checkpoint must not hide a future alpha event
    let (_, summary) = run_connector(&scheduler, &pool, "script:alpha").await;
    assert_eq!(summary.events_fetched, 0);
}

/// Prove that the context query surfaces what a sync ingested, with
/// payloads attached and related entities one hop out.
#[tokio::test]
async fn test_context_query_surfaces_ingested_knowledge() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = setup(&tmp).await;
    let scheduler = make_scheduler(&cfg, &pool, vec![ScriptedConnector::new("pipe", limiter_script())]);
    run_connector(&scheduler, &pool, "script:pipe").await;

    let bundle = fetch_context(&pool, &cfg.query, "#42").await.unwrap();
    assert!(!bundle.is_empty());

    assert_eq!(bundle.features.len(), 1);
    let (feature, payload) = &bundle.features[0];
    assert_eq!(feature.source_id, "#42");
    let payload = payload.as_ref().expect("feature payload");
    assert!(!payload.source_event_ids.is_empty());

    assert_eq!(bundle.decisions.len(), 1);
    let (_, record) = &bundle.decisions[0];
    assert!(record.as_ref().expect("decision payload").title.contains("cap retries"));

    assert_eq!(bundle.discussions.len(), 1);
    let (_, discussion) = &bundle.discussions[0];
    assert_eq!(
        discussion.as_ref().expect("discussion payload").participants,
        vec!["ana", "ben"]
    );

    assert_eq!(bundle.commits.len(), 2, "both commits reference #42");

    // One hop from the feature reaches the file it touches
    assert!(bundle
        .related
        .iter()
        .any(|e| e.kind == EntityKind::File && e.source_id == "src/limiter.rs"));
}
