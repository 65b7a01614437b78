//! Context queries: bounded, newest-first slices of the event log and
//! knowledge graph around a topic.
//!
//! Every category in the bundle is capped by `query.max_per_category`
//! (commits get twice that, they are the noisiest stream), so the
//! response size is bounded no matter how much history has been
//! ingested.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::{Config, QueryConfig};
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::graph::{self, GraphStore};
use crate::models::{
    refs_from_json, DecisionRecord, DiscussionSummary, EntityKind, EventKind, FeatureContext,
    FileChange, KnowledgeEntity, NormalizedEvent,
};

/// Everything the graph knows around one topic, bounded per category.
#[derive(Debug, Default)]
pub struct ContextBundle {
    pub topic: String,
    pub features: Vec<(KnowledgeEntity, Option<FeatureContext>)>,
    pub decisions: Vec<(KnowledgeEntity, Option<DecisionRecord>)>,
    pub discussions: Vec<(KnowledgeEntity, Option<DiscussionSummary>)>,
    pub file_changes: Vec<FileChange>,
    pub pull_requests: Vec<NormalizedEvent>,
    pub issues: Vec<NormalizedEvent>,
    pub commits: Vec<NormalizedEvent>,
    /// Entities one hop from the matched features and decisions.
    pub related: Vec<KnowledgeEntity>,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
            && self.decisions.is_empty()
            && self.discussions.is_empty()
            && self.file_changes.is_empty()
            && self.pull_requests.is_empty()
            && self.issues.is_empty()
            && self.commits.is_empty()
            && self.related.is_empty()
    }
}

/// Assemble the context bundle for a topic: feature refs, file paths,
/// decision titles, and free text all match by substring.
pub async fn fetch_context(
    pool: &SqlitePool,
    config: &QueryConfig,
    topic: &str,
) -> Result<ContextBundle> {
    let cap = config.max_per_category;
    let pattern = format!("%{}%", topic);

    let mut bundle = ContextBundle {
        topic: topic.to_string(),
        ..Default::default()
    };

    let features = matching_entities(pool, EntityKind::Feature, &pattern, cap).await?;
    for entity in features {
        let payload = fetch_feature(pool, &entity.id).await?;
        bundle.features.push((entity, payload));
    }

    let decisions = matching_entities(pool, EntityKind::Decision, &pattern, cap).await?;
    for entity in decisions {
        let payload = fetch_decision(pool, &entity.id).await?;
        bundle.decisions.push((entity, payload));
    }

    let discussions = matching_entities(pool, EntityKind::Discussion, &pattern, cap).await?;
    for entity in discussions {
        let payload = fetch_discussion(pool, &entity.id).await?;
        bundle.discussions.push((entity, payload));
    }

    bundle.file_changes = matching_file_changes(pool, &pattern, cap).await?;
    bundle.pull_requests = matching_events(pool, EventKind::PullRequest, &pattern, cap).await?;
    bundle.issues = matching_events(pool, EventKind::Issue, &pattern, cap).await?;
    bundle.commits = matching_events(pool, EventKind::Commit, &pattern, cap * 2).await?;

    // One-hop expansion from the strongest anchors, minus anything the
    // bundle already carries.
    let mut seen: Vec<String> = bundle
        .features
        .iter()
        .map(|(e, _)| e.id.clone())
        .chain(bundle.decisions.iter().map(|(e, _)| e.id.clone()))
        .chain(bundle.discussions.iter().map(|(e, _)| e.id.clone()))
        .collect();

    let anchors: Vec<String> = seen.clone();
    let store = GraphStore::new(pool.clone());
    for anchor in &anchors {
        for path in store.traverse(anchor, &[], 1).await? {
            if let Some(entity) = path.terminal() {
                if !seen.contains(&entity.id) {
                    seen.push(entity.id.clone());
                    bundle.related.push(entity.clone());
                    if bundle.related.len() as i64 >= cap {
                        return Ok(bundle);
                    }
                }
            }
        }
    }

    Ok(bundle)
}

/// Nearest entities to a free-text query by embedding distance.
pub async fn fetch_similar(
    pool: &SqlitePool,
    config: &Config,
    text: &str,
    k: usize,
) -> anyhow::Result<Vec<(KnowledgeEntity, f32)>> {
    let provider = embedding::create_provider(&config.embedding)?;
    let query_vec = provider.embed_one(text).await?;

    let store = GraphStore::new(pool.clone());
    Ok(store.similarity_search(&query_vec, k).await?)
}

async fn matching_entities(
    pool: &SqlitePool,
    kind: EntityKind,
    pattern: &str,
    cap: i64,
) -> Result<Vec<KnowledgeEntity>> {
    let rows = sqlx::query(
        r#"
        SELECT id, kind, source_id, name, description, metadata_json, embedding, created_at, updated_at
        FROM entities
        WHERE kind = ? AND (source_id LIKE ? OR name LIKE ? OR description LIKE ?)
        ORDER BY updated_at DESC, id
        LIMIT ?
        "#,
    )
    .bind(kind.as_str())
    .bind(pattern)
    .bind(pattern)
    .bind(pattern)
    .bind(cap)
    .fetch_all(pool)
    .await?;

    rows.iter().map(graph::entity_from_row).collect()
}

/// Most recent changes to files whose path matches, newest first.
async fn matching_file_changes(
    pool: &SqlitePool,
    pattern: &str,
    cap: i64,
) -> Result<Vec<FileChange>> {
    let rows = sqlx::query(
        r#"
        SELECT fh.entity_id, fh.platform_event_id, fh.change_summary, fh.author, fh.changed_at
        FROM file_history fh
        JOIN entities e ON e.id = fh.entity_id
        WHERE e.kind = 'file' AND e.name LIKE ?
        ORDER BY fh.changed_at DESC, fh.platform_event_id
        LIMIT ?
        "#,
    )
    .bind(pattern)
    .bind(cap)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| FileChange {
            entity_id: row.get("entity_id"),
            platform_event_id: row.get("platform_event_id"),
            change_summary: row.get("change_summary"),
            author: row.get("author"),
            changed_at: row.get("changed_at"),
        })
        .collect())
}

/// Events of one kind touching the topic, by text or by file/feature refs.
async fn matching_events(
    pool: &SqlitePool,
    kind: EventKind,
    pattern: &str,
    cap: i64,
) -> Result<Vec<NormalizedEvent>> {
    let rows = sqlx::query(
        r#"
        SELECT platform_id, connector_id, event_kind, timestamp, author, content,
               thread_id, parent_id, file_refs_json, feature_refs_json, metadata_json
        FROM events
        WHERE event_kind = ?
          AND (content LIKE ? OR file_refs_json LIKE ? OR feature_refs_json LIKE ?)
        ORDER BY timestamp DESC, platform_id
        LIMIT ?
        "#,
    )
    .bind(kind.as_str())
    .bind(pattern)
    .bind(pattern)
    .bind(pattern)
    .bind(cap)
    .fetch_all(pool)
    .await?;

    rows.iter().map(event_from_row).collect()
}

fn event_from_row(row: &SqliteRow) -> Result<NormalizedEvent> {
    let kind_str: String = row.get("event_kind");
    let event_kind = EventKind::parse(&kind_str)
        .ok_or_else(|| Error::Integrity(format!("unknown event kind '{}'", kind_str)))?;
    let ts: i64 = row.get("timestamp");
    let timestamp = chrono::DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| Error::Integrity(format!("event timestamp {} out of range", ts)))?;
    let file_refs_json: String = row.get("file_refs_json");
    let feature_refs_json: String = row.get("feature_refs_json");
    let metadata_json: String = row.get("metadata_json");

    Ok(NormalizedEvent {
        platform_id: row.get("platform_id"),
        connector: row.get("connector_id"),
        event_kind,
        timestamp,
        author: row.get("author"),
        content: row.get("content"),
        thread_id: row.get("thread_id"),
        parent_id: row.get("parent_id"),
        file_refs: refs_from_json(Some(&file_refs_json)),
        feature_refs: refs_from_json(Some(&feature_refs_json)),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
    })
}

async fn fetch_decision(pool: &SqlitePool, entity_id: &str) -> Result<Option<DecisionRecord>> {
    let store = GraphStore::new(pool.clone());
    store.get_decision(entity_id).await
}

async fn fetch_discussion(pool: &SqlitePool, entity_id: &str) -> Result<Option<DiscussionSummary>> {
    let store = GraphStore::new(pool.clone());
    store.get_discussion(entity_id).await
}

async fn fetch_feature(pool: &SqlitePool, entity_id: &str) -> Result<Option<FeatureContext>> {
    let rows = sqlx::query(
        "SELECT entity_id, summary, source_event_ids_json FROM features WHERE entity_id = ?",
    )
    .bind(entity_id)
    .fetch_optional(pool)
    .await?;

    Ok(rows.map(|row| {
        let ids_json: String = row.get("source_event_ids_json");
        FeatureContext {
            entity_id: row.get("entity_id"),
            summary: row.get("summary"),
            source_event_ids: refs_from_json(Some(&ids_json)),
        }
    }))
}

// ============ CLI commands ============

/// Run the query command: assemble a context bundle and print it.
pub async fn run_query(config: &Config, topic: &str) -> anyhow::Result<()> {
    if topic.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let bundle = fetch_context(&pool, &config.query, topic).await?;

    if bundle.is_empty() {
        println!("No context found for '{}'.", topic);
        pool.close().await;
        return Ok(());
    }

    println!("Context for '{}'", topic);
    println!();

    if !bundle.decisions.is_empty() {
        println!("Decisions:");
        for (entity, payload) in &bundle.decisions {
            match payload {
                Some(d) => println!("  - {} [{}]", d.title, d.status),
                None => println!("  - {}", entity.name),
            }
            if !entity.description.is_empty() {
                println!("      {}", first_line(&entity.description));
            }
        }
        println!();
    }

    if !bundle.features.is_empty() {
        println!("Features:");
        for (entity, payload) in &bundle.features {
            let summary = payload
                .as_ref()
                .map(|f| f.summary.clone())
                .unwrap_or_else(|| entity.description.clone());
            println!("  - {}  {}", entity.name, first_line(&summary));
        }
        println!();
    }

    if !bundle.discussions.is_empty() {
        println!("Discussions:");
        for (entity, payload) in &bundle.discussions {
            match payload {
                Some(d) => println!(
                    "  - {} ({} participants)",
                    first_line(&d.summary),
                    d.participants.len()
                ),
                None => println!("  - {}", entity.name),
            }
        }
        println!();
    }

    if !bundle.file_changes.is_empty() {
        println!("File changes:");
        for change in &bundle.file_changes {
            let date = format_date(change.changed_at);
            let author = change.author.as_deref().unwrap_or("(unknown)");
            println!("  - {} {} {}", date, author, first_line(&change.change_summary));
        }
        println!();
    }

    if !bundle.pull_requests.is_empty() {
        println!("Pull requests:");
        for pr in &bundle.pull_requests {
            let date = format_date(pr.timestamp.timestamp());
            let author = pr.author.as_deref().unwrap_or("(unknown)");
            println!("  - {} {} {}", date, author, first_line(&pr.content));
        }
        println!();
    }

    if !bundle.issues.is_empty() {
        println!("Issues:");
        for issue in &bundle.issues {
            let date = format_date(issue.timestamp.timestamp());
            let author = issue.author.as_deref().unwrap_or("(unknown)");
            println!("  - {} {} {}", date, author, first_line(&issue.content));
        }
        println!();
    }

    if !bundle.commits.is_empty() {
        println!("Commits:");
        for commit in &bundle.commits {
            let date = format_date(commit.timestamp.timestamp());
            let author = commit.author.as_deref().unwrap_or("(unknown)");
            println!("  - {} {} {}", date, author, first_line(&commit.content));
        }
        println!();
    }

    if !bundle.related.is_empty() {
        println!("Related:");
        for entity in &bundle.related {
            println!("  - [{}] {}", entity.kind, entity.name);
        }
        println!();
    }

    pool.close().await;
    Ok(())
}

/// Run the search command: embed the query and print nearest entities.
pub async fn run_search(config: &Config, text: &str, limit: Option<usize>) -> anyhow::Result<()> {
    if text.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        anyhow::bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let pool = db::connect(config).await?;
    let k = limit.unwrap_or(config.query.max_per_category as usize);
    let results = fetch_similar(&pool, config, text, k).await?;

    if results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, (entity, distance)) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] [{}] {}",
            i + 1,
            distance,
            entity.kind,
            entity.name
        );
        if !entity.description.is_empty() {
            println!("    {}", first_line(&entity.description));
        }
        println!("    id: {}", entity.id);
        println!();
    }

    pool.close().await;
    Ok(())
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > 100 {
        let truncated: String = line.chars().take(100).collect();
        format!("{}…", truncated)
    } else {
        line.to_string()
    }
}

fn format_date(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}
