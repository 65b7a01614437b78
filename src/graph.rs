//! Knowledge graph store: entities, relationships, typed payloads,
//! traversal and similarity search over SQLite.
//!
//! All writes are upserts keyed by stable source identifiers, so
//! re-ingesting the same range is harmless. Endpoint existence is
//! checked when an edge is written; an edge whose endpoint has since
//! disappeared is pruned during traversal rather than followed.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{
    refs_from_json, refs_to_json, DecisionRecord, DecisionStatus, DiscussionSummary,
    EntityKind, FeatureContext, FileChange, KnowledgeEntity, KnowledgeRelationship, RelationKind,
};

/// One hop along a traversal: the edge taken and the entity reached.
#[derive(Debug, Clone)]
pub struct TraversalHop {
    pub relationship: KnowledgeRelationship,
    pub entity: KnowledgeEntity,
}

/// A path from the start entity to one reachable entity.
#[derive(Debug, Clone)]
pub struct TraversalPath {
    pub start_id: String,
    pub hops: Vec<TraversalHop>,
}

impl TraversalPath {
    pub fn depth(&self) -> usize {
        self.hops.len()
    }

    pub fn terminal(&self) -> Option<&KnowledgeEntity> {
        self.hops.last().map(|hop| &hop.entity)
    }
}

/// Pool-level handle over the graph tables.
///
/// The free functions in this module take a `&mut SqliteConnection` so
/// the processor can compose one transaction per event group; the
/// methods here are convenience wrappers for single operations.
pub struct GraphStore {
    pool: SqlitePool,
}

impl GraphStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_entity(&self, entity: &KnowledgeEntity) -> Result<String> {
        let mut conn = self.pool.acquire().await?;
        upsert_entity(&mut conn, entity).await
    }

    pub async fn upsert_relationship(&self, rel: &KnowledgeRelationship) -> Result<String> {
        let mut conn = self.pool.acquire().await?;
        upsert_relationship(&mut conn, rel).await
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<KnowledgeEntity>> {
        let mut conn = self.pool.acquire().await?;
        get_entity(&mut conn, id).await
    }

    pub async fn find_entity(
        &self,
        kind: EntityKind,
        source_id: &str,
    ) -> Result<Option<KnowledgeEntity>> {
        let mut conn = self.pool.acquire().await?;
        find_entity(&mut conn, kind, source_id).await
    }

    /// All paths reachable from `start_id` within `max_depth` hops,
    /// following only the given edge kinds (all kinds when empty).
    /// Edges are walked in both directions; each entity is reached by
    /// exactly one (shortest) path. Edges pointing at entities that no
    /// longer exist are pruned.
    pub async fn traverse(
        &self,
        start_id: &str,
        kinds: &[RelationKind],
        max_depth: usize,
    ) -> Result<Vec<TraversalPath>> {
        let mut conn = self.pool.acquire().await?;
        traverse(&mut conn, start_id, kinds, max_depth).await
    }

    /// Nearest entities by cosine distance, ascending, at most `k`.
    /// Entities without an embedding are not candidates.
    pub async fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(KnowledgeEntity, f32)>> {
        let rows = sqlx::query(
            "SELECT id, kind, source_id, name, description, metadata_json, embedding, created_at, updated_at
             FROM entities WHERE embedding IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::new();
        for row in &rows {
            let entity = entity_from_row(row)?;
            let candidate = match &entity.embedding {
                Some(v) => v,
                None => continue,
            };
            let distance = 1.0 - cosine_similarity(query, candidate);
            scored.push((entity, distance));
        }

        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    pub async fn get_decision(&self, entity_id: &str) -> Result<Option<DecisionRecord>> {
        let row = sqlx::query(
            "SELECT entity_id, title, rationale, status, decided_at, source_event_ids_json
             FROM decisions WHERE entity_id = ?",
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| DecisionRecord {
            entity_id: row.get("entity_id"),
            title: row.get("title"),
            rationale: row.get("rationale"),
            status: DecisionStatus::parse(row.get::<String, _>("status").as_str())
                .unwrap_or(DecisionStatus::Active),
            decided_at: row.get("decided_at"),
            source_event_ids: refs_from_json(
                row.get::<Option<String>, _>("source_event_ids_json").as_deref(),
            ),
        }))
    }

    pub async fn get_discussion(&self, entity_id: &str) -> Result<Option<DiscussionSummary>> {
        let row = sqlx::query(
            "SELECT entity_id, summary, participants_json, source_event_ids_json
             FROM discussions WHERE entity_id = ?",
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| DiscussionSummary {
            entity_id: row.get("entity_id"),
            summary: row.get("summary"),
            participants: refs_from_json(
                row.get::<Option<String>, _>("participants_json").as_deref(),
            ),
            source_event_ids: refs_from_json(
                row.get::<Option<String>, _>("source_event_ids_json").as_deref(),
            ),
        }))
    }

    pub async fn file_history(&self, entity_id: &str) -> Result<Vec<FileChange>> {
        let rows = sqlx::query(
            "SELECT entity_id, platform_event_id, change_summary, author, changed_at
             FROM file_history WHERE entity_id = ? ORDER BY changed_at DESC, platform_event_id",
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
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
}

// ============ Connection-level operations ============

/// Upsert a node, idempotent by `(kind, source_id)`. Returns the id the
/// graph knows the entity by, which is the existing id on re-ingestion.
pub async fn upsert_entity(conn: &mut SqliteConnection, entity: &KnowledgeEntity) -> Result<String> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM entities WHERE kind = ? AND source_id = ?")
            .bind(entity.kind.as_str())
            .bind(&entity.source_id)
            .fetch_optional(&mut *conn)
            .await?;

    let id = existing.unwrap_or_else(|| entity.id.clone());
    let now = chrono::Utc::now().timestamp();
    let embedding_blob = entity.embedding.as_ref().map(|v| vec_to_blob(v));

    sqlx::query(
        r#"
        INSERT INTO entities (id, kind, source_id, name, description, metadata_json, embedding, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(kind, source_id) DO UPDATE SET
            name = excluded.name,
            description = CASE
                WHEN excluded.description != '' THEN excluded.description
                ELSE entities.description
            END,
            metadata_json = excluded.metadata_json,
            embedding = COALESCE(excluded.embedding, entities.embedding),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&id)
    .bind(entity.kind.as_str())
    .bind(&entity.source_id)
    .bind(&entity.name)
    .bind(&entity.description)
    .bind(entity.metadata.to_string())
    .bind(embedding_blob)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

/// Upsert an edge, idempotent by `(source, target, kind)`. Conflicting
/// strengths keep the maximum. Both endpoints must exist.
pub async fn upsert_relationship(
    conn: &mut SqliteConnection,
    rel: &KnowledgeRelationship,
) -> Result<String> {
    for endpoint in [&rel.source_entity_id, &rel.target_entity_id] {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM entities WHERE id = ?)")
            .bind(endpoint)
            .fetch_one(&mut *conn)
            .await?;
        if !exists {
            return Err(Error::Integrity(format!(
                "relationship endpoint does not exist: {}",
                endpoint
            )));
        }
    }

    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM relationships
         WHERE source_entity_id = ? AND target_entity_id = ? AND kind = ?",
    )
    .bind(&rel.source_entity_id)
    .bind(&rel.target_entity_id)
    .bind(rel.kind.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    let id = existing.unwrap_or_else(|| rel.id.clone());
    let now = chrono::Utc::now().timestamp();
    let strength = rel.strength.clamp(0.0, 1.0);

    sqlx::query(
        r#"
        INSERT INTO relationships (id, source_entity_id, target_entity_id, kind, strength, metadata_json, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_entity_id, target_entity_id, kind) DO UPDATE SET
            strength = MAX(relationships.strength, excluded.strength),
            metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&id)
    .bind(&rel.source_entity_id)
    .bind(&rel.target_entity_id)
    .bind(rel.kind.as_str())
    .bind(strength)
    .bind(rel.metadata.to_string())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

pub async fn get_entity(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<KnowledgeEntity>> {
    let row = sqlx::query(
        "SELECT id, kind, source_id, name, description, metadata_json, embedding, created_at, updated_at
         FROM entities WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(entity_from_row).transpose()
}

pub async fn find_entity(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    source_id: &str,
) -> Result<Option<KnowledgeEntity>> {
    let row = sqlx::query(
        "SELECT id, kind, source_id, name, description, metadata_json, embedding, created_at, updated_at
         FROM entities WHERE kind = ? AND source_id = ?",
    )
    .bind(kind.as_str())
    .bind(source_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(entity_from_row).transpose()
}

pub async fn upsert_decision(conn: &mut SqliteConnection, record: &DecisionRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO decisions (entity_id, title, rationale, status, decided_at, source_event_ids_json)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity_id) DO UPDATE SET
            title = excluded.title,
            rationale = excluded.rationale,
            status = excluded.status,
            decided_at = excluded.decided_at,
            source_event_ids_json = excluded.source_event_ids_json
        "#,
    )
    .bind(&record.entity_id)
    .bind(&record.title)
    .bind(&record.rationale)
    .bind(record.status.as_str())
    .bind(record.decided_at)
    .bind(refs_to_json(&record.source_event_ids))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn upsert_discussion(
    conn: &mut SqliteConnection,
    summary: &DiscussionSummary,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO discussions (entity_id, summary, participants_json, source_event_ids_json)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(entity_id) DO UPDATE SET
            summary = excluded.summary,
            participants_json = excluded.participants_json,
            source_event_ids_json = excluded.source_event_ids_json
        "#,
    )
    .bind(&summary.entity_id)
    .bind(&summary.summary)
    .bind(refs_to_json(&summary.participants))
    .bind(refs_to_json(&summary.source_event_ids))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn upsert_feature(conn: &mut SqliteConnection, context: &FeatureContext) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO features (entity_id, summary, source_event_ids_json)
        VALUES (?, ?, ?)
        ON CONFLICT(entity_id) DO UPDATE SET
            summary = excluded.summary,
            source_event_ids_json = excluded.source_event_ids_json
        "#,
    )
    .bind(&context.entity_id)
    .bind(&context.summary)
    .bind(refs_to_json(&context.source_event_ids))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Record one file change. Keyed by `(entity_id, platform_event_id)`,
/// so replaying an event updates rather than duplicates.
pub async fn record_file_change(conn: &mut SqliteConnection, change: &FileChange) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO file_history (id, entity_id, platform_event_id, change_summary, author, changed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity_id, platform_event_id) DO UPDATE SET
            change_summary = excluded.change_summary,
            author = excluded.author,
            changed_at = excluded.changed_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&change.entity_id)
    .bind(&change.platform_event_id)
    .bind(&change.change_summary)
    .bind(&change.author)
    .bind(change.changed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn traverse(
    conn: &mut SqliteConnection,
    start_id: &str,
    kinds: &[RelationKind],
    max_depth: usize,
) -> Result<Vec<TraversalPath>> {
    if get_entity(&mut *conn, start_id).await?.is_none() {
        return Ok(Vec::new());
    }

    let kind_filter: HashSet<&str> = kinds.iter().map(|k| k.as_str()).collect();

    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(start_id.to_string());

    // Shortest path to each visited entity
    let mut paths: HashMap<String, Vec<TraversalHop>> = HashMap::new();
    let mut frontier: Vec<String> = vec![start_id.to_string()];
    let mut results: Vec<TraversalPath> = Vec::new();

    for _ in 0..max_depth {
        let mut next_frontier = Vec::new();

        for node_id in &frontier {
            let rows = sqlx::query(
                "SELECT id, source_entity_id, target_entity_id, kind, strength, metadata_json
                 FROM relationships
                 WHERE source_entity_id = ? OR target_entity_id = ?
                 ORDER BY kind, id",
            )
            .bind(node_id)
            .bind(node_id)
            .fetch_all(&mut *conn)
            .await?;

            for row in &rows {
                let kind_str: String = row.get("kind");
                if !kind_filter.is_empty() && !kind_filter.contains(kind_str.as_str()) {
                    continue;
                }
                let kind = match RelationKind::parse(&kind_str) {
                    Some(k) => k,
                    None => continue,
                };

                let source: String = row.get("source_entity_id");
                let target: String = row.get("target_entity_id");
                let neighbor_id = if source == *node_id { target } else { source };

                if visited.contains(&neighbor_id) {
                    continue;
                }

                // Prune edges whose far end no longer exists
                let neighbor = match get_entity(&mut *conn, &neighbor_id).await? {
                    Some(entity) => entity,
                    None => {
                        tracing::debug!(edge = %row.get::<String, _>("id"), "pruning dangling edge");
                        continue;
                    }
                };

                visited.insert(neighbor_id.clone());

                let relationship = KnowledgeRelationship {
                    id: row.get("id"),
                    source_entity_id: row.get("source_entity_id"),
                    target_entity_id: row.get("target_entity_id"),
                    kind,
                    strength: row.get("strength"),
                    metadata: serde_json::from_str(&row.get::<String, _>("metadata_json"))
                        .unwrap_or(serde_json::Value::Null),
                };

                let mut path = paths.get(node_id).cloned().unwrap_or_default();
                path.push(TraversalHop {
                    relationship,
                    entity: neighbor,
                });
                paths.insert(neighbor_id.clone(), path.clone());

                results.push(TraversalPath {
                    start_id: start_id.to_string(),
                    hops: path,
                });
                next_frontier.push(neighbor_id);
            }
        }

        if next_frontier.is_empty() {
            break;
        }
        frontier = next_frontier;
    }

    Ok(results)
}

pub(crate) fn entity_from_row(row: &SqliteRow) -> Result<KnowledgeEntity> {
    let kind_str: String = row.get("kind");
    let kind = EntityKind::parse(&kind_str)
        .ok_or_else(|| Error::Integrity(format!("unknown entity kind in store: {}", kind_str)))?;

    let embedding: Option<Vec<u8>> = row.get("embedding");

    Ok(KnowledgeEntity {
        id: row.get("id"),
        kind,
        source_id: row.get("source_id"),
        name: row.get("name"),
        description: row.get("description"),
        metadata: serde_json::from_str(&row.get::<String, _>("metadata_json"))
            .unwrap_or(serde_json::Value::Null),
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
