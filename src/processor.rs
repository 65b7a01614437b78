//! Context processor: turns normalized events into knowledge artifacts.
//!
//! Events are grouped by conversation thread, then feature ref, then
//! file ref; each group is handed to the extraction backend and its
//! artifacts are persisted in a single transaction. One group failing
//! never aborts the batch: the group is logged and skipped, and the
//! outcome reports a checkpoint that stops short of the failed range so
//! the next run re-fetches it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::EmbeddingConfig;
use crate::embedding::{self, vec_to_blob, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::extract::{EntityRef, EventGroup, Extraction, Extractor};
use crate::graph;
use crate::models::{
    refs_to_json, DecisionRecord, DecisionStatus, DiscussionSummary, EntityKind, FeatureContext,
    FileChange, KnowledgeEntity, KnowledgeRelationship, NormalizedEvent, RelationKind,
};

/// What one batch did, and how far the checkpoint may advance.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub events_total: usize,
    pub groups_total: usize,
    pub groups_failed: usize,
    pub entities_written: usize,
    pub relationships_written: usize,
    /// Highest event timestamp the checkpoint may advance to. None when
    /// the batch was empty.
    pub safe_checkpoint: Option<i64>,
}

pub struct Processor {
    pool: SqlitePool,
    extractor: Arc<dyn Extractor>,
    embedding: EmbeddingConfig,
    extraction_timeout: Duration,
}

impl Processor {
    pub fn new(
        pool: SqlitePool,
        extractor: Arc<dyn Extractor>,
        embedding: EmbeddingConfig,
        extraction_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            extractor,
            embedding,
            extraction_timeout,
        }
    }

    /// Group, extract, and persist one batch of events.
    pub async fn process_batch(&self, events: &[NormalizedEvent]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome {
            events_total: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            return Ok(outcome);
        }

        let groups = group_events(events);
        outcome.groups_total = groups.len();

        let batch_max_ts = events.iter().map(|e| e.timestamp.timestamp()).max();
        let mut failed_min_ts: Option<i64> = None;
        let mut touched: Vec<(String, String)> = Vec::new();

        for group in &groups {
            let extracted = match tokio::time::timeout(
                self.extraction_timeout,
                self.extractor.extract(group),
            )
            .await
            {
                Ok(Ok(extraction)) => extraction,
                Ok(Err(err)) => {
                    tracing::warn!(group = %group.key, error = %err, "extraction failed; skipping group");
                    outcome.groups_failed += 1;
                    note_failure(&mut failed_min_ts, group);
                    continue;
                }
                Err(_) => {
                    tracing::warn!(
                        group = %group.key,
                        timeout_secs = self.extraction_timeout.as_secs(),
                        "extraction timed out; skipping group"
                    );
                    outcome.groups_failed += 1;
                    note_failure(&mut failed_min_ts, group);
                    continue;
                }
            };

            match self.persist_group(group, &extracted).await {
                Ok(written) => {
                    outcome.entities_written += written.entities;
                    outcome.relationships_written += written.relationships;
                    touched.extend(written.embeddable);
                }
                Err(err) => {
                    tracing::warn!(group = %group.key, error = %err, "persist failed; group rolled back");
                    outcome.groups_failed += 1;
                    note_failure(&mut failed_min_ts, group);
                }
            }
        }

        // A failed group pins the checkpoint just before its earliest
        // event so the next run re-fetches that range.
        outcome.safe_checkpoint = match failed_min_ts {
            Some(ts) => Some(ts - 1),
            None => batch_max_ts,
        };

        if !touched.is_empty() && self.embedding.is_enabled() {
            self.embed_entities(&touched).await;
        }

        tracing::info!(
            events = outcome.events_total,
            groups = outcome.groups_total,
            failed = outcome.groups_failed,
            entities = outcome.entities_written,
            relationships = outcome.relationships_written,
            "processed batch"
        );

        Ok(outcome)
    }

    /// Persist one group's artifacts atomically.
    async fn persist_group(&self, group: &EventGroup, extracted: &Extraction) -> Result<Written> {
        let mut tx = self.pool.begin().await?;
        let mut written = Written::default();
        let mut ids: BTreeMap<EntityRef, String> = BTreeMap::new();

        for feature in &extracted.features {
            let entity_ref = EntityRef {
                kind: EntityKind::Feature,
                source_id: feature.source_id.clone(),
            };
            let id = graph::upsert_entity(
                &mut tx,
                &new_entity(
                    EntityKind::Feature,
                    &feature.source_id,
                    &feature.source_id,
                    &feature.summary,
                ),
            )
            .await?;
            graph::upsert_feature(
                &mut tx,
                &FeatureContext {
                    entity_id: id.clone(),
                    summary: feature.summary.clone(),
                    source_event_ids: feature.source_event_ids.clone(),
                },
            )
            .await?;
            written.entities += 1;
            written
                .embeddable
                .push((id.clone(), format!("{}: {}", feature.source_id, feature.summary)));
            ids.insert(entity_ref, id);
        }

        for change in &extracted.file_changes {
            let entity_ref = EntityRef {
                kind: EntityKind::File,
                source_id: change.path.clone(),
            };
            let id = match ids.get(&entity_ref) {
                Some(id) => id.clone(),
                None => {
                    let id = graph::upsert_entity(
                        &mut tx,
                        &new_entity(EntityKind::File, &change.path, &change.path, ""),
                    )
                    .await?;
                    written.entities += 1;
                    ids.insert(entity_ref, id.clone());
                    id
                }
            };
            graph::record_file_change(
                &mut tx,
                &FileChange {
                    entity_id: id,
                    platform_event_id: change.platform_event_id.clone(),
                    change_summary: change.change_summary.clone(),
                    author: change.author.clone(),
                    changed_at: change.changed_at,
                },
            )
            .await?;
        }

        for contributor in &extracted.contributors {
            let entity_ref = EntityRef {
                kind: EntityKind::Contributor,
                source_id: contributor.clone(),
            };
            let id = graph::upsert_entity(
                &mut tx,
                &new_entity(EntityKind::Contributor, contributor, contributor, ""),
            )
            .await?;
            written.entities += 1;
            ids.insert(entity_ref, id);
        }

        let discussion_ref = if let Some(discussion) = &extracted.discussion {
            let entity_ref = EntityRef {
                kind: EntityKind::Discussion,
                source_id: group.key.clone(),
            };
            let name = truncate_chars(&discussion.summary, 80);
            let id = graph::upsert_entity(
                &mut tx,
                &new_entity(
                    EntityKind::Discussion,
                    &group.key,
                    &name,
                    &discussion.summary,
                ),
            )
            .await?;
            graph::upsert_discussion(
                &mut tx,
                &DiscussionSummary {
                    entity_id: id.clone(),
                    summary: discussion.summary.clone(),
                    participants: discussion.participants.clone(),
                    source_event_ids: discussion.source_event_ids.clone(),
                },
            )
            .await?;
            written.entities += 1;
            written
                .embeddable
                .push((id.clone(), discussion.summary.clone()));
            ids.insert(entity_ref.clone(), id);
            Some(entity_ref)
        } else {
            None
        };

        for decision in &extracted.decisions {
            let source_id = crate::extract::short_hash(&format!("{}|{}", group.key, decision.title));
            let entity_ref = EntityRef {
                kind: EntityKind::Decision,
                source_id: source_id.clone(),
            };
            let id = graph::upsert_entity(
                &mut tx,
                &new_entity(
                    EntityKind::Decision,
                    &source_id,
                    &decision.title,
                    &decision.rationale,
                ),
            )
            .await?;
            graph::upsert_decision(
                &mut tx,
                &DecisionRecord {
                    entity_id: id.clone(),
                    title: decision.title.clone(),
                    rationale: decision.rationale.clone(),
                    status: DecisionStatus::Active,
                    decided_at: decision.decided_at,
                    source_event_ids: decision.source_event_ids.clone(),
                },
            )
            .await?;
            written.entities += 1;
            written
                .embeddable
                .push((id.clone(), format!("{}: {}", decision.title, decision.rationale)));
            ids.insert(entity_ref.clone(), id);

            // Wire the decision into its surroundings
            if let Some(discussion) = &discussion_ref {
                self.link(&mut tx, &mut written, &ids, &entity_ref, discussion, RelationKind::DiscussedIn, 0.9)
                    .await?;
            }
            for feature in &extracted.features {
                let feature_ref = EntityRef {
                    kind: EntityKind::Feature,
                    source_id: feature.source_id.clone(),
                };
                self.link(&mut tx, &mut written, &ids, &entity_ref, &feature_ref, RelationKind::RelatesTo, 0.7)
                    .await?;
            }
        }

        for rel in &extracted.relationships {
            self.link(&mut tx, &mut written, &ids, &rel.source, &rel.target, rel.kind, rel.strength)
                .await?;
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn link(
        &self,
        tx: &mut sqlx::SqliteConnection,
        written: &mut Written,
        ids: &BTreeMap<EntityRef, String>,
        source: &EntityRef,
        target: &EntityRef,
        kind: RelationKind,
        strength: f64,
    ) -> Result<()> {
        let (source_id, target_id) = match (ids.get(source), ids.get(target)) {
            (Some(s), Some(t)) => (s.clone(), t.clone()),
            _ => {
                tracing::warn!(
                    source = %source.source_id,
                    target = %target.source_id,
                    kind = %kind,
                    "dropping relationship with unresolved endpoint"
                );
                return Ok(());
            }
        };

        graph::upsert_relationship(
            tx,
            &KnowledgeRelationship {
                id: Uuid::new_v4().to_string(),
                source_entity_id: source_id,
                target_entity_id: target_id,
                kind,
                strength,
                metadata: serde_json::json!({}),
            },
        )
        .await?;
        written.relationships += 1;
        Ok(())
    }

    /// Best effort: an embedding failure is logged and the batch result
    /// is unaffected.
    async fn embed_entities(&self, touched: &[(String, String)]) {
        let provider = match embedding::create_provider(&self.embedding) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(error = %err, "embedding provider unavailable");
                return;
            }
        };

        let texts: Vec<String> = touched.iter().map(|(_, text)| text.clone()).collect();
        let vectors = match provider.embed(&texts).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "embedding batch failed");
                return;
            }
        };

        for ((id, _), vector) in touched.iter().zip(vectors.iter()) {
            let result = sqlx::query("UPDATE entities SET embedding = ? WHERE id = ?")
                .bind(vec_to_blob(vector))
                .bind(id)
                .execute(&self.pool)
                .await;
            if let Err(err) = result {
                tracing::warn!(entity = %id, error = %err, "failed to store embedding");
            }
        }
    }
}

#[derive(Default)]
struct Written {
    entities: usize,
    relationships: usize,
    embeddable: Vec<(String, String)>,
}

fn note_failure(failed_min_ts: &mut Option<i64>, group: &EventGroup) {
    let group_min = group.events.iter().map(|e| e.timestamp.timestamp()).min();
    if let Some(ts) = group_min {
        *failed_min_ts = Some(match failed_min_ts {
            Some(existing) => (*existing).min(ts),
            None => ts,
        });
    }
}

fn new_entity(kind: EntityKind, source_id: &str, name: &str, description: &str) -> KnowledgeEntity {
    KnowledgeEntity {
        id: Uuid::new_v4().to_string(),
        kind,
        source_id: source_id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        metadata: serde_json::json!({}),
        embedding: None,
        created_at: 0,
        updated_at: 0,
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Group events by thread, then feature ref, then file ref; events with
/// none of those stand alone. Groups come back ordered by their earliest
/// event timestamp so processing is deterministic.
pub fn group_events(events: &[NormalizedEvent]) -> Vec<EventGroup> {
    let mut grouped: BTreeMap<String, Vec<NormalizedEvent>> = BTreeMap::new();

    for event in events {
        let key = group_key(event);
        grouped.entry(key).or_default().push(event.clone());
    }

    let mut groups: Vec<EventGroup> = grouped
        .into_iter()
        .map(|(key, mut events)| {
            events.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.platform_id.cmp(&b.platform_id))
            });
            EventGroup { key, events }
        })
        .collect();

    groups.sort_by_key(|group| {
        (
            group
                .events
                .first()
                .map(|e| e.timestamp.timestamp())
                .unwrap_or(0),
            group.key.clone(),
        )
    });

    groups
}

fn group_key(event: &NormalizedEvent) -> String {
    if let Some(thread_id) = &event.thread_id {
        return format!("thread:{}:{}", event.connector, thread_id);
    }
    if let Some(feature_ref) = event.feature_refs.first() {
        return format!("feature:{}", feature_ref);
    }
    if let Some(path) = event.file_refs.first() {
        return format!("file:{}", path);
    }
    format!("event:{}", event.platform_id)
}

/// Persist normalized events, upserting by `(connector, platform_id)`
/// so refetched ranges overwrite instead of duplicating. Returns how
/// many rows were written.
pub async fn store_events(pool: &SqlitePool, events: &[NormalizedEvent]) -> Result<usize> {
    for event in events {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM events WHERE connector_id = ? AND platform_id = ?")
                .bind(&event.connector)
                .bind(&event.platform_id)
                .fetch_optional(pool)
                .await?;
        let id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

        sqlx::query(
            r#"
            INSERT INTO events (id, connector_id, platform_id, event_kind, timestamp, author, content,
                                thread_id, parent_id, file_refs_json, feature_refs_json, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connector_id, platform_id) DO UPDATE SET
                event_kind = excluded.event_kind,
                timestamp = excluded.timestamp,
                author = excluded.author,
                content = excluded.content,
                thread_id = excluded.thread_id,
                parent_id = excluded.parent_id,
                file_refs_json = excluded.file_refs_json,
                feature_refs_json = excluded.feature_refs_json,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(&id)
        .bind(&event.connector)
        .bind(&event.platform_id)
        .bind(event.event_kind.as_str())
        .bind(event.timestamp.timestamp())
        .bind(&event.author)
        .bind(&event.content)
        .bind(&event.thread_id)
        .bind(&event.parent_id)
        .bind(refs_to_json(&event.file_refs))
        .bind(refs_to_json(&event.feature_refs))
        .bind(event.metadata.to_string())
        .execute(pool)
        .await?;
    }
    Ok(events.len())
}
