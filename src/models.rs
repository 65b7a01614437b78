//! Core data types that flow through the ingestion and graph pipeline.
//!
//! `PlatformEvent` is the raw, platform-native shape a connector fetches;
//! `NormalizedEvent` is the one shape everything downstream understands.
//! Knowledge types (`KnowledgeEntity`, `KnowledgeRelationship`, projections)
//! are owned by the graph store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw event as fetched from a platform API. Immutable once fetched.
#[derive(Debug, Clone)]
pub struct PlatformEvent {
    /// Platform-native identifier (commit SHA, message ts, issue number).
    pub id: String,
    /// Platform-native event kind label.
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub author: Option<String>,
    pub content: String,
    /// Untouched platform payload fields worth keeping.
    pub metadata: serde_json::Value,
    /// Raw references to other platform objects (issue numbers, file paths).
    pub references: Vec<String>,
}

/// Event kinds the pipeline understands after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Commit,
    PullRequest,
    Issue,
    Message,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Commit => "commit",
            EventKind::PullRequest => "pull_request",
            EventKind::Issue => "issue",
            EventKind::Message => "message",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "commit" => Some(EventKind::Commit),
            "pull_request" => Some(EventKind::PullRequest),
            "issue" => Some(EventKind::Issue),
            "message" => Some(EventKind::Message),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform event after normalization. Produced once per `PlatformEvent`,
/// never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Globally unique id: `{connector}:{kind}:{platform id}`.
    pub platform_id: String,
    /// Connector label this event came from, e.g. `github:platform`.
    pub connector: String,
    pub event_kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub author: Option<String>,
    pub content: String,
    /// Conversation thread this event belongs to, when the platform has one.
    pub thread_id: Option<String>,
    /// Direct parent within the thread (reply-to), when known.
    pub parent_id: Option<String>,
    /// Repository file paths this event touches or mentions.
    pub file_refs: Vec<String>,
    /// Feature identifiers (issue/PR numbers, ticket keys) this event
    /// touches or mentions.
    pub feature_refs: Vec<String>,
    pub metadata: serde_json::Value,
}

/// Sync job status. One active job per connector at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "partial" => Some(JobStatus::Partial),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Partial | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sync run for one connector.
#[derive(Debug, Clone)]
pub struct IngestionJob {
    pub id: String,
    pub connector_id: String,
    pub status: JobStatus,
    /// Unix seconds of the last fully processed event at job creation;
    /// updated to the advanced value on completion.
    pub checkpoint: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub error_message: Option<String>,
    /// Unix seconds after which a running job may be reclaimed.
    pub lease_expires_at: Option<i64>,
}

/// Node kinds in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Feature,
    File,
    Decision,
    Discussion,
    Contributor,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Feature => "feature",
            EntityKind::File => "file",
            EntityKind::Decision => "decision",
            EntityKind::Discussion => "discussion",
            EntityKind::Contributor => "contributor",
        }
    }

    pub fn parse(s: &str) -> Option<EntityKind> {
        match s {
            "feature" => Some(EntityKind::Feature),
            "file" => Some(EntityKind::File),
            "decision" => Some(EntityKind::Decision),
            "discussion" => Some(EntityKind::Discussion),
            "contributor" => Some(EntityKind::Contributor),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, addressable node in the knowledge graph.
///
/// `(kind, source_id)` is unique: re-ingesting the same platform object
/// updates the existing row instead of materializing a duplicate.
#[derive(Debug, Clone)]
pub struct KnowledgeEntity {
    pub id: String,
    pub kind: EntityKind,
    /// Stable identifier of the originating platform object.
    pub source_id: String,
    pub name: String,
    pub description: String,
    pub metadata: serde_json::Value,
    /// Opaque fixed-length vector; distance function is cosine.
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Edge kinds in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    RelatesTo,
    IntroducedBy,
    ModifiedBy,
    DiscussedIn,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::RelatesTo => "relates_to",
            RelationKind::IntroducedBy => "introduced_by",
            RelationKind::ModifiedBy => "modified_by",
            RelationKind::DiscussedIn => "discussed_in",
        }
    }

    pub fn parse(s: &str) -> Option<RelationKind> {
        match s {
            "relates_to" => Some(RelationKind::RelatesTo),
            "introduced_by" => Some(RelationKind::IntroducedBy),
            "modified_by" => Some(RelationKind::ModifiedBy),
            "discussed_in" => Some(RelationKind::DiscussedIn),
            _ => None,
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, weighted edge between two knowledge entities.
///
/// Unique on `(source, target, kind)`; re-extraction keeps the maximum
/// strength rather than duplicating the edge.
#[derive(Debug, Clone)]
pub struct KnowledgeRelationship {
    pub id: String,
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub kind: RelationKind,
    /// Caller-supplied confidence in [0, 1]. No decay logic is applied.
    pub strength: f64,
    pub metadata: serde_json::Value,
}

/// Decision lifecycle. Decisions are superseded, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Active,
    Superseded,
    Deprecated,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Active => "active",
            DecisionStatus::Superseded => "superseded",
            DecisionStatus::Deprecated => "deprecated",
        }
    }

    pub fn parse(s: &str) -> Option<DecisionStatus> {
        match s {
            "active" => Some(DecisionStatus::Active),
            "superseded" => Some(DecisionStatus::Superseded),
            "deprecated" => Some(DecisionStatus::Deprecated),
            _ => None,
        }
    }
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed projection attached 1:1 to a `decision` entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub entity_id: String,
    pub title: String,
    pub rationale: String,
    pub status: DecisionStatus,
    pub decided_at: i64,
    /// Provenance back to the normalized events that produced this record.
    pub source_event_ids: Vec<String>,
}

/// Typed projection attached 1:1 to a `discussion` entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionSummary {
    pub entity_id: String,
    pub summary: String,
    pub participants: Vec<String>,
    pub source_event_ids: Vec<String>,
}

/// Typed projection attached 1:1 to a `feature` entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureContext {
    pub entity_id: String,
    pub summary: String,
    pub source_event_ids: Vec<String>,
}

/// One change entry in a `file` entity's history. Keyed by
/// `(entity_id, platform_event_id)` so re-derivation is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub entity_id: String,
    pub platform_event_id: String,
    pub change_summary: String,
    pub author: Option<String>,
    pub changed_at: i64,
}

/// Encode a string sequence for a JSON text column.
///
/// Empty sequences encode as `[]`, never NULL — the round-trip contract
/// for every array-typed column in the schema.
pub fn refs_to_json(refs: &[String]) -> String {
    serde_json::to_string(refs).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a JSON text column back into a string sequence. NULL and
/// malformed values decode as the empty sequence.
pub fn refs_from_json(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_roundtrip() {
        for kind in [
            EventKind::Commit,
            EventKind::PullRequest,
            EventKind::Issue,
            EventKind::Message,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("deploy"), None);
    }

    #[test]
    fn entity_kind_roundtrip() {
        for kind in [
            EntityKind::Feature,
            EntityKind::File,
            EntityKind::Decision,
            EntityKind::Discussion,
            EntityKind::Contributor,
        ] {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn relation_kind_roundtrip() {
        for kind in [
            RelationKind::RelatesTo,
            RelationKind::IntroducedBy,
            RelationKind::ModifiedBy,
            RelationKind::DiscussedIn,
        ] {
            assert_eq!(RelationKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn job_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Partial.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn refs_encode_empty_as_brackets() {
        // Empty and NULL must both round-trip to the empty sequence, and
        // the stored encoding for empty is always "[]".
        assert_eq!(refs_to_json(&[]), "[]");
        assert_eq!(refs_from_json(Some("[]")), Vec::<String>::new());
        assert_eq!(refs_from_json(None), Vec::<String>::new());
        assert_eq!(refs_from_json(Some("not json")), Vec::<String>::new());
    }

    #[test]
    fn refs_roundtrip_preserves_order() {
        let refs = vec!["src/a.rs".to_string(), "src/b.rs".to_string()];
        let encoded = refs_to_json(&refs);
        assert_eq!(refs_from_json(Some(&encoded)), refs);
    }
}
