//! Knowledge extraction from grouped events.
//!
//! An [`Extractor`] turns one event group into typed artifacts: decisions,
//! a discussion summary, feature context, file history, and candidate
//! relationships. Structural artifacts (features, files, contributors and
//! the edges between them) are derived mechanically from event refs; the
//! semantic artifacts come from either built-in heuristics (`rules`) or a
//! chat-completions model (`openai`).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::ExtractionConfig;
use crate::error::{Error, Result};
use crate::models::{EntityKind, EventKind, NormalizedEvent, RelationKind};

/// Events that belong together: one conversation thread, one feature,
/// or one file, keyed by a stable group label.
#[derive(Debug, Clone)]
pub struct EventGroup {
    /// `"thread:{id}"`, `"feature:{ref}"`, `"file:{path}"`, or
    /// `"event:{platform_id}"` for standalone events.
    pub key: String,
    pub events: Vec<NormalizedEvent>,
}

#[derive(Debug, Clone)]
pub struct ExtractedDecision {
    pub title: String,
    pub rationale: String,
    pub decided_at: i64,
    pub source_event_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractedDiscussion {
    pub summary: String,
    pub participants: Vec<String>,
    pub source_event_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractedFeature {
    /// The feature ref as it appeared in events (`"#42"`, `"AUTH-103"`).
    pub source_id: String,
    pub summary: String,
    pub source_event_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractedFileChange {
    pub path: String,
    pub platform_event_id: String,
    pub change_summary: String,
    pub author: Option<String>,
    pub changed_at: i64,
}

/// Entity address used before database ids exist.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub source_id: String,
}

#[derive(Debug, Clone)]
pub struct ExtractedRelationship {
    pub source: EntityRef,
    pub target: EntityRef,
    pub kind: RelationKind,
    pub strength: f64,
}

/// Everything one group contributes to the graph.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub decisions: Vec<ExtractedDecision>,
    pub discussion: Option<ExtractedDiscussion>,
    pub features: Vec<ExtractedFeature>,
    pub file_changes: Vec<ExtractedFileChange>,
    pub contributors: Vec<String>,
    pub relationships: Vec<ExtractedRelationship>,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    /// Derive artifacts for one group. Pure from the caller's point of
    /// view: same group in, same artifacts out (the `openai` backend is
    /// best-effort on that promise).
    async fn extract(&self, group: &EventGroup) -> Result<Extraction>;
}

pub fn create_extractor(config: &ExtractionConfig) -> Result<Box<dyn Extractor>> {
    match config.provider.as_str() {
        "rules" => Ok(Box::new(RulesExtractor)),
        "openai" => Ok(Box::new(OpenAiExtractor::new(config)?)),
        other => Err(Error::Extraction {
            group: String::new(),
            reason: format!("unknown extraction provider '{}'", other),
        }),
    }
}

/// Stable short id for derived artifacts, so re-extraction upserts
/// instead of duplicating.
pub(crate) fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

fn first_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    let mut s: String = line.chars().take(max).collect();
    if line.chars().count() > max {
        s.push('…');
    }
    s
}

// ============ Structural derivation ============

/// Mechanically derived artifacts: features, file history, contributors,
/// and the relationships implied by co-mentions. Shared by every
/// extraction backend. Relationship candidates between the same pair and
/// kind are collapsed keeping the maximum strength.
pub(crate) fn derive_structural(group: &EventGroup) -> Extraction {
    let mut extraction = Extraction::default();

    let event_ids: Vec<String> = group.events.iter().map(|e| e.platform_id.clone()).collect();

    // Contributors
    let mut contributors: Vec<String> = group
        .events
        .iter()
        .filter_map(|e| e.author.clone())
        .collect();
    contributors.sort();
    contributors.dedup();
    extraction.contributors = contributors;

    // Features, keyed by ref, with the events that mention them
    let mut feature_events: BTreeMap<String, Vec<&NormalizedEvent>> = BTreeMap::new();
    for event in &group.events {
        for feature_ref in &event.feature_refs {
            feature_events
                .entry(feature_ref.clone())
                .or_default()
                .push(event);
        }
    }
    for (feature_ref, events) in &feature_events {
        extraction.features.push(ExtractedFeature {
            source_id: feature_ref.clone(),
            summary: first_line(&events[0].content, 160),
            source_event_ids: events.iter().map(|e| e.platform_id.clone()).collect(),
        });
    }

    // File history entries, one per (event, path)
    for event in &group.events {
        for path in &event.file_refs {
            extraction.file_changes.push(ExtractedFileChange {
                path: path.clone(),
                platform_event_id: event.platform_id.clone(),
                change_summary: first_line(&event.content, 200),
                author: event.author.clone(),
                changed_at: event.timestamp.timestamp(),
            });
        }
    }

    // Relationship candidates, max-strength per (source, target, kind)
    let mut candidates: BTreeMap<(EntityRef, EntityRef, RelationKind), f64> = BTreeMap::new();
    let mut bump = |source: EntityRef, target: EntityRef, kind: RelationKind, strength: f64| {
        let entry = candidates.entry((source, target, kind)).or_insert(0.0);
        *entry = entry.max(strength);
    };

    // Co-mention counts drive strength: 0.5 for one event, +0.1 per
    // additional event, capped at 1.0
    let mut pair_counts: BTreeMap<(String, String), u32> = BTreeMap::new();
    for event in &group.events {
        for feature_ref in &event.feature_refs {
            for path in &event.file_refs {
                *pair_counts
                    .entry((feature_ref.clone(), path.clone()))
                    .or_insert(0) += 1;
            }
        }
    }
    for ((feature_ref, path), count) in &pair_counts {
        bump(
            EntityRef {
                kind: EntityKind::Feature,
                source_id: feature_ref.clone(),
            },
            EntityRef {
                kind: EntityKind::File,
                source_id: path.clone(),
            },
            RelationKind::RelatesTo,
            mention_strength(*count),
        );
    }

    for event in &group.events {
        let author = match &event.author {
            Some(a) => a.clone(),
            None => continue,
        };
        let contributor = EntityRef {
            kind: EntityKind::Contributor,
            source_id: author,
        };

        if event.event_kind == EventKind::Commit {
            for path in &event.file_refs {
                bump(
                    EntityRef {
                        kind: EntityKind::File,
                        source_id: path.clone(),
                    },
                    contributor.clone(),
                    RelationKind::ModifiedBy,
                    0.8,
                );
            }
        }
    }

    // Earliest mention of a feature credits its introducer
    for (feature_ref, events) in &feature_events {
        if let Some(author) = events.iter().find_map(|e| e.author.clone()) {
            bump(
                EntityRef {
                    kind: EntityKind::Feature,
                    source_id: feature_ref.clone(),
                },
                EntityRef {
                    kind: EntityKind::Contributor,
                    source_id: author,
                },
                RelationKind::IntroducedBy,
                0.6,
            );
        }
    }

    // Conversation groups anchor a discussion entity; features and files
    // mentioned there hang off it
    let message_count = group
        .events
        .iter()
        .filter(|e| e.event_kind == EventKind::Message)
        .count();
    if message_count > 0 {
        let discussion = EntityRef {
            kind: EntityKind::Discussion,
            source_id: group.key.clone(),
        };
        for feature_ref in feature_events.keys() {
            bump(
                EntityRef {
                    kind: EntityKind::Feature,
                    source_id: feature_ref.clone(),
                },
                discussion.clone(),
                RelationKind::DiscussedIn,
                0.7,
            );
        }
        let mut paths: Vec<&String> = group.events.iter().flat_map(|e| &e.file_refs).collect();
        paths.sort();
        paths.dedup();
        for path in paths {
            bump(
                EntityRef {
                    kind: EntityKind::File,
                    source_id: path.clone(),
                },
                discussion.clone(),
                RelationKind::DiscussedIn,
                0.7,
            );
        }

        extraction.discussion = Some(ExtractedDiscussion {
            summary: format!(
                "{} messages from {} participants: {}",
                message_count,
                extraction.contributors.len().max(1),
                first_line(&group.events[0].content, 120)
            ),
            participants: extraction.contributors.clone(),
            source_event_ids: event_ids,
        });
    }

    extraction.relationships = candidates
        .into_iter()
        .map(|((source, target, kind), strength)| ExtractedRelationship {
            source,
            target,
            kind,
            strength,
        })
        .collect();

    extraction
}

fn mention_strength(count: u32) -> f64 {
    (0.5 + 0.1 * f64::from(count.saturating_sub(1))).min(1.0)
}

// ============ Rules extractor ============

/// Deterministic extraction backend. Decisions are detected by marker
/// phrases; everything else is structural derivation.
pub struct RulesExtractor;

const DECISION_MARKERS: &[&str] = &[
    "decision:",
    "decided to",
    "we decided",
    "agreed to",
    "we agreed",
    "consensus:",
];

#[async_trait]
impl Extractor for RulesExtractor {
    fn name(&self) -> &str {
        "rules"
    }

    async fn extract(&self, group: &EventGroup) -> Result<Extraction> {
        let mut extraction = derive_structural(group);

        for event in &group.events {
            let lowered = event.content.to_lowercase();
            if DECISION_MARKERS.iter().any(|m| lowered.contains(m)) {
                extraction.decisions.push(ExtractedDecision {
                    title: first_line(&event.content, 120),
                    rationale: event.content.chars().take(2000).collect(),
                    decided_at: event.timestamp.timestamp(),
                    source_event_ids: vec![event.platform_id.clone()],
                });
            }
        }

        Ok(extraction)
    }
}

// ============ OpenAI extractor ============

/// Extraction backend that asks a chat-completions model for decisions
/// and a discussion summary. Structural artifacts still come from
/// [`derive_structural`]; the model only replaces the semantic parts.
pub struct OpenAiExtractor {
    model: String,
    api_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    decisions: Vec<RawDecision>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    title: String,
    #[serde(default)]
    rationale: String,
}

impl OpenAiExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| Error::Extraction {
            group: String::new(),
            reason: "extraction.model required for OpenAI provider".to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn render_transcript(group: &EventGroup) -> String {
        let mut transcript = String::new();
        for event in &group.events {
            let line = format!(
                "[{} {}] {}: {}\n",
                event.timestamp.format("%Y-%m-%d %H:%M"),
                event.event_kind,
                event.author.as_deref().unwrap_or("unknown"),
                event.content.chars().take(1000).collect::<String>()
            );
            if transcript.len() + line.len() > 8000 {
                break;
            }
            transcript.push_str(&line);
        }
        transcript
    }

    async fn complete(&self, group_key: &str, transcript: &str) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| Error::Extraction {
            group: group_key.to_string(),
            reason: "OPENAI_API_KEY not set".to_string(),
        })?;

        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": EXTRACTION_PROMPT},
                {"role": "user", "content": transcript},
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Extraction {
                group: group_key.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Extraction {
                group: group_key.to_string(),
                reason: format!("API error {}: {}", status, body),
            });
        }

        let json: serde_json::Value = response.json().await.map_err(|e| Error::Extraction {
            group: group_key.to_string(),
            reason: e.to_string(),
        })?;

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Extraction {
                group: group_key.to_string(),
                reason: "completion response missing content".to_string(),
            })
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    fn name(&self) -> &str {
        "openai"
    }

    async fn extract(&self, group: &EventGroup) -> Result<Extraction> {
        let mut extraction = derive_structural(group);

        let transcript = Self::render_transcript(group);
        let response = self.complete(&group.key, &transcript).await?;

        let json_str = extract_json(&response);
        let raw: RawExtraction =
            serde_json::from_str(json_str).map_err(|e| Error::Extraction {
                group: group.key.clone(),
                reason: format!("unparseable extraction response: {}", e),
            })?;

        let event_ids: Vec<String> = group.events.iter().map(|e| e.platform_id.clone()).collect();
        let decided_at = group
            .events
            .iter()
            .map(|e| e.timestamp.timestamp())
            .max()
            .unwrap_or(0);

        extraction.decisions = raw
            .decisions
            .into_iter()
            .filter(|d| !d.title.trim().is_empty())
            .map(|d| ExtractedDecision {
                title: d.title,
                rationale: d.rationale,
                decided_at,
                source_event_ids: event_ids.clone(),
            })
            .collect();

        if let Some(summary) = raw.summary.filter(|s| !s.trim().is_empty()) {
            if let Some(discussion) = extraction.discussion.as_mut() {
                discussion.summary = summary;
            } else {
                extraction.discussion = Some(ExtractedDiscussion {
                    summary,
                    participants: extraction.contributors.clone(),
                    source_event_ids: event_ids,
                });
            }
        }

        Ok(extraction)
    }
}

/// Extract JSON from a response that may be wrapped in a markdown code
/// block.
fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```") {
        let after_start = &trimmed[start + 3..];
        let json_start = if after_start.starts_with("json") {
            after_start.find('\n').map(|i| i + 1).unwrap_or(0)
        } else if after_start.starts_with('\n') {
            1
        } else {
            0
        };
        let content = &after_start[json_start..];
        if let Some(end) = content.find("```") {
            return content[..end].trim();
        }
    }

    trimmed
}

const EXTRACTION_PROMPT: &str = r#"You are a development-history analyst. The input is a transcript of related developer activity (commits, pull requests, issues, chat messages).

Identify explicit technical decisions and summarize the discussion.

Respond with JSON only (no markdown, no explanation):
{
  "decisions": [
    {
      "title": "One-line statement of what was decided",
      "rationale": "Why it was decided, in the participants' own terms"
    }
  ],
  "summary": "2-3 sentence summary of what was discussed and concluded"
}

Only report decisions that were actually made in the transcript, not proposals or questions. If there are none, return an empty decisions array. If the transcript is not a discussion, set summary to null."#;
