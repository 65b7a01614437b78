//! GitHub connector: commits, pull requests, and issues via the REST API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::config::GithubConnectorConfig;
use crate::connector::{
    classify_status, feature_refs_from_text, file_refs_from_text, http_client, parse_retry_after,
    token_from_env, Connector,
};
use crate::error::{Error, Result};
use crate::models::{EventKind, NormalizedEvent, PlatformEvent};

/// GitHub caps `per_page` at 100 regardless of what we ask for.
const MAX_PER_PAGE: usize = 100;

pub struct GithubConnector {
    name: String,
    config: GithubConnectorConfig,
    client: reqwest::Client,
}

impl GithubConnector {
    pub fn new(name: String, config: GithubConnectorConfig) -> Result<Self> {
        let client = http_client(Duration::from_secs(30))?;
        Ok(Self {
            name,
            config,
            client,
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path
        )
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let token = token_from_env(&self.connector_id(), &self.config.token_env)?;

        let response = self
            .client
            .get(url)
            .query(query)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "devgraph")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(
                &self.connector_id(),
                status,
                retry_after,
                &body,
            ));
        }

        Ok(response.json().await?)
    }

    async fn fetch_commits(&self, since: i64, limit: usize) -> Result<Vec<PlatformEvent>> {
        let since_iso = iso_from_unix(since);
        let json = self
            .get_json(
                &self.repo_url("/commits"),
                &[
                    ("since", since_iso),
                    ("per_page", limit.min(MAX_PER_PAGE).to_string()),
                ],
            )
            .await?;

        let items = json.as_array().cloned().unwrap_or_default();
        let mut events = Vec::new();
        for item in &items {
            match commit_event(item) {
                Some(event) => events.push(event),
                None => tracing::warn!(
                    connector = %self.connector_id(),
                    "skipping commit with missing sha or date"
                ),
            }
        }
        Ok(events)
    }

    async fn fetch_pulls(&self, since: i64, limit: usize) -> Result<Vec<PlatformEvent>> {
        let json = self
            .get_json(
                &self.repo_url("/pulls"),
                &[
                    ("state", "all".to_string()),
                    ("sort", "updated".to_string()),
                    ("direction", "desc".to_string()),
                    ("per_page", limit.min(MAX_PER_PAGE).to_string()),
                ],
            )
            .await?;

        let items = json.as_array().cloned().unwrap_or_default();
        let mut events = Vec::new();
        for item in &items {
            if let Some(event) = pull_event(item) {
                if event.timestamp.timestamp() > since {
                    events.push(event);
                }
            }
        }
        Ok(events)
    }

    async fn fetch_issues(&self, since: i64, limit: usize) -> Result<Vec<PlatformEvent>> {
        let since_iso = iso_from_unix(since);
        let json = self
            .get_json(
                &self.repo_url("/issues"),
                &[
                    ("state", "all".to_string()),
                    ("since", since_iso),
                    ("per_page", limit.min(MAX_PER_PAGE).to_string()),
                ],
            )
            .await?;

        let items = json.as_array().cloned().unwrap_or_default();
        let mut events = Vec::new();
        for item in &items {
            // The issues endpoint also returns PRs; those come from /pulls
            if item.get("pull_request").is_some() {
                continue;
            }
            if let Some(event) = issue_event(item) {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl Connector for GithubConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform(&self) -> &str {
        "github"
    }

    fn describe(&self) -> String {
        format!(
            "GitHub repo {}/{} ({})",
            self.config.owner,
            self.config.repo,
            self.config.events.join(", ")
        )
    }

    fn next_sync_delay(&self, rate_limited: bool) -> Duration {
        if rate_limited {
            Duration::from_secs(600)
        } else {
            Duration::from_secs(120)
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.get_json(&self.repo_url(""), &[]).await?;
        Ok(())
    }

    async fn fetch_events(&self, since: i64, limit: usize) -> Result<Vec<PlatformEvent>> {
        let mut events = Vec::new();

        for stream in &self.config.events {
            let mut batch = match stream.as_str() {
                "commits" => self.fetch_commits(since, limit).await?,
                "pulls" => self.fetch_pulls(since, limit).await?,
                "issues" => self.fetch_issues(since, limit).await?,
                other => {
                    return Err(Error::Normalization {
                        platform: "github".to_string(),
                        reason: format!("unknown event stream '{}'", other),
                    })
                }
            };
            events.append(&mut batch);
        }

        events.retain(|e| e.timestamp.timestamp() > since);
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        events.truncate(limit);
        Ok(events)
    }

    fn normalize(&self, event: &PlatformEvent) -> Result<NormalizedEvent> {
        let event_kind = match event.kind.as_str() {
            "commit" => EventKind::Commit,
            "pull_request" => EventKind::PullRequest,
            "issue" => EventKind::Issue,
            other => {
                return Err(Error::Normalization {
                    platform: "github".to_string(),
                    reason: format!("unknown event kind '{}'", other),
                })
            }
        };

        // PRs and issues root their own conversation thread
        let thread_id = match event_kind {
            EventKind::PullRequest | EventKind::Issue => Some(event.id.clone()),
            _ => None,
        };

        let mut file_refs = file_refs_from_text(&event.content);
        for reference in &event.references {
            if reference.contains('/') && !file_refs.contains(reference) {
                file_refs.push(reference.clone());
            }
        }
        file_refs.sort();

        Ok(NormalizedEvent {
            platform_id: format!("{}:{}:{}", self.connector_id(), event.kind, event.id),
            connector: self.connector_id(),
            event_kind,
            timestamp: event.timestamp,
            author: event.author.clone(),
            content: event.content.clone(),
            thread_id,
            parent_id: None,
            file_refs,
            feature_refs: feature_refs_from_text(&event.content),
            metadata: event.metadata.clone(),
        })
    }
}

fn iso_from_unix(unix: i64) -> String {
    DateTime::<Utc>::from_timestamp(unix, 0)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default())
        .to_rfc3339()
}

fn parse_iso(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn commit_event(item: &Value) -> Option<PlatformEvent> {
    let sha = item.get("sha")?.as_str()?.to_string();
    let commit = item.get("commit")?;
    let timestamp = parse_iso(commit.get("author")?.get("date")?)?;

    let author = item
        .get("author")
        .and_then(|a| a.get("login"))
        .and_then(|l| l.as_str())
        .or_else(|| {
            commit
                .get("author")
                .and_then(|a| a.get("name"))
                .and_then(|n| n.as_str())
        })
        .map(|s| s.to_string());

    let message = commit
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();

    Some(PlatformEvent {
        id: sha.clone(),
        kind: "commit".to_string(),
        timestamp,
        author,
        content: message,
        metadata: serde_json::json!({
            "sha": sha,
            "html_url": item.get("html_url").cloned().unwrap_or(Value::Null),
        }),
        references: vec![],
    })
}

fn pull_event(item: &Value) -> Option<PlatformEvent> {
    let number = item.get("number")?.as_i64()?;
    let timestamp = parse_iso(item.get("updated_at")?)?;

    let title = item.get("title").and_then(|t| t.as_str()).unwrap_or("");
    let body = item.get("body").and_then(|b| b.as_str()).unwrap_or("");
    let content = if body.is_empty() {
        title.to_string()
    } else {
        format!("{}\n\n{}", title, body)
    };

    Some(PlatformEvent {
        id: format!("pr-{}", number),
        kind: "pull_request".to_string(),
        timestamp,
        author: item
            .get("user")
            .and_then(|u| u.get("login"))
            .and_then(|l| l.as_str())
            .map(|s| s.to_string()),
        content,
        metadata: serde_json::json!({
            "number": number,
            "state": item.get("state").cloned().unwrap_or(Value::Null),
            "merged_at": item.get("merged_at").cloned().unwrap_or(Value::Null),
            "html_url": item.get("html_url").cloned().unwrap_or(Value::Null),
        }),
        references: vec![],
    })
}

fn issue_event(item: &Value) -> Option<PlatformEvent> {
    let number = item.get("number")?.as_i64()?;
    let timestamp = parse_iso(item.get("updated_at")?)?;

    let title = item.get("title").and_then(|t| t.as_str()).unwrap_or("");
    let body = item.get("body").and_then(|b| b.as_str()).unwrap_or("");
    let content = if body.is_empty() {
        title.to_string()
    } else {
        format!("{}\n\n{}", title, body)
    };

    Some(PlatformEvent {
        id: format!("issue-{}", number),
        kind: "issue".to_string(),
        timestamp,
        author: item
            .get("user")
            .and_then(|u| u.get("login"))
            .and_then(|l| l.as_str())
            .map(|s| s.to_string()),
        content,
        metadata: serde_json::json!({
            "number": number,
            "state": item.get("state").cloned().unwrap_or(Value::Null),
            "html_url": item.get("html_url").cloned().unwrap_or(Value::Null),
        }),
        references: vec![],
    })
}
