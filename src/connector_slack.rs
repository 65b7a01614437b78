//! Slack connector: channel messages via `conversations.history`.
//!
//! Slack reports most failures as HTTP 200 with `"ok": false`, so the
//! error string in the body is mapped onto the failure taxonomy in
//! addition to the HTTP status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::config::SlackConnectorConfig;
use crate::connector::{
    classify_status, feature_refs_from_text, file_refs_from_text, http_client, parse_retry_after,
    token_from_env, Connector,
};
use crate::error::{Error, Result};
use crate::models::{EventKind, NormalizedEvent, PlatformEvent};

const MAX_PAGE: usize = 200;

pub struct SlackConnector {
    name: String,
    config: SlackConnectorConfig,
    client: reqwest::Client,
}

impl SlackConnector {
    pub fn new(name: String, config: SlackConnectorConfig) -> Result<Self> {
        let client = http_client(Duration::from_secs(30))?;
        Ok(Self {
            name,
            config,
            client,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), method)
    }

    async fn call(&self, method: &str, query: &[(&str, String)]) -> Result<Value> {
        let token = token_from_env(&self.connector_id(), &self.config.token_env)?;

        let response = self
            .client
            .get(self.method_url(method))
            .query(query)
            .header("Authorization", format!("Bearer {}", token))
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

        let json: Value = response.json().await?;
        if json.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(json);
        }

        let reason = json
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown_error")
            .to_string();
        Err(self.classify_api_error(reason))
    }

    fn classify_api_error(&self, reason: String) -> Error {
        match reason.as_str() {
            "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked"
            | "token_expired" | "missing_scope" | "channel_not_found" | "not_in_channel" => {
                Error::Auth {
                    connector: self.connector_id(),
                    reason,
                }
            }
            "ratelimited" | "rate_limited" => Error::RateLimited {
                connector: self.connector_id(),
                attempts: 1,
                retry_after: None,
            },
            _ => Error::TransientFetch {
                connector: self.connector_id(),
                reason,
            },
        }
    }
}

#[async_trait]
impl Connector for SlackConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform(&self) -> &str {
        "slack"
    }

    fn describe(&self) -> String {
        format!("Slack channel {}", self.config.channel_id)
    }

    async fn health_check(&self) -> Result<()> {
        self.call("auth.test", &[]).await?;
        Ok(())
    }

    async fn fetch_events(&self, since: i64, limit: usize) -> Result<Vec<PlatformEvent>> {
        let json = self
            .call(
                "conversations.history",
                &[
                    ("channel", self.config.channel_id.clone()),
                    ("oldest", since.to_string()),
                    ("limit", limit.min(MAX_PAGE).to_string()),
                ],
            )
            .await?;

        let messages = json
            .get("messages")
            .and_then(|m| m.as_array())
            .cloned()
            .unwrap_or_default();

        let mut events = Vec::new();
        for message in &messages {
            if let Some(event) = message_event(message, &self.config.channel_id) {
                if event.timestamp.timestamp() > since {
                    events.push(event);
                }
            }
        }

        // History comes back newest first
        events.sort_by(|a, b| a.id.cmp(&b.id));
        events.truncate(limit);
        Ok(events)
    }

    fn normalize(&self, event: &PlatformEvent) -> Result<NormalizedEvent> {
        if event.kind != "message" {
            return Err(Error::Normalization {
                platform: "slack".to_string(),
                reason: format!("unknown event kind '{}'", event.kind),
            });
        }

        let thread_ts = event
            .metadata
            .get("thread_ts")
            .and_then(|t| t.as_str())
            .map(|s| s.to_string());

        // thread_ts == own ts marks the thread root; replies point at it
        let parent_id = thread_ts.as_ref().filter(|ts| **ts != event.id).cloned();

        Ok(NormalizedEvent {
            platform_id: format!("{}:message:{}", self.connector_id(), event.id),
            connector: self.connector_id(),
            event_kind: EventKind::Message,
            timestamp: event.timestamp,
            author: event.author.clone(),
            content: event.content.clone(),
            thread_id: thread_ts,
            parent_id,
            file_refs: file_refs_from_text(&event.content),
            feature_refs: feature_refs_from_text(&event.content),
            metadata: event.metadata.clone(),
        })
    }
}

/// Convert a Slack `ts` value (`"1712345678.000100"`) to a UTC datetime.
fn ts_to_datetime(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = match ts.split_once('.') {
        Some((s, f)) => (s, f),
        None => (ts, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = if frac.is_empty() {
        0
    } else {
        format!("{:0<6}", frac).get(..6)?.parse().ok()?
    };
    DateTime::<Utc>::from_timestamp(secs, micros * 1_000)
}

fn message_event(message: &Value, channel_id: &str) -> Option<PlatformEvent> {
    let ts = message.get("ts")?.as_str()?.to_string();
    let timestamp = ts_to_datetime(&ts)?;

    let text = message.get("text").and_then(|t| t.as_str()).unwrap_or("");
    if text.is_empty() {
        return None;
    }

    let author = message
        .get("user")
        .or_else(|| message.get("bot_id"))
        .and_then(|u| u.as_str())
        .map(|s| s.to_string());

    Some(PlatformEvent {
        id: ts.clone(),
        kind: "message".to_string(),
        timestamp,
        author,
        content: text.to_string(),
        metadata: serde_json::json!({
            "channel": channel_id,
            "ts": ts,
            "thread_ts": message.get("thread_ts").cloned().unwrap_or(Value::Null),
        }),
        references: vec![],
    })
}
