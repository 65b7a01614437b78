//! Discord connector: channel messages via the REST API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::config::DiscordConnectorConfig;
use crate::connector::{
    classify_status, feature_refs_from_text, file_refs_from_text, http_client, parse_retry_after,
    token_from_env, Connector,
};
use crate::error::{Error, Result};
use crate::models::{EventKind, NormalizedEvent, PlatformEvent};

const MAX_PAGE: usize = 100;

/// Discord epoch (2015-01-01T00:00:00Z) in unix milliseconds.
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

pub struct DiscordConnector {
    name: String,
    config: DiscordConnectorConfig,
    client: reqwest::Client,
}

impl DiscordConnector {
    pub fn new(name: String, config: DiscordConnectorConfig) -> Result<Self> {
        let client = http_client(Duration::from_secs(30))?;
        Ok(Self {
            name,
            config,
            client,
        })
    }

    fn channel_url(&self, path: &str) -> String {
        format!(
            "{}/channels/{}{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.channel_id,
            path
        )
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let token = token_from_env(&self.connector_id(), &self.config.token_env)?;

        let response = self
            .client
            .get(url)
            .query(query)
            .header("Authorization", format!("Bot {}", token))
            .header("User-Agent", "devgraph (https://github.com/parallax-labs/devgraph, 0.3)")
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
}

#[async_trait]
impl Connector for DiscordConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform(&self) -> &str {
        "discord"
    }

    fn describe(&self) -> String {
        format!("Discord channel {}", self.config.channel_id)
    }

    async fn health_check(&self) -> Result<()> {
        self.get_json(&self.channel_url(""), &[]).await?;
        Ok(())
    }

    async fn fetch_events(&self, since: i64, limit: usize) -> Result<Vec<PlatformEvent>> {
        let after = snowflake_after(since);
        let json = self
            .get_json(
                &self.channel_url("/messages"),
                &[
                    ("after", after.to_string()),
                    ("limit", limit.min(MAX_PAGE).to_string()),
                ],
            )
            .await?;

        let messages = json.as_array().cloned().unwrap_or_default();

        let mut events = Vec::new();
        for message in &messages {
            if let Some(event) = message_event(message, &self.config.channel_id) {
                if event.timestamp.timestamp() > since {
                    events.push(event);
                }
            }
        }

        // Messages come back newest first
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        events.truncate(limit);
        Ok(events)
    }

    fn normalize(&self, event: &PlatformEvent) -> Result<NormalizedEvent> {
        if event.kind != "message" {
            return Err(Error::Normalization {
                platform: "discord".to_string(),
                reason: format!("unknown event kind '{}'", event.kind),
            });
        }

        let parent_id = event
            .metadata
            .get("reply_to")
            .and_then(|r| r.as_str())
            .map(|s| s.to_string());

        Ok(NormalizedEvent {
            platform_id: format!("{}:message:{}", self.connector_id(), event.id),
            connector: self.connector_id(),
            event_kind: EventKind::Message,
            timestamp: event.timestamp,
            author: event.author.clone(),
            content: event.content.clone(),
            thread_id: Some(self.config.channel_id.clone()),
            parent_id,
            file_refs: file_refs_from_text(&event.content),
            feature_refs: feature_refs_from_text(&event.content),
            metadata: event.metadata.clone(),
        })
    }
}

/// Smallest snowflake strictly after the given unix second.
fn snowflake_after(unix_secs: i64) -> u64 {
    let ms = unix_secs.saturating_mul(1_000).saturating_add(999);
    let offset = (ms - DISCORD_EPOCH_MS).max(0) as u64;
    offset << 22
}

fn message_event(message: &Value, channel_id: &str) -> Option<PlatformEvent> {
    let id = message.get("id")?.as_str()?.to_string();
    let timestamp = message
        .get("timestamp")
        .and_then(|t| t.as_str())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("");
    if content.is_empty() {
        return None;
    }

    let author = message
        .get("author")
        .and_then(|a| a.get("username"))
        .and_then(|u| u.as_str())
        .map(|s| s.to_string());

    let reply_to = message
        .get("message_reference")
        .and_then(|r| r.get("message_id"))
        .cloned()
        .unwrap_or(Value::Null);

    Some(PlatformEvent {
        id,
        kind: "message".to_string(),
        timestamp,
        author,
        content: content.to_string(),
        metadata: serde_json::json!({
            "channel": channel_id,
            "reply_to": reply_to,
        }),
        references: vec![],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscordConnectorConfig;

    fn connector() -> DiscordConnector {
        DiscordConnector::new(
            "dev-chat".to_string(),
            DiscordConnectorConfig {
                channel_id: "1012345".to_string(),
                token_env: "DISCORD_TOKEN".to_string(),
                api_url: "https://discord.com/api/v10".to_string(),
            },
        )
        .unwrap()
    }

    #[test]
    fn snowflake_is_zero_before_discord_epoch() {
        assert_eq!(snowflake_after(0), 0);
    }

    #[test]
    fn snowflake_grows_with_time() {
        let a = snowflake_after(1_700_000_000);
        let b = snowflake_after(1_700_000_100);
        assert!(b > a);
    }

    #[test]
    fn maps_message_payload_with_reply() {
        let message = serde_json::json!({
            "id": "111222333",
            "timestamp": "2024-03-01T10:00:00.000000+00:00",
            "content": "agreed, ship it with #88",
            "author": {"username": "kai"},
            "message_reference": {"message_id": "111000000"}
        });
        let event = message_event(&message, "1012345").unwrap();
        assert_eq!(event.id, "111222333");
        assert_eq!(event.author.as_deref(), Some("kai"));

        let normalized = connector().normalize(&event).unwrap();
        assert_eq!(normalized.parent_id.as_deref(), Some("111000000"));
        assert_eq!(normalized.thread_id.as_deref(), Some("1012345"));
        assert_eq!(normalized.feature_refs, vec!["#88"]);
    }

    #[test]
    fn skips_messages_without_content() {
        let message = serde_json::json!({
            "id": "111",
            "timestamp": "2024-03-01T10:00:00.000000+00:00",
            "content": "",
            "author": {"username": "kai"}
        });
        assert!(message_event(&message, "1012345").is_none());
    }
}
