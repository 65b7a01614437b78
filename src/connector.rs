//! Platform connector trait and registry.
//!
//! A [`Connector`] adapts one external developer platform (GitHub, Slack,
//! Discord) to the ingestion pipeline: it proves it can reach the platform,
//! fetches raw events after a checkpoint, and normalizes them into the
//! common event shape. Fetching is async and goes through the retry
//! controller; normalization is pure and never performs I/O.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use devgraph::connector::Connector;
//! use devgraph::error::Result;
//! use devgraph::models::{EventKind, NormalizedEvent, PlatformEvent};
//!
//! pub struct ChangelogConnector;
//!
//! #[async_trait]
//! impl Connector for ChangelogConnector {
//!     fn name(&self) -> &str { "changelog" }
//!     fn platform(&self) -> &str { "custom" }
//!
//!     async fn health_check(&self) -> Result<()> { Ok(()) }
//!
//!     async fn fetch_events(&self, _since: i64, _limit: usize) -> Result<Vec<PlatformEvent>> {
//!         Ok(vec![])
//!     }
//!
//!     fn normalize(&self, event: &PlatformEvent) -> Result<NormalizedEvent> {
//!         Ok(NormalizedEvent {
//!             platform_id: format!("{}:{}:{}", self.connector_id(), event.kind, event.id),
//!             connector: self.connector_id(),
//!             event_kind: EventKind::Message,
//!             timestamp: event.timestamp,
//!             author: event.author.clone(),
//!             content: event.content.clone(),
//!             thread_id: None,
//!             parent_id: None,
//!             file_refs: vec![],
//!             feature_refs: vec![],
//!             metadata: event.metadata.clone(),
//!         })
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{NormalizedEvent, PlatformEvent};

/// A developer platform adapter.
///
/// Implementations hold their own HTTP client and credentials. The
/// scheduler drives the lifecycle: [`health_check`](Connector::health_check)
/// once per job, then repeated [`fetch_events`](Connector::fetch_events)
/// pages, each event passed through [`normalize`](Connector::normalize).
#[async_trait]
pub trait Connector: Send + Sync {
    /// Instance name from config (e.g. `"platform"`).
    fn name(&self) -> &str;

    /// Platform identifier (e.g. `"github"`, `"slack"`, `"discord"`).
    fn platform(&self) -> &str;

    /// Stable connector label: `"{platform}:{name}"`. Used as the job
    /// and checkpoint key and as the `connector` field on events.
    fn connector_id(&self) -> String {
        format!("{}:{}", self.platform(), self.name())
    }

    /// One-line description for the sources listing.
    fn describe(&self) -> String {
        format!("{} connector '{}'", self.platform(), self.name())
    }

    /// Delay before the next sync for this platform. Stretched after a
    /// run that hit the platform's rate limit.
    fn next_sync_delay(&self, rate_limited: bool) -> Duration {
        if rate_limited {
            Duration::from_secs(300)
        } else {
            Duration::from_secs(60)
        }
    }

    /// Verify credentials and connectivity without fetching data.
    async fn health_check(&self) -> Result<()>;

    /// Fetch raw events strictly newer than `since` (unix seconds),
    /// oldest first, at most `limit` per call.
    async fn fetch_events(&self, since: i64, limit: usize) -> Result<Vec<PlatformEvent>>;

    /// Map one raw event into the common shape. Pure: no I/O, no clock,
    /// same input always yields the same output.
    fn normalize(&self, event: &PlatformEvent) -> Result<NormalizedEvent>;
}

/// Registry of configured connectors.
pub struct ConnectorRegistry {
    connectors: Vec<Box<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Build every connector instance declared in the config.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::connector_discord::DiscordConnector;
        use crate::connector_github::GithubConnector;
        use crate::connector_slack::SlackConnector;

        let mut registry = Self::new();

        for (name, cfg) in &config.connectors.github {
            registry.register(Box::new(GithubConnector::new(name.clone(), cfg.clone())?));
        }
        for (name, cfg) in &config.connectors.slack {
            registry.register(Box::new(SlackConnector::new(name.clone(), cfg.clone())?));
        }
        for (name, cfg) in &config.connectors.discord {
            registry.register(Box::new(DiscordConnector::new(name.clone(), cfg.clone())?));
        }

        Ok(registry)
    }

    pub fn register(&mut self, connector: Box<dyn Connector>) {
        self.connectors.push(connector);
    }

    pub fn connectors(&self) -> &[Box<dyn Connector>] {
        &self.connectors
    }

    /// Find a connector by its `"{platform}:{name}"` label.
    pub fn find(&self, connector_id: &str) -> Option<&dyn Connector> {
        self.connectors
            .iter()
            .find(|c| c.connector_id() == connector_id)
            .map(|c| c.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Shared HTTP helpers ============

/// Read the token from the environment variable named in config.
/// The value is held in memory only; it is never logged or persisted.
pub(crate) fn token_from_env(connector_id: &str, var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| Error::Auth {
        connector: connector_id.to_string(),
        reason: format!("environment variable {} not set", var),
    })
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Map a non-success HTTP status to the failure taxonomy.
///
/// 401/403/404 are treated as auth problems (GitHub reports missing
/// access to private repos as 404), 429 as rate limiting with the
/// server's `Retry-After` hint, everything else as transient.
pub(crate) fn classify_status(
    connector_id: &str,
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Error {
    match status.as_u16() {
        401 | 403 | 404 => Error::Auth {
            connector: connector_id.to_string(),
            reason: format!("HTTP {}: {}", status, truncate(body, 200)),
        },
        429 => Error::RateLimited {
            connector: connector_id.to_string(),
            attempts: 1,
            retry_after,
        },
        _ => Error::TransientFetch {
            connector: connector_id.to_string(),
            reason: format!("HTTP {}: {}", status, truncate(body, 200)),
        },
    }
}

/// Parse a `Retry-After` header value given in seconds. Accepts the
/// fractional form Discord uses.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?;
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = raw.trim().parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ============ Reference extraction ============

/// Pull feature identifiers out of free text: `#123` issue/PR numbers
/// and `ABC-123` ticket keys. Sorted and deduplicated.
pub(crate) fn feature_refs_from_text(text: &str) -> Vec<String> {
    let mut refs = Vec::new();

    for token in text.split(|c: char| c.is_whitespace() || "(),;".contains(c)) {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '#' && c != '-');
        if token.len() < 2 {
            continue;
        }

        if let Some(digits) = token.strip_prefix('#') {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                refs.push(format!("#{}", digits));
            }
            continue;
        }

        if let Some((key, num)) = token.split_once('-') {
            let key_ok = key.len() >= 2 && key.chars().all(|c| c.is_ascii_uppercase());
            let num_ok = !num.is_empty() && num.chars().all(|c| c.is_ascii_digit());
            if key_ok && num_ok {
                refs.push(token.to_string());
            }
        }
    }

    refs.sort();
    refs.dedup();
    refs
}

/// Pull file paths out of free text: tokens with a directory separator
/// and a dotted final segment (e.g. `src/scheduler.rs`). Sorted and
/// deduplicated.
pub(crate) fn file_refs_from_text(text: &str) -> Vec<String> {
    let mut refs = Vec::new();

    for token in text.split(|c: char| c.is_whitespace() || "(),;'\"`".contains(c)) {
        let token = token.trim_matches(|c: char| c == ':' || c == '.' || c == '*');
        if !token.contains('/') || token.starts_with("http://") || token.starts_with("https://") {
            continue;
        }
        let last = match token.rsplit('/').next() {
            Some(seg) => seg,
            None => continue,
        };
        // Final segment needs an extension-like suffix
        if let Some((stem, ext)) = last.rsplit_once('.') {
            let ext_ok = !ext.is_empty()
                && ext.len() <= 8
                && ext.chars().all(|c| c.is_ascii_alphanumeric());
            if !stem.is_empty() && ext_ok {
                refs.push(token.to_string());
            }
        }
    }

    refs.sort();
    refs.dedup();
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_issue_numbers_and_ticket_keys() {
        let refs = feature_refs_from_text("Fixes #42 and relates to AUTH-103 (see #42).");
        assert_eq!(refs, vec!["#42", "AUTH-103"]);
    }

    #[test]
    fn ignores_lowercase_and_bare_dashes() {
        let refs = feature_refs_from_text("re-sync the abc-12 branch pre-1");
        assert!(refs.is_empty());
    }

    #[test]
    fn extracts_file_paths() {
        let refs = file_refs_from_text("touched src/scheduler.rs and `docs/adr/0002-leases.md`:");
        assert_eq!(refs, vec!["docs/adr/0002-leases.md", "src/scheduler.rs"]);
    }

    #[test]
    fn skips_urls_and_plain_words() {
        let refs = file_refs_from_text("see https://example.com/a.html and foo/bar without ext");
        assert!(refs.is_empty());
    }

    #[test]
    fn retry_after_parses_integer_and_fractional_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert("retry-after", "0.5".parse().unwrap());
        assert_eq!(
            parse_retry_after(&headers),
            Some(Duration::from_secs_f64(0.5))
        );
    }

    #[test]
    fn classify_maps_status_families() {
        let auth = classify_status("github:x", reqwest::StatusCode::UNAUTHORIZED, None, "no");
        assert!(matches!(auth, Error::Auth { .. }));

        let limited = classify_status(
            "github:x",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
            "",
        );
        match limited {
            Error::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
            }
            other => panic!("expected RateLimited, got {}", other),
        }

        let transient = classify_status(
            "github:x",
            reqwest::StatusCode::BAD_GATEWAY,
            None,
            "upstream",
        );
        assert!(matches!(transient, Error::TransientFetch { .. }));
    }
}
