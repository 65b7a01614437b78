//! Failure taxonomy for the ingestion pipeline.
//!
//! Each variant maps to one containment policy: `Auth` fails the job without
//! retry, `RateLimited`/`TransientFetch` are retried by the controller and
//! then surfaced, `Normalization` drops a single event, `Extraction` skips a
//! single group, and `Integrity` rolls back one unit of work.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credential invalid or expired. Jobs hitting this go straight to
    /// `failed`; re-auth is an operator action, never an automatic retry.
    #[error("authentication failed for {connector}: {reason}")]
    Auth { connector: String, reason: String },

    /// The platform told us to back off and the retry budget is exhausted.
    #[error("rate limited by {connector} after {attempts} attempts")]
    RateLimited {
        connector: String,
        attempts: u32,
        /// Server-provided hint, when the platform sent one.
        retry_after: Option<Duration>,
    },

    /// Network failure or 5xx. Retried by the controller, then surfaced.
    #[error("transient fetch failure for {connector}: {reason}")]
    TransientFetch { connector: String, reason: String },

    /// A platform payload that could not be normalized. The event is
    /// dropped; the batch continues.
    #[error("malformed {platform} payload: {reason}")]
    Normalization { platform: String, reason: String },

    /// The external extraction capability failed or timed out for one
    /// event group. The group is skipped; the batch continues.
    #[error("extraction failed for group {group}: {reason}")]
    Extraction { group: String, reason: String },

    /// A graph constraint violation (missing endpoint, duplicate key
    /// outside the upsert path). The unit of work is rolled back.
    #[error("graph integrity violation: {0}")]
    Integrity(String),

    /// Shutdown interrupted the operation before it completed.
    #[error("operation cancelled for {connector}")]
    Cancelled { connector: String },

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the retry controller may re-issue the call that produced
    /// this error. Only idempotent-read failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::TransientFetch { .. } | Error::Http(_)
        )
    }

    /// The backoff hint supplied by the platform, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
