//! Embedding providers and the vector helpers used by the graph store.
//!
//! Entity descriptions are embedded opportunistically after a batch
//! persists, and `dvg search` embeds the query text the same way; both
//! go through [`EmbeddingProvider`], with [`create_provider`] choosing
//! the backend from config. Vectors live on the entity row as
//! little-endian f32 BLOBs ([`vec_to_blob`] / [`blob_to_vec`]) and are
//! compared with [`cosine_similarity`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::connector::parse_retry_after;

/// One embedding backend. Implementations batch where the API allows it
/// and return vectors in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedding response was empty"))
    }
}

/// Choose the embedding backend named in config.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Placeholder for `embedding.provider = "disabled"`. Any attempt to
/// embed is an error, which callers treat as "skip embeddings".
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("embedding provider is disabled")
    }
}

/// OpenAI-compatible embeddings endpoint (`POST {api_url}/embeddings`).
/// The API key comes from `OPENAI_API_KEY`; construction fails early
/// when the key, model, or dims are missing.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for the openai provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for the openai provider"))?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    /// Retries 429 and 5xx responses with doubling backoff; a
    /// `Retry-After` header overrides the computed delay, the same way
    /// connector fetches treat it. Other 4xx responses fail immediately.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let sent = self
                .client
                .post(format!("{}/embeddings", self.api_url))
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await;

            let hint = match sent {
                Ok(response) if response.status().is_success() => {
                    let json: serde_json::Value = response.json().await?;
                    return parse_embeddings_response(&json);
                }
                Ok(response) => {
                    let status = response.status();
                    let hint = parse_retry_after(response.headers());
                    let detail = response.text().await.unwrap_or_default();
                    if status.as_u16() != 429 && !status.is_server_error() {
                        bail!("embeddings API rejected the request ({}): {}", status, detail);
                    }
                    if attempt > self.max_retries {
                        bail!(
                            "embeddings API still failing after {} attempts ({}): {}",
                            attempt,
                            status,
                            detail
                        );
                    }
                    hint
                }
                Err(err) => {
                    if attempt > self.max_retries {
                        bail!("embeddings request failed after {} attempts: {}", attempt, err);
                    }
                    None
                }
            };

            let backoff = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(hint.unwrap_or(backoff)).await;
        }
    }
}

/// Pull the `data[].embedding` arrays out of an API response, in order.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("embeddings response has no data array"))?;

    data.iter()
        .map(|item| {
            let values = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| anyhow::anyhow!("embeddings response entry has no vector"))?;
            Ok(values
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect())
        })
        .collect()
}

/// Encode an embedding as raw little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a BLOB written by [`vec_to_blob`]. Trailing bytes that do not
/// fill a whole f32 are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine similarity in [-1, 1]. Mismatched lengths and zero-norm
/// vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|y| y * y).sum::<f32>().sqrt();

    if norm_a * norm_b < f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
