//! Embedding capability client.
//!
//! Obtains dense vectors from an Ollama-compatible `/api/embeddings`
//! endpoint and L2-normalizes them. The backing service may truncate long
//! inputs, so callers must not assume lossless embedding of arbitrarily
//! long text. Recently embedded texts are served from an LRU cache.

use lru::LruCache;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::config::ServiceConfig;
use crate::error::{RagError, Result};

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
    expected_dim: usize,
    timeout: Duration,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingClient {
    pub fn new(services: &ServiceConfig, expected_dim: usize) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        let cache_size =
            NonZeroUsize::new(services.embedding_cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            client,
            base_url: services.ollama_url.trim_end_matches('/').to_string(),
            model: services.embedding_model.clone(),
            expected_dim,
            timeout: Duration::from_secs(services.embedding_timeout_secs),
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Embed a text into a unit-length vector.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RagError::InputInvalid("cannot embed empty text".into()));
        }

        if let Some(cached) = self.cache.lock().get(text) {
            return Ok(cached.clone());
        }

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .timeout(self.timeout)
            .json(&json!({
                "model": self.model,
                "prompt": text,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RagError::Transient(format!(
                "embedding service returned HTTP {status}"
            )));
        }

        let body: EmbeddingResponse = response.json().await?;
        if body.embedding.is_empty() {
            return Err(RagError::Upstream("empty embedding received".into()));
        }
        if self.expected_dim != 0 && body.embedding.len() != self.expected_dim {
            return Err(RagError::Upstream(format!(
                "embedding dimension {} != expected {}",
                body.embedding.len(),
                self.expected_dim
            )));
        }

        let vector = l2_normalize(body.embedding)?;
        self.cache.lock().put(text.to_string(), vector.clone());

        tracing::debug!(chars = text.len(), dim = vector.len(), "embedded text");
        Ok(vector)
    }

    /// Check that the embedding model is served.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!(error = %e, "embedding health check failed");
                false
            }
        }
    }
}

fn l2_normalize(mut vector: Vec<f32>) -> Result<Vec<f32>> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(RagError::Upstream("embedding vector has zero norm".into()));
    }
    for v in &mut vector {
        *v /= norm;
    }
    Ok(vector)
}
