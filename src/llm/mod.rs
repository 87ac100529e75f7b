//! Text-generation capability client.
//!
//! Wraps an Ollama-compatible `/api/generate` endpoint behind the single
//! `Generate(prompt, opts)` operation the retrieval pipeline consumes for
//! reranking, intent classification and context summaries. Errors
//! propagate as transport failures; callers degrade to weaker strategies.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::{RagError, Result};

/// Options forwarded to the generation backend.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
    pub stop: Vec<String>,
}

impl GenerationOptions {
    /// Deterministic mode used by scoring and summary prompts.
    pub fn deterministic(max_tokens: usize) -> Self {
        Self {
            temperature: 0.0,
            top_p: 0.9,
            max_tokens,
            stop: Vec::new(),
        }
    }

    /// Low-temperature mode for classification prompts.
    pub fn consistent(max_tokens: usize) -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.9,
            max_tokens,
            stop: Vec::new(),
        }
    }

    pub fn with_stop(mut self, stop: &[&str]) -> Self {
        self.stop = stop.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Clone)]
pub struct GenerateClient {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl GenerateClient {
    pub fn new(ollama_url: &str, model: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            base_url: ollama_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Same endpoint, different model (e.g. the small summary model).
    pub fn with_model(&self, model: &str) -> Self {
        let mut clone = self.clone();
        clone.model = model.to_string();
        clone
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a completion for the prompt.
    pub async fn generate(&self, prompt: &str, opts: &GenerationOptions) -> Result<String> {
        self.generate_with_timeout(prompt, opts, self.timeout).await
    }

    /// Generate with an explicit per-call timeout cap.
    pub async fn generate_with_timeout(
        &self,
        prompt: &str,
        opts: &GenerationOptions,
        timeout: Duration,
    ) -> Result<String> {
        let mut options = json!({
            "temperature": opts.temperature,
            "top_p": opts.top_p,
            "num_predict": opts.max_tokens,
        });
        if !opts.stop.is_empty() {
            options["stop"] = json!(opts.stop);
        }

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(timeout)
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "options": options,
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let preview: String = body.chars().take(200).collect();
            return Err(RagError::Transient(format!(
                "generation service returned HTTP {status}: {preview}"
            )));
        }

        // Reverse proxies answer with HTML when the backend is down;
        // surface that clearly instead of a JSON parse error.
        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(RagError::Upstream(format!(
                "generation endpoint returned HTML instead of JSON: {preview}"
            )));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)?;
        Ok(parsed.response)
    }

    /// Check that the generation model is served.
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
                tracing::warn!(error = %e, "generation health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_options_have_zero_temperature() {
        let opts = GenerationOptions::deterministic(200);
        assert_eq!(opts.temperature, 0.0);
        assert!(opts.stop.is_empty());
    }

    #[test]
    fn stop_words_attach() {
        let opts = GenerationOptions::deterministic(100).with_stop(&["\n\n", "Запрос"]);
        assert_eq!(opts.stop, vec!["\n\n".to_string(), "Запрос".to_string()]);
    }
}
