//! Cross-encoder style reranking with graceful degradation.
//!
//! The pipeline is `batch → pointwise → pass-through`: the batched
//! listwise prompt is primary, the single-pair 1-10 prompt takes over on
//! transport or parse failure, and when both are unavailable the
//! pre-rerank top-k passes through unchanged. The stage that produced the
//! final ordering is always annotated.

pub mod batch;
pub mod pointwise;

use crate::config::RerankerConfig;
use crate::error::{RagError, Result};
use crate::llm::{GenerateClient, GenerationOptions};
use crate::types::{RerankMethod, SearchResult};
use std::time::Duration;

pub struct RerankOutcome {
    pub results: Vec<SearchResult>,
    pub method: RerankMethod,
}

pub struct Reranker {
    llm: GenerateClient,
    cfg: RerankerConfig,
}

impl Reranker {
    pub fn new(llm: GenerateClient, cfg: RerankerConfig) -> Self {
        Self { llm, cfg }
    }

    /// Rerank `results` down to `top_k`, degrading through the chain.
    pub async fn rerank_with_fallback(
        &self,
        query: &str,
        results: Vec<SearchResult>,
        top_k: usize,
    ) -> RerankOutcome {
        let mut candidates = results;
        candidates.truncate(self.cfg.initial_top_k);

        if candidates.len() <= top_k {
            tracing::info!(
                count = candidates.len(),
                top_k,
                "not enough candidates to rerank"
            );
            return RerankOutcome {
                results: candidates,
                method: RerankMethod::Fallback,
            };
        }

        match self.batch_scores(query, &candidates).await {
            Ok(scores) => {
                tracing::info!(candidates = candidates.len(), top_k, "batch rerank applied");
                return RerankOutcome {
                    results: apply_scores(candidates, &scores, top_k),
                    method: RerankMethod::Batch,
                };
            }
            Err(e) => {
                tracing::warn!(error = %e, "batch rerank failed, trying pointwise");
            }
        }

        match self.pointwise_scores(query, &candidates).await {
            Ok(scores) => {
                tracing::info!(
                    candidates = candidates.len(),
                    top_k,
                    "pointwise rerank applied"
                );
                RerankOutcome {
                    results: apply_scores(candidates, &scores, top_k),
                    method: RerankMethod::Pointwise,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "pointwise rerank failed, passing through");
                candidates.truncate(top_k);
                for result in &mut candidates {
                    result.rerank_score = Some(result.score);
                    result.original_score = Some(result.score);
                }
                RerankOutcome {
                    results: candidates,
                    method: RerankMethod::Fallback,
                }
            }
        }
    }

    /// One listwise prompt per batch of `max_batch_size` pairs.
    async fn batch_scores(&self, query: &str, candidates: &[SearchResult]) -> Result<Vec<f32>> {
        let timeout = Duration::from_secs(self.cfg.batch_timeout_secs);
        let mut scores = Vec::with_capacity(candidates.len());

        for chunk in candidates.chunks(self.cfg.max_batch_size) {
            let passages: Vec<&str> = chunk.iter().map(|r| r.content.as_str()).collect();
            let prompt = batch::build_batch_prompt(query, &passages);
            let opts = GenerationOptions::deterministic(chunk.len() * 10)
                .with_stop(&["\n\n", "Запрос", "Документ"]);

            let output = self.llm.generate_with_timeout(&prompt, &opts, timeout).await?;
            if output.trim().is_empty() {
                return Err(RagError::Upstream("reranker returned empty output".into()));
            }
            scores.extend(batch::parse_batch_scores(&output, chunk.len()));
        }

        Ok(scores)
    }

    /// One prompt per pair; scores min-max normalized across the set.
    async fn pointwise_scores(
        &self,
        query: &str,
        candidates: &[SearchResult],
    ) -> Result<Vec<f32>> {
        let timeout = Duration::from_secs(self.cfg.timeout_secs);
        let mut scores = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let snippet: String = candidate.content.chars().take(2000).collect();
            let prompt = pointwise::build_pointwise_prompt(query, &snippet);
            let opts = GenerationOptions::consistent(10);

            let output = self.llm.generate_with_timeout(&prompt, &opts, timeout).await?;
            scores.push(pointwise::extract_score(&output));
        }

        Ok(normalize(scores))
    }
}

/// Assign scores positionally, keep the original score, order descending,
/// truncate to `top_k`.
fn apply_scores(
    mut candidates: Vec<SearchResult>,
    scores: &[f32],
    top_k: usize,
) -> Vec<SearchResult> {
    for (candidate, score) in candidates.iter_mut().zip(scores) {
        candidate.original_score = Some(candidate.score);
        candidate.rerank_score = Some(*score);
        candidate.score = *score;
    }
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(top_k);
    candidates
}

fn normalize(scores: Vec<f32>) -> Vec<f32> {
    if scores.is_empty() {
        return scores;
    }
    let max = scores.iter().cloned().fold(f32::MIN, f32::max);
    let min = scores.iter().cloned().fold(f32::MAX, f32::min);
    if (max - min).abs() < 1e-9 {
        return vec![0.5; scores.len()];
    }
    scores.into_iter().map(|s| (s - min) / (max - min)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SearchType;

    fn result(id: &str, score: f32) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            score,
            document_id: 1,
            chunk_id: id.to_string(),
            code: String::new(),
            document_title: String::new(),
            section_title: String::new(),
            content: format!("содержимое {id}"),
            chunk_type: "paragraph".to_string(),
            page: 1,
            section: String::new(),
            metadata: serde_json::Value::Null,
            search_type: SearchType::Hybrid,
            rank: 0,
            rerank_score: None,
            original_score: None,
        }
    }

    #[test]
    fn apply_scores_reorders_and_keeps_originals() {
        let candidates = vec![result("a", 0.9), result("b", 0.6), result("c", 0.3)];
        let reranked = apply_scores(candidates, &[0.1, 0.95, 0.5], 2);

        assert_eq!(reranked.len(), 2);
        assert_eq!(reranked[0].id, "b");
        assert_eq!(reranked[0].rerank_score, Some(0.95));
        assert_eq!(reranked[0].original_score, Some(0.6));
        assert_eq!(reranked[1].id, "c");
    }

    #[test]
    fn normalize_spreads_to_unit_interval() {
        let normalized = normalize(vec![2.0, 4.0, 6.0]);
        assert_eq!(normalized, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn normalize_collapses_uniform_scores_to_neutral() {
        let normalized = normalize(vec![0.7, 0.7]);
        assert_eq!(normalized, vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn unreachable_generator_degrades_to_passthrough() {
        // Port 9 (discard) refuses connections immediately, so both the
        // batch and pointwise stages fail at transport
        let llm = GenerateClient::new("http://127.0.0.1:9", "test-model", 1).unwrap();
        let reranker = Reranker::new(
            llm,
            crate::config::RagConfig::default().reranker,
        );

        let candidates = vec![
            result("a", 0.9),
            result("b", 0.8),
            result("c", 0.7),
            result("d", 0.6),
        ];
        let outcome = reranker
            .rerank_with_fallback("запрос", candidates, 2)
            .await;

        assert_eq!(outcome.method, RerankMethod::Fallback);
        // Exactly the pre-rerank top-k, order preserved
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].id, "a");
        assert_eq!(outcome.results[1].id, "b");
    }

    #[tokio::test]
    async fn small_candidate_sets_pass_through_unranked() {
        let llm = GenerateClient::new("http://127.0.0.1:9", "test-model", 1).unwrap();
        let reranker = Reranker::new(llm, crate::config::RagConfig::default().reranker);

        let candidates = vec![result("a", 0.9)];
        let outcome = reranker.rerank_with_fallback("запрос", candidates, 8).await;
        assert_eq!(outcome.method, RerankMethod::Fallback);
        assert_eq!(outcome.results.len(), 1);
    }
}
