//! Maximal Marginal Relevance diversification.
//!
//! Re-orders a ranked list to balance relevance against redundancy:
//! `MMR = λ·relevance − (1−λ)·max_similarity_to_selected`. Similarity is
//! staged: identity and containment tiers (same id / chunk / document /
//! code) are decided by rule, and only unrelated pairs fall through to
//! TF-cosine over content tokens with a keyword-overlap boost.

use std::collections::{HashMap, HashSet};

use super::tokenize;
use crate::config::MmrConfig;
use crate::types::{MmrResult, SearchResult};

pub struct MmrDiversifier {
    lambda: f32,
    #[allow(dead_code)]
    similarity_threshold: f32,
}

impl MmrDiversifier {
    pub fn new(cfg: &MmrConfig) -> Self {
        Self {
            lambda: cfg.lambda,
            similarity_threshold: cfg.similarity_threshold,
        }
    }

    /// Diversify `results` down to `k` picks. Lists already within budget
    /// pass through with their scores converted.
    pub fn diversify(&self, results: Vec<SearchResult>, k: usize, query: &str) -> Vec<MmrResult> {
        if results.len() <= k {
            return results.into_iter().map(MmrResult::from_result).collect();
        }

        tracing::info!(
            candidates = results.len(),
            k,
            lambda = self.lambda,
            "MMR diversification"
        );

        let mut candidates: Vec<MmrResult> =
            results.into_iter().map(MmrResult::from_result).collect();

        // Relevance to the query; the incoming score serves when the
        // query is empty
        if !query.is_empty() {
            let query_tf = term_frequencies(&tokenize(query));
            for candidate in &mut candidates {
                let content_tf = term_frequencies(&tokenize(&candidate.result.content));
                candidate.relevance_score = cosine_similarity(&query_tf, &content_tf);
            }
        }

        // Highest relevance opens the selection
        candidates.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut remaining = candidates;
        let mut selected: Vec<MmrResult> = vec![remaining.remove(0)];

        while selected.len() < k && !remaining.is_empty() {
            let mut best_index = 0;
            let mut best_score = f32::NEG_INFINITY;

            for (index, candidate) in remaining.iter_mut().enumerate() {
                let max_similarity = selected
                    .iter()
                    .map(|picked| similarity(&candidate.result, &picked.result))
                    .fold(0.0f32, f32::max);

                let mmr_score = self.lambda * candidate.relevance_score
                    - (1.0 - self.lambda) * max_similarity;
                candidate.mmr_score = mmr_score;
                candidate.diversity_score = max_similarity;

                if mmr_score > best_score {
                    best_score = mmr_score;
                    best_index = index;
                }
            }

            selected.push(remaining.remove(best_index));
        }

        for (rank, pick) in selected.iter_mut().enumerate() {
            pick.result.rank = rank + 1;
        }
        selected
    }

    /// Average pairwise similarity and distinct-document counts for a
    /// result set; used by the stats surface.
    pub fn diversity_stats(&self, results: &[MmrResult]) -> (f32, usize, usize) {
        let unique_documents: HashSet<i64> =
            results.iter().map(|r| r.result.document_id).collect();
        let unique_codes: HashSet<&str> = results
            .iter()
            .map(|r| r.result.code.as_str())
            .filter(|c| !c.is_empty())
            .collect();

        let mut total = 0.0f32;
        let mut pairs = 0usize;
        for (i, a) in results.iter().enumerate() {
            for b in &results[i + 1..] {
                total += similarity(&a.result, &b.result);
                pairs += 1;
            }
        }
        let avg = if pairs > 0 { total / pairs as f32 } else { 0.0 };
        (1.0 - avg, unique_documents.len(), unique_codes.len())
    }
}

/// Staged similarity between two results. Rule tiers first, content
/// cosine as the last resort.
fn similarity(a: &SearchResult, b: &SearchResult) -> f32 {
    if a.id == b.id {
        return 1.0;
    }
    if a.document_id == b.document_id && a.chunk_id == b.chunk_id {
        return 0.9;
    }
    if a.document_id == b.document_id {
        return 0.7;
    }
    if !a.code.is_empty() && a.code == b.code {
        return 0.6;
    }
    content_similarity(&a.content, &b.content)
}

/// TF-cosine with a keyword-overlap boost capped at +0.2.
fn content_similarity(a: &str, b: &str) -> f32 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let tf_a = term_frequencies(&tokens_a);
    let tf_b = term_frequencies(&tokens_b);
    let mut sim = cosine_similarity(&tf_a, &tf_b);

    let set_a: HashSet<&String> = tokens_a.iter().collect();
    let set_b: HashSet<&String> = tokens_b.iter().collect();
    let common = set_a.intersection(&set_b).count();
    if common > 0 {
        let boost = common as f32 / tokens_a.len().max(tokens_b.len()) as f32;
        sim = (sim + boost * 0.2).min(1.0);
    }
    sim
}

fn term_frequencies(tokens: &[String]) -> HashMap<String, f32> {
    let mut tf: HashMap<String, f32> = HashMap::new();
    if tokens.is_empty() {
        return tf;
    }
    for token in tokens {
        *tf.entry(token.clone()).or_insert(0.0) += 1.0;
    }
    let total = tokens.len() as f32;
    for value in tf.values_mut() {
        *value /= total;
    }
    tf
}

fn cosine_similarity(a: &HashMap<String, f32>, b: &HashMap<String, f32>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f32 = a
        .iter()
        .filter_map(|(token, weight)| b.get(token).map(|other| weight * other))
        .sum();
    let norm_a: f32 = a.values().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.values().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SearchType;

    fn result(id: &str, document_id: i64, code: &str, content: &str, score: f32) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            score,
            document_id,
            chunk_id: id.to_string(),
            code: code.to_string(),
            document_title: String::new(),
            section_title: String::new(),
            content: content.to_string(),
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

    fn diversifier(lambda: f32) -> MmrDiversifier {
        MmrDiversifier::new(&MmrConfig {
            lambda,
            similarity_threshold: 0.8,
        })
    }

    #[test]
    fn similarity_tiers() {
        let a = result("x", 1, "СП 1", "несущая способность основания", 1.0);
        let same_id = result("x", 2, "СП 2", "другое содержимое текста", 1.0);
        assert_eq!(similarity(&a, &same_id), 1.0);

        let same_doc = result("y", 1, "СП 1", "другое содержимое текста", 1.0);
        assert_eq!(similarity(&a, &same_doc), 0.7);

        let same_code = result("z", 3, "СП 1", "другое содержимое текста", 1.0);
        assert_eq!(similarity(&a, &same_code), 0.6);

        let unrelated = result("w", 4, "ГОСТ 9", "вентиляция производственных помещений", 1.0);
        assert!(similarity(&a, &unrelated) < 0.2);
    }

    #[test]
    fn lambda_one_keeps_relevance_order() {
        let results = vec![
            result("a", 1, "", "несущая способность основания зданий", 0.9),
            result("b", 2, "", "несущая способность основания сооружений", 0.8),
            result("c", 3, "", "пожарная безопасность помещений", 0.1),
        ];
        // Empty query keeps incoming scores as relevance; λ=1 ignores
        // similarity entirely
        let picks = diversifier(1.0).diversify(results, 2, "");
        assert_eq!(picks.len(), 2);
        assert_eq!(picks[0].result.id, "a");
        assert_eq!(picks[1].result.id, "b");
    }

    #[test]
    fn lambda_zero_prefers_diverse_picks() {
        let results = vec![
            result("a1", 1, "", "требования к несущим основаниям зданий", 0.9),
            result("a2", 1, "", "требования к несущим основаниям зданий", 0.85),
            result("b", 2, "", "пожарная безопасность эвакуационных путей", 0.2),
        ];
        // λ=0 optimizes only diversity: the same-document near-duplicate
        // (similarity 0.7) loses to the unrelated chunk
        let picks = diversifier(0.0).diversify(results, 2, "");
        assert_eq!(picks[0].result.id, "a1");
        assert_eq!(picks[1].result.id, "b");
        assert!(picks[1].diversity_score < 0.5);
    }

    #[test]
    fn within_budget_passes_through() {
        let results = vec![result("a", 1, "", "текст", 0.5)];
        let picks = diversifier(0.7).diversify(results, 8, "запрос");
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].mmr_score, 0.5);
    }

    #[test]
    fn records_selection_scores_and_ranks() {
        let results = vec![
            result("a", 1, "", "несущая способность основания", 0.9),
            result("b", 2, "", "несущая способность фундамента", 0.8),
            result("c", 3, "", "освещение рабочих мест", 0.3),
        ];
        let picks = diversifier(0.7).diversify(results, 2, "несущая способность");
        assert_eq!(picks.len(), 2);
        assert_eq!(picks[0].result.rank, 1);
        assert_eq!(picks[1].result.rank, 2);
        // Later picks carry the similarity to the already-selected set
        assert!(picks[1].diversity_score >= 0.0);
    }

    #[test]
    fn diversity_stats_counts_documents() {
        let picks: Vec<MmrResult> = vec![
            MmrResult::from_result(result("a", 1, "СП 1", "текст first", 1.0)),
            MmrResult::from_result(result("b", 2, "СП 2", "совсем другой текст", 0.5)),
        ];
        let (_diversity, documents, codes) = diversifier(0.7).diversity_stats(&picks);
        assert_eq!(documents, 2);
        assert_eq!(codes, 2);
    }
}
