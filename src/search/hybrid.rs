//! Hybrid fusion of BM25 and dense retrieval.
//!
//! Two fusion modes selectable per query: alpha blending over min-max
//! normalized scores, and Reciprocal Rank Fusion. The union keeps BM25
//! candidates ahead of dense ones on score ties (stable insertion order).
//!
//! `HybridSearcher` owns the lazily trained BM25 corpus cache: the corpus
//! is loaded from the database on first query, then treated as immutable
//! until an administrative `invalidate_corpus`. When one retrieval leg
//! fails the other serves alone; when both fail the result set is empty.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::bm25::Bm25Engine;
use super::dense::DenseRetriever;
use crate::config::FusionConfig;
use crate::error::Result;
use crate::processing::MetadataExtractor;
use crate::storage::DatabaseManager;
use crate::types::{ChunkRecord, SearchFilters, SearchResult, SearchType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionMode {
    Alpha,
    Rrf,
}

/// Alpha-blend two result lists: min-max normalize each list's scores,
/// then `score = (1-α)·bm25 + α·dense`. Missing contributions are 0.
pub fn alpha_blend(
    bm25_results: Vec<SearchResult>,
    dense_results: Vec<SearchResult>,
    alpha: f32,
) -> Vec<SearchResult> {
    let bm25_norm = min_max_normalize(&bm25_results);
    let dense_norm = min_max_normalize(&dense_results);

    let mut merged: Vec<SearchResult> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (result, norm) in bm25_results.into_iter().zip(bm25_norm) {
        let mut result = result;
        result.score = (1.0 - alpha) * norm;
        index.insert(result.id.clone(), merged.len());
        merged.push(result);
    }

    for (result, norm) in dense_results.into_iter().zip(dense_norm) {
        let dense_score = alpha * norm;
        match index.get(&result.id) {
            Some(&i) => merged[i].score += dense_score,
            None => {
                let mut result = result;
                result.score = dense_score;
                index.insert(result.id.clone(), merged.len());
                merged.push(result);
            }
        }
    }

    // Stable sort keeps BM25-before-dense on ties
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

/// Reciprocal Rank Fusion: `score(x) = Σ 1/(k + rank_list(x))` over both
/// lists, 1-based ranks. All fused results are tagged `hybrid`.
pub fn rrf_fuse(
    bm25_results: Vec<SearchResult>,
    dense_results: Vec<SearchResult>,
    k: usize,
) -> Vec<SearchResult> {
    let mut merged: Vec<SearchResult> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (rank, result) in bm25_results.into_iter().enumerate() {
        let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
        let mut result = result;
        result.score = rrf;
        result.search_type = SearchType::Hybrid;
        index.insert(result.id.clone(), merged.len());
        merged.push(result);
    }

    for (rank, result) in dense_results.into_iter().enumerate() {
        let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
        match index.get(&result.id) {
            Some(&i) => merged[i].score += rrf,
            None => {
                let mut result = result;
                result.score = rrf;
                result.search_type = SearchType::Hybrid;
                index.insert(result.id.clone(), merged.len());
                merged.push(result);
            }
        }
    }

    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

fn min_max_normalize(results: &[SearchResult]) -> Vec<f32> {
    if results.is_empty() {
        return Vec::new();
    }
    let max = results.iter().map(|r| r.score).fold(f32::MIN, f32::max);
    let min = results.iter().map(|r| r.score).fold(f32::MAX, f32::min);
    let range = if (max - min).abs() < 1e-9 {
        1.0
    } else {
        max - min
    };
    results.iter().map(|r| (r.score - min) / range).collect()
}

struct Bm25Cache {
    engine: Bm25Engine,
    documents: Vec<ChunkRecord>,
    codes: HashMap<String, String>,
}

pub struct HybridSearcher {
    db: Arc<DatabaseManager>,
    dense: DenseRetriever,
    fusion: FusionConfig,
    cache: RwLock<Option<Arc<Bm25Cache>>>,
    metadata: MetadataExtractor,
}

impl HybridSearcher {
    pub fn new(db: Arc<DatabaseManager>, dense: DenseRetriever, fusion: FusionConfig) -> Self {
        Self {
            db,
            dense,
            fusion,
            cache: RwLock::new(None),
            metadata: MetadataExtractor::new(),
        }
    }

    /// Hybrid search: both legs with `search_k` candidates each, fused,
    /// truncated to `search_k`. Degrades to the surviving leg when the
    /// other fails.
    pub async fn search(
        &self,
        query: &str,
        search_k: usize,
        filters: &SearchFilters,
        mode: Option<FusionMode>,
    ) -> Result<Vec<SearchResult>> {
        let dense_results = match self.dense.search(query, search_k, filters).await {
            Ok(results) => Some(results),
            Err(e) => {
                tracing::warn!(error = %e, "dense leg failed, degrading to BM25 only");
                None
            }
        };

        let bm25_results = match self.bm25_corpus().await {
            Some(cache) => {
                let documents = self.filter_corpus(&cache, filters);
                let mut results = cache.engine.search(query, &documents, search_k);
                for result in &mut results {
                    if let Some(code) = cache.codes.get(&result.chunk_id) {
                        result.code = code.clone();
                    }
                }
                Some(results)
            }
            None => {
                tracing::warn!("BM25 corpus unavailable, degrading to dense only");
                None
            }
        };

        tracing::info!(
            query,
            search_k,
            bm25 = bm25_results.as_ref().map(|r| r.len()).unwrap_or(0),
            dense = dense_results.as_ref().map(|r| r.len()).unwrap_or(0),
            "hybrid search candidates"
        );

        let mut fused = match (bm25_results, dense_results) {
            (Some(bm25), Some(dense)) => {
                let mode = mode.unwrap_or(if self.fusion.use_rrf {
                    FusionMode::Rrf
                } else {
                    FusionMode::Alpha
                });
                match mode {
                    FusionMode::Rrf => rrf_fuse(bm25, dense, self.fusion.rrf_k),
                    FusionMode::Alpha => alpha_blend(bm25, dense, self.fusion.alpha),
                }
            }
            (Some(bm25), None) => bm25,
            (None, Some(dense)) => dense,
            (None, None) => Vec::new(),
        };

        fused.truncate(search_k);
        for (rank, result) in fused.iter_mut().enumerate() {
            result.rank = rank + 1;
        }
        Ok(fused)
    }

    /// Lazily train the BM25 engine on the full chunk corpus.
    async fn bm25_corpus(&self) -> Option<Arc<Bm25Cache>> {
        if let Some(cache) = self.cache.read().as_ref() {
            return Some(Arc::clone(cache));
        }

        let documents = match self.db.get_all_chunks().await {
            Ok(documents) => documents,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load BM25 corpus");
                return None;
            }
        };
        if documents.is_empty() {
            return None;
        }

        let mut engine = Bm25Engine::new();
        engine.fit(&documents);

        let codes = documents
            .iter()
            .filter_map(|doc| {
                self.metadata
                    .extract_document_code(&doc.document_title)
                    .map(|code| (doc.chunk_id.clone(), code))
            })
            .collect();

        let cache = Arc::new(Bm25Cache {
            engine,
            documents,
            codes,
        });
        *self.cache.write() = Some(Arc::clone(&cache));
        Some(cache)
    }

    /// Post-filter the cached corpus for the BM25 leg.
    fn filter_corpus(&self, cache: &Bm25Cache, filters: &SearchFilters) -> Vec<ChunkRecord> {
        cache
            .documents
            .iter()
            .filter(|doc| {
                if let Some(code) = filters.document_code.as_deref() {
                    if code != "all"
                        && cache.codes.get(&doc.chunk_id).map(String::as_str) != Some(code)
                    {
                        return false;
                    }
                }
                if let Some(section) = filters.section.as_deref() {
                    if doc.section != section {
                        return false;
                    }
                }
                if let Some(chunk_type) = filters.chunk_type.as_deref() {
                    if doc.chunk_type != chunk_type {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Drop the trained corpus; the next query re-trains.
    pub fn invalidate_corpus(&self) {
        *self.cache.write() = None;
        tracing::info!("BM25 corpus cache invalidated");
    }

    /// (trained, corpus_size, avgdl)
    pub fn corpus_stats(&self) -> (bool, usize, f32) {
        match self.cache.read().as_ref() {
            Some(cache) => (true, cache.engine.corpus_size(), cache.engine.avgdl()),
            None => (false, 0, 0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, score: f32, search_type: SearchType) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            score,
            document_id: 1,
            chunk_id: id.to_string(),
            code: String::new(),
            document_title: String::new(),
            section_title: String::new(),
            content: format!("content {id}"),
            chunk_type: "paragraph".to_string(),
            page: 1,
            section: String::new(),
            metadata: serde_json::Value::Null,
            search_type,
            rank: 0,
            rerank_score: None,
            original_score: None,
        }
    }

    fn bm25(ids_scores: &[(&str, f32)]) -> Vec<SearchResult> {
        ids_scores
            .iter()
            .map(|(id, s)| result(id, *s, SearchType::Bm25))
            .collect()
    }

    fn dense(ids_scores: &[(&str, f32)]) -> Vec<SearchResult> {
        ids_scores
            .iter()
            .map(|(id, s)| result(id, *s, SearchType::Dense))
            .collect()
    }

    #[test]
    fn alpha_one_equals_dense_ranking() {
        let fused = alpha_blend(
            bm25(&[("a", 9.0), ("b", 5.0), ("c", 1.0)]),
            dense(&[("c", 0.9), ("b", 0.5), ("a", 0.1)]),
            1.0,
        );
        let order: Vec<&str> = fused.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(&order[..3], &["c", "b", "a"]);
    }

    #[test]
    fn alpha_zero_equals_bm25_ranking() {
        let fused = alpha_blend(
            bm25(&[("a", 9.0), ("b", 5.0), ("c", 1.0)]),
            dense(&[("c", 0.9), ("b", 0.5), ("d", 0.1)]),
            0.0,
        );
        let order: Vec<&str> = fused.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(&order[..3], &["a", "b", "c"]);
        // dense-only candidate contributes nothing at alpha=0
        let d = fused.iter().find(|r| r.id == "d").unwrap();
        assert_eq!(d.score, 0.0);
    }

    #[test]
    fn missing_contribution_defaults_to_zero() {
        let fused = alpha_blend(
            bm25(&[("a", 2.0), ("b", 1.0)]),
            dense(&[("c", 0.8)]),
            0.6,
        );
        // "c" is alone in its list: normalized score 0, so only bm25 side orders
        let a = fused.iter().find(|r| r.id == "a").unwrap();
        let b = fused.iter().find(|r| r.id == "b").unwrap();
        assert!((a.score - 0.4).abs() < 1e-6);
        assert!(b.score.abs() < 1e-6);
    }

    #[test]
    fn rrf_matches_reference_scores() {
        // BM25 ranks [A,B,C], dense ranks [B,A,D], k=60
        let fused = rrf_fuse(
            bm25(&[("a", 9.0), ("b", 5.0), ("c", 1.0)]),
            dense(&[("b", 0.9), ("a", 0.5), ("d", 0.1)]),
            60,
        );

        let score = |id: &str| fused.iter().find(|r| r.id == id).unwrap().score;
        let expected_ab = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((score("a") - expected_ab).abs() < 1e-6);
        assert!((score("b") - expected_ab).abs() < 1e-6);
        assert!((score("c") - 1.0 / 63.0).abs() < 1e-6);
        assert!((score("d") - 1.0 / 63.0).abs() < 1e-6);

        // A and B share first place; the stable tie-break keeps BM25
        // insertion order for the C/D tie
        let order: Vec<&str> = fused.iter().map(|r| r.id.as_str()).collect();
        assert!(order[0] == "a" || order[0] == "b");
        assert!(order[1] == "a" || order[1] == "b");
        assert_eq!(&order[2..], &["c", "d"]);

        assert!(fused.iter().all(|r| r.search_type == SearchType::Hybrid));
    }

    #[test]
    fn identical_scores_normalize_uniformly() {
        let fused = alpha_blend(
            bm25(&[("a", 3.0), ("b", 3.0)]),
            dense(&[]),
            0.0,
        );
        // max == min collapses normalization to zero for the whole list
        assert!(fused.iter().all(|r| r.score == 0.0));
        // and the stable order is preserved
        let order: Vec<&str> = fused.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }
}
