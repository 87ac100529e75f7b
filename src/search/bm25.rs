//! Classical BM25 over the chunk corpus.
//!
//! Pure in-memory ranker: `fit` recomputes the corpus statistics, `search`
//! scores a caller-supplied (already filtered) document list. IDF uses the
//! standard `ln((N - df + 0.5) / (df + 0.5))` form, which goes negative
//! for terms present in most of the corpus.

use rayon::prelude::*;
use std::collections::HashMap;

use super::tokenize;
use crate::types::{ChunkRecord, SearchResult, SearchType};

pub struct Bm25Engine {
    k1: f32,
    b: f32,
    idf: HashMap<String, f32>,
    freqs: HashMap<String, HashMap<String, u32>>,
    doc_len: HashMap<String, usize>,
    avgdl: f32,
    corpus_size: usize,
}

impl Bm25Engine {
    pub fn new() -> Self {
        Self::with_params(1.2, 0.75)
    }

    pub fn with_params(k1: f32, b: f32) -> Self {
        Self {
            k1,
            b,
            idf: HashMap::new(),
            freqs: HashMap::new(),
            doc_len: HashMap::new(),
            avgdl: 0.0,
            corpus_size: 0,
        }
    }

    pub fn corpus_size(&self) -> usize {
        self.corpus_size
    }

    pub fn avgdl(&self) -> f32 {
        self.avgdl
    }

    /// Recompute document frequencies, IDF, per-document term frequencies
    /// and lengths over the corpus.
    pub fn fit(&mut self, documents: &[ChunkRecord]) {
        tracing::info!(documents = documents.len(), "training BM25");

        let per_doc: Vec<(String, Vec<String>)> = documents
            .par_iter()
            .map(|doc| (doc.chunk_id.clone(), tokenize(&doc.content)))
            .collect();

        self.corpus_size = documents.len();
        self.freqs.clear();
        self.doc_len.clear();
        self.idf.clear();

        let mut doc_freqs: HashMap<String, u32> = HashMap::new();

        for (chunk_id, tokens) in per_doc {
            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *tf.entry(token.clone()).or_insert(0) += 1;
            }
            for term in tf.keys() {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            self.doc_len.insert(chunk_id.clone(), tokens.len());
            self.freqs.insert(chunk_id, tf);
        }

        self.avgdl = if self.doc_len.is_empty() {
            0.0
        } else {
            self.doc_len.values().sum::<usize>() as f32 / self.doc_len.len() as f32
        };

        let n = self.corpus_size as f32;
        for (term, df) in doc_freqs {
            let idf = ((n - df as f32 + 0.5) / (df as f32 + 0.5)).ln();
            self.idf.insert(term, idf);
        }

        tracing::info!(
            corpus_size = self.corpus_size,
            avgdl = self.avgdl,
            "BM25 training complete"
        );
    }

    /// Rank the supplied documents against the query. Documents scoring
    /// zero are dropped; results carry 1-based ranks.
    pub fn search(&self, query: &str, documents: &[ChunkRecord], k: usize) -> Vec<SearchResult> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || self.avgdl == 0.0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = Vec::new();
        for (index, doc) in documents.iter().enumerate() {
            let Some(tf) = self.freqs.get(&doc.chunk_id) else {
                continue;
            };
            let doc_len = *self.doc_len.get(&doc.chunk_id).unwrap_or(&0) as f32;

            let mut score = 0.0f32;
            for token in &query_tokens {
                if let Some(&freq) = tf.get(token) {
                    let idf = self.idf.get(token).copied().unwrap_or(0.0);
                    let tf_term = freq as f32;
                    score += idf * (tf_term * (self.k1 + 1.0))
                        / (tf_term
                            + self.k1 * (1.0 - self.b + self.b * (doc_len / self.avgdl)));
                }
            }

            if score > 0.0 {
                scored.push((index, score));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        scored
            .into_iter()
            .enumerate()
            .map(|(rank, (index, score))| {
                let doc = &documents[index];
                SearchResult {
                    id: doc.chunk_id.clone(),
                    score,
                    document_id: doc.document_id,
                    chunk_id: doc.chunk_id.clone(),
                    code: String::new(),
                    document_title: doc.document_title.clone(),
                    section_title: doc.chapter.clone(),
                    content: doc.content.clone(),
                    chunk_type: doc.chunk_type.clone(),
                    page: doc.page,
                    section: doc.section.clone(),
                    metadata: serde_json::Value::Null,
                    search_type: SearchType::Bm25,
                    rank: rank + 1,
                    rerank_score: None,
                    original_score: None,
                }
            })
            .collect()
    }
}

impl Default for Bm25Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, document_id: i64, content: &str) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.to_string(),
            document_id,
            document_title: format!("Документ {document_id}"),
            chunk_type: "paragraph".to_string(),
            content: content.to_string(),
            page: 1,
            chapter: String::new(),
            section: String::new(),
        }
    }

    fn corpus() -> Vec<ChunkRecord> {
        vec![
            chunk(
                "1_1_1",
                1,
                "Нормы проектирования оснований содержат требования СП 22.13330 к несущей способности оснований",
            ),
            chunk(
                "1_1_2",
                1,
                "Расчет оснований по деформациям выполняется согласно указаниям настоящего раздела",
            ),
            chunk(
                "2_1_1",
                2,
                "Пожарная безопасность зданий обеспечивается комплексом организационных мероприятий",
            ),
            chunk(
                "2_1_2",
                2,
                "Стальные конструкции проектируются с учетом коррозионной защиты элементов",
            ),
            chunk(
                "3_1_1",
                3,
                "Вентиляция производственных помещений предусматривает приток наружного воздуха",
            ),
        ]
    }

    #[test]
    fn exact_code_outranks_generic_matches() {
        let documents = corpus();
        let mut engine = Bm25Engine::new();
        engine.fit(&documents);

        let results = engine.search("и в на СП 22.13330", &documents, 10);
        assert!(!results.is_empty());
        // Only the chunk containing the registry number scores
        assert_eq!(results[0].chunk_id, "1_1_1");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[0].search_type, SearchType::Bm25);
    }

    #[test]
    fn zero_score_documents_are_dropped() {
        let documents = corpus();
        let mut engine = Bm25Engine::new();
        engine.fit(&documents);

        let results = engine.search("водоснабжение канализация", &documents, 10);
        assert!(results.is_empty());
    }

    #[test]
    fn ranks_are_descending_by_score() {
        let documents = corpus();
        let mut engine = Bm25Engine::new();
        engine.fit(&documents);

        // "оснований" appears twice in 1_1_1 and once in 1_1_2
        let results = engine.search("оснований", &documents, 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id, "1_1_1");
        assert_eq!(results[1].chunk_id, "1_1_2");
        assert!(results[0].score > results[1].score);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.rank, i + 1);
        }
    }

    #[test]
    fn fit_computes_average_length() {
        let documents = corpus();
        let mut engine = Bm25Engine::new();
        engine.fit(&documents);
        assert_eq!(engine.corpus_size(), 5);
        assert!(engine.avgdl() > 0.0);
    }

    #[test]
    fn search_respects_post_filtered_corpus() {
        let documents = corpus();
        let mut engine = Bm25Engine::new();
        engine.fit(&documents);

        // Caller filters the corpus before searching
        let filtered: Vec<ChunkRecord> = documents
            .iter()
            .filter(|d| d.document_id == 2)
            .cloned()
            .collect();
        let results = engine.search("конструкции", &filtered, 10);
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.document_id == 2));
    }
}
