use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which ranker produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Bm25,
    Dense,
    Hybrid,
    Fallback,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Bm25 => "bm25",
            SearchType::Dense => "dense",
            SearchType::Hybrid => "hybrid",
            SearchType::Fallback => "fallback",
        }
    }
}

/// Which reranking stage produced the final ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankMethod {
    /// Batched cross-encoder style prompt
    Batch,
    /// Single-pair 1-10 scale prompt
    Pointwise,
    /// Pre-rerank order passed through unchanged
    Fallback,
}

/// A retrieval candidate with its chunk payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub document_id: i64,
    pub chunk_id: String,
    pub code: String,
    pub document_title: String,
    pub section_title: String,
    pub content: String,
    pub chunk_type: String,
    pub page: i32,
    pub section: String,
    pub metadata: serde_json::Value,
    pub search_type: SearchType,
    pub rank: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_score: Option<f32>,
}

/// An MMR-diversified result with the selection scores recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmrResult {
    pub mmr_score: f32,
    pub relevance_score: f32,
    pub diversity_score: f32,
    #[serde(flatten)]
    pub result: SearchResult,
}

impl MmrResult {
    pub fn from_result(result: SearchResult) -> Self {
        let score = result.score;
        Self {
            mmr_score: score,
            relevance_score: score,
            diversity_score: 0.0,
            result,
        }
    }
}

/// Document lifecycle status mirrored in `uploaded_documents`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Indexing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Indexing => "indexing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "indexing" => ProcessingStatus::Indexing,
            "completed" => ProcessingStatus::Completed,
            "failed" => ProcessingStatus::Failed,
            _ => ProcessingStatus::Pending,
        }
    }
}

/// Indexing task priority. Higher processes first; FIFO within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Row of `uploaded_documents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub filename: String,
    pub original_filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub document_hash: String,
    pub category: String,
    pub document_type: String,
    pub processing_status: ProcessingStatus,
    pub processing_error: Option<String>,
    pub indexing_progress: i32,
    pub retry_count: i32,
    pub last_retry_attempt: Option<DateTime<Utc>>,
    pub token_count: Option<i64>,
    pub upload_date: DateTime<Utc>,
}

/// Row of `normative_chunks`; also the BM25 corpus unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub document_id: i64,
    pub document_title: String,
    pub chunk_type: String,
    pub content: String,
    pub page: i32,
    pub chapter: String,
    pub section: String,
}

/// Conjunctive payload filters applied to both retrieval legs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    pub document_code: Option<String>,
    pub section: Option<String>,
    pub chunk_type: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.document_code.is_none() && self.section.is_none() && self.chunk_type.is_none()
    }
}

/// Per-query feature flags for the retrieval orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchOptions {
    pub use_reranker: bool,
    pub use_mmr: bool,
    pub use_intent_classification: bool,
    pub fast_mode: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            use_reranker: true,
            use_mmr: true,
            use_intent_classification: true,
            fast_mode: false,
        }
    }
}

/// Per-candidate auto-summary produced by the context builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub topic: String,
    pub norm_type: String,
    pub key_points: Vec<String>,
    pub relevance_reason: String,
}

/// One entry of the structured context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub doc: String,
    pub section: String,
    pub page: i32,
    pub snippet: String,
    pub why: String,
    pub score: f32,
    pub document_title: String,
    pub section_title: String,
    pub chunk_type: String,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ChunkSummary>,
}

/// Top-level summary over the whole context bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaSummary {
    pub query_type: String,
    pub documents_found: usize,
    pub sections_covered: usize,
    pub avg_relevance: f32,
    pub coverage_quality: String,
    pub key_documents: Vec<String>,
    pub key_sections: Vec<String>,
}

/// Deduplicated, merged, summarized retrieval bundle returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredContext {
    pub query: String,
    pub timestamp: DateTime<Utc>,
    pub context: Vec<ContextItem>,
    pub meta_summary: MetaSummary,
    pub total_candidates: usize,
    pub avg_score: f32,
}

impl StructuredContext {
    /// The well-formed empty bundle returned when retrieval yields nothing.
    pub fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            timestamp: Utc::now(),
            context: Vec::new(),
            meta_summary: MetaSummary {
                query_type: "no_results".to_string(),
                documents_found: 0,
                sections_covered: 0,
                avg_relevance: 0.0,
                coverage_quality: "нет результатов".to_string(),
                key_documents: Vec::new(),
                key_sections: Vec::new(),
            },
            total_candidates: 0,
            avg_score: 0.0,
        }
    }
}

/// Outcome status of a consultation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsultationStatus {
    Success,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationSource {
    pub document_code: String,
    pub document_title: String,
    pub section: String,
    pub page: i32,
    pub content_preview: String,
    pub relevance_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Answer to a normative-document consultation query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consultation {
    pub status: ConsultationStatus,
    pub response: String,
    pub sources: Vec<ConsultationSource>,
    pub confidence: f32,
    pub documents_used: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_document: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Deterministic 63-bit vector-point id for a chunk.
///
/// Derived from SHA-256 over `"{document_id}_{chunk_id}"` so re-ingesting
/// identical content always addresses the same point.
pub fn point_id(document_id: i64, chunk_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(document_id.to_string().as_bytes());
    hasher.update(b"_");
    hasher.update(chunk_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes) & 0x7FFF_FFFF_FFFF_FFFF
}

/// SHA-256 hex digest of uploaded file content.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_is_deterministic_and_63_bit() {
        let a = point_id(42, "42_1_1");
        let b = point_id(42, "42_1_1");
        assert_eq!(a, b);
        assert!(a < (1u64 << 63));
        assert_ne!(a, point_id(42, "42_1_2"));
        assert_ne!(a, point_id(43, "42_1_1"));
    }

    #[test]
    fn content_hash_is_stable_sha256() {
        let h = content_hash(b"abc");
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn status_round_trips() {
        for s in ["pending", "indexing", "completed", "failed"] {
            assert_eq!(ProcessingStatus::parse(s).as_str(), s);
        }
        assert_eq!(
            ProcessingStatus::parse("unknown"),
            ProcessingStatus::Pending
        );
    }

    #[test]
    fn priority_orders_high_first() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }
}
