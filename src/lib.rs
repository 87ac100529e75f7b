//! Hybrid-retrieval RAG engine for normative documents.
//!
//! Ingests building codes and standards (PDF/DOCX/TXT), segments them into
//! token-budgeted chunks, indexes them in PostgreSQL and a Qdrant-compatible
//! vector store, and answers free-form questions through BM25 + dense
//! hybrid retrieval with reranking, MMR diversification and structured
//! context assembly. Embeddings and generation are consumed from an
//! Ollama-compatible service.

pub mod config;
pub mod embeddings;
pub mod error;
pub mod indexing;
pub mod llm;
pub mod processing;
pub mod rag;
pub mod rag_engine;
pub mod reranking;
pub mod search;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use config::RagConfig;
pub use error::{RagError, Result};
pub use indexing::{FsContentProvider, IndexingPipeline, IndexingTask};
pub use rag_engine::RagEngine;
pub use types::{
    ChunkRecord, Consultation, DocumentRecord, MmrResult, Priority, ProcessingStatus,
    SearchFilters, SearchOptions, SearchResult, StructuredContext,
};
