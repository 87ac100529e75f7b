//! Retrieval orchestrator.
//!
//! Glues intent classification, hybrid retrieval, reranking, MMR and the
//! context builder into the public `search` / `build_context` operations,
//! and owns the write path glue: chunk indexing into the database and the
//! vector store, and the document delete cascade.

use chrono::Utc;
use std::sync::Arc;

use crate::config::RagConfig;
use crate::embeddings::EmbeddingClient;
use crate::error::{RagError, Result};
use crate::llm::GenerateClient;
use crate::processing::MetadataExtractor;
use crate::rag::{ContextBuilder, IntentClassifier};
use crate::reranking::Reranker;
use crate::search::{DenseRetriever, HybridSearcher, MmrDiversifier};
use crate::storage::{DatabaseManager, PointPayload, PointRecord, VectorStoreClient};
use crate::types::{
    point_id, ChunkRecord, Consultation, ConsultationSource, ConsultationStatus, SearchFilters,
    SearchOptions, SearchResult, StructuredContext,
};

pub struct RagEngine {
    config: RagConfig,
    db: Arc<DatabaseManager>,
    vectors: Arc<VectorStoreClient>,
    embeddings: Arc<EmbeddingClient>,
    hybrid: HybridSearcher,
    reranker: Reranker,
    mmr: MmrDiversifier,
    intent: IntentClassifier,
    context_builder: ContextBuilder,
    metadata: MetadataExtractor,
}

impl RagEngine {
    /// Connect all capability clients, bootstrap the schema and the vector
    /// collection, and wire the retrieval pipeline.
    pub async fn new(config: RagConfig) -> Result<Self> {
        config.validate().map_err(RagError::InputInvalid)?;

        let db = Arc::new(
            DatabaseManager::connect(&config.services.database_url, config.db.clone()).await?,
        );
        db.ensure_schema().await?;

        let vectors = Arc::new(VectorStoreClient::new(
            &config.services.qdrant_url,
            &config.collection,
        )?);
        vectors.ensure_collection().await?;

        let embeddings = Arc::new(EmbeddingClient::new(
            &config.services,
            config.collection.vector_size,
        )?);

        let generate = GenerateClient::new(
            &config.services.ollama_url,
            &config.services.generate_model,
            config.services.generate_timeout_secs,
        )?;
        let summary_llm = generate.with_model(&config.services.summary_model);

        let dense = DenseRetriever::new(Arc::clone(&embeddings), Arc::clone(&vectors));
        let hybrid = HybridSearcher::new(Arc::clone(&db), dense, config.fusion.clone());
        let reranker = Reranker::new(generate.clone(), config.reranker.clone());
        let mmr = MmrDiversifier::new(&config.mmr);
        let intent = IntentClassifier::new(generate);
        let context_builder = ContextBuilder::new(summary_llm);

        tracing::info!(
            collection = %config.collection.name,
            vector_size = config.collection.vector_size,
            "RAG engine initialized"
        );

        Ok(Self {
            config,
            db,
            vectors,
            embeddings,
            hybrid,
            reranker,
            mmr,
            intent,
            context_builder,
            metadata: MetadataExtractor::new(),
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<DatabaseManager> {
        &self.db
    }

    // ── Query path ─────────────────────────────────────────────────────

    /// Ranked retrieval with the per-query feature flags of the caller.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filters: SearchFilters,
        opts: SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        let mut filters = filters;

        if opts.use_intent_classification && !opts.fast_mode {
            let classification = self.intent.classify(query).await;
            let rewriting = self.intent.rewrite_query(query, &classification);
            tracing::info!(
                intent = classification.intent_type.as_str(),
                confidence = classification.confidence,
                expansions = rewriting.rewritten_queries.len(),
                "query intent"
            );
            // Intent filters only fill gaps the caller left open
            if filters.section.is_none() {
                filters.section = rewriting.section_filters.first().cloned();
            }
            if filters.chunk_type.is_none() {
                filters.chunk_type = rewriting.chunk_type_filters.first().cloned();
            }
        }

        let search_k = choose_search_k(k, &opts, self.config.reranker.initial_top_k);
        let mut results = self.hybrid.search(query, search_k, &filters, None).await?;

        if opts.use_reranker && !opts.fast_mode && results.len() > k {
            // Keep 2k for MMR to choose from, k otherwise
            let rerank_k = if opts.use_mmr { k * 2 } else { k };
            let outcome = self.reranker.rerank_with_fallback(query, results, rerank_k).await;
            tracing::info!(method = ?outcome.method, "rerank stage");
            results = outcome.results;
        }

        if opts.use_mmr && !opts.fast_mode && results.len() > k {
            results = self
                .mmr
                .diversify(results, k, query)
                .into_iter()
                .map(|pick| {
                    let mut result = pick.result;
                    result.score = pick.mmr_score;
                    result
                })
                .collect();
        }

        results.truncate(k);
        for (rank, result) in results.iter_mut().enumerate() {
            result.rank = rank + 1;
        }
        Ok(results)
    }

    /// `search` followed by structured-context assembly. Always yields a
    /// well-formed bundle; retrieval failure yields the empty one.
    pub async fn build_context(
        &self,
        query: &str,
        k: usize,
        filters: SearchFilters,
        opts: SearchOptions,
    ) -> StructuredContext {
        let results = match self.search(query, k, filters, opts).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(error = %e, "search failed, returning empty context");
                return StructuredContext::empty(query);
            }
        };
        self.context_builder.build(results, query).await
    }

    /// Consultation: answers a free-form question against the corpus. A
    /// query naming a document code that is absent yields a warning naming
    /// the missing code over the nearest matches.
    pub async fn consult(&self, message: &str) -> Consultation {
        let requested_code = self.metadata.extract_code_from_query(message);
        let search_query = requested_code.as_deref().unwrap_or(message);
        tracing::info!(query = search_query, code = ?requested_code, "consultation");

        let context = self
            .build_context(
                search_query,
                10,
                SearchFilters::default(),
                SearchOptions::default(),
            )
            .await;

        build_consultation(message, requested_code, context)
    }

    // ── Ingest path ────────────────────────────────────────────────────

    /// Persist chunk rows and index their vectors. Point ids are derived
    /// from (document_id, chunk_id), so re-indexing identical content is
    /// idempotent.
    pub async fn index_document_chunks(
        &self,
        document_id: i64,
        chunks: &[ChunkRecord],
    ) -> Result<usize> {
        if chunks.is_empty() {
            return Err(RagError::InputInvalid(format!(
                "document {document_id} produced no chunks"
            )));
        }

        self.db.insert_chunks(chunks).await?;

        let document = self.db.get_document(document_id).await?;
        let doc_metadata =
            self.metadata
                .extract_document_metadata(&document.original_filename, document_id, None);

        let mut points = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.content.trim().is_empty() {
                continue;
            }
            let vector = self.embeddings.embed(&chunk.content).await?;
            let code = self
                .metadata
                .extract_document_code(&chunk.document_title)
                .unwrap_or_default();

            points.push(PointRecord {
                id: point_id(document_id, &chunk.chunk_id),
                vector,
                payload: PointPayload {
                    document_id,
                    chunk_id: chunk.chunk_id.clone(),
                    code,
                    title: chunk.document_title.clone(),
                    section_title: chunk.chapter.clone(),
                    content: chunk.content.clone(),
                    chunk_type: chunk.chunk_type.clone(),
                    page: chunk.page,
                    section: chunk.section.clone(),
                    metadata: self.metadata.chunk_metadata(chunk, &doc_metadata),
                },
            });
        }

        self.vectors.upsert_points(&points).await?;
        self.hybrid.invalidate_corpus();

        tracing::info!(document_id, points = points.len(), "chunks indexed");
        Ok(points.len())
    }

    /// Atomic delete cascade: chunk rows and the document row first, then
    /// the vector points by document filter.
    pub async fn delete_document(&self, document_id: i64) -> Result<bool> {
        let existed = self.db.delete_document_cascade(document_id).await?;
        if existed {
            self.vectors.delete_by_document(document_id).await?;
            self.hybrid.invalidate_corpus();
        }
        Ok(existed)
    }

    /// Administrative flush of the BM25 corpus cache.
    pub fn invalidate_corpus(&self) {
        self.hybrid.invalidate_corpus();
    }

    pub async fn stats(&self) -> serde_json::Value {
        let db_stats = self.db.stats().await.unwrap_or_default();
        let points = self.vectors.points_count().await.unwrap_or(0);
        let (trained, corpus_size, avgdl) = self.hybrid.corpus_stats();

        serde_json::json!({
            "postgresql": db_stats,
            "qdrant": {
                "collection_name": self.config.collection.name,
                "vectors_count": points,
            },
            "bm25": {
                "trained": trained,
                "corpus_size": corpus_size,
                "avg_doc_length": avgdl,
            },
            "embedding_model": self.config.services.embedding_model,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    pub async fn health_check(&self) -> serde_json::Value {
        serde_json::json!({
            "database": self.db.health_check().await,
            "vector_store": self.vectors.health_check().await,
            "embeddings": self.embeddings.health_check().await,
        })
    }
}

/// Candidate pool size before fusion: a deep pool when reranking will
/// narrow it, twice the ask for MMR, the ask itself otherwise.
fn choose_search_k(k: usize, opts: &SearchOptions, initial_top_k: usize) -> usize {
    if opts.use_reranker && !opts.fast_mode {
        initial_top_k
    } else if opts.use_mmr && !opts.fast_mode {
        k * 2
    } else {
        k
    }
}

fn context_item_source(item: &crate::types::ContextItem, note: Option<String>) -> ConsultationSource {
    ConsultationSource {
        document_code: item.doc.clone(),
        document_title: item.document_title.clone(),
        section: item.section.clone(),
        page: item.page,
        content_preview: item.snippet.chars().take(200).collect(),
        relevance_score: item.score,
        note,
    }
}

/// Assemble the consultation answer from the structured context.
fn build_consultation(
    message: &str,
    requested_code: Option<String>,
    context: StructuredContext,
) -> Consultation {
    if context.context.is_empty() {
        return Consultation {
            status: ConsultationStatus::Success,
            response: "К сожалению, я не нашел релевантной информации в базе нормативных \
                       документов. Попробуйте переформулировать ваш вопрос или обратитесь к \
                       актуальным нормативным документам."
                .to_string(),
            sources: Vec::new(),
            confidence: 0.0,
            documents_used: 0,
            missing_document: None,
            timestamp: Utc::now(),
        };
    }

    if let Some(code) = requested_code {
        let exact = context.context.iter().find(|item| item.doc == code);
        if exact.is_none() {
            let nearest = &context.context[0];
            tracing::warn!(code = %code, "requested document absent, answering with nearest");
            let response = format!(
                "⚠️ **Внимание!** Запрашиваемый документ **{code}** отсутствует в системе.\n\n\
                 Вот наиболее релевантная информация из доступных документов:\n\n\
                 **{}**\nРаздел: {}\n\n{}\n\n\
                 **Рекомендация:** Загрузите документ {code} в систему для получения точной \
                 консультации.",
                nearest.document_title, nearest.section, nearest.snippet,
            );
            return Consultation {
                status: ConsultationStatus::Warning,
                response,
                sources: vec![context_item_source(
                    nearest,
                    Some(
                        "Документ найден по семантическому поиску, но не является запрашиваемым"
                            .to_string(),
                    ),
                )],
                confidence: 0.5,
                documents_used: 1,
                missing_document: Some(code),
                timestamp: Utc::now(),
            };
        }
    }

    let confidence = context
        .context
        .first()
        .map(|item| item.score.clamp(0.0, 1.0))
        .unwrap_or(0.0);

    let message_lower = message.to_lowercase();
    let heading = if ["регламентирует", "определяет", "устанавливает"]
        .iter()
        .any(|w| message_lower.contains(w))
    {
        "## 📋 Нормативное регулирование"
    } else if ["какой", "что", "как", "где", "когда"]
        .iter()
        .any(|w| message_lower.contains(w))
    {
        "## 💡 Информация по вашему вопросу"
    } else {
        "## 📖 Ответ на основе нормативных документов"
    };

    let mut response_parts = vec![heading.to_string()];
    let meta = &context.meta_summary;
    response_parts.push(String::new());
    response_parts.push(format!("**📊 Анализ запроса:** {}", meta.query_type));
    response_parts.push(format!("**📚 Найдено документов:** {}", meta.documents_found));
    response_parts.push(format!("**⭐ Качество покрытия:** {}", meta.coverage_quality));
    response_parts.push(String::new());

    for (i, item) in context.context.iter().take(3).enumerate() {
        response_parts.push(format!("### {}. {} - {}", i + 1, item.doc, item.document_title));
        response_parts.push(format!("**Раздел:** {}", item.section));
        response_parts.push(format!("**Страница:** {}", item.page));
        response_parts.push(format!(
            "**Релевантность:** {:.2} ({})",
            item.score, item.why
        ));
        if let Some(summary) = &item.summary {
            response_parts.push(format!("**📝 О разделе:** {}", summary.topic));
            response_parts.push(format!("**⚖️ Тип нормы:** {}", summary.norm_type));
            for point in summary.key_points.iter().take(3) {
                response_parts.push(format!("• {point}"));
            }
        }
        response_parts.push(String::new());
        response_parts.push(item.snippet.clone());
        response_parts.push("---".to_string());
    }

    response_parts.push(format!(
        "Всего найдено: {} релевантных фрагментов, средняя релевантность {:.2}",
        context.total_candidates, context.avg_score
    ));

    let sources = context
        .context
        .iter()
        .take(3)
        .map(|item| context_item_source(item, None))
        .collect();

    let documents_used = context.total_candidates;
    Consultation {
        status: ConsultationStatus::Success,
        response: response_parts.join("\n"),
        sources,
        confidence,
        documents_used,
        missing_document: None,
        timestamp: Utc::now(),
    }
}
