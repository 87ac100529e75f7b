//! Dense retrieval: query embedding + ANN search over the vector store.

use std::sync::Arc;

use crate::embeddings::EmbeddingClient;
use crate::error::Result;
use crate::storage::{ScoredPoint, VectorStoreClient};
use crate::types::{SearchFilters, SearchResult, SearchType};

pub struct DenseRetriever {
    embeddings: Arc<EmbeddingClient>,
    vectors: Arc<VectorStoreClient>,
}

impl DenseRetriever {
    pub fn new(embeddings: Arc<EmbeddingClient>, vectors: Arc<VectorStoreClient>) -> Self {
        Self {
            embeddings,
            vectors,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        let query_vector = self.embeddings.embed(query).await?;
        let points = self.vectors.search(&query_vector, k, filters).await?;

        tracing::debug!(query, hits = points.len(), "dense search complete");
        Ok(points
            .into_iter()
            .enumerate()
            .map(|(rank, point)| point_to_result(point, rank + 1))
            .collect())
    }
}

fn point_to_result(point: ScoredPoint, rank: usize) -> SearchResult {
    let payload = point.payload;
    SearchResult {
        id: point.id.to_string(),
        score: point.score,
        document_id: payload.document_id,
        chunk_id: payload.chunk_id,
        code: payload.code,
        document_title: payload.title,
        section_title: payload.section_title,
        content: payload.content,
        chunk_type: payload.chunk_type,
        page: payload.page,
        section: payload.section,
        metadata: payload.metadata,
        search_type: SearchType::Dense,
        rank,
        rerank_score: None,
        original_score: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PointPayload;

    #[test]
    fn points_map_to_dense_results_with_ranks() {
        let point = ScoredPoint {
            id: 17,
            score: 0.83,
            payload: PointPayload {
                document_id: 3,
                chunk_id: "3_1_1".to_string(),
                code: "СП 22.13330".to_string(),
                title: "СП 22.13330.2016".to_string(),
                section_title: "Глава 5".to_string(),
                content: "Нагрузки на основание".to_string(),
                chunk_type: "paragraph".to_string(),
                page: 12,
                section: "5.2".to_string(),
                metadata: serde_json::Value::Null,
            },
        };

        let result = point_to_result(point, 1);
        assert_eq!(result.search_type, SearchType::Dense);
        assert_eq!(result.rank, 1);
        assert_eq!(result.document_id, 3);
        assert_eq!(result.code, "СП 22.13330");
    }
}
