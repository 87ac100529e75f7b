//! Vector store capability client (Qdrant-compatible REST API).
//!
//! One point per chunk, addressed by the deterministic id from
//! `types::point_id`, so upserts are idempotent and re-indexing the same
//! content overwrites in place. Deletion is by `document_id` payload
//! filter when a document is removed.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::config::CollectionConfig;
use crate::error::{RagError, Result};
use crate::types::SearchFilters;

/// Payload mirror of the chunk fields stored with each point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointPayload {
    pub document_id: i64,
    pub chunk_id: String,
    pub code: String,
    pub title: String,
    pub section_title: String,
    pub content: String,
    pub chunk_type: String,
    pub page: i32,
    pub section: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointRecord {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoredPoint {
    pub id: u64,
    pub score: f32,
    pub payload: PointPayload,
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct CollectionInfoEnvelope {
    #[serde(default)]
    result: CollectionInfo,
}

#[derive(Debug, Default, Deserialize)]
struct CollectionInfo {
    #[serde(default)]
    points_count: u64,
}

pub struct VectorStoreClient {
    client: Client,
    base_url: String,
    collection: String,
    vector_size: usize,
    distance: String,
}

impl VectorStoreClient {
    pub fn new(qdrant_url: &str, collection: &CollectionConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: qdrant_url.trim_end_matches('/').to_string(),
            collection: collection.name.clone(),
            vector_size: collection.vector_size,
            distance: collection.distance.clone(),
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    /// Create the collection if it does not exist. Idempotent; called at startup.
    pub async fn ensure_collection(&self) -> Result<()> {
        let response = self.client.get(self.collection_url()).send().await?;

        match response.status() {
            s if s.is_success() => {
                tracing::info!(collection = %self.collection, "collection already exists");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                tracing::info!(
                    collection = %self.collection,
                    size = self.vector_size,
                    "creating collection"
                );
                let create = self
                    .client
                    .put(self.collection_url())
                    .json(&json!({
                        "vectors": {
                            "size": self.vector_size,
                            "distance": self.distance,
                        }
                    }))
                    .send()
                    .await?;
                if create.status().is_success() {
                    Ok(())
                } else {
                    Err(RagError::Transient(format!(
                        "collection create returned HTTP {}",
                        create.status()
                    )))
                }
            }
            s => Err(RagError::Transient(format!(
                "collection check returned HTTP {s}"
            ))),
        }
    }

    /// Upsert a batch of points. Idempotent by point id.
    pub async fn upsert_points(&self, points: &[PointRecord]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                tracing::debug!(count = points.len(), "upserted points");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(RagError::NotFound(format!(
                "collection {} missing",
                self.collection
            ))),
            s => Err(RagError::Transient(format!("upsert returned HTTP {s}"))),
        }
    }

    /// ANN search with optional conjunctive payload filters.
    pub async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = build_filter(filters) {
            body["filter"] = filter;
        }

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&body)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                let envelope: SearchEnvelope = response.json().await?;
                Ok(envelope.result)
            }
            StatusCode::NOT_FOUND => Err(RagError::NotFound(format!(
                "collection {} missing",
                self.collection
            ))),
            s => Err(RagError::Transient(format!("search returned HTTP {s}"))),
        }
    }

    /// Remove every point belonging to a document.
    pub async fn delete_by_document(&self, document_id: i64) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/points/delete?wait=true", self.collection_url()))
            .json(&json!({
                "filter": {
                    "must": [
                        { "key": "document_id", "match": { "value": document_id } }
                    ]
                }
            }))
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                tracing::info!(document_id, "deleted points for document");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(RagError::NotFound(format!(
                "collection {} missing",
                self.collection
            ))),
            s => Err(RagError::Transient(format!("delete returned HTTP {s}"))),
        }
    }

    pub async fn points_count(&self) -> Result<u64> {
        let response = self.client.get(self.collection_url()).send().await?;
        if !response.status().is_success() {
            return Err(RagError::Transient(format!(
                "collection info returned HTTP {}",
                response.status()
            )));
        }
        let envelope: CollectionInfoEnvelope = response.json().await?;
        Ok(envelope.result.points_count)
    }

    pub async fn health_check(&self) -> bool {
        let url = format!("{}/collections", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!(error = %e, "vector store health check failed");
                false
            }
        }
    }
}

fn build_filter(filters: &SearchFilters) -> Option<serde_json::Value> {
    let mut must = Vec::new();

    if let Some(code) = filters.document_code.as_deref() {
        if code != "all" {
            must.push(json!({ "key": "code", "match": { "value": code } }));
        }
    }
    if let Some(section) = filters.section.as_deref() {
        must.push(json!({ "key": "section", "match": { "value": section } }));
    }
    if let Some(chunk_type) = filters.chunk_type.as_deref() {
        must.push(json!({ "key": "chunk_type", "match": { "value": chunk_type } }));
    }

    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filters_produce_no_filter() {
        assert!(build_filter(&SearchFilters::default()).is_none());
    }

    #[test]
    fn all_code_is_not_a_filter() {
        let filters = SearchFilters {
            document_code: Some("all".to_string()),
            ..Default::default()
        };
        assert!(build_filter(&filters).is_none());
    }

    #[test]
    fn filters_are_conjunctive_must_clauses() {
        let filters = SearchFilters {
            document_code: Some("СП 22.13330".to_string()),
            section: None,
            chunk_type: Some("definition".to_string()),
        };
        let filter = build_filter(&filters).unwrap();
        let must = filter["must"].as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(must[0]["key"], "code");
        assert_eq!(must[1]["key"], "chunk_type");
    }
}
