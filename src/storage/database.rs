//! Dual-pool PostgreSQL access layer.
//!
//! Two independent pools: reads go through a pool whose connections are
//! switched to read-only mode on connect, writes through a separate pool.
//! Every operation acquires a connection for its own duration only.
//! Transient errors are retried with exponential backoff and jitter; after
//! retries are exhausted on a transport error both pools are closed and
//! rebuilt, and one final attempt decides between success and `Fatal`.

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Row};
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::DbConfig;
use crate::error::{RagError, Result};
use crate::types::{ChunkRecord, DocumentRecord, ProcessingStatus};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS uploaded_documents (
    id                     BIGINT PRIMARY KEY,
    filename               TEXT NOT NULL,
    original_filename      TEXT NOT NULL,
    file_type              TEXT NOT NULL,
    file_size              BIGINT NOT NULL,
    document_hash          TEXT NOT NULL UNIQUE,
    category               TEXT NOT NULL DEFAULT 'other',
    document_type          TEXT NOT NULL DEFAULT 'normative',
    processing_status      TEXT NOT NULL DEFAULT 'pending',
    processing_error       TEXT,
    indexing_progress      INTEGER NOT NULL DEFAULT 0,
    retry_count            INTEGER NOT NULL DEFAULT 0,
    last_retry_attempt     TIMESTAMPTZ,
    last_processing_update TIMESTAMPTZ,
    token_count            BIGINT,
    upload_date            TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS normative_chunks (
    chunk_id       TEXT PRIMARY KEY,
    document_id    BIGINT NOT NULL REFERENCES uploaded_documents(id) ON DELETE CASCADE,
    document_title TEXT NOT NULL,
    chunk_type     TEXT NOT NULL DEFAULT 'paragraph',
    content        TEXT NOT NULL,
    page_number    INTEGER NOT NULL DEFAULT 1,
    chapter        TEXT NOT NULL DEFAULT '',
    section        TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_normative_chunks_document
    ON normative_chunks(document_id);
"#;

const DOCUMENT_COLUMNS: &str = "id, filename, original_filename, file_type, file_size, \
     document_hash, category, document_type, processing_status, processing_error, \
     indexing_progress, retry_count, last_retry_attempt, token_count, upload_date";

/// A document row to insert on upload.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: i64,
    pub filename: String,
    pub original_filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub document_hash: String,
    pub category: String,
    pub document_type: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DbStats {
    pub total_documents: i64,
    pub total_chunks: i64,
    pub pending_documents: i64,
    pub total_tokens: i64,
}

struct Pools {
    read: PgPool,
    write: PgPool,
}

pub struct DatabaseManager {
    url: String,
    cfg: DbConfig,
    pools: RwLock<Pools>,
}

impl DatabaseManager {
    pub async fn connect(url: &str, cfg: DbConfig) -> Result<Self> {
        let pools = Self::build_pools(url, &cfg).await?;
        tracing::info!(
            min = cfg.min_connections,
            max = cfg.max_connections,
            "database pools initialized"
        );
        Ok(Self {
            url: url.to_string(),
            cfg,
            pools: RwLock::new(pools),
        })
    }

    async fn build_pools(url: &str, cfg: &DbConfig) -> Result<Pools> {
        let write = PgPoolOptions::new()
            .min_connections(cfg.min_connections)
            .max_connections(cfg.max_connections)
            .connect(url)
            .await?;

        let read = PgPoolOptions::new()
            .min_connections(cfg.min_connections)
            .max_connections(cfg.max_connections)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("SET default_transaction_read_only = on")
                        .await?;
                    Ok(())
                })
            })
            .connect(url)
            .await?;

        Ok(Pools { read, write })
    }

    /// Create tables and indexes if absent. Idempotent; run at startup.
    pub async fn ensure_schema(&self) -> Result<()> {
        let pool = self.pools.read().await.write.clone();
        pool.execute(SCHEMA_SQL).await?;
        Ok(())
    }

    /// Close both pools and rebuild them from scratch.
    async fn recreate_pools(&self) -> Result<()> {
        tracing::warn!("recreating database connection pools");
        let mut guard = self.pools.write().await;
        guard.read.close().await;
        guard.write.close().await;
        *guard = Self::build_pools(&self.url, &self.cfg).await?;
        tracing::info!("database pools recreated");
        Ok(())
    }

    /// Run an operation against the read or write pool with retry.
    ///
    /// Only transient errors are retried; anything else propagates
    /// immediately. After `max_retries` failures the pools are recreated
    /// and the operation gets one last attempt before `Fatal`.
    async fn with_pool<T, F, Fut>(&self, write: bool, op_name: &str, op: F) -> Result<T>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let pool = {
                let guard = self.pools.read().await;
                if write {
                    guard.write.clone()
                } else {
                    guard.read.clone()
                }
            };

            match op(pool).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let classified = RagError::from(e);
                    if !classified.is_retryable() {
                        return Err(classified);
                    }

                    attempt += 1;
                    if attempt > self.cfg.max_retries {
                        tracing::error!(
                            op = op_name,
                            attempts = attempt,
                            "retries exhausted, recreating pools"
                        );
                        self.recreate_pools().await.map_err(|e| {
                            RagError::Fatal(format!("pool recreation failed: {e}"))
                        })?;

                        let pool = {
                            let guard = self.pools.read().await;
                            if write {
                                guard.write.clone()
                            } else {
                                guard.read.clone()
                            }
                        };
                        return match op(pool).await {
                            Ok(value) => Ok(value),
                            Err(e) => Err(RagError::Fatal(format!(
                                "{op_name} failed after pool recreation: {e}"
                            ))),
                        };
                    }

                    let delay =
                        backoff_delay(attempt, self.cfg.base_delay_ms, self.cfg.max_delay_ms);
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        max = self.cfg.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %classified,
                        "transient database error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // ── Documents ──────────────────────────────────────────────────────

    /// Insert an uploaded document. Fails with `Duplicate` when a document
    /// with the same content hash already exists; state is unchanged.
    pub async fn save_document(&self, doc: &NewDocument) -> Result<i64> {
        let existing = self
            .with_pool(false, "check_duplicate", |pool| {
                let hash = doc.document_hash.clone();
                async move {
                    sqlx::query("SELECT id FROM uploaded_documents WHERE document_hash = $1")
                        .bind(hash)
                        .fetch_optional(&pool)
                        .await
                }
            })
            .await?;

        if existing.is_some() {
            return Err(RagError::Duplicate(format!(
                "document with hash {} already exists",
                doc.document_hash
            )));
        }

        let id = self
            .with_pool(true, "save_document", |pool| {
                let doc = doc.clone();
                async move {
                    let row = sqlx::query(
                        "INSERT INTO uploaded_documents \
                         (id, filename, original_filename, file_type, file_size, \
                          document_hash, category, document_type, processing_status) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending') \
                         RETURNING id",
                    )
                    .bind(doc.id)
                    .bind(&doc.filename)
                    .bind(&doc.original_filename)
                    .bind(&doc.file_type)
                    .bind(doc.file_size)
                    .bind(&doc.document_hash)
                    .bind(&doc.category)
                    .bind(&doc.document_type)
                    .fetch_one(&pool)
                    .await?;
                    row.try_get::<i64, _>("id")
                }
            })
            .await?;

        tracing::info!(document_id = id, filename = %doc.original_filename, "document saved");
        Ok(id)
    }

    pub async fn update_status(
        &self,
        document_id: i64,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.with_pool(true, "update_status", |pool| {
            let error_message = error_message.map(str::to_string);
            async move {
                sqlx::query(
                    "UPDATE uploaded_documents \
                     SET processing_status = $1, processing_error = $2 \
                     WHERE id = $3",
                )
                .bind(status.as_str())
                .bind(error_message)
                .bind(document_id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;

        tracing::info!(document_id, status = status.as_str(), "status updated");
        Ok(())
    }

    /// Single-row progress update; also stamps `last_processing_update`.
    pub async fn update_progress(
        &self,
        document_id: i64,
        percent: i32,
        message: Option<&str>,
    ) -> Result<()> {
        self.with_pool(true, "update_progress", |pool| {
            let message = message.map(str::to_string);
            async move {
                sqlx::query(
                    "UPDATE uploaded_documents \
                     SET processing_status = 'indexing', \
                         indexing_progress = $1, \
                         processing_error = $2, \
                         last_processing_update = NOW() \
                     WHERE id = $3",
                )
                .bind(percent)
                .bind(message)
                .bind(document_id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;

        tracing::debug!(document_id, percent, "indexing progress");
        Ok(())
    }

    pub async fn update_token_count(&self, document_id: i64, token_count: i64) -> Result<()> {
        self.with_pool(true, "update_token_count", |pool| async move {
            sqlx::query("UPDATE uploaded_documents SET token_count = $1 WHERE id = $2")
                .bind(token_count)
                .bind(document_id)
                .execute(&pool)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn get_document(&self, document_id: i64) -> Result<DocumentRecord> {
        let row = self
            .with_pool(false, "get_document", |pool| async move {
                sqlx::query(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM uploaded_documents WHERE id = $1"
                ))
                .bind(document_id)
                .fetch_optional(&pool)
                .await
            })
            .await?;

        match row {
            Some(row) => document_from_row(&row),
            None => Err(RagError::NotFound(format!("document {document_id}"))),
        }
    }

    pub async fn get_documents(&self) -> Result<Vec<DocumentRecord>> {
        let rows = self
            .with_pool(false, "get_documents", |pool| async move {
                sqlx::query(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM uploaded_documents ORDER BY upload_date DESC"
                ))
                .fetch_all(&pool)
                .await
            })
            .await?;

        rows.iter().map(document_from_row).collect()
    }

    /// Documents awaiting (re-)indexing, oldest uploads first.
    pub async fn get_pending_for_indexing(&self) -> Result<Vec<DocumentRecord>> {
        let rows = self
            .with_pool(false, "get_pending_for_indexing", |pool| async move {
                sqlx::query(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM uploaded_documents \
                     WHERE processing_status IN ('pending', 'failed') \
                     ORDER BY upload_date ASC"
                ))
                .fetch_all(&pool)
                .await
            })
            .await?;

        rows.iter().map(document_from_row).collect()
    }

    /// Failed documents still under the retry budget.
    pub async fn get_failed_for_retry(&self, max_retries: i32) -> Result<Vec<DocumentRecord>> {
        let rows = self
            .with_pool(false, "get_failed_for_retry", |pool| async move {
                sqlx::query(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM uploaded_documents \
                     WHERE processing_status = 'failed' AND retry_count < $1 \
                     ORDER BY last_retry_attempt ASC NULLS FIRST, upload_date ASC"
                ))
                .bind(max_retries)
                .fetch_all(&pool)
                .await
            })
            .await?;

        rows.iter().map(document_from_row).collect()
    }

    /// Requeue a failed document: back to `pending`, bump the retry count.
    pub async fn mark_for_retry(&self, document_id: i64, error_message: &str) -> Result<()> {
        self.with_pool(true, "mark_for_retry", |pool| {
            let error_message = error_message.to_string();
            async move {
                sqlx::query(
                    "UPDATE uploaded_documents \
                     SET processing_status = 'pending', \
                         processing_error = $1, \
                         retry_count = retry_count + 1, \
                         last_retry_attempt = NOW() \
                     WHERE id = $2",
                )
                .bind(error_message)
                .bind(document_id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;

        tracing::info!(document_id, "document marked for retry");
        Ok(())
    }

    // ── Chunks ─────────────────────────────────────────────────────────

    /// Insert chunk rows in one transaction. Upsert by `chunk_id` so a
    /// retried indexing attempt never trips over its own partial insert.
    pub async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        self.with_pool(true, "insert_chunks", |pool| {
            let chunks = chunks.to_vec();
            async move {
                let mut tx = pool.begin().await?;
                for chunk in &chunks {
                    sqlx::query(
                        "INSERT INTO normative_chunks \
                         (chunk_id, document_id, document_title, chunk_type, \
                          content, page_number, chapter, section) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                         ON CONFLICT (chunk_id) DO UPDATE SET \
                             content = EXCLUDED.content, \
                             chunk_type = EXCLUDED.chunk_type, \
                             page_number = EXCLUDED.page_number, \
                             chapter = EXCLUDED.chapter, \
                             section = EXCLUDED.section",
                    )
                    .bind(&chunk.chunk_id)
                    .bind(chunk.document_id)
                    .bind(&chunk.document_title)
                    .bind(&chunk.chunk_type)
                    .bind(&chunk.content)
                    .bind(chunk.page)
                    .bind(&chunk.chapter)
                    .bind(&chunk.section)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await
            }
        })
        .await?;

        tracing::info!(count = chunks.len(), "chunks persisted");
        Ok(())
    }

    pub async fn get_chunks(&self, document_id: i64) -> Result<Vec<ChunkRecord>> {
        let rows = self
            .with_pool(false, "get_chunks", |pool| async move {
                sqlx::query(
                    "SELECT chunk_id, document_id, document_title, chunk_type, \
                            content, page_number, chapter, section \
                     FROM normative_chunks \
                     WHERE document_id = $1 \
                     ORDER BY page_number, chunk_id",
                )
                .bind(document_id)
                .fetch_all(&pool)
                .await
            })
            .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    /// Full chunk corpus for BM25 training, in stable document order.
    pub async fn get_all_chunks(&self) -> Result<Vec<ChunkRecord>> {
        let rows = self
            .with_pool(false, "get_all_chunks", |pool| async move {
                sqlx::query(
                    "SELECT chunk_id, document_id, document_title, chunk_type, \
                            content, page_number, chapter, section \
                     FROM normative_chunks \
                     WHERE content IS NOT NULL AND LENGTH(content) > 10 \
                     ORDER BY document_id, chunk_id",
                )
                .fetch_all(&pool)
                .await
            })
            .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    /// Delete a document and its chunks atomically. Returns whether the
    /// document existed.
    pub async fn delete_document_cascade(&self, document_id: i64) -> Result<bool> {
        let deleted = self
            .with_pool(true, "delete_document_cascade", |pool| async move {
                let mut tx = pool.begin().await?;
                sqlx::query("DELETE FROM normative_chunks WHERE document_id = $1")
                    .bind(document_id)
                    .execute(&mut *tx)
                    .await?;
                let result = sqlx::query("DELETE FROM uploaded_documents WHERE id = $1")
                    .bind(document_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(result.rows_affected())
            })
            .await?;

        tracing::info!(document_id, deleted, "document cascade delete");
        Ok(deleted > 0)
    }

    // ── Stats & health ─────────────────────────────────────────────────

    pub async fn stats(&self) -> Result<DbStats> {
        self.with_pool(false, "stats", |pool| async move {
            let row = sqlx::query(
                "SELECT \
                   (SELECT COUNT(*) FROM uploaded_documents) AS total_documents, \
                   (SELECT COUNT(*) FROM normative_chunks) AS total_chunks, \
                   (SELECT COUNT(*) FROM uploaded_documents \
                      WHERE processing_status = 'pending') AS pending_documents, \
                   (SELECT COALESCE(SUM(token_count), 0) FROM uploaded_documents) \
                      AS total_tokens",
            )
            .fetch_one(&pool)
            .await?;

            Ok(DbStats {
                total_documents: row.try_get("total_documents")?,
                total_chunks: row.try_get("total_chunks")?,
                pending_documents: row.try_get("pending_documents")?,
                total_tokens: row.try_get("total_tokens")?,
            })
        })
        .await
    }

    pub async fn health_check(&self) -> bool {
        let read = self
            .with_pool(false, "health_read", |pool| async move {
                sqlx::query("SELECT 1").fetch_one(&pool).await.map(|_| ())
            })
            .await;
        let write = self
            .with_pool(true, "health_write", |pool| async move {
                sqlx::query("SELECT 1").fetch_one(&pool).await.map(|_| ())
            })
            .await;
        read.is_ok() && write.is_ok()
    }
}

/// Exponential backoff with multiplicative jitter in [0.1, 0.3] of the delay.
fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(max_ms);
    let jitter = (rand::thread_rng().gen_range(0.1..0.3) * exp as f64) as u64;
    Duration::from_millis(exp + jitter)
}

fn document_from_row(row: &PgRow) -> Result<DocumentRecord> {
    Ok(DocumentRecord {
        id: row.try_get::<i64, _>("id").map_err(RagError::from)?,
        filename: row.try_get("filename").map_err(RagError::from)?,
        original_filename: row.try_get("original_filename").map_err(RagError::from)?,
        file_type: row.try_get("file_type").map_err(RagError::from)?,
        file_size: row.try_get("file_size").map_err(RagError::from)?,
        document_hash: row.try_get("document_hash").map_err(RagError::from)?,
        category: row.try_get("category").map_err(RagError::from)?,
        document_type: row.try_get("document_type").map_err(RagError::from)?,
        processing_status: ProcessingStatus::parse(
            row.try_get::<String, _>("processing_status")
                .map_err(RagError::from)?
                .as_str(),
        ),
        processing_error: row.try_get("processing_error").map_err(RagError::from)?,
        indexing_progress: row.try_get("indexing_progress").map_err(RagError::from)?,
        retry_count: row.try_get("retry_count").map_err(RagError::from)?,
        last_retry_attempt: row
            .try_get::<Option<DateTime<Utc>>, _>("last_retry_attempt")
            .map_err(RagError::from)?,
        token_count: row.try_get("token_count").map_err(RagError::from)?,
        upload_date: row.try_get("upload_date").map_err(RagError::from)?,
    })
}

fn chunk_from_row(row: &PgRow) -> Result<ChunkRecord> {
    Ok(ChunkRecord {
        chunk_id: row.try_get("chunk_id").map_err(RagError::from)?,
        document_id: row.try_get("document_id").map_err(RagError::from)?,
        document_title: row.try_get("document_title").map_err(RagError::from)?,
        chunk_type: row.try_get("chunk_type").map_err(RagError::from)?,
        content: row.try_get("content").map_err(RagError::from)?,
        page: row.try_get("page_number").map_err(RagError::from)?,
        chapter: row.try_get("chapter").map_err(RagError::from)?,
        section: row.try_get("section").map_err(RagError::from)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = 1000;
        let max = 30_000;
        let d1 = backoff_delay(1, base, max);
        let d2 = backoff_delay(2, base, max);
        let d6 = backoff_delay(6, base, max);

        // attempt 1: 1000ms + [10%, 30%] jitter
        assert!(d1 >= Duration::from_millis(1100) && d1 <= Duration::from_millis(1300));
        // attempt 2: doubled
        assert!(d2 >= Duration::from_millis(2200) && d2 <= Duration::from_millis(2600));
        // capped at max before jitter
        assert!(d6 >= Duration::from_millis(33_000) && d6 <= Duration::from_millis(39_000));
    }
}
