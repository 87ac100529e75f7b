//! Recovery and monitoring loop.
//!
//! Every monitor interval the loop logs pipeline statistics, fails tasks
//! that have been active longer than the stuck threshold, and requeues
//! pending or retryable documents found in the database. Requeued
//! documents get their bytes back through the `ContentProvider`
//! capability; documents whose content cannot be loaded stay pending and
//! are logged.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{IndexingPipeline, IndexingTask};
use crate::types::{Priority, ProcessingStatus};

/// Loads stored upload bytes for a document being requeued.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn load(&self, document_id: i64, filename: &str) -> anyhow::Result<Vec<u8>>;
}

/// Reads uploads back from a directory, addressed by stored filename.
pub struct FsContentProvider {
    root: PathBuf,
}

impl FsContentProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ContentProvider for FsContentProvider {
    async fn load(&self, _document_id: i64, filename: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(filename);
        Ok(tokio::fs::read(&path).await?)
    }
}

pub(crate) async fn monitor_loop(
    pipeline: Arc<IndexingPipeline>,
    content_provider: Arc<dyn ContentProvider>,
) {
    tracing::info!("indexing monitor started");
    let mut shutdown_rx = pipeline.shutdown_rx.clone();
    let interval = Duration::from_secs(pipeline.cfg.monitor_interval_secs);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        log_statistics(&pipeline);
        check_stuck_tasks(&pipeline).await;
        recover_pending(&pipeline, content_provider.as_ref()).await;
    }

    tracing::info!("indexing monitor stopped");
}

fn log_statistics(pipeline: &IndexingPipeline) {
    let stats = pipeline.stats();
    let uptime = stats
        .started_at
        .map(|t| (Utc::now() - t).num_seconds())
        .unwrap_or(0);
    tracing::info!(
        uptime_secs = uptime,
        total = stats.total_processed,
        successful = stats.successful,
        failed = stats.failed,
        retries = stats.retries,
        queue = pipeline.queue_size(),
        active = pipeline.active_count(),
        "indexing pipeline stats"
    );
}

/// Tasks whose attempt started longer ago than the stuck threshold are
/// failed and removed from the active set; recovery requeues them later.
async fn check_stuck_tasks(pipeline: &IndexingPipeline) {
    let threshold = ChronoDuration::seconds(pipeline.cfg.stuck_threshold_secs as i64);
    let now = Utc::now();

    let stuck: Vec<i64> = pipeline
        .active
        .iter()
        .filter(|entry| now - entry.value().last_attempt > threshold)
        .map(|entry| *entry.key())
        .collect();

    for document_id in stuck {
        tracing::warn!(document_id, "task stuck, marking failed");
        pipeline.active.remove(&document_id);
        if let Err(e) = pipeline
            .db
            .update_status(document_id, ProcessingStatus::Failed, Some("Task stuck"))
            .await
        {
            tracing::error!(document_id, error = %e, "failed to mark stuck task");
        }
    }
}

/// Requeue pending and retry-eligible documents that are neither active
/// nor already queued.
async fn recover_pending(pipeline: &IndexingPipeline, content_provider: &dyn ContentProvider) {
    let pending = match pipeline.db.get_pending_for_indexing().await {
        Ok(pending) => pending,
        Err(e) => {
            tracing::warn!(error = %e, "could not list pending documents");
            return;
        }
    };

    for document in pending {
        if document.processing_status == ProcessingStatus::Failed
            && document.retry_count >= pipeline.cfg.max_retries as i32
        {
            continue;
        }
        if pipeline.active.contains_key(&document.id) || pipeline.queue.contains(document.id) {
            continue;
        }

        let content = match content_provider.load(document.id, &document.filename).await {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!(
                    document_id = document.id,
                    filename = %document.filename,
                    error = %e,
                    "content unavailable for recovery, leaving pending"
                );
                continue;
            }
        };

        tracing::info!(document_id = document.id, "recovering pending document");
        let mut task = IndexingTask::new(
            document.id,
            &document.filename,
            content,
            &document.category,
            Priority::Normal,
            pipeline.cfg.max_retries,
        );
        task.retry_count = document.retry_count.max(0) as u32;

        if let Err(e) = pipeline.enqueue(task) {
            tracing::warn!(document_id = document.id, error = %e, "recovery enqueue failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_content_provider_reads_stored_uploads() {
        let dir = std::env::temp_dir().join("norma-rag-recovery-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("upload.txt");
        tokio::fs::write(&path, "содержимое документа").await.unwrap();

        let provider = FsContentProvider::new(&dir);
        let bytes = provider.load(1, "upload.txt").await.unwrap();
        assert_eq!(bytes, "содержимое документа".as_bytes());

        assert!(provider.load(2, "missing.txt").await.is_err());
        tokio::fs::remove_file(&path).await.ok();
    }
}
