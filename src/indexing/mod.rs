//! Resilient indexing pipeline.
//!
//! A fixed pool of workers drains a priority FIFO queue of indexing tasks.
//! Each task walks the milestone ladder (text extracted, chunked, embedded
//! and indexed, token-counted, completed) with monotonic progress updates
//! for its attempt. Failures requeue with exponential delay through a
//! delayed enqueue, never by sleeping inside a worker; invalid input is
//! terminal. Shutdown stops dispatch and grants a grace window for active
//! tasks to drain; abandoned tasks keep their status so the recovery loop
//! requeues them later.

pub mod recovery;

pub use recovery::{ContentProvider, FsContentProvider};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::{ChunkingConfig, IndexingConfig};
use crate::error::{RagError, Result};
use crate::processing::parser::{file_extension, is_supported_file_type};
use crate::processing::{DocumentChunker, DocumentParser, MetadataExtractor};
use crate::rag_engine::RagEngine;
use crate::storage::{DatabaseManager, NewDocument};
use crate::types::{content_hash, Priority, ProcessingStatus};

/// One unit of indexing work.
#[derive(Debug, Clone)]
pub struct IndexingTask {
    pub document_id: i64,
    pub filename: String,
    pub content: Vec<u8>,
    pub category: String,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
}

impl IndexingTask {
    pub fn new(
        document_id: i64,
        filename: &str,
        content: Vec<u8>,
        category: &str,
        priority: Priority,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            document_id,
            filename: filename.to_string(),
            content,
            category: category.to_string(),
            priority,
            retry_count: 0,
            max_retries,
            created_at: now,
            last_attempt: now,
        }
    }
}

struct QueuedTask {
    seq: u64,
    task: IndexingTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO)
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct TaskQueue {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    seq: AtomicU64,
    notify: Notify,
}

impl TaskQueue {
    fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn push(&self, task: IndexingTask) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(QueuedTask { seq, task });
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<IndexingTask> {
        self.heap.lock().pop().map(|queued| queued.task)
    }

    fn len(&self) -> usize {
        self.heap.lock().len()
    }

    fn contains(&self, document_id: i64) -> bool {
        self.heap
            .lock()
            .iter()
            .any(|queued| queued.task.document_id == document_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveTask {
    last_attempt: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub retries: u64,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct IndexingPipeline {
    cfg: IndexingConfig,
    chunking: ChunkingConfig,
    db: Arc<DatabaseManager>,
    engine: Arc<RagEngine>,
    parser: Arc<dyn DocumentParser>,
    metadata: MetadataExtractor,
    queue: Arc<TaskQueue>,
    active: DashMap<i64, ActiveTask>,
    failed_tasks: Mutex<Vec<IndexingTask>>,
    stats: Mutex<PipelineStats>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl IndexingPipeline {
    pub fn new(
        cfg: IndexingConfig,
        chunking: ChunkingConfig,
        db: Arc<DatabaseManager>,
        engine: Arc<RagEngine>,
        parser: Arc<dyn DocumentParser>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            cfg,
            chunking,
            db,
            engine,
            parser,
            metadata: MetadataExtractor::new(),
            queue: Arc::new(TaskQueue::new()),
            active: DashMap::new(),
            failed_tasks: Mutex::new(Vec::new()),
            stats: Mutex::new(PipelineStats::default()),
            shutdown_tx,
            shutdown_rx,
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Start the worker pool and the recovery monitor.
    pub fn start(self: &Arc<Self>, content_provider: Arc<dyn ContentProvider>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("indexing pipeline already running");
            return;
        }
        let _ = self.shutdown_tx.send(false);
        self.stats.lock().started_at = Some(Utc::now());

        let mut workers = self.workers.lock();
        for worker_id in 0..self.cfg.max_concurrent_tasks {
            let pipeline = Arc::clone(self);
            workers.push(tokio::spawn(pipeline.worker_loop(worker_id)));
        }
        workers.push(tokio::spawn(recovery::monitor_loop(
            Arc::clone(self),
            content_provider,
        )));

        tracing::info!(
            workers = self.cfg.max_concurrent_tasks,
            "indexing pipeline started"
        );
    }

    /// Stop dispatch and drain active tasks within the grace window.
    /// Leftover tasks are abandoned with their status untouched.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping indexing pipeline");
        let _ = self.shutdown_tx.send(true);

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.cfg.shutdown_grace_secs);
        while !self.active.is_empty() && tokio::time::Instant::now() < deadline {
            tracing::info!(active = self.active.len(), "waiting for active tasks");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        if !self.active.is_empty() {
            let leftover: Vec<i64> = self.active.iter().map(|entry| *entry.key()).collect();
            tracing::warn!(?leftover, "tasks still active after grace window, abandoning");
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            futures::future::join_all(handles),
        )
        .await;
        tracing::info!("indexing pipeline stopped");
    }

    /// Upload entry point: dedup by content hash, persist the document
    /// row, enqueue the indexing task. The document id derives from the
    /// content hash, so identical bytes always map to the same id.
    pub async fn submit_document(
        &self,
        filename: &str,
        content: Vec<u8>,
        category: &str,
        priority: Priority,
    ) -> Result<i64> {
        let extension = file_extension(filename);
        if !is_supported_file_type(&extension) {
            return Err(RagError::InputInvalid(format!(
                "unsupported file type: {filename}"
            )));
        }
        if content.is_empty() {
            return Err(RagError::InputInvalid("empty upload".into()));
        }

        let hash = content_hash(&content);
        let document_id = document_id_from_hash(&hash);
        let doc_meta = self.metadata.extract_document_metadata(filename, document_id, None);

        self.db
            .save_document(&NewDocument {
                id: document_id,
                filename: filename.to_string(),
                original_filename: filename.to_string(),
                file_type: extension,
                file_size: content.len() as i64,
                document_hash: hash,
                category: category.to_string(),
                document_type: doc_meta.doc_type.as_str().to_string(),
            })
            .await?;

        let task = IndexingTask::new(
            document_id,
            filename,
            content,
            category,
            priority,
            self.cfg.max_retries,
        );
        self.enqueue(task)?;
        Ok(document_id)
    }

    /// Queue a task unless the document is already queued or active.
    /// Returns whether the task was accepted.
    pub fn enqueue(&self, task: IndexingTask) -> Result<bool> {
        if self.queue.len() >= self.cfg.max_queue_size {
            return Err(RagError::Overload(format!(
                "indexing queue is full ({} tasks)",
                self.cfg.max_queue_size
            )));
        }
        if self.active.contains_key(&task.document_id) || self.queue.contains(task.document_id) {
            tracing::debug!(
                document_id = task.document_id,
                "task already queued or active, skipping"
            );
            return Ok(false);
        }

        tracing::info!(
            document_id = task.document_id,
            priority = ?task.priority,
            "indexing task queued"
        );
        self.queue.push(task);
        Ok(true)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().clone()
    }

    pub fn status(&self) -> serde_json::Value {
        let stats = self.stats();
        let uptime = stats
            .started_at
            .map(|t| (Utc::now() - t).num_seconds())
            .unwrap_or(0);
        serde_json::json!({
            "is_running": self.running.load(Ordering::SeqCst),
            "uptime_seconds": uptime,
            "queue_size": self.queue.len(),
            "active_tasks": self.active.len(),
            "failed_tasks": self.failed_tasks.lock().len(),
            "stats": stats,
        })
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::info!(worker_id, "indexing worker started");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let Some(task) = self.queue.pop() else {
                tokio::select! {
                    _ = self.queue.notify.notified() => {},
                    _ = shutdown_rx.changed() => {},
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {},
                }
                continue;
            };

            self.process_task(task, worker_id).await;
        }

        tracing::info!(worker_id, "indexing worker stopped");
    }

    async fn process_task(&self, mut task: IndexingTask, worker_id: usize) {
        let document_id = task.document_id;

        if self.active.contains_key(&document_id) {
            tracing::warn!(document_id, "document already being indexed, dropping task");
            return;
        }
        self.active.insert(
            document_id,
            ActiveTask {
                last_attempt: Utc::now(),
            },
        );

        tracing::info!(
            worker_id,
            document_id,
            attempt = task.retry_count + 1,
            "processing indexing task"
        );

        let outcome = self.run_task_steps(&task).await;

        match outcome {
            Ok(_token_count) => {
                self.finish_ok(document_id).await;
                self.stats.lock().successful += 1;
                tracing::info!(worker_id, document_id, "indexing completed");
            }
            Err(e) => {
                let message = e.to_string();
                let terminal =
                    matches!(e, RagError::InputInvalid(_) | RagError::Duplicate(_));

                if !terminal && task.retry_count < task.max_retries {
                    task.retry_count += 1;
                    task.last_attempt = Utc::now();
                    let delay = self
                        .cfg
                        .retry_base_delay_secs
                        .saturating_mul(2u64.saturating_pow(task.retry_count))
                        .min(self.cfg.retry_max_delay_secs);

                    tracing::warn!(
                        document_id,
                        attempt = task.retry_count,
                        delay_secs = delay,
                        error = %message,
                        "indexing failed, scheduling retry"
                    );
                    if let Err(db_err) = self.db.mark_for_retry(document_id, &message).await {
                        tracing::error!(document_id, error = %db_err, "mark_for_retry failed");
                    }

                    // Delayed enqueue instead of sleeping inside the worker
                    let queue = Arc::clone(&self.queue);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                        queue.push(task);
                    });
                    self.stats.lock().retries += 1;
                } else {
                    tracing::error!(
                        document_id,
                        retries = task.retry_count,
                        error = %message,
                        "indexing failed permanently"
                    );
                    if let Err(db_err) = self
                        .db
                        .update_status(document_id, ProcessingStatus::Failed, Some(&message))
                        .await
                    {
                        tracing::error!(document_id, error = %db_err, "status update failed");
                    }
                    self.failed_tasks.lock().push(task);
                    self.stats.lock().failed += 1;
                }
            }
        }

        self.active.remove(&document_id);
        self.stats.lock().total_processed += 1;
    }

    /// The milestone ladder of one indexing attempt. Returns the token
    /// count on success.
    async fn run_task_steps(&self, task: &IndexingTask) -> Result<i64> {
        let document_id = task.document_id;
        let mut progress = ProgressTracker::new(&self.db, document_id);

        self.db
            .update_status(document_id, ProcessingStatus::Indexing, None)
            .await?;
        progress.update(10, "Starting indexing...").await;

        progress.update(20, "Extracting text...").await;
        let text = self
            .parser
            .parse(&task.content, &task.filename)
            .await
            .map_err(|e| RagError::Upstream(format!("text extraction failed: {e}")))?;
        if text.trim().is_empty() {
            return Err(RagError::InputInvalid(format!(
                "no text extracted from {}",
                task.filename
            )));
        }

        progress.update(40, "Creating chunks...").await;
        let chunker = self.chunker_for(&task.filename, document_id);
        let chunks = chunker.create_chunks(&text, document_id, &task.filename);
        if chunks.is_empty() {
            return Err(RagError::InputInvalid(format!(
                "no chunks produced for {}",
                task.filename
            )));
        }

        progress.update(60, "Creating embeddings...").await;
        let indexed = self.engine.index_document_chunks(document_id, &chunks).await?;
        progress.update(90, "Chunks indexed").await;

        progress.update(95, "Updating token count...").await;
        let token_count = text.split_whitespace().count() as i64;
        self.db.update_token_count(document_id, token_count).await?;

        tracing::info!(document_id, chunks = indexed, token_count, "task steps complete");
        Ok(token_count)
    }

    async fn finish_ok(&self, document_id: i64) {
        let mut progress = ProgressTracker::new(&self.db, document_id);
        progress.update(100, "Indexing completed successfully").await;
        if let Err(e) = self
            .db
            .update_status(document_id, ProcessingStatus::Completed, None)
            .await
        {
            tracing::error!(document_id, error = %e, "completion status update failed");
        }
    }

    /// Chunker with the document-class overrides for this file.
    fn chunker_for(&self, filename: &str, document_id: i64) -> DocumentChunker {
        let meta = self
            .metadata
            .extract_document_metadata(filename, document_id, None);
        let class = match meta.doc_type {
            crate::processing::DocType::Gost => "gost",
            crate::processing::DocType::Snip => "snip",
            crate::processing::DocType::CorpStd => "corporate",
            _ => "",
        };
        let cfg = self
            .chunking
            .with_overrides(&ChunkingConfig::class_overrides(class));
        DocumentChunker::new(cfg)
    }

}

/// Per-attempt progress reporter. Progress within one attempt never goes
/// backwards; stale updates are dropped.
struct ProgressTracker<'a> {
    db: &'a DatabaseManager,
    document_id: i64,
    last: i32,
}

impl<'a> ProgressTracker<'a> {
    fn new(db: &'a DatabaseManager, document_id: i64) -> Self {
        Self {
            db,
            document_id,
            last: 0,
        }
    }

    async fn update(&mut self, percent: i32, message: &str) {
        if percent < self.last {
            tracing::debug!(
                document_id = self.document_id,
                percent,
                last = self.last,
                "dropping non-monotonic progress update"
            );
            return;
        }
        self.last = percent;
        if let Err(e) = self
            .db
            .update_progress(self.document_id, percent, Some(message))
            .await
        {
            tracing::warn!(document_id = self.document_id, error = %e, "progress update failed");
        }
    }
}

/// Stable 63-bit document id derived from the content hash.
fn document_id_from_hash(hash_hex: &str) -> i64 {
    let prefix = &hash_hex[..hash_hex.len().min(16)];
    let raw = u64::from_str_radix(prefix, 16).unwrap_or(1);
    ((raw & 0x7FFF_FFFF_FFFF_FFFF) as i64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(document_id: i64, priority: Priority) -> IndexingTask {
        IndexingTask::new(
            document_id,
            "doc.txt",
            b"content".to_vec(),
            "other",
            priority,
            3,
        )
    }

    #[test]
    fn queue_is_priority_then_fifo() {
        let queue = TaskQueue::new();
        queue.push(task(1, Priority::Normal));
        queue.push(task(2, Priority::Low));
        queue.push(task(3, Priority::High));
        queue.push(task(4, Priority::Normal));

        let order: Vec<i64> = std::iter::from_fn(|| queue.pop())
            .map(|t| t.document_id)
            .collect();
        assert_eq!(order, vec![3, 1, 4, 2]);
    }

    #[test]
    fn queue_contains_sees_queued_documents() {
        let queue = TaskQueue::new();
        queue.push(task(5, Priority::Normal));
        assert!(queue.contains(5));
        assert!(!queue.contains(6));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn document_id_is_stable_and_positive() {
        let hash = content_hash(b"same bytes");
        let id1 = document_id_from_hash(&hash);
        let id2 = document_id_from_hash(&hash);
        assert_eq!(id1, id2);
        assert!(id1 > 0);

        let other = document_id_from_hash(&content_hash(b"other bytes"));
        assert_ne!(id1, other);
    }

    #[test]
    fn retry_delay_formula_caps_at_max() {
        // min(base·2^n, max) with the default base 1s / max 60s
        let delay = |retry: u32| 1u64.saturating_mul(2u64.saturating_pow(retry)).min(60);
        assert_eq!(delay(1), 2);
        assert_eq!(delay(3), 8);
        assert_eq!(delay(6), 60);
        assert_eq!(delay(10), 60);
    }
}
