//! End-to-end pipeline behavior over in-memory collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use notaflow_app::pipeline::extract::{ExtractError, Extraction, Extractor};
use notaflow_app::pipeline::transform::RuleTransformer;
use notaflow_app::pipeline::worker::{PipelineWorker, WorkerOptions};
use notaflow_app::pipeline::{DocumentKey, ExtractedRecord, NormalizedRecord, Outcome};
use notaflow_app::services::object_store::{ObjectStore, ObjectStoreError};
use notaflow_app::services::queue::{s3_event_body, QueueClient, QueueError, QueueMessage};
use notaflow_app::services::repository::{CommitResult, Repository, RepositoryError};

// ---------------------------------------------------------------------------
// In-memory collaborators with failure injection.

#[derive(Default)]
struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
    fail_fetch: AtomicBool,
    fail_delete: AtomicBool,
}

impl MemoryObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .expect("lock")
            .insert(key.to_string(), Bytes::copy_from_slice(bytes));
    }

    fn contains(&self, key: &str) -> bool {
        self.objects.lock().expect("lock").contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn fetch(&self, key: &DocumentKey) -> Result<Bytes, ObjectStoreError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Transient("injected fetch failure".into()));
        }
        self.objects
            .lock()
            .expect("lock")
            .get(key.object_key())
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.object_key().to_string()))
    }

    async fn delete(&self, key: &DocumentKey) -> Result<(), ObjectStoreError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Transient("injected delete failure".into()));
        }
        self.objects.lock().expect("lock").remove(key.object_key());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryQueue {
    pending: Mutex<Vec<QueueMessage>>,
    deleted: Mutex<Vec<String>>,
    dead_lettered: Mutex<Vec<(String, String)>>,
    extended: Mutex<Vec<String>>,
}

impl MemoryQueue {
    fn deleted_receipts(&self) -> Vec<String> {
        self.deleted.lock().expect("lock").clone()
    }

    fn dead_letters(&self) -> Vec<(String, String)> {
        self.dead_lettered.lock().expect("lock").clone()
    }

    fn extension_receipts(&self) -> Vec<String> {
        self.extended.lock().expect("lock").clone()
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn receive(
        &self,
        max_messages: u32,
        _visibility: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut pending = self.pending.lock().expect("lock");
        let take = (max_messages as usize).min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn extend_visibility(
        &self,
        message: &QueueMessage,
        _duration: Duration,
    ) -> Result<(), QueueError> {
        self.extended
            .lock()
            .expect("lock")
            .push(message.receipt.clone());
        Ok(())
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.deleted
            .lock()
            .expect("lock")
            .push(message.receipt.clone());
        Ok(())
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        self.dead_lettered
            .lock()
            .expect("lock")
            .push((message.receipt.clone(), reason.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct MemoryRepository {
    committed: Mutex<HashMap<String, (Vec<NormalizedRecord>, bool)>>,
    upserts: AtomicU32,
    fail_next_upsert: AtomicBool,
    upsert_delay: Mutex<Option<Duration>>,
}

impl MemoryRepository {
    fn committed_for(&self, document_id: &str) -> Option<(Vec<NormalizedRecord>, bool)> {
        self.committed.lock().expect("lock").get(document_id).cloned()
    }

    fn snapshot(&self) -> HashMap<String, (Vec<NormalizedRecord>, bool)> {
        self.committed.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn upsert(
        &self,
        document_id: &str,
        records: &[NormalizedRecord],
        degraded: bool,
    ) -> Result<CommitResult, RepositoryError> {
        // One-shot: only the first upsert after arming is delayed.
        let delay = self.upsert_delay.lock().expect("lock").take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_upsert.swap(false, Ordering::SeqCst) {
            return Err(RepositoryError::Transient("injected commit failure".into()));
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.committed
            .lock()
            .expect("lock")
            .insert(document_id.to_string(), (records.to_vec(), degraded));
        Ok(CommitResult {
            rows: records.len() as u64,
        })
    }

    async fn exists(&self, document_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.committed.lock().expect("lock").contains_key(document_id))
    }
}

/// Extractor stub: emits a fixed number of page records per document and a
/// configurable number of skipped pages; flips to corrupt on demand.
struct StubExtractor {
    pages: u32,
    skipped: u32,
    corrupt: AtomicBool,
}

impl StubExtractor {
    fn pages(pages: u32) -> Self {
        Self {
            pages,
            skipped: 0,
            corrupt: AtomicBool::new(false),
        }
    }

    fn degraded(pages: u32, skipped: u32) -> Self {
        Self {
            pages,
            skipped,
            corrupt: AtomicBool::new(false),
        }
    }
}

impl Extractor for StubExtractor {
    fn run(&self, key: &DocumentKey, _bytes: &[u8]) -> Result<Extraction, ExtractError> {
        if self.corrupt.load(Ordering::SeqCst) {
            return Err(ExtractError::CorruptDocument {
                key: key.to_string(),
                reason: "not a PDF".to_string(),
            });
        }
        let records = (0..self.pages)
            .map(|page| ExtractedRecord {
                page: page + 1,
                row: 0,
                values: [("Qty".to_string(), format!("{page}"))].into_iter().collect(),
            })
            .collect();
        Ok(Extraction {
            records,
            pages_total: self.pages + self.skipped,
            pages_skipped: self.skipped,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness.

struct Harness {
    store: Arc<MemoryObjectStore>,
    queue: Arc<MemoryQueue>,
    repository: Arc<MemoryRepository>,
    worker: PipelineWorker,
}

fn harness_with(extractor: Arc<dyn Extractor>, options: WorkerOptions) -> Harness {
    let store = Arc::new(MemoryObjectStore::default());
    let queue = Arc::new(MemoryQueue::default());
    let repository = Arc::new(MemoryRepository::default());
    let worker = PipelineWorker::new(
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        Arc::clone(&queue) as Arc<dyn QueueClient>,
        Arc::clone(&repository) as Arc<dyn Repository>,
        extractor,
        Arc::new(RuleTransformer::passthrough()),
        options,
    );
    Harness {
        store,
        queue,
        repository,
        worker,
    }
}

fn harness(pages: u32) -> Harness {
    harness_with(Arc::new(StubExtractor::pages(pages)), WorkerOptions::default())
}

fn message(object_key_encoded: &str, receive_count: u32) -> QueueMessage {
    QueueMessage {
        receipt: format!("receipt-{object_key_encoded}-{receive_count}"),
        body: s3_event_body(object_key_encoded),
        receive_count,
    }
}

// ---------------------------------------------------------------------------
// Scenarios.

#[tokio::test]
async fn end_to_end_commit_then_cleanup() {
    let h = harness(10);
    h.store.put("doc-42.pdf", b"%PDF-bytes");
    let msg = message("doc-42.pdf", 1);

    let outcome = h.worker.process_message(&msg).await;

    assert_eq!(
        outcome,
        Outcome::Committed {
            rows: 10,
            degraded: false
        }
    );
    let (records, degraded) = h.repository.committed_for("doc-42").expect("committed");
    assert_eq!(records.len(), 10);
    assert!(!degraded);
    assert!(!h.store.contains("doc-42.pdf"), "object must be cleaned up");
    assert_eq!(h.queue.deleted_receipts(), vec![msg.receipt.clone()]);
    assert!(h.queue.dead_letters().is_empty());
}

#[tokio::test]
async fn duplicate_redelivery_is_absorbed() {
    let h = harness(10);
    h.store.put("doc-42.pdf", b"%PDF-bytes");

    let first = h.worker.process_message(&message("doc-42.pdf", 1)).await;
    assert!(matches!(first, Outcome::Committed { rows: 10, .. }));
    let state_after_first = h.repository.snapshot();
    let upserts_after_first = h.repository.upserts.load(Ordering::SeqCst);

    // The queue redelivers the same message; the object is already gone.
    let duplicate = message("doc-42.pdf", 2);
    let second = h.worker.process_message(&duplicate).await;

    assert_eq!(second, Outcome::AlreadyProcessed);
    assert_eq!(h.repository.snapshot(), state_after_first, "no duplicate rows");
    assert_eq!(
        h.repository.upserts.load(Ordering::SeqCst),
        upserts_after_first,
        "no re-commit attempted"
    );
    assert!(h
        .queue
        .deleted_receipts()
        .contains(&duplicate.receipt));
}

#[tokio::test]
async fn transient_commit_failure_leaves_everything_in_place() {
    let h = harness(3);
    h.store.put("doc-1.pdf", b"%PDF-bytes");
    h.repository.fail_next_upsert.store(true, Ordering::SeqCst);
    let msg = message("doc-1.pdf", 1);

    let outcome = h.worker.process_message(&msg).await;

    assert!(matches!(outcome, Outcome::Retry { .. }));
    // No premature cleanup: the commit never succeeded.
    assert!(h.store.contains("doc-1.pdf"));
    assert!(h.queue.deleted_receipts().is_empty());
    assert!(h.repository.committed_for("doc-1").is_none());
}

#[tokio::test]
async fn transient_fetch_failure_retries_without_side_effects() {
    let h = harness(3);
    h.store.put("doc-1.pdf", b"%PDF-bytes");
    h.store.fail_fetch.store(true, Ordering::SeqCst);

    let outcome = h.worker.process_message(&message("doc-1.pdf", 1)).await;

    assert!(matches!(outcome, Outcome::Retry { .. }));
    assert!(h.queue.deleted_receipts().is_empty());
    assert!(h.repository.committed_for("doc-1").is_none());
}

#[tokio::test]
async fn object_delete_failure_is_absorbed_on_redelivery() {
    let h = harness(4);
    h.store.put("doc-7.pdf", b"%PDF-bytes");
    h.store.fail_delete.store(true, Ordering::SeqCst);

    let first = h.worker.process_message(&message("doc-7.pdf", 1)).await;
    assert!(matches!(first, Outcome::Retry { .. }));
    // Committed, but the message must survive so redelivery can finish cleanup.
    assert!(h.repository.committed_for("doc-7").is_some());
    assert!(h.queue.deleted_receipts().is_empty());
    assert!(h.store.contains("doc-7.pdf"));

    h.store.fail_delete.store(false, Ordering::SeqCst);
    let state_after_first = h.repository.snapshot();

    let redelivered = message("doc-7.pdf", 2);
    let second = h.worker.process_message(&redelivered).await;

    assert!(matches!(second, Outcome::Committed { rows: 4, .. }));
    assert_eq!(
        h.repository.snapshot(),
        state_after_first,
        "idempotent re-commit leaves identical state"
    );
    assert!(!h.store.contains("doc-7.pdf"));
    assert_eq!(h.queue.deleted_receipts(), vec![redelivered.receipt]);
}

#[tokio::test]
async fn corrupt_document_is_poisoned_and_does_not_block_others() {
    let extractor = Arc::new(StubExtractor::pages(2));
    extractor.corrupt.store(true, Ordering::SeqCst);
    let h = harness_with(Arc::clone(&extractor) as Arc<dyn Extractor>, WorkerOptions::default());
    h.store.put("bad.pdf", b"not a pdf at all");
    h.store.put("good.pdf", b"%PDF-bytes");

    let bad = message("bad.pdf", 1);
    let outcome = h.worker.process_message(&bad).await;

    assert!(matches!(outcome, Outcome::Poisoned { .. }));
    let dead = h.queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].1.contains("corrupt document"));
    assert!(h.queue.deleted_receipts().contains(&bad.receipt));
    assert!(h.repository.committed_for("bad").is_none());

    // A subsequent unrelated message processes normally.
    extractor.corrupt.store(false, Ordering::SeqCst);
    let good = h.worker.process_message(&message("good.pdf", 1)).await;
    assert!(matches!(good, Outcome::Committed { rows: 2, .. }));
}

#[tokio::test]
async fn malformed_payload_is_poisoned() {
    let h = harness(1);
    let msg = QueueMessage {
        receipt: "receipt-garbage".to_string(),
        body: "{\"Records\": []}".to_string(),
        receive_count: 1,
    };

    let outcome = h.worker.process_message(&msg).await;

    assert!(matches!(outcome, Outcome::Poisoned { .. }));
    assert!(h.queue.dead_letters()[0].1.contains("malformed payload"));
    assert!(h.queue.deleted_receipts().contains(&msg.receipt));
}

#[tokio::test]
async fn retry_budget_exhaustion_routes_to_poison() {
    let options = WorkerOptions {
        max_receive_count: 3,
        ..WorkerOptions::default()
    };
    let h = harness_with(Arc::new(StubExtractor::pages(1)), options);
    h.store.put("doc-9.pdf", b"%PDF-bytes");

    let outcome = h.worker.process_message(&message("doc-9.pdf", 4)).await;

    assert!(matches!(outcome, Outcome::Poisoned { .. }));
    assert!(h.queue.dead_letters()[0].1.contains("retry budget"));
    // The document was never touched on this delivery.
    assert!(h.store.contains("doc-9.pdf"));
    assert!(h.repository.committed_for("doc-9").is_none());
}

#[tokio::test]
async fn receive_count_at_the_limit_is_poisoned() {
    let options = WorkerOptions {
        max_receive_count: 3,
        ..WorkerOptions::default()
    };
    let h = harness_with(Arc::new(StubExtractor::pages(1)), options);
    h.store.put("doc-9.pdf", b"%PDF-bytes");

    // The delivery that reaches the limit is routed out, not processed again.
    let outcome = h.worker.process_message(&message("doc-9.pdf", 3)).await;

    assert!(matches!(outcome, Outcome::Poisoned { .. }));
    assert!(h.queue.dead_letters()[0].1.contains("retry budget"));
    assert!(h.store.contains("doc-9.pdf"));
    assert!(h.repository.committed_for("doc-9").is_none());

    // One delivery under the limit still processes normally.
    let outcome = h.worker.process_message(&message("doc-9.pdf", 2)).await;
    assert!(matches!(outcome, Outcome::Committed { rows: 1, .. }));
}

#[tokio::test]
async fn partial_extraction_commits_with_degraded_flag() {
    let h = harness_with(
        Arc::new(StubExtractor::degraded(3, 1)),
        WorkerOptions::default(),
    );
    h.store.put("doc-5.pdf", b"%PDF-bytes");

    let outcome = h.worker.process_message(&message("doc-5.pdf", 1)).await;

    assert_eq!(
        outcome,
        Outcome::Committed {
            rows: 3,
            degraded: true
        }
    );
    let (records, degraded) = h.repository.committed_for("doc-5").expect("committed");
    assert_eq!(records.len(), 3);
    assert!(degraded);
}

#[tokio::test]
async fn zero_usable_records_is_poison() {
    let h = harness_with(
        Arc::new(StubExtractor::degraded(0, 2)),
        WorkerOptions::default(),
    );
    h.store.put("empty.pdf", b"%PDF-bytes");
    let msg = message("empty.pdf", 1);

    let outcome = h.worker.process_message(&msg).await;

    assert!(matches!(outcome, Outcome::Poisoned { .. }));
    assert!(h.queue.dead_letters()[0].1.contains("nothing usable"));
    assert!(h.repository.committed_for("empty").is_none());
}

#[tokio::test]
async fn concurrent_distinct_keys_match_sequential_state() {
    let sequential = harness(2);
    sequential.store.put("a.pdf", b"%PDF-a");
    sequential.store.put("b.pdf", b"%PDF-b");
    sequential.worker.process_message(&message("a.pdf", 1)).await;
    sequential.worker.process_message(&message("b.pdf", 1)).await;
    let expected = sequential.repository.snapshot();

    let concurrent = harness(2);
    concurrent.store.put("a.pdf", b"%PDF-a");
    concurrent.store.put("b.pdf", b"%PDF-b");
    let msg_a = message("a.pdf", 1);
    let msg_b = message("b.pdf", 1);
    let (left, right) = tokio::join!(
        concurrent.worker.process_message(&msg_a),
        concurrent.worker.process_message(&msg_b),
    );
    assert!(matches!(left, Outcome::Committed { .. }));
    assert!(matches!(right, Outcome::Committed { .. }));

    assert_eq!(concurrent.repository.snapshot(), expected);
}

#[tokio::test]
async fn slow_processing_extends_visibility() {
    let options = WorkerOptions {
        extend_threshold: Duration::from_millis(10),
        visibility_timeout: Duration::from_millis(40),
        ..WorkerOptions::default()
    };
    let h = harness_with(Arc::new(StubExtractor::pages(1)), options);
    h.store.put("slow.pdf", b"%PDF-bytes");
    *h.repository.upsert_delay.lock().expect("lock") = Some(Duration::from_millis(150));

    let msg = message("slow.pdf", 1);
    let outcome = h.worker.process_message(&msg).await;

    assert!(matches!(outcome, Outcome::Committed { .. }));
    assert!(
        h.queue.extension_receipts().contains(&msg.receipt),
        "heartbeat must extend visibility during slow processing"
    );
}

#[tokio::test]
async fn messages_waiting_behind_a_slow_document_keep_their_visibility() {
    let options = WorkerOptions {
        extend_threshold: Duration::from_millis(10),
        visibility_timeout: Duration::from_millis(40),
        ..WorkerOptions::default()
    };
    let h = harness_with(Arc::new(StubExtractor::pages(1)), options);
    h.store.put("slow.pdf", b"%PDF-bytes");
    h.store.put("fast.pdf", b"%PDF-bytes");
    *h.repository.upsert_delay.lock().expect("lock") = Some(Duration::from_millis(150));

    let slow = message("slow.pdf", 1);
    let fast = message("fast.pdf", 1);
    {
        let mut pending = h.queue.pending.lock().expect("lock");
        pending.push(slow.clone());
        pending.push(fast.clone());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = h.worker.run(shutdown_rx);
    tokio::pin!(run);
    let _ = tokio::time::timeout(Duration::from_millis(400), run.as_mut()).await;
    let _ = shutdown_tx.send(true);
    tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("worker must stop after shutdown");

    assert!(h.repository.committed_for("slow").is_some());
    assert!(h.repository.committed_for("fast").is_some());
    // The fast document processes in well under the threshold, so the only
    // way it gets an extension is while it waits behind the slow one.
    assert!(
        h.queue.extension_receipts().contains(&fast.receipt),
        "a message held in the batch must keep its visibility extended"
    );
}

#[tokio::test]
async fn worker_loop_drains_queue_and_honors_shutdown() {
    let h = harness(1);
    h.store.put("doc-1.pdf", b"%PDF-bytes");
    h.store.put("doc-2.pdf", b"%PDF-bytes");
    {
        let mut pending = h.queue.pending.lock().expect("lock");
        pending.push(message("doc-1.pdf", 1));
        pending.push(message("doc-2.pdf", 1));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = h.worker.run(shutdown_rx);
    tokio::pin!(run);

    // Give the loop time to drain both messages, then stop it.
    let _ = tokio::time::timeout(Duration::from_millis(200), run.as_mut()).await;
    let _ = shutdown_tx.send(true);
    tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("worker must stop after shutdown");

    assert!(h.repository.committed_for("doc-1").is_some());
    assert!(h.repository.committed_for("doc-2").is_some());
    assert_eq!(h.queue.deleted_receipts().len(), 2);
}
