//! The consume-process-commit-cleanup loop.
//!
//! A worker drives one message at a time to a terminal [`Outcome`]. The
//! ordering invariant lives here: relational commit first, then object
//! delete, then queue delete. Every failure class maps onto the queue's
//! native redelivery (retry), a dead-letter route (poison), or success.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::pipeline::extract::{ExtractError, Extractor};
use crate::pipeline::transform::Transform;
use crate::pipeline::{DocumentKey, Outcome};
use crate::services::object_store::{ObjectStore, ObjectStoreError};
use crate::services::queue::{parse_document_key, QueueClient, QueueMessage};
use crate::services::repository::{Repository, RepositoryError};

/// Tunables for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Messages requested per receive call.
    pub batch_size: u32,
    /// Visibility window requested on receive and granted on each extension.
    pub visibility_timeout: Duration,
    /// Processing time after which the visibility heartbeat starts.
    pub extend_threshold: Duration,
    /// Delivery count at which a message is routed to poison instead of
    /// processed again.
    pub max_receive_count: u32,
    /// Sleep between polls when the queue is empty or erroring.
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            visibility_timeout: Duration::from_secs(60),
            extend_threshold: Duration::from_secs(30),
            max_receive_count: 5,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Orchestrates one document through fetch, extract, transform, commit and
/// cleanup. Holds no mutable state; clones of the `Arc`'d clients are the
/// only thing shared between concurrent workers.
pub struct PipelineWorker {
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn QueueClient>,
    repository: Arc<dyn Repository>,
    extractor: Arc<dyn Extractor>,
    transformer: Arc<dyn Transform>,
    options: WorkerOptions,
}

impl PipelineWorker {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn QueueClient>,
        repository: Arc<dyn Repository>,
        extractor: Arc<dyn Extractor>,
        transformer: Arc<dyn Transform>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            store,
            queue,
            repository,
            extractor,
            transformer,
            options,
        }
    }

    /// Process a single message to a terminal outcome, with the visibility
    /// heartbeat running alongside slow documents.
    pub async fn process_message(&self, message: &QueueMessage) -> Outcome {
        let heartbeat = self.spawn_heartbeat(message.clone());
        let outcome = self.process_one(message).await;
        heartbeat.abort();
        outcome
    }

    /// One full pass over the pipeline. Pure-step failures resolve to an
    /// outcome for this message; nothing here aborts the worker loop.
    async fn process_one(&self, message: &QueueMessage) -> Outcome {
        if message.receive_count >= self.options.max_receive_count {
            return self
                .route_poison(
                    message,
                    format!(
                        "retry budget exhausted after {} deliveries",
                        message.receive_count
                    ),
                )
                .await;
        }

        let key = match parse_document_key(&message.body) {
            Ok(key) => key,
            Err(err) => {
                return self
                    .route_poison(message, format!("malformed payload: {err}"))
                    .await;
            }
        };

        let bytes = match self.store.fetch(&key).await {
            Ok(bytes) => bytes,
            Err(ObjectStoreError::NotFound(_)) => {
                // A prior attempt committed and deleted the object but crashed
                // before the queue delete. The work is done; drop the message.
                return self.finish_already_processed(message, &key).await;
            }
            Err(ObjectStoreError::Transient(reason)) => {
                return Outcome::Retry {
                    reason: format!("fetch failed: {reason}"),
                };
            }
        };

        let extraction = match self.extractor.run(&key, &bytes) {
            Ok(extraction) => extraction,
            Err(ExtractError::CorruptDocument { reason, .. }) => {
                return self
                    .route_poison(message, format!("corrupt document: {reason}"))
                    .await;
            }
        };
        let degraded = extraction.degraded();
        if degraded {
            tracing::warn!(
                key = %key,
                pages_total = extraction.pages_total,
                pages_skipped = extraction.pages_skipped,
                "partial extraction"
            );
        }

        let transformed = self.transformer.run(&key, &extraction.records);
        for rejected in &transformed.rejected {
            tracing::warn!(
                key = %key,
                page = rejected.page,
                row = rejected.row,
                reason = %rejected.reason,
                "record rejected by validation"
            );
        }
        if transformed.normalized.is_empty() {
            return self
                .route_poison(message, "nothing usable extracted".to_string())
                .await;
        }

        let commit = match self
            .repository
            .upsert(key.document_id(), &transformed.normalized, degraded)
            .await
        {
            Ok(commit) => commit,
            Err(RepositoryError::Transient(reason)) => {
                return Outcome::Retry {
                    reason: format!("commit failed: {reason}"),
                };
            }
            Err(RepositoryError::Permanent(reason)) => {
                return self
                    .route_poison(message, format!("commit rejected: {reason}"))
                    .await;
            }
        };

        // Cleanup only after the commit is confirmed, object before message.
        // A failed object delete leaves the message for redelivery; the
        // not-found path above absorbs the replay.
        if let Err(err) = self.store.delete(&key).await {
            return Outcome::Retry {
                reason: format!("object delete failed: {err}"),
            };
        }
        if let Err(err) = self.queue.delete(message).await {
            // The commit stands and the object is gone; redelivery will take
            // the already-processed path and only retry this delete.
            tracing::warn!(key = %key, error = %err, "queue delete failed after cleanup");
        }

        Outcome::Committed {
            rows: commit.rows,
            degraded,
        }
    }

    async fn finish_already_processed(
        &self,
        message: &QueueMessage,
        key: &DocumentKey,
    ) -> Outcome {
        tracing::info!(key = %key, "object already cleaned up; dropping duplicate message");
        match self.queue.delete(message).await {
            Ok(()) => Outcome::AlreadyProcessed,
            Err(err) => Outcome::Retry {
                reason: format!("queue delete failed: {err}"),
            },
        }
    }

    /// Remove a message from normal flow: forward to the dead-letter sink,
    /// then delete. If either step fails the message stays queued and the
    /// routing is re-attempted on redelivery.
    async fn route_poison(&self, message: &QueueMessage, reason: String) -> Outcome {
        if let Err(err) = self.queue.dead_letter(message, &reason).await {
            return Outcome::Retry {
                reason: format!("dead-letter forward failed: {err}"),
            };
        }
        match self.queue.delete(message).await {
            Ok(()) => Outcome::Poisoned { reason },
            Err(err) => Outcome::Retry {
                reason: format!("queue delete failed: {err}"),
            },
        }
    }

    fn spawn_heartbeat(&self, message: QueueMessage) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let threshold = self.options.extend_threshold;
        let extension = self.options.visibility_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            loop {
                if let Err(err) = queue.extend_visibility(&message, extension).await {
                    tracing::warn!(error = %err, "failed to extend message visibility");
                }
                tokio::time::sleep(extension / 2).await;
            }
        })
    }

    /// Receive-process loop for one worker. Returns when `shutdown` flips;
    /// the in-flight message is always driven to its terminal outcome first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self
                    .queue
                    .receive(self.options.batch_size, self.options.visibility_timeout) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::warn!(error = %err, "queue receive failed");
                    Vec::new()
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
                continue;
            }

            // Every held message gets a heartbeat from receipt, not from the
            // start of its own processing: a slow document earlier in the
            // batch must not let the visibility of the ones behind it lapse.
            let heartbeats: Vec<JoinHandle<()>> = messages
                .iter()
                .map(|message| self.spawn_heartbeat(message.clone()))
                .collect();

            for (message, heartbeat) in messages.iter().zip(&heartbeats) {
                let outcome = self.process_one(message).await;
                heartbeat.abort();
                log_outcome(message, &outcome);
                if *shutdown.borrow() {
                    break;
                }
            }
            for heartbeat in &heartbeats {
                heartbeat.abort();
            }
        }
    }
}

/// Spawn `concurrency` independent worker loops over shared clients.
pub fn spawn_workers(
    worker: Arc<PipelineWorker>,
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..concurrency)
        .map(|index| {
            let worker = Arc::clone(&worker);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tracing::debug!(worker = index, "worker loop started");
                worker.run(shutdown).await;
                tracing::debug!(worker = index, "worker loop stopped");
            })
        })
        .collect()
}

fn log_outcome(message: &QueueMessage, outcome: &Outcome) {
    match outcome {
        Outcome::Committed { rows, degraded } => {
            tracing::info!(rows, degraded, "document committed");
        }
        Outcome::AlreadyProcessed => {
            tracing::info!("duplicate delivery resolved");
        }
        Outcome::Poisoned { reason } => {
            tracing::warn!(receive_count = message.receive_count, %reason, "message poisoned");
        }
        Outcome::Retry { reason } => {
            tracing::warn!(receive_count = message.receive_count, %reason, "message left for redelivery");
        }
    }
}
