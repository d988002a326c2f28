//! Clients for the external collaborators: object store, queue, relational store.

pub mod object_store;
pub mod queue;
pub mod repository;

pub use object_store::{ObjectStore, ObjectStoreError, S3ObjectStore};
pub use queue::{parse_document_key, PayloadError, QueueClient, QueueError, QueueMessage, SqsQueueClient};
pub use repository::{CommitResult, PgRepository, Repository, RepositoryError};
