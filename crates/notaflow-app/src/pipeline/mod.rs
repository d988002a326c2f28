//! The consume-process-commit pipeline and the data that flows through it.

pub mod extract;
pub mod transform;
pub mod worker;

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

/// Identifier of a document in the object store.
///
/// The raw object key (with its file extension) addresses the blob; the
/// derived [`document_id`](DocumentKey::document_id) is the identity under
/// which records are committed to the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("document key must not be empty")]
    Empty,
}

impl DocumentKey {
    pub fn new(key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(key))
    }

    /// The full object-store key, e.g. `doc-42.pdf`.
    pub fn object_key(&self) -> &str {
        &self.0
    }

    /// Relational identity: the object key minus a trailing `.pdf`.
    pub fn document_id(&self) -> &str {
        let lower = self.0.to_ascii_lowercase();
        if let Some(stem_len) = lower.strip_suffix(".pdf").map(str::len) {
            &self.0[..stem_len]
        } else {
            &self.0
        }
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A structured unit of extracted content, untyped at this stage.
///
/// `values` maps raw header names (as they appear in the document) to cell
/// text. Position is `(page, row)`; together with the document key it is the
/// record's identity through the rest of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRecord {
    pub page: u32,
    pub row: u32,
    pub values: BTreeMap<String, String>,
}

/// A single typed field value after normalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Number(f64),
    Date(NaiveDate),
    Null,
}

/// Typed, validated counterpart of [`ExtractedRecord`]. Same identity, field
/// values coerced to their target types.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub page: u32,
    pub row: u32,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Terminal outcome of processing one queue message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Records committed; `degraded` marks a partial extraction.
    Committed { rows: u64, degraded: bool },
    /// The object was already cleaned up by a prior attempt; nothing to do.
    AlreadyProcessed,
    /// Message routed out of normal flow; never retried again.
    Poisoned { reason: String },
    /// Message left on the queue for native redelivery.
    Retry { reason: String },
}
