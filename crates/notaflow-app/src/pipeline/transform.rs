//! Normalization of raw extracted records.
//!
//! Validation is declarative: one [`FieldRule`] per target column. The stage
//! is pure and deterministic (no wall clock, no randomness), so repeated
//! transforms of the same input feed identical record sets to the repository,
//! which keeps upserts idempotent across retries.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Deserialize;

use super::{DocumentKey, ExtractedRecord, FieldValue, NormalizedRecord};

/// Target type for a validated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Number,
    Date,
}

/// Declarative validation rule for one column.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldRule {
    /// Sanitized column name the rule applies to.
    pub column: String,
    pub target: FieldType,
    #[serde(default)]
    pub nullable: bool,
    /// Raw value substituted when the cell is missing or empty.
    #[serde(default)]
    pub default: Option<String>,
}

/// A record dropped by validation, with the reason it was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub page: u32,
    pub row: u32,
    pub reason: String,
}

/// Output of one transform run.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub normalized: Vec<NormalizedRecord>,
    pub rejected: Vec<RejectedRecord>,
}

/// Capability interface for the normalization stage.
pub trait Transform: Send + Sync {
    fn run(&self, key: &DocumentKey, records: &[ExtractedRecord]) -> TransformOutput;
}

/// Rule-driven transformer. Columns without a rule pass through as text.
#[derive(Debug, Clone)]
pub struct RuleTransformer {
    rules: Vec<FieldRule>,
    /// Format accepted by `date` rules, e.g. `%d/%m/%Y` for brokerage notes.
    date_format: String,
}

impl RuleTransformer {
    pub fn new(rules: Vec<FieldRule>, date_format: impl Into<String>) -> Self {
        Self {
            rules,
            date_format: date_format.into(),
        }
    }

    /// Transformer with no typed rules: every column passes through as text.
    pub fn passthrough() -> Self {
        Self::new(Vec::new(), "%d/%m/%Y")
    }

    fn normalize_one(&self, record: &ExtractedRecord) -> Result<NormalizedRecord, String> {
        // Keys are sanitized up front so rules address stable column names.
        let mut raw: BTreeMap<String, String> = BTreeMap::new();
        for (column, value) in &record.values {
            raw.insert(sanitize_column_name(column), value.clone());
        }

        let mut fields: BTreeMap<String, FieldValue> = BTreeMap::new();
        for rule in &self.rules {
            let cell = raw
                .remove(&rule.column)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| rule.default.clone());

            let value = match cell {
                Some(cell) => coerce(&cell, rule.target, &self.date_format)
                    .map_err(|reason| format!("column `{}`: {reason}", rule.column))?,
                None if rule.nullable => FieldValue::Null,
                None => return Err(format!("column `{}` is required but missing", rule.column)),
            };
            fields.insert(rule.column.clone(), value);
        }

        // Whatever the rules did not claim survives untyped.
        for (column, value) in raw {
            fields.entry(column).or_insert(FieldValue::Text(value));
        }

        Ok(NormalizedRecord {
            page: record.page,
            row: record.row,
            fields,
        })
    }
}

impl Transform for RuleTransformer {
    fn run(&self, key: &DocumentKey, records: &[ExtractedRecord]) -> TransformOutput {
        let mut normalized = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();

        for record in records {
            match self.normalize_one(record) {
                Ok(rec) => normalized.push(rec),
                Err(reason) => {
                    tracing::debug!(
                        key = %key,
                        page = record.page,
                        row = record.row,
                        %reason,
                        "rejecting record"
                    );
                    rejected.push(RejectedRecord {
                        page: record.page,
                        row: record.row,
                        reason,
                    });
                }
            }
        }

        TransformOutput {
            normalized,
            rejected,
        }
    }
}

fn coerce(cell: &str, target: FieldType, date_format: &str) -> Result<FieldValue, String> {
    let cell = cell.trim();
    match target {
        FieldType::Text => Ok(FieldValue::Text(cell.to_owned())),
        FieldType::Integer => parse_integer(cell)
            .map(FieldValue::Integer)
            .ok_or_else(|| format!("`{cell}` is not an integer")),
        FieldType::Number => parse_number(cell)
            .map(FieldValue::Number)
            .ok_or_else(|| format!("`{cell}` is not a number")),
        FieldType::Date => NaiveDate::parse_from_str(cell, date_format)
            .map(FieldValue::Date)
            .map_err(|_| format!("`{cell}` does not match date format `{date_format}`")),
    }
}

fn parse_integer(cell: &str) -> Option<i64> {
    cell.replace('.', "").parse::<i64>().ok()
}

/// Accepts both `1234.56` and the Brazilian `1.234,56` notation.
fn parse_number(cell: &str) -> Option<f64> {
    if let Ok(v) = cell.parse::<f64>() {
        return Some(v);
    }
    if cell.contains(',') {
        return cell.replace('.', "").replace(',', ".").parse::<f64>().ok();
    }
    None
}

/// Lowercase, ascii-fold common accents, and collapse every other run of
/// non-alphanumeric characters into a single underscore.
pub fn sanitize_column_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_separator = false;
    for ch in name.chars() {
        let ch = fold_accent(ch).unwrap_or(ch).to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_was_separator = false;
        } else if !last_was_separator && !out.is_empty() {
            out.push('_');
            last_was_separator = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

// Only the Portuguese set seen in brokerage-note headers.
fn fold_accent(ch: char) -> Option<char> {
    match ch {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => Some('a'),
        'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => Some('e'),
        'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => Some('i'),
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => Some('o'),
        'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => Some('u'),
        'ç' | 'Ç' => Some('c'),
        'ñ' | 'Ñ' => Some('n'),
        _ => None,
    }
}
