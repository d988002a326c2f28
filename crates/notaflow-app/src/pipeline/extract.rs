//! Text/table extraction from PDF bytes.
//!
//! Extraction is a pure function over bytes: no I/O, no clock. A page the
//! parser cannot handle is a skippable unit, not a fatal error, so a mostly
//! readable document still yields its readable subset.

use std::collections::BTreeMap;

use thiserror::Error;

use super::{DocumentKey, ExtractedRecord};

/// Errors that abort extraction of the whole document.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("corrupt document `{key}`: {reason}")]
    CorruptDocument { key: String, reason: String },
}

/// Result of extracting one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub records: Vec<ExtractedRecord>,
    pub pages_total: u32,
    pub pages_skipped: u32,
}

impl Extraction {
    /// True when any unit was skipped, distinguishing "fully processed" from
    /// "partially processed".
    pub fn degraded(&self) -> bool {
        self.pages_skipped > 0
    }
}

/// Capability interface for format-specific extraction.
pub trait Extractor: Send + Sync {
    fn run(&self, key: &DocumentKey, bytes: &[u8]) -> Result<Extraction, ExtractError>;
}

/// Line-prefix markers that restrict extraction to a region of the page text.
///
/// Brokerage notes bury the operations table between fixed captions; when the
/// markers are present only lines between them are parsed.
#[derive(Debug, Clone, Default)]
pub struct SectionMarkers {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// PDF table extractor backed by lopdf.
///
/// Each page's text is parsed independently: the first non-empty line is the
/// table header, subsequent lines are rows split on whitespace. Pages whose
/// text cannot be decoded are skipped and counted.
#[derive(Debug, Clone, Default)]
pub struct PdfTableExtractor {
    markers: SectionMarkers,
}

impl PdfTableExtractor {
    pub fn new(markers: SectionMarkers) -> Self {
        Self { markers }
    }
}

impl Extractor for PdfTableExtractor {
    fn run(&self, key: &DocumentKey, bytes: &[u8]) -> Result<Extraction, ExtractError> {
        let document = lopdf::Document::load_mem(bytes).map_err(|err| {
            ExtractError::CorruptDocument {
                key: key.to_string(),
                reason: err.to_string(),
            }
        })?;

        let pages = document.get_pages();
        if pages.is_empty() {
            return Err(ExtractError::CorruptDocument {
                key: key.to_string(),
                reason: "document has no pages".to_string(),
            });
        }

        let mut records = Vec::new();
        let mut pages_skipped = 0_u32;
        let pages_total = pages.len() as u32;

        for (&page_number, _) in &pages {
            match document.extract_text(&[page_number]) {
                Ok(text) => {
                    records.extend(parse_page_table(&text, page_number, &self.markers));
                }
                Err(err) => {
                    tracing::debug!(key = %key, page = page_number, error = %err, "skipping unreadable page");
                    pages_skipped += 1;
                }
            }
        }

        Ok(Extraction {
            records,
            pages_total,
            pages_skipped,
        })
    }
}

/// Parse whitespace-delimited table rows out of one page of text.
///
/// The first non-empty line inside the marked section is the header; each
/// following line becomes one record, cells zipped against the header (cells
/// beyond the header width are dropped, missing cells stay absent).
pub fn parse_page_table(
    text: &str,
    page: u32,
    markers: &SectionMarkers,
) -> Vec<ExtractedRecord> {
    let section = select_section(text, markers);
    let mut lines = section.iter().filter(|line| !line.trim().is_empty());

    let header: Vec<String> = match lines.next() {
        Some(line) => line.split_whitespace().map(str::to_owned).collect(),
        None => return Vec::new(),
    };
    if header.is_empty() {
        return Vec::new();
    }

    let mut records = Vec::new();
    for (row_index, line) in lines.enumerate() {
        let cells = line.split_whitespace();
        let mut values = BTreeMap::new();
        for (column, cell) in header.iter().zip(cells) {
            values.insert(column.clone(), cell.to_owned());
        }
        if values.is_empty() {
            continue;
        }
        records.push(ExtractedRecord {
            page,
            row: row_index as u32,
            values,
        });
    }
    records
}

fn select_section<'a>(text: &'a str, markers: &SectionMarkers) -> Vec<&'a str> {
    let lines: Vec<&str> = text.lines().collect();

    let start = match &markers.start {
        Some(prefix) => match lines.iter().position(|l| l.trim_start().starts_with(prefix)) {
            Some(idx) => idx,
            None => return Vec::new(),
        },
        None => 0,
    };
    let end = match &markers.end {
        Some(prefix) => lines[start..]
            .iter()
            .position(|l| l.trim_start().starts_with(prefix))
            .map(|offset| start + offset)
            .unwrap_or(lines.len()),
        None => lines.len(),
    };

    lines[start..end].to_vec()
}
