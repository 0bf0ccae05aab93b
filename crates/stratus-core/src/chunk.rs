//! Content units, stable identities, and line-range slicing.
//!
//! A document becomes one or more [`ContentUnit`]s. Each unit is a
//! contiguous, non-empty run of the document's body lines prefixed with
//! the document header. Its identity is derived from the source path and
//! the unit's fragment index, so it is stable across runs; its content
//! hash changes whenever the covered text changes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{ContentUnit, SourceDocument};

/// An inclusive, 1-based range of body lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Hex SHA-256 of a string.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable identity of the `fragment`-th unit of `source_path`.
pub fn unit_identity(source_path: &str, fragment: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_path.as_bytes());
    hasher.update([0u8]);
    hasher.update((fragment as u64).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash of the whole document as it would be embedded.
pub fn document_hash(doc: &SourceDocument) -> String {
    hash_text(&doc.content())
}

/// The unsplit document as a single unit, or `None` when the body is blank.
pub fn whole_document_unit(doc: &SourceDocument) -> Option<ContentUnit> {
    if doc.body.trim().is_empty() {
        return None;
    }
    let text = doc.content();
    Some(ContentUnit {
        identity: unit_identity(&doc.relative_path, 0),
        source_path: doc.relative_path.clone(),
        fragment: 0,
        line_start: 1,
        line_end: doc.line_count().max(1),
        content_hash: hash_text(&text),
        document_hash: hash_text(&text),
        fragment_count: 1,
        text,
    })
}

/// Slice a document along validated ranges.
///
/// Ranges must already be ordered, disjoint, and in bounds (see
/// [`crate::planner::validate_ranges`]). Whitespace-only slices are
/// dropped; fragment indices stay contiguous from 0.
pub fn units_from_ranges(doc: &SourceDocument, ranges: &[LineRange]) -> Vec<ContentUnit> {
    let lines: Vec<&str> = doc.body.lines().collect();
    let doc_hash = document_hash(doc);
    let mut units = Vec::with_capacity(ranges.len());

    for range in ranges {
        let slice = lines[range.start - 1..range.end].join("\n");
        if slice.trim().is_empty() {
            continue;
        }
        let fragment = units.len();
        let text = format!("{}{}", doc.header, slice);
        units.push(ContentUnit {
            identity: unit_identity(&doc.relative_path, fragment),
            source_path: doc.relative_path.clone(),
            fragment,
            line_start: range.start,
            line_end: range.end,
            content_hash: hash_text(&text),
            document_hash: doc_hash.clone(),
            fragment_count: 0,
            text,
        });
    }

    let count = units.len();
    for unit in &mut units {
        unit.fragment_count = count;
    }
    units
}

/// Compute split ranges at blank-line boundaries.
///
/// Paragraphs (runs of non-blank lines) are packed greedily while the
/// packed range stays within `target_lines`. A paragraph longer than
/// `target_lines` is hard-split into `target_lines`-sized pieces.
pub fn paragraph_ranges(body: &str, target_lines: usize) -> Vec<LineRange> {
    let target = target_lines.max(1);
    let lines: Vec<&str> = body.lines().collect();

    let mut paragraphs = Vec::new();
    let mut start: Option<usize> = None;
    for (i, line) in lines.iter().enumerate() {
        let n = i + 1;
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                paragraphs.push(LineRange::new(s, n - 1));
            }
        } else if start.is_none() {
            start = Some(n);
        }
    }
    if let Some(s) = start {
        paragraphs.push(LineRange::new(s, lines.len()));
    }

    let mut ranges = Vec::new();
    let mut current: Option<LineRange> = None;

    for para in paragraphs {
        if let Some(cur) = current {
            if para.end + 1 - cur.start <= target {
                current = Some(LineRange::new(cur.start, para.end));
                continue;
            }
            ranges.push(cur);
            current = None;
        }

        if para.len() > target {
            let mut s = para.start;
            while s <= para.end {
                let e = (s + target - 1).min(para.end);
                ranges.push(LineRange::new(s, e));
                s = e + 1;
            }
        } else {
            current = Some(para);
        }
    }

    if let Some(cur) = current {
        ranges.push(cur);
    }

    ranges
}
