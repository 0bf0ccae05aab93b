//! Core data models used throughout Stratus.
//!
//! These types represent projects and their indexing status, the documents
//! and content units that flow through ingestion, and the records and
//! retrieved nodes exchanged with the vector store.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered source tree.
///
/// `name` doubles as the vector collection key and is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Name of the vector collection holding this project's records.
    pub fn collection_name(&self) -> &str {
        &self.name
    }
}

/// Lifecycle state of one indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    /// Registered, not yet started.
    Queue,
    /// Ingestion in flight.
    Processing,
    /// Terminal: the run failed or was cancelled.
    Failed,
    /// Terminal: the run completed.
    Success,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Success => "success",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Success)
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue" => Ok(Self::Queue),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            "success" => Ok(Self::Success),
            other => Err(format!("unknown index state: {other}")),
        }
    }
}

/// One status row of a project. A new row is created per indexing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectStatus {
    pub id: String,
    pub project_id: String,
    pub state: IndexState,
    /// Failure reason for `Failed` rows.
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A raw file read from a project's source tree.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Path relative to the project root, `/`-separated.
    pub relative_path: String,
    pub file_name: String,
    /// Human-readable name/path header prefixed to every embedded text.
    pub header: String,
    /// File content, unmodified.
    pub body: String,
    pub modified_at: Option<DateTime<Utc>>,
}

impl SourceDocument {
    pub fn new(
        path: PathBuf,
        relative_path: impl Into<String>,
        body: impl Into<String>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Self {
        let relative_path = relative_path.into();
        let file_name = relative_path
            .rsplit('/')
            .next()
            .unwrap_or(relative_path.as_str())
            .to_string();
        let header = document_header(&file_name, &relative_path);
        Self {
            path,
            relative_path,
            file_name,
            header,
            body: body.into(),
            modified_at,
        }
    }

    /// Header followed by the body: the text embedded when the document
    /// is not split.
    pub fn content(&self) -> String {
        format!("{}{}", self.header, self.body)
    }

    pub fn line_count(&self) -> usize {
        self.body.lines().count()
    }
}

/// Build the header that disambiguates near-identical content across paths.
pub fn document_header(file_name: &str, relative_path: &str) -> String {
    format!("File: {file_name}\nPath: {relative_path}\n\n")
}

/// A unit of content derived from one [`SourceDocument`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUnit {
    /// Stable key: derived from `source_path` and `fragment`.
    pub identity: String,
    pub source_path: String,
    /// Zero-based index of this unit within its document.
    pub fragment: usize,
    /// First body line covered (1-based, inclusive).
    pub line_start: usize,
    /// Last body line covered (1-based, inclusive).
    pub line_end: usize,
    /// Header plus the covered lines.
    pub text: String,
    /// SHA-256 of `text`; drives update-vs-skip.
    pub content_hash: String,
    /// SHA-256 of the whole source document.
    pub document_hash: String,
    /// Number of units the document was split into.
    pub fragment_count: usize,
}

impl ContentUnit {
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "path": self.source_path,
            "fragment": self.fragment,
            "line_start": self.line_start,
            "line_end": self.line_end,
        })
    }
}

/// A record persisted in a named vector collection.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub identity: String,
    pub source_path: String,
    pub content_hash: String,
    pub document_hash: String,
    pub fragment_count: usize,
    pub embedding: Vec<f32>,
    pub payload: String,
    pub metadata: serde_json::Value,
}

impl VectorRecord {
    pub fn from_unit(unit: &ContentUnit, embedding: Vec<f32>) -> Self {
        Self {
            identity: unit.identity.clone(),
            source_path: unit.source_path.clone(),
            content_hash: unit.content_hash.clone(),
            document_hash: unit.document_hash.clone(),
            fragment_count: unit.fragment_count,
            embedding,
            payload: unit.text.clone(),
            metadata: unit.metadata(),
        }
    }
}

/// A record returned by a similarity query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedNode {
    pub identity: String,
    pub payload: String,
    pub metadata: serde_json::Value,
    /// Similarity score, replaced by the rerank score after stage 3.
    pub score: f64,
    /// Zero-based position in the original retrieval order.
    pub retrieval_rank: usize,
}

/// Counts produced by one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub documents: usize,
    pub skipped_files: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl IngestReport {
    /// Number of units present in the collection after the run.
    pub fn total_units(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_state_roundtrip_names() {
        for state in [
            IndexState::Queue,
            IndexState::Processing,
            IndexState::Failed,
            IndexState::Success,
        ] {
            assert_eq!(state.as_str().parse::<IndexState>().unwrap(), state);
        }
        assert!("running".parse::<IndexState>().is_err());
    }

    #[test]
    fn test_document_header_is_prefixed() {
        let doc = SourceDocument::new(
            PathBuf::from("/p/src/lib.rs"),
            "src/lib.rs",
            "fn main() {}\n",
            None,
        );
        assert_eq!(doc.file_name, "lib.rs");
        assert!(doc.content().starts_with("File: lib.rs\nPath: src/lib.rs\n\n"));
        assert!(doc.content().ends_with("fn main() {}\n"));
        assert_eq!(doc.line_count(), 1);
    }
}
