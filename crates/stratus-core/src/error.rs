//! Error taxonomy shared by indexing and querying.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::IndexState;

/// Domain errors surfaced by the indexing gate, the ingestion pipeline,
/// the chunk planner, and the query workflow.
#[derive(Error, Debug)]
pub enum StratusError {
    /// A project (or the collection behind it) does not exist.
    #[error("{kind} `{id}` not found")]
    NotFound {
        /// What was looked up (`"project"`, `"collection"`).
        kind: &'static str,
        /// The identifier that was requested.
        id: String,
    },

    /// The request itself is malformed (bad name, path that is not a directory).
    #[error("invalid input: {0}")]
    Invalid(String),

    /// The operation collides with work already in flight for the project.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The source tree could not be read.
    ///
    /// An empty or missing directory is not an error; this variant is
    /// reserved for genuine I/O failures such as permission problems.
    #[error("failed to load {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The split decision for a document could not be produced or repaired.
    #[error("chunk planning failed for `{path}`: {message}")]
    Planning { path: String, message: String },

    /// An embedding, language-model, or reranking call failed after retry.
    #[error("{provider} provider failed: {message}")]
    Provider { provider: String, message: String },

    /// A query exceeded its deadline.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// An ingestion run was cancelled between reconciliation steps.
    #[error("indexing cancelled")]
    Cancelled,

    /// A status transition that the state machine forbids.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: IndexState, to: IndexState },

    /// Persistence failure in a store or repository.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl StratusError {
    pub fn project_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "project",
            id: id.into(),
        }
    }

    /// Wrap a provider failure, keeping the full cause chain in the message.
    pub fn provider(provider: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: format!("{err:#}"),
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::Timeout(_) | Self::Provider { .. }
        )
    }
}

pub type StratusResult<T> = Result<T, StratusError>;
