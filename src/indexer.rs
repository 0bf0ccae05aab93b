//! Status-gated, detached indexing jobs.
//!
//! [`Indexer::start`] claims the project through the atomic status gate
//! and returns immediately. The run itself (scan, reconcile, final status
//! write) happens on a spawned task. Callers observe the outcome by
//! polling the project's status, or by awaiting the returned handle.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use stratus_core::models::{IndexState, IngestReport, Project, ProjectStatus};
use stratus_core::repository::ProjectRepository;
use stratus_core::status::{claim_for_indexing, transition};
use stratus_core::{StratusError, StratusResult};

use crate::config::SourcesConfig;
use crate::connector_fs::SourceFilter;
use crate::ingest::IngestionPipeline;

/// A running indexing job.
pub struct IndexJob {
    /// The claimed status row, in `PROCESSING`.
    pub status: ProjectStatus,
    /// Resolves once the final status has been written.
    pub handle: JoinHandle<StratusResult<IngestReport>>,
    /// Cancels the run at the next step boundary.
    pub cancel: CancellationToken,
}

pub struct Indexer {
    repo: Arc<dyn ProjectRepository>,
    pipeline: Arc<IngestionPipeline>,
    sources: SourcesConfig,
}

impl Indexer {
    pub fn new(
        repo: Arc<dyn ProjectRepository>,
        pipeline: Arc<IngestionPipeline>,
        sources: SourcesConfig,
    ) -> Self {
        Self {
            repo,
            pipeline,
            sources,
        }
    }

    /// Start indexing a project.
    ///
    /// Fails with `NotFound` for an unknown project and `Conflict` when a
    /// run is already in progress. Otherwise the returned job owns the
    /// `PROCESSING` row and always moves it to `SUCCESS` or `FAILED`.
    pub async fn start(&self, project_id: &str) -> StratusResult<IndexJob> {
        let status = claim_for_indexing(self.repo.as_ref(), project_id).await?;
        let project = match self.repo.get_project(project_id).await? {
            Some(project) => project,
            None => {
                // Removed between the claim and this read.
                let err = StratusError::project_not_found(project_id);
                record_outcome(self.repo.as_ref(), &status, Some(&err)).await;
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let job = Job {
            repo: Arc::clone(&self.repo),
            pipeline: Arc::clone(&self.pipeline),
            sources: self.sources.clone(),
            project,
            status: status.clone(),
            cancel: cancel.clone(),
        };
        let span = tracing::info_span!("index", project = %job.project.name);
        let handle = tokio::spawn(job.run().instrument(span));

        Ok(IndexJob {
            status,
            handle,
            cancel,
        })
    }
}

struct Job {
    repo: Arc<dyn ProjectRepository>,
    pipeline: Arc<IngestionPipeline>,
    sources: SourcesConfig,
    project: Project,
    status: ProjectStatus,
    cancel: CancellationToken,
}

impl Job {
    async fn run(self) -> StratusResult<IngestReport> {
        info!(root = %self.project.path.display(), "indexing started");
        let result = self.index().await;
        record_outcome(self.repo.as_ref(), &self.status, result.as_ref().err()).await;
        result
    }

    async fn index(&self) -> StratusResult<IngestReport> {
        let root = self.project.path.clone();
        let sources = self.sources.clone();
        let scan = tokio::task::spawn_blocking(move || {
            let filter = SourceFilter::new(&root, &sources)?;
            filter.scan()
        })
        .await
        .map_err(|e| StratusError::Storage(e.into()))??;

        self.pipeline
            .run(self.project.collection_name(), scan, &self.cancel)
            .await
    }
}

/// Move a `PROCESSING` row to its terminal state.
async fn record_outcome(
    repo: &dyn ProjectRepository,
    status: &ProjectStatus,
    failure: Option<&StratusError>,
) {
    let (to, message) = match failure {
        None => (IndexState::Success, None),
        Some(err) => (IndexState::Failed, Some(err.to_string())),
    };
    match transition(repo, status, to, message.as_deref()).await {
        Ok(()) => match failure {
            None => info!(status_id = %status.id, "indexing succeeded"),
            Some(err) => error!(status_id = %status.id, error = %err, "indexing failed"),
        },
        Err(e) => error!(
            status_id = %status.id,
            error = %e,
            "could not record indexing outcome"
        ),
    }
}
