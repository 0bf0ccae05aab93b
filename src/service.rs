//! Application wiring.
//!
//! [`Stratus`] builds every component from one [`Config`]: the SQLite
//! pool, the project repository, the vector store, the providers, the
//! chunk planner, the ingestion pipeline, the indexer, the query
//! workflow and the question service. Nothing is global; the CLI and the integration tests each
//! own a `Stratus`.
//!
//! Projects are addressed by id or by name everywhere in this API.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use stratus_core::embedding::EmbeddingProvider;
use stratus_core::llm::LanguageModel;
use stratus_core::models::{Project, ProjectStatus};
use stratus_core::questions::{Answer, Question, QuestionLevel};
use stratus_core::repository::ProjectRepository;
use stratus_core::rerank::Reranker;
use stratus_core::store::VectorStore;
use stratus_core::{StratusError, StratusResult};

use crate::chunk::ChunkPlanner;
use crate::config::Config;
use crate::indexer::{IndexJob, Indexer};
use crate::ingest::IngestionPipeline;
use crate::projects::SqliteProjectRepository;
use crate::questions::{QuestionEntry, QuestionService, QuestionSettings, SqliteQuestionStore};
use crate::sqlite_store::SqliteVectorStore;
use crate::workflow::{QueryAnswer, QueryRequest, QueryWorkflow, WorkflowSettings};
use crate::{db, embedding, llm, migrate, rerank};

/// The swappable capabilities, resolved once from configuration.
#[derive(Clone)]
pub struct Providers {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub llm: Option<Arc<dyn LanguageModel>>,
    pub reranker: Option<Arc<dyn Reranker>>,
}

impl Providers {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            embedder: embedding::create_provider(&config.embedding)?,
            llm: llm::create_llm(&config.llm)?,
            reranker: rerank::create_reranker(&config.rerank)?,
        })
    }
}

pub struct Stratus {
    projects: Arc<SqliteProjectRepository>,
    store: Arc<dyn VectorStore>,
    indexer: Indexer,
    workflow: QueryWorkflow,
    questions: QuestionService,
}

impl Stratus {
    /// Connect, migrate and build the configured providers.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        let providers = Providers::from_config(config)?;
        Self::with_providers(config, pool, providers)
    }

    /// Wire the components around an already migrated pool.
    pub fn with_providers(config: &Config, pool: SqlitePool, providers: Providers) -> Result<Self> {
        let projects = Arc::new(SqliteProjectRepository::new(pool.clone()));
        let repo: Arc<dyn ProjectRepository> = projects.clone();
        let store: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(pool.clone()));
        let completion = llm::completion_options(&config.llm);

        let questions = QuestionService::new(
            SqliteQuestionStore::new(pool),
            Arc::clone(&store),
            Arc::clone(&providers.embedder),
            providers.llm.clone(),
            QuestionSettings {
                count: config.questions.count,
                unanswered_limit: config.questions.unanswered_limit,
                top_k: config.questions.top_k,
                timeout: Duration::from_secs(config.questions.timeout_secs),
                completion,
            },
        );

        let planner = Arc::new(ChunkPlanner::new(&config.chunking, providers.llm.clone())?);
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&providers.embedder),
            planner,
            config.embedding.batch_size,
        ));
        let indexer = Indexer::new(Arc::clone(&repo), pipeline, config.sources.clone());

        let workflow = QueryWorkflow::new(
            repo,
            Arc::clone(&store),
            providers.embedder,
            providers.reranker,
            providers.llm,
            WorkflowSettings {
                top_k: config.retrieval.top_k,
                top_n: config.retrieval.top_n,
                timeout: Duration::from_secs(config.query.timeout_secs),
                reject_while_indexing: config.query.reject_while_indexing,
                completion,
            },
        );

        Ok(Self {
            projects,
            store,
            indexer,
            workflow,
            questions,
        })
    }

    pub async fn create_project(&self, name: &str, path: &Path) -> StratusResult<Project> {
        self.projects.create_project(name, path).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.projects.list_projects().await
    }

    pub async fn project(&self, key: &str) -> StratusResult<Project> {
        self.projects
            .find_project(key)
            .await?
            .ok_or_else(|| StratusError::project_not_found(key))
    }

    /// Delete a project, its status history and its vector collection.
    pub async fn remove_project(&self, key: &str) -> StratusResult<Project> {
        let project = self.project(key).await?;
        self.projects.delete_project(&project.id).await?;
        self.store.drop_collection(project.collection_name()).await?;
        info!(project = %project.name, "project removed");
        Ok(project)
    }

    /// Claim the project and start a detached indexing run.
    pub async fn start_indexing(&self, key: &str) -> StratusResult<IndexJob> {
        let project = self.project(key).await?;
        self.indexer.start(&project.id).await
    }

    /// The project, its latest status and its indexed unit count.
    pub async fn status(&self, key: &str) -> StratusResult<ProjectReport> {
        let project = self.project(key).await?;
        let status = self.projects.latest_status(&project.id).await?;
        let units = self.store.count(project.collection_name()).await?;
        Ok(ProjectReport {
            project,
            status,
            units,
        })
    }

    /// Status rows of a project, newest first.
    pub async fn history(&self, key: &str, limit: i64) -> StratusResult<Vec<ProjectStatus>> {
        let project = self.project(key).await?;
        Ok(self.projects.status_history(&project.id, limit).await?)
    }

    pub async fn query(
        &self,
        key: &str,
        text: &str,
        top_k: Option<usize>,
        top_n: Option<usize>,
    ) -> StratusResult<QueryAnswer> {
        let project = self.project(key).await?;
        self.workflow
            .run(QueryRequest {
                project_id: project.id,
                query: text.to_string(),
                top_k,
                top_n,
            })
            .await
    }

    /// Unanswered questions, or a newly generated set when there are none
    /// or `fresh` is set.
    pub async fn generate_questions(
        &self,
        key: &str,
        level: Option<QuestionLevel>,
        fresh: bool,
    ) -> StratusResult<Vec<Question>> {
        let project = self.project(key).await?;
        self.questions.generate(&project, level, fresh).await
    }

    pub async fn list_questions(&self, key: &str) -> StratusResult<Vec<QuestionEntry>> {
        let project = self.project(key).await?;
        self.questions.list(&project).await
    }

    pub async fn evaluate_answer(
        &self,
        key: &str,
        question_id: &str,
        answer: &str,
    ) -> StratusResult<Answer> {
        let project = self.project(key).await?;
        self.questions.evaluate(&project, question_id, answer).await
    }

    pub async fn rephrase_question(&self, key: &str, question_id: &str) -> StratusResult<Question> {
        let project = self.project(key).await?;
        self.questions.rephrase(&project, question_id).await
    }
}

/// Snapshot returned by [`Stratus::status`].
#[derive(Debug, Clone)]
pub struct ProjectReport {
    pub project: Project,
    pub status: Option<ProjectStatus>,
    pub units: usize,
}
