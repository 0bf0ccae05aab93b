//! Retrieval-augmented query workflow.
//!
//! A query moves through four stages, each consuming the context produced
//! by the previous one:
//!
//! ```text
//! Start ─resolve─▶ Resolved ─retrieve─▶ Retrieved ─rerank─▶ Reranked ─synthesize─▶ Answered
//! ```
//!
//! [`QueryWorkflow::step`] advances a [`QueryState`] by exactly one stage,
//! so stages can neither be skipped nor reordered. [`QueryWorkflow::run`]
//! drives the states to completion under the configured deadline; on
//! expiry the in-flight stage is dropped and the caller gets
//! [`StratusError::Timeout`], never a partial answer.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use stratus_core::embedding::EmbeddingProvider;
use stratus_core::llm::{CompletionOptions, LanguageModel};
use stratus_core::models::{IndexState, Project, RetrievedNode};
use stratus_core::repository::ProjectRepository;
use stratus_core::rerank::{rerank_nodes, Reranker};
use stratus_core::store::VectorStore;
use stratus_core::synth::{self, EMPTY_CONTEXT_ANSWER};
use stratus_core::{StratusError, StratusResult};

/// A question about one project.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub project_id: String,
    pub query: String,
    /// Overrides `retrieval.top_k`.
    pub top_k: Option<usize>,
    /// Overrides `retrieval.top_n`.
    pub top_n: Option<usize>,
}

/// Per-request state handed from stage to stage. Never shared.
#[derive(Debug)]
pub struct QueryContext {
    pub project: Project,
    pub collection: String,
    pub query: String,
    pub top_k: usize,
    pub top_n: usize,
    pub nodes: Vec<RetrievedNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub answer: String,
    /// The nodes the answer was synthesized from, best first.
    pub sources: Vec<RetrievedNode>,
}

#[derive(Debug)]
pub enum QueryState {
    Start(QueryRequest),
    Resolved(QueryContext),
    Retrieved(QueryContext),
    Reranked(QueryContext),
    Answered(QueryAnswer),
}

impl QueryState {
    /// Name of the stage that consumes this state.
    pub fn next_stage(&self) -> &'static str {
        match self {
            Self::Start(_) => "resolve",
            Self::Resolved(_) => "retrieve",
            Self::Retrieved(_) => "rerank",
            Self::Reranked(_) => "synthesize",
            Self::Answered(_) => "done",
        }
    }
}

/// Tunables for [`QueryWorkflow`].
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub top_k: usize,
    pub top_n: usize,
    pub timeout: Duration,
    pub reject_while_indexing: bool,
    pub completion: CompletionOptions,
}

pub struct QueryWorkflow {
    repo: Arc<dyn ProjectRepository>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    llm: Option<Arc<dyn LanguageModel>>,
    settings: WorkflowSettings,
}

impl QueryWorkflow {
    pub fn new(
        repo: Arc<dyn ProjectRepository>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Option<Arc<dyn Reranker>>,
        llm: Option<Arc<dyn LanguageModel>>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            repo,
            store,
            embedder,
            reranker,
            llm,
            settings,
        }
    }

    /// Answer a query, bounded by the configured timeout.
    pub async fn run(&self, request: QueryRequest) -> StratusResult<QueryAnswer> {
        let deadline = self.settings.timeout;
        match tokio::time::timeout(deadline, self.drive(request)).await {
            Ok(result) => result,
            Err(_) => {
                info!(?deadline, "query timed out");
                Err(StratusError::Timeout(deadline))
            }
        }
    }

    async fn drive(&self, request: QueryRequest) -> StratusResult<QueryAnswer> {
        let mut state = QueryState::Start(request);
        loop {
            state = match state {
                QueryState::Answered(answer) => return Ok(answer),
                other => self.step(other).await?,
            };
        }
    }

    /// Advance one stage.
    pub async fn step(&self, state: QueryState) -> StratusResult<QueryState> {
        debug!(stage = state.next_stage(), "query stage");
        match state {
            QueryState::Start(request) => self.resolve(request).await.map(QueryState::Resolved),
            QueryState::Resolved(ctx) => self.retrieve(ctx).await.map(QueryState::Retrieved),
            QueryState::Retrieved(ctx) => self.rerank(ctx).await.map(QueryState::Reranked),
            QueryState::Reranked(ctx) => self.synthesize(ctx).await.map(QueryState::Answered),
            answered @ QueryState::Answered(_) => Ok(answered),
        }
    }

    async fn resolve(&self, request: QueryRequest) -> StratusResult<QueryContext> {
        let project = self
            .repo
            .get_project(&request.project_id)
            .await?
            .ok_or_else(|| StratusError::project_not_found(&request.project_id))?;

        if self.settings.reject_while_indexing {
            if let Some(status) = self.repo.latest_status(&project.id).await? {
                if status.state == IndexState::Processing {
                    return Err(StratusError::Conflict(format!(
                        "project `{}` is being indexed",
                        project.name
                    )));
                }
            }
        }

        let top_k = request.top_k.unwrap_or(self.settings.top_k).max(1);
        let top_n = request.top_n.unwrap_or(self.settings.top_n).clamp(1, top_k);
        Ok(QueryContext {
            collection: project.collection_name().to_string(),
            project,
            query: request.query,
            top_k,
            top_n,
            nodes: Vec::new(),
        })
    }

    async fn retrieve(&self, mut ctx: QueryContext) -> StratusResult<QueryContext> {
        if self.store.count(&ctx.collection).await? == 0 {
            debug!(collection = %ctx.collection, "collection is empty");
            return Ok(ctx);
        }
        let vector = self
            .embedder
            .embed(&ctx.query)
            .await
            .map_err(|e| StratusError::provider(self.embedder.model_name(), &e))?;
        ctx.nodes = self.store.query(&ctx.collection, &vector, ctx.top_k).await?;
        debug!(collection = %ctx.collection, candidates = ctx.nodes.len(), "retrieved");
        Ok(ctx)
    }

    async fn rerank(&self, mut ctx: QueryContext) -> StratusResult<QueryContext> {
        let nodes = std::mem::take(&mut ctx.nodes);
        ctx.nodes = match (&self.reranker, nodes.is_empty()) {
            (Some(reranker), false) => {
                let passages: Vec<&str> = nodes.iter().map(|n| n.payload.as_str()).collect();
                let scores = reranker
                    .score(&ctx.query, &passages)
                    .await
                    .map_err(|e| StratusError::provider(reranker.name(), &e))?;
                rerank_nodes(nodes, &scores, ctx.top_n)
                    .map_err(|e| StratusError::provider(reranker.name(), &e))?
            }
            _ => {
                let mut nodes = nodes;
                nodes.truncate(ctx.top_n);
                nodes
            }
        };
        Ok(ctx)
    }

    async fn synthesize(&self, ctx: QueryContext) -> StratusResult<QueryAnswer> {
        if ctx.nodes.is_empty() {
            return Ok(QueryAnswer {
                answer: EMPTY_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
            });
        }
        let llm = self.llm.as_ref().ok_or_else(|| StratusError::Provider {
            provider: "llm".to_string(),
            message: "no language model configured; set [llm] provider".to_string(),
        })?;

        let texts: Vec<String> = ctx.nodes.iter().map(|n| n.payload.clone()).collect();
        let answer = synth::synthesize(llm.as_ref(), &ctx.query, &texts, &self.settings.completion)
            .await
            .map_err(|e| StratusError::provider(llm.model_name(), &e))?;

        info!(
            project = %ctx.project.name,
            sources = ctx.nodes.len(),
            "query answered"
        );
        Ok(QueryAnswer {
            answer,
            sources: ctx.nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::PathBuf;
    use stratus_core::models::VectorRecord;
    use stratus_core::repository::InMemoryRepository;
    use stratus_core::status::claim_for_indexing;
    use stratus_core::store::memory::InMemoryVectorStore;

    struct Unit;

    #[async_trait]
    impl EmbeddingProvider for Unit {
        fn model_name(&self) -> &str {
            "unit"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct Fixed;

    #[async_trait]
    impl LanguageModel for Fixed {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn context_window(&self) -> usize {
            8192
        }
        async fn complete(&self, _prompt: &str, _opts: &CompletionOptions) -> anyhow::Result<String> {
            Ok("forty-two".to_string())
        }
    }

    fn settings() -> WorkflowSettings {
        WorkflowSettings {
            top_k: 10,
            top_n: 2,
            timeout: Duration::from_secs(5),
            reject_while_indexing: true,
            completion: CompletionOptions::default(),
        }
    }

    async fn fixture(llm: Option<Arc<dyn LanguageModel>>) -> (QueryWorkflow, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        repo.insert_project(Project {
            id: "p1".into(),
            name: "demo".into(),
            path: PathBuf::from("/p"),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .unwrap();

        let store = Arc::new(InMemoryVectorStore::new());
        store.get_or_create("demo").await.unwrap();
        for (i, weight) in [1.0f32, 0.5, 0.1].iter().enumerate() {
            store
                .upsert(
                    "demo",
                    &VectorRecord {
                        identity: format!("doc{i}"),
                        source_path: format!("doc{i}.md"),
                        content_hash: String::new(),
                        document_hash: String::new(),
                        fragment_count: 1,
                        embedding: vec![*weight, 1.0 - weight],
                        payload: format!("payload {i}"),
                        metadata: serde_json::json!({}),
                    },
                )
                .await
                .unwrap();
        }

        let workflow = QueryWorkflow::new(
            repo.clone(),
            store,
            Arc::new(Unit),
            None,
            llm,
            settings(),
        );
        (workflow, repo)
    }

    fn request() -> QueryRequest {
        QueryRequest {
            project_id: "p1".into(),
            query: "what?".into(),
            top_k: None,
            top_n: None,
        }
    }

    #[tokio::test]
    async fn test_each_step_advances_one_stage() {
        let (workflow, _) = fixture(Some(Arc::new(Fixed))).await;
        let mut state = QueryState::Start(request());
        let mut stages = Vec::new();
        while !matches!(state, QueryState::Answered(_)) {
            stages.push(state.next_stage());
            state = workflow.step(state).await.unwrap();
        }
        assert_eq!(stages, ["resolve", "retrieve", "rerank", "synthesize"]);

        let QueryState::Answered(answer) = state else {
            unreachable!()
        };
        assert_eq!(answer.answer, "forty-two");
        let ids: Vec<&str> = answer.sources.iter().map(|n| n.identity.as_str()).collect();
        assert_eq!(ids, ["doc0", "doc1"]);
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() {
        let (workflow, _) = fixture(Some(Arc::new(Fixed))).await;
        let mut req = request();
        req.project_id = "nope".into();
        let err = workflow.run(req).await.unwrap_err();
        assert!(matches!(err, StratusError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_processing_project_is_rejected() {
        let (workflow, repo) = fixture(Some(Arc::new(Fixed))).await;
        claim_for_indexing(repo.as_ref(), "p1").await.unwrap();
        let err = workflow.run(request()).await.unwrap_err();
        assert!(matches!(err, StratusError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_missing_language_model_is_provider_error() {
        let (workflow, _) = fixture(None).await;
        let err = workflow.run(request()).await.unwrap_err();
        assert!(matches!(err, StratusError::Provider { .. }));
    }
}
