//! Practice questions: generation, grading and rephrasing on top of a
//! project's indexed content.
//!
//! ```text
//! generate ─▶ unanswered questions? ──yes──▶ return them
//!                     │ no
//!                     ▼
//!        retrieve context ─▶ LLM ─▶ parse ─▶ store
//! ```
//!
//! Questions and graded answers live in the `questions` and `answers`
//! tables and are removed with their project. Every call that reaches the
//! language model is bounded by `questions.timeout_secs`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use stratus_core::embedding::EmbeddingProvider;
use stratus_core::llm::{CompletionOptions, LanguageModel};
use stratus_core::models::Project;
use stratus_core::questions::{self, Answer, Evaluation, GeneratedQuestion, Question, QuestionLevel};
use stratus_core::store::VectorStore;
use stratus_core::synth::{estimate_tokens, pack_context};
use stratus_core::{StratusError, StratusResult};

use crate::projects::{from_ms, now_ms};

/// Retrieval text used when generating questions without a topic.
const GENERATION_TOPIC: &str = "main features, functionality and behavior of the system";

fn question_from_row(row: &SqliteRow) -> Result<Question> {
    let level: i64 = row.get("level");
    Ok(Question {
        id: row.get("id"),
        project_id: row.get("project_id"),
        question: row.get("question"),
        level: QuestionLevel::from_int(level)
            .with_context(|| format!("stored question level {level} is invalid"))?,
        created_at: from_ms(row.get("created_at")),
        updated_at: from_ms(row.get("updated_at")),
    })
}

fn answer_from_row(row: &SqliteRow) -> Answer {
    Answer {
        id: row.get("id"),
        question_id: row.get("question_id"),
        project_id: row.get("project_id"),
        answer: row.get("answer"),
        score: row.get("score"),
        reasoning: row.get("reasoning"),
        ideal_answer: row.get("ideal_answer"),
        created_at: from_ms(row.get("created_at")),
        updated_at: from_ms(row.get("updated_at")),
    }
}

/// A question with its graded answer, if any.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionEntry {
    pub question: Question,
    pub answer: Option<Answer>,
}

pub struct SqliteQuestionStore {
    pool: SqlitePool,
}

impl SqliteQuestionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store generated questions in one transaction, keeping their order.
    pub async fn insert_questions(
        &self,
        project_id: &str,
        generated: &[GeneratedQuestion],
    ) -> Result<Vec<Question>> {
        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(generated.len());
        for q in generated {
            let now = now_ms();
            let question = Question {
                id: uuid::Uuid::new_v4().to_string(),
                project_id: project_id.to_string(),
                question: q.question.clone(),
                level: q.level,
                created_at: from_ms(now),
                updated_at: from_ms(now),
            };
            sqlx::query(
                "INSERT INTO questions (id, project_id, question, level, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&question.id)
            .bind(project_id)
            .bind(&question.question)
            .bind(i64::from(question.level.as_int()))
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("storing a question for project {project_id}"))?;
            stored.push(question);
        }
        tx.commit().await?;
        Ok(stored)
    }

    pub async fn get_question(&self, id: &str) -> Result<Option<Question>> {
        let row = sqlx::query("SELECT * FROM questions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(question_from_row).transpose()
    }

    /// Questions without an answer, newest first.
    pub async fn unanswered(&self, project_id: &str, limit: usize) -> Result<Vec<Question>> {
        let rows = sqlx::query(
            "SELECT q.* FROM questions q WHERE q.project_id = ? \
             AND NOT EXISTS (SELECT 1 FROM answers a WHERE a.question_id = q.id) \
             ORDER BY q.created_at DESC, q.rowid DESC LIMIT ?",
        )
        .bind(project_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(question_from_row).collect()
    }

    /// Every question of a project with its answer, newest first.
    pub async fn list(&self, project_id: &str) -> Result<Vec<QuestionEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM questions WHERE project_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        let mut answers: HashMap<String, Answer> =
            sqlx::query("SELECT * FROM answers WHERE project_id = ?")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(answer_from_row)
                .map(|a| (a.question_id.clone(), a))
                .collect();

        rows.iter()
            .map(|row| {
                let question = question_from_row(row)?;
                let answer = answers.remove(&question.id);
                Ok(QuestionEntry { question, answer })
            })
            .collect()
    }

    /// Record the graded answer of a question, replacing a previous one.
    pub async fn upsert_answer(
        &self,
        question: &Question,
        answer: &str,
        evaluation: &Evaluation,
    ) -> Result<Answer> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO answers (id, question_id, project_id, answer, score, reasoning,
                                 ideal_answer, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(question_id) DO UPDATE SET
                answer = excluded.answer,
                score = excluded.score,
                reasoning = excluded.reasoning,
                ideal_answer = excluded.ideal_answer,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&question.id)
        .bind(&question.project_id)
        .bind(answer)
        .bind(evaluation.score)
        .bind(&evaluation.reasoning)
        .bind(&evaluation.ideal_answer)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("storing the answer to question {}", question.id))?;

        let row = sqlx::query("SELECT * FROM answers WHERE question_id = ?")
            .bind(&question.id)
            .fetch_one(&self.pool)
            .await?;
        Ok(answer_from_row(&row))
    }
}

/// Tunables for [`QuestionService`].
#[derive(Debug, Clone)]
pub struct QuestionSettings {
    pub count: usize,
    pub unanswered_limit: usize,
    pub top_k: usize,
    pub timeout: Duration,
    pub completion: CompletionOptions,
}

pub struct QuestionService {
    store: SqliteQuestionStore,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Option<Arc<dyn LanguageModel>>,
    settings: QuestionSettings,
}

impl QuestionService {
    pub fn new(
        store: SqliteQuestionStore,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Option<Arc<dyn LanguageModel>>,
        settings: QuestionSettings,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            llm,
            settings,
        }
    }

    /// Questions to practice with.
    ///
    /// Unanswered questions are returned as they are unless `fresh` is
    /// set; otherwise a new set is written from the project's content.
    pub async fn generate(
        &self,
        project: &Project,
        level: Option<QuestionLevel>,
        fresh: bool,
    ) -> StratusResult<Vec<Question>> {
        if !fresh {
            let pending = self
                .store
                .unanswered(&project.id, self.settings.unanswered_limit)
                .await?;
            if !pending.is_empty() {
                debug!(
                    project = %project.name,
                    count = pending.len(),
                    "returning unanswered questions"
                );
                return Ok(pending);
            }
        }

        let generated = self
            .bounded(async {
                let llm = self.llm()?;
                let count = self.settings.count;
                let template = questions::generation_prompt("", count, level);
                let context = self
                    .context(llm.as_ref(), project, GENERATION_TOPIC, &template)
                    .await?;
                let raw = self
                    .complete(llm.as_ref(), &questions::generation_prompt(&context, count, level))
                    .await?;
                questions::parse_questions(&raw).map_err(|message| StratusError::Provider {
                    provider: llm.model_name().to_string(),
                    message,
                })
            })
            .await?;

        let stored = self.store.insert_questions(&project.id, &generated).await?;
        info!(project = %project.name, count = stored.len(), "questions generated");
        Ok(stored)
    }

    /// Grade `answer` against the project's content and record it.
    pub async fn evaluate(
        &self,
        project: &Project,
        question_id: &str,
        answer: &str,
    ) -> StratusResult<Answer> {
        let answer = questions::validate_text("answer", answer)?;
        let question = self.question(project, question_id).await?;

        let evaluation = self
            .bounded(async {
                let llm = self.llm()?;
                let template = questions::evaluation_prompt("", &question.question, &answer);
                let context = self
                    .context(llm.as_ref(), project, &question.question, &template)
                    .await?;
                let prompt = questions::evaluation_prompt(&context, &question.question, &answer);
                let raw = self.complete(llm.as_ref(), &prompt).await?;
                questions::parse_evaluation(&raw).map_err(|message| StratusError::Provider {
                    provider: llm.model_name().to_string(),
                    message,
                })
            })
            .await?;

        let stored = self.store.upsert_answer(&question, &answer, &evaluation).await?;
        info!(
            project = %project.name,
            question = %question.id,
            score = stored.score,
            "answer evaluated"
        );
        Ok(stored)
    }

    /// Store a simpler wording of a question as a new question of the
    /// same level.
    pub async fn rephrase(&self, project: &Project, question_id: &str) -> StratusResult<Question> {
        let question = self.question(project, question_id).await?;

        let text = self
            .bounded(async {
                let llm = self.llm()?;
                let raw = self
                    .complete(llm.as_ref(), &questions::rephrase_prompt(&question.question))
                    .await?;
                questions::validate_text("rephrased question", &raw).map_err(|e| {
                    StratusError::Provider {
                        provider: llm.model_name().to_string(),
                        message: e.to_string(),
                    }
                })
            })
            .await?;

        let generated = [GeneratedQuestion {
            question: text,
            level: question.level,
        }];
        let mut stored = self.store.insert_questions(&project.id, &generated).await?;
        let rephrased = stored.pop().ok_or_else(|| {
            StratusError::Storage(anyhow::anyhow!("rephrased question was not stored"))
        })?;
        debug!(from = %question.id, to = %rephrased.id, "question rephrased");
        Ok(rephrased)
    }

    pub async fn list(&self, project: &Project) -> StratusResult<Vec<QuestionEntry>> {
        Ok(self.store.list(&project.id).await?)
    }

    async fn question(&self, project: &Project, question_id: &str) -> StratusResult<Question> {
        match self.store.get_question(question_id).await? {
            Some(q) if q.project_id == project.id => Ok(q),
            _ => Err(StratusError::NotFound {
                kind: "question",
                id: question_id.to_string(),
            }),
        }
    }

    fn llm(&self) -> StratusResult<&Arc<dyn LanguageModel>> {
        self.llm.as_ref().ok_or_else(|| StratusError::Provider {
            provider: "llm".to_string(),
            message: "no language model configured; set [llm] provider".to_string(),
        })
    }

    async fn bounded<T>(&self, work: impl Future<Output = StratusResult<T>>) -> StratusResult<T> {
        let deadline = self.settings.timeout;
        tokio::time::timeout(deadline, work)
            .await
            .map_err(|_| StratusError::Timeout(deadline))?
    }

    async fn complete(&self, llm: &dyn LanguageModel, prompt: &str) -> StratusResult<String> {
        llm.complete(prompt, &self.settings.completion)
            .await
            .map_err(|e| StratusError::provider(llm.model_name(), &e))
    }

    /// The most relevant indexed content for `topic`, packed to fit next
    /// to `template` in the model's context window.
    async fn context(
        &self,
        llm: &dyn LanguageModel,
        project: &Project,
        topic: &str,
        template: &str,
    ) -> StratusResult<String> {
        let collection = project.collection_name();
        if self.vectors.count(collection).await? == 0 {
            return Err(StratusError::Invalid(format!(
                "project `{}` has no indexed content; run `stratus index {}` first",
                project.name, project.name
            )));
        }
        let vector = self
            .embedder
            .embed(topic)
            .await
            .map_err(|e| StratusError::provider(self.embedder.model_name(), &e))?;
        let nodes = self
            .vectors
            .query(collection, &vector, self.settings.top_k)
            .await?;

        let budget = llm
            .context_window()
            .saturating_sub(estimate_tokens(template) + self.settings.completion.max_tokens)
            .max(64);
        let texts: Vec<String> = nodes.into_iter().map(|n| n.payload).collect();
        Ok(pack_context(&texts, budget).into_iter().next().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::projects::SqliteProjectRepository;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use stratus_core::models::VectorRecord;
    use stratus_core::store::memory::InMemoryVectorStore;
    use tempfile::TempDir;

    struct Flat;

    #[async_trait]
    impl EmbeddingProvider for Flat {
        fn model_name(&self) -> &str {
            "flat"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    /// Replies from a script and records every prompt.
    struct Scripted {
        replies: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Arc<Self> {
            Self::slow(replies, Duration::ZERO)
        }

        fn slow(replies: &[&str], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn context_window(&self) -> usize {
            4096
        }
        async fn complete(&self, prompt: &str, _opts: &CompletionOptions) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            tokio::time::sleep(self.delay).await;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    const TWO_QUESTIONS: &str = r#"{"questions": [
        {"question": "How are unchanged documents skipped during indexing?", "level": 2},
        {"question": "What does a project map to in the vector store?", "level": 1}
    ]}"#;

    struct Fixture {
        _tmp: TempDir,
        project: Project,
        vectors: Arc<InMemoryVectorStore>,
        pool: SqlitePool,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let toml = format!("[db]\npath = \"{}\"\n", tmp.path().join("db.sqlite").display());
        let config = parse_config(&toml).unwrap();
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let project = SqliteProjectRepository::new(pool.clone())
            .create_project("demo", tmp.path())
            .await
            .unwrap();

        let vectors = Arc::new(InMemoryVectorStore::new());
        vectors.get_or_create("demo").await.unwrap();
        vectors
            .upsert(
                "demo",
                &VectorRecord {
                    identity: "a".to_string(),
                    source_path: "a.md".to_string(),
                    content_hash: "c".to_string(),
                    document_hash: "d".to_string(),
                    fragment_count: 1,
                    embedding: vec![1.0, 0.0],
                    payload: "Indexing skips documents whose hash is unchanged.".to_string(),
                    metadata: serde_json::json!({ "path": "a.md" }),
                },
            )
            .await
            .unwrap();

        Fixture {
            _tmp: tmp,
            project,
            vectors,
            pool,
        }
    }

    fn service(f: &Fixture, llm: Option<Arc<Scripted>>) -> QuestionService {
        QuestionService::new(
            SqliteQuestionStore::new(f.pool.clone()),
            f.vectors.clone(),
            Arc::new(Flat),
            llm.map(|l| l as Arc<dyn LanguageModel>),
            QuestionSettings {
                count: 2,
                unanswered_limit: 10,
                top_k: 4,
                timeout: Duration::from_secs(5),
                completion: CompletionOptions::default(),
            },
        )
    }

    #[tokio::test]
    async fn test_generate_returns_unanswered_before_writing_more() {
        let f = fixture().await;
        let llm = Scripted::new(&[TWO_QUESTIONS, TWO_QUESTIONS]);
        let svc = service(&f, Some(llm.clone()));

        let first = svc.generate(&f.project, None, false).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(llm.prompts.lock().unwrap()[0].contains("Indexing skips documents"));

        let again = svc.generate(&f.project, None, false).await.unwrap();
        assert_eq!(llm.calls(), 1);
        let mut ids: Vec<_> = again.iter().map(|q| q.id.clone()).collect();
        let mut expected: Vec<_> = first.iter().map(|q| q.id.clone()).collect();
        ids.sort();
        expected.sort();
        assert_eq!(ids, expected);

        let fresh = svc.generate(&f.project, None, true).await.unwrap();
        assert_eq!(llm.calls(), 2);
        assert_eq!(fresh.len(), 2);
        assert_eq!(svc.list(&f.project).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_generate_requires_indexed_content() {
        let f = fixture().await;
        f.vectors.drop_collection("demo").await.unwrap();
        let llm = Scripted::new(&[TWO_QUESTIONS]);
        let err = service(&f, Some(llm.clone()))
            .generate(&f.project, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::Invalid(_)), "{err}");
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_generation_stores_nothing() {
        let f = fixture().await;
        let svc = service(&f, Some(Scripted::new(&["I cannot help with that."])));
        let err = svc.generate(&f.project, None, false).await.unwrap_err();
        assert!(matches!(err, StratusError::Provider { .. }));
        assert!(svc.list(&f.project).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evaluate_replaces_previous_grade() {
        let f = fixture().await;
        let llm = Scripted::new(&[
            TWO_QUESTIONS,
            r#"{"score": 2, "reasoning": "partial", "ideal_answer": "By document hash."}"#,
            r#"{"score": 4.5, "reasoning": "good", "ideal_answer": "By document hash."}"#,
        ]);
        let svc = service(&f, Some(llm));
        let questions = svc.generate(&f.project, None, false).await.unwrap();
        let target = &questions[0];

        let first = svc.evaluate(&f.project, &target.id, "somehow").await.unwrap();
        let second = svc
            .evaluate(&f.project, &target.id, "it compares hashes")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.score, 4.5);
        assert_eq!(second.answer, "it compares hashes");

        let pending = svc.store.unanswered(&f.project.id, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, target.id);

        let listed = svc.list(&f.project).await.unwrap();
        let graded: Vec<_> = listed.iter().filter(|e| e.answer.is_some()).collect();
        assert_eq!(graded.len(), 1);
        assert_eq!(graded[0].question.id, target.id);
    }

    #[tokio::test]
    async fn test_evaluate_checks_input_and_ownership() {
        let f = fixture().await;
        let llm = Scripted::new(&[TWO_QUESTIONS]);
        let svc = service(&f, Some(llm.clone()));
        let questions = svc.generate(&f.project, None, false).await.unwrap();

        let err = svc.evaluate(&f.project, &questions[0].id, "  ").await.unwrap_err();
        assert!(matches!(err, StratusError::Invalid(_)));

        let other_dir = TempDir::new().unwrap();
        let other = SqliteProjectRepository::new(f.pool.clone())
            .create_project("other", other_dir.path())
            .await
            .unwrap();
        let err = svc
            .evaluate(&other, &questions[0].id, "an answer")
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::NotFound { kind: "question", .. }));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_rephrase_keeps_level() {
        let f = fixture().await;
        let llm = Scripted::new(&[TWO_QUESTIONS, "  How does indexing avoid repeat work?  "]);
        let svc = service(&f, Some(llm.clone()));
        let questions = svc.generate(&f.project, None, false).await.unwrap();

        let rephrased = svc.rephrase(&f.project, &questions[0].id).await.unwrap();
        assert_eq!(rephrased.question, "How does indexing avoid repeat work?");
        assert_eq!(rephrased.level, questions[0].level);
        assert_ne!(rephrased.id, questions[0].id);
        assert!(llm.prompts.lock().unwrap()[1].contains(&questions[0].question));
    }

    #[tokio::test]
    async fn test_missing_llm_is_provider_error() {
        let f = fixture().await;
        let err = service(&f, None)
            .generate(&f.project, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::Provider { .. }));
    }

    #[tokio::test]
    async fn test_slow_model_times_out() {
        let f = fixture().await;
        let llm = Scripted::slow(&[TWO_QUESTIONS], Duration::from_secs(10));
        let mut svc = service(&f, Some(llm));
        svc.settings.timeout = Duration::from_millis(50);
        let err = svc.generate(&f.project, None, false).await.unwrap_err();
        assert!(matches!(err, StratusError::Timeout(_)));
        assert!(svc.list(&f.project).await.unwrap().is_empty());
    }
}
