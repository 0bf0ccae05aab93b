//! Ingestion pipeline: reconcile a project's collection with its source
//! tree.
//!
//! ```text
//! scan ─▶ document-level skip ─▶ plan units ─▶ diff ─▶ embed + upsert ─▶ delete
//! ```
//!
//! Only inserted and changed units are embedded. Unchanged units, and every
//! unit of a document whose whole-document hash is unchanged and whose
//! stored records are complete, cost nothing.
//! Stale identities are deleted last, so a failed or cancelled run never
//! removes records that were not replaced.
//!
//! Embedding a batch is retried once; a second failure aborts the run with
//! [`StratusError::Provider`]. Cancellation is checked between steps;
//! upserts already committed stay in place.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stratus_core::chunk::document_hash;
use stratus_core::embedding::{check_batch, EmbeddingProvider};
use stratus_core::models::{ContentUnit, IngestReport, VectorRecord};
use stratus_core::reconcile::{self, Fingerprint};
use stratus_core::store::VectorStore;
use stratus_core::{StratusError, StratusResult};

use crate::chunk::ChunkPlanner;
use crate::connector_fs::SourceScan;

pub struct IngestionPipeline {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    planner: Arc<ChunkPlanner>,
    batch_size: usize,
}

fn check_cancelled(cancel: &CancellationToken) -> StratusResult<()> {
    if cancel.is_cancelled() {
        Err(StratusError::Cancelled)
    } else {
        Ok(())
    }
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        planner: Arc<ChunkPlanner>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            planner,
            batch_size: batch_size.max(1),
        }
    }

    /// Reconcile `collection` with the documents of `scan`.
    pub async fn run(
        &self,
        collection: &str,
        scan: SourceScan,
        cancel: &CancellationToken,
    ) -> StratusResult<IngestReport> {
        check_cancelled(cancel)?;
        self.store.get_or_create(collection).await?;
        let existing = self.store.fingerprints(collection).await?;

        let mut by_path: HashMap<&str, Vec<&Fingerprint>> = HashMap::new();
        for fp in existing.values() {
            by_path.entry(fp.source_path.as_str()).or_default().push(fp);
        }

        let mut report = IngestReport {
            documents: scan.documents.len(),
            skipped_files: scan.skipped.len(),
            ..IngestReport::default()
        };
        for (path, reason) in &scan.skipped {
            warn!(collection, path = %path, reason = %reason, "file skipped; existing records kept");
        }
        let mut retained: HashSet<String> = scan.skipped_paths();
        let mut units: Vec<ContentUnit> = Vec::new();

        for doc in &scan.documents {
            check_cancelled(cancel)?;
            let hash = document_hash(doc);
            // A run that failed mid-document leaves fewer records than the
            // document has units; such a document is re-planned.
            if let Some(stored) = by_path.get(doc.relative_path.as_str()) {
                let complete = stored
                    .iter()
                    .all(|fp| fp.document_hash == hash && fp.fragment_count == stored.len());
                if complete {
                    report.unchanged += stored.len();
                    retained.insert(doc.relative_path.clone());
                    continue;
                }
            }
            units.extend(self.planner.plan(doc).await?);
        }

        let plan = reconcile::plan(&existing, units, &retained);
        report.unchanged += plan.unchanged.len();
        debug!(
            collection,
            insert = plan.insert.len(),
            update = plan.update.len(),
            delete = plan.delete.len(),
            "reconciliation planned"
        );

        self.embed_and_store(collection, &plan.insert, cancel).await?;
        report.inserted = plan.insert.len();
        self.embed_and_store(collection, &plan.update, cancel).await?;
        report.updated = plan.update.len();

        for identity in &plan.delete {
            check_cancelled(cancel)?;
            self.store.delete(collection, identity).await?;
        }
        report.deleted = plan.delete.len();

        info!(
            collection,
            documents = report.documents,
            skipped = report.skipped_files,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            "ingestion complete"
        );
        Ok(report)
    }

    async fn embed_and_store(
        &self,
        collection: &str,
        units: &[ContentUnit],
        cancel: &CancellationToken,
    ) -> StratusResult<()> {
        for batch in units.chunks(self.batch_size) {
            check_cancelled(cancel)?;
            let texts: Vec<String> = batch.iter().map(|u| u.text.clone()).collect();
            let vectors = self.embed_with_retry(&texts).await?;
            for (unit, vector) in batch.iter().zip(vectors) {
                self.store
                    .upsert(collection, &VectorRecord::from_unit(unit, vector))
                    .await?;
            }
        }
        Ok(())
    }

    async fn embed_with_retry(&self, texts: &[String]) -> StratusResult<Vec<Vec<f32>>> {
        let attempt = || async {
            let vectors = self.embedder.embed_batch(texts).await?;
            check_batch(self.embedder.as_ref(), texts.len(), &vectors)?;
            Ok::<_, anyhow::Error>(vectors)
        };

        match attempt().await {
            Ok(vectors) => Ok(vectors),
            Err(first) => {
                warn!(
                    model = self.embedder.model_name(),
                    error = %first,
                    "embedding batch failed; retrying once"
                );
                attempt()
                    .await
                    .map_err(|e| StratusError::provider(self.embedder.model_name(), &e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkStrategy, ChunkingConfig};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use stratus_core::models::SourceDocument;
    use stratus_core::store::memory::InMemoryVectorStore;

    /// Fails the first `fail_first` calls, then embeds by text length.
    /// Every call from `fail_from` on fails too, until `healed` is set.
    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
        fail_from: usize,
        healed: AtomicBool,
    }

    impl Flaky {
        fn new(fail_first: usize, fail_from: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
                fail_from,
                healed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("transient failure {n}");
            }
            if n >= self.fail_from && !self.healed.load(Ordering::SeqCst) {
                anyhow::bail!("provider outage at call {n}");
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn pipeline(fail_first: usize) -> (IngestionPipeline, Arc<Flaky>, Arc<InMemoryVectorStore>) {
        let store = Arc::new(InMemoryVectorStore::new());
        let embedder = Arc::new(Flaky::new(fail_first, usize::MAX));
        let planner = ChunkPlanner::new(
            &ChunkingConfig {
                strategy: ChunkStrategy::Whole,
                ..ChunkingConfig::default()
            },
            None,
        )
        .unwrap();
        let p = IngestionPipeline::new(store.clone(), embedder.clone(), Arc::new(planner), 8);
        (p, embedder, store)
    }

    fn paragraph_planner() -> ChunkPlanner {
        ChunkPlanner::new(
            &ChunkingConfig {
                strategy: ChunkStrategy::Paragraph,
                min_lines: 10,
                max_lines: 60,
                target_lines: 40,
            },
            None,
        )
        .unwrap()
    }

    fn scan(docs: &[(&str, &str)]) -> SourceScan {
        SourceScan {
            documents: docs
                .iter()
                .map(|(rel, body)| {
                    SourceDocument::new(PathBuf::from("/p").join(rel), *rel, *body, None)
                })
                .collect(),
            skipped: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_single_retry_recovers() {
        let (p, embedder, store) = pipeline(1);
        let report = p
            .run("c", scan(&[("a.md", "alpha")]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.count("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_provider_error() {
        let (p, _, store) = pipeline(2);
        let err = p
            .run("c", scan(&[("a.md", "alpha")]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StratusError::Provider { .. }));
        assert_eq!(store.count("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_writing() {
        let (p, embedder, _) = pipeline(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = p.run("c", scan(&[("a.md", "alpha")]), &cancel).await.unwrap_err();
        assert!(matches!(err, StratusError::Cancelled));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skipped_files_keep_their_records() {
        let (p, _, store) = pipeline(0);
        p.run(
            "c",
            scan(&[("a.md", "alpha"), ("b.md", "beta")]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut second = scan(&[("a.md", "alpha")]);
        second
            .skipped
            .push(("b.md".to_string(), "not valid UTF-8".to_string()));
        let report = p.run("c", second, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(store.count("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rerun_completes_a_partially_stored_document() {
        let store = Arc::new(InMemoryVectorStore::new());
        // Two single-unit batches succeed, the third fails along with its retry.
        let embedder = Arc::new(Flaky::new(0, 2));
        let planner = Arc::new(paragraph_planner());
        let p = IngestionPipeline::new(store.clone(), embedder.clone(), planner, 1);

        let body: String = (1..=200).map(|i| format!("line {i}\n")).collect();
        let docs = [("big.rs", body.as_str())];
        let err = p.run("c", scan(&docs), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StratusError::Provider { .. }));
        assert_eq!(store.count("c").await.unwrap(), 2);

        embedder.healed.store(true, Ordering::SeqCst);
        let report = p.run("c", scan(&docs), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(report.unchanged, 2);

        let expected: HashSet<String> = paragraph_planner()
            .plan(&scan(&docs).documents[0])
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.identity)
            .collect();
        let stored: HashSet<String> = store.fingerprints("c").await.unwrap().into_keys().collect();
        assert_eq!(expected.len(), 5);
        assert_eq!(stored, expected);
    }

    #[tokio::test]
    async fn test_complete_document_is_skipped_without_planning() {
        let store = Arc::new(InMemoryVectorStore::new());
        let embedder = Arc::new(Flaky::new(0, usize::MAX));
        let planner = Arc::new(paragraph_planner());
        let p = IngestionPipeline::new(store.clone(), embedder.clone(), planner, 4);

        let body: String = (1..=200).map(|i| format!("line {i}\n")).collect();
        let docs = [("big.rs", body.as_str())];
        p.run("c", scan(&docs), &CancellationToken::new()).await.unwrap();
        let calls = embedder.calls.load(Ordering::SeqCst);

        let report = p.run("c", scan(&docs), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.unchanged, 5);
        assert_eq!(report.inserted + report.updated + report.deleted, 0);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), calls);
    }
}
