//! Chunk planner: turns a [`SourceDocument`] into content units.
//!
//! Three strategies, chosen by `chunking.strategy`:
//!
//! - `whole`: one unit per document.
//! - `paragraph`: split candidates at blank-line boundaries, packing
//!   paragraphs up to `target_lines`.
//! - `llm`: ask the language model for line ranges along logical
//!   boundaries (functions, sections, config blocks).
//!
//! The split policy is the same for `paragraph` and `llm`: short
//! documents, documents within `max_lines`, and generated files are kept
//! whole. An LLM decision that cannot be parsed or repaired is a
//! [`StratusError::Planning`] for that document; it is never silently
//! dropped.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::debug;

use stratus_core::chunk::{paragraph_ranges, units_from_ranges, whole_document_unit};
use stratus_core::llm::{CompletionOptions, LanguageModel};
use stratus_core::models::{ContentUnit, SourceDocument};
use stratus_core::planner::{self, Assessment, SplitPolicy};
use stratus_core::synth::estimate_tokens;
use stratus_core::{StratusError, StratusResult};

use crate::config::{ChunkStrategy, ChunkingConfig};

/// Planning calls want a short, deterministic JSON answer.
const DECISION_OPTIONS: CompletionOptions = CompletionOptions {
    max_tokens: 512,
    temperature: 0.0,
};

pub struct ChunkPlanner {
    strategy: ChunkStrategy,
    policy: SplitPolicy,
    target_lines: usize,
    llm: Option<Arc<dyn LanguageModel>>,
}

impl ChunkPlanner {
    pub fn new(config: &ChunkingConfig, llm: Option<Arc<dyn LanguageModel>>) -> Result<Self> {
        if config.strategy == ChunkStrategy::Llm && llm.is_none() {
            bail!("chunking.strategy = \"llm\" requires a configured language model");
        }
        Ok(Self {
            strategy: config.strategy,
            policy: SplitPolicy {
                min_lines: config.min_lines,
                max_lines: config.max_lines,
            },
            target_lines: config.target_lines,
            llm,
        })
    }

    /// Units for one document, in line order. A blank document has none.
    pub async fn plan(&self, doc: &SourceDocument) -> StratusResult<Vec<ContentUnit>> {
        if self.strategy == ChunkStrategy::Whole {
            return Ok(whole(doc));
        }

        let assessment = planner::assess(doc, &self.policy);
        if !assessment.is_candidate() {
            if assessment == Assessment::Generated {
                debug!(path = %doc.relative_path, "generated file kept whole");
            }
            return Ok(whole(doc));
        }

        match (&self.strategy, &self.llm) {
            (ChunkStrategy::Llm, Some(llm)) => self.plan_with_llm(llm.as_ref(), doc).await,
            _ => Ok(self.plan_paragraphs(doc)),
        }
    }

    fn plan_paragraphs(&self, doc: &SourceDocument) -> Vec<ContentUnit> {
        let ranges = paragraph_ranges(&doc.body, self.target_lines);
        if ranges.len() <= 1 {
            return whole(doc);
        }
        units_from_ranges(doc, &ranges)
    }

    async fn plan_with_llm(
        &self,
        llm: &dyn LanguageModel,
        doc: &SourceDocument,
    ) -> StratusResult<Vec<ContentUnit>> {
        let prompt = planner::split_prompt(doc, &self.policy);
        let available = llm
            .context_window()
            .saturating_sub(DECISION_OPTIONS.max_tokens);
        if estimate_tokens(&prompt) > available {
            debug!(
                path = %doc.relative_path,
                "document exceeds the model context; splitting at paragraphs"
            );
            return Ok(self.plan_paragraphs(doc));
        }

        let raw = llm
            .complete(&prompt, &DECISION_OPTIONS)
            .await
            .map_err(|e| StratusError::provider(llm.model_name(), &e))?;

        let planning_error = |message: String| StratusError::Planning {
            path: doc.relative_path.clone(),
            message,
        };

        let decision = planner::parse_decision(&raw).map_err(planning_error)?;
        if !decision.split {
            return Ok(whole(doc));
        }
        let chunks = decision.chunks.unwrap_or_default();
        let ranges = planner::validate_ranges(&chunks, doc.line_count()).map_err(planning_error)?;

        debug!(path = %doc.relative_path, units = ranges.len(), "split planned");
        Ok(units_from_ranges(doc, &ranges))
    }
}

fn whole(doc: &SourceDocument) -> Vec<ContentUnit> {
    whole_document_unit(doc).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct Scripted(&'static str);

    #[async_trait]
    impl LanguageModel for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn context_window(&self) -> usize {
            100_000
        }
        async fn complete(&self, _prompt: &str, _opts: &CompletionOptions) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn config(strategy: ChunkStrategy) -> ChunkingConfig {
        ChunkingConfig {
            strategy,
            ..ChunkingConfig::default()
        }
    }

    fn long_doc(lines: usize) -> SourceDocument {
        let body = (1..=lines)
            .map(|i| {
                if i % 20 == 0 {
                    String::new()
                } else {
                    format!("statement_{i}();")
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        SourceDocument::new(PathBuf::from("/p/src/main.c"), "src/main.c", body, None)
    }

    #[tokio::test]
    async fn test_short_documents_stay_whole() {
        let planner = ChunkPlanner::new(&config(ChunkStrategy::Paragraph), None).unwrap();
        let doc = SourceDocument::new(PathBuf::from("/p/a.md"), "a.md", "one\ntwo", None);
        let units = planner.plan(&doc).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].fragment, 0);
    }

    #[tokio::test]
    async fn test_paragraph_strategy_splits_long_documents() {
        let planner = ChunkPlanner::new(&config(ChunkStrategy::Paragraph), None).unwrap();
        let units = planner.plan(&long_doc(200)).await.unwrap();
        assert!(units.len() > 1);
        for pair in units.windows(2) {
            assert!(pair[0].line_end < pair[1].line_start);
        }
    }

    #[tokio::test]
    async fn test_llm_ranges_become_units() {
        let llm: Arc<dyn LanguageModel> = Arc::new(Scripted(
            "```json\n{\"split\": true, \"chunks\": [{\"start\": 1, \"end\": 40}, {\"start\": 41, \"end\": 80}]}\n```",
        ));
        let planner = ChunkPlanner::new(&config(ChunkStrategy::Llm), Some(llm)).unwrap();
        let units = planner.plan(&long_doc(80)).await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!((units[0].line_start, units[0].line_end), (1, 40));
        assert_eq!((units[1].line_start, units[1].line_end), (41, 80));
    }

    #[tokio::test]
    async fn test_llm_no_split_keeps_whole() {
        let llm: Arc<dyn LanguageModel> = Arc::new(Scripted("{\"split\": false, \"chunks\": null}"));
        let planner = ChunkPlanner::new(&config(ChunkStrategy::Llm), Some(llm)).unwrap();
        assert_eq!(planner.plan(&long_doc(80)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_llm_garbage_is_planning_error() {
        let llm: Arc<dyn LanguageModel> = Arc::new(Scripted("sure, split it wherever"));
        let planner = ChunkPlanner::new(&config(ChunkStrategy::Llm), Some(llm)).unwrap();
        let err = planner.plan(&long_doc(80)).await.unwrap_err();
        assert!(matches!(err, StratusError::Planning { ref path, .. } if path == "src/main.c"));
    }

    #[test]
    fn test_llm_strategy_requires_model() {
        assert!(ChunkPlanner::new(&config(ChunkStrategy::Llm), None).is_err());
    }
}
