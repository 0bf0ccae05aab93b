//! Reranker selection.
//!
//! `lexical` uses the core term-overlap scorer. `local` runs a fastembed
//! cross-encoder (feature `local-models`). `none` disables reranking: the
//! workflow keeps retrieval order and truncates to `top_n`.

use std::sync::Arc;

use anyhow::Result;

pub use stratus_core::rerank::{LexicalReranker, Reranker};

use crate::config::{RerankConfig, RerankProviderKind};

#[cfg(feature = "local-models")]
mod local {
    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, bail, Result};
    use async_trait::async_trait;

    use super::Reranker;

    /// Cross-encoder reranker run in-process.
    pub struct CrossEncoderReranker {
        name: String,
        model: Arc<Mutex<fastembed::TextRerank>>,
    }

    impl CrossEncoderReranker {
        pub fn new(model: Option<&str>) -> Result<Self> {
            let name = model.unwrap_or("bge-reranker-base").to_string();
            let model_id = match name.as_str() {
                "bge-reranker-base" => fastembed::RerankerModel::BGERerankerBase,
                "jina-reranker-v1-turbo-en" => fastembed::RerankerModel::JINARerankerV1TurboEn,
                "jina-reranker-v2-base-multilingual" => {
                    fastembed::RerankerModel::JINARerankerV2BaseMultiligual
                }
                other => bail!(
                    "Unknown reranker model: '{}'. Supported models: bge-reranker-base, \
                     jina-reranker-v1-turbo-en, jina-reranker-v2-base-multilingual",
                    other
                ),
            };
            let model = fastembed::TextRerank::try_new(
                fastembed::RerankInitOptions::new(model_id).with_show_download_progress(true),
            )
            .map_err(|e| anyhow!("Failed to initialize reranker: {}", e))?;
            Ok(Self {
                name,
                model: Arc::new(Mutex::new(model)),
            })
        }
    }

    #[async_trait]
    impl Reranker for CrossEncoderReranker {
        fn name(&self) -> &str {
            &self.name
        }

        async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>> {
            let model = Arc::clone(&self.model);
            let query = query.to_string();
            let passages: Vec<String> = passages.iter().map(|p| p.to_string()).collect();
            let count = passages.len();
            tokio::task::spawn_blocking(move || {
                let mut model = model
                    .lock()
                    .map_err(|_| anyhow!("reranker lock poisoned"))?;
                let docs: Vec<&str> = passages.iter().map(String::as_str).collect();
                let results = model
                    .rerank(query.as_str(), docs, false, None)
                    .map_err(|e| anyhow!("Reranking failed: {}", e))?;
                let mut scores = vec![f32::MIN; count];
                for r in results {
                    if let Some(slot) = scores.get_mut(r.index) {
                        *slot = r.score;
                    }
                }
                Ok(scores)
            })
            .await?
        }
    }
}

#[cfg(feature = "local-models")]
pub use local::CrossEncoderReranker;

/// Build the configured reranker, or `None` when reranking is off.
pub fn create_reranker(config: &RerankConfig) -> Result<Option<Arc<dyn Reranker>>> {
    Ok(match config.provider {
        RerankProviderKind::None => None,
        RerankProviderKind::Lexical => Some(Arc::new(LexicalReranker)),
        #[cfg(feature = "local-models")]
        RerankProviderKind::Local => Some(Arc::new(CrossEncoderReranker::new(
            config.model.as_deref(),
        )?)),
        #[cfg(not(feature = "local-models"))]
        RerankProviderKind::Local => {
            anyhow::bail!("Local reranker requires building with --features local-models")
        }
    })
}
