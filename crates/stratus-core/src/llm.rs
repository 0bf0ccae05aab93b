//! Language-model capability used by the chunk planner and the answer
//! synthesizer.

use anyhow::Result;
use async_trait::async_trait;

/// Generation parameters for a single completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.5,
        }
    }
}

/// A text-completion backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier (e.g. `"gpt-4o-mini"`, `"llama3"`).
    fn model_name(&self) -> &str;

    /// Total tokens (prompt plus completion) the model accepts.
    fn context_window(&self) -> usize;

    async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<String>;
}
