//! Configuration parsing and validation.
//!
//! Stratus is configured by a single TOML file (default
//! `config/stratus.toml`). Every section except `[db]` is optional and
//! falls back to the defaults below. The parsed [`Config`] is passed by
//! reference into each component constructor; nothing reads settings from
//! global state.
//!
//! ```toml
//! [db]
//! path = "./data/stratus.sqlite"
//!
//! [chunking]
//! strategy = "paragraph"      # whole | paragraph | llm
//!
//! [embedding]
//! provider = "openai"         # disabled | openai | ollama | local
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "openai"         # disabled | openai | ollama
//! model = "gpt-4o-mini"
//!
//! [retrieval]
//! top_k = 10
//! top_n = 5
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub questions: QuestionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

// ============ Sources ============

/// Exclusion rules applied while walking a project's source tree.
#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    #[serde(default = "default_exclude_extensions")]
    pub exclude_extensions: Vec<String>,
    #[serde(default = "default_true")]
    pub exclude_hidden: bool,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
    /// Regular expressions matched against the `/`-separated relative path.
    #[serde(default)]
    pub exclude_regex: Vec<String>,
    /// Honor the project root's `.gitignore`.
    #[serde(default = "default_true")]
    pub respect_gitignore: bool,
    /// Extra gitignore-style lines applied after `.gitignore`.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub max_file_bytes: Option<u64>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            exclude_extensions: default_exclude_extensions(),
            exclude_hidden: true,
            exclude_globs: default_exclude_globs(),
            exclude_regex: Vec::new(),
            respect_gitignore: true,
            ignore_patterns: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_exclude_extensions() -> Vec<String> {
    [
        "crx", "pem", "zip", "yaml", "png", "jpg", "jpeg", "gif", "pdf", "docx", "pptx", "xlsx",
        "mp4", "avi", "mov", "mp3", "wav", "map", "js", "css", "json", "lock",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclude_globs() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
    ]
}

// ============ Chunking ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// One unit per document.
    Whole,
    /// Local split at blank-line boundaries.
    Paragraph,
    /// Ask the language model where to split.
    Llm,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_min_lines")]
    pub min_lines: usize,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default = "default_target_lines")]
    pub target_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            min_lines: default_min_lines(),
            max_lines: default_max_lines(),
            target_lines: default_target_lines(),
        }
    }
}

fn default_strategy() -> ChunkStrategy {
    ChunkStrategy::Paragraph
}
fn default_min_lines() -> usize {
    10
}
fn default_max_lines() -> usize {
    60
}
fn default_target_lines() -> usize {
    50
}

// ============ Embedding ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Disabled,
    Openai,
    Ollama,
    Local,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: EmbeddingProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama (default `http://localhost:11434`) or an
    /// OpenAI-compatible endpoint (default `https://api.openai.com`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != EmbeddingProviderKind::Disabled
    }
}

fn default_embedding_provider() -> EmbeddingProviderKind {
    EmbeddingProviderKind::Disabled
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

// ============ Language model ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    Disabled,
    Openai,
    Ollama,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: LlmProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            url: None,
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_window: default_context_window(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != LlmProviderKind::Disabled
    }
}

fn default_llm_provider() -> LlmProviderKind {
    LlmProviderKind::Disabled
}
fn default_max_tokens() -> usize {
    1024
}
fn default_temperature() -> f32 {
    0.5
}
fn default_context_window() -> usize {
    4096
}
fn default_llm_timeout_secs() -> u64 {
    120
}

// ============ Rerank ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RerankProviderKind {
    /// Keep retrieval order.
    None,
    /// Term-overlap scorer, no network.
    Lexical,
    /// Cross-encoder via fastembed (feature `local-models`).
    Local,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_rerank_provider")]
    pub provider: RerankProviderKind,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_rerank_provider(),
            model: None,
        }
    }
}

fn default_rerank_provider() -> RerankProviderKind {
    RerankProviderKind::Lexical
}

// ============ Retrieval / query ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            top_n: default_top_n(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_top_n() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
    /// Refuse queries while the project is being indexed.
    #[serde(default = "default_true")]
    pub reject_while_indexing: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_query_timeout_secs(),
            reject_while_indexing: true,
        }
    }
}

fn default_query_timeout_secs() -> u64 {
    60
}

// ============ Questions ============

#[derive(Debug, Deserialize, Clone)]
pub struct QuestionsConfig {
    /// Questions written per generation call.
    #[serde(default = "default_question_count")]
    pub count: usize,
    /// Unanswered questions returned instead of generating new ones.
    #[serde(default = "default_unanswered_limit")]
    pub unanswered_limit: usize,
    /// Context units retrieved for generation and evaluation.
    #[serde(default = "default_question_top_k")]
    pub top_k: usize,
    #[serde(default = "default_question_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for QuestionsConfig {
    fn default() -> Self {
        Self {
            count: default_question_count(),
            unanswered_limit: default_unanswered_limit(),
            top_k: default_question_top_k(),
            timeout_secs: default_question_timeout_secs(),
        }
    }
}

fn default_question_count() -> usize {
    5
}
fn default_unanswered_limit() -> usize {
    10
}
fn default_question_top_k() -> usize {
    8
}
fn default_question_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Parse a configuration from TOML text and validate it.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    // Retrieval
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.top_n < 1 || config.retrieval.top_n > config.retrieval.top_k {
        bail!("retrieval.top_n must be in [1, retrieval.top_k]");
    }

    // Chunking
    if config.chunking.min_lines > config.chunking.max_lines {
        bail!("chunking.min_lines must be <= chunking.max_lines");
    }
    if config.chunking.target_lines == 0 {
        bail!("chunking.target_lines must be > 0");
    }
    if config.chunking.strategy == ChunkStrategy::Llm && !config.llm.is_enabled() {
        bail!("chunking.strategy = \"llm\" requires an [llm] provider");
    }

    // Sources
    for pattern in &config.sources.exclude_regex {
        regex::Regex::new(pattern)
            .with_context(|| format!("sources.exclude_regex: invalid pattern '{}'", pattern))?;
    }

    // Embedding
    let embedding = &config.embedding;
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if embedding.timeout_secs == 0 {
        bail!("embedding.timeout_secs must be > 0");
    }
    if matches!(
        embedding.provider,
        EmbeddingProviderKind::Openai | EmbeddingProviderKind::Ollama
    ) {
        if embedding.dims.is_none() || embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{:?}'",
                embedding.provider
            );
        }
        if embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{:?}'",
                embedding.provider
            );
        }
    }

    // Language model
    let llm = &config.llm;
    if llm.is_enabled() && llm.model.is_none() {
        bail!("llm.model must be specified when provider is '{:?}'", llm.provider);
    }
    if !(0.0..=2.0).contains(&llm.temperature) {
        bail!("llm.temperature must be in [0.0, 2.0]");
    }
    if llm.max_tokens == 0 || llm.max_tokens >= llm.context_window {
        bail!("llm.max_tokens must be > 0 and smaller than llm.context_window");
    }
    if llm.timeout_secs == 0 {
        bail!("llm.timeout_secs must be > 0");
    }

    // Query
    if config.query.timeout_secs == 0 {
        bail!("query.timeout_secs must be > 0");
    }

    // Questions
    let questions = &config.questions;
    if !(1..=20).contains(&questions.count) {
        bail!("questions.count must be in [1, 20]");
    }
    if questions.unanswered_limit == 0 || questions.top_k == 0 || questions.timeout_secs == 0 {
        bail!("questions.unanswered_limit, questions.top_k and questions.timeout_secs must be > 0");
    }

    Ok(())
}
