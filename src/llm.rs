//! Language-model provider implementations.
//!
//! - **[`OpenAIChat`]**: `POST {url}/v1/chat/completions`, a single user message.
//! - **[`OllamaGenerate`]**: `POST {url}/api/generate` with `stream: false`.
//!
//! Both share the retry and backoff behaviour of [`crate::http::post_json`].

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

pub use stratus_core::llm::{CompletionOptions, LanguageModel};

use crate::config::{LlmConfig, LlmProviderKind};
use crate::http;

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

pub struct OpenAIChat {
    model: String,
    endpoint: String,
    api_key: String,
    context_window: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;
        let base = config.url.as_deref().unwrap_or(OPENAI_URL).trim_end_matches('/');
        Ok(Self {
            model,
            endpoint: format!("{base}/v1/chat/completions"),
            api_key,
            context_window: config.context_window,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature,
        });
        let json = http::post_json(
            &self.client,
            "OpenAI",
            &self.endpoint,
            Some(&self.api_key),
            &body,
            self.max_retries,
        )
        .await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

pub struct OllamaGenerate {
    model: String,
    url: String,
    context_window: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaGenerate {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required for Ollama provider"))?;
        let url = config
            .url
            .as_deref()
            .unwrap_or(OLLAMA_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            model,
            url,
            context_window: config.context_window,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaGenerate {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "num_predict": opts.max_tokens,
                "temperature": opts.temperature,
                "num_ctx": self.context_window,
            },
        });
        let json = http::post_json(
            &self.client,
            "Ollama",
            &format!("{}/api/generate", self.url),
            None,
            &body,
            self.max_retries,
        )
        .await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing response field"))
    }
}

/// Build the configured language model, or `None` when disabled.
pub fn create_llm(config: &LlmConfig) -> Result<Option<Arc<dyn LanguageModel>>> {
    Ok(match config.provider {
        LlmProviderKind::Disabled => None,
        LlmProviderKind::Openai => Some(Arc::new(OpenAIChat::new(config)?)),
        LlmProviderKind::Ollama => Some(Arc::new(OllamaGenerate::new(config)?)),
    })
}

/// Generation options derived from `[llm]`.
pub fn completion_options(config: &LlmConfig) -> CompletionOptions {
    CompletionOptions {
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    }
}
