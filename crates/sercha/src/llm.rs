//! LLM query-expansion providers.
//!
//! The model is asked for a handful of alternative phrasings, one per line.
//! [`parse_variants`] turns the completion into a clean list.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use sercha_core::embedding::LlmProvider;
use sercha_core::{Error, Result};

use crate::config::LlmConfig;
use crate::embedding::{post_json_with_retry, OLLAMA_DEFAULT_URL, OPENAI_API_KEY_ENV, OPENAI_DEFAULT_URL};

const LLM_RETRIES: u32 = 2;
const MAX_VARIANTS: usize = 5;

fn expansion_prompt(query: &str) -> String {
    format!(
        "Rewrite the following search query into up to {MAX_VARIANTS} alternative phrasings \
         that would help find relevant documents. Reply with one phrasing per line and nothing else.\n\n\
         Query: {query}"
    )
}

/// One variant per non-empty line, with list markers stripped and
/// duplicates (ignoring case) removed.
pub fn parse_variants(completion: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    completion
        .lines()
        .map(strip_marker)
        .map(|line| line.trim_matches(|c| c == '"' || c == '\'').trim())
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(line.to_lowercase()))
        .take(MAX_VARIANTS)
        .map(String::from)
        .collect()
}

fn strip_marker(line: &str) -> &str {
    let line = line.trim();
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("• "))
        .unwrap_or(line);
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.trim();
        }
    }
    line.trim()
}

fn unavailable(provider: &str, err: anyhow::Error) -> Error {
    tracing::warn!(provider, error = %err, "query expansion failed");
    Error::LlmUnavailable
}

fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

pub struct OpenAiLlm {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiLlm {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var(OPENAI_API_KEY_ENV)
            .map_err(|_| anyhow!("{OPENAI_API_KEY_ENV} environment variable not set"))?;
        let base = config.url.as_deref().unwrap_or(OPENAI_DEFAULT_URL);
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            model,
        })
    }

    async fn complete(&self, query: &str) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": "You expand search queries." },
                { "role": "user", "content": expansion_prompt(query) },
            ],
        });
        let json = post_json_with_retry(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            LLM_RETRIES,
            "OpenAI",
        )
        .await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(String::from)
            .ok_or_else(|| anyhow!("invalid OpenAI response: missing choices[0].message.content"))
    }
}

#[async_trait]
impl LlmProvider for OpenAiLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn expand(&self, query: &str) -> Result<Vec<String>> {
        let completion = self
            .complete(query)
            .await
            .map_err(|e| unavailable("openai", e))?;
        Ok(parse_variants(&completion))
    }
}

pub struct OllamaLlm {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaLlm {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required for Ollama provider"))?;
        let base = config.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/api/generate", base.trim_end_matches('/')),
            model,
        })
    }

    async fn complete(&self, query: &str) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": expansion_prompt(query),
            "stream": false,
        });
        let json =
            post_json_with_retry(&self.client, &self.url, None, &body, LLM_RETRIES, "Ollama").await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(String::from)
            .ok_or_else(|| anyhow!("invalid Ollama response: missing response"))
    }
}

#[async_trait]
impl LlmProvider for OllamaLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn expand(&self, query: &str) -> Result<Vec<String>> {
        let completion = self
            .complete(query)
            .await
            .map_err(|e| unavailable("ollama", e))?;
        Ok(parse_variants(&completion))
    }
}

/// Build the configured LLM, or `None` when disabled.
pub fn create_llm(config: &LlmConfig) -> anyhow::Result<Option<Arc<dyn LlmProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiLlm::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaLlm::new(config)?))),
        other => bail!("unknown llm provider: {other}"),
    }
}
