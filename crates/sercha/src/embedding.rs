//! HTTP embedding providers.
//!
//! - [`OpenAiEmbedder`]: `POST {url}/embeddings`, key from `OPENAI_API_KEY`.
//! - [`OllamaEmbedder`]: `POST {url}/api/embed` against a local Ollama.
//!
//! Both retry transient failures with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other 4xx → fail immediately
//! - network errors → retry
//! - delays of 1s, 2s, 4s ... capped at 32s
//!
//! Provider failures surface to the core as
//! [`Error::EmbeddingUnavailable`] after being logged.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use sercha_core::embedding::EmbeddingProvider;
use sercha_core::{Error, Result};

use crate::config::EmbeddingConfig;

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
pub const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Delay before retry `attempt` (1-based).
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}

/// POST `body` as JSON, retrying on 429, 5xx and network errors.
pub(crate) async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> anyhow::Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::debug!(%status, attempt, "{label} request failed, retrying");
                    last_err = Some(anyhow!("{label} API error {status}: {body_text}"));
                    continue;
                }
                bail!("{label} API error {status}: {body_text}");
            }
            Err(e) => {
                last_err = Some(anyhow!("{label} connection error ({url}): {e}"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{label} request failed after retries")))
}

fn parse_vector(value: &serde_json::Value) -> anyhow::Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow!("embedding is not an array"))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

fn check_dims(vector: Vec<f32>, dims: usize) -> anyhow::Result<Vec<f32>> {
    if vector.len() != dims {
        bail!("expected {dims}-dimensional embedding, got {}", vector.len());
    }
    Ok(vector)
}

fn unavailable(provider: &str, err: anyhow::Error) -> Error {
    tracing::warn!(provider, error = %err, "embedding request failed");
    Error::EmbeddingUnavailable
}

fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var(OPENAI_API_KEY_ENV)
            .map_err(|_| anyhow!("{OPENAI_API_KEY_ENV} environment variable not set"))?;
        let base = config.url.as_deref().unwrap_or(OPENAI_DEFAULT_URL);

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/embeddings", base.trim_end_matches('/')),
            api_key,
            model,
            dims,
            max_retries: config.max_retries,
        })
    }

    async fn request(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let body = serde_json::json!({ "model": self.model, "input": [text] });
        let json = post_json_with_retry(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        let first = json
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|d| d.first())
            .and_then(|item| item.get("embedding"))
            .ok_or_else(|| anyhow!("invalid OpenAI response: missing data[0].embedding"))?;
        check_dims(parse_vector(first)?, self.dims)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(text)
            .await
            .map_err(|e| unavailable("openai", e))
    }
}

pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama provider"))?;
        let base = config.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            model,
            dims,
            max_retries: config.max_retries,
        })
    }

    async fn request(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let body = serde_json::json!({ "model": self.model, "input": [text] });
        let json = post_json_with_retry(
            &self.client,
            &self.url,
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        let first = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .and_then(|e| e.first())
            .ok_or_else(|| anyhow!("invalid Ollama response: missing embeddings array"))?;
        check_dims(parse_vector(first)?, self.dims)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(text)
            .await
            .map_err(|e| unavailable("ollama", e))
    }
}

/// Build the configured embedder, or `None` when embeddings are disabled.
pub fn create_embedder(
    config: &EmbeddingConfig,
) -> anyhow::Result<Option<Arc<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiEmbedder::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaEmbedder::new(config)?))),
        other => bail!("unknown embedding provider: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(6), Duration::from_secs(32));
        assert_eq!(backoff_delay(12), Duration::from_secs(32));
    }

    #[test]
    fn test_disabled_provider_is_none() {
        assert!(create_embedder(&EmbeddingConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_ollama_requires_model_and_dims() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());

        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(768),
            ..EmbeddingConfig::default()
        };
        let embedder = create_embedder(&config).unwrap().unwrap();
        assert_eq!(embedder.model_name(), "nomic-embed-text");
        assert_eq!(embedder.dims(), 768);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        assert!(check_dims(vec![1.0, 2.0], 3).is_err());
        assert_eq!(check_dims(vec![1.0], 1).unwrap(), vec![1.0]);
    }

    #[tokio::test]
    async fn test_unreachable_ollama_maps_to_unavailable() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("m".into()),
            dims: Some(2),
            url: Some("http://127.0.0.1:9".into()),
            timeout_secs: 1,
            max_retries: 0,
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();
        assert!(matches!(
            embedder.embed("hello").await.unwrap_err(),
            Error::EmbeddingUnavailable
        ));
    }
}
