//! HTTP embedding providers: OpenAI `/v1/embeddings` and Ollama `/api/embed`.
//!
//! One request per batch. Retries live in the caller's
//! [`RetryPolicy`](super::RetryPolicy); this module only classifies
//! failures:
//!
//! - HTTP 429 and 5xx → [`EmbeddingError::Transient`]
//! - other non-success statuses → [`EmbeddingError::Rejected`]
//! - network errors and timeouts → [`EmbeddingError::Transient`]

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use bridge_memory_core::embedding::{provider_key, EmbeddingProvider};
use bridge_memory_core::error::EmbeddingError;

use crate::config::{ProviderKind, ProviderSettings};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Wire flavor of a [`RemoteProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFlavor {
    OpenAi,
    Ollama,
}

impl RemoteFlavor {
    fn id(&self) -> &'static str {
        match self {
            RemoteFlavor::OpenAi => "openai",
            RemoteFlavor::Ollama => "ollama",
        }
    }
}

pub struct RemoteProvider {
    flavor: RemoteFlavor,
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: Option<usize>,
    api_key: Option<String>,
}

impl RemoteProvider {
    /// Build a provider for `kind` from resolved settings.
    ///
    /// # Errors
    ///
    /// Fails when `kind` is not a remote provider, when no model is known,
    /// or when `OPENAI_API_KEY` is not set for the OpenAI flavor.
    pub fn new(kind: ProviderKind, settings: &ProviderSettings) -> Result<Self> {
        let flavor = match kind {
            ProviderKind::OpenAi => RemoteFlavor::OpenAi,
            ProviderKind::Ollama => RemoteFlavor::Ollama,
            other => bail!("{} is not a remote embedding provider", other.as_str()),
        };

        let model = settings
            .model_for(kind)
            .ok_or_else(|| anyhow::anyhow!("memory.model required for {} provider", flavor.id()))?;

        // Only the primary provider uses the configured URL.
        let configured_url = if kind == settings.kind {
            settings.url.clone()
        } else {
            None
        };
        let base_url = configured_url
            .unwrap_or_else(|| match flavor {
                RemoteFlavor::OpenAi => OPENAI_BASE_URL.to_string(),
                RemoteFlavor::Ollama => OLLAMA_BASE_URL.to_string(),
            })
            .trim_end_matches('/')
            .to_string();

        let api_key = match flavor {
            RemoteFlavor::OpenAi => Some(
                std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?,
            ),
            RemoteFlavor::Ollama => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            flavor,
            client,
            base_url,
            model,
            dims: settings.dims,
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    fn endpoint(&self) -> String {
        match self.flavor {
            RemoteFlavor::OpenAi => format!("{}/v1/embeddings", self.base_url),
            RemoteFlavor::Ollama => format!("{}/api/embed", self.base_url),
        }
    }
}

/// Map an HTTP failure status to an error kind.
pub(crate) fn classify_status(
    who: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> EmbeddingError {
    let message = format!("{} API error {}: {}", who, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        EmbeddingError::Transient(message)
    } else {
        EmbeddingError::Rejected(message)
    }
}

pub(crate) fn transport_error(who: &str, e: reqwest::Error) -> EmbeddingError {
    EmbeddingError::Transient(format!("{} request failed: {}", who, e))
}

#[async_trait]
impl EmbeddingProvider for RemoteProvider {
    fn id(&self) -> &str {
        self.flavor.id()
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> Option<usize> {
        self.dims
    }

    fn provider_key(&self) -> String {
        provider_key(self.id(), &self.model, Some(&self.base_url))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut request = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let who = self.flavor.id();
        let response = request.send().await.map_err(|e| transport_error(who, e))?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status(who, status, &body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error(who, e))?;
        let parsed = match self.flavor {
            RemoteFlavor::OpenAi => parse_openai_response(&json),
            RemoteFlavor::Ollama => parse_ollama_response(&json),
        };
        parsed.map_err(EmbeddingError::Rejected)
    }
}

fn parse_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

/// Parse an OpenAI embeddings body. Items are ordered by their `index`.
pub(crate) fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, String> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| "Invalid OpenAI response: missing data array".to_string())?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(parse_vector)
            .ok_or_else(|| "Invalid OpenAI response: missing embedding".to_string())?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, embedding));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, String> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| "Invalid Ollama response: missing embeddings array".to_string())?;

    embeddings
        .iter()
        .map(|e| parse_vector(e).ok_or_else(|| "Invalid Ollama response: bad embedding".to_string()))
        .collect()
}
