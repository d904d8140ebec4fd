use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{http::RetryPolicy, traits::Embedder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEmbedderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimension: Option<usize>,
    pub batch_size: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RemoteEmbedderConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("RAGBENCH_EMBEDDING_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: std::env::var("RAGBENCH_EMBEDDING_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            model: std::env::var("RAGBENCH_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            dimension: None,
            batch_size: 64,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    config: RemoteEmbedderConfig,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(config: RemoteEmbedderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| anyhow!("failed to build embedding http client: {err}"))?;
        Ok(Self { client, config })
    }

    async fn embed_slice(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let body = EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        };
        let response: EmbeddingResponse =
            crate::http::send_json(&self.config.retry, "embeddings", || {
                let request = self.client.post(&url).json(&body);
                match self.config.api_key.as_deref() {
                    Some(key) => request.bearer_auth(key),
                    None => request,
                }
            })
            .await?;
        order_embeddings(response, texts.len())
    }
}

/// Places each returned vector at its declared index. Missing or duplicate
/// indices are errors.
fn order_embeddings(response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
    if response.data.len() != expected {
        return Err(anyhow!(
            "embedding endpoint returned {} vectors for {expected} inputs",
            response.data.len()
        ));
    }
    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for datum in response.data {
        let slot = slots
            .get_mut(datum.index)
            .ok_or_else(|| anyhow!("embedding index {} out of range", datum.index))?;
        if slot.replace(datum.embedding).is_some() {
            return Err(anyhow!("embedding index {} returned twice", datum.index));
        }
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| slot.ok_or_else(|| anyhow!("embedding index {idx} missing")))
        .collect()
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn name(&self) -> &str {
        &self.config.model
    }

    fn dimension(&self) -> Option<usize> {
        self.config.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for slice in texts.chunks(self.config.batch_size.max(1)) {
            debug!(model = %self.config.model, batch = slice.len(), "requesting embeddings");
            out.extend(self.embed_slice(slice).await?);
        }
        Ok(out)
    }
}
