use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use embeddings::{RetryPolicy, http::send_json};
use serde::{Deserialize, Serialize};

use crate::rerank::RelevanceModel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohereConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl CohereConfig {
    /// Reads `COHERE_API_KEY`; `None` when it is unset or blank.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("COHERE_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        Some(Self {
            base_url: std::env::var("COHERE_BASE_URL")
                .unwrap_or_else(|_| "https://api.cohere.com".to_string()),
            api_key,
            model: std::env::var("COHERE_RERANK_MODEL")
                .unwrap_or_else(|_| "rerank-english-v3.0".to_string()),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        })
    }
}

/// Hosted cross-encoder behind Cohere's `/v1/rerank` endpoint.
pub struct CohereRelevanceModel {
    client: reqwest::Client,
    config: CohereConfig,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [&'a str],
    top_n: usize,
    return_documents: bool,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankHit>,
}

#[derive(Debug, Deserialize)]
struct RerankHit {
    index: usize,
    relevance_score: f32,
}

impl CohereRelevanceModel {
    pub fn new(config: CohereConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| anyhow!("failed to build rerank http client: {err}"))?;
        Ok(Self { client, config })
    }
}

/// Maps hits back to document order. The endpoint sorts by relevance, so
/// every document index must appear exactly once.
fn scores_in_document_order(response: RerankResponse, documents: usize) -> Result<Vec<f32>> {
    let mut scores = vec![None; documents];
    for hit in response.results {
        let slot = scores
            .get_mut(hit.index)
            .ok_or_else(|| anyhow!("rerank index {} out of range", hit.index))?;
        *slot = Some(hit.relevance_score);
    }
    scores
        .into_iter()
        .enumerate()
        .map(|(idx, score)| score.ok_or_else(|| anyhow!("rerank response missing document {idx}")))
        .collect()
}

#[async_trait]
impl RelevanceModel for CohereRelevanceModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v1/rerank", self.config.base_url.trim_end_matches('/'));
        let body = RerankRequest {
            model: &self.config.model,
            query,
            documents,
            top_n: documents.len(),
            return_documents: false,
        };
        let response: RerankResponse = send_json(&self.config.retry, "cohere rerank", || {
            self.client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
        })
        .await?;
        scores_in_document_order(response, documents.len())
    }
}
