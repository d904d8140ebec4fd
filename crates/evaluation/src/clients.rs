use std::{fmt::Write as _, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use embeddings::{RetryPolicy, http::send_json};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    pipeline::{EnhancedQuery, GenerationRequest, QueryEnhancer, ResponseGenerator},
    reply::parse_json_reply,
    scorers::{Judge, judge::render_context},
};

const ANSWER_SYSTEM: &str = "You answer questions about the Weights & Biases library. \
Use only the numbered context documents. Cite the sources you used. \
If the context does not contain the answer, say that you do not know.";

const ENHANCE_SYSTEM: &str = "You rewrite user questions for document retrieval. \
Reply with a JSON object only: {\"rewritten\": \"<clear question>\", \
\"search_queries\": [\"<short keyword query>\", ...], \"intent\": \"<one or two words>\"}. \
Give at most three search queries.";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("RAGBENCH_CHAT_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: std::env::var("RAGBENCH_CHAT_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            model: std::env::var("RAGBENCH_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            temperature: 0.0,
            max_tokens: None,
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatClient {
    client: reqwest::Client,
    config: ChatConfig,
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| anyhow!("failed to build chat http client: {err}"))?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        debug!(model = %self.config.model, messages = messages.len(), "requesting chat completion");
        let response: ChatResponse = send_json(&self.config.retry, "chat", || {
            let request = self.client.post(&url).json(&body);
            match self.config.api_key.as_deref() {
                Some(key) => request.bearer_auth(key),
                None => request,
            }
        })
        .await?;
        first_content(response)
    }
}

fn first_content(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| anyhow!("chat response has no message content"))
}

fn answer_prompt(request: &GenerationRequest<'_>) -> String {
    let mut prompt = String::new();
    if !request.context.is_empty() {
        let _ = writeln!(prompt, "Context:\n{}", render_context(request.context));
    }
    let _ = writeln!(prompt, "Question: {}", request.query);
    if let Some(enhanced) = request.enhanced_query {
        let _ = writeln!(prompt, "Clarified question: {}", enhanced.rewritten);
        if !enhanced.intent.is_empty() {
            let _ = writeln!(prompt, "Intent: {}", enhanced.intent);
        }
    }
    prompt
}

#[async_trait]
impl ResponseGenerator for ChatClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String> {
        let messages = [
            ChatMessage::system(ANSWER_SYSTEM),
            ChatMessage::user(answer_prompt(&request)),
        ];
        self.chat(&messages).await
    }
}

#[async_trait]
impl Judge for ChatClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        self.chat(&[ChatMessage::system(system), ChatMessage::user(user)])
            .await
    }
}

/// Asks the chat model for a rewrite and keyword sub-queries.
pub struct LlmQueryEnhancer {
    client: Arc<ChatClient>,
}

impl LlmQueryEnhancer {
    pub fn new(client: Arc<ChatClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueryEnhancer for LlmQueryEnhancer {
    async fn enhance(&self, query: &str) -> Result<EnhancedQuery> {
        let reply = self
            .client
            .chat(&[ChatMessage::system(ENHANCE_SYSTEM), ChatMessage::user(query)])
            .await?;
        let mut enhanced: EnhancedQuery = parse_json_reply(&reply)?;
        if enhanced.rewritten.trim().is_empty() {
            enhanced.rewritten = query.to_string();
        }
        enhanced.search_queries.truncate(3);
        Ok(enhanced)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::RetrievedChunk;
    use embeddings::RetryPolicy;

    use super::{ChatClient, ChatConfig, ChatResponse, answer_prompt, first_content};
    use crate::pipeline::{EnhancedQuery, GenerationRequest};

    #[test]
    fn first_choice_content_is_returned() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Use wandb.log"}}]}"#,
        )
        .expect("parse");
        assert_eq!(first_content(response).expect("content"), "Use wandb.log");

        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).expect("parse");
        assert!(first_content(empty).is_err());
    }

    #[test]
    fn answer_prompt_includes_context_and_rewrite() {
        let context = vec![RetrievedChunk {
            chunk_id: "c0".to_string(),
            source: "guides/logging.md".to_string(),
            text: "wandb.log records metrics".to_string(),
            score: 1.0,
            rank: 1,
        }];
        let enhanced = EnhancedQuery {
            rewritten: "How do I record metrics?".to_string(),
            search_queries: Vec::new(),
            intent: "how_to".to_string(),
        };
        let prompt = answer_prompt(&GenerationRequest {
            query: "log metrics?",
            enhanced_query: Some(&enhanced),
            context: &context,
        });
        assert!(prompt.contains("[1] (guides/logging.md) wandb.log records metrics"));
        assert!(prompt.contains("Question: log metrics?"));
        assert!(prompt.contains("Clarified question: How do I record metrics?"));
        assert!(prompt.contains("Intent: how_to"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let client = ChatClient::new(ChatConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            timeout: Duration::from_millis(500),
            retry: RetryPolicy::none(),
            ..ChatConfig::default()
        })
        .expect("client");
        assert!(client.chat(&[]).await.is_err());
    }
}
