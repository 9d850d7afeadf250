//! Chat-completion and web-research clients.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm upstream error: {0}")]
    Upstream(String),
    #[error("invalid llm response: {0}")]
    Invalid(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Upstream(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub json_response: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1500,
            json_response: false,
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync + 'static {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<ChatCompletion, LlmError>;
}

pub struct OpenAiChat {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("failed to build chat HTTP client"),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<ChatCompletion, LlmError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });
        if options.json_response {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Upstream(err.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream(format!(
                "chat endpoint returned {status}: {text}"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Invalid(format!(
                "chat endpoint returned {status}: {text}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| LlmError::Invalid(format!("malformed chat response: {err}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Invalid("chat response had no choices".to_string()))?;

        Ok(ChatCompletion {
            content,
            usage: parsed.usage.unwrap_or_default(),
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// External web research hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub relevance: f32,
}

#[async_trait]
pub trait Researcher: Send + Sync + 'static {
    async fn query(&self, question: &str, max_results: usize) -> Result<Vec<ResearchHit>, LlmError>;
}

/// Perplexity-style online chat endpoint that returns citations.
pub struct HttpResearcher {
    client: Client,
    api_key: String,
}

impl HttpResearcher {
    const ENDPOINT: &'static str = "https://api.perplexity.ai/chat/completions";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build research HTTP client"),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Researcher for HttpResearcher {
    async fn query(&self, question: &str, max_results: usize) -> Result<Vec<ResearchHit>, LlmError> {
        let response = self
            .client
            .post(Self::ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": "sonar",
                "messages": [{ "role": "user", "content": question }],
                "return_citations": true,
            }))
            .send()
            .await
            .map_err(|err| LlmError::Upstream(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Upstream(format!(
                "research endpoint returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| LlmError::Invalid(format!("malformed research response: {err}")))?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let snippet: String = content.chars().take(200).collect();

        let citations = body["citations"].as_array().cloned().unwrap_or_default();
        let hits = citations
            .iter()
            .filter_map(|value| value.as_str())
            .take(max_results)
            .enumerate()
            .map(|(idx, url)| ResearchHit {
                url: url.to_string(),
                title: format!("Source {}", idx + 1),
                snippet: snippet.clone(),
                relevance: (1.0 - idx as f32 * 0.1).max(0.0),
            })
            .collect();

        Ok(hits)
    }
}
