//! OpenAI provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::OpenAiConfig;
use crate::errors::{NeoError, NeoResult};
use crate::llm::{parse_structured_response, prompts, LlmClient, LlmStructuredResponse, ModelInfo};
use crate::streams::CancelHandle;
use crate::types::{DatabaseType, LlmMessageRecord, MessageRole};

use super::shaped_history;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAiConfig,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_completion_tokens: u32,
    response_format: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig, timeout: Duration) -> NeoResult<Self> {
        if config.api_key.is_empty() {
            return Err(NeoError::config("OPENAI_API_KEY is required for the openai client"));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            config,
            timeout,
        })
    }

    fn headers(&self) -> NeoResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|_| NeoError::config("OPENAI_API_KEY contains invalid characters"))?;
        headers.insert(AUTHORIZATION, auth);
        Ok(headers)
    }

    fn build_messages(
        &self,
        history: &[LlmMessageRecord],
        database_type: DatabaseType,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system".to_string(),
            content: prompts::system_prompt(database_type),
        }];
        for (role, content) in shaped_history(history) {
            let role = match role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::System => "system",
            };
            messages.push(ChatMessage { role: role.to_string(), content });
        }
        messages
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate_response(
        &self,
        cancel: &CancelHandle,
        history: &[LlmMessageRecord],
        database_type: DatabaseType,
    ) -> NeoResult<LlmStructuredResponse> {
        cancel.check()?;

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: self.build_messages(history, database_type),
            temperature: self.config.temperature,
            max_completion_tokens: self.config.max_completion_tokens,
            response_format: json!({"type": "json_object"}),
        };
        let headers = self.headers()?;

        let call = async {
            let response = self
                .client
                .post(API_URL)
                .headers(headers)
                .json(&request)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        NeoError::network("openai request timed out")
                    } else {
                        NeoError::network(format!("openai request failed: {}", e))
                    }
                })?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| NeoError::network(format!("openai response read failed: {}", e)))?;
            if !status.is_success() {
                return Err(NeoError::network(format!(
                    "openai returned HTTP {}: {}",
                    status,
                    body.trim()
                )));
            }

            let parsed: ChatResponse = serde_json::from_str(&body)
                .map_err(|e| NeoError::invalid_response(format!("malformed envelope: {}", e), &body))?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| NeoError::invalid_response("reply has no choices", &body))?;
            parse_structured_response(&content)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(NeoError::cancelled()),
            result = call => result,
        }
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.config.model.clone(),
            provider: "openai".to_string(),
            max_completion_tokens: self.config.max_completion_tokens,
        }
    }
}
