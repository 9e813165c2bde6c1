//! Ollama provider.
//!
//! Local models drift back to prose more readily than the hosted ones, so
//! the JSON-only instruction is reinforced with a trailing system message
//! after the conversation history.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::OllamaConfig;
use crate::errors::{NeoError, NeoResult};
use crate::llm::{parse_structured_response, prompts, LlmClient, LlmStructuredResponse, ModelInfo};
use crate::streams::CancelHandle;
use crate::types::{DatabaseType, LlmMessageRecord, MessageRole};

use super::shaped_history;

pub struct OllamaClient {
    client: reqwest::Client,
    config: OllamaConfig,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: String,
    options: ChatOptions,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            timeout,
        }
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
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: prompts::REINFORCEMENT_MESSAGE.to_string(),
        });
        messages
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
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
            stream: false,
            format: "json".to_string(),
            options: ChatOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_completion_tokens,
            },
        };
        let url = format!("{}/api/chat", self.config.base_url.trim_end_matches('/'));

        let call = async {
            let response = self
                .client
                .post(&url)
                .json(&request)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        NeoError::network("ollama request timed out")
                    } else {
                        NeoError::network(format!("ollama request failed: {}", e))
                    }
                })?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| NeoError::network(format!("ollama response read failed: {}", e)))?;
            if !status.is_success() {
                return Err(NeoError::network(format!(
                    "ollama returned HTTP {}: {}",
                    status,
                    body.trim()
                )));
            }

            let parsed: ChatResponse = serde_json::from_str(&body)
                .map_err(|e| NeoError::invalid_response(format!("malformed envelope: {}", e), &body))?;
            parse_structured_response(&parsed.message.content)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(NeoError::cancelled()),
            result = call => result,
        }
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.config.model.clone(),
            provider: "ollama".to_string(),
            max_completion_tokens: self.config.max_completion_tokens,
        }
    }
}
