//! Gemini provider.
//!
//! Gemini's `contents` API only knows `user` and `model` roles; system
//! history entries (schema updates) are replayed as user turns, and the
//! engine prompt rides in `systemInstruction`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::GeminiConfig;
use crate::errors::{NeoError, NeoResult};
use crate::llm::{parse_structured_response, prompts, LlmClient, LlmStructuredResponse, ModelInfo};
use crate::streams::CancelHandle;
use crate::types::{DatabaseType, LlmMessageRecord, MessageRole};

use super::shaped_history;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiConfig,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    max_output_tokens: u32,
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig, timeout: Duration) -> NeoResult<Self> {
        if config.api_key.is_empty() {
            return Err(NeoError::config("GEMINI_API_KEY is required for the gemini client"));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            config,
            timeout,
        })
    }

    fn build_contents(&self, history: &[LlmMessageRecord]) -> Vec<Content> {
        shaped_history(history)
            .into_iter()
            .map(|(role, text)| {
                let role = match role {
                    MessageRole::Assistant => "model",
                    MessageRole::User | MessageRole::System => "user",
                };
                Content {
                    role: Some(role.to_string()),
                    parts: vec![Part { text }],
                }
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate_response(
        &self,
        cancel: &CancelHandle,
        history: &[LlmMessageRecord],
        database_type: DatabaseType,
    ) -> NeoResult<LlmStructuredResponse> {
        cancel.check()?;

        let request = GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part { text: prompts::system_prompt(database_type) }],
            },
            contents: self.build_contents(history),
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_completion_tokens,
                response_mime_type: "application/json".to_string(),
            },
        };
        let url = format!(
            "{}/{}:generateContent?key={}",
            API_BASE, self.config.model, self.config.api_key
        );

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
                        NeoError::network("gemini request timed out")
                    } else {
                        NeoError::network(format!("gemini request failed: {}", e))
                    }
                })?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| NeoError::network(format!("gemini response read failed: {}", e)))?;
            if !status.is_success() {
                return Err(NeoError::network(format!(
                    "gemini returned HTTP {}: {}",
                    status,
                    body.trim()
                )));
            }

            let parsed: GenerateResponse = serde_json::from_str(&body)
                .map_err(|e| NeoError::invalid_response(format!("malformed envelope: {}", e), &body))?;
            let content = parsed
                .candidates
                .into_iter()
                .next()
                .and_then(|c| c.content.parts.into_iter().next())
                .map(|p| p.text)
                .ok_or_else(|| NeoError::invalid_response("reply has no candidates", &body))?;
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
            provider: "gemini".to_string(),
            max_completion_tokens: self.config.max_completion_tokens,
        }
    }
}
