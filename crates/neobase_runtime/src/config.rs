//! Environment-driven configuration.
//!
//! Everything the core needs at boot in one struct, loaded from the process
//! environment with typed getters. Numeric getters parse on set: an invalid
//! value logs a warning and falls back to the default.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::errors::{NeoError, NeoResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProviderKind {
    OpenAi,
    Gemini,
    Ollama,
}

impl LlmProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProviderKind::OpenAi => "openai",
            LlmProviderKind::Gemini => "gemini",
            LlmProviderKind::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub max_completion_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub max_completion_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub max_completion_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub schema_encryption_key: String,
    pub default_llm_client: LlmProviderKind,
    pub mongo_uri: String,
    pub mongo_database: String,
    pub openai: OpenAiConfig,
    pub gemini: GeminiConfig,
    pub ollama: OllamaConfig,
    /// Connections idle longer than this are reaped.
    pub idle_ttl: Duration,
    /// Wake interval of the idle reaper.
    pub reap_interval: Duration,
    pub connect_timeout: Duration,
    pub llm_timeout: Duration,
    pub publish_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl Config {
    pub fn from_env() -> NeoResult<Self> {
        let schema_encryption_key = required_env("SCHEMA_ENCRYPTION_KEY")?;

        let default_llm_client = match env_with_default("DEFAULT_LLM_CLIENT", "openai").as_str() {
            "openai" => LlmProviderKind::OpenAi,
            "gemini" => LlmProviderKind::Gemini,
            "ollama" => LlmProviderKind::Ollama,
            other => {
                return Err(NeoError::config(format!(
                    "DEFAULT_LLM_CLIENT must be one of openai, gemini, ollama; got {}",
                    other
                )))
            }
        };

        let config = Self {
            port: int_env_with_default("PORT", 3000) as u16,
            environment: env_with_default("ENVIRONMENT", "DEVELOPMENT"),
            schema_encryption_key,
            default_llm_client,
            mongo_uri: env_with_default("NEOBASE_MONGODB_URI", "mongodb://localhost:27017/neobase"),
            mongo_database: env_with_default("NEOBASE_MONGODB_NAME", "neobase"),
            openai: OpenAiConfig {
                api_key: env_with_default("OPENAI_API_KEY", ""),
                model: env_with_default("OPENAI_MODEL", "gpt-4o"),
                max_completion_tokens: int_env_with_default("OPENAI_MAX_COMPLETION_TOKENS", 30_000)
                    as u32,
                temperature: float_env_with_default("OPENAI_TEMPERATURE", 1.0),
            },
            gemini: GeminiConfig {
                api_key: env_with_default("GEMINI_API_KEY", ""),
                model: env_with_default("GEMINI_MODEL", "gemini-2.0-flash"),
                max_completion_tokens: int_env_with_default("GEMINI_MAX_COMPLETION_TOKENS", 30_000)
                    as u32,
                temperature: float_env_with_default("GEMINI_TEMPERATURE", 1.0),
            },
            ollama: OllamaConfig {
                base_url: env_with_default("OLLAMA_BASE_URL", "http://localhost:11434"),
                model: env_with_default("OLLAMA_MODEL", "llama3.1"),
                max_completion_tokens: int_env_with_default("OLLAMA_MAX_COMPLETION_TOKENS", 30_000)
                    as u32,
                temperature: float_env_with_default("OLLAMA_TEMPERATURE", 1.0),
            },
            idle_ttl: Duration::from_secs(int_env_with_default("DB_IDLE_TTL_SECONDS", 15 * 60) as u64),
            reap_interval: Duration::from_secs(int_env_with_default("DB_REAP_INTERVAL_SECONDS", 60) as u64),
            connect_timeout: Duration::from_secs(int_env_with_default("DB_CONNECT_TIMEOUT_SECONDS", 10) as u64),
            llm_timeout: Duration::from_secs(int_env_with_default("LLM_TIMEOUT_SECONDS", 60) as u64),
            publish_timeout: Duration::from_millis(
                int_env_with_default("STREAM_PUBLISH_TIMEOUT_MS", 250) as u64,
            ),
            keepalive_interval: Duration::from_secs(
                int_env_with_default("STREAM_KEEPALIVE_SECONDS", 30) as u64,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> NeoResult<()> {
        if !self.mongo_uri.starts_with("mongodb://") && !self.mongo_uri.starts_with("mongodb+srv://")
        {
            return Err(NeoError::config(format!(
                "invalid NEOBASE_MONGODB_URI format: {}",
                self.mongo_uri
            )));
        }
        if self.idle_ttl.is_zero() || self.reap_interval.is_zero() {
            return Err(NeoError::config("idle TTL and reap interval must be positive"));
        }
        Ok(())
    }
}

fn env_with_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn required_env(key: &str) -> NeoResult<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(NeoError::config(format!("{} is required", key))),
    }
}

fn int_env_with_default(key: &str, default: i64) -> i64 {
    let raw = match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => return default,
    };
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, raw = %raw, default, "invalid integer env value, using default");
            default
        }
    }
}

fn float_env_with_default(key: &str, default: f64) -> f64 {
    let raw = match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => return default,
    };
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, raw = %raw, default, "invalid float env value, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_env_parses_on_set() {
        std::env::set_var("NEO_TEST_FLOAT", "0.25");
        assert_eq!(float_env_with_default("NEO_TEST_FLOAT", 1.0), 0.25);
        std::env::set_var("NEO_TEST_FLOAT", "not-a-number");
        assert_eq!(float_env_with_default("NEO_TEST_FLOAT", 1.0), 1.0);
        std::env::remove_var("NEO_TEST_FLOAT");
        assert_eq!(float_env_with_default("NEO_TEST_FLOAT", 0.5), 0.5);
    }

    #[test]
    fn int_env_falls_back_on_garbage() {
        std::env::set_var("NEO_TEST_INT", "12");
        assert_eq!(int_env_with_default("NEO_TEST_INT", 3), 12);
        std::env::set_var("NEO_TEST_INT", "twelve");
        assert_eq!(int_env_with_default("NEO_TEST_INT", 3), 3);
        std::env::remove_var("NEO_TEST_INT");
    }
}
