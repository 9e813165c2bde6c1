use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main result type for runtime operations
pub type NeoResult<T> = Result<T, NeoError>;

/// Structured error carried across every component boundary.
///
/// The `code` drives caller policy (retry / surface / recover), `details`
/// carries machine-readable context such as the failing statement index.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub struct NeoError {
    pub code: ErrorCode,
    pub severity: ErrorSeverity,
    pub message: String,
    pub details: HashMap<String, serde_json::Value>,
}

impl fmt::Display for NeoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Missing or invalid connection fields; never retried
    Config,
    /// Transport failure talking to an engine
    Network,
    /// Certificate load/verify failure
    Tls,
    /// No live connection for the chat
    NotConnected,
    /// SQL / Mongo execution failure
    Execution,
    /// Context cancellation
    Cancelled,
    /// LLM reply did not conform to the structured schema
    InvalidResponse,
    /// Stream subscriber buffer overflow
    SubscriberLagged,
    /// Persistence-layer failure
    Database,
    /// Anything that should not happen
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Config => write!(f, "CONFIG_ERROR"),
            ErrorCode::Network => write!(f, "NETWORK_ERROR"),
            ErrorCode::Tls => write!(f, "TLS_ERROR"),
            ErrorCode::NotConnected => write!(f, "NOT_CONNECTED"),
            ErrorCode::Execution => write!(f, "EXECUTION_ERROR"),
            ErrorCode::Cancelled => write!(f, "CANCELLED"),
            ErrorCode::InvalidResponse => write!(f, "INVALID_RESPONSE"),
            ErrorCode::SubscriberLagged => write!(f, "SUBSCRIBER_LAGGED"),
            ErrorCode::Database => write!(f, "DATABASE_ERROR"),
            ErrorCode::Internal => write!(f, "INTERNAL_ERROR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl NeoError {
    pub fn new(code: ErrorCode, severity: ErrorSeverity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Config, ErrorSeverity::Medium, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Network, ErrorSeverity::High, message)
    }

    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Tls, ErrorSeverity::High, message)
    }

    pub fn not_connected(chat_id: &str) -> Self {
        Self::new(
            ErrorCode::NotConnected,
            ErrorSeverity::Medium,
            format!("no database connection for chat {}", chat_id),
        )
        .with_detail("chat_id", chat_id)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Execution, ErrorSeverity::High, message)
    }

    /// Execution failure pinned to a statement inside a batch.
    pub fn execution_at(index: usize, message: impl Into<String>) -> Self {
        Self::execution(message).with_detail("statement_index", index as i64)
    }

    pub fn cancelled() -> Self {
        Self::new(
            ErrorCode::Cancelled,
            ErrorSeverity::Low,
            "operation cancelled by user",
        )
    }

    pub fn invalid_response(message: impl Into<String>, raw: &str) -> Self {
        Self::new(ErrorCode::InvalidResponse, ErrorSeverity::Medium, message)
            .with_detail("raw_response", raw)
    }

    pub fn subscriber_lagged(stream_id: &str) -> Self {
        Self::new(
            ErrorCode::SubscriberLagged,
            ErrorSeverity::Low,
            format!("subscriber {} lagged, event dropped", stream_id),
        )
        .with_detail("stream_id", stream_id)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Database, ErrorSeverity::High, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, ErrorSeverity::Critical, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_code_and_message() {
        let err = NeoError::not_connected("chat-1");
        let rendered = err.to_string();
        assert!(rendered.contains("NOT_CONNECTED"));
        assert!(rendered.contains("chat-1"));
    }

    #[test]
    fn execution_at_records_statement_index() {
        let err = NeoError::execution_at(2, "syntax error");
        assert_eq!(err.details.get("statement_index").unwrap(), &serde_json::json!(2));
    }

    #[test]
    fn roundtrips_through_serde() {
        let err = NeoError::tls("bad root certificate").with_detail("host", "db.internal");
        let json = serde_json::to_string(&err).unwrap();
        let back: NeoError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, ErrorCode::Tls);
        assert_eq!(back.details.get("host").unwrap(), "db.internal");
    }
}
