use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::EncryptedField;
use crate::errors::NeoError;

/// Closed set of supported engine families. Every driver and schema fetcher
/// is a concrete type selected through this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[serde(rename = "postgresql")]
    PostgreSql,
    #[serde(rename = "yugabytedb")]
    YugabyteDb,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "clickhouse")]
    ClickHouse,
    #[serde(rename = "mongodb")]
    MongoDb,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::PostgreSql => "postgresql",
            DatabaseType::YugabyteDb => "yugabytedb",
            DatabaseType::MySql => "mysql",
            DatabaseType::ClickHouse => "clickhouse",
            DatabaseType::MongoDb => "mongodb",
        }
    }

    /// YugabyteDB speaks the PostgreSQL wire protocol; both resolve to the
    /// same driver.
    pub fn is_postgres_wire(&self) -> bool {
        matches!(self, DatabaseType::PostgreSql | DatabaseType::YugabyteDb)
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = NeoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseType::PostgreSql),
            "yugabytedb" => Ok(DatabaseType::YugabyteDb),
            "mysql" => Ok(DatabaseType::MySql),
            "clickhouse" => Ok(DatabaseType::ClickHouse),
            "mongodb" => Ok(DatabaseType::MongoDb),
            other => Err(NeoError::config(format!("unsupported database type: {}", other))),
        }
    }
}

/// Decrypted connection parameters handed to a driver at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "type")]
    pub database_type: DatabaseType,
    pub host: String,
    pub port: Option<String>,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub database: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_key_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_root_cert_url: Option<String>,
}

impl ConnectionConfig {
    /// Validates the fields a driver cannot connect without.
    pub fn validate(&self) -> Result<(), NeoError> {
        if self.host.is_empty() {
            return Err(NeoError::config("connection host is required"));
        }
        if self.database.is_empty() {
            return Err(NeoError::config("database name is required"));
        }
        if self.use_ssl
            && self.ssl_cert_url.is_some() != self.ssl_key_url.is_some()
        {
            return Err(NeoError::config(
                "client certificate and key must be provided together",
            ));
        }
        Ok(())
    }

    pub fn port_or(&self, default: u16) -> u16 {
        self.port
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or(default)
    }
}

/// Persisted form of a connection: secret-bearing fields are encrypted
/// independently with the process-wide cipher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConnectionConfig {
    #[serde(rename = "type")]
    pub database_type: DatabaseType,
    pub host: String,
    pub port: Option<String>,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<EncryptedField>,
    pub database: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert_url: Option<EncryptedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_key_url: Option<EncryptedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_root_cert_url: Option<EncryptedField>,
}

/// Secret-free view of a live connection's configuration, safe to hand to
/// API consumers and the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionView {
    #[serde(rename = "type")]
    pub database_type: DatabaseType,
    pub host: String,
    pub port: Option<String>,
    pub username: String,
    pub database: String,
    pub use_ssl: bool,
}

impl From<&ConnectionConfig> for ConnectionView {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            database_type: config.database_type,
            host: config.host.clone(),
            port: config.port.clone(),
            username: config.username.clone(),
            database: config.database.clone(),
            use_ssl: config.use_ssl,
        }
    }
}

/// Connection lifecycle per the state machine in the design: every
/// transition publishes a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

/// Rough classification of a statement, used for transactional gating and
/// result shaping. The LLM reports its own `queryType` string; this is the
/// normalised form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}

impl QueryKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SELECT" => QueryKind::Select,
            "INSERT" => QueryKind::Insert,
            "UPDATE" => QueryKind::Update,
            "DELETE" => QueryKind::Delete,
            "DDL" | "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => QueryKind::Ddl,
            _ => QueryKind::Other,
        }
    }

    pub fn returns_rows(&self) -> bool {
        matches!(self, QueryKind::Select | QueryKind::Other)
    }
}

/// One canonicalised result row: column name to JSON scalar.
pub type ResultRow = serde_json::Map<String, Value>;

/// Error payload attached to a partial execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryExecutionError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Normalised outcome of running one query (or statement batch).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryExecutionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<ResultRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub execution_time_ms: u64,
    /// Serialised copy of the result for storage and the UI.
    pub result_json: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryExecutionError>,
}

impl QueryExecutionResult {
    pub fn finalize(mut self) -> Self {
        let body = serde_json::json!({
            "rows": self.rows,
            "rows_affected": self.rows_affected,
            "message": self.message,
        });
        self.result_json = body.to_string();
        self
    }
}

/// Pagination scaffolding proposed alongside a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paginated_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count_query: Option<String>,
}

/// An assistant-proposed query, persisted with its execution bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub query: String,
    pub description: String,
    pub query_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<String>,
    pub is_critical: bool,
    pub can_rollback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_dependent_query: Option<String>,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example_result: Option<String>,
    pub estimate_response_time: i64,
    pub is_executed: bool,
    pub is_rolled_back: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Role of a chat participant, shared between persisted messages and LLM
/// history shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// A persistent conversation scope binding a user to a connection config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub connection: StoredConnectionConfig,
    /// "ALL" or a comma-separated table list.
    pub selected_collections: String,
    pub auto_execute_query: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    /// Tables the user scoped this chat to; `None` means everything.
    pub fn selected_tables(&self) -> Option<Vec<String>> {
        if self.selected_collections.trim().is_empty()
            || self.selected_collections.eq_ignore_ascii_case("ALL")
        {
            return None;
        }
        Some(
            self.selected_collections
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }
}

/// A chat-visible message; assistant messages carry their proposed queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<Query>>,
    pub created_at: DateTime<Utc>,
}

/// A message in the LLM-facing history. `content` mirrors the structured
/// shapes replayed to the model: `{"user_message": …}`,
/// `{"assistant_response": …}` or `{"schema_update": …}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessageRecord {
    pub id: String,
    pub chat_id: String,
    pub message_id: String,
    pub user_id: String,
    pub role: MessageRole,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

/// Event names on the SSE surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEventKind {
    #[serde(rename = "ai-response-step")]
    AiResponseStep,
    #[serde(rename = "ai-response")]
    AiResponse,
    #[serde(rename = "ai-response-error")]
    AiResponseError,
    #[serde(rename = "execution-result")]
    ExecutionResult,
    #[serde(rename = "execution-error")]
    ExecutionError,
    #[serde(rename = "response-cancelled")]
    ResponseCancelled,
    #[serde(rename = "db-connecting")]
    DbConnecting,
    #[serde(rename = "db-connected")]
    DbConnected,
    #[serde(rename = "db-disconnected")]
    DbDisconnected,
    #[serde(rename = "db-status")]
    DbStatus,
    #[serde(rename = "subscriber-lagged")]
    SubscriberLagged,
    #[serde(rename = "keepalive")]
    Keepalive,
    #[serde(rename = "complete")]
    Complete,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventKind::AiResponseStep => "ai-response-step",
            StreamEventKind::AiResponse => "ai-response",
            StreamEventKind::AiResponseError => "ai-response-error",
            StreamEventKind::ExecutionResult => "execution-result",
            StreamEventKind::ExecutionError => "execution-error",
            StreamEventKind::ResponseCancelled => "response-cancelled",
            StreamEventKind::DbConnecting => "db-connecting",
            StreamEventKind::DbConnected => "db-connected",
            StreamEventKind::DbDisconnected => "db-disconnected",
            StreamEventKind::DbStatus => "db-status",
            StreamEventKind::SubscriberLagged => "subscriber-lagged",
            StreamEventKind::Keepalive => "keepalive",
            StreamEventKind::Complete => "complete",
        }
    }
}

/// One event on a (chat, stream) channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResponse {
    pub event: StreamEventKind,
    pub data: Value,
}

impl StreamResponse {
    pub fn new(event: StreamEventKind, data: impl Into<Value>) -> Self {
        Self { event, data: data.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_type_parses_aliases() {
        assert_eq!("postgres".parse::<DatabaseType>().unwrap(), DatabaseType::PostgreSql);
        assert_eq!("ClickHouse".parse::<DatabaseType>().unwrap(), DatabaseType::ClickHouse);
        assert!("oracle".parse::<DatabaseType>().is_err());
    }

    #[test]
    fn selected_tables_all_means_unfiltered() {
        let chat = sample_chat("ALL");
        assert!(chat.selected_tables().is_none());
        let chat = sample_chat("orders, users");
        assert_eq!(chat.selected_tables().unwrap(), vec!["orders", "users"]);
    }

    #[test]
    fn config_requires_paired_client_cert_material() {
        let mut config = sample_config();
        config.use_ssl = true;
        config.ssl_cert_url = Some("https://certs/cert.pem".into());
        assert!(config.validate().is_err());
        config.ssl_key_url = Some("https://certs/key.pem".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn result_json_reflects_rows() {
        let mut row = ResultRow::new();
        row.insert("id".into(), serde_json::json!(1));
        let result = QueryExecutionResult {
            rows: Some(vec![row]),
            ..Default::default()
        }
        .finalize();
        assert!(result.result_json.contains("\"id\":1"));
    }

    fn sample_config() -> ConnectionConfig {
        ConnectionConfig {
            database_type: DatabaseType::PostgreSql,
            host: "localhost".into(),
            port: Some("5432".into()),
            username: "app".into(),
            password: Some("secret".into()),
            database: "app".into(),
            use_ssl: false,
            ssl_cert_url: None,
            ssl_key_url: None,
            ssl_root_cert_url: None,
        }
    }

    fn sample_chat(selected: &str) -> Chat {
        Chat {
            id: "c1".into(),
            user_id: "u1".into(),
            connection: StoredConnectionConfig {
                database_type: DatabaseType::PostgreSql,
                host: "localhost".into(),
                port: Some("5432".into()),
                username: "app".into(),
                password: None,
                database: "app".into(),
                use_ssl: false,
                ssl_cert_url: None,
                ssl_key_url: None,
                ssl_root_cert_url: None,
            },
            selected_collections: selected.into(),
            auto_execute_query: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
