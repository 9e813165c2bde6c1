//! LLM client abstraction.
//!
//! One trait over the vendors, one structured reply shape, and one robust
//! extractor. Vendor "JSON modes" are hints, never trusted: every reply
//! goes through fence stripping and the outermost-braces slice before
//! schema validation, and a non-conforming reply is a first-class error
//! carrying the raw text.

pub mod prompts;
pub mod providers;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{NeoError, NeoResult};
use crate::streams::CancelHandle;
use crate::types::{DatabaseType, LlmMessageRecord, MessageRole, Pagination, Query};

pub const MAX_ACTION_BUTTONS: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    pub max_completion_tokens: u32,
}

/// Uniform interface over the vendors. `generate_response` must honour the
/// cancellation handle promptly, including mid-flight HTTP requests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate_response(
        &self,
        cancel: &CancelHandle,
        history: &[LlmMessageRecord],
        database_type: DatabaseType,
    ) -> NeoResult<LlmStructuredResponse>;

    fn model_info(&self) -> ModelInfo;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionButton {
    pub label: String,
    pub action: String,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    #[serde(default)]
    pub paginated_query: Option<String>,
    #[serde(default)]
    pub count_query: Option<String>,
}

/// One proposed query as the model emits it. Engine-specific extras
/// (ClickHouse table engines, Mongo validation schemas) ride along as
/// optional fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryInfo {
    pub query: String,
    #[serde(default)]
    pub query_type: Option<String>,
    #[serde(default)]
    pub is_critical: bool,
    #[serde(default)]
    pub can_rollback: bool,
    #[serde(default)]
    pub explanation: String,
    /// Number of milliseconds; tolerated as number or numeric string.
    #[serde(default)]
    pub estimate_response_time: Value,
    #[serde(default)]
    pub pagination: Option<PaginationInfo>,
    #[serde(default)]
    pub example_result: Option<Value>,
    #[serde(default)]
    pub tables: Option<String>,
    #[serde(default)]
    pub rollback_query: Option<String>,
    #[serde(default)]
    pub rollback_dependent_query: Option<String>,
    #[serde(default)]
    pub engine_type: Option<String>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub order_by_key: Option<String>,
    #[serde(default)]
    pub validation_schema: Option<Value>,
    #[serde(default)]
    pub index_options: Option<Value>,
}

impl QueryInfo {
    pub fn estimate_ms(&self) -> i64 {
        match &self.estimate_response_time {
            Value::Number(n) => n.as_f64().unwrap_or(0.0) as i64,
            Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0) as i64,
            _ => 0,
        }
    }

    /// Converts the wire shape into the persisted [`Query`] record.
    pub fn into_query(self) -> Query {
        let estimate = self.estimate_ms();
        Query {
            id: Uuid::new_v4().to_string(),
            query: self.query,
            description: self.explanation,
            query_type: self.query_type,
            tables: self.tables,
            is_critical: self.is_critical,
            can_rollback: self.can_rollback,
            rollback_query: self.rollback_query,
            rollback_dependent_query: self.rollback_dependent_query,
            pagination: Pagination {
                paginated_query: self.pagination.as_ref().and_then(|p| p.paginated_query.clone()),
                count_query: self.pagination.as_ref().and_then(|p| p.count_query.clone()),
            },
            example_result: self.example_result.map(|v| v.to_string()),
            estimate_response_time: estimate,
            is_executed: false,
            is_rolled_back: false,
            execution_time_ms: None,
            execution_result: None,
            error: None,
        }
    }
}

/// The single JSON object every provider must produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmStructuredResponse {
    pub assistant_message: String,
    #[serde(default)]
    pub queries: Vec<QueryInfo>,
    #[serde(default)]
    pub action_buttons: Vec<ActionButton>,
}

impl LlmStructuredResponse {
    fn validate(mut self) -> Self {
        self.action_buttons.truncate(MAX_ACTION_BUTTONS);
        self
    }
}

/// Slices the outermost `{…}` out of a reply, tolerating code fences and
/// prose around the object.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped;
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(text[start..=end].trim())
}

/// Parses a raw provider reply into the structured schema. Failure is an
/// [`ErrorCode::InvalidResponse`](crate::errors::ErrorCode) carrying the
/// raw text for diagnosis and one-shot repair.
pub fn parse_structured_response(raw: &str) -> NeoResult<LlmStructuredResponse> {
    let candidate = extract_json_object(raw)
        .ok_or_else(|| NeoError::invalid_response("reply contains no JSON object", raw))?;
    let parsed: LlmStructuredResponse = serde_json::from_str(candidate).map_err(|e| {
        NeoError::invalid_response(format!("reply does not match the response schema: {}", e), raw)
    })?;
    Ok(parsed.validate())
}

/// Flattens a persisted LLM message into the plain text replayed to a
/// provider. Returns `None` for messages with nothing to say.
pub fn render_history_content(record: &LlmMessageRecord) -> Option<String> {
    match record.role {
        MessageRole::User => record
            .content
            .get("user_message")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        MessageRole::Assistant => record
            .content
            .get("assistant_response")
            .map(|v| v.to_string()),
        MessageRole::System => record
            .content
            .get("schema_update")
            .and_then(Value::as_str)
            .map(|s| format!("Database schema update:\n{}", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_object_from_fenced_reply() {
        let raw = "Here you go:\n```json\n{\"assistantMessage\": \"hi\", \"queries\": []}\n```\nEnjoy!";
        let parsed = parse_structured_response(raw).unwrap();
        assert_eq!(parsed.assistant_message, "hi");
        assert!(parsed.queries.is_empty());
    }

    #[test]
    fn extracts_object_with_prose_prefix() {
        let raw = "Sure! {\"assistantMessage\": \"ok\"} trailing words";
        let parsed = parse_structured_response(raw).unwrap();
        assert_eq!(parsed.assistant_message, "ok");
    }

    #[test]
    fn nonconforming_reply_carries_raw_text() {
        let err = parse_structured_response("no json here at all").unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::InvalidResponse);
        assert_eq!(err.details.get("raw_response").unwrap(), "no json here at all");
    }

    #[test]
    fn action_buttons_are_capped_at_two() {
        let raw = json!({
            "assistantMessage": "m",
            "actionButtons": [
                {"label": "a", "action": "x"},
                {"label": "b", "action": "y"},
                {"label": "c", "action": "z"}
            ]
        })
        .to_string();
        let parsed = parse_structured_response(&raw).unwrap();
        assert_eq!(parsed.action_buttons.len(), 2);
    }

    #[test]
    fn estimate_tolerates_number_and_string() {
        let mut info: QueryInfo = serde_json::from_value(json!({
            "query": "SELECT 1",
            "estimateResponseTime": 250
        }))
        .unwrap();
        assert_eq!(info.estimate_ms(), 250);

        info.estimate_response_time = json!("125");
        assert_eq!(info.estimate_ms(), 125);

        info.estimate_response_time = Value::Null;
        assert_eq!(info.estimate_ms(), 0);
    }

    #[test]
    fn query_info_round_trips_into_query() {
        let info: QueryInfo = serde_json::from_value(json!({
            "query": "DELETE FROM users",
            "queryType": "DELETE",
            "isCritical": true,
            "canRollback": true,
            "explanation": "removes every user",
            "estimateResponseTime": 100,
            "rollbackQuery": "INSERT INTO users SELECT * FROM users_backup",
            "pagination": {"paginatedQuery": "SELECT * FROM users OFFSET offset_size LIMIT 50"}
        }))
        .unwrap();

        let query = info.into_query();
        assert!(query.is_critical);
        assert_eq!(query.query_type.as_deref(), Some("DELETE"));
        assert!(query.rollback_query.is_some());
        assert!(query
            .pagination
            .paginated_query
            .as_deref()
            .unwrap()
            .contains("OFFSET offset_size LIMIT 50"));
        assert!(!query.is_executed);
    }

    #[test]
    fn history_rendering_per_role() {
        let user = record(MessageRole::User, json!({"user_message": "list users"}));
        assert_eq!(render_history_content(&user).unwrap(), "list users");

        let assistant = record(
            MessageRole::Assistant,
            json!({"assistant_response": {"assistantMessage": "done"}}),
        );
        assert!(render_history_content(&assistant).unwrap().contains("assistantMessage"));

        let system = record(MessageRole::System, json!({"schema_update": "Table: users"}));
        assert!(render_history_content(&system)
            .unwrap()
            .starts_with("Database schema update:"));

        let empty = record(MessageRole::User, json!({}));
        assert!(render_history_content(&empty).is_none());
    }

    fn record(role: MessageRole, content: Value) -> LlmMessageRecord {
        LlmMessageRecord {
            id: "1".into(),
            chat_id: "c".into(),
            message_id: "m".into(),
            user_id: "u".into(),
            role,
            content,
            created_at: chrono::Utc::now(),
        }
    }
}
