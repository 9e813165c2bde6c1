//! Chat pipeline: one user message end to end.
//!
//! Persist → resolve connection → refresh schema on drift → LLM call →
//! parse into proposed queries → persist → stream → (maybe) execute inside
//! a transaction. Invocations are serialised per chat; every suspension
//! point honours the stream's cancellation handle. Critical queries are
//! never executed here without the explicit confirmation path, and a
//! confirmation always runs inside its own transaction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::connections::ConnectionManager;
use crate::errors::{ErrorCode, NeoError, NeoResult};
use crate::llm::LlmClient;
use crate::repositories::{ChatRepository, LlmMessageRepository, MessageRepository};
use crate::schema::SchemaService;
use crate::streams::{CancelHandle, StreamBus};
use crate::types::{
    Chat, LlmMessageRecord, Message, MessageRole, Query, QueryKind, StreamEventKind,
    StreamResponse,
};

const STEP_ANALYZING: &str = "NeoBase is analyzing your request..";
const STEP_GENERATING: &str =
    "Generating an optimized query & example results for the request..";
const STEP_CRITICALITY: &str =
    "Analyzing the criticality of the query & if roll back is possible..";

pub struct ChatPipeline {
    manager: Arc<ConnectionManager>,
    schema: Arc<SchemaService>,
    llm: Arc<dyn LlmClient>,
    bus: Arc<StreamBus>,
    chats: Arc<dyn ChatRepository>,
    messages: Arc<dyn MessageRepository>,
    llm_messages: Arc<dyn LlmMessageRepository>,
    active: Mutex<HashMap<String, CancelHandle>>,
    chat_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<ConnectionManager>,
        schema: Arc<SchemaService>,
        llm: Arc<dyn LlmClient>,
        bus: Arc<StreamBus>,
        chats: Arc<dyn ChatRepository>,
        messages: Arc<dyn MessageRepository>,
        llm_messages: Arc<dyn LlmMessageRepository>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            schema,
            llm,
            bus,
            chats,
            messages,
            llm_messages,
            active: Mutex::new(HashMap::new()),
            chat_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn chat_lock(&self, chat_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.chat_locks.lock().await;
        locks
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn emit(&self, chat_id: &str, stream_id: &str, event: StreamEventKind, data: serde_json::Value) {
        self.bus
            .publish(chat_id, stream_id, StreamResponse::new(event, data))
            .await;
    }

    /// Persists the user message and its LLM-history record. The caller
    /// (the HTTP layer) spawns [`spawn_processing`](Self::spawn_processing)
    /// afterwards, mirroring the request/stream split.
    pub async fn handle_user_message(
        self: &Arc<Self>,
        chat_id: &str,
        user_id: &str,
        _stream_id: &str,
        content: &str,
    ) -> NeoResult<Message> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            queries: None,
            created_at: Utc::now(),
        };
        let message = self.messages.create(message).await?;

        self.llm_messages
            .create(LlmMessageRecord {
                id: Uuid::new_v4().to_string(),
                chat_id: chat_id.to_string(),
                message_id: message.id.clone(),
                user_id: user_id.to_string(),
                role: MessageRole::User,
                content: json!({ "user_message": content }),
                created_at: Utc::now(),
            })
            .await?;

        Ok(message)
    }

    /// Runs [`process_message`](Self::process_message) on its own task.
    pub fn spawn_processing(
        self: &Arc<Self>,
        chat_id: &str,
        user_id: &str,
        stream_id: &str,
        message_id: &str,
    ) {
        let pipeline = Arc::clone(self);
        let (chat_id, user_id, stream_id, message_id) = (
            chat_id.to_string(),
            user_id.to_string(),
            stream_id.to_string(),
            message_id.to_string(),
        );
        tokio::spawn(async move {
            pipeline
                .process_message(&chat_id, &user_id, &stream_id, &message_id)
                .await;
        });
    }

    /// The eleven-step orchestration. All failure paths persist an
    /// assistant-side record so chat history stays consistent, and emit a
    /// typed stream event.
    pub async fn process_message(
        self: &Arc<Self>,
        chat_id: &str,
        user_id: &str,
        stream_id: &str,
        message_id: &str,
    ) {
        let lock = self.chat_lock(chat_id).await;
        let _guard = lock.lock().await;

        let cancel = self.manager.cancel_handle_for(chat_id, stream_id).await;
        self.active
            .lock()
            .await
            .insert(stream_id.to_string(), cancel.clone());

        let outcome = self
            .run_pipeline(chat_id, user_id, stream_id, message_id, &cancel)
            .await;

        self.active.lock().await.remove(stream_id);

        match outcome {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {
                info!(chat_id, stream_id, "processing cancelled by user");
                self.emit(
                    chat_id,
                    stream_id,
                    StreamEventKind::ResponseCancelled,
                    json!({ "message": "Operation cancelled by user" }),
                )
                .await;
            }
            Err(err) => {
                error!(chat_id, stream_id, error = %err, "message processing failed");
                self.persist_assistant_error(chat_id, user_id, message_id, &err)
                    .await;
                self.emit(
                    chat_id,
                    stream_id,
                    StreamEventKind::AiResponseError,
                    json!({ "error": err.to_string(), "code": err.code }),
                )
                .await;
            }
        }
        self.bus.complete(chat_id, stream_id).await;
    }

    async fn run_pipeline(
        self: &Arc<Self>,
        chat_id: &str,
        user_id: &str,
        stream_id: &str,
        message_id: &str,
        cancel: &CancelHandle,
    ) -> NeoResult<()> {
        self.emit(
            chat_id,
            stream_id,
            StreamEventKind::AiResponseStep,
            json!(STEP_ANALYZING),
        )
        .await;

        let chat = self
            .chats
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| NeoError::config(format!("chat {} not found", chat_id)))?;

        let connection = self.manager.get_connection(chat_id).await?;
        let driver = self.manager.driver_for(connection.database_type)?;
        cancel.check()?;

        // Schema drift: full fetch and a system-role history entry only
        // when the cheap probe says something moved.
        let selected = chat.selected_tables();
        if self
            .schema
            .has_schema_changed(cancel, chat_id, driver.as_ref())
            .await?
        {
            let diff = self
                .schema
                .check_schema_changes(cancel, chat_id, driver.as_ref(), selected.as_deref())
                .await?;
            let schema = self
                .schema
                .get_schema(cancel, chat_id, driver.as_ref(), selected.as_deref())
                .await?;

            let mut update = self.schema.format_for_llm(&schema);
            if let Some(diff) = &diff {
                update = format!("{}\n\nChanges:\n{}", update, diff.format());
            }
            self.llm_messages
                .create(LlmMessageRecord {
                    id: Uuid::new_v4().to_string(),
                    chat_id: chat_id.to_string(),
                    message_id: message_id.to_string(),
                    user_id: user_id.to_string(),
                    role: MessageRole::System,
                    content: json!({ "schema_update": update }),
                    created_at: Utc::now(),
                })
                .await?;
        }
        cancel.check()?;

        let history = self.llm_messages.list_by_chat(chat_id).await?;

        self.emit(
            chat_id,
            stream_id,
            StreamEventKind::AiResponseStep,
            json!(STEP_GENERATING),
        )
        .await;

        // One repair attempt for non-conforming replies; everything else
        // surfaces immediately.
        let response = match self
            .llm
            .generate_response(cancel, &history, connection.database_type)
            .await
        {
            Ok(response) => response,
            Err(err) if err.code == ErrorCode::InvalidResponse => {
                warn!(chat_id, "LLM reply was non-conforming, retrying once");
                cancel.check()?;
                self.llm
                    .generate_response(cancel, &history, connection.database_type)
                    .await?
            }
            Err(err) => return Err(err),
        };
        cancel.check()?;

        self.emit(
            chat_id,
            stream_id,
            StreamEventKind::AiResponseStep,
            json!(STEP_CRITICALITY),
        )
        .await;

        let queries: Vec<Query> = response
            .queries
            .iter()
            .cloned()
            .map(|q| q.into_query())
            .collect();

        let assistant_message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            role: MessageRole::Assistant,
            content: response.assistant_message.clone(),
            queries: (!queries.is_empty()).then(|| queries.clone()),
            created_at: Utc::now(),
        };
        let assistant_message = self.messages.create(assistant_message).await?;

        self.llm_messages
            .create(LlmMessageRecord {
                id: Uuid::new_v4().to_string(),
                chat_id: chat_id.to_string(),
                message_id: assistant_message.id.clone(),
                user_id: user_id.to_string(),
                role: MessageRole::Assistant,
                content: json!({ "assistant_response": serde_json::to_value(&response)
                    .unwrap_or_default() }),
                created_at: Utc::now(),
            })
            .await?;

        self.emit(
            chat_id,
            stream_id,
            StreamEventKind::AiResponse,
            json!({
                "message_id": assistant_message.id,
                "assistant_message": response.assistant_message,
                "queries": queries,
                "action_buttons": response.action_buttons,
            }),
        )
        .await;

        // Auto-execute only when the chat opted in and nothing is critical.
        let has_critical = queries.iter().any(|q| q.is_critical);
        if chat.auto_execute_query && !queries.is_empty() && !has_critical {
            cancel.check()?;
            self.execute_in_transaction(
                &chat,
                &connection,
                stream_id,
                assistant_message,
                queries,
                cancel,
            )
            .await?;
        } else if has_critical {
            info!(chat_id, "critical queries proposed, awaiting explicit confirmation");
        }

        Ok(())
    }

    /// Runs a batch of queries inside one driver transaction. The first
    /// failing query rolls everything back.
    async fn execute_in_transaction(
        &self,
        chat: &Chat,
        connection: &crate::connections::ManagedConnection,
        stream_id: &str,
        mut message: Message,
        mut queries: Vec<Query>,
        cancel: &CancelHandle,
    ) -> NeoResult<()> {
        let driver = self.manager.driver_for(connection.database_type)?;
        let mut tx = driver.begin_tx(&chat.id).await?;

        for index in 0..queries.len() {
            if cancel.is_cancelled() {
                tx.rollback().await?;
                return Err(NeoError::cancelled());
            }

            let kind = QueryKind::parse(queries[index].query_type.as_deref().unwrap_or_default());
            let result = tx.execute_query(&queries[index].query, kind).await?;

            if let Some(exec_error) = &result.error {
                queries[index].error = Some(exec_error.message.clone());
                message.queries = Some(queries.clone());
                self.messages.update(&message).await?;

                tx.rollback().await?;
                self.emit(
                    &chat.id,
                    stream_id,
                    StreamEventKind::ExecutionError,
                    json!({
                        "message_id": message.id,
                        "query_id": queries[index].id,
                        "statement_index": index,
                        "error": exec_error,
                    }),
                )
                .await;
                return Ok(());
            }

            queries[index].is_executed = true;
            queries[index].execution_time_ms = Some(result.execution_time_ms);
            queries[index].execution_result = Some(result.result_json.clone());
        }

        tx.commit().await?;
        message.queries = Some(queries.clone());
        self.messages.update(&message).await?;

        self.emit(
            &chat.id,
            stream_id,
            StreamEventKind::ExecutionResult,
            json!({
                "message_id": message.id,
                "results": queries
                    .iter()
                    .map(|q| json!({
                        "query_id": q.id,
                        "is_executed": q.is_executed,
                        "execution_time_ms": q.execution_time_ms,
                        "execution_result": q.execution_result,
                    }))
                    .collect::<Vec<_>>(),
            }),
        )
        .await;
        Ok(())
    }

    /// Explicit confirmation path for critical queries: ownership check,
    /// then a transaction of its own.
    pub async fn confirm_execute(
        self: &Arc<Self>,
        chat_id: &str,
        user_id: &str,
        stream_id: &str,
        message_id: &str,
        query_id: &str,
    ) -> NeoResult<()> {
        let chat = self
            .chats
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| NeoError::config(format!("chat {} not found", chat_id)))?;
        if chat.user_id != user_id {
            return Err(NeoError::config("unauthorized access to chat"));
        }

        let lock = self.chat_lock(chat_id).await;
        let _guard = lock.lock().await;

        let mut message = self
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| NeoError::config(format!("message {} not found", message_id)))?;
        let mut queries = message.queries.clone().unwrap_or_default();
        let position = queries
            .iter()
            .position(|q| q.id == query_id)
            .ok_or_else(|| NeoError::config(format!("query {} not found", query_id)))?;

        if queries[position].is_executed {
            return Err(NeoError::config("query was already executed"));
        }

        let connection = self.manager.get_connection(chat_id).await?;
        let driver = self.manager.driver_for(connection.database_type)?;
        let mut tx = driver.begin_tx(chat_id).await?;

        let kind = QueryKind::parse(queries[position].query_type.as_deref().unwrap_or_default());
        let result = tx.execute_query(&queries[position].query, kind).await?;

        if let Some(exec_error) = &result.error {
            tx.rollback().await?;
            queries[position].error = Some(exec_error.message.clone());
            message.queries = Some(queries);
            self.messages.update(&message).await?;

            self.emit(
                chat_id,
                stream_id,
                StreamEventKind::ExecutionError,
                json!({
                    "message_id": message.id,
                    "query_id": query_id,
                    "error": exec_error,
                }),
            )
            .await;
            self.bus.complete(chat_id, stream_id).await;
            return Ok(());
        }

        tx.commit().await?;
        queries[position].is_executed = true;
        queries[position].error = None;
        queries[position].execution_time_ms = Some(result.execution_time_ms);
        queries[position].execution_result = Some(result.result_json.clone());
        message.queries = Some(queries.clone());
        self.messages.update(&message).await?;

        self.emit(
            chat_id,
            stream_id,
            StreamEventKind::ExecutionResult,
            json!({
                "message_id": message.id,
                "results": [{
                    "query_id": query_id,
                    "is_executed": true,
                    "execution_time_ms": queries[position].execution_time_ms,
                    "execution_result": queries[position].execution_result,
                }],
            }),
        )
        .await;
        self.bus.complete(chat_id, stream_id).await;
        Ok(())
    }

    /// Runs a stored rollback query inside its own transaction and marks
    /// the original query rolled back.
    pub async fn rollback_query(
        self: &Arc<Self>,
        chat_id: &str,
        user_id: &str,
        stream_id: &str,
        message_id: &str,
        query_id: &str,
    ) -> NeoResult<()> {
        let chat = self
            .chats
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| NeoError::config(format!("chat {} not found", chat_id)))?;
        if chat.user_id != user_id {
            return Err(NeoError::config("unauthorized access to chat"));
        }

        let lock = self.chat_lock(chat_id).await;
        let _guard = lock.lock().await;

        let mut message = self
            .messages
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| NeoError::config(format!("message {} not found", message_id)))?;
        let mut queries = message.queries.clone().unwrap_or_default();
        let position = queries
            .iter()
            .position(|q| q.id == query_id)
            .ok_or_else(|| NeoError::config(format!("query {} not found", query_id)))?;

        if !queries[position].is_executed {
            return Err(NeoError::config("query was never executed"));
        }
        if queries[position].is_rolled_back {
            return Err(NeoError::config("query was already rolled back"));
        }
        let rollback_sql = queries[position]
            .rollback_query
            .clone()
            .ok_or_else(|| NeoError::config("query has no rollback"))?;

        let connection = self.manager.get_connection(chat_id).await?;
        let driver = self.manager.driver_for(connection.database_type)?;
        let mut tx = driver.begin_tx(chat_id).await?;

        let result = tx.execute_query(&rollback_sql, QueryKind::Other).await?;
        if let Some(exec_error) = &result.error {
            tx.rollback().await?;
            self.emit(
                chat_id,
                stream_id,
                StreamEventKind::ExecutionError,
                json!({
                    "message_id": message.id,
                    "query_id": query_id,
                    "error": exec_error,
                }),
            )
            .await;
            self.bus.complete(chat_id, stream_id).await;
            return Ok(());
        }

        tx.commit().await?;
        queries[position].is_rolled_back = true;
        message.queries = Some(queries);
        self.messages.update(&message).await?;

        self.emit(
            chat_id,
            stream_id,
            StreamEventKind::ExecutionResult,
            json!({
                "message_id": message.id,
                "results": [{ "query_id": query_id, "is_rolled_back": true }],
            }),
        )
        .await;
        self.bus.complete(chat_id, stream_id).await;
        Ok(())
    }

    /// Cancels in-flight processing for a stream. Idempotent; the
    /// processing task emits `response-cancelled` when it observes the
    /// signal.
    pub async fn cancel_processing(&self, chat_id: &str, stream_id: &str) {
        if let Some(handle) = self.active.lock().await.get(stream_id) {
            handle.cancel();
        }
        self.bus.cancel(chat_id, stream_id).await;
    }

    async fn persist_assistant_error(
        &self,
        chat_id: &str,
        user_id: &str,
        message_id: &str,
        err: &NeoError,
    ) {
        let content = format!("I ran into a problem: {}", err.message);
        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            role: MessageRole::Assistant,
            content: content.clone(),
            queries: None,
            created_at: Utc::now(),
        };
        if let Err(persist_err) = self.messages.create(message).await {
            warn!(chat_id, error = %persist_err, "failed to persist assistant error message");
        }
        let record = LlmMessageRecord {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            role: MessageRole::Assistant,
            content: json!({ "assistant_response": { "assistantMessage": content, "queries": [] } }),
            created_at: Utc::now(),
        };
        if let Err(persist_err) = self.llm_messages.create(record).await {
            warn!(chat_id, error = %persist_err, "failed to persist assistant error history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{ConnectionManagerConfig, OwnershipVerifier};
    use crate::crypto::FieldCipher;
    use crate::drivers::DriverRegistry;
    use crate::llm::{LlmStructuredResponse, ModelInfo, QueryInfo};
    use crate::repositories::{ChatOwnership, MemoryStore};
    use crate::testutil::{table, FakeDriver};
    use crate::types::{DatabaseType, StoredConnectionConfig};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct FakeLlm {
        replies: StdMutex<VecDeque<NeoResult<LlmStructuredResponse>>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FakeLlm {
        fn with_replies(replies: Vec<NeoResult<LlmStructuredResponse>>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(replies.into()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(reply: LlmStructuredResponse, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(vec![Ok(reply)].into()),
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmClient for FakeLlm {
        async fn generate_response(
            &self,
            cancel: &CancelHandle,
            _history: &[LlmMessageRecord],
            _database_type: DatabaseType,
        ) -> NeoResult<LlmStructuredResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(NeoError::cancelled()),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(reply_with(vec![])))
        }

        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                name: "fake".into(),
                provider: "fake".into(),
                max_completion_tokens: 1000,
            }
        }
    }

    fn reply_with(queries: Vec<QueryInfo>) -> LlmStructuredResponse {
        LlmStructuredResponse {
            assistant_message: "here you go".into(),
            queries,
            action_buttons: Vec::new(),
        }
    }

    fn query_info(query: &str, critical: bool) -> QueryInfo {
        serde_json::from_value(json!({
            "query": query,
            "queryType": if critical { "DELETE" } else { "SELECT" },
            "isCritical": critical,
            "canRollback": critical,
            "explanation": "test query",
            "estimateResponseTime": 10,
            "rollbackQuery": if critical { json!("INSERT INTO restore") } else { serde_json::Value::Null },
        }))
        .unwrap()
    }

    struct Harness {
        pipeline: Arc<ChatPipeline>,
        driver: Arc<FakeDriver>,
        store: Arc<MemoryStore>,
        bus: Arc<StreamBus>,
        llm: Arc<FakeLlm>,
    }

    async fn harness(llm: Arc<FakeLlm>, auto_execute: bool) -> Harness {
        let driver = Arc::new(FakeDriver::new(vec![table("orders", &["id", "total"])]));
        let mut registry = DriverRegistry::new();
        registry.register(DatabaseType::PostgreSql, driver.clone());

        let cipher = Arc::new(FieldCipher::from_secret("test-secret").unwrap());
        let bus = Arc::new(StreamBus::new(
            Duration::from_millis(100),
            Duration::from_secs(30),
        ));
        let store = MemoryStore::new();
        let ownership: Arc<dyn OwnershipVerifier> =
            Arc::new(ChatOwnership::new(store.clone()));

        let manager = ConnectionManager::new(
            Arc::new(registry),
            cipher.clone(),
            bus.clone(),
            ownership,
            ConnectionManagerConfig::default(),
        );

        let chat = Chat {
            id: "c1".into(),
            user_id: "u1".into(),
            connection: StoredConnectionConfig {
                database_type: DatabaseType::PostgreSql,
                host: "localhost".into(),
                port: Some("5432".into()),
                username: "app".into(),
                password: Some(cipher.encrypt("secret").unwrap()),
                database: "app".into(),
                use_ssl: false,
                ssl_cert_url: None,
                ssl_key_url: None,
                ssl_root_cert_url: None,
            },
            selected_collections: "ALL".into(),
            auto_execute_query: auto_execute,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        ChatRepository::create(store.as_ref(), chat.clone()).await.unwrap();
        manager
            .connect("c1", "u1", "status-stream", &chat.connection)
            .await
            .unwrap();

        let pipeline = ChatPipeline::new(
            manager,
            Arc::new(SchemaService::new()),
            llm.clone(),
            bus.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
        );

        Harness { pipeline, driver, store, bus, llm }
    }

    async fn drain_events(sub: &mut crate::streams::StreamSubscription) -> Vec<StreamResponse> {
        let mut events = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_millis(200), sub.receiver.recv()).await {
                Ok(Some(event)) => {
                    let is_complete = event.event == StreamEventKind::Complete;
                    events.push(event);
                    if is_complete {
                        break;
                    }
                }
                _ => break,
            }
        }
        events
    }

    fn kinds(events: &[StreamResponse]) -> Vec<StreamEventKind> {
        events.iter().map(|e| e.event).collect()
    }

    #[tokio::test]
    async fn auto_executes_non_critical_queries_in_a_transaction() {
        let llm = FakeLlm::with_replies(vec![Ok(reply_with(vec![query_info(
            "SELECT id, total FROM orders ORDER BY created_at DESC LIMIT 5",
            false,
        )]))]);
        let h = harness(llm, true).await;

        let mut sub = h.bus.subscribe("c1", "u1", "s1").await;
        let message = h
            .pipeline
            .handle_user_message("c1", "u1", "s1", "list 5 recent orders")
            .await
            .unwrap();
        h.pipeline
            .process_message("c1", "u1", "s1", &message.id)
            .await;

        let events = drain_events(&mut sub).await;
        let kinds = kinds(&events);
        assert!(kinds.contains(&StreamEventKind::AiResponseStep));
        assert!(kinds.contains(&StreamEventKind::AiResponse));
        assert!(kinds.contains(&StreamEventKind::ExecutionResult));
        assert_eq!(*kinds.last().unwrap(), StreamEventKind::Complete);

        assert_eq!(
            h.driver.tx_log.lock().unwrap().as_slice(),
            ["begin", "commit"]
        );
        assert!(h
            .driver
            .executed
            .lock()
            .unwrap()
            .iter()
            .any(|q| q.contains("LIMIT 5")));
    }

    #[tokio::test]
    async fn critical_queries_wait_for_confirmation() {
        let llm = FakeLlm::with_replies(vec![Ok(reply_with(vec![query_info(
            "DELETE FROM users",
            true,
        )]))]);
        let h = harness(llm, true).await;

        let mut sub = h.bus.subscribe("c1", "u1", "s1").await;
        let message = h
            .pipeline
            .handle_user_message("c1", "u1", "s1", "delete all users")
            .await
            .unwrap();
        h.pipeline
            .process_message("c1", "u1", "s1", &message.id)
            .await;

        let events = drain_events(&mut sub).await;
        assert!(kinds(&events).contains(&StreamEventKind::AiResponse));
        assert!(!kinds(&events).contains(&StreamEventKind::ExecutionResult));
        assert!(h.driver.tx_log.lock().unwrap().is_empty());

        // Pull the persisted assistant message to confirm its query.
        let (messages, _) = MessageRepository::list_by_chat(h.store.as_ref(), "c1", 1, 50)
            .await
            .unwrap();
        let assistant = messages
            .iter()
            .find(|m| m.role == MessageRole::Assistant)
            .unwrap();
        let query = &assistant.queries.as_ref().unwrap()[0];
        assert!(query.is_critical);
        assert!(query.rollback_query.is_some());
        assert!(!query.is_executed);

        let mut confirm_sub = h.bus.subscribe("c1", "u1", "s2").await;
        h.pipeline
            .confirm_execute("c1", "u1", "s2", &assistant.id, &query.id)
            .await
            .unwrap();

        let confirm_events = drain_events(&mut confirm_sub).await;
        let confirm_kinds = kinds(&confirm_events);
        assert!(confirm_kinds.contains(&StreamEventKind::ExecutionResult));
        assert_eq!(*confirm_kinds.last().unwrap(), StreamEventKind::Complete);
        assert_eq!(
            h.driver.tx_log.lock().unwrap().as_slice(),
            ["begin", "commit"]
        );
    }

    #[tokio::test]
    async fn cancel_mid_llm_call_emits_response_cancelled() {
        let llm = FakeLlm::slow(
            reply_with(vec![query_info("SELECT 1", false)]),
            Duration::from_millis(500),
        );
        let h = harness(llm, true).await;

        let mut sub = h.bus.subscribe("c1", "u1", "s1").await;
        let message = h
            .pipeline
            .handle_user_message("c1", "u1", "s1", "slow question")
            .await
            .unwrap();

        let pipeline = h.pipeline.clone();
        let cancel_task = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                pipeline.cancel_processing("c1", "s1").await;
            })
        };
        pipeline.process_message("c1", "u1", "s1", &message.id).await;
        cancel_task.await.unwrap();

        let events = drain_events(&mut sub).await;
        let kinds = kinds(&events);
        assert!(kinds.contains(&StreamEventKind::ResponseCancelled));
        assert!(!kinds.contains(&StreamEventKind::AiResponse));
        assert!(h.driver.tx_log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_statement_rolls_back_the_batch() {
        let llm = FakeLlm::with_replies(vec![Ok(reply_with(vec![
            query_info("UPDATE orders SET total = 0", false),
            query_info("UPDATE broken SET x = 1", false),
        ]))]);
        let h = harness(llm, true).await;
        *h.driver.fail_statement_containing.lock().unwrap() = Some("broken".into());

        let mut sub = h.bus.subscribe("c1", "u1", "s1").await;
        let message = h
            .pipeline
            .handle_user_message("c1", "u1", "s1", "update everything")
            .await
            .unwrap();
        h.pipeline
            .process_message("c1", "u1", "s1", &message.id)
            .await;

        let events = drain_events(&mut sub).await;
        assert!(kinds(&events).contains(&StreamEventKind::ExecutionError));
        assert!(!kinds(&events).contains(&StreamEventKind::ExecutionResult));
        assert_eq!(
            h.driver.tx_log.lock().unwrap().as_slice(),
            ["begin", "rollback"]
        );
    }

    #[tokio::test]
    async fn schema_drift_inserts_system_history_entry() {
        let llm = FakeLlm::with_replies(vec![
            Ok(reply_with(vec![])),
            Ok(reply_with(vec![])),
        ]);
        let h = harness(llm, false).await;

        let message = h
            .pipeline
            .handle_user_message("c1", "u1", "s1", "first message")
            .await
            .unwrap();
        h.pipeline
            .process_message("c1", "u1", "s1", &message.id)
            .await;

        // Out-of-band ALTER: a column appears.
        h.driver
            .set_tables(vec![table("orders", &["id", "total", "status"])]);

        let second = h
            .pipeline
            .handle_user_message("c1", "u1", "s2", "second message")
            .await
            .unwrap();
        h.pipeline
            .process_message("c1", "u1", "s2", &second.id)
            .await;

        let history = LlmMessageRepository::list_by_chat(h.store.as_ref(), "c1")
            .await
            .unwrap();
        let updates: Vec<&LlmMessageRecord> = history
            .iter()
            .filter(|r| r.role == MessageRole::System)
            .collect();
        // First message seeds the cache (no diff recorded as a change set
        // with added tables counts too), second sees the added column.
        let last_update = updates.last().unwrap();
        let text = last_update.content["schema_update"].as_str().unwrap();
        assert!(text.contains("status"));
        assert!(text.contains("Changes:"));
    }

    #[tokio::test]
    async fn invalid_llm_reply_is_retried_once() {
        let llm = FakeLlm::with_replies(vec![
            Err(NeoError::invalid_response("bad", "raw")),
            Ok(reply_with(vec![])),
        ]);
        let h = harness(llm, false).await;

        let mut sub = h.bus.subscribe("c1", "u1", "s1").await;
        let message = h
            .pipeline
            .handle_user_message("c1", "u1", "s1", "hello")
            .await
            .unwrap();
        h.pipeline
            .process_message("c1", "u1", "s1", &message.id)
            .await;

        let events = drain_events(&mut sub).await;
        assert!(kinds(&events).contains(&StreamEventKind::AiResponse));
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_connection_surfaces_ai_response_error() {
        let llm = FakeLlm::with_replies(vec![Ok(reply_with(vec![]))]);
        let h = harness(llm, false).await;
        h.pipeline.manager.disconnect("c1", "u1").await.unwrap();

        let mut sub = h.bus.subscribe("c1", "u1", "s1").await;
        let message = h
            .pipeline
            .handle_user_message("c1", "u1", "s1", "hello")
            .await
            .unwrap();
        h.pipeline
            .process_message("c1", "u1", "s1", &message.id)
            .await;

        let events = drain_events(&mut sub).await;
        let error = events
            .iter()
            .find(|e| e.event == StreamEventKind::AiResponseError)
            .unwrap();
        assert!(error.data["error"].as_str().unwrap().contains("NOT_CONNECTED"));

        // History stays consistent: an assistant-side record was persisted.
        let (messages, _) = MessageRepository::list_by_chat(h.store.as_ref(), "c1", 1, 50)
            .await
            .unwrap();
        assert!(messages.iter().any(|m| m.role == MessageRole::Assistant));
    }

    #[tokio::test]
    async fn rollback_path_marks_query_rolled_back() {
        let llm = FakeLlm::with_replies(vec![Ok(reply_with(vec![query_info(
            "DELETE FROM users",
            true,
        )]))]);
        let h = harness(llm, true).await;

        let message = h
            .pipeline
            .handle_user_message("c1", "u1", "s1", "delete all users")
            .await
            .unwrap();
        h.pipeline
            .process_message("c1", "u1", "s1", &message.id)
            .await;

        let (messages, _) = MessageRepository::list_by_chat(h.store.as_ref(), "c1", 1, 50)
            .await
            .unwrap();
        let assistant = messages
            .iter()
            .find(|m| m.role == MessageRole::Assistant)
            .unwrap();
        let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

        h.pipeline
            .confirm_execute("c1", "u1", "s2", &assistant.id, &query_id)
            .await
            .unwrap();
        h.pipeline
            .rollback_query("c1", "u1", "s3", &assistant.id, &query_id)
            .await
            .unwrap();

        let updated = MessageRepository::find_by_id(h.store.as_ref(), &assistant.id)
            .await
            .unwrap()
            .unwrap();
        let query = &updated.queries.as_ref().unwrap()[0];
        assert!(query.is_executed);
        assert!(query.is_rolled_back);
        assert!(h
            .driver
            .executed
            .lock()
            .unwrap()
            .iter()
            .any(|q| q.contains("INSERT INTO restore")));
    }
}
