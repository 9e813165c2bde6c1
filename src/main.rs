//! NeoBase server: constructor composition at boot, thin HTTP/SSE surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use neobase_runtime::config::Config;
use neobase_runtime::connections::{ConnectionManager, ConnectionManagerConfig};
use neobase_runtime::crypto::FieldCipher;
use neobase_runtime::drivers::DriverRegistry;
use neobase_runtime::errors::{ErrorCode, NeoError};
use neobase_runtime::llm::providers::{gemini::GeminiClient, ollama::OllamaClient, openai::OpenAiClient};
use neobase_runtime::llm::LlmClient;
use neobase_runtime::pipeline::ChatPipeline;
use neobase_runtime::repositories::{
    ChatOwnership, ChatRepository, LlmMessageRepository, MessageRepository, MongoStore,
};
use neobase_runtime::schema::SchemaService;
use neobase_runtime::streams::StreamBus;
use neobase_runtime::types::{Chat, ConnectionConfig};

#[derive(Clone)]
struct AppState {
    manager: Arc<ConnectionManager>,
    pipeline: Arc<ChatPipeline>,
    bus: Arc<StreamBus>,
    chats: Arc<dyn ChatRepository>,
    messages: Arc<dyn MessageRepository>,
    llm_messages: Arc<dyn LlmMessageRepository>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!(port = config.port, "starting NeoBase");

    let cipher = Arc::new(FieldCipher::from_secret(&config.schema_encryption_key)?);

    let mongo = mongodb::Client::with_uri_str(&config.mongo_uri).await?;
    let store = Arc::new(MongoStore::new(&mongo.database(&config.mongo_database)));
    let chats: Arc<dyn ChatRepository> = store.clone();
    let messages: Arc<dyn MessageRepository> = store.clone();
    let llm_messages: Arc<dyn LlmMessageRepository> = store.clone();

    let bus = Arc::new(StreamBus::new(config.publish_timeout, config.keepalive_interval));
    let registry = Arc::new(DriverRegistry::with_default_drivers());
    let ownership = Arc::new(ChatOwnership::new(chats.clone()));
    let manager = ConnectionManager::new(
        registry,
        cipher,
        bus.clone(),
        ownership,
        ConnectionManagerConfig {
            idle_ttl: config.idle_ttl,
            reap_interval: config.reap_interval,
        },
    );
    manager.spawn_reaper();

    let llm: Arc<dyn LlmClient> = match config.default_llm_client {
        neobase_runtime::config::LlmProviderKind::OpenAi => {
            Arc::new(OpenAiClient::new(config.openai.clone(), config.llm_timeout)?)
        }
        neobase_runtime::config::LlmProviderKind::Gemini => {
            Arc::new(GeminiClient::new(config.gemini.clone(), config.llm_timeout)?)
        }
        neobase_runtime::config::LlmProviderKind::Ollama => {
            Arc::new(OllamaClient::new(config.ollama.clone(), config.llm_timeout))
        }
    };
    info!(model = %llm.model_info().name, provider = %llm.model_info().provider, "LLM client ready");

    let pipeline = ChatPipeline::new(
        manager.clone(),
        Arc::new(SchemaService::new()),
        llm,
        bus.clone(),
        chats.clone(),
        messages.clone(),
        llm_messages.clone(),
    );

    let state = AppState {
        manager,
        pipeline,
        bus,
        chats,
        messages,
        llm_messages,
    };

    let app = Router::new()
        .route("/chat", post(create_chat).get(list_chats))
        .route(
            "/chat/:id",
            get(get_chat).patch(update_chat).delete(delete_chat),
        )
        .route("/chat/:id/messages", post(create_message).get(list_messages))
        .route("/chat/:id/stream", get(response_stream))
        .route("/chat/:id/db/stream", get(db_status_stream))
        .route("/chat/:id/db/connect", post(connect_db))
        .route("/chat/:id/db/disconnect", post(disconnect_db))
        .route("/chat/:id/queries/confirm", post(confirm_query))
        .route("/chat/:id/queries/rollback", post(rollback_query))
        .route("/chat/:id/cancel", post(cancel_stream))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Authentication is a collaborator, not part of this service: the caller
/// identity arrives pre-verified in a header.
fn user_id(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

fn error_response(err: NeoError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err.code {
        ErrorCode::Config | ErrorCode::InvalidResponse => StatusCode::BAD_REQUEST,
        ErrorCode::NotConnected => StatusCode::CONFLICT,
        ErrorCode::Cancelled => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string(), "code": err.code })))
}

#[derive(Deserialize)]
struct CreateChatRequest {
    connection: ConnectionConfig,
    #[serde(default)]
    auto_execute_query: bool,
    #[serde(default)]
    selected_collections: Option<String>,
}

async fn create_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateChatRequest>,
) -> impl IntoResponse {
    let user_id = user_id(&headers);
    if let Err(err) = request.connection.validate() {
        return error_response(err).into_response();
    }
    let stored = match state.manager.encrypt_config(&request.connection) {
        Ok(stored) => stored,
        Err(err) => return error_response(err).into_response(),
    };

    let chat = Chat {
        id: Uuid::new_v4().to_string(),
        user_id,
        connection: stored,
        selected_collections: request
            .selected_collections
            .unwrap_or_else(|| "ALL".to_string()),
        auto_execute_query: request.auto_execute_query,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    match state.chats.create(chat).await {
        Ok(chat) => (StatusCode::CREATED, Json(json!(chat))).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn get_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> impl IntoResponse {
    match owned_chat(&state, &chat_id, &user_id(&headers)).await {
        Ok(chat) => Json(json!(chat)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
struct UpdateChatRequest {
    connection: Option<ConnectionConfig>,
    auto_execute_query: Option<bool>,
    selected_collections: Option<String>,
}

async fn update_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(request): Json<UpdateChatRequest>,
) -> impl IntoResponse {
    let mut chat = match owned_chat(&state, &chat_id, &user_id(&headers)).await {
        Ok(chat) => chat,
        Err(err) => return error_response(err).into_response(),
    };

    if let Some(connection) = request.connection {
        if let Err(err) = connection.validate() {
            return error_response(err).into_response();
        }
        chat.connection = match state.manager.encrypt_config(&connection) {
            Ok(stored) => stored,
            Err(err) => return error_response(err).into_response(),
        };
    }
    if let Some(auto) = request.auto_execute_query {
        chat.auto_execute_query = auto;
    }
    if let Some(selected) = request.selected_collections {
        chat.selected_collections = selected;
    }
    chat.updated_at = Utc::now();

    match state.chats.update(&chat).await {
        Ok(()) => Json(json!(chat)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn delete_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = owned_chat(&state, &chat_id, &user_id(&headers)).await {
        return error_response(err).into_response();
    }
    let result = async {
        state.chats.delete(&chat_id).await?;
        state.messages.delete_by_chat(&chat_id).await?;
        state.llm_messages.delete_by_chat(&chat_id).await
    }
    .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: u64,
    #[serde(default = "default_page_size")]
    page_size: u64,
}

fn default_page() -> u64 {
    1
}

fn default_page_size() -> u64 {
    20
}

async fn list_chats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> impl IntoResponse {
    match state
        .chats
        .list_by_user(&user_id(&headers), page.page, page.page_size)
        .await
    {
        Ok((chats, total)) => Json(json!({ "chats": chats, "total": total })).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
struct CreateMessageRequest {
    content: String,
    #[serde(rename = "streamId")]
    stream_id: String,
}

async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(request): Json<CreateMessageRequest>,
) -> impl IntoResponse {
    let user_id = user_id(&headers);
    if let Err(err) = owned_chat(&state, &chat_id, &user_id).await {
        return error_response(err).into_response();
    }

    match state
        .pipeline
        .handle_user_message(&chat_id, &user_id, &request.stream_id, &request.content)
        .await
    {
        Ok(message) => {
            state
                .pipeline
                .spawn_processing(&chat_id, &user_id, &request.stream_id, &message.id);
            (StatusCode::ACCEPTED, Json(json!(message))).into_response()
        }
        Err(err) => error_response(err).into_response(),
    }
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> impl IntoResponse {
    if let Err(err) = owned_chat(&state, &chat_id, &user_id(&headers)).await {
        return error_response(err).into_response();
    }
    match state
        .messages
        .list_by_chat(&chat_id, page.page, page.page_size)
        .await
    {
        Ok((messages, total)) => {
            Json(json!({ "messages": messages, "total": total })).into_response()
        }
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
struct StreamQuery {
    #[serde(rename = "streamId")]
    stream_id: String,
}

async fn response_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> axum::response::Response {
    let user_id = user_id(&headers);
    if let Err(err) = owned_chat(&state, &chat_id, &user_id).await {
        return error_response(err).into_response();
    }
    sse_for_subscription(&state, &chat_id, &user_id, &query.stream_id)
        .await
        .into_response()
}

async fn db_status_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> axum::response::Response {
    let user_id = user_id(&headers);
    if let Err(err) = owned_chat(&state, &chat_id, &user_id).await {
        return error_response(err).into_response();
    }
    if let Err(err) = state
        .manager
        .subscribe(&chat_id, &user_id, &query.stream_id)
        .await
    {
        return error_response(err).into_response();
    }
    sse_for_subscription(&state, &chat_id, &user_id, &query.stream_id)
        .await
        .into_response()
}

async fn sse_for_subscription(
    state: &AppState,
    chat_id: &str,
    user_id: &str,
    stream_id: &str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.bus.subscribe(chat_id, user_id, stream_id).await;
    let stream = stream::unfold(subscription.receiver, |mut receiver| async move {
        receiver.recv().await.map(|response| (response, receiver))
    })
    .map(|response| {
        let event = Event::default()
            .event(response.event.as_str())
            .data(response.data.to_string());
        Ok(event)
    });
    Sse::new(stream)
}

async fn connect_db(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let user_id = user_id(&headers);
    let chat = match owned_chat(&state, &chat_id, &user_id).await {
        Ok(chat) => chat,
        Err(err) => return error_response(err).into_response(),
    };
    match state
        .manager
        .connect(&chat_id, &user_id, &query.stream_id, &chat.connection)
        .await
    {
        Ok(()) => Json(json!({ "status": "connected" })).into_response(),
        Err(err) => {
            error!(chat_id, error = %err, "connect failed");
            error_response(err).into_response()
        }
    }
}

async fn disconnect_db(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.disconnect(&chat_id, &user_id(&headers)).await {
        Ok(()) => Json(json!({ "status": "disconnected" })).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
struct QueryActionRequest {
    #[serde(rename = "messageId")]
    message_id: String,
    #[serde(rename = "queryId")]
    query_id: String,
    #[serde(rename = "streamId")]
    stream_id: String,
}

async fn confirm_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(request): Json<QueryActionRequest>,
) -> impl IntoResponse {
    match state
        .pipeline
        .confirm_execute(
            &chat_id,
            &user_id(&headers),
            &request.stream_id,
            &request.message_id,
            &request.query_id,
        )
        .await
    {
        Ok(()) => Json(json!({ "status": "accepted" })).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn rollback_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
    Json(request): Json<QueryActionRequest>,
) -> impl IntoResponse {
    match state
        .pipeline
        .rollback_query(
            &chat_id,
            &user_id(&headers),
            &request.stream_id,
            &request.message_id,
            &request.query_id,
        )
        .await
    {
        Ok(()) => Json(json!({ "status": "accepted" })).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn cancel_stream(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    state.pipeline.cancel_processing(&chat_id, &query.stream_id).await;
    Json(json!({ "status": "cancelled" }))
}

async fn owned_chat(state: &AppState, chat_id: &str, user_id: &str) -> Result<Chat, NeoError> {
    let chat = state
        .chats
        .find_by_id(chat_id)
        .await?
        .ok_or_else(|| NeoError::config(format!("chat {} not found", chat_id)))?;
    if chat.user_id != user_id {
        return Err(NeoError::config("unauthorized access to chat"));
    }
    Ok(chat)
}
