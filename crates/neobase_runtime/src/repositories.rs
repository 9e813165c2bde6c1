//! Chat, message and LLM-message persistence.
//!
//! The pipeline talks to traits; composition picks the MongoDB
//! implementation in the binary and the in-memory one in tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::FindOptions;
use mongodb::Database;
use tokio::sync::RwLock;

use crate::connections::OwnershipVerifier;
use crate::errors::{NeoError, NeoResult};
use crate::types::{Chat, LlmMessageRecord, Message};

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn create(&self, chat: Chat) -> NeoResult<Chat>;
    async fn find_by_id(&self, chat_id: &str) -> NeoResult<Option<Chat>>;
    async fn update(&self, chat: &Chat) -> NeoResult<()>;
    async fn delete(&self, chat_id: &str) -> NeoResult<()>;
    async fn list_by_user(
        &self,
        user_id: &str,
        page: u64,
        page_size: u64,
    ) -> NeoResult<(Vec<Chat>, u64)>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, message: Message) -> NeoResult<Message>;
    async fn find_by_id(&self, message_id: &str) -> NeoResult<Option<Message>>;
    async fn update(&self, message: &Message) -> NeoResult<()>;
    async fn list_by_chat(
        &self,
        chat_id: &str,
        page: u64,
        page_size: u64,
    ) -> NeoResult<(Vec<Message>, u64)>;
    async fn delete_by_chat(&self, chat_id: &str) -> NeoResult<()>;
}

#[async_trait]
pub trait LlmMessageRepository: Send + Sync {
    async fn create(&self, record: LlmMessageRecord) -> NeoResult<LlmMessageRecord>;
    /// Chronological history for one chat.
    async fn list_by_chat(&self, chat_id: &str) -> NeoResult<Vec<LlmMessageRecord>>;
    async fn delete_by_chat(&self, chat_id: &str) -> NeoResult<()>;
}

/// Bridges chat ownership checks into the connection manager.
pub struct ChatOwnership {
    chats: Arc<dyn ChatRepository>,
}

impl ChatOwnership {
    pub fn new(chats: Arc<dyn ChatRepository>) -> Self {
        Self { chats }
    }
}

#[async_trait]
impl OwnershipVerifier for ChatOwnership {
    async fn verify(&self, chat_id: &str, user_id: &str) -> NeoResult<()> {
        let chat = self
            .chats
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| NeoError::config(format!("chat {} not found", chat_id)))?;
        if chat.user_id != user_id {
            return Err(NeoError::config("unauthorized access to chat"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation

#[derive(Default)]
pub struct MemoryStore {
    chats: RwLock<HashMap<String, Chat>>,
    messages: RwLock<Vec<Message>>,
    llm_messages: RwLock<Vec<LlmMessageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ChatRepository for MemoryStore {
    async fn create(&self, chat: Chat) -> NeoResult<Chat> {
        self.chats.write().await.insert(chat.id.clone(), chat.clone());
        Ok(chat)
    }

    async fn find_by_id(&self, chat_id: &str) -> NeoResult<Option<Chat>> {
        Ok(self.chats.read().await.get(chat_id).cloned())
    }

    async fn update(&self, chat: &Chat) -> NeoResult<()> {
        let mut chats = self.chats.write().await;
        if !chats.contains_key(&chat.id) {
            return Err(NeoError::database(format!("chat {} not found", chat.id)));
        }
        chats.insert(chat.id.clone(), chat.clone());
        Ok(())
    }

    async fn delete(&self, chat_id: &str) -> NeoResult<()> {
        self.chats.write().await.remove(chat_id);
        Ok(())
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        page: u64,
        page_size: u64,
    ) -> NeoResult<(Vec<Chat>, u64)> {
        let chats = self.chats.read().await;
        let mut matching: Vec<Chat> = chats
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as u64;
        let page = page.max(1);
        let start = ((page - 1) * page_size) as usize;
        let items = matching.into_iter().skip(start).take(page_size as usize).collect();
        Ok((items, total))
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create(&self, message: Message) -> NeoResult<Message> {
        self.messages.write().await.push(message.clone());
        Ok(message)
    }

    async fn find_by_id(&self, message_id: &str) -> NeoResult<Option<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .find(|m| m.id == message_id)
            .cloned())
    }

    async fn update(&self, message: &Message) -> NeoResult<()> {
        let mut messages = self.messages.write().await;
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                *existing = message.clone();
                Ok(())
            }
            None => Err(NeoError::database(format!("message {} not found", message.id))),
        }
    }

    async fn list_by_chat(
        &self,
        chat_id: &str,
        page: u64,
        page_size: u64,
    ) -> NeoResult<(Vec<Message>, u64)> {
        let messages = self.messages.read().await;
        let matching: Vec<Message> = messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        let total = matching.len() as u64;
        let page = page.max(1);
        let start = ((page - 1) * page_size) as usize;
        let items = matching.into_iter().skip(start).take(page_size as usize).collect();
        Ok((items, total))
    }

    async fn delete_by_chat(&self, chat_id: &str) -> NeoResult<()> {
        self.messages.write().await.retain(|m| m.chat_id != chat_id);
        Ok(())
    }
}

#[async_trait]
impl LlmMessageRepository for MemoryStore {
    async fn create(&self, record: LlmMessageRecord) -> NeoResult<LlmMessageRecord> {
        self.llm_messages.write().await.push(record.clone());
        Ok(record)
    }

    async fn list_by_chat(&self, chat_id: &str) -> NeoResult<Vec<LlmMessageRecord>> {
        let records = self.llm_messages.read().await;
        let mut matching: Vec<LlmMessageRecord> = records
            .iter()
            .filter(|r| r.chat_id == chat_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }

    async fn delete_by_chat(&self, chat_id: &str) -> NeoResult<()> {
        self.llm_messages.write().await.retain(|r| r.chat_id != chat_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MongoDB implementation

pub struct MongoStore {
    chats: mongodb::Collection<Document>,
    messages: mongodb::Collection<Document>,
    llm_messages: mongodb::Collection<Document>,
}

impl MongoStore {
    pub fn new(database: &Database) -> Self {
        Self {
            chats: database.collection("chats"),
            messages: database.collection("messages"),
            llm_messages: database.collection("llm_messages"),
        }
    }

    fn encode<T: serde::Serialize>(value: &T) -> NeoResult<Document> {
        mongodb::bson::to_document(value)
            .map_err(|e| NeoError::database(format!("bson encode failed: {}", e)))
    }

    fn decode<T: serde::de::DeserializeOwned>(document: Document) -> NeoResult<T> {
        mongodb::bson::from_document(document)
            .map_err(|e| NeoError::database(format!("bson decode failed: {}", e)))
    }

    fn db_err(err: mongodb::error::Error) -> NeoError {
        NeoError::database(err.to_string())
    }
}

#[async_trait]
impl ChatRepository for MongoStore {
    async fn create(&self, chat: Chat) -> NeoResult<Chat> {
        self.chats
            .insert_one(Self::encode(&chat)?, None)
            .await
            .map_err(Self::db_err)?;
        Ok(chat)
    }

    async fn find_by_id(&self, chat_id: &str) -> NeoResult<Option<Chat>> {
        let found = self
            .chats
            .find_one(doc! {"id": chat_id}, None)
            .await
            .map_err(Self::db_err)?;
        found.map(Self::decode).transpose()
    }

    async fn update(&self, chat: &Chat) -> NeoResult<()> {
        self.chats
            .replace_one(doc! {"id": &chat.id}, Self::encode(chat)?, None)
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }

    async fn delete(&self, chat_id: &str) -> NeoResult<()> {
        self.chats
            .delete_one(doc! {"id": chat_id}, None)
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        page: u64,
        page_size: u64,
    ) -> NeoResult<(Vec<Chat>, u64)> {
        let filter = doc! {"user_id": user_id};
        let total = self
            .chats
            .count_documents(filter.clone(), None)
            .await
            .map_err(Self::db_err)?;

        let page = page.max(1);
        let options = FindOptions::builder()
            .sort(doc! {"created_at": -1})
            .skip((page - 1) * page_size)
            .limit(page_size as i64)
            .build();
        let documents: Vec<Document> = self
            .chats
            .find(filter, options)
            .await
            .map_err(Self::db_err)?
            .try_collect()
            .await
            .map_err(Self::db_err)?;
        let chats = documents
            .into_iter()
            .map(Self::decode)
            .collect::<NeoResult<Vec<Chat>>>()?;
        Ok((chats, total))
    }
}

#[async_trait]
impl MessageRepository for MongoStore {
    async fn create(&self, message: Message) -> NeoResult<Message> {
        self.messages
            .insert_one(Self::encode(&message)?, None)
            .await
            .map_err(Self::db_err)?;
        Ok(message)
    }

    async fn find_by_id(&self, message_id: &str) -> NeoResult<Option<Message>> {
        let found = self
            .messages
            .find_one(doc! {"id": message_id}, None)
            .await
            .map_err(Self::db_err)?;
        found.map(Self::decode).transpose()
    }

    async fn update(&self, message: &Message) -> NeoResult<()> {
        self.messages
            .replace_one(doc! {"id": &message.id}, Self::encode(message)?, None)
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }

    async fn list_by_chat(
        &self,
        chat_id: &str,
        page: u64,
        page_size: u64,
    ) -> NeoResult<(Vec<Message>, u64)> {
        let filter = doc! {"chat_id": chat_id};
        let total = self
            .messages
            .count_documents(filter.clone(), None)
            .await
            .map_err(Self::db_err)?;

        let page = page.max(1);
        let options = FindOptions::builder()
            .sort(doc! {"created_at": 1})
            .skip((page - 1) * page_size)
            .limit(page_size as i64)
            .build();
        let documents: Vec<Document> = self
            .messages
            .find(filter, options)
            .await
            .map_err(Self::db_err)?
            .try_collect()
            .await
            .map_err(Self::db_err)?;
        let messages = documents
            .into_iter()
            .map(Self::decode)
            .collect::<NeoResult<Vec<Message>>>()?;
        Ok((messages, total))
    }

    async fn delete_by_chat(&self, chat_id: &str) -> NeoResult<()> {
        self.messages
            .delete_many(doc! {"chat_id": chat_id}, None)
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }
}

#[async_trait]
impl LlmMessageRepository for MongoStore {
    async fn create(&self, record: LlmMessageRecord) -> NeoResult<LlmMessageRecord> {
        self.llm_messages
            .insert_one(Self::encode(&record)?, None)
            .await
            .map_err(Self::db_err)?;
        Ok(record)
    }

    async fn list_by_chat(&self, chat_id: &str) -> NeoResult<Vec<LlmMessageRecord>> {
        let options = FindOptions::builder().sort(doc! {"created_at": 1}).build();
        let documents: Vec<Document> = self
            .llm_messages
            .find(doc! {"chat_id": chat_id}, options)
            .await
            .map_err(Self::db_err)?
            .try_collect()
            .await
            .map_err(Self::db_err)?;
        documents.into_iter().map(Self::decode).collect()
    }

    async fn delete_by_chat(&self, chat_id: &str) -> NeoResult<()> {
        self.llm_messages
            .delete_many(doc! {"chat_id": chat_id}, None)
            .await
            .map_err(Self::db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DatabaseType, MessageRole, StoredConnectionConfig};
    use chrono::Utc;

    fn chat(id: &str, user_id: &str) -> Chat {
        Chat {
            id: id.to_string(),
            user_id: user_id.to_string(),
            connection: StoredConnectionConfig {
                database_type: DatabaseType::PostgreSql,
                host: "localhost".into(),
                port: None,
                username: "app".into(),
                password: None,
                database: "app".into(),
                use_ssl: false,
                ssl_cert_url: None,
                ssl_key_url: None,
                ssl_root_cert_url: None,
            },
            selected_collections: "ALL".into(),
            auto_execute_query: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_store_pages_chats_by_user() {
        let store = MemoryStore::new();
        for i in 0..5 {
            ChatRepository::create(store.as_ref(), chat(&format!("c{}", i), "u1"))
                .await
                .unwrap();
        }
        ChatRepository::create(store.as_ref(), chat("other", "u2"))
            .await
            .unwrap();

        let (page1, total) = store.list_by_user("u1", 1, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page1.len(), 2);
        let (page3, _) = store.list_by_user("u1", 3, 2).await.unwrap();
        assert_eq!(page3.len(), 1);
    }

    #[tokio::test]
    async fn llm_history_is_chronological() {
        let store = MemoryStore::new();
        for i in 0..3i64 {
            LlmMessageRepository::create(
                store.as_ref(),
                LlmMessageRecord {
                    id: format!("m{}", i),
                    chat_id: "c1".into(),
                    message_id: format!("msg{}", i),
                    user_id: "u1".into(),
                    role: MessageRole::User,
                    content: serde_json::json!({"user_message": format!("turn {}", i)}),
                    created_at: Utc::now() + chrono::Duration::seconds(i),
                },
            )
            .await
            .unwrap();
        }

        let history = LlmMessageRepository::list_by_chat(store.as_ref(), "c1")
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, "m0");
        assert_eq!(history[2].id, "m2");
    }

    #[tokio::test]
    async fn ownership_rejects_foreign_user() {
        let store = MemoryStore::new();
        ChatRepository::create(store.as_ref(), chat("c1", "u1"))
            .await
            .unwrap();
        let ownership = ChatOwnership::new(store);

        assert!(ownership.verify("c1", "u1").await.is_ok());
        assert!(ownership.verify("c1", "u2").await.is_err());
        assert!(ownership.verify("missing", "u1").await.is_err());
    }
}
