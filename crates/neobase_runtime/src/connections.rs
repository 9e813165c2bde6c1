//! Connection manager: per-chat owned database connections.
//!
//! One live connection per chat, owned exclusively here. A per-chat async
//! mutex serialises connect/disconnect so two connects can never race; a
//! new connect displaces the old connection only after its disconnect has
//! run to completion. Status transitions are published to every stream
//! subscribed to the chat, a heartbeat task pings each live connection,
//! and a single reaper disconnects idle ones. Temp TLS files ride on the
//! connection entry and are removed on every disconnect path.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::FieldCipher;
use crate::drivers::DriverRegistry;
use crate::errors::{ErrorCode, NeoError, NeoResult};
use crate::streams::{CancelHandle, StreamBus};
use crate::types::{
    ConnectionConfig, ConnectionStatus, ConnectionView, DatabaseType, StoredConnectionConfig,
    StreamEventKind, StreamResponse,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Answers "does this chat belong to this user". Backed by the chat
/// repository at composition time.
#[async_trait]
pub trait OwnershipVerifier: Send + Sync {
    async fn verify(&self, chat_id: &str, user_id: &str) -> NeoResult<()>;
}

/// Manager-side record of a live connection. The engine handle itself
/// lives inside the driver, keyed by the same chat id.
#[derive(Debug, Clone)]
pub struct ManagedConnection {
    pub database_type: DatabaseType,
    pub view: ConnectionView,
    pub status: ConnectionStatus,
    pub last_used: Instant,
    pub subscribers: HashSet<String>,
    pub temp_files: Vec<PathBuf>,
}

#[derive(Clone)]
pub struct ConnectionManagerConfig {
    pub idle_ttl: Duration,
    pub reap_interval: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(15 * 60),
            reap_interval: Duration::from_secs(60),
        }
    }
}

pub struct ConnectionManager {
    registry: Arc<DriverRegistry>,
    cipher: Arc<FieldCipher>,
    bus: Arc<StreamBus>,
    ownership: Arc<dyn OwnershipVerifier>,
    connections: Arc<RwLock<HashMap<String, ManagedConnection>>>,
    chat_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    heartbeats: Mutex<HashMap<String, JoinHandle<()>>>,
    config: ConnectionManagerConfig,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<DriverRegistry>,
        cipher: Arc<FieldCipher>,
        bus: Arc<StreamBus>,
        ownership: Arc<dyn OwnershipVerifier>,
        config: ConnectionManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cipher,
            bus,
            ownership,
            connections: Arc::new(RwLock::new(HashMap::new())),
            chat_locks: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            config,
        })
    }

    async fn chat_lock(&self, chat_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.chat_locks.lock().await;
        locks
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn decrypt_config(&self, stored: &StoredConnectionConfig) -> NeoResult<ConnectionConfig> {
        Ok(ConnectionConfig {
            database_type: stored.database_type,
            host: stored.host.clone(),
            port: stored.port.clone(),
            username: stored.username.clone(),
            password: self.cipher.decrypt_opt(stored.password.as_ref())?,
            database: stored.database.clone(),
            use_ssl: stored.use_ssl,
            ssl_cert_url: self.cipher.decrypt_opt(stored.ssl_cert_url.as_ref())?,
            ssl_key_url: self.cipher.decrypt_opt(stored.ssl_key_url.as_ref())?,
            ssl_root_cert_url: self.cipher.decrypt_opt(stored.ssl_root_cert_url.as_ref())?,
        })
    }

    /// Encrypts a plaintext config for persistence. Lives here so the
    /// cipher has exactly one owner.
    pub fn encrypt_config(&self, config: &ConnectionConfig) -> NeoResult<StoredConnectionConfig> {
        Ok(StoredConnectionConfig {
            database_type: config.database_type,
            host: config.host.clone(),
            port: config.port.clone(),
            username: config.username.clone(),
            password: self.cipher.encrypt_opt(config.password.as_deref())?,
            database: config.database.clone(),
            use_ssl: config.use_ssl,
            ssl_cert_url: self.cipher.encrypt_opt(config.ssl_cert_url.as_deref())?,
            ssl_key_url: self.cipher.encrypt_opt(config.ssl_key_url.as_deref())?,
            ssl_root_cert_url: self.cipher.encrypt_opt(config.ssl_root_cert_url.as_deref())?,
        })
    }

    async fn publish_to_chat(&self, chat_id: &str, event: StreamEventKind, data: serde_json::Value) {
        let subscribers = {
            let connections = self.connections.read().await;
            connections
                .get(chat_id)
                .map(|c| c.subscribers.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        };
        for stream_id in subscribers {
            self.bus
                .publish(chat_id, &stream_id, StreamResponse::new(event, data.clone()))
                .await;
        }
    }

    async fn publish_to_stream(
        &self,
        chat_id: &str,
        stream_id: &str,
        event: StreamEventKind,
        data: serde_json::Value,
    ) {
        self.bus
            .publish(chat_id, stream_id, StreamResponse::new(event, data))
            .await;
    }

    /// Opens the connection for a chat, displacing any previous one. Never
    /// runs concurrently with another connect/disconnect for the same chat.
    pub async fn connect(
        self: &Arc<Self>,
        chat_id: &str,
        user_id: &str,
        stream_id: &str,
        stored: &StoredConnectionConfig,
    ) -> NeoResult<()> {
        self.ownership.verify(chat_id, user_id).await?;
        let lock = self.chat_lock(chat_id).await;
        let _guard = lock.lock().await;

        // Displace a prior connection only after its disconnect returned.
        if self.connections.read().await.contains_key(chat_id) {
            self.teardown(chat_id, "replaced").await;
        }

        self.publish_to_stream(
            chat_id,
            stream_id,
            StreamEventKind::DbConnecting,
            json!({ "chat_id": chat_id }),
        )
        .await;

        let config = self.decrypt_config(stored)?;
        config.validate()?;
        let driver = self.registry.get(config.database_type)?;

        let lease = match driver.connect(chat_id, &config).await {
            Ok(lease) => lease,
            Err(err) => {
                let reason = match err.code {
                    ErrorCode::Tls => "tls",
                    ErrorCode::Config => "config",
                    _ => "error",
                };
                self.publish_to_stream(
                    chat_id,
                    stream_id,
                    StreamEventKind::DbDisconnected,
                    json!({ "chat_id": chat_id, "reason": reason, "error": err.to_string() }),
                )
                .await;
                return Err(err);
            }
        };

        {
            let mut connections = self.connections.write().await;
            let mut subscribers = HashSet::new();
            subscribers.insert(stream_id.to_string());
            connections.insert(
                chat_id.to_string(),
                ManagedConnection {
                    database_type: config.database_type,
                    view: ConnectionView::from(&config),
                    status: ConnectionStatus::Connected,
                    last_used: Instant::now(),
                    subscribers,
                    temp_files: lease.temp_files,
                },
            );
        }

        self.spawn_heartbeat(chat_id).await;
        info!(chat_id, user_id, engine = %config.database_type, "database connected");
        self.publish_to_chat(
            chat_id,
            StreamEventKind::DbConnected,
            json!({ "chat_id": chat_id, "database_type": config.database_type }),
        )
        .await;
        Ok(())
    }

    /// User-initiated disconnect; verifies ownership first.
    pub async fn disconnect(&self, chat_id: &str, user_id: &str) -> NeoResult<()> {
        self.ownership.verify(chat_id, user_id).await?;
        let lock = self.chat_lock(chat_id).await;
        let _guard = lock.lock().await;

        if !self.connections.read().await.contains_key(chat_id) {
            return Err(NeoError::not_connected(chat_id));
        }
        self.teardown(chat_id, "user").await;
        Ok(())
    }

    /// Closes the driver session, deletes temp files, removes the entry and
    /// publishes `db-disconnected`. Runs on every disconnect path: user
    /// action, displacement, idle reaping, heartbeat failure, shutdown.
    async fn teardown(&self, chat_id: &str, reason: &str) {
        if let Some(handle) = self.heartbeats.lock().await.remove(chat_id) {
            // The heartbeat task itself tears down on ping failure; it must
            // not abort itself mid-cleanup.
            if tokio::task::try_id() != Some(handle.id()) {
                handle.abort();
            }
        }

        let entry = {
            let mut connections = self.connections.write().await;
            connections.remove(chat_id)
        };
        let Some(entry) = entry else { return };

        if let Ok(driver) = self.registry.get(entry.database_type) {
            if let Err(err) = driver.disconnect(chat_id).await {
                warn!(chat_id, error = %err, "driver disconnect failed");
            }
        }
        crate::drivers::tls::remove_temp_files(&entry.temp_files).await;

        for stream_id in &entry.subscribers {
            self.publish_to_stream(
                chat_id,
                stream_id,
                StreamEventKind::DbDisconnected,
                json!({ "chat_id": chat_id, "reason": reason }),
            )
            .await;
        }
        debug!(chat_id, reason, "database disconnected");
    }

    /// Resolves the live connection for a chat and bumps `last_used`.
    pub async fn get_connection(&self, chat_id: &str) -> NeoResult<ManagedConnection> {
        let mut connections = self.connections.write().await;
        let entry = connections
            .get_mut(chat_id)
            .ok_or_else(|| NeoError::not_connected(chat_id))?;
        entry.last_used = Instant::now();
        Ok(entry.clone())
    }

    /// Secret-free config view, with a flag for existence.
    pub async fn get_connection_info(&self, chat_id: &str) -> (Option<ConnectionView>, bool) {
        let connections = self.connections.read().await;
        match connections.get(chat_id) {
            Some(entry) => (Some(entry.view.clone()), true),
            None => (None, false),
        }
    }

    pub async fn is_connected(&self, chat_id: &str) -> bool {
        let database_type = {
            let connections = self.connections.read().await;
            connections.get(chat_id).map(|c| c.database_type)
        };
        match database_type {
            Some(database_type) => match self.registry.get(database_type) {
                Ok(driver) => driver.is_alive(chat_id).await,
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Adds a stream to the chat's status-event audience.
    pub async fn subscribe(&self, chat_id: &str, user_id: &str, stream_id: &str) -> NeoResult<()> {
        self.ownership.verify(chat_id, user_id).await?;
        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get_mut(chat_id) {
            entry.subscribers.insert(stream_id.to_string());
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, chat_id: &str, stream_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get_mut(chat_id) {
            entry.subscribers.remove(stream_id);
        }
    }

    async fn spawn_heartbeat(self: &Arc<Self>, chat_id: &str) {
        let manager = Arc::clone(self);
        let chat_id_owned = chat_id.to_string();
        let chat_id = chat_id_owned.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let database_type = {
                    let connections = manager.connections.read().await;
                    match connections.get(&chat_id) {
                        Some(entry) => entry.database_type,
                        None => break,
                    }
                };
                let Ok(driver) = manager.registry.get(database_type) else { break };

                // Transient network blips get one retry before the
                // connection is declared failed.
                let mut healthy = driver.ping(&chat_id).await.is_ok();
                if !healthy {
                    healthy = driver.ping(&chat_id).await.is_ok();
                }

                if healthy {
                    manager
                        .publish_to_chat(
                            &chat_id,
                            StreamEventKind::DbStatus,
                            json!({ "chat_id": chat_id, "status": ConnectionStatus::Connected }),
                        )
                        .await;
                    continue;
                }

                warn!(chat_id, "heartbeat ping failed, tearing connection down");
                {
                    let mut connections = manager.connections.write().await;
                    if let Some(entry) = connections.get_mut(&chat_id) {
                        entry.status = ConnectionStatus::Failed;
                    }
                }
                manager
                    .publish_to_chat(
                        &chat_id,
                        StreamEventKind::DbStatus,
                        json!({ "chat_id": chat_id, "status": ConnectionStatus::Failed }),
                    )
                    .await;
                let lock = manager.chat_lock(&chat_id).await;
                let _guard = lock.lock().await;
                manager.teardown(&chat_id, "ping-failed").await;
                break;
            }
        });
        self.heartbeats.lock().await.insert(chat_id_owned, handle);
    }

    /// Starts the idle reaper. One task per manager.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.reap_idle().await;
            }
        })
    }

    /// Disconnects every connection idle past the TTL.
    pub async fn reap_idle(&self) {
        let idle: Vec<String> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|(_, entry)| entry.last_used.elapsed() > self.config.idle_ttl)
                .map(|(chat_id, _)| chat_id.clone())
                .collect()
        };
        for chat_id in idle {
            info!(chat_id, "reaping idle connection");
            let lock = self.chat_lock(&chat_id).await;
            let _guard = lock.lock().await;
            self.teardown(&chat_id, "idle").await;
        }
    }

    /// Disconnects everything; used at process shutdown.
    pub async fn shutdown(&self) {
        let chat_ids: Vec<String> = {
            let connections = self.connections.read().await;
            connections.keys().cloned().collect()
        };
        for chat_id in chat_ids {
            let lock = self.chat_lock(&chat_id).await;
            let _guard = lock.lock().await;
            self.teardown(&chat_id, "shutdown").await;
        }
    }

    pub fn driver_for(&self, database_type: DatabaseType) -> NeoResult<Arc<dyn crate::drivers::DatabaseDriver>> {
        self.registry.get(database_type)
    }

    /// Convenience for pipeline code paths that need a cancel handle bound
    /// to a live subscription, falling back to a fresh one.
    pub async fn cancel_handle_for(&self, chat_id: &str, stream_id: &str) -> CancelHandle {
        self.bus
            .cancel_handle(chat_id, stream_id)
            .await
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDriver;

    struct AllowAll;

    #[async_trait]
    impl OwnershipVerifier for AllowAll {
        async fn verify(&self, _: &str, _: &str) -> NeoResult<()> {
            Ok(())
        }
    }

    struct DenyAll;

    #[async_trait]
    impl OwnershipVerifier for DenyAll {
        async fn verify(&self, chat_id: &str, _: &str) -> NeoResult<()> {
            Err(NeoError::config(format!("chat {} not owned by user", chat_id)))
        }
    }

    fn stored_config() -> (Arc<FieldCipher>, StoredConnectionConfig) {
        let cipher = Arc::new(FieldCipher::from_secret("test-secret").unwrap());
        let stored = StoredConnectionConfig {
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
        };
        (cipher, stored)
    }

    fn manager_with(
        driver: Arc<FakeDriver>,
        cipher: Arc<FieldCipher>,
        ownership: Arc<dyn OwnershipVerifier>,
    ) -> (Arc<ConnectionManager>, Arc<StreamBus>) {
        let mut registry = DriverRegistry::new();
        registry.register(DatabaseType::PostgreSql, driver);
        let bus = Arc::new(StreamBus::new(
            Duration::from_millis(100),
            Duration::from_secs(30),
        ));
        let manager = ConnectionManager::new(
            Arc::new(registry),
            cipher,
            bus.clone(),
            ownership,
            ConnectionManagerConfig {
                idle_ttl: Duration::from_millis(50),
                reap_interval: Duration::from_millis(20),
            },
        );
        (manager, bus)
    }

    #[tokio::test]
    async fn connect_publishes_and_stores_connection() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        let (cipher, stored) = stored_config();
        let (manager, bus) = manager_with(driver.clone(), cipher, Arc::new(AllowAll));

        let mut sub = bus.subscribe("c1", "u1", "s1").await;
        manager.connect("c1", "u1", "s1", &stored).await.unwrap();

        assert!(driver.is_connected("c1"));
        let (view, exists) = manager.get_connection_info("c1").await;
        assert!(exists);
        assert_eq!(view.unwrap().host, "localhost");

        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first.event, StreamEventKind::DbConnecting);
        let second = sub.receiver.recv().await.unwrap();
        assert_eq!(second.event, StreamEventKind::DbConnected);
    }

    #[tokio::test]
    async fn at_most_one_connection_per_chat() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        let (cipher, stored) = stored_config();
        let (manager, _bus) = manager_with(driver.clone(), cipher, Arc::new(AllowAll));

        manager.connect("c1", "u1", "s1", &stored).await.unwrap();
        manager.connect("c1", "u1", "s2", &stored).await.unwrap();

        let connections = manager.connections.read().await;
        assert_eq!(connections.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_requires_ownership() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        let (cipher, stored) = stored_config();
        let (manager, _bus) = manager_with(driver.clone(), cipher.clone(), Arc::new(AllowAll));
        manager.connect("c1", "u1", "s1", &stored).await.unwrap();

        let (denied, _) = manager_with(driver.clone(), cipher, Arc::new(DenyAll));
        assert!(denied.disconnect("c1", "intruder").await.is_err());

        manager.disconnect("c1", "u1").await.unwrap();
        assert!(!driver.is_connected("c1"));
        assert!(manager.get_connection("c1").await.is_err());
    }

    #[tokio::test]
    async fn failed_connect_reports_reason() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        *driver.fail_connect_with.lock().unwrap() =
            Some(NeoError::tls("bad root certificate"));
        let (cipher, stored) = stored_config();
        let (manager, bus) = manager_with(driver, cipher, Arc::new(AllowAll));

        let mut sub = bus.subscribe("c1", "u1", "s1").await;
        let err = manager.connect("c1", "u1", "s1", &stored).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Tls);

        let connecting = sub.receiver.recv().await.unwrap();
        assert_eq!(connecting.event, StreamEventKind::DbConnecting);
        let disconnected = sub.receiver.recv().await.unwrap();
        assert_eq!(disconnected.event, StreamEventKind::DbDisconnected);
        assert_eq!(disconnected.data["reason"], "tls");
    }

    #[tokio::test]
    async fn idle_connections_are_reaped() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        let (cipher, stored) = stored_config();
        let (manager, bus) = manager_with(driver.clone(), cipher, Arc::new(AllowAll));

        let mut sub = bus.subscribe("c1", "u1", "s1").await;
        manager.connect("c1", "u1", "s1", &stored).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.reap_idle().await;

        assert!(!driver.is_connected("c1"));
        let mut reasons = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            if event.event == StreamEventKind::DbDisconnected {
                reasons.push(event.data["reason"].clone());
            }
        }
        assert!(reasons.contains(&serde_json::json!("idle")));
    }

    #[tokio::test]
    async fn get_connection_bumps_last_used() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        let (cipher, stored) = stored_config();
        let (manager, _bus) = manager_with(driver, cipher, Arc::new(AllowAll));

        manager.connect("c1", "u1", "s1", &stored).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.get_connection("c1").await.unwrap();
        manager.reap_idle().await;
        // Recently used: survives a reap pass with a 50 ms TTL.
        assert!(manager.get_connection("c1").await.is_ok());
    }

    #[tokio::test]
    async fn encrypt_config_round_trips() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        let (cipher, _) = stored_config();
        let (manager, _bus) = manager_with(driver, cipher, Arc::new(AllowAll));

        let config = ConnectionConfig {
            database_type: DatabaseType::PostgreSql,
            host: "db.internal".into(),
            port: Some("5432".into()),
            username: "app".into(),
            password: Some("p@ss".into()),
            database: "app".into(),
            use_ssl: true,
            ssl_cert_url: Some("https://certs/cert.pem".into()),
            ssl_key_url: Some("https://certs/key.pem".into()),
            ssl_root_cert_url: Some("https://certs/root.pem".into()),
        };
        let stored = manager.encrypt_config(&config).unwrap();
        assert_ne!(stored.password.as_ref().unwrap().0, "p@ss");
        let decrypted = manager.decrypt_config(&stored).unwrap();
        assert_eq!(decrypted.password.as_deref(), Some("p@ss"));
        assert_eq!(decrypted.ssl_root_cert_url.as_deref(), Some("https://certs/root.pem"));
    }
}
