//! TLS material staging.
//!
//! Certificate URLs from a connection config are fetched to unique
//! temporary files before connect. Every staged path is reported back so
//! the owning connection can guarantee removal on every disconnect path,
//! including failed connects.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{NeoError, NeoResult};
use crate::types::ConnectionConfig;

static TLS_PROFILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique per-connection TLS profile name, passed through to engine
/// connection strings that want one.
pub fn next_tls_profile_name() -> String {
    let n = TLS_PROFILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("custom-{}", n)
}

/// Paths of staged certificate material plus the temp files backing them.
#[derive(Debug, Default)]
pub struct TlsMaterial {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub root_cert_path: Option<PathBuf>,
    pub temp_files: Vec<PathBuf>,
}

/// Downloads the certificate URLs referenced by `config` into temp files.
/// On any failure the files staged so far are removed before the error is
/// returned.
pub async fn prepare_certificates(config: &ConnectionConfig) -> NeoResult<TlsMaterial> {
    let mut material = TlsMaterial::default();
    if !config.use_ssl {
        return Ok(material);
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| NeoError::tls(format!("failed to build certificate fetcher: {}", e)))?;

    let fetches = [
        (config.ssl_cert_url.as_deref(), "client-cert"),
        (config.ssl_key_url.as_deref(), "client-key"),
        (config.ssl_root_cert_url.as_deref(), "root-ca"),
    ];

    for (url, label) in fetches {
        let Some(url) = url else { continue };
        match fetch_to_temp_file(&client, url, label).await {
            Ok(path) => {
                material.temp_files.push(path.clone());
                match label {
                    "client-cert" => material.cert_path = Some(path),
                    "client-key" => material.key_path = Some(path),
                    _ => material.root_cert_path = Some(path),
                }
            }
            Err(err) => {
                remove_temp_files(&material.temp_files).await;
                return Err(err);
            }
        }
    }

    Ok(material)
}

async fn fetch_to_temp_file(
    client: &reqwest::Client,
    url: &str,
    label: &str,
) -> NeoResult<PathBuf> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| NeoError::tls(format!("failed to fetch {} from {}: {}", label, url, e)))?;
    if !response.status().is_success() {
        return Err(NeoError::tls(format!(
            "failed to fetch {} from {}: HTTP {}",
            label,
            url,
            response.status()
        )));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| NeoError::tls(format!("failed to read {} body: {}", label, e)))?;

    let path = std::env::temp_dir().join(format!(
        "neobase-{}-{}.pem",
        label,
        uuid::Uuid::new_v4()
    ));
    tokio::fs::write(&path, &body)
        .await
        .map_err(|e| NeoError::tls(format!("failed to write {}: {}", label, e)))?;
    debug!(label, path = %path.display(), "staged TLS material");
    Ok(path)
}

/// Best-effort removal of staged files; failures are logged, never raised.
pub async fn remove_temp_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = tokio::fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to remove temp certificate file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DatabaseType;

    fn plain_config() -> ConnectionConfig {
        ConnectionConfig {
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
        }
    }

    #[tokio::test]
    async fn no_ssl_stages_nothing() {
        let material = prepare_certificates(&plain_config()).await.unwrap();
        assert!(material.temp_files.is_empty());
        assert!(material.cert_path.is_none());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_temp_files() {
        let mut config = plain_config();
        config.use_ssl = true;
        config.ssl_root_cert_url = Some("http://127.0.0.1:1/root.pem".into());

        let err = prepare_certificates(&config).await.unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::Tls);
    }

    #[test]
    fn profile_names_are_unique() {
        let a = next_tls_profile_name();
        let b = next_tls_profile_name();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let path = std::env::temp_dir().join(format!("neobase-test-{}.pem", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, b"cert").await.unwrap();
        remove_temp_files(&[path.clone()]).await;
        assert!(!path.exists());
        remove_temp_files(&[path]).await;
    }
}
