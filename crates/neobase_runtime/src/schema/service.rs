//! Per-chat schema cache with drift detection.
//!
//! `has_schema_changed` is the cheap path: it polls driver-side table
//! checksums against the cached snapshot and early-exits on the first
//! mismatch. Only when drift is detected does the pipeline pay for a full
//! fetch and diff.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::drivers::DatabaseDriver;
use crate::errors::NeoResult;
use crate::schema::{format_schema_for_llm, SchemaDiff, SchemaInfo};
use crate::streams::CancelHandle;

pub struct SchemaService {
    cache: Arc<RwLock<HashMap<String, SchemaInfo>>>,
}

impl SchemaService {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Cheap drift probe. An absent cache entry counts as changed; a table
    /// the driver no longer knows counts as changed.
    pub async fn has_schema_changed(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        driver: &dyn DatabaseDriver,
    ) -> NeoResult<bool> {
        let cached = {
            let cache = self.cache.read().await;
            cache.get(chat_id).cloned()
        };
        let Some(cached) = cached else {
            return Ok(true);
        };

        for (name, table) in &cached.tables {
            cancel.check()?;
            match driver.get_table_checksum(cancel, chat_id, name).await {
                Ok(checksum) if checksum == table.checksum => continue,
                Ok(_) => {
                    debug!(chat_id, table = name.as_str(), "schema drift detected");
                    return Ok(true);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(_) => {
                    // Table dropped or unreadable; either way the snapshot
                    // is stale.
                    debug!(chat_id, table = name.as_str(), "table no longer reachable");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Full fetch and structural diff against the cached snapshot. The
    /// fresh snapshot replaces the cache; `None` means no differences.
    pub async fn check_schema_changes(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        driver: &dyn DatabaseDriver,
        selected: Option<&[String]>,
    ) -> NeoResult<Option<SchemaDiff>> {
        let fresh = driver.get_schema(cancel, chat_id, selected).await?;
        let previous = {
            let mut cache = self.cache.write().await;
            cache.insert(chat_id.to_string(), fresh.clone())
        };

        let diff = match previous {
            Some(previous) => SchemaDiff::between(&previous, &fresh),
            None => SchemaDiff::between(
                &SchemaInfo::from_parts(Default::default(), Default::default()),
                &fresh,
            ),
        };
        Ok((!diff.is_empty()).then_some(diff))
    }

    /// Cached snapshot, fetching and storing on miss.
    pub async fn get_schema(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        driver: &dyn DatabaseDriver,
        selected: Option<&[String]>,
    ) -> NeoResult<SchemaInfo> {
        {
            let cache = self.cache.read().await;
            if let Some(schema) = cache.get(chat_id) {
                return Ok(schema.clone());
            }
        }
        let fresh = driver.get_schema(cancel, chat_id, selected).await?;
        let mut cache = self.cache.write().await;
        cache.insert(chat_id.to_string(), fresh.clone());
        Ok(fresh)
    }

    /// Drops the snapshot; next access refetches. Driven by drift and by
    /// the UI's explicit refresh action.
    pub async fn invalidate(&self, chat_id: &str) {
        let mut cache = self.cache.write().await;
        if cache.remove(chat_id).is_some() {
            debug!(chat_id, "schema cache invalidated");
        }
    }

    pub fn format_for_llm(&self, schema: &SchemaInfo) -> String {
        format_schema_for_llm(schema)
    }
}

impl Default for SchemaService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{table, FakeDriver};

    #[tokio::test]
    async fn missing_cache_counts_as_changed() {
        let service = SchemaService::new();
        let driver = FakeDriver::new(vec![table("users", &["id"])]);
        let cancel = CancelHandle::new();
        assert!(service
            .has_schema_changed(&cancel, "c1", &driver)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unchanged_schema_reports_no_drift() {
        let service = SchemaService::new();
        let driver = FakeDriver::new(vec![table("users", &["id"])]);
        let cancel = CancelHandle::new();

        service.get_schema(&cancel, "c1", &driver, None).await.unwrap();
        assert!(!service
            .has_schema_changed(&cancel, "c1", &driver)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn drift_detected_after_out_of_band_alter() {
        let service = SchemaService::new();
        let driver = FakeDriver::new(vec![table("users", &["id"])]);
        let cancel = CancelHandle::new();

        service.get_schema(&cancel, "c1", &driver, None).await.unwrap();
        driver.set_tables(vec![table("users", &["id", "email"])]);

        assert!(service
            .has_schema_changed(&cancel, "c1", &driver)
            .await
            .unwrap());

        let diff = service
            .check_schema_changes(&cancel, "c1", &driver, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            diff.modified_tables.get("users").unwrap().added_columns,
            vec!["email"]
        );

        // Cache was replaced by the fresh snapshot.
        assert!(!service
            .has_schema_changed(&cancel, "c1", &driver)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn check_without_differences_returns_none() {
        let service = SchemaService::new();
        let driver = FakeDriver::new(vec![table("users", &["id"])]);
        let cancel = CancelHandle::new();

        service.get_schema(&cancel, "c1", &driver, None).await.unwrap();
        let diff = service
            .check_schema_changes(&cancel, "c1", &driver, None)
            .await
            .unwrap();
        assert!(diff.is_none());
    }

    #[tokio::test]
    async fn dropped_table_counts_as_drift() {
        let service = SchemaService::new();
        let driver = FakeDriver::new(vec![table("users", &["id"])]);
        let cancel = CancelHandle::new();

        service.get_schema(&cancel, "c1", &driver, None).await.unwrap();
        driver.set_tables(vec![]);
        assert!(service
            .has_schema_changed(&cancel, "c1", &driver)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let service = SchemaService::new();
        let driver = FakeDriver::new(vec![table("users", &["id"])]);
        let cancel = CancelHandle::new();

        service.get_schema(&cancel, "c1", &driver, None).await.unwrap();
        service.invalidate("c1").await;
        assert!(service
            .has_schema_changed(&cancel, "c1", &driver)
            .await
            .unwrap());
    }
}
