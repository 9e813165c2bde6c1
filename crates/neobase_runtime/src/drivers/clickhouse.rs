//! ClickHouse driver over the HTTP interface.
//!
//! Queries are POSTed to the HTTP endpoint with `FORMAT JSON` for
//! row-returning statements. Schema discovery reads `system.tables` and
//! `system.columns` filtered by `currentDatabase()`; row counts come from
//! `system.tables.total_rows` with a `COUNT(*)` fallback. ClickHouse has no
//! client-side transactions, so `begin_tx` fails with a typed error and the
//! pipeline treats every ClickHouse mutation as non-rollbackable.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::{NeoError, NeoResult};
use crate::schema::{
    table_checksum, ColumnInfo, SchemaInfo, TableSchema, ViewSchema,
};
use crate::streams::CancelHandle;
use crate::types::{
    ConnectionConfig, QueryExecutionError, QueryExecutionResult, QueryKind, ResultRow,
};

use super::{clamp_example_limit, split_sql_statements, tls, ConnectionLease, DatabaseDriver, Transaction};

const DEFAULT_HTTP_PORT: u16 = 8123;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(2);

struct ClickHouseSession {
    client: reqwest::Client,
    base_url: String,
    database: String,
    username: String,
    password: Option<String>,
}

impl ClickHouseSession {
    /// Runs one statement. Row-returning statements get `FORMAT JSON`
    /// appended unless the text already names a format.
    async fn run(&self, statement: &str, returns_rows: bool) -> NeoResult<Option<Value>> {
        let mut body = statement.trim_end_matches(';').trim().to_string();
        let wants_json = returns_rows && !body.to_ascii_uppercase().contains("FORMAT ");
        if wants_json {
            body.push_str(" FORMAT JSON");
        }

        let mut request = self
            .client
            .post(&self.base_url)
            .query(&[
                ("database", self.database.as_str()),
                // 64-bit integers as JSON numbers, not strings.
                ("output_format_json_quote_64bit_integers", "0"),
            ])
            .header("X-ClickHouse-User", &self.username)
            .body(body);
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| NeoError::network(format!("clickhouse request failed: {}", e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| NeoError::network(format!("clickhouse response read failed: {}", e)))?;

        if !status.is_success() {
            return Err(NeoError::execution(format!(
                "clickhouse error (HTTP {}): {}",
                status,
                text.trim()
            )));
        }

        if wants_json && !text.trim().is_empty() {
            let parsed: Value = serde_json::from_str(&text).map_err(|e| {
                NeoError::execution(format!("clickhouse returned non-JSON payload: {}", e))
            })?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    /// Rows from a `FORMAT JSON` payload, canonicalised.
    async fn select_rows(&self, statement: &str) -> NeoResult<Vec<ResultRow>> {
        let payload = self.run(statement, true).await?;
        Ok(payload
            .as_ref()
            .and_then(|p| p.get("data"))
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(row_from_json).collect())
            .unwrap_or_default())
    }
}

fn row_from_json(value: &Value) -> Option<ResultRow> {
    value.as_object().cloned()
}

pub struct ClickHouseDriver {
    sessions: Arc<RwLock<HashMap<String, Arc<ClickHouseSession>>>>,
}

impl ClickHouseDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn session(&self, chat_id: &str) -> NeoResult<Arc<ClickHouseSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(chat_id)
            .cloned()
            .ok_or_else(|| NeoError::not_connected(chat_id))
    }

    async fn fetch_table_structures(
        session: &ClickHouseSession,
        only_table: Option<&str>,
    ) -> NeoResult<BTreeMap<String, TableSchema>> {
        let filter = match only_table {
            Some(table) => format!(" AND table = '{}'", escape_literal(table)),
            None => String::new(),
        };
        let rows = session
            .select_rows(&format!(
                "SELECT table, name, type, default_expression, comment, is_in_primary_key \
                 FROM system.columns WHERE database = currentDatabase(){}
                 ORDER BY table, position",
                filter
            ))
            .await?;

        let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();
        for row in rows {
            let table = string_field(&row, "table");
            let name = string_field(&row, "name");
            let column_type = string_field(&row, "type");
            if table.is_empty() || name.is_empty() {
                continue;
            }
            let entry = tables.entry(table.clone()).or_insert_with(|| TableSchema {
                name: table.clone(),
                columns: BTreeMap::new(),
                indexes: BTreeMap::new(),
                foreign_keys: BTreeMap::new(),
                constraints: Vec::new(),
                primary_key: Vec::new(),
                row_count: 0,
                checksum: String::new(),
            });
            if row
                .get("is_in_primary_key")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                == 1
            {
                entry.primary_key.push(name.clone());
            }
            entry.columns.insert(
                name.clone(),
                ColumnInfo {
                    // Nullability is encoded in the type itself.
                    is_nullable: column_type.contains("Nullable"),
                    name,
                    r#type: column_type,
                    default_value: string_field(&row, "default_expression"),
                    comment: string_field(&row, "comment"),
                },
            );
        }

        for table in tables.values_mut() {
            table.checksum = table_checksum(table);
        }
        Ok(tables)
    }
}

impl Default for ClickHouseDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn string_field(row: &ResultRow, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn escape_literal(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "\\'")
}

fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "\\`"))
}

#[async_trait]
impl DatabaseDriver for ClickHouseDriver {
    async fn connect(&self, chat_id: &str, config: &ConnectionConfig) -> NeoResult<ConnectionLease> {
        config.validate()?;
        let material = tls::prepare_certificates(config).await?;

        let scheme = if config.use_ssl { "https" } else { "http" };
        let base_url = format!(
            "{}://{}:{}/",
            scheme,
            config.host,
            config.port_or(DEFAULT_HTTP_PORT)
        );

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(60));
        if let Some(root) = &material.root_cert_path {
            let pem = tokio::fs::read(root).await.map_err(|e| {
                NeoError::tls(format!("failed to read staged root certificate: {}", e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| NeoError::tls(format!("invalid root certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&material.cert_path, &material.key_path) {
            let mut pem = tokio::fs::read(cert).await.map_err(|e| {
                NeoError::tls(format!("failed to read staged client certificate: {}", e))
            })?;
            let key_pem = tokio::fs::read(key).await.map_err(|e| {
                NeoError::tls(format!("failed to read staged client key: {}", e))
            })?;
            pem.extend_from_slice(&key_pem);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| NeoError::tls(format!("invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        let client = match builder.build() {
            Ok(client) => client,
            Err(e) => {
                tls::remove_temp_files(&material.temp_files).await;
                return Err(NeoError::tls(format!("failed to build HTTP client: {}", e)));
            }
        };

        let session = ClickHouseSession {
            client,
            base_url,
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        };

        // Verify reachability before the session is published.
        let probe = tokio::time::timeout(CONNECT_TIMEOUT, session.run("SELECT 1", false)).await;
        match probe {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tls::remove_temp_files(&material.temp_files).await;
                return Err(e);
            }
            Err(_) => {
                tls::remove_temp_files(&material.temp_files).await;
                return Err(NeoError::network("clickhouse connect timed out"));
            }
        }

        let mut sessions = self.sessions.write().await;
        sessions.insert(chat_id.to_string(), Arc::new(session));
        info!(chat_id, host = %config.host, "clickhouse connection established");
        Ok(ConnectionLease { temp_files: material.temp_files })
    }

    async fn disconnect(&self, chat_id: &str) -> NeoResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(chat_id).is_some() {
            debug!(chat_id, "clickhouse connection closed");
        }
        Ok(())
    }

    async fn ping(&self, chat_id: &str) -> NeoResult<()> {
        let session = self.session(chat_id).await?;
        match tokio::time::timeout(PING_TIMEOUT, session.run("SELECT 1", false)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NeoError::network("ping timed out")),
        }
    }

    async fn is_alive(&self, chat_id: &str) -> bool {
        self.ping(chat_id).await.is_ok()
    }

    async fn begin_tx(&self, _chat_id: &str) -> NeoResult<Box<dyn Transaction>> {
        Err(NeoError::execution(
            "clickhouse does not support client transactions",
        ))
    }

    async fn execute_query(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        query: &str,
        _kind: QueryKind,
        _want_row_count: bool,
    ) -> NeoResult<QueryExecutionResult> {
        cancel.check()?;
        let session = self.session(chat_id).await?;
        let statements = split_sql_statements(query);
        if statements.is_empty() {
            return Err(NeoError::execution("empty query"));
        }

        let start = Instant::now();
        let mut result = QueryExecutionResult::default();

        for (index, statement) in statements.iter().enumerate() {
            if cancel.is_cancelled() {
                result.error = Some(QueryExecutionError {
                    code: "CANCELLED".into(),
                    message: "operation cancelled by user".into(),
                    details: Some(format!("halted before statement {}", index)),
                });
                break;
            }

            let returns_rows = QueryKind::parse(
                statement.split_whitespace().next().unwrap_or_default(),
            )
            .returns_rows();

            match session.run(statement, returns_rows).await {
                Ok(Some(payload)) => {
                    result.rows = Some(
                        payload
                            .get("data")
                            .and_then(Value::as_array)
                            .map(|rows| rows.iter().filter_map(row_from_json).collect())
                            .unwrap_or_default(),
                    );
                }
                Ok(None) => {
                    result.message = Some("OK".to_string());
                }
                Err(e) => {
                    result.error = Some(QueryExecutionError {
                        code: e.code.to_string(),
                        message: e.message.clone(),
                        details: Some(format!("statement {}", index)),
                    });
                    break;
                }
            }
        }

        result.execution_time_ms = start.elapsed().as_millis() as u64;
        Ok(result.finalize())
    }

    async fn get_schema(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        selected: Option<&[String]>,
    ) -> NeoResult<SchemaInfo> {
        cancel.check()?;
        let session = self.session(chat_id).await?;
        let mut tables = Self::fetch_table_structures(&session, None).await?;
        cancel.check()?;

        let table_rows = session
            .select_rows(
                "SELECT name, engine, total_rows FROM system.tables \
                 WHERE database = currentDatabase() ORDER BY name",
            )
            .await?;

        let mut views = BTreeMap::new();
        for row in table_rows {
            let name = string_field(&row, "name");
            let engine = string_field(&row, "engine");
            if engine.ends_with("View") {
                tables.remove(&name);
                views.insert(
                    name.clone(),
                    ViewSchema { name, definition: String::new() },
                );
                continue;
            }
            let Some(entry) = tables.get_mut(&name) else { continue };

            // total_rows is approximate and nullable; fall back to COUNT(*).
            match row.get("total_rows").and_then(Value::as_i64) {
                Some(count) if count > 0 => entry.row_count = count,
                _ => {
                    let count_rows = session
                        .select_rows(&format!(
                            "SELECT count() AS n FROM {}",
                            quote_ident(&name)
                        ))
                        .await?;
                    entry.row_count = count_rows
                        .first()
                        .and_then(|r| r.get("n"))
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                }
            }
        }

        Ok(SchemaInfo::from_parts(tables, views).filtered(selected))
    }

    async fn get_table_checksum(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        table: &str,
    ) -> NeoResult<String> {
        cancel.check()?;
        let session = self.session(chat_id).await?;
        let tables = Self::fetch_table_structures(&session, Some(table)).await?;
        tables
            .get(table)
            .map(|t| t.checksum.clone())
            .ok_or_else(|| NeoError::execution(format!("table {} not found", table)))
    }

    async fn fetch_example_records(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        table: &str,
        limit: usize,
    ) -> NeoResult<Vec<ResultRow>> {
        cancel.check()?;
        let session = self.session(chat_id).await?;
        let limit = clamp_example_limit(limit);
        session
            .select_rows(&format!(
                "SELECT * FROM {} LIMIT {}",
                quote_ident(table),
                limit
            ))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_and_idents_are_escaped() {
        assert_eq!(escape_literal("ev'ents"), "ev\\'ents");
        assert_eq!(quote_ident("events"), "`events`");
    }

    #[test]
    fn json_rows_must_be_objects() {
        assert!(row_from_json(&serde_json::json!({"a": 1})).is_some());
        assert!(row_from_json(&serde_json::json!([1, 2])).is_none());
    }
}
