//! MySQL driver.
//!
//! Same session discipline as the PostgreSQL driver: one SQLx pool per
//! chat, transactions on a dedicated pooled connection. Schema discovery
//! walks `information_schema` scoped to the connected database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Column, MySql, Row};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::{NeoError, NeoResult};
use crate::schema::{
    table_checksum, ColumnInfo, ForeignKeyInfo, IndexInfo, SchemaInfo, TableSchema, ViewSchema,
};
use crate::streams::CancelHandle;
use crate::types::{
    ConnectionConfig, QueryExecutionError, QueryExecutionResult, QueryKind, ResultRow,
};

use super::{clamp_example_limit, split_sql_statements, tls, ConnectionLease, DatabaseDriver, Transaction};

const DEFAULT_PORT: u16 = 3306;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MySqlDriver {
    sessions: Arc<RwLock<HashMap<String, MySqlPool>>>,
}

impl MySqlDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn pool(&self, chat_id: &str) -> NeoResult<MySqlPool> {
        let sessions = self.sessions.read().await;
        sessions
            .get(chat_id)
            .cloned()
            .ok_or_else(|| NeoError::not_connected(chat_id))
    }

    async fn connect_options(
        config: &ConnectionConfig,
    ) -> NeoResult<(MySqlConnectOptions, Vec<std::path::PathBuf>)> {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port_or(DEFAULT_PORT))
            .username(&config.username)
            .database(&config.database);
        if let Some(password) = &config.password {
            options = options.password(password);
        }

        let material = tls::prepare_certificates(config).await?;
        if config.use_ssl {
            let profile = tls::next_tls_profile_name();
            debug!(profile = %profile, host = %config.host, "registering mysql TLS profile");
            options = options.ssl_mode(if material.root_cert_path.is_some() {
                MySqlSslMode::VerifyIdentity
            } else {
                MySqlSslMode::Required
            });
            if let Some(root) = &material.root_cert_path {
                options = options.ssl_ca(root);
            }
            if let (Some(cert), Some(key)) = (&material.cert_path, &material.key_path) {
                options = options.ssl_client_cert(cert).ssl_client_key(key);
            }
        } else {
            options = options.ssl_mode(MySqlSslMode::Preferred);
        }

        Ok((options, material.temp_files))
    }

    async fn fetch_table_structures(
        pool: &MySqlPool,
        only_table: Option<&str>,
    ) -> NeoResult<BTreeMap<String, TableSchema>> {
        let column_rows: Vec<(String, String, String, String, Option<String>, String)> =
            sqlx::query_as(
                r#"
                SELECT TABLE_NAME, COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_DEFAULT, COLUMN_COMMENT
                FROM information_schema.COLUMNS
                WHERE TABLE_SCHEMA = DATABASE()
                  AND (? IS NULL OR TABLE_NAME = ?)
                ORDER BY TABLE_NAME, ORDINAL_POSITION
                "#,
            )
            .bind(only_table)
            .bind(only_table)
            .fetch_all(pool)
            .await
            .map_err(to_execution_error)?;

        let index_rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT TABLE_NAME, INDEX_NAME, COLUMN_NAME, NON_UNIQUE
            FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = DATABASE()
              AND (? IS NULL OR TABLE_NAME = ?)
            ORDER BY TABLE_NAME, INDEX_NAME, SEQ_IN_INDEX
            "#,
        )
        .bind(only_table)
        .bind(only_table)
        .fetch_all(pool)
        .await
        .map_err(to_execution_error)?;

        let fk_rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT TABLE_NAME, CONSTRAINT_NAME, COLUMN_NAME, REFERENCED_TABLE_NAME, REFERENCED_COLUMN_NAME
            FROM information_schema.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = DATABASE()
              AND REFERENCED_TABLE_NAME IS NOT NULL
              AND (? IS NULL OR TABLE_NAME = ?)
            "#,
        )
        .bind(only_table)
        .bind(only_table)
        .fetch_all(pool)
        .await
        .map_err(to_execution_error)?;

        let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();
        for (table, column, column_type, is_nullable, default_value, comment) in column_rows {
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
            entry.columns.insert(
                column.clone(),
                ColumnInfo {
                    name: column,
                    r#type: column_type,
                    is_nullable: is_nullable.eq_ignore_ascii_case("YES"),
                    default_value: default_value.unwrap_or_default(),
                    comment,
                },
            );
        }

        for (table, index, column, non_unique) in index_rows {
            let Some(entry) = tables.get_mut(&table) else { continue };
            if index == "PRIMARY" {
                entry.primary_key.push(column);
                continue;
            }
            entry
                .indexes
                .entry(index.clone())
                .or_insert_with(|| IndexInfo {
                    name: index,
                    columns: Vec::new(),
                    is_unique: non_unique == 0,
                })
                .columns
                .push(column);
        }

        for (table, name, column, ref_table, ref_column) in fk_rows {
            if let Some(entry) = tables.get_mut(&table) {
                entry.foreign_keys.insert(
                    name.clone(),
                    ForeignKeyInfo {
                        name,
                        column,
                        referenced_table: ref_table,
                        referenced_column: ref_column,
                        on_delete: String::new(),
                        on_update: String::new(),
                    },
                );
            }
        }

        for table in tables.values_mut() {
            table.checksum = table_checksum(table);
        }
        Ok(tables)
    }
}

impl Default for MySqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn to_execution_error(err: sqlx::Error) -> NeoError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            NeoError::network(err.to_string())
        }
        _ => NeoError::execution(err.to_string()),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// VIEW_DEFINITION is NULL when the definer is inaccessible; the view still
/// lists, just without its body.
fn views_from_rows(rows: Vec<(String, Option<String>)>) -> BTreeMap<String, ViewSchema> {
    rows.into_iter()
        .map(|(name, definition)| {
            (
                name.clone(),
                ViewSchema { name, definition: definition.unwrap_or_default() },
            )
        })
        .collect()
}

fn convert_row(row: &MySqlRow) -> ResultRow {
    let mut out = ResultRow::new();
    for column in row.columns() {
        let idx = column.ordinal();
        out.insert(column.name().to_string(), extract_value(row, idx));
    }
    out
}

fn extract_value(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| Value::from(f as f64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(|dt| Value::from(dt.to_rfc3339())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v
            .map(|dt| Value::from(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::from(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Value>, _>(idx) {
        return v.unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v
            .map(|b| Value::from(super::bytes_to_string(&b)))
            .unwrap_or(Value::Null);
    }
    Value::Null
}

async fn run_statements(
    conn: &mut sqlx::MySqlConnection,
    statements: &[String],
    cancel: Option<&CancelHandle>,
) -> QueryExecutionResult {
    let start = Instant::now();
    let mut result = QueryExecutionResult::default();
    let mut rows_affected: u64 = 0;
    let mut saw_write = false;

    for (index, statement) in statements.iter().enumerate() {
        if let Some(cancel) = cancel {
            if cancel.is_cancelled() {
                result.error = Some(QueryExecutionError {
                    code: "CANCELLED".into(),
                    message: "operation cancelled by user".into(),
                    details: Some(format!("halted before statement {}", index)),
                });
                break;
            }
        }

        let returns_rows = QueryKind::parse(
            statement.split_whitespace().next().unwrap_or_default(),
        )
        .returns_rows();

        if returns_rows {
            match sqlx::query(statement).fetch_all(&mut *conn).await {
                Ok(mysql_rows) => {
                    result.rows = Some(mysql_rows.iter().map(convert_row).collect());
                }
                Err(e) => {
                    result.error = Some(QueryExecutionError {
                        code: "EXECUTION_ERROR".into(),
                        message: e.to_string(),
                        details: Some(format!("statement {}", index)),
                    });
                    break;
                }
            }
        } else {
            match sqlx::query(statement).execute(&mut *conn).await {
                Ok(done) => {
                    saw_write = true;
                    rows_affected += done.rows_affected();
                }
                Err(e) => {
                    result.error = Some(QueryExecutionError {
                        code: "EXECUTION_ERROR".into(),
                        message: e.to_string(),
                        details: Some(format!("statement {}", index)),
                    });
                    break;
                }
            }
        }
    }

    if saw_write {
        result.rows_affected = Some(rows_affected);
    }
    result.execution_time_ms = start.elapsed().as_millis() as u64;
    result.finalize()
}

pub struct MySqlTransaction {
    tx: sqlx::Transaction<'static, MySql>,
}

#[async_trait]
impl Transaction for MySqlTransaction {
    async fn execute_query(
        &mut self,
        query: &str,
        _kind: QueryKind,
    ) -> NeoResult<QueryExecutionResult> {
        let statements = split_sql_statements(query);
        if statements.is_empty() {
            return Err(NeoError::execution("empty query"));
        }
        Ok(run_statements(&mut self.tx, &statements, None).await)
    }

    async fn commit(self: Box<Self>) -> NeoResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| NeoError::execution(format!("commit failed: {}", e)))
    }

    async fn rollback(self: Box<Self>) -> NeoResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| NeoError::execution(format!("rollback failed: {}", e)))
    }
}

#[async_trait]
impl DatabaseDriver for MySqlDriver {
    async fn connect(&self, chat_id: &str, config: &ConnectionConfig) -> NeoResult<ConnectionLease> {
        config.validate()?;
        let (options, temp_files) = Self::connect_options(config).await?;

        let connect = MySqlPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect_with(options);

        let pool = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(pool)) => pool,
            Ok(Err(e)) => {
                tls::remove_temp_files(&temp_files).await;
                let message = e.to_string();
                return Err(if message.contains("tls") || message.contains("certificate") {
                    NeoError::tls(message)
                } else {
                    NeoError::network(format!("mysql connect failed: {}", message))
                });
            }
            Err(_) => {
                tls::remove_temp_files(&temp_files).await;
                return Err(NeoError::network("mysql connect timed out"));
            }
        };

        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.insert(chat_id.to_string(), pool) {
            previous.close().await;
        }
        info!(chat_id, host = %config.host, "mysql connection established");
        Ok(ConnectionLease { temp_files })
    }

    async fn disconnect(&self, chat_id: &str) -> NeoResult<()> {
        let pool = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(chat_id)
        };
        if let Some(pool) = pool {
            pool.close().await;
            debug!(chat_id, "mysql connection closed");
        }
        Ok(())
    }

    async fn ping(&self, chat_id: &str) -> NeoResult<()> {
        let pool = self.pool(chat_id).await?;
        let ping = sqlx::query("SELECT 1").execute(&pool);
        match tokio::time::timeout(PING_TIMEOUT, ping).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(NeoError::network(format!("ping failed: {}", e))),
            Err(_) => Err(NeoError::network("ping timed out")),
        }
    }

    async fn is_alive(&self, chat_id: &str) -> bool {
        self.ping(chat_id).await.is_ok()
    }

    async fn begin_tx(&self, chat_id: &str) -> NeoResult<Box<dyn Transaction>> {
        let pool = self.pool(chat_id).await?;
        let tx = pool
            .begin()
            .await
            .map_err(|e| NeoError::execution(format!("failed to open transaction: {}", e)))?;
        Ok(Box::new(MySqlTransaction { tx }))
    }

    async fn execute_query(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        query: &str,
        kind: QueryKind,
        want_row_count: bool,
    ) -> NeoResult<QueryExecutionResult> {
        cancel.check()?;
        let pool = self.pool(chat_id).await?;
        let statements = split_sql_statements(query);
        if statements.is_empty() {
            return Err(NeoError::execution("empty query"));
        }

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| NeoError::network(format!("failed to acquire connection: {}", e)))?;
        let mut result = run_statements(&mut conn, &statements, Some(cancel)).await;
        drop(conn);

        if want_row_count && kind == QueryKind::Select && result.error.is_none() {
            if let Some(last) = statements.last() {
                let count_sql = format!("SELECT COUNT(*) AS n FROM ({}) AS neo_count", last);
                if let Ok(row) = sqlx::query(&count_sql).fetch_one(&pool).await {
                    if let Ok(n) = row.try_get::<i64, _>(0) {
                        result.rows_affected = Some(n as u64);
                        result = result.finalize();
                    }
                }
            }
        }
        Ok(result)
    }

    async fn get_schema(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        selected: Option<&[String]>,
    ) -> NeoResult<SchemaInfo> {
        cancel.check()?;
        let pool = self.pool(chat_id).await?;
        let mut tables = Self::fetch_table_structures(&pool, None).await?;
        cancel.check()?;

        let count_rows: Vec<(String, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT TABLE_NAME, TABLE_ROWS
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE'
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(to_execution_error)?;
        for (table, count) in count_rows {
            if let Some(entry) = tables.get_mut(&table) {
                entry.row_count = count.unwrap_or(0).max(0);
            }
        }

        let view_rows: Vec<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT TABLE_NAME, VIEW_DEFINITION
            FROM information_schema.VIEWS
            WHERE TABLE_SCHEMA = DATABASE()
            ORDER BY TABLE_NAME
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(to_execution_error)?;
        let views = views_from_rows(view_rows);

        Ok(SchemaInfo::from_parts(tables, views).filtered(selected))
    }

    async fn get_table_checksum(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        table: &str,
    ) -> NeoResult<String> {
        cancel.check()?;
        let pool = self.pool(chat_id).await?;
        let tables = Self::fetch_table_structures(&pool, Some(table)).await?;
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
        let pool = self.pool(chat_id).await?;
        let limit = clamp_example_limit(limit);
        let sql = format!("SELECT * FROM {} LIMIT {}", quote_ident(table), limit);
        let rows = sqlx::query(&sql)
            .fetch_all(&pool)
            .await
            .map_err(to_execution_error)?;
        Ok(rows.iter().map(convert_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backticked_idents_are_escaped() {
        assert_eq!(quote_ident("orders"), "`orders`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn view_definitions_are_populated() {
        let views = views_from_rows(vec![
            (
                "active_users".to_string(),
                Some("select `id` from `users` where `active` = 1".to_string()),
            ),
            ("restricted".to_string(), None),
        ]);

        assert_eq!(
            views.get("active_users").unwrap().definition,
            "select `id` from `users` where `active` = 1"
        );
        assert!(views.get("restricted").unwrap().definition.is_empty());
    }
}
