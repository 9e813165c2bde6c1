//! PostgreSQL driver, also serving YugabyteDB (same wire protocol).
//!
//! Each chat gets its own SQLx pool. Transactions ride a dedicated pooled
//! connection owned by the [`Transaction`] object, so transactional
//! statements never interleave with pool traffic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Postgres, Row};
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

const DEFAULT_PORT: u16 = 5432;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(2);

pub struct PostgresDriver {
    sessions: Arc<RwLock<HashMap<String, PgPool>>>,
}

impl PostgresDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn pool(&self, chat_id: &str) -> NeoResult<PgPool> {
        let sessions = self.sessions.read().await;
        sessions
            .get(chat_id)
            .cloned()
            .ok_or_else(|| NeoError::not_connected(chat_id))
    }

    async fn connect_options(config: &ConnectionConfig) -> NeoResult<(PgConnectOptions, Vec<std::path::PathBuf>)> {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port_or(DEFAULT_PORT))
            .username(&config.username)
            .database(&config.database);
        if let Some(password) = &config.password {
            options = options.password(password);
        }

        let material = tls::prepare_certificates(config).await?;
        if config.use_ssl {
            options = options.ssl_mode(if material.root_cert_path.is_some() {
                PgSslMode::VerifyFull
            } else {
                PgSslMode::Require
            });
            if let Some(root) = &material.root_cert_path {
                options = options.ssl_root_cert(root);
            }
            if let (Some(cert), Some(key)) = (&material.cert_path, &material.key_path) {
                options = options.ssl_client_cert(cert).ssl_client_key(key);
            }
        } else {
            options = options.ssl_mode(PgSslMode::Prefer);
        }

        Ok((options, material.temp_files))
    }

    /// Structural fetch shared by full discovery and per-table checksums.
    /// Row counts are filled in separately; checksums here are structural
    /// only.
    async fn fetch_table_structures(
        pool: &PgPool,
        only_table: Option<&str>,
    ) -> NeoResult<BTreeMap<String, TableSchema>> {
        let column_rows: Vec<(String, String, String, String, Option<String>, Option<String>)> =
            sqlx::query_as(
                r#"
                SELECT c.table_name::text,
                       c.column_name::text,
                       c.data_type::text,
                       c.is_nullable::text,
                       c.column_default::text,
                       pgd.description::text
                FROM information_schema.columns c
                LEFT JOIN pg_catalog.pg_statio_all_tables st
                  ON st.schemaname = c.table_schema AND st.relname = c.table_name
                LEFT JOIN pg_catalog.pg_description pgd
                  ON pgd.objoid = st.relid AND pgd.objsubid = c.ordinal_position
                WHERE c.table_schema = 'public'
                  AND ($1::text IS NULL OR c.table_name = $1)
                ORDER BY c.table_name, c.ordinal_position
                "#,
            )
            .bind(only_table)
            .fetch_all(pool)
            .await
            .map_err(to_execution_error)?;

        let pk_rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT c.relname::text, a.attname::text
            FROM pg_index i
            JOIN pg_class c ON c.oid = i.indrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
            WHERE i.indisprimary
              AND n.nspname = 'public'
              AND ($1::text IS NULL OR c.relname = $1)
            ORDER BY c.relname, array_position(i.indkey, a.attnum)
            "#,
        )
        .bind(only_table)
        .fetch_all(pool)
        .await
        .map_err(to_execution_error)?;

        let fk_rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT tc.table_name::text,
                   tc.constraint_name::text,
                   kcu.column_name::text,
                   ccu.table_name::text,
                   ccu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name
             AND ccu.table_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = 'public'
              AND ($1::text IS NULL OR tc.table_name = $1)
            "#,
        )
        .bind(only_table)
        .fetch_all(pool)
        .await
        .map_err(to_execution_error)?;

        let index_rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT tablename::text, indexname::text, indexdef::text
            FROM pg_indexes
            WHERE schemaname = 'public'
              AND ($1::text IS NULL OR tablename = $1)
            ORDER BY tablename, indexname
            "#,
        )
        .bind(only_table)
        .fetch_all(pool)
        .await
        .map_err(to_execution_error)?;

        let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();
        for (table, column, data_type, is_nullable, default_value, comment) in column_rows {
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
                    r#type: data_type,
                    is_nullable: is_nullable.eq_ignore_ascii_case("YES"),
                    default_value: default_value.unwrap_or_default(),
                    comment: comment.unwrap_or_default(),
                },
            );
        }
        for (table, column) in pk_rows {
            if let Some(entry) = tables.get_mut(&table) {
                entry.primary_key.push(column);
            }
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
        for (table, name, definition) in index_rows {
            if let Some(entry) = tables.get_mut(&table) {
                let is_unique = definition.to_ascii_uppercase().contains("UNIQUE INDEX");
                let columns = index_columns_from_definition(&definition);
                entry.indexes.insert(
                    name.clone(),
                    IndexInfo { name, columns, is_unique },
                );
            }
        }

        for table in tables.values_mut() {
            table.checksum = table_checksum(table);
        }
        Ok(tables)
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls the parenthesised column list out of an `indexdef` string.
fn index_columns_from_definition(definition: &str) -> Vec<String> {
    let Some(open) = definition.find('(') else {
        return Vec::new();
    };
    let Some(close) = definition.rfind(')') else {
        return Vec::new();
    };
    if close <= open {
        return Vec::new();
    }
    definition[open + 1..close]
        .split(',')
        .map(|c| c.trim().trim_matches('"').to_string())
        .filter(|c| !c.is_empty())
        .collect()
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
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Canonicalises one PG row into a JSON object: bytes become lossy text,
/// numerics and booleans pass through, everything else is stringified.
fn convert_row(row: &PgRow) -> ResultRow {
    let mut out = ResultRow::new();
    for column in row.columns() {
        let idx = column.ordinal();
        out.insert(column.name().to_string(), extract_value(row, idx));
    }
    out
}

fn extract_value(row: &PgRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
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
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
        return v.map(|u| Value::from(u.to_string())).unwrap_or(Value::Null);
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

/// Runs a statement batch on one connection, halting on the first failure.
/// The partial result carries the error with its statement index.
async fn run_statements(
    conn: &mut sqlx::PgConnection,
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
                Ok(pg_rows) => {
                    result.rows = Some(pg_rows.iter().map(convert_row).collect());
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

pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
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
impl DatabaseDriver for PostgresDriver {
    async fn connect(&self, chat_id: &str, config: &ConnectionConfig) -> NeoResult<ConnectionLease> {
        config.validate()?;
        let (options, temp_files) = Self::connect_options(config).await?;

        let connect = PgPoolOptions::new()
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
                    NeoError::network(format!("postgres connect failed: {}", message))
                });
            }
            Err(_) => {
                tls::remove_temp_files(&temp_files).await;
                return Err(NeoError::network("postgres connect timed out"));
            }
        };

        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.insert(chat_id.to_string(), pool) {
            previous.close().await;
        }
        info!(chat_id, host = %config.host, "postgres connection established");
        Ok(ConnectionLease { temp_files })
    }

    async fn disconnect(&self, chat_id: &str) -> NeoResult<()> {
        let pool = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(chat_id)
        };
        if let Some(pool) = pool {
            pool.close().await;
            debug!(chat_id, "postgres connection closed");
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
        Ok(Box::new(PgTransaction { tx }))
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

        // Paginated selects want the total matching rows alongside the page.
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

        let count_rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT c.relname::text, c.reltuples::bigint
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = 'public' AND c.relkind = 'r'
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(to_execution_error)?;
        for (table, count) in count_rows {
            if let Some(entry) = tables.get_mut(&table) {
                entry.row_count = count.max(0);
            }
        }

        let view_rows: Vec<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT table_name::text, view_definition::text
            FROM information_schema.views
            WHERE table_schema = 'public'
            ORDER BY table_name
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(to_execution_error)?;
        let views = view_rows
            .into_iter()
            .map(|(name, definition)| {
                (
                    name.clone(),
                    ViewSchema { name, definition: definition.unwrap_or_default() },
                )
            })
            .collect();

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
    fn index_definition_parsing_extracts_columns() {
        let def = "CREATE UNIQUE INDEX users_email_key ON public.users USING btree (email, \"tenantId\")";
        assert_eq!(index_columns_from_definition(def), vec!["email", "tenantId"]);
        assert!(index_columns_from_definition("garbage").is_empty());
    }

    #[test]
    fn idents_are_quoted_against_injection() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
