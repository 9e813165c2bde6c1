//! Engine drivers.
//!
//! Each engine family is a concrete driver behind the same capability set,
//! selected through the closed [`DatabaseType`] tag. Drivers own their live
//! sessions keyed by chat id; the connection manager owns lifecycle and
//! never touches an engine handle directly.

pub mod clickhouse;
pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod tls;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{NeoError, NeoResult};
use crate::schema::SchemaInfo;
use crate::streams::CancelHandle;
use crate::types::{ConnectionConfig, DatabaseType, QueryExecutionResult, QueryKind, ResultRow};

pub const EXAMPLE_RECORDS_DEFAULT: usize = 3;
pub const EXAMPLE_RECORDS_MAX: usize = 10;

/// What a successful connect hands back to the manager: the temp files the
/// driver staged (TLS material) so the manager can guarantee their removal
/// on every disconnect path.
#[derive(Debug, Default)]
pub struct ConnectionLease {
    pub temp_files: Vec<PathBuf>,
}

/// A single-owner transaction. The creator must not share it across
/// concurrent tasks; `&mut self` on execute enforces serial use.
#[async_trait]
pub trait Transaction: Send {
    async fn execute_query(
        &mut self,
        query: &str,
        kind: QueryKind,
    ) -> NeoResult<QueryExecutionResult>;

    async fn commit(self: Box<Self>) -> NeoResult<()>;

    async fn rollback(self: Box<Self>) -> NeoResult<()>;
}

/// Engine-specific connect/ping/execute/schema capability set.
///
/// Sessions are keyed by chat id: one live session per chat, owned by the
/// driver, with the manager holding only metadata. `disconnect` must run to
/// completion even when the underlying handle is already broken.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    async fn connect(&self, chat_id: &str, config: &ConnectionConfig) -> NeoResult<ConnectionLease>;

    async fn disconnect(&self, chat_id: &str) -> NeoResult<()>;

    async fn ping(&self, chat_id: &str) -> NeoResult<()>;

    /// Cheap liveness probe used by the idle reaper.
    async fn is_alive(&self, chat_id: &str) -> bool;

    async fn begin_tx(&self, chat_id: &str) -> NeoResult<Box<dyn Transaction>>;

    async fn execute_query(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        query: &str,
        kind: QueryKind,
        want_row_count: bool,
    ) -> NeoResult<QueryExecutionResult>;

    async fn get_schema(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        selected: Option<&[String]>,
    ) -> NeoResult<SchemaInfo>;

    /// Structural checksum of a single table, computed engine-side cheaply
    /// enough for drift polling.
    async fn get_table_checksum(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        table: &str,
    ) -> NeoResult<String>;

    async fn fetch_example_records(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        table: &str,
        limit: usize,
    ) -> NeoResult<Vec<ResultRow>>;
}

/// Driver table keyed by engine tag. PostgreSQL and YugabyteDB share one
/// driver (same wire protocol).
pub struct DriverRegistry {
    drivers: HashMap<DatabaseType, Arc<dyn DatabaseDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self { drivers: HashMap::new() }
    }

    pub fn with_default_drivers() -> Self {
        let mut registry = Self::new();
        let pg: Arc<dyn DatabaseDriver> = Arc::new(postgres::PostgresDriver::new());
        registry.register(DatabaseType::PostgreSql, pg.clone());
        registry.register(DatabaseType::YugabyteDb, pg);
        registry.register(DatabaseType::MySql, Arc::new(mysql::MySqlDriver::new()));
        registry.register(
            DatabaseType::ClickHouse,
            Arc::new(clickhouse::ClickHouseDriver::new()),
        );
        registry.register(DatabaseType::MongoDb, Arc::new(mongodb::MongoDriver::new()));
        registry
    }

    pub fn register(&mut self, database_type: DatabaseType, driver: Arc<dyn DatabaseDriver>) {
        self.drivers.insert(database_type, driver);
    }

    pub fn get(&self, database_type: DatabaseType) -> NeoResult<Arc<dyn DatabaseDriver>> {
        self.drivers
            .get(&database_type)
            .cloned()
            .ok_or_else(|| NeoError::config(format!("no driver registered for {}", database_type)))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_default_drivers()
    }
}

/// Splits a SQL batch on semicolons outside quoted literals and back-ticked
/// identifiers. Empty fragments are skipped; statement order is preserved.
pub fn split_sql_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_backtick = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double && !in_backtick => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single && !in_backtick => {
                in_double = !in_double;
                current.push(c);
            }
            '`' if !in_single && !in_double => {
                in_backtick = !in_backtick;
                current.push(c);
            }
            '\\' if in_single || in_double => {
                // Escaped character inside a literal: keep both bytes.
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ';' if !in_single && !in_double && !in_backtick => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    statements
}

/// Clamps the example-record limit into [1, 10]; 0 means the default of 3.
pub fn clamp_example_limit(limit: usize) -> usize {
    if limit == 0 {
        EXAMPLE_RECORDS_DEFAULT
    } else {
        limit.clamp(1, EXAMPLE_RECORDS_MAX)
    }
}

/// Canonicalises raw bytes into a textual value (UTF-8 lossy).
pub fn bytes_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_batch() {
        let split = split_sql_statements("SELECT 1; SELECT 2;  ; SELECT 3");
        assert_eq!(split, vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
    }

    #[test]
    fn semicolons_inside_literals_are_preserved() {
        let split = split_sql_statements("INSERT INTO t VALUES ('a;b'); SELECT \"x;y\" FROM t");
        assert_eq!(
            split,
            vec!["INSERT INTO t VALUES ('a;b')", "SELECT \"x;y\" FROM t"]
        );
    }

    #[test]
    fn semicolons_inside_backticked_identifiers_are_preserved() {
        let split = split_sql_statements("SELECT `weird;name` FROM t; SELECT 1");
        assert_eq!(split, vec!["SELECT `weird;name` FROM t", "SELECT 1"]);
    }

    #[test]
    fn escaped_quote_does_not_close_literal() {
        let split = split_sql_statements("SELECT 'it\\'s; fine'; SELECT 2");
        assert_eq!(split, vec!["SELECT 'it\\'s; fine'", "SELECT 2"]);
    }

    #[test]
    fn rejoining_preserves_content_up_to_whitespace() {
        let original = "SELECT 1;\nUPDATE t SET v = 'a;b';\nDELETE FROM t";
        let joined = split_sql_statements(original).join(";");
        let canon = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(canon(&joined), canon(&original.replace(";\n", ";")));
    }

    #[test]
    fn example_limit_is_clamped() {
        assert_eq!(clamp_example_limit(0), 3);
        assert_eq!(clamp_example_limit(5), 5);
        assert_eq!(clamp_example_limit(50), 10);
    }
}
