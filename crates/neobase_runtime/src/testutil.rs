//! Test doubles shared across module tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::drivers::{ConnectionLease, DatabaseDriver, Transaction};
use crate::errors::{NeoError, NeoResult};
use crate::schema::{table_checksum, ColumnInfo, SchemaInfo, TableSchema};
use crate::streams::CancelHandle;
use crate::types::{ConnectionConfig, QueryExecutionError, QueryExecutionResult, QueryKind, ResultRow};

/// Builds a table schema with text columns and a stamped checksum.
pub fn table(name: &str, columns: &[&str]) -> TableSchema {
    let mut t = TableSchema {
        name: name.to_string(),
        columns: columns
            .iter()
            .map(|c| {
                (
                    c.to_string(),
                    ColumnInfo {
                        name: c.to_string(),
                        r#type: "text".to_string(),
                        is_nullable: false,
                        default_value: String::new(),
                        comment: String::new(),
                    },
                )
            })
            .collect(),
        indexes: BTreeMap::new(),
        foreign_keys: BTreeMap::new(),
        constraints: Vec::new(),
        primary_key: Vec::new(),
        row_count: 0,
        checksum: String::new(),
    };
    t.checksum = table_checksum(&t);
    t
}

/// In-memory driver double: serves a mutable schema, records executed
/// statements, and can be told to fail connects or specific statements.
pub struct FakeDriver {
    pub tables: Mutex<BTreeMap<String, TableSchema>>,
    pub connected: Mutex<HashSet<String>>,
    pub alive: AtomicBool,
    pub fail_connect_with: Mutex<Option<NeoError>>,
    pub fail_statement_containing: Mutex<Option<String>>,
    pub executed: Arc<Mutex<Vec<String>>>,
    pub tx_log: Arc<Mutex<Vec<String>>>,
}

impl FakeDriver {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self {
            tables: Mutex::new(tables.into_iter().map(|t| (t.name.clone(), t)).collect()),
            connected: Mutex::new(HashSet::new()),
            alive: AtomicBool::new(true),
            fail_connect_with: Mutex::new(None),
            fail_statement_containing: Mutex::new(None),
            executed: Arc::new(Mutex::new(Vec::new())),
            tx_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_tables(&self, tables: Vec<TableSchema>) {
        *self.tables.lock().unwrap() = tables.into_iter().map(|t| (t.name.clone(), t)).collect();
    }

    pub fn is_connected(&self, chat_id: &str) -> bool {
        self.connected.lock().unwrap().contains(chat_id)
    }

    fn run_statement(
        executed: &Mutex<Vec<String>>,
        fail_containing: &Option<String>,
        query: &str,
    ) -> QueryExecutionResult {
        executed.lock().unwrap().push(query.to_string());
        let mut result = QueryExecutionResult::default();
        if let Some(needle) = fail_containing {
            if query.contains(needle.as_str()) {
                result.error = Some(QueryExecutionError {
                    code: "EXECUTION_ERROR".into(),
                    message: format!("forced failure on {}", needle),
                    details: None,
                });
                return result.finalize();
            }
        }
        let mut row = ResultRow::new();
        row.insert("ok".to_string(), serde_json::Value::from(1));
        result.rows = Some(vec![row]);
        result.finalize()
    }
}

pub struct FakeTransaction {
    executed: Arc<Mutex<Vec<String>>>,
    tx_log: Arc<Mutex<Vec<String>>>,
    fail_containing: Option<String>,
}

#[async_trait]
impl Transaction for FakeTransaction {
    async fn execute_query(&mut self, query: &str, _kind: QueryKind) -> NeoResult<QueryExecutionResult> {
        Ok(FakeDriver::run_statement(
            &self.executed,
            &self.fail_containing,
            query,
        ))
    }

    async fn commit(self: Box<Self>) -> NeoResult<()> {
        self.tx_log.lock().unwrap().push("commit".to_string());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> NeoResult<()> {
        self.tx_log.lock().unwrap().push("rollback".to_string());
        Ok(())
    }
}

#[async_trait]
impl DatabaseDriver for FakeDriver {
    async fn connect(&self, chat_id: &str, _config: &ConnectionConfig) -> NeoResult<ConnectionLease> {
        if let Some(err) = self.fail_connect_with.lock().unwrap().take() {
            return Err(err);
        }
        self.connected.lock().unwrap().insert(chat_id.to_string());
        Ok(ConnectionLease::default())
    }

    async fn disconnect(&self, chat_id: &str) -> NeoResult<()> {
        self.connected.lock().unwrap().remove(chat_id);
        Ok(())
    }

    async fn ping(&self, chat_id: &str) -> NeoResult<()> {
        if !self.is_connected(chat_id) {
            return Err(NeoError::not_connected(chat_id));
        }
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NeoError::network("ping failed"))
        }
    }

    async fn is_alive(&self, chat_id: &str) -> bool {
        self.ping(chat_id).await.is_ok()
    }

    async fn begin_tx(&self, chat_id: &str) -> NeoResult<Box<dyn Transaction>> {
        if !self.is_connected(chat_id) {
            return Err(NeoError::not_connected(chat_id));
        }
        self.tx_log.lock().unwrap().push("begin".to_string());
        Ok(Box::new(FakeTransaction {
            executed: self.executed.clone(),
            tx_log: self.tx_log.clone(),
            fail_containing: self.fail_statement_containing.lock().unwrap().clone(),
        }))
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
        if !self.is_connected(chat_id) {
            return Err(NeoError::not_connected(chat_id));
        }
        Ok(Self::run_statement(
            &self.executed,
            &self.fail_statement_containing.lock().unwrap(),
            query,
        ))
    }

    async fn get_schema(
        &self,
        cancel: &CancelHandle,
        _chat_id: &str,
        selected: Option<&[String]>,
    ) -> NeoResult<SchemaInfo> {
        cancel.check()?;
        let tables = self.tables.lock().unwrap().clone();
        Ok(SchemaInfo::from_parts(tables, BTreeMap::new()).filtered(selected))
    }

    async fn get_table_checksum(
        &self,
        cancel: &CancelHandle,
        _chat_id: &str,
        table: &str,
    ) -> NeoResult<String> {
        cancel.check()?;
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.checksum.clone())
            .ok_or_else(|| NeoError::execution(format!("table {} not found", table)))
    }

    async fn fetch_example_records(
        &self,
        cancel: &CancelHandle,
        _chat_id: &str,
        _table: &str,
        _limit: usize,
    ) -> NeoResult<Vec<ResultRow>> {
        cancel.check()?;
        Ok(Vec::new())
    }
}
