//! MongoDB driver.
//!
//! Assistant queries arrive as JavaScript-like strings
//! (`db.users.find({...}).limit(5)`, `db.createCollection("events")`); the
//! driver parses them into native commands. Collections have no declared
//! schema, so discovery samples documents and reports the union of observed
//! fields with their BSON type names. Transactions ride a client session
//! and fail with a typed error when the deployment is not a replica set.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, FindOptions, Tls, TlsOptions};
use mongodb::{Client, ClientSession};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::{NeoError, NeoResult};
use crate::schema::{table_checksum, ColumnInfo, IndexInfo, SchemaInfo, TableSchema};
use crate::streams::CancelHandle;
use crate::types::{
    ConnectionConfig, QueryExecutionError, QueryExecutionResult, QueryKind, ResultRow,
};

use super::{clamp_example_limit, tls, ConnectionLease, DatabaseDriver, Transaction};

const DEFAULT_PORT: u16 = 27017;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SCHEMA_SAMPLE_SIZE: i64 = 50;

struct MongoSession {
    client: Client,
    database: String,
}

pub struct MongoDriver {
    sessions: Arc<RwLock<HashMap<String, Arc<MongoSession>>>>,
}

impl MongoDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn session(&self, chat_id: &str) -> NeoResult<Arc<MongoSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(chat_id)
            .cloned()
            .ok_or_else(|| NeoError::not_connected(chat_id))
    }

    async fn infer_collection_schema(
        session: &MongoSession,
        collection: &str,
    ) -> NeoResult<TableSchema> {
        let db = session.client.database(&session.database);
        let coll = db.collection::<Document>(collection);

        let options = FindOptions::builder().limit(SCHEMA_SAMPLE_SIZE).build();
        let mut cursor = coll
            .find(None, options)
            .await
            .map_err(to_execution_error)?;

        let mut columns: BTreeMap<String, ColumnInfo> = BTreeMap::new();
        while let Some(document) = cursor.try_next().await.map_err(to_execution_error)? {
            for (field, value) in document.iter() {
                let type_name = bson_type_name(value);
                columns
                    .entry(field.clone())
                    .and_modify(|existing| {
                        if existing.r#type != type_name && type_name != "null" {
                            if existing.r#type == "null" {
                                existing.r#type = type_name.to_string();
                            } else if !existing.r#type.contains(type_name) {
                                existing.r#type = format!("{}|{}", existing.r#type, type_name);
                            }
                        }
                        if type_name == "null" {
                            existing.is_nullable = true;
                        }
                    })
                    .or_insert_with(|| ColumnInfo {
                        name: field.clone(),
                        r#type: type_name.to_string(),
                        is_nullable: type_name == "null",
                        default_value: String::new(),
                        comment: String::new(),
                    });
            }
        }

        let mut indexes = BTreeMap::new();
        if let Ok(mut index_cursor) = coll.list_indexes(None).await {
            while let Ok(Some(index)) = index_cursor.try_next().await {
                let name = index.options.as_ref().and_then(|o| o.name.clone());
                let Some(name) = name else { continue };
                let columns: Vec<String> = index.keys.keys().cloned().collect();
                let is_unique = index
                    .options
                    .as_ref()
                    .and_then(|o| o.unique)
                    .unwrap_or(false);
                indexes.insert(name.clone(), IndexInfo { name, columns, is_unique });
            }
        }

        let row_count = coll
            .estimated_document_count(None)
            .await
            .map_err(to_execution_error)? as i64;

        let mut table = TableSchema {
            name: collection.to_string(),
            columns,
            indexes,
            foreign_keys: BTreeMap::new(),
            constraints: Vec::new(),
            primary_key: vec!["_id".to_string()],
            row_count,
            checksum: String::new(),
        };
        table.checksum = table_checksum(&table);
        Ok(table)
    }
}

impl Default for MongoDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn to_execution_error(err: mongodb::error::Error) -> NeoError {
    let message = err.to_string();
    if message.contains("transaction") && message.contains("replica") {
        NeoError::execution("transactions require a replica set deployment")
    } else if message.contains("connection") || message.contains("timed out") {
        NeoError::network(message)
    } else {
        NeoError::execution(message)
    }
}

fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        Bson::Boolean(_) => "bool",
        Bson::Null => "null",
        Bson::Int32(_) => "int",
        Bson::Int64(_) => "long",
        Bson::ObjectId(_) => "objectId",
        Bson::DateTime(_) => "date",
        Bson::Timestamp(_) => "timestamp",
        Bson::Binary(_) => "binData",
        Bson::Decimal128(_) => "decimal",
        _ => "mixed",
    }
}

fn document_to_row(document: Document) -> ResultRow {
    match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(map) => map,
        other => {
            let mut row = ResultRow::new();
            row.insert("value".to_string(), other);
            row
        }
    }
}

fn value_to_document(value: &Value) -> NeoResult<Document> {
    let bson: Bson = value
        .clone()
        .try_into()
        .map_err(|e| NeoError::execution(format!("invalid document literal: {}", e)))?;
    match bson {
        Bson::Document(document) => Ok(document),
        _ => Err(NeoError::execution("expected a document literal")),
    }
}

/// Operations the query-string parser understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MongoOp {
    Find,
    FindOne,
    Aggregate,
    CountDocuments,
    InsertOne,
    InsertMany,
    UpdateOne,
    UpdateMany,
    DeleteOne,
    DeleteMany,
    Drop,
    CreateCollection,
}

impl MongoOp {
    fn parse(raw: &str) -> NeoResult<Self> {
        match raw {
            "find" => Ok(MongoOp::Find),
            "findOne" => Ok(MongoOp::FindOne),
            "aggregate" => Ok(MongoOp::Aggregate),
            "countDocuments" => Ok(MongoOp::CountDocuments),
            "insertOne" => Ok(MongoOp::InsertOne),
            "insertMany" => Ok(MongoOp::InsertMany),
            "updateOne" => Ok(MongoOp::UpdateOne),
            "updateMany" => Ok(MongoOp::UpdateMany),
            "deleteOne" => Ok(MongoOp::DeleteOne),
            "deleteMany" => Ok(MongoOp::DeleteMany),
            "drop" => Ok(MongoOp::Drop),
            "createCollection" => Ok(MongoOp::CreateCollection),
            other => Err(NeoError::execution(format!(
                "unsupported mongodb operation: {}",
                other
            ))),
        }
    }

    fn is_write(&self) -> bool {
        !matches!(
            self,
            MongoOp::Find | MongoOp::FindOne | MongoOp::Aggregate | MongoOp::CountDocuments
        )
    }
}

/// A parsed `db.…` query string.
#[derive(Debug, Clone)]
pub struct MongoQuery {
    pub collection: Option<String>,
    pub op: MongoOp,
    pub args: Vec<Value>,
    /// Chained cursor modifiers: `.limit(5)`, `.sort({...})`, `.skip(10)`.
    pub modifiers: Vec<(String, Value)>,
}

/// Parses a JavaScript-like query string into a [`MongoQuery`].
///
/// The grammar is `db.<collection>.<op>(<json args>)[.<modifier>(arg)]*`,
/// with `db.createCollection("name")` as the collection-less form. Argument
/// literals must be valid JSON.
pub fn parse_mongo_query(text: &str) -> NeoResult<MongoQuery> {
    let trimmed = text.trim().trim_end_matches(';').trim();
    let rest = trimmed
        .strip_prefix("db.")
        .ok_or_else(|| NeoError::execution("mongodb query must start with db."))?;

    let paren = rest
        .find('(')
        .ok_or_else(|| NeoError::execution("mongodb query has no call"))?;
    let head = &rest[..paren];

    let (collection, op_name) = match head.rfind('.') {
        Some(dot) => (Some(head[..dot].to_string()), &head[dot + 1..]),
        None => (None, head),
    };
    let op = MongoOp::parse(op_name)?;
    if collection.is_none() && op != MongoOp::CreateCollection {
        return Err(NeoError::execution(format!(
            "{} requires a collection",
            op_name
        )));
    }

    let (args_raw, mut tail) = take_parenthesised(&rest[paren..])?;
    let args = split_top_level_args(&args_raw)?
        .into_iter()
        .map(|arg| {
            serde_json::from_str(&arg).map_err(|e| {
                NeoError::execution(format!("invalid argument literal {}: {}", arg, e))
            })
        })
        .collect::<NeoResult<Vec<Value>>>()?;

    let mut modifiers = Vec::new();
    while let Some(stripped) = tail.strip_prefix('.') {
        let paren = stripped
            .find('(')
            .ok_or_else(|| NeoError::execution("malformed cursor modifier"))?;
        let name = stripped[..paren].to_string();
        let (arg_raw, next_tail) = take_parenthesised(&stripped[paren..])?;
        let arg = if arg_raw.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(arg_raw.trim()).map_err(|e| {
                NeoError::execution(format!("invalid modifier argument {}: {}", arg_raw, e))
            })?
        };
        modifiers.push((name, arg));
        tail = next_tail;
    }
    if !tail.trim().is_empty() {
        return Err(NeoError::execution(format!(
            "unexpected trailing input: {}",
            tail.trim()
        )));
    }

    Ok(MongoQuery { collection, op, args, modifiers })
}

/// Consumes a balanced `(...)` group, respecting strings; returns the inner
/// text and the remaining input.
fn take_parenthesised(input: &str) -> NeoResult<(String, &str)> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut string_delim = '"';
    let mut prev_escape = false;

    for (i, c) in input.char_indices() {
        if in_string {
            if prev_escape {
                prev_escape = false;
            } else if c == '\\' {
                prev_escape = true;
            } else if c == string_delim {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                in_string = true;
                string_delim = c;
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((input[1..i].to_string(), &input[i + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(NeoError::execution("unbalanced parentheses in mongodb query"))
}

/// Splits `a, b, c` at top level, ignoring commas inside braces, brackets
/// and strings.
fn split_top_level_args(raw: &str) -> NeoResult<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut string_delim = '"';
    let mut prev_escape = false;

    for c in trimmed.chars() {
        if in_string {
            current.push(c);
            if prev_escape {
                prev_escape = false;
            } else if c == '\\' {
                prev_escape = true;
            } else if c == string_delim {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                in_string = true;
                string_delim = c;
                current.push(c);
            }
            '{' | '[' | '(' => {
                depth += 1;
                current.push(c);
            }
            '}' | ']' | ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        args.push(current.trim().to_string());
    }
    Ok(args)
}

async fn execute_parsed(
    session: &MongoSession,
    parsed: &MongoQuery,
    tx_session: Option<&mut ClientSession>,
) -> NeoResult<QueryExecutionResult> {
    let start = Instant::now();
    let db = session.client.database(&session.database);
    let mut result = QueryExecutionResult::default();

    match (&parsed.op, &parsed.collection) {
        (MongoOp::CreateCollection, _) => {
            let name = parsed
                .args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| NeoError::execution("createCollection requires a name"))?;
            db.create_collection(name, None)
                .await
                .map_err(to_execution_error)?;
            result.message = Some(format!("collection {} created", name));
        }
        (op, Some(collection)) => {
            let coll = db.collection::<Document>(collection);
            match op {
                MongoOp::Find | MongoOp::FindOne => {
                    let filter = parsed
                        .args
                        .first()
                        .map(value_to_document)
                        .transpose()?
                        .unwrap_or_default();
                    let projection = parsed.args.get(1).map(value_to_document).transpose()?;

                    let mut options = FindOptions::builder().projection(projection).build();
                    if *op == MongoOp::FindOne {
                        options.limit = Some(1);
                    }
                    for (name, arg) in &parsed.modifiers {
                        match name.as_str() {
                            "limit" => options.limit = arg.as_i64(),
                            "skip" => options.skip = arg.as_i64().map(|n| n as u64),
                            "sort" => options.sort = Some(value_to_document(arg)?),
                            other => {
                                return Err(NeoError::execution(format!(
                                    "unsupported cursor modifier: {}",
                                    other
                                )))
                            }
                        }
                    }

                    let cursor = coll.find(filter, options).await.map_err(to_execution_error)?;
                    let documents: Vec<Document> =
                        cursor.try_collect().await.map_err(to_execution_error)?;
                    result.rows = Some(documents.into_iter().map(document_to_row).collect());
                }
                MongoOp::Aggregate => {
                    let pipeline_value = parsed
                        .args
                        .first()
                        .ok_or_else(|| NeoError::execution("aggregate requires a pipeline"))?;
                    let stages = pipeline_value
                        .as_array()
                        .ok_or_else(|| NeoError::execution("aggregate pipeline must be an array"))?
                        .iter()
                        .map(value_to_document)
                        .collect::<NeoResult<Vec<Document>>>()?;
                    let cursor = coll
                        .aggregate(stages, None)
                        .await
                        .map_err(to_execution_error)?;
                    let documents: Vec<Document> =
                        cursor.try_collect().await.map_err(to_execution_error)?;
                    result.rows = Some(documents.into_iter().map(document_to_row).collect());
                }
                MongoOp::CountDocuments => {
                    let filter = parsed
                        .args
                        .first()
                        .map(value_to_document)
                        .transpose()?
                        .unwrap_or_default();
                    let count = coll
                        .count_documents(filter, None)
                        .await
                        .map_err(to_execution_error)?;
                    let mut row = ResultRow::new();
                    row.insert("count".to_string(), Value::from(count));
                    result.rows = Some(vec![row]);
                }
                MongoOp::InsertOne => {
                    let document = parsed
                        .args
                        .first()
                        .map(value_to_document)
                        .transpose()?
                        .ok_or_else(|| NeoError::execution("insertOne requires a document"))?;
                    match tx_session {
                        Some(tx) => coll
                            .insert_one_with_session(document, None, tx)
                            .await
                            .map(|_| ())
                            .map_err(to_execution_error)?,
                        None => coll
                            .insert_one(document, None)
                            .await
                            .map(|_| ())
                            .map_err(to_execution_error)?,
                    }
                    result.rows_affected = Some(1);
                }
                MongoOp::InsertMany => {
                    let documents = parsed
                        .args
                        .first()
                        .and_then(Value::as_array)
                        .ok_or_else(|| NeoError::execution("insertMany requires an array"))?
                        .iter()
                        .map(value_to_document)
                        .collect::<NeoResult<Vec<Document>>>()?;
                    let count = documents.len() as u64;
                    match tx_session {
                        Some(tx) => coll
                            .insert_many_with_session(documents, None, tx)
                            .await
                            .map(|_| ())
                            .map_err(to_execution_error)?,
                        None => coll
                            .insert_many(documents, None)
                            .await
                            .map(|_| ())
                            .map_err(to_execution_error)?,
                    }
                    result.rows_affected = Some(count);
                }
                MongoOp::UpdateOne | MongoOp::UpdateMany => {
                    let filter = parsed
                        .args
                        .first()
                        .map(value_to_document)
                        .transpose()?
                        .ok_or_else(|| NeoError::execution("update requires a filter"))?;
                    let update = parsed
                        .args
                        .get(1)
                        .map(value_to_document)
                        .transpose()?
                        .ok_or_else(|| NeoError::execution("update requires an update document"))?;
                    let outcome = match (op, tx_session) {
                        (MongoOp::UpdateOne, Some(tx)) => coll
                            .update_one_with_session(filter, update, None, tx)
                            .await
                            .map_err(to_execution_error)?,
                        (MongoOp::UpdateOne, None) => coll
                            .update_one(filter, update, None)
                            .await
                            .map_err(to_execution_error)?,
                        (_, Some(tx)) => coll
                            .update_many_with_session(filter, update, None, tx)
                            .await
                            .map_err(to_execution_error)?,
                        (_, None) => coll
                            .update_many(filter, update, None)
                            .await
                            .map_err(to_execution_error)?,
                    };
                    result.rows_affected = Some(outcome.modified_count);
                }
                MongoOp::DeleteOne | MongoOp::DeleteMany => {
                    let filter = parsed
                        .args
                        .first()
                        .map(value_to_document)
                        .transpose()?
                        .ok_or_else(|| NeoError::execution("delete requires a filter"))?;
                    let outcome = match (op, tx_session) {
                        (MongoOp::DeleteOne, Some(tx)) => coll
                            .delete_one_with_session(filter, None, tx)
                            .await
                            .map_err(to_execution_error)?,
                        (MongoOp::DeleteOne, None) => coll
                            .delete_one(filter, None)
                            .await
                            .map_err(to_execution_error)?,
                        (_, Some(tx)) => coll
                            .delete_many_with_session(filter, None, tx)
                            .await
                            .map_err(to_execution_error)?,
                        (_, None) => coll
                            .delete_many(filter, None)
                            .await
                            .map_err(to_execution_error)?,
                    };
                    result.rows_affected = Some(outcome.deleted_count);
                }
                MongoOp::Drop => {
                    coll.drop(None).await.map_err(to_execution_error)?;
                    result.message = Some(format!("collection {} dropped", collection));
                }
                MongoOp::CreateCollection => unreachable!("handled above"),
            }
        }
        (op, None) => {
            return Err(NeoError::execution(format!(
                "{:?} requires a collection",
                op
            )))
        }
    }

    result.execution_time_ms = start.elapsed().as_millis() as u64;
    Ok(result.finalize())
}

pub struct MongoTransaction {
    session: Arc<MongoSession>,
    tx_session: ClientSession,
}

#[async_trait]
impl Transaction for MongoTransaction {
    async fn execute_query(
        &mut self,
        query: &str,
        _kind: QueryKind,
    ) -> NeoResult<QueryExecutionResult> {
        let parsed = match parse_mongo_query(query) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(QueryExecutionResult {
                    error: Some(QueryExecutionError {
                        code: e.code.to_string(),
                        message: e.message.clone(),
                        details: None,
                    }),
                    ..Default::default()
                }
                .finalize())
            }
        };
        let tx = parsed.op.is_write().then_some(&mut self.tx_session);
        match execute_parsed(&self.session, &parsed, tx).await {
            Ok(result) => Ok(result),
            Err(e) => Ok(QueryExecutionResult {
                error: Some(QueryExecutionError {
                    code: e.code.to_string(),
                    message: e.message.clone(),
                    details: None,
                }),
                ..Default::default()
            }
            .finalize()),
        }
    }

    async fn commit(mut self: Box<Self>) -> NeoResult<()> {
        self.tx_session
            .commit_transaction()
            .await
            .map_err(to_execution_error)
    }

    async fn rollback(mut self: Box<Self>) -> NeoResult<()> {
        self.tx_session
            .abort_transaction()
            .await
            .map_err(to_execution_error)
    }
}

#[async_trait]
impl DatabaseDriver for MongoDriver {
    async fn connect(&self, chat_id: &str, config: &ConnectionConfig) -> NeoResult<ConnectionLease> {
        config.validate()?;
        let material = tls::prepare_certificates(config).await?;

        let credentials = match (&config.username, &config.password) {
            (user, Some(password)) if !user.is_empty() => {
                format!("{}:{}@", user, password)
            }
            (user, None) if !user.is_empty() => format!("{}@", user),
            _ => String::new(),
        };
        let uri = format!(
            "mongodb://{}{}:{}/{}",
            credentials,
            config.host,
            config.port_or(DEFAULT_PORT),
            config.database
        );

        let mut options = match ClientOptions::parse(&uri).await {
            Ok(options) => options,
            Err(e) => {
                tls::remove_temp_files(&material.temp_files).await;
                return Err(NeoError::config(format!("invalid mongodb uri: {}", e)));
            }
        };
        options.connect_timeout = Some(CONNECT_TIMEOUT);
        options.server_selection_timeout = Some(CONNECT_TIMEOUT);
        if config.use_ssl {
            options.tls = Some(Tls::Enabled(
                TlsOptions::builder()
                    .ca_file_path(material.root_cert_path.clone())
                    .cert_key_file_path(material.cert_path.clone())
                    .build(),
            ));
        }

        let client = match Client::with_options(options) {
            Ok(client) => client,
            Err(e) => {
                tls::remove_temp_files(&material.temp_files).await;
                return Err(NeoError::network(format!("mongodb client build failed: {}", e)));
            }
        };

        // Fail fast instead of lazily on first query.
        let ping_db = client.database(&config.database);
        let ping = ping_db.run_command(doc! {"ping": 1}, None);
        match tokio::time::timeout(CONNECT_TIMEOUT, ping).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tls::remove_temp_files(&material.temp_files).await;
                return Err(to_execution_error(e));
            }
            Err(_) => {
                tls::remove_temp_files(&material.temp_files).await;
                return Err(NeoError::network("mongodb connect timed out"));
            }
        }

        let session = MongoSession {
            client,
            database: config.database.clone(),
        };
        let mut sessions = self.sessions.write().await;
        sessions.insert(chat_id.to_string(), Arc::new(session));
        info!(chat_id, host = %config.host, "mongodb connection established");
        Ok(ConnectionLease { temp_files: material.temp_files })
    }

    async fn disconnect(&self, chat_id: &str) -> NeoResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(chat_id).is_some() {
            debug!(chat_id, "mongodb connection closed");
        }
        Ok(())
    }

    async fn ping(&self, chat_id: &str) -> NeoResult<()> {
        let session = self.session(chat_id).await?;
        session
            .client
            .database(&session.database)
            .run_command(doc! {"ping": 1}, None)
            .await
            .map(|_| ())
            .map_err(|e| NeoError::network(format!("ping failed: {}", e)))
    }

    async fn is_alive(&self, chat_id: &str) -> bool {
        self.ping(chat_id).await.is_ok()
    }

    async fn begin_tx(&self, chat_id: &str) -> NeoResult<Box<dyn Transaction>> {
        let session = self.session(chat_id).await?;
        let mut tx_session = session
            .client
            .start_session(None)
            .await
            .map_err(to_execution_error)?;
        tx_session
            .start_transaction(None)
            .await
            .map_err(|e| {
                let mapped = to_execution_error(e);
                if mapped.message.contains("replica") {
                    mapped
                } else {
                    NeoError::execution(format!(
                        "failed to start transaction (replica set required): {}",
                        mapped.message
                    ))
                }
            })?;
        Ok(Box::new(MongoTransaction { session, tx_session }))
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
        let parsed = parse_mongo_query(query)?;
        execute_parsed(&session, &parsed, None).await
    }

    async fn get_schema(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        selected: Option<&[String]>,
    ) -> NeoResult<SchemaInfo> {
        cancel.check()?;
        let session = self.session(chat_id).await?;
        let db = session.client.database(&session.database);
        let names = db
            .list_collection_names(None)
            .await
            .map_err(to_execution_error)?;

        let mut tables = BTreeMap::new();
        for name in names {
            cancel.check()?;
            let table = Self::infer_collection_schema(&session, &name).await?;
            tables.insert(name, table);
        }
        Ok(SchemaInfo::from_parts(tables, BTreeMap::new()).filtered(selected))
    }

    async fn get_table_checksum(
        &self,
        cancel: &CancelHandle,
        chat_id: &str,
        table: &str,
    ) -> NeoResult<String> {
        cancel.check()?;
        let session = self.session(chat_id).await?;
        let schema = Self::infer_collection_schema(&session, table).await?;
        Ok(schema.checksum)
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
        let db = session.client.database(&session.database);
        let coll = db.collection::<Document>(table);
        let limit = clamp_example_limit(limit);
        let options = FindOptions::builder().limit(limit as i64).build();
        let cursor = coll
            .find(None, options)
            .await
            .map_err(to_execution_error)?;
        let documents: Vec<Document> = cursor.try_collect().await.map_err(to_execution_error)?;
        Ok(documents.into_iter().map(document_to_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_find_with_modifiers() {
        let parsed = parse_mongo_query(
            r#"db.users.find({"age": {"$gt": 21}}, {"name": 1}).sort({"age": -1}).limit(5)"#,
        )
        .unwrap();
        assert_eq!(parsed.collection.as_deref(), Some("users"));
        assert_eq!(parsed.op, MongoOp::Find);
        assert_eq!(parsed.args.len(), 2);
        assert_eq!(parsed.modifiers.len(), 2);
        assert_eq!(parsed.modifiers[1].0, "limit");
        assert_eq!(parsed.modifiers[1].1, serde_json::json!(5));
    }

    #[test]
    fn parses_aggregate_pipeline() {
        let parsed = parse_mongo_query(
            r#"db.orders.aggregate([{"$match": {"status": "paid"}}, {"$group": {"_id": "$user", "total": {"$sum": "$amount"}}}])"#,
        )
        .unwrap();
        assert_eq!(parsed.op, MongoOp::Aggregate);
        assert!(parsed.args[0].is_array());
    }

    #[test]
    fn parses_create_and_drop() {
        let create = parse_mongo_query(r#"db.createCollection("events")"#).unwrap();
        assert_eq!(create.op, MongoOp::CreateCollection);
        assert!(create.collection.is_none());
        assert_eq!(create.args[0], serde_json::json!("events"));

        let drop = parse_mongo_query("db.events.drop()").unwrap();
        assert_eq!(drop.op, MongoOp::Drop);
        assert_eq!(drop.collection.as_deref(), Some("events"));
    }

    #[test]
    fn commas_inside_literals_do_not_split_args() {
        let parsed = parse_mongo_query(
            r#"db.users.insertOne({"name": "a,b", "tags": ["x", "y"]})"#,
        )
        .unwrap();
        assert_eq!(parsed.args.len(), 1);
        assert_eq!(parsed.args[0]["name"], serde_json::json!("a,b"));
    }

    #[test]
    fn rejects_non_db_input() {
        assert!(parse_mongo_query("SELECT 1").is_err());
        assert!(parse_mongo_query("db.users.explode()").is_err());
        assert!(parse_mongo_query("db.users.find({").is_err());
    }

    #[test]
    fn write_classification_drives_transaction_use() {
        assert!(MongoOp::InsertOne.is_write());
        assert!(MongoOp::Drop.is_write());
        assert!(!MongoOp::Find.is_write());
        assert!(!MongoOp::Aggregate.is_write());
    }
}
