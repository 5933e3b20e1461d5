//! Query execution against PostgreSQL and MongoDB.
//!
//! Every query runs under the configured statement timeout:
//! - PostgreSQL: `statement_timeout` is set on the session, and a client-side
//!   deadline slightly past it cancels the query on the server if the
//!   server-side timeout did not fire.
//! - MongoDB: reads carry `maxTimeMS` through the driver options; writes and
//!   raw commands are sent as server commands with `maxTimeMS`. Everything is
//!   also raced against a client-side deadline.
//!
//! Results are serialized as JSON into a bounded buffer, so a runaway
//! `SELECT *` cannot grow the output past the cap. PostgreSQL rows are read
//! from the wire one message at a time and never collected.

use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Stream, TryStreamExt};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{
    AggregateOptions, CountOptions, DistinctOptions, EstimatedDocumentCountOptions,
    FindOneOptions, FindOptions,
};
use mongodb::{Collection, Cursor, Database};
use serde_json::{json, Map, Value};
use tokio::select;
use tokio_postgres::{NoTls, SimpleQueryMessage, SimpleQueryRow};

use crate::config::ExecutionLimits;
use crate::error::GateError;
use crate::models::{DatabaseType, ExecutionOutput, ExecutionRequest, InstanceConnectionInfo};
use crate::mongo_shell::{self, ShellCommand};
use crate::services::output::{truncate_text, BoundedOutput};
use crate::services::pool::{PoolManager, PooledConnection};

/// Extra time the client allows past the server-side timeout before it
/// cancels the query itself.
const CLIENT_DEADLINE_SLACK: Duration = Duration::from_secs(1);

/// Restores session state before a connection goes back to the pool.
///
/// `ROLLBACK` discards a transaction the submission opened but never closed.
const SESSION_RESET: &str = "ROLLBACK; RESET ALL";

/// MongoDB `NamespaceNotFound`.
const NAMESPACE_NOT_FOUND: &str = "26";

/// Runs query submissions through pooled driver connections.
pub struct QueryExecutor {
    pools: Arc<PoolManager>,
    limits: ExecutionLimits,
}

impl QueryExecutor {
    pub fn new(pools: Arc<PoolManager>, limits: ExecutionLimits) -> Self {
        Self { pools, limits }
    }

    /// Message reported when a query runs past its deadline.
    pub fn timeout_message(&self) -> String {
        format!("execution timed out after {}s", self.limits.query_timeout_secs)
    }

    /// Execute `query` for `request` against `info`.
    ///
    /// Server-side and client-side timeouts both surface as
    /// `GateError::Timeout` with the same message.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        info: &InstanceConnectionInfo,
        query: &str,
    ) -> Result<ExecutionOutput, GateError> {
        let start = Instant::now();
        let database = request.target_database();

        tracing::debug!(database = %database, "Executing query");

        let result = match request.database_type {
            DatabaseType::Postgresql => self.execute_postgres(info, database, query).await,
            DatabaseType::Mongodb => self.execute_mongo(info, database, query).await,
        };
        let result = result.map_err(|err| {
            if err.is_timeout() {
                GateError::timeout(self.timeout_message())
            } else {
                err
            }
        });

        tracing::debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            success = result.is_ok(),
            "Query finished"
        );
        result
    }

    async fn execute_postgres(
        &self,
        info: &InstanceConnectionInfo,
        database: &str,
        sql: &str,
    ) -> Result<ExecutionOutput, GateError> {
        let timeout = self.limits.query_timeout();
        let deadline = tokio::time::Instant::now() + timeout + CLIENT_DEADLINE_SLACK;

        let pool = self.pools.postgres(info, database)?;
        let conn = select! {
            conn = pool.get() => conn?,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(GateError::timeout(self.timeout_message()));
            }
        };

        conn.batch_execute(&format!("SET statement_timeout = {}", timeout.as_millis())).await?;
        let cancel_token = conn.cancel_token();

        let cap = self.limits.max_output_bytes;
        let outcome = select! {
            result = stream_results(&conn, sql, cap) => Some(result),
            _ = tokio::time::sleep_until(deadline) => None,
        };

        let Some(result) = outcome else {
            tracing::warn!(instance_id = %info.id, database = %database, "Query passed its deadline, cancelling on the server");
            if let Err(err) = cancel_token.cancel_query(NoTls).await {
                tracing::warn!(instance_id = %info.id, error = %err, "Failed to cancel query");
            }
            // The session may still be busy; never hand it to another request.
            conn.detach();
            return Err(GateError::timeout(self.timeout_message()));
        };

        if let Err(err) = conn.batch_execute(SESSION_RESET).await {
            tracing::debug!(instance_id = %info.id, error = %err, "Session reset failed, discarding connection");
            conn.detach();
        }

        result
    }

    async fn execute_mongo(
        &self,
        info: &InstanceConnectionInfo,
        database: &str,
        text: &str,
    ) -> Result<ExecutionOutput, GateError> {
        let command = mongo_shell::parse_command(text)?;
        let max_time = self.limits.query_timeout();
        let cap = self.limits.max_output_bytes;

        let run = async {
            let client = self.pools.mongo(info).await?;
            let name = command.database.as_deref().unwrap_or(database);
            if name.is_empty() && command.method != "adminCommand" {
                return Err(GateError::syntax(
                    "No database selected; set a database name or use db.getSiblingDB(...)",
                ));
            }
            let db = match command.method.as_str() {
                "adminCommand" => client.database("admin"),
                _ => client.database(name),
            };
            run_mongo_command(&db, &command, max_time, cap).await
        };

        match tokio::time::timeout(max_time + CLIENT_DEADLINE_SLACK, run).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(instance_id = %info.id, method = %command.method, "MongoDB command passed its deadline");
                Err(GateError::timeout(self.timeout_message()))
            }
        }
    }
}

// ========== PostgreSQL results ==========

/// Writes simple query protocol results as JSON:
/// `[{"columns": [...], "rows": [{...}], "rowCount": n}, {"rowCount": n}]`.
///
/// Row-returning statements carry `columns` and `rows`; other statements only
/// their affected row count. Values are the server's text representation.
struct ResultSetWriter {
    out: BoundedOutput,
    columns: Option<Vec<String>>,
    rows_in_set: usize,
    sets: usize,
    total_rows: u64,
}

impl ResultSetWriter {
    fn new(cap: usize) -> Self {
        let mut out = BoundedOutput::new(cap);
        out.push(b"[");
        Self { out, columns: None, rows_in_set: 0, sets: 0, total_rows: 0 }
    }

    fn open_set(&mut self, columns: Vec<String>) {
        self.separator();
        self.out.push(br#"{"columns":"#);
        self.push_json(&json!(columns));
        self.out.push(br#","rows":["#);
        self.columns = Some(columns);
        self.rows_in_set = 0;
    }

    fn row(&mut self, row: &SimpleQueryRow) {
        if self.columns.is_none() {
            self.open_set(row.columns().iter().map(|c| c.name().to_string()).collect());
        }
        if self.rows_in_set > 0 {
            self.out.push(b",");
        }
        self.rows_in_set += 1;
        // Keep counting once the cap is hit, but stop building values.
        if self.out.is_truncated() {
            return;
        }
        let columns = self.columns.as_deref().unwrap_or_default();
        let object: Map<String, Value> = columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value = row.get(i).map_or(Value::Null, |v| Value::String(v.to_string()));
                (name.clone(), value)
            })
            .collect();
        self.push_json(&Value::Object(object));
    }

    fn complete(&mut self, count: u64) {
        if self.columns.take().is_some() {
            self.out.push(format!(r#"],"rowCount":{count}}}"#).as_bytes());
        } else {
            self.separator();
            self.out.push(format!(r#"{{"rowCount":{count}}}"#).as_bytes());
        }
        self.total_rows += count;
    }

    fn message(&mut self, message: &SimpleQueryMessage) {
        match message {
            SimpleQueryMessage::RowDescription(columns) => {
                self.open_set(columns.iter().map(|c| c.name().to_string()).collect());
            }
            SimpleQueryMessage::Row(row) => self.row(row),
            SimpleQueryMessage::CommandComplete(count) => self.complete(*count),
            _ => {}
        }
    }

    fn separator(&mut self) {
        if self.sets > 0 {
            self.out.push(b",");
        }
        self.sets += 1;
    }

    fn push_json(&mut self, value: &Value) {
        if let Ok(bytes) = serde_json::to_vec(value) {
            self.out.push(&bytes);
        }
    }

    fn finish(mut self) -> ExecutionOutput {
        if self.columns.take().is_some() {
            // Result set without a completion message; close it anyway.
            let rows = self.rows_in_set;
            self.out.push(format!(r#"],"rowCount":{rows}}}"#).as_bytes());
            self.total_rows += rows as u64;
        }
        self.out.push(b"]");
        let truncated = self.out.is_truncated();
        ExecutionOutput {
            output: self.out.into_string(),
            truncated,
            row_count: Some(self.total_rows),
            exit_code: None,
        }
    }
}

async fn stream_results(conn: &PooledConnection, sql: &str, cap: usize) -> Result<ExecutionOutput, GateError> {
    let messages = conn.simple_query_raw(sql).await?;
    write_messages(messages, cap).await
}

/// Feed server messages to a `ResultSetWriter` one at a time.
///
/// Past the output cap the remaining messages are still read, so every
/// statement runs to completion and its row count is reported, but nothing
/// more is buffered. Stopping early would abort the implicit transaction and
/// roll back writes the submission already made.
async fn write_messages<S>(messages: S, cap: usize) -> Result<ExecutionOutput, GateError>
where
    S: Stream<Item = Result<SimpleQueryMessage, tokio_postgres::Error>>,
{
    let mut messages = pin!(messages);
    let mut writer = ResultSetWriter::new(cap);
    while let Some(message) = messages.try_next().await? {
        writer.message(&message);
    }
    Ok(writer.finish())
}

// ========== MongoDB commands ==========

async fn run_mongo_command(
    db: &Database,
    command: &ShellCommand,
    max_time: Duration,
    cap: usize,
) -> Result<ExecutionOutput, GateError> {
    // Legacy shell aliases run as their modern equivalents.
    let method = match (command.method.as_str(), command.arg(0)) {
        ("insert", Some(Value::Array(_))) => "insertMany",
        ("insert", _) => "insertOne",
        ("remove", _) => "deleteMany",
        ("count", _) => "countDocuments",
        (method, _) => method,
    };
    tracing::trace!(database = %db.name(), collection = ?command.collection, method, "Running MongoDB command");

    match method {
        "find" => {
            let mut options = FindOptions::default();
            options.max_time = Some(max_time);
            options.projection = optional_document(command.arg(1), "projection")?;
            options.sort = optional_document(command.modifier("sort"), "sort")?;
            options.limit = command.modifier("limit").and_then(Value::as_i64);
            options.skip = command.modifier("skip").and_then(Value::as_u64);
            let filter = document_arg(command.arg(0), "filter")?;
            let cursor = collection(db, command)?.find(filter, options).await?;
            collect_cursor(cursor, cap).await
        }
        "findOne" => {
            let mut options = FindOneOptions::default();
            options.max_time = Some(max_time);
            options.projection = optional_document(command.arg(1), "projection")?;
            options.sort = optional_document(command.modifier("sort"), "sort")?;
            let filter = document_arg(command.arg(0), "filter")?;
            let found = collection(db, command)?.find_one(filter, options).await?;
            let value = found.map_or(Value::Null, |doc| Bson::Document(doc).into_relaxed_extjson());
            let count = u64::from(!value.is_null());
            single_result(value, Some(count), cap)
        }
        "aggregate" => {
            let mut options = AggregateOptions::default();
            options.max_time = Some(max_time);
            let pipeline = pipeline_arg(&command.args)?;
            let cursor = collection(db, command)?.aggregate(pipeline, options).await?;
            collect_cursor(cursor, cap).await
        }
        "countDocuments" => {
            let mut options = CountOptions::default();
            options.max_time = Some(max_time);
            let filter = document_arg(command.arg(0), "filter")?;
            let count = collection(db, command)?.count_documents(filter, options).await?;
            single_result(json!({ "count": count }), Some(count), cap)
        }
        "estimatedDocumentCount" => {
            let mut options = EstimatedDocumentCountOptions::default();
            options.max_time = Some(max_time);
            let count = collection(db, command)?.estimated_document_count(options).await?;
            single_result(json!({ "count": count }), Some(count), cap)
        }
        "distinct" => {
            let field = match command.arg(0) {
                Some(Value::String(field)) => field.clone(),
                _ => return Err(GateError::syntax("distinct() expects a field name")),
            };
            let mut options = DistinctOptions::default();
            options.max_time = Some(max_time);
            let filter = document_arg(command.arg(1), "filter")?;
            let values = collection(db, command)?.distinct(field, filter, options).await?;
            let count = values.len() as u64;
            let values: Vec<Value> = values.into_iter().map(Bson::into_relaxed_extjson).collect();
            single_result(Value::Array(values), Some(count), cap)
        }
        "insertOne" | "insertMany" => {
            let name = collection_name(command)?;
            let docs = if method == "insertOne" {
                vec![required_document(command.arg(0), "document")?]
            } else {
                document_list(command.arg(0), "documents")?
            };
            let docs: Vec<Document> = docs.into_iter().map(with_object_id).collect();
            let ids: Vec<Value> =
                docs.iter().filter_map(|doc| doc.get("_id")).map(|id| id.clone().into_relaxed_extjson()).collect();
            let reply = run_write(db, doc! { "insert": name, "documents": docs, "ordered": true }, max_time).await?;
            let inserted = count_field(&reply, "n");
            let value = match (method, ids.first()) {
                ("insertOne", Some(id)) => json!({ "acknowledged": true, "insertedId": id }),
                _ => json!({ "acknowledged": true, "insertedIds": ids }),
            };
            single_result(value, Some(inserted), cap)
        }
        "updateOne" | "updateMany" | "replaceOne" => {
            let name = collection_name(command)?;
            let filter = document_arg(command.arg(0), "filter")?;
            let update = match method {
                "replaceOne" => Bson::Document(required_document(command.arg(1), "replacement")?),
                _ => update_arg(command.arg(1))?,
            };
            let multi = method == "updateMany";
            let upsert = upsert_flag(command.arg(2)).unwrap_or(false);
            let statement = doc! { "q": filter, "u": update, "multi": multi, "upsert": upsert };
            let reply = run_write(db, doc! { "update": name, "updates": [statement] }, max_time).await?;
            let upserted_id = reply
                .get_array("upserted")
                .ok()
                .and_then(|ids| ids.first())
                .and_then(Bson::as_document)
                .and_then(|entry| entry.get("_id"))
                .map(|id| id.clone().into_relaxed_extjson());
            let matched = count_field(&reply, "n").saturating_sub(u64::from(upserted_id.is_some()));
            let modified = count_field(&reply, "nModified");
            let value = json!({
                "acknowledged": true,
                "matchedCount": matched,
                "modifiedCount": modified,
                "upsertedId": upserted_id,
            });
            single_result(value, Some(modified), cap)
        }
        "deleteOne" | "deleteMany" => {
            let name = collection_name(command)?;
            let filter = document_arg(command.arg(0), "filter")?;
            let limit = i32::from(method == "deleteOne");
            let statement = doc! { "q": filter, "limit": limit };
            let reply = run_write(db, doc! { "delete": name, "deletes": [statement] }, max_time).await?;
            let deleted = count_field(&reply, "n");
            single_result(json!({ "acknowledged": true, "deletedCount": deleted }), Some(deleted), cap)
        }
        "drop" => {
            let name = collection_name(command)?;
            match run_write(db, doc! { "drop": name }, max_time).await {
                Ok(_) => {}
                // Dropping a collection that does not exist is not a failure.
                Err(err) if err.code() == Some(NAMESPACE_NOT_FOUND) => {}
                Err(err) => return Err(err),
            }
            single_result(json!({ "dropped": name }), None, cap)
        }
        "dropDatabase" => {
            run_write(db, doc! { "dropDatabase": 1 }, max_time).await?;
            single_result(json!({ "dropped": db.name() }), None, cap)
        }
        "runCommand" | "adminCommand" => {
            let doc = required_document(command.arg(0), "command")?;
            let reply = run_write(db, doc, max_time).await?;
            single_result(Bson::Document(reply).into_relaxed_extjson(), None, cap)
        }
        other => Err(GateError::syntax(format!(
            "Unsupported MongoDB method `{other}`; use db.runCommand(...) for other commands"
        ))),
    }
}

fn collection(db: &Database, command: &ShellCommand) -> Result<Collection<Document>, GateError> {
    collection_name(command).map(|name| db.collection::<Document>(name))
}

fn collection_name(command: &ShellCommand) -> Result<&str, GateError> {
    command
        .collection
        .as_deref()
        .ok_or_else(|| GateError::syntax(format!("{}() requires a collection", command.method)))
}

/// Run a write or raw command with `maxTimeMS`, so the server aborts it at
/// the deadline instead of finishing it after the client gave up.
///
/// Per-document failures reported in `writeErrors` become errors.
async fn run_write(db: &Database, command: Document, max_time: Duration) -> Result<Document, GateError> {
    let reply = db.run_command(with_max_time(command, max_time), None).await?;
    check_write_reply(&reply)?;
    Ok(reply)
}

/// Add `maxTimeMS` unless the command already sets it.
fn with_max_time(mut command: Document, max_time: Duration) -> Document {
    if !command.contains_key("maxTimeMS") {
        let millis = i64::try_from(max_time.as_millis()).unwrap_or(i64::MAX);
        command.insert("maxTimeMS", millis);
    }
    command
}

fn check_write_reply(reply: &Document) -> Result<(), GateError> {
    let first_write_error = reply
        .get_array("writeErrors")
        .ok()
        .and_then(|errors| errors.first())
        .and_then(Bson::as_document);
    let failure = first_write_error.or_else(|| reply.get_document("writeConcernError").ok());
    match failure {
        Some(failure) => {
            let code = failure.get_i32("code").unwrap_or_default();
            let message = failure.get_str("errmsg").unwrap_or("write failed");
            Err(GateError::mongo_server(code, message))
        }
        None => Ok(()),
    }
}

/// Numeric reply field as a count; absent or non-numeric is zero.
fn count_field(reply: &Document, key: &str) -> u64 {
    match reply.get(key) {
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or(0),
        Some(Bson::Double(n)) if *n >= 0.0 => *n as u64,
        _ => 0,
    }
}

/// Give a document an `_id` up front, as the driver does, so inserted ids
/// can be reported from a raw `insert` command.
fn with_object_id(doc: Document) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut with_id = doc! { "_id": ObjectId::new() };
    with_id.extend(doc);
    with_id
}

/// Write cursor documents as a JSON array, stopping once the cap is reached.
async fn collect_cursor(
    mut cursor: Cursor<Document>,
    cap: usize,
) -> Result<ExecutionOutput, GateError> {
    let mut out = BoundedOutput::new(cap);
    let mut count: u64 = 0;
    out.push(b"[");
    while let Some(doc) = cursor.try_next().await? {
        if count > 0 {
            out.push(b",");
        }
        out.push(&serde_json::to_vec(&Bson::Document(doc).into_relaxed_extjson())?);
        count += 1;
        if out.is_truncated() {
            // Dropping the cursor kills it on the server.
            break;
        }
    }
    out.push(b"]");
    let truncated = out.is_truncated();
    Ok(ExecutionOutput { output: out.into_string(), truncated, row_count: Some(count), exit_code: None })
}

fn single_result(value: Value, row_count: Option<u64>, cap: usize) -> Result<ExecutionOutput, GateError> {
    let mut output = serde_json::to_string(&value)?;
    let truncated = truncate_text(&mut output, cap);
    Ok(ExecutionOutput { output, truncated, row_count, exit_code: None })
}

// ========== Argument conversion ==========

fn to_bson(value: &Value, what: &str) -> Result<Bson, GateError> {
    Bson::try_from(value.clone()).map_err(|e| GateError::syntax(format!("Invalid {what}: {e}")))
}

/// Document argument; missing or `null` means an empty document.
fn document_arg(value: Option<&Value>, what: &str) -> Result<Document, GateError> {
    Ok(optional_document(value, what)?.unwrap_or_default())
}

fn optional_document(value: Option<&Value>, what: &str) -> Result<Option<Document>, GateError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match to_bson(value, what)? {
            Bson::Document(doc) => Ok(Some(doc)),
            _ => Err(GateError::syntax(format!("{what} must be a document"))),
        },
    }
}

fn required_document(value: Option<&Value>, what: &str) -> Result<Document, GateError> {
    optional_document(value, what)?.ok_or_else(|| GateError::syntax(format!("Missing {what}")))
}

fn document_list(value: Option<&Value>, what: &str) -> Result<Vec<Document>, GateError> {
    match value {
        Some(Value::Array(items)) => {
            items.iter().map(|item| required_document(Some(item), what)).collect()
        }
        _ => Err(GateError::syntax(format!("{what} must be an array of documents"))),
    }
}

/// `aggregate([stage, ...])` or the legacy `aggregate(stage, stage, ...)`.
fn pipeline_arg(args: &[Value]) -> Result<Vec<Document>, GateError> {
    match args {
        [] => Ok(Vec::new()),
        [Value::Array(_)] => document_list(args.first(), "pipeline"),
        stages => stages.iter().map(|stage| required_document(Some(stage), "pipeline stage")).collect(),
    }
}

/// Update document or aggregation pipeline.
/// Update document, or an aggregation pipeline as an array of stages.
fn update_arg(value: Option<&Value>) -> Result<Bson, GateError> {
    match value {
        Some(Value::Array(_)) => Ok(Bson::from(document_list(value, "update pipeline")?)),
        _ => Ok(Bson::Document(required_document(value, "update")?)),
    }
}

fn upsert_flag(options: Option<&Value>) -> Option<bool> {
    options.and_then(|o| o.get("upsert")).and_then(Value::as_bool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::models::ErrorKind;

    fn executor(query_timeout_secs: u64) -> QueryExecutor {
        let limits = ExecutionLimits { query_timeout_secs, ..ExecutionLimits::default() };
        QueryExecutor::new(Arc::new(PoolManager::open(PoolSettings::default())), limits)
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(executor(30).timeout_message(), "execution timed out after 30s");
        assert_eq!(executor(5).timeout_message(), "execution timed out after 5s");
    }

    #[test]
    fn test_result_writer_command_only() {
        let mut writer = ResultSetWriter::new(1024);
        writer.complete(3);
        writer.complete(0);
        let output = writer.finish();
        assert_eq!(output.output, r#"[{"rowCount":3},{"rowCount":0}]"#);
        assert_eq!(output.row_count, Some(3));
        assert!(!output.truncated);
    }

    #[test]
    fn test_result_writer_empty_result_set() {
        let mut writer = ResultSetWriter::new(1024);
        writer.open_set(vec!["id".to_string(), "name".to_string()]);
        writer.complete(0);
        writer.complete(2);
        let output = writer.finish();
        let parsed: Value = serde_json::from_str(&output.output).unwrap();
        assert_eq!(parsed[0]["columns"], json!(["id", "name"]));
        assert_eq!(parsed[0]["rows"], json!([]));
        assert_eq!(parsed[1]["rowCount"], json!(2));
    }

    #[test]
    fn test_result_writer_bounds_output() {
        let mut writer = ResultSetWriter::new(16);
        writer.open_set(vec!["a_rather_long_column_name".to_string()]);
        writer.complete(1_000_000);
        let output = writer.finish();
        assert!(output.truncated);
        assert!(output.output.len() <= 16 + crate::services::output::TRUNCATION_MARKER.len());
        assert_eq!(output.row_count, Some(1_000_000));
    }

    #[tokio::test]
    async fn test_write_messages_reads_every_statement_past_the_cap() {
        let messages: Vec<Result<SimpleQueryMessage, tokio_postgres::Error>> =
            (1..=500).map(|n| Ok(SimpleQueryMessage::CommandComplete(n))).collect();
        let output = write_messages(futures_util::stream::iter(messages), 64).await.unwrap();
        assert!(output.truncated);
        assert!(output.output.len() <= 64 + crate::services::output::TRUNCATION_MARKER.len());
        // Counts keep accumulating after the cap.
        assert_eq!(output.row_count, Some(500 * 501 / 2));
    }

    #[tokio::test]
    async fn test_write_messages_empty_stream() {
        let messages = futures_util::stream::iter(Vec::<Result<SimpleQueryMessage, tokio_postgres::Error>>::new());
        let output = write_messages(messages, 1024).await.unwrap();
        assert_eq!(output.output, "[]");
        assert_eq!(output.row_count, Some(0));
        assert!(!output.truncated);
    }

    #[test]
    fn test_document_arg_conversions() {
        assert!(document_arg(None, "filter").unwrap().is_empty());
        assert!(document_arg(Some(&Value::Null), "filter").unwrap().is_empty());

        let filter = document_arg(Some(&json!({ "age": { "$gt": 21 } })), "filter").unwrap();
        assert!(filter.get_document("age").is_ok());

        let err = document_arg(Some(&json!(5)), "filter").unwrap_err();
        assert_eq!(err.category(), "Syntax");
    }

    #[test]
    fn test_extended_json_arguments() {
        let value = mongo_shell::parse_relaxed_json(r#"{ _id: ObjectId("507f1f77bcf86cd799439011") }"#)
            .unwrap();
        let doc = document_arg(Some(&value), "filter").unwrap();
        assert!(doc.get_object_id("_id").is_ok());
    }

    #[test]
    fn test_pipeline_forms() {
        let array = vec![json!([{ "$match": { "a": 1 } }, { "$limit": 5 }])];
        assert_eq!(pipeline_arg(&array).unwrap().len(), 2);

        let spread = vec![json!({ "$match": { "a": 1 } }), json!({ "$limit": 5 })];
        assert_eq!(pipeline_arg(&spread).unwrap().len(), 2);

        assert!(pipeline_arg(&[]).unwrap().is_empty());
        assert!(pipeline_arg(&[json!("nope")]).is_err());
    }

    #[test]
    fn test_update_arg_forms() {
        let update = update_arg(Some(&json!({ "$set": { "a": 1 } }))).unwrap();
        assert!(matches!(update, Bson::Document(_)));

        let pipeline = update_arg(Some(&json!([{ "$set": { "a": 1 } }]))).unwrap();
        assert!(matches!(pipeline, Bson::Array(ref stages) if stages.len() == 1));

        assert!(update_arg(None).is_err());
        assert_eq!(upsert_flag(Some(&json!({ "upsert": true }))), Some(true));
        assert_eq!(upsert_flag(None), None);
    }

    #[test]
    fn test_single_result_truncates() {
        let output = single_result(json!({ "payload": "x".repeat(100) }), None, 10).unwrap();
        assert!(output.truncated);
        assert!(output.output.ends_with(crate::services::output::TRUNCATION_MARKER));
    }

    #[test]
    fn test_write_commands_carry_max_time() {
        let command = with_max_time(doc! { "delete": "users", "deletes": [] }, Duration::from_secs(30));
        assert_eq!(command.get_i64("maxTimeMS").unwrap(), 30_000);
        // The command name stays first for the server.
        assert_eq!(command.keys().next().map(String::as_str), Some("delete"));

        let explicit = with_max_time(doc! { "ping": 1, "maxTimeMS": 5 }, Duration::from_secs(30));
        assert_eq!(explicit.get_i32("maxTimeMS").unwrap(), 5);
    }

    #[test]
    fn test_write_reply_errors() {
        assert!(check_write_reply(&doc! { "ok": 1, "n": 2 }).is_ok());

        let duplicate = doc! {
            "ok": 1,
            "n": 0,
            "writeErrors": [{ "index": 0, "code": 11000, "errmsg": "E11000 duplicate key" }],
        };
        let err = check_write_reply(&duplicate).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);
        assert_eq!(err.code(), Some("11000"));

        let exceeded = doc! { "ok": 1, "n": 1, "writeConcernError": { "code": 50, "errmsg": "operation exceeded time limit" } };
        assert_eq!(check_write_reply(&exceeded).unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_reply_counts() {
        let reply = doc! { "n": 3, "nModified": 2_i64, "other": 1.0 };
        assert_eq!(count_field(&reply, "n"), 3);
        assert_eq!(count_field(&reply, "nModified"), 2);
        assert_eq!(count_field(&reply, "other"), 1);
        assert_eq!(count_field(&reply, "missing"), 0);
        assert_eq!(count_field(&doc! { "n": -1 }, "n"), 0);
    }

    #[test]
    fn test_inserted_documents_get_ids_up_front() {
        let with_id = with_object_id(doc! { "name": "ada" });
        assert!(matches!(with_id.get("_id"), Some(Bson::ObjectId(_))));
        assert_eq!(with_id.keys().next().map(String::as_str), Some("_id"));
        assert_eq!(with_id.get_str("name").unwrap(), "ada");

        let kept = with_object_id(doc! { "_id": 7, "name": "bob" });
        assert_eq!(kept.get_i32("_id").unwrap(), 7);
    }

    #[tokio::test]
    async fn test_mongo_syntax_error_before_connecting() {
        let executor = executor(5);
        let info = InstanceConnectionInfo::builder().host("127.0.0.1").port(1).database("app").build();
        let request = ExecutionRequest::query(DatabaseType::Mongodb, info.clone(), "db.users.find({");
        let err = executor.execute(&request, &info, "db.users.find({").await.unwrap_err();
        assert_eq!(err.category(), "Syntax");
        assert!(executor.pools.is_empty());
    }

    #[tokio::test]
    async fn test_mongo_unsupported_method() {
        let executor = executor(5);
        let info = InstanceConnectionInfo::builder().host("127.0.0.1").port(1).database("app").build();
        let query = "db.users.mapReduce({})";
        let request = ExecutionRequest::query(DatabaseType::Mongodb, info.clone(), query);
        let err = executor.execute(&request, &info, query).await.unwrap_err();
        assert_eq!(err.category(), "Syntax");
        assert!(err.to_string().contains("mapReduce"));
    }

    #[tokio::test]
    async fn test_postgres_unreachable_is_connection_error() {
        let executor = executor(5);
        let info = InstanceConnectionInfo::builder()
            .host("127.0.0.1")
            .port(1)
            .database("app")
            .username("app")
            .password("secret")
            .build();
        let request = ExecutionRequest::query(DatabaseType::Postgresql, info.clone(), "SELECT 1");
        let err = executor.execute(&request, &info, "SELECT 1").await.unwrap_err();
        assert!(matches!(err.category(), "Connection" | "Timeout"), "unexpected: {err}");
    }
}
