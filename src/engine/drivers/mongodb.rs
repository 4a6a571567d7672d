//! MongoDB Driver
//!
//! Engine client for MongoDB using the official MongoDB driver.
//!
//! ## Query syntax
//!
//! Two shapes are accepted:
//!
//! - shell style: `[db.]collection.operation(<json args>)` with an optional
//!   `.limit(n)`, `.skip(n)`, `.sort({...})` and `.explain()` chain. `db.` is
//!   the shell handle for the connection's database; any other prefix names a
//!   database. Arguments must be strict JSON (quoted keys); extended JSON such
//!   as `{"$oid": "..."}` is understood.
//! - a JSON object: `{"database": "...", "collection": "...", "operation":
//!   "find", "query": {...}}`.
//!
//! Positional parameters do not apply to this engine and are ignored.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, IndexModel};
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::engine::drivers::{elapsed_ms, execution_failure, not_connected_failure, HandleState};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    CancelSupport, ColumnInfo, ColumnSchema, ConnectionStatus, DatabaseSchema, EngineKind,
    IndexSchema, NetworkConfig, QueryId, QueryRequest, QueryResult, Row as QRow, TableKind,
    TableSchema, TableSummary, Value,
};

const KIND: EngineKind = EngineKind::Document;

/// Documents sampled per collection for schema inference
const SCHEMA_SAMPLE_SIZE: i64 = 100;

const SYSTEM_DATABASES: [&str; 3] = ["admin", "config", "local"];

/// A parsed collection operation
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOperation {
    Find { filter: Document, projection: Option<Document> },
    FindOne { filter: Document, projection: Option<Document> },
    Aggregate { pipeline: Vec<Document> },
    CountDocuments { filter: Document },
    Distinct { field: String, filter: Document },
    InsertOne { document: Document },
    InsertMany { documents: Vec<Document> },
    UpdateOne { filter: Document, update: Document },
    UpdateMany { filter: Document, update: Document },
    DeleteOne { filter: Document },
    DeleteMany { filter: Document },
    CreateCollection,
}

impl DocumentOperation {
    pub fn name(&self) -> &'static str {
        match self {
            DocumentOperation::Find { .. } => "find",
            DocumentOperation::FindOne { .. } => "findOne",
            DocumentOperation::Aggregate { .. } => "aggregate",
            DocumentOperation::CountDocuments { .. } => "countDocuments",
            DocumentOperation::Distinct { .. } => "distinct",
            DocumentOperation::InsertOne { .. } => "insertOne",
            DocumentOperation::InsertMany { .. } => "insertMany",
            DocumentOperation::UpdateOne { .. } => "updateOne",
            DocumentOperation::UpdateMany { .. } => "updateMany",
            DocumentOperation::DeleteOne { .. } => "deleteOne",
            DocumentOperation::DeleteMany { .. } => "deleteMany",
            DocumentOperation::CreateCollection => "createCollection",
        }
    }

    pub fn is_mutation(&self) -> bool {
        match self {
            DocumentOperation::Find { .. }
            | DocumentOperation::FindOne { .. }
            | DocumentOperation::CountDocuments { .. }
            | DocumentOperation::Distinct { .. } => false,
            // $out and $merge stages write
            DocumentOperation::Aggregate { pipeline } => pipeline
                .iter()
                .any(|stage| stage.contains_key("$out") || stage.contains_key("$merge")),
            _ => true,
        }
    }
}

/// A fully parsed document-store query
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentQuery {
    /// `None` means the connection's configured database
    pub database: Option<String>,
    pub collection: String,
    pub operation: DocumentOperation,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
    pub sort: Option<Document>,
    pub explain: bool,
}

/// Parses a query in either accepted shape
pub fn parse_query(text: &str) -> EngineResult<DocumentQuery> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(EngineError::syntax_error("Empty query"));
    }
    if trimmed.starts_with('{') {
        return parse_json_query(trimmed);
    }
    parse_shell_query(trimmed)
}

fn parse_json_query(text: &str) -> EngineResult<DocumentQuery> {
    let parsed: Json = serde_json::from_str(text)
        .map_err(|e| EngineError::syntax_error(format!("Invalid JSON: {}", e)))?;

    let database = parsed
        .get("database")
        .and_then(Json::as_str)
        .map(str::to_string);
    let collection = parsed["collection"]
        .as_str()
        .ok_or_else(|| EngineError::syntax_error("Missing 'collection' field"))?
        .to_string();
    let op = parsed
        .get("operation")
        .and_then(Json::as_str)
        .unwrap_or("find");

    let field = |name: &str| parsed.get(name).cloned();
    let filter = field("query").or_else(|| field("filter"));
    let args: Vec<Json> = match op {
        "aggregate" => vec![field("pipeline").unwrap_or(Json::Array(Vec::new()))],
        "distinct" => vec![field("field").unwrap_or(Json::Null), filter.unwrap_or(Json::Null)],
        "insertOne" => field("document").into_iter().collect(),
        "insertMany" => field("documents").into_iter().collect(),
        "updateOne" | "updateMany" => vec![
            filter.unwrap_or(Json::Null),
            field("update").unwrap_or(Json::Null),
        ],
        _ => vec![filter.unwrap_or(Json::Null), field("projection").unwrap_or(Json::Null)],
    };
    let operation = build_operation(op, args)?;

    Ok(DocumentQuery {
        database,
        collection,
        operation,
        limit: parsed.get("limit").and_then(Json::as_i64),
        skip: parsed.get("skip").and_then(Json::as_u64),
        sort: field("sort").map(|s| to_document(s, "sort")).transpose()?,
        explain: parsed.get("explain").and_then(Json::as_bool).unwrap_or(false),
    })
}

fn parse_shell_query(text: &str) -> EngineResult<DocumentQuery> {
    let Some(open) = text.find('(') else {
        // Bare "database.collection" lists the collection
        let parts: Vec<&str> = text.split('.').collect();
        if parts.len() == 2 && parts.iter().all(|p| is_identifier(p)) {
            return Ok(DocumentQuery {
                database: (parts[0] != "db").then(|| parts[0].to_string()),
                collection: parts[1].to_string(),
                operation: build_operation("find", Vec::new())?,
                limit: None,
                skip: None,
                sort: None,
                explain: false,
            });
        }
        return Err(EngineError::syntax_error(
            "Invalid query format. Use collection.operation({...}) or a JSON object",
        ));
    };

    let head = &text[..open];
    let segments: Vec<&str> = head.split('.').map(str::trim).collect();
    let (database, collection, op) = match segments.as_slice() {
        [collection, op] => (None, *collection, *op),
        ["db", collection, op] => (None, *collection, *op),
        [database, collection, op] => (Some(database.to_string()), *collection, *op),
        _ => {
            return Err(EngineError::syntax_error(format!(
                "Cannot resolve collection from '{}'",
                head.trim()
            )))
        }
    };
    if !is_identifier(collection) {
        return Err(EngineError::syntax_error(format!("Invalid collection name '{}'", collection)));
    }

    let (args, mut rest) = split_call(&text[open..])?;
    let operation = build_operation(op, parse_args(op, args)?)?;

    let mut query = DocumentQuery {
        database,
        collection: collection.to_string(),
        operation,
        limit: None,
        skip: None,
        sort: None,
        explain: false,
    };

    loop {
        rest = rest.trim_start();
        if rest.is_empty() || rest == ";" {
            break;
        }
        let Some(chained) = rest.strip_prefix('.') else {
            return Err(EngineError::syntax_error(format!("Unexpected input '{}'", rest)));
        };
        let open = chained
            .find('(')
            .ok_or_else(|| EngineError::syntax_error(format!("Expected a call in '{}'", chained)))?;
        let name = chained[..open].trim();
        let (args, remaining) = split_call(&chained[open..])?;
        let mut values = parse_args(name, args)?;
        match name {
            "limit" => {
                query.limit = Some(values.first().and_then(Json::as_i64).ok_or_else(|| {
                    EngineError::syntax_error("limit() expects an integer")
                })?)
            }
            "skip" => {
                query.skip = Some(values.first().and_then(Json::as_u64).ok_or_else(|| {
                    EngineError::syntax_error("skip() expects a non-negative integer")
                })?)
            }
            "sort" => {
                let spec = if values.is_empty() { Json::Null } else { values.swap_remove(0) };
                query.sort = Some(to_document(spec, "sort")?);
            }
            "explain" => query.explain = true,
            other => {
                return Err(EngineError::syntax_error(format!("Unsupported cursor method '{}'", other)))
            }
        }
        rest = remaining;
    }

    Ok(query)
}

/// Splits `(args)rest` at the matching parenthesis, ignoring parentheses
/// inside string literals.
fn split_call(text: &str) -> EngineResult<(&str, &str)> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok((&text[1..idx], &text[idx + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(EngineError::syntax_error("Unbalanced parentheses"))
}

fn parse_args(op: &str, args: &str) -> EngineResult<Vec<Json>> {
    if args.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&format!("[{}]", args))
        .map_err(|e| EngineError::syntax_error(format!("Invalid arguments to {}(): {}", op, e)))
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '$'))
}

fn to_document(value: Json, what: &str) -> EngineResult<Document> {
    if value.is_null() {
        return Ok(Document::new());
    }
    match Bson::try_from(value) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(_) => Err(EngineError::syntax_error(format!("{} must be a JSON object", what))),
        Err(e) => Err(EngineError::syntax_error(format!("Invalid {}: {}", what, e))),
    }
}

fn to_documents(value: Json, what: &str) -> EngineResult<Vec<Document>> {
    match value {
        Json::Array(items) => items.into_iter().map(|item| to_document(item, what)).collect(),
        _ => Err(EngineError::syntax_error(format!("{} must be a JSON array", what))),
    }
}

fn build_operation(op: &str, args: Vec<Json>) -> EngineResult<DocumentOperation> {
    let mut args = args.into_iter();
    let mut next = || args.next().unwrap_or(Json::Null);

    let operation = match op {
        "find" => DocumentOperation::Find {
            filter: to_document(next(), "filter")?,
            projection: Some(to_document(next(), "projection")?).filter(|p| !p.is_empty()),
        },
        "findOne" => DocumentOperation::FindOne {
            filter: to_document(next(), "filter")?,
            projection: Some(to_document(next(), "projection")?).filter(|p| !p.is_empty()),
        },
        "aggregate" => DocumentOperation::Aggregate {
            pipeline: to_documents(next(), "pipeline")?,
        },
        "countDocuments" | "count" => DocumentOperation::CountDocuments {
            filter: to_document(next(), "filter")?,
        },
        "distinct" => {
            let field = next()
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| EngineError::syntax_error("distinct() expects a field name"))?;
            DocumentOperation::Distinct {
                field,
                filter: to_document(next(), "filter")?,
            }
        }
        "insertOne" => {
            let document = next();
            if !document.is_object() {
                return Err(EngineError::syntax_error("insertOne() expects a document"));
            }
            DocumentOperation::InsertOne {
                document: to_document(document, "document")?,
            }
        }
        "insertMany" => DocumentOperation::InsertMany {
            documents: to_documents(next(), "documents")?,
        },
        "updateOne" | "updateMany" => {
            let filter = to_document(next(), "filter")?;
            let update = next();
            if !update.is_object() {
                return Err(EngineError::syntax_error(format!("{}() expects an update document", op)));
            }
            let update = to_document(update, "update")?;
            if op == "updateOne" {
                DocumentOperation::UpdateOne { filter, update }
            } else {
                DocumentOperation::UpdateMany { filter, update }
            }
        }
        "deleteOne" => DocumentOperation::DeleteOne {
            filter: to_document(next(), "filter")?,
        },
        "deleteMany" => DocumentOperation::DeleteMany {
            filter: to_document(next(), "filter")?,
        },
        "createCollection" | "create_collection" => DocumentOperation::CreateCollection,
        other => {
            return Err(EngineError::syntax_error(format!("Unsupported operation '{}'", other)))
        }
    };
    Ok(operation)
}

/// Cursor limit from the chained `.limit(n)` and the paginated request.
///
/// A chained limit of zero or below means "no limit" to the server, so it
/// never overrides the requested bound.
fn effective_limit(chain: Option<i64>, requested: Option<u64>) -> Option<i64> {
    let chain = chain.filter(|l| *l > 0);
    let requested = requested.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
    match (chain, requested) {
        (Some(chain), Some(requested)) => Some(chain.min(requested)),
        (chain, requested) => chain.or(requested),
    }
}

/// Type label of a BSON value, as reported in column metadata
fn bson_type_name(bson: &Bson) -> &'static str {
    match bson {
        Bson::Null | Bson::Undefined => "null",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        Bson::String(_) | Bson::Symbol(_) => "string",
        Bson::Int32(_) | Bson::Int64(_) => "int",
        Bson::Double(_) => "double",
        Bson::Decimal128(_) => "decimal",
        Bson::Boolean(_) => "boolean",
        Bson::DateTime(_) | Bson::Timestamp(_) => "date",
        Bson::ObjectId(_) => "objectId",
        Bson::Binary(_) => "binary",
        _ => "mixed",
    }
}

/// Union of field names in first-seen order, each with the type of its
/// first non-null value.
fn infer_fields(documents: &[Document]) -> Vec<(String, &'static str)> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut fields: Vec<(String, &'static str)> = Vec::new();
    for doc in documents {
        for (key, value) in doc.iter() {
            if seen.insert(key.as_str()) {
                fields.push((key.clone(), bson_type_name(value)));
            } else if let Some(entry) = fields.iter_mut().find(|(name, _)| name == key) {
                if entry.1 == "null" {
                    entry.1 = bson_type_name(value);
                }
            }
        }
    }
    fields
}

/// MongoDB engine client. Owns one driver client for one named connection.
pub struct MongoClient {
    config: NetworkConfig,
    client: RwLock<Option<Client>>,
    state: HandleState,
}

impl MongoClient {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            state: HandleState::new(),
        }
    }

    /// Builds a connection string from config
    fn build_connection_string(config: &NetworkConfig) -> String {
        let tls = if config.ssl { "true" } else { "false" };
        let port = config.port.unwrap_or(27017);
        match (&config.username, &config.password) {
            (Some(user), password) => {
                let auth_source = config.auth_source.as_deref().unwrap_or("admin");
                format!(
                    "mongodb://{}:{}@{}:{}/{}?authSource={}&tls={}",
                    user,
                    password.as_deref().unwrap_or_default(),
                    config.host,
                    port,
                    config.database,
                    auth_source,
                    tls
                )
            }
            _ => format!("mongodb://{}:{}/{}?tls={}", config.host, port, config.database, tls),
        }
    }

    async fn current_client(&self) -> Option<Client> {
        self.client.read().await.clone()
    }

    async fn require_client(&self) -> EngineResult<Client> {
        self.current_client()
            .await
            .ok_or_else(|| EngineError::native(KIND.display_name(), "connection is not open"))
    }

    fn introspection_error(e: mongodb::error::Error) -> EngineError {
        EngineError::native(KIND.display_name(), format!("schema introspection failed: {}", e))
    }

    /// Converts a BSON value to our universal Value type
    fn bson_to_value(bson: &Bson) -> Value {
        match bson {
            Bson::Null | Bson::Undefined => Value::Null,
            Bson::Boolean(b) => Value::Bool(*b),
            Bson::Int32(i) => Value::Int(*i as i64),
            Bson::Int64(i) => Value::Int(*i),
            Bson::Double(f) => Value::Float(*f),
            Bson::String(s) => Value::Text(s.clone()),
            Bson::Binary(b) => Value::Bytes(b.bytes.clone()),
            Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
            Bson::DateTime(dt) => Value::Text(
                dt.try_to_rfc3339_string()
                    .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
            ),
            Bson::Array(arr) => Value::Array(arr.iter().map(Self::bson_to_value).collect()),
            Bson::Document(_) => Value::Json(bson.clone().into_relaxed_extjson()),
            _ => Value::Text(bson.to_string()),
        }
    }

    /// Rows over the union of fields; missing fields are null
    fn documents_to_result(documents: &[Document], execution_time_ms: f64) -> QueryResult {
        let fields = infer_fields(documents);
        let columns = fields
            .iter()
            .map(|(name, data_type)| {
                ColumnInfo::new(name.clone(), *data_type).with_primary_key(name == "_id")
            })
            .collect();
        let rows = documents
            .iter()
            .map(|doc| QRow {
                values: fields
                    .iter()
                    .map(|(name, _)| doc.get(name).map(Self::bson_to_value).unwrap_or(Value::Null))
                    .collect(),
            })
            .collect();
        QueryResult::with_rows(columns, rows, execution_time_ms)
    }

    fn scalar_result(column: &str, data_type: &str, value: Value, execution_time_ms: f64) -> QueryResult {
        QueryResult::with_rows(
            vec![ColumnInfo::new(column, data_type)],
            vec![QRow { values: vec![value] }],
            execution_time_ms,
        )
    }

    fn explain_command(query: &DocumentQuery) -> EngineResult<Document> {
        let collection = query.collection.as_str();
        let mut command = match &query.operation {
            DocumentOperation::Find { filter, projection } | DocumentOperation::FindOne { filter, projection } => {
                let mut find = doc! { "find": collection, "filter": filter.clone() };
                if let Some(projection) = projection {
                    find.insert("projection", projection.clone());
                }
                if let Some(sort) = &query.sort {
                    find.insert("sort", sort.clone());
                }
                if let Some(limit) = query.limit {
                    find.insert("limit", limit);
                } else if matches!(query.operation, DocumentOperation::FindOne { .. }) {
                    find.insert("limit", 1_i64);
                }
                if let Some(skip) = query.skip {
                    find.insert("skip", skip as i64);
                }
                find
            }
            DocumentOperation::Aggregate { pipeline } => {
                doc! { "aggregate": collection, "pipeline": pipeline.clone(), "cursor": {} }
            }
            DocumentOperation::CountDocuments { filter } => {
                doc! { "count": collection, "query": filter.clone() }
            }
            DocumentOperation::Distinct { field, filter } => {
                doc! { "distinct": collection, "key": field.as_str(), "query": filter.clone() }
            }
            DocumentOperation::UpdateOne { filter, update } | DocumentOperation::UpdateMany { filter, update } => {
                let multi = matches!(query.operation, DocumentOperation::UpdateMany { .. });
                doc! { "update": collection, "updates": [{ "q": filter.clone(), "u": update.clone(), "multi": multi }] }
            }
            DocumentOperation::DeleteOne { filter } | DocumentOperation::DeleteMany { filter } => {
                let limit = if matches!(query.operation, DocumentOperation::DeleteOne { .. }) { 1 } else { 0 };
                doc! { "delete": collection, "deletes": [{ "q": filter.clone(), "limit": limit }] }
            }
            other => {
                return Err(EngineError::not_supported(format!(
                    "explain() is not available for {}",
                    other.name()
                )))
            }
        };
        command = doc! { "explain": command, "verbosity": "queryPlanner" };
        Ok(command)
    }

    async fn run(
        &self,
        client: &Client,
        query: DocumentQuery,
        request: &QueryRequest,
    ) -> Result<QueryResult, EngineError> {
        let native = |e: mongodb::error::Error| EngineError::native(KIND.display_name(), e.to_string());
        let database = client.database(query.database.as_deref().unwrap_or(&self.config.database));
        let collection: Collection<Document> = database.collection(&query.collection);

        if query.explain {
            let command = Self::explain_command(&query)?;
            let start = Instant::now();
            let plan = database.run_command(command).await.map_err(native)?;
            let elapsed = elapsed_ms(start);
            return Ok(Self::scalar_result(
                "plan",
                "object",
                Value::Json(Bson::Document(plan).into_relaxed_extjson()),
                elapsed,
            ));
        }

        let limit = effective_limit(query.limit, request.limit);
        let skip = request.offset.or(query.skip);

        let start = Instant::now();
        let result = match query.operation {
            DocumentOperation::Find { filter, projection } => {
                let cursor = collection
                    .find(filter)
                    .optional(limit, |find, l| find.limit(l))
                    .optional(skip, |find, s| find.skip(s))
                    .optional(query.sort, |find, s| find.sort(s))
                    .optional(projection, |find, p| find.projection(p))
                    .await
                    .map_err(native)?;
                let documents: Vec<Document> = cursor.try_collect().await.map_err(native)?;
                Self::documents_to_result(&documents, elapsed_ms(start))
            }
            DocumentOperation::FindOne { filter, projection } => {
                let found = collection
                    .find_one(filter)
                    .optional(skip, |find, s| find.skip(s))
                    .optional(query.sort, |find, s| find.sort(s))
                    .optional(projection, |find, p| find.projection(p))
                    .await
                    .map_err(native)?;
                let documents: Vec<Document> = found.into_iter().collect();
                Self::documents_to_result(&documents, elapsed_ms(start))
            }
            DocumentOperation::Aggregate { mut pipeline } => {
                if let Some(skip) = skip {
                    pipeline.push(doc! { "$skip": skip as i64 });
                }
                if let Some(limit) = limit {
                    pipeline.push(doc! { "$limit": limit });
                }
                let cursor = collection.aggregate(pipeline).await.map_err(native)?;
                let documents: Vec<Document> = cursor.try_collect().await.map_err(native)?;
                Self::documents_to_result(&documents, elapsed_ms(start))
            }
            DocumentOperation::CountDocuments { filter } => {
                let count = collection.count_documents(filter).await.map_err(native)?;
                Self::scalar_result("count", "int", Value::Int(count as i64), elapsed_ms(start))
            }
            DocumentOperation::Distinct { field, filter } => {
                let values = collection.distinct(&field, filter).await.map_err(native)?;
                let elapsed = elapsed_ms(start);
                let data_type = values.first().map(bson_type_name).unwrap_or("mixed");
                let rows = values
                    .iter()
                    .map(|v| QRow { values: vec![Self::bson_to_value(v)] })
                    .collect();
                QueryResult::with_rows(vec![ColumnInfo::new(field, data_type)], rows, elapsed)
            }
            DocumentOperation::InsertOne { document } => {
                collection.insert_one(document).await.map_err(native)?;
                QueryResult::with_affected_rows(1, elapsed_ms(start))
            }
            DocumentOperation::InsertMany { documents } => {
                let inserted = collection.insert_many(documents).await.map_err(native)?;
                QueryResult::with_affected_rows(inserted.inserted_ids.len() as u64, elapsed_ms(start))
            }
            DocumentOperation::UpdateOne { filter, update } => {
                let updated = collection.update_one(filter, update).await.map_err(native)?;
                QueryResult::with_affected_rows(updated.modified_count, elapsed_ms(start))
            }
            DocumentOperation::UpdateMany { filter, update } => {
                let updated = collection.update_many(filter, update).await.map_err(native)?;
                QueryResult::with_affected_rows(updated.modified_count, elapsed_ms(start))
            }
            DocumentOperation::DeleteOne { filter } => {
                let deleted = collection.delete_one(filter).await.map_err(native)?;
                QueryResult::with_affected_rows(deleted.deleted_count, elapsed_ms(start))
            }
            DocumentOperation::DeleteMany { filter } => {
                let deleted = collection.delete_many(filter).await.map_err(native)?;
                QueryResult::with_affected_rows(deleted.deleted_count, elapsed_ms(start))
            }
            DocumentOperation::CreateCollection => {
                database.create_collection(&query.collection).await.map_err(native)?;
                QueryResult::with_affected_rows(0, elapsed_ms(start))
            }
        };
        Ok(result)
    }

    async fn describe_collection(database: &mongodb::Database, name: String) -> Result<TableSchema, mongodb::error::Error> {
        let collection: Collection<Document> = database.collection(&name);

        // Sample documents to infer schema (MongoDB is schemaless)
        let sample: Vec<Document> = collection
            .find(doc! {})
            .limit(SCHEMA_SAMPLE_SIZE)
            .await?
            .try_collect()
            .await?;

        let indexes: Vec<IndexModel> = collection.list_indexes().await?.try_collect().await?;

        let mut table = TableSchema::new(name, TableKind::Collection);
        table.columns = infer_fields(&sample)
            .into_iter()
            .map(|(field, data_type)| {
                let is_id = field == "_id";
                ColumnSchema::new(field, data_type, !is_id).with_primary_key(is_id)
            })
            .collect();
        table.indexes = indexes
            .into_iter()
            .map(|model| {
                let columns: Vec<String> = model.keys.keys().cloned().collect();
                let options = model.options.unwrap_or_default();
                let name = options.name.unwrap_or_else(|| columns.join("_"));
                let primary = name == "_id_";
                IndexSchema {
                    unique: primary || options.unique.unwrap_or(false),
                    primary,
                    name,
                    columns,
                }
            })
            .collect();
        table.row_count = collection.estimated_document_count().await.ok();
        Ok(table)
    }
}

/// `Option`-driven builder calls on the driver's fluent actions
trait OptionalExt: Sized {
    fn optional<T>(self, value: Option<T>, apply: impl FnOnce(Self, T) -> Self) -> Self {
        match value {
            Some(value) => apply(self, value),
            None => self,
        }
    }
}

impl<T> OptionalExt for T {}

#[async_trait]
impl DataEngine for MongoClient {
    fn kind(&self) -> EngineKind {
        KIND
    }

    async fn status(&self) -> ConnectionStatus {
        self.state.status().await
    }

    async fn last_error(&self) -> Option<String> {
        self.state.last_error().await
    }

    async fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.state.connected_at().await
    }

    #[instrument(skip(self), fields(host = %self.config.host, database = %self.config.database))]
    async fn connect(&self) -> EngineResult<()> {
        self.config.validate()?;

        let mut handle = self.client.write().await;
        if handle.is_some() {
            return Ok(());
        }
        self.state.mark_connecting().await;

        let conn_str = Self::build_connection_string(&self.config);
        let connected = async {
            let mut options = ClientOptions::parse(&conn_str).await?;
            options.server_selection_timeout = Some(Duration::from_secs(10));
            let client = Client::with_options(options)?;
            // Verify connection with ping
            client.database("admin").run_command(doc! { "ping": 1 }).await?;
            Ok::<_, mongodb::error::Error>(client)
        }
        .await;

        match connected {
            Ok(client) => {
                *handle = Some(client);
                self.state.mark_connected().await;
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                let message = if msg.contains("Authentication failed") {
                    format!("authentication failed: {}", msg)
                } else {
                    format!("connection failed: {}", msg)
                };
                self.state.mark_error(message.clone()).await;
                Err(EngineError::native(KIND.display_name(), message))
            }
        }
    }

    async fn disconnect(&self) -> EngineResult<()> {
        // Dropping the last handle closes the driver's connection pool
        self.client.write().await.take();
        self.state.mark_disconnected().await;
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        let Some(client) = self.current_client().await else {
            self.state.mark_error("connection is not open").await;
            return false;
        };

        match client.database("admin").run_command(doc! { "ping": 1 }).await {
            Ok(_) => {
                self.state.mark_healthy().await;
                true
            }
            Err(e) => {
                self.state.mark_error(e.to_string()).await;
                false
            }
        }
    }

    #[instrument(skip(self, request), fields(query_len = request.query.len(), %query_id))]
    async fn execute_query(&self, request: &QueryRequest, query_id: QueryId) -> QueryResult {
        let Some(client) = self.current_client().await else {
            return not_connected_failure(KIND);
        };
        if !request.parameters.is_empty() {
            debug!(count = request.parameters.len(), "ignoring positional parameters");
        }

        let query = match parse_query(&request.query) {
            Ok(query) => query,
            Err(e) => return execution_failure(KIND, e, 0.0),
        };

        match self.run(&client, query, request).await {
            Ok(result) => result,
            Err(e) => execution_failure(KIND, e, 0.0),
        }
    }

    async fn get_schema(&self) -> EngineResult<DatabaseSchema> {
        let client = self.require_client().await?;
        let database = client.database(&self.config.database);

        let mut names = database
            .list_collection_names()
            .await
            .map_err(Self::introspection_error)?;
        names.sort();

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let table = Self::describe_collection(&database, name)
                .await
                .map_err(Self::introspection_error)?;
            tables.push(table);
        }

        Ok(DatabaseSchema::new(self.config.database.clone(), KIND, tables))
    }

    async fn get_databases(&self) -> EngineResult<Vec<String>> {
        let client = self.require_client().await?;

        let databases = client
            .list_database_names()
            .await
            .map_err(|e| EngineError::native(KIND.display_name(), format!("failed to list databases: {}", e)))?;

        Ok(databases
            .into_iter()
            .filter(|db| !SYSTEM_DATABASES.contains(&db.as_str()))
            .collect())
    }

    async fn get_tables(&self, database: Option<&str>) -> EngineResult<Vec<TableSummary>> {
        let client = self.require_client().await?;
        let db = client.database(database.unwrap_or(&self.config.database));

        let mut names = db
            .list_collection_names()
            .await
            .map_err(|e| EngineError::native(KIND.display_name(), format!("failed to list collections: {}", e)))?;
        names.sort();

        Ok(names
            .into_iter()
            .map(|name| TableSummary {
                name,
                kind: TableKind::Collection,
            })
            .collect())
    }

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::None
    }
}
