//! Query Service
//!
//! Runs queries through the connection service with validation, read-only
//! enforcement, pagination, timeouts, cancellation, history and metrics.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, field, info, instrument, warn};

use crate::config::QueryServiceConfig;
use crate::engine::connection_service::ConnectionService;
use crate::engine::error::EngineError;
use crate::engine::query_manager::QueryManager;
use crate::engine::{sql_safety, sql_text};
use crate::engine::types::{
    ColumnInfo, EngineKind, QueryId, QueryRequest, QueryResult, Row, ValidationError, ValidationResult, Value,
};
use crate::query::history::{HistoryEntry, PerformanceLog, PerformanceMetric, QueryHistory};
use crate::query::pagination::{self, Limits, PageRequest};
use crate::query::validator;
use crate::schema::SchemaService;

const READ_ONLY_BLOCKED: &str = "Operation blocked: read-only mode";

/// Per-call options for `execute_query`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(flatten)]
    pub page: PageRequest,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Caller-chosen id, so the query can be cancelled while it runs
    #[serde(default)]
    pub query_id: Option<QueryId>,
}

pub struct QueryService {
    config: QueryServiceConfig,
    connections: Arc<ConnectionService>,
    schemas: Arc<SchemaService>,
    queries: QueryManager,
    history: RwLock<QueryHistory>,
    metrics: RwLock<PerformanceLog>,
}

impl QueryService {
    pub fn new(
        config: QueryServiceConfig,
        connections: Arc<ConnectionService>,
        schemas: Arc<SchemaService>,
    ) -> Self {
        Self {
            history: RwLock::new(QueryHistory::new(config.max_history_size)),
            metrics: RwLock::new(PerformanceLog::new(config.max_metrics_size)),
            queries: QueryManager::new(),
            config,
            connections,
            schemas,
        }
    }

    fn limits(&self) -> Limits {
        Limits {
            default_limit: self.config.default_limit,
            max_limit: self.config.max_limit,
        }
    }

    /// Executes a query. Never fails: every problem is reported through
    /// `QueryResult::error`.
    #[instrument(
        skip(self, query, parameters, options),
        fields(connection_id = %connection_id, query_len = query.len(), engine = field::Empty)
    )]
    pub async fn execute_query(
        &self,
        connection_id: &str,
        query: &str,
        parameters: Vec<Value>,
        options: QueryOptions,
    ) -> QueryResult {
        let Some(kind) = self.connections.engine_kind_of(connection_id).await else {
            return QueryResult::failure(EngineError::not_found(connection_id).to_string(), 0.0);
        };
        tracing::Span::current().record("engine", field::display(kind));

        let validation = if self.config.enable_validation {
            let validation = self.validate_query(connection_id, query).await;
            if !validation.is_valid {
                let mut result = QueryResult::failure(
                    EngineError::validation(validation.error_messages().join("; ")).to_string(),
                    0.0,
                );
                result.warnings = validation.warning_messages();
                result.metadata_mut().validation = Some(validation);
                return result;
            }
            Some(validation)
        } else {
            None
        };

        if let Some(blocked) = self.read_only_refusal(connection_id, kind, query).await {
            return blocked;
        }

        let mut request = QueryRequest::new(connection_id, query).with_parameters(parameters);
        let applied = pagination::apply(kind, &mut request, &options.page, self.limits());
        if applied.limit.is_some() {
            debug!(limit = ?applied.limit, offset = ?applied.offset, "pagination applied");
        }
        let warnings = validation
            .as_ref()
            .map(ValidationResult::warning_messages)
            .unwrap_or_default();

        if options.dry_run {
            let mut result = QueryResult::empty();
            result.warnings = warnings;
            let metadata = result.metadata_mut();
            metadata.dry_run = true;
            metadata.executed_query = Some(request.query);
            metadata.validation = validation;
            return result;
        }

        let timeout_ms = options.timeout_ms.unwrap_or(self.config.query_timeout_ms);
        request.timeout_ms = Some(timeout_ms);

        let (query_id, token) = match options.query_id {
            Some(query_id) => match self.queries.register_with_id(connection_id, query_id).await {
                Ok(token) => (query_id, token),
                Err(e) => return QueryResult::failure(e.to_string(), 0.0),
            },
            None => self.queries.register(connection_id).await,
        };

        let start = Instant::now();
        let mut result = tokio::select! {
            result = self.connections.execute_query(&request, query_id) => result,
            _ = sleep(Duration::from_millis(timeout_ms)) => {
                token.cancel();
                self.try_native_cancel(connection_id, query_id).await;
                warn!(%query_id, timeout_ms, "query timed out");
                QueryResult::failure(EngineError::timeout(timeout_ms).to_string(), start.elapsed().as_secs_f64() * 1000.0)
            }
            _ = token.cancelled() => {
                QueryResult::failure(EngineError::Cancelled.to_string(), start.elapsed().as_secs_f64() * 1000.0)
            }
        };
        self.queries.finish(query_id).await;

        if !result.is_error() && kind.is_sql() && changes_structure(&request.query) {
            self.schemas.invalidate(connection_id).await;
        }

        result.warnings.extend(warnings);
        let metadata = result.metadata_mut();
        metadata.query_id = Some(query_id.to_string());
        metadata.executed_query = Some(request.query.clone());
        metadata.validation = validation;

        self.record(connection_id, query, query_id, request.parameters, &result, options.tags)
            .await;
        result
    }

    /// Mutations on read-only connections are refused before dispatch.
    /// Text that cannot be classified is refused too.
    async fn read_only_refusal(&self, connection_id: &str, kind: EngineKind, query: &str) -> Option<QueryResult> {
        if !self.connections.is_read_only(connection_id).await.unwrap_or(false) {
            return None;
        }
        match sql_safety::analyze(kind, query) {
            Ok(analysis) if !analysis.is_mutation => None,
            Ok(_) => Some(QueryResult::failure(READ_ONLY_BLOCKED, 0.0)),
            Err(e) => Some(QueryResult::failure(format!("{READ_ONLY_BLOCKED}: {e}"), 0.0)),
        }
    }

    async fn try_native_cancel(&self, connection_id: &str, query_id: QueryId) {
        if let Err(e) = self.connections.cancel_native(connection_id, query_id).await {
            debug!(%query_id, error = %e, "native cancel unavailable");
        }
    }

    async fn record(
        &self,
        connection_id: &str,
        query: &str,
        query_id: QueryId,
        parameters: Vec<Value>,
        result: &QueryResult,
        tags: Vec<String>,
    ) {
        let metric = PerformanceMetric::from_result(&query_id.to_string(), connection_id, query, result);

        if self.config.enable_performance_tracking {
            self.metrics.write().await.record(metric.clone());
        }

        if self.config.enable_history {
            let mut entry = HistoryEntry::new(metric, parameters, result.clone());
            entry.tags = tags;
            self.history.write().await.record(entry);
        }
    }

    /// Validates against the connection's cached schema. Table checks are
    /// skipped when the schema cannot be loaded.
    pub async fn validate_query(&self, connection_id: &str, query: &str) -> ValidationResult {
        let Some(kind) = self.connections.engine_kind_of(connection_id).await else {
            return ValidationResult {
                is_valid: false,
                errors: vec![ValidationError {
                    line: 1,
                    column: 1,
                    message: EngineError::not_found(connection_id).to_string(),
                    severity: crate::engine::types::Severity::Error,
                }],
                warnings: Vec::new(),
            };
        };

        let schema = match self.schemas.get_schema(connection_id, false).await {
            Ok(schema) => Some(schema),
            Err(e) => {
                debug!(connection_id, error = %e, "validating without schema");
                None
            }
        };
        validator::validate(kind, query, schema.as_deref())
    }

    /// Runs the engine's explain form and returns the plan as one JSON cell
    #[instrument(skip(self, query), fields(connection_id = %connection_id))]
    pub async fn explain_query(&self, connection_id: &str, query: &str) -> QueryResult {
        let Some(kind) = self.connections.engine_kind_of(connection_id).await else {
            return QueryResult::failure(EngineError::not_found(connection_id).to_string(), 0.0);
        };
        // Some explain forms execute the statement
        if let Some(blocked) = self.read_only_refusal(connection_id, kind, query).await {
            return blocked;
        }

        let explain = match explain_text(kind, query) {
            Ok(text) => text,
            Err(e) => return QueryResult::failure(e.to_string(), 0.0),
        };
        let request = QueryRequest::new(connection_id, explain);
        let result = self.connections.execute_query(&request, QueryId::new()).await;
        if result.is_error() {
            return result;
        }

        let plan = match kind {
            EngineKind::Embedded => merge_query_plan(&result),
            _ => first_json_cell(&result),
        };
        QueryResult::with_rows(
            vec![ColumnInfo::new("plan", "json")],
            vec![Row {
                values: vec![Value::Json(plan)],
            }],
            result.execution_time_ms,
        )
    }

    /// Cancels a running query. False when the id is not in flight.
    pub async fn cancel_query(&self, query_id: QueryId) -> bool {
        let Some(connection_id) = self.queries.cancel(query_id).await else {
            return false;
        };
        self.try_native_cancel(&connection_id, query_id).await;
        info!(%query_id, connection_id = %connection_id, "query cancelled");
        true
    }

    pub async fn get_query_history(&self, connection_id: Option<&str>, limit: Option<usize>) -> Vec<HistoryEntry> {
        self.history.read().await.entries(connection_id, limit)
    }

    pub async fn search_query_history(&self, term: &str, connection_id: Option<&str>) -> Vec<HistoryEntry> {
        self.history.read().await.search(term, connection_id)
    }

    pub async fn add_to_favorites(&self, entry_id: &str) -> bool {
        self.history.write().await.set_favorite(entry_id, true)
    }

    pub async fn remove_from_favorites(&self, entry_id: &str) -> bool {
        self.history.write().await.set_favorite(entry_id, false)
    }

    pub async fn get_favorite_queries(&self) -> Vec<HistoryEntry> {
        self.history.read().await.favorites()
    }

    pub async fn get_performance_metrics(&self, connection_id: Option<&str>) -> Vec<PerformanceMetric> {
        self.metrics.read().await.metrics(connection_id)
    }

    /// Metrics with `execution_time > threshold_ms`
    pub async fn get_slow_queries(&self, threshold_ms: f64) -> Vec<PerformanceMetric> {
        self.metrics.read().await.slow(threshold_ms)
    }

    /// Clears history and metrics for one connection, or all of them
    pub async fn clear_history(&self, connection_id: Option<&str>) {
        self.history.write().await.clear(connection_id);
        self.metrics.write().await.clear(connection_id);
    }
}

fn changes_structure(query: &str) -> bool {
    matches!(
        sql_text::leading_keyword(query).as_str(),
        "CREATE" | "ALTER" | "DROP" | "RENAME" | "TRUNCATE"
    )
}

fn explain_text(kind: EngineKind, query: &str) -> Result<String, EngineError> {
    let query = query.trim().trim_end_matches(';');
    Ok(match kind {
        EngineKind::RelationalA => format!("EXPLAIN (FORMAT JSON, ANALYZE, BUFFERS) {}", query),
        EngineKind::RelationalB => format!("EXPLAIN FORMAT=JSON {}", query),
        EngineKind::Embedded => format!("EXPLAIN QUERY PLAN {}", query),
        EngineKind::Document if query.starts_with('{') => {
            let mut parsed: Json = serde_json::from_str(query)
                .map_err(|e| EngineError::syntax_error(format!("Invalid JSON: {}", e)))?;
            let object = parsed
                .as_object_mut()
                .ok_or_else(|| EngineError::syntax_error("Query must be a JSON object"))?;
            object.insert("explain".to_string(), Json::Bool(true));
            parsed.to_string()
        }
        EngineKind::Document if query.ends_with(".explain()") => query.to_string(),
        EngineKind::Document => format!("{}.explain()", query),
    })
}

/// `EXPLAIN QUERY PLAN` rows (id, parent, notused, detail) as one document
fn merge_query_plan(result: &QueryResult) -> Json {
    let position = |name: &str| result.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name));
    let (id_col, parent_col, detail_col) = (position("id"), position("parent"), position("detail"));
    let cell = |row: &Row, col: Option<usize>| col.and_then(|i| row.values.get(i)).cloned().unwrap_or(Value::Null);

    let steps: Vec<(i64, i64, String)> = result
        .rows
        .iter()
        .map(|row| {
            let as_int = |v: Value| match v {
                Value::Int(i) => i,
                _ => 0,
            };
            let detail = match cell(row, detail_col) {
                Value::Text(text) => text,
                other => other.to_json().to_string(),
            };
            (as_int(cell(row, id_col)), as_int(cell(row, parent_col)), detail)
        })
        .collect();

    let mut depth_of: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
    let mut formatted = Vec::with_capacity(steps.len());
    for (id, parent, detail) in &steps {
        let depth = depth_of.get(parent).map(|d| d + 1).unwrap_or(0);
        depth_of.insert(*id, depth);
        formatted.push(format!("{}{}", "  ".repeat(depth), detail));
    }

    json!({
        "plan": steps
            .iter()
            .map(|(id, parent, detail)| json!({ "id": id, "parent": parent, "detail": detail }))
            .collect::<Vec<_>>(),
        "formatted": formatted.join("\n"),
    })
}

/// First cell of the first row, parsed when the engine returned JSON text
fn first_json_cell(result: &QueryResult) -> Json {
    match result.rows.first().and_then(|row| row.values.first()) {
        Some(Value::Text(text)) => serde_json::from_str(text).unwrap_or_else(|_| Json::String(text.clone())),
        Some(value) => value.to_json(),
        None => Json::Null,
    }
}
