//! PostgreSQL Driver
//!
//! Engine client for PostgreSQL using SQLx. Result-column flags and schema
//! structure come from `information_schema` and `pg_catalog`.
//!
//! ## Cancellation
//!
//! Each running query is tracked with the backend pid of the pooled
//! connection it runs on, so `cancel()` can issue `pg_cancel_backend`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{Column, Row, TypeInfo};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument};

use crate::engine::drivers::{elapsed_ms, execution_failure, not_connected_failure, HandleState};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::sql_text;
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    CancelSupport, ColumnFlags, ColumnInfo, ColumnSchema, ConnectionStatus, DatabaseSchema,
    EngineKind, ForeignKeySchema, IndexSchema, NetworkConfig, QueryId, QueryRequest, QueryResult,
    Row as QRow, TableKind, TableSchema, TableSummary, Value,
};

const KIND: EngineKind = EngineKind::RelationalA;

/// PostgreSQL engine client. Owns one pool for one named connection.
pub struct PostgresClient {
    config: NetworkConfig,
    pool: RwLock<Option<PgPool>>,
    state: HandleState,
    /// Active queries (query_id -> backend_pid)
    active_queries: Mutex<HashMap<QueryId, i32>>,
}

type ColumnRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<String>,
    Option<String>,
);

impl PostgresClient {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            state: HandleState::new(),
            active_queries: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a connection string from config
    fn build_connection_string(config: &NetworkConfig) -> String {
        let ssl_mode = if config.ssl { "require" } else { "disable" };
        let port = config.port.unwrap_or(5432);
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (Some(user), None) => format!("{}@", user),
            _ => String::new(),
        };

        format!(
            "postgres://{}{}:{}/{}?sslmode={}",
            credentials, config.host, port, config.database, ssl_mode
        )
    }

    async fn current_pool(&self) -> Option<PgPool> {
        self.pool.read().await.clone()
    }

    async fn require_pool(&self) -> EngineResult<PgPool> {
        self.current_pool()
            .await
            .ok_or_else(|| EngineError::native(KIND.display_name(), "connection is not open"))
    }

    fn introspection_error(e: sqlx::Error) -> EngineError {
        EngineError::native(KIND.display_name(), format!("schema introspection failed: {}", e))
    }

    /// Helper to bind a Value to a Postgres query
    fn bind_param<'q>(
        query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
            Value::Json(j) => query.bind(j),
            // Fallback for arrays or other complex types not yet fully mapped
            Value::Array(_) => query.bind(Option::<String>::None),
        }
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(pg_row: &PgRow) -> QRow {
        let values: Vec<Value> = pg_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(pg_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Extracts a value from a PgRow at the given index
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        // Integers before bool so int columns are never read as flags
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
            return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v
                .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        // JSON/JSONB
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }

        Value::Null
    }

    async fn fetch_backend_pid(conn: &mut PoolConnection<Postgres>) -> Result<i32, sqlx::Error> {
        sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut **conn)
            .await
    }

    /// Gets column info from a PgRow
    fn get_column_info(row: &PgRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
            .collect()
    }

    /// Column flags for a table, folded from the catalog
    async fn catalog_flags(
        pool: &PgPool,
        table: &str,
    ) -> Result<HashMap<String, (ColumnFlags, Option<u64>)>, sqlx::Error> {
        let rows: Vec<(String, String, String, String, bool, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT
                c.column_name::text,
                c.is_nullable::text,
                COALESCE(c.column_default, '')::text,
                c.is_identity::text,
                EXISTS (
                    SELECT 1
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage k
                      ON k.constraint_name = tc.constraint_name
                     AND k.table_schema = tc.table_schema
                     AND k.table_name = tc.table_name
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                      AND tc.table_schema = c.table_schema
                      AND tc.table_name = c.table_name
                      AND k.column_name = c.column_name
                ) AS is_pk,
                c.character_maximum_length::bigint
            FROM information_schema.columns c
            WHERE c.table_schema = current_schema() AND c.table_name = $1
            "#,
        )
        .bind(table)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, is_nullable, default, is_identity, is_pk, length)| {
                let mut flags = ColumnFlags::default();
                flags.set(ColumnFlags::NOT_NULL, is_nullable == "NO");
                flags.set(ColumnFlags::PRI_KEY, is_pk);
                flags.set(
                    ColumnFlags::AUTO_INCREMENT,
                    default.starts_with("nextval(") || is_identity == "YES",
                );
                (name, (flags, length.map(|l| l as u64)))
            })
            .collect())
    }

    async fn run_query(
        conn: &mut PoolConnection<Postgres>,
        request: &QueryRequest,
    ) -> Result<QueryResult, sqlx::Error> {
        let mut query = sqlx::query(&request.query);
        for param in &request.parameters {
            query = Self::bind_param(query, param);
        }

        let start = Instant::now();
        if sql_text::returns_rows(&request.query) {
            let pg_rows: Vec<PgRow> = query.fetch_all(&mut **conn).await?;
            let execution_time_ms = elapsed_ms(start);

            if pg_rows.is_empty() {
                return Ok(QueryResult::with_rows(Vec::new(), Vec::new(), execution_time_ms));
            }

            let columns = Self::get_column_info(&pg_rows[0]);
            let rows: Vec<QRow> = pg_rows.iter().map(Self::convert_row).collect();
            Ok(QueryResult::with_rows(columns, rows, execution_time_ms))
        } else {
            let result = query.execute(&mut **conn).await?;
            Ok(QueryResult::with_affected_rows(
                result.rows_affected(),
                elapsed_ms(start),
            ))
        }
    }

    async fn describe_table(
        pool: &PgPool,
        schema: &str,
        name: String,
        kind: TableKind,
        comment: Option<String>,
    ) -> Result<TableSchema, sqlx::Error> {
        let column_rows: Vec<ColumnRow> = sqlx::query_as(
            r#"
            SELECT
                c.column_name::text,
                c.data_type::text,
                c.is_nullable::text,
                c.column_default::text,
                c.is_identity::text,
                c.character_maximum_length::bigint,
                c.numeric_precision::bigint,
                c.numeric_scale::bigint,
                c.collation_name::text,
                col_description(format('%I.%I', c.table_schema, c.table_name)::regclass::oid, c.ordinal_position)::text
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
            "#,
        )
        .bind(schema)
        .bind(&name)
        .fetch_all(pool)
        .await?;

        // Get primary key columns
        let pk_rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT a.attname::text
            FROM pg_index i
            JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
            JOIN pg_class c ON c.oid = i.indrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE i.indisprimary
              AND n.nspname = $1
              AND c.relname = $2
            ORDER BY array_position(i.indkey, a.attnum)
            "#,
        )
        .bind(schema)
        .bind(&name)
        .fetch_all(pool)
        .await?;
        let pk_columns: Vec<String> = pk_rows.into_iter().map(|(name,)| name).collect();

        let columns = column_rows
            .into_iter()
            .map(
                |(col, data_type, is_nullable, default, is_identity, length, precision, scale, collation, col_comment)| {
                    let mut flags = ColumnFlags::default();
                    flags.set(ColumnFlags::NOT_NULL, is_nullable == "NO");
                    flags.set(ColumnFlags::PRI_KEY, pk_columns.contains(&col));
                    flags.set(
                        ColumnFlags::AUTO_INCREMENT,
                        is_identity == "YES"
                            || default.as_deref().is_some_and(|d| d.starts_with("nextval(")),
                    );
                    let mut column = ColumnSchema::new(col, data_type, true)
                        .with_flags(flags)
                        .with_default(default)
                        .with_comment(col_comment);
                    column.length = length.map(|v| v as u64);
                    column.precision = precision.map(|v| v as u64);
                    column.scale = scale.map(|v| v as u64);
                    column.collation = collation;
                    column
                },
            )
            .collect();

        let index_rows: Vec<(String, Vec<String>, bool, bool)> = sqlx::query_as(
            r#"
            SELECT
                i.relname::text,
                array_agg(a.attname::text ORDER BY array_position(ix.indkey, a.attnum)),
                ix.indisunique,
                ix.indisprimary
            FROM pg_index ix
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_class t ON t.oid = ix.indrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
            WHERE n.nspname = $1 AND t.relname = $2
            GROUP BY i.relname, ix.indisunique, ix.indisprimary
            ORDER BY i.relname
            "#,
        )
        .bind(schema)
        .bind(&name)
        .fetch_all(pool)
        .await?;

        let fk_rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT
                tc.constraint_name::text,
                kcu.column_name::text,
                ccu.table_name::text,
                ccu.column_name::text,
                rc.delete_rule::text,
                rc.update_rule::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON kcu.constraint_name = tc.constraint_name AND kcu.table_schema = tc.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema
            JOIN information_schema.referential_constraints rc
              ON rc.constraint_name = tc.constraint_name AND rc.constraint_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = $1
              AND tc.table_name = $2
            "#,
        )
        .bind(schema)
        .bind(&name)
        .fetch_all(pool)
        .await?;

        // Get row count estimate
        let count_row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT reltuples::bigint
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2
            "#,
        )
        .bind(schema)
        .bind(&name)
        .fetch_optional(pool)
        .await?;

        let mut table = TableSchema::new(name, kind);
        table.columns = columns;
        table.indexes = index_rows
            .into_iter()
            .map(|(name, columns, unique, primary)| IndexSchema {
                name,
                columns,
                unique,
                primary,
            })
            .collect();
        table.foreign_keys = fk_rows
            .into_iter()
            .map(|(name, column, ref_table, ref_column, on_delete, on_update)| ForeignKeySchema {
                name: Some(name),
                column,
                referenced_table: ref_table,
                referenced_column: ref_column,
                on_delete: Some(on_delete),
                on_update: Some(on_update),
            })
            .collect();
        // reltuples is -1 for never-analyzed tables
        table.row_count = count_row.and_then(|(c,)| u64::try_from(c).ok());
        table.comment = comment;
        Ok(table)
    }
}

#[async_trait]
impl DataEngine for PostgresClient {
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

        let mut handle = self.pool.write().await;
        if handle.is_some() {
            return Ok(());
        }
        self.state.mark_connecting().await;

        let conn_str = Self::build_connection_string(&self.config);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&conn_str)
            .await;

        match pool {
            Ok(pool) => {
                *handle = Some(pool);
                self.state.mark_connected().await;
                Ok(())
            }
            Err(e) => {
                let message = if e.to_string().contains("password authentication failed") {
                    format!("authentication failed: {}", e)
                } else {
                    format!("connection failed: {}", e)
                };
                self.state.mark_error(message.clone()).await;
                Err(EngineError::native(KIND.display_name(), message))
            }
        }
    }

    async fn disconnect(&self) -> EngineResult<()> {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        self.active_queries.lock().await.clear();
        self.state.mark_disconnected().await;
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        let Some(pool) = self.current_pool().await else {
            self.state.mark_error("connection is not open").await;
            return false;
        };

        match sqlx::query("SELECT 1").execute(&pool).await {
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

    #[instrument(skip(self, request), fields(query_len = request.query.len()))]
    async fn execute_query(&self, request: &QueryRequest, query_id: QueryId) -> QueryResult {
        let Some(pool) = self.current_pool().await else {
            return not_connected_failure(KIND);
        };

        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => return execution_failure(KIND, e, 0.0),
        };
        match Self::fetch_backend_pid(&mut conn).await {
            Ok(pid) => {
                self.active_queries.lock().await.insert(query_id, pid);
            }
            Err(e) => debug!(error = %e, "could not resolve backend pid, query will not be cancellable"),
        }

        let outcome = Self::run_query(&mut conn, request).await;
        self.active_queries.lock().await.remove(&query_id);
        drop(conn);

        match outcome {
            Ok(mut result) => {
                if !result.columns.is_empty() {
                    if let Some(table) = sql_text::single_source_table(&request.query) {
                        if let Ok(flags) = Self::catalog_flags(&pool, &table).await {
                            for column in result.columns.iter_mut() {
                                if let Some((f, length)) = flags.get(&column.name) {
                                    let mut resolved = column.clone().with_flags(*f);
                                    resolved.length = *length;
                                    *column = resolved;
                                }
                            }
                        }
                    }
                }
                result
            }
            Err(e) => execution_failure(KIND, e, 0.0),
        }
    }

    async fn get_schema(&self) -> EngineResult<DatabaseSchema> {
        let pool = self.require_pool().await?;

        let (schema,): (String,) = sqlx::query_as("SELECT current_schema()::text")
            .fetch_one(&pool)
            .await
            .map_err(Self::introspection_error)?;

        let table_rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT
                t.table_name::text,
                t.table_type::text,
                obj_description(format('%I.%I', t.table_schema, t.table_name)::regclass::oid, 'pg_class')::text
            FROM information_schema.tables t
            WHERE t.table_schema = $1
            ORDER BY t.table_name
            "#,
        )
        .bind(&schema)
        .fetch_all(&pool)
        .await
        .map_err(Self::introspection_error)?;

        let mut tables = Vec::with_capacity(table_rows.len());
        for (name, table_type, comment) in table_rows {
            let table = Self::describe_table(&pool, &schema, name, TableKind::parse(&table_type), comment)
                .await
                .map_err(Self::introspection_error)?;
            tables.push(table);
        }

        Ok(DatabaseSchema::new(self.config.database.clone(), KIND, tables))
    }

    async fn get_databases(&self) -> EngineResult<Vec<String>> {
        let pool = self.require_pool().await?;

        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT datname::text FROM pg_database WHERE NOT datistemplate ORDER BY datname",
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| EngineError::native(KIND.display_name(), format!("failed to list databases: {}", e)))?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// PostgreSQL cannot query across databases, so the argument selects a
    /// schema of the current database instead.
    async fn get_tables(&self, database: Option<&str>) -> EngineResult<Vec<TableSummary>> {
        let pool = self.require_pool().await?;

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT table_name::text, table_type::text
            FROM information_schema.tables
            WHERE table_schema = COALESCE($1, current_schema())
            ORDER BY table_name
            "#,
        )
        .bind(database)
        .fetch_all(&pool)
        .await
        .map_err(|e| EngineError::native(KIND.display_name(), format!("failed to list tables: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|(name, table_type)| TableSummary {
                name,
                kind: TableKind::parse(&table_type),
            })
            .collect())
    }

    async fn cancel(&self, query_id: QueryId) -> EngineResult<()> {
        let pool = self.require_pool().await?;
        let pid = {
            let active = self.active_queries.lock().await;
            active
                .get(&query_id)
                .copied()
                .ok_or_else(|| EngineError::native(KIND.display_name(), "query not found"))?
        };

        sqlx::query("SELECT pg_cancel_backend($1)")
            .bind(pid)
            .execute(&pool)
            .await
            .map_err(|e| EngineError::native(KIND.display_name(), format!("cancel failed: {}", e)))?;
        Ok(())
    }

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::Driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_building() {
        let config = NetworkConfig::new("localhost", "testdb").with_credentials("user", "pass");

        let conn_str = PostgresClient::build_connection_string(&config);
        assert!(conn_str.contains("user:pass@localhost:5432"));
        assert!(conn_str.contains("/testdb"));
        assert!(conn_str.contains("sslmode=disable"));
    }

    #[tokio::test]
    async fn connect_rejects_missing_database_before_io() {
        // Port 1 is never dialled: validation fails first.
        let client = PostgresClient::new(NetworkConfig::new("127.0.0.1", "").with_port(1));

        let err = client.connect().await.expect_err("database is required");
        assert!(err.is_configuration());
        assert_eq!(client.status().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn execute_without_connection_reports_error_result() {
        let client = PostgresClient::new(NetworkConfig::new("127.0.0.1", "app"));
        let result = client
            .execute_query(&QueryRequest::new("pg", "SELECT 1"), QueryId::new())
            .await;

        let error = result.error.expect("error result");
        assert!(error.starts_with("PostgreSQL query execution failed"));
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let client = PostgresClient::new(NetworkConfig::new("127.0.0.1", "app"));
        client.disconnect().await.expect("first disconnect");
        client.disconnect().await.expect("second disconnect");
        assert_eq!(client.status().await, ConnectionStatus::Disconnected);
    }
}
