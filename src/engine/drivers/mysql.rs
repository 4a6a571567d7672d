//! MySQL Driver
//!
//! Engine client for MySQL/MariaDB using SQLx.
//!
//! ## Cancellation
//!
//! Same architecture as PostgreSQL: every running query is tracked with the
//! server-side connection id, and `cancel()` issues `KILL QUERY` for it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
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

const KIND: EngineKind = EngineKind::RelationalB;

/// Catalog facts about one result column
struct CatalogColumn {
    flags: ColumnFlags,
    length: Option<u64>,
    charset: Option<String>,
}

type ColumnRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<u64>,
    Option<u64>,
    Option<u64>,
    Option<String>,
    Option<String>,
    Option<String>,
);

/// MySQL engine client. Owns one pool for one named connection.
pub struct MySqlClient {
    config: NetworkConfig,
    pool: RwLock<Option<MySqlPool>>,
    state: HandleState,
    /// Active queries (query_id -> connection_id)
    active_queries: Mutex<HashMap<QueryId, u64>>,
}

impl MySqlClient {
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
        let ssl_mode = if config.ssl { "REQUIRED" } else { "DISABLED" };
        let port = config.port.unwrap_or(3306);
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (Some(user), None) => format!("{}@", user),
            _ => String::new(),
        };

        format!(
            "mysql://{}{}:{}/{}?ssl-mode={}",
            credentials, config.host, port, config.database, ssl_mode
        )
    }

    async fn current_pool(&self) -> Option<MySqlPool> {
        self.pool.read().await.clone()
    }

    async fn require_pool(&self) -> EngineResult<MySqlPool> {
        self.current_pool()
            .await
            .ok_or_else(|| EngineError::native(KIND.display_name(), "connection is not open"))
    }

    fn introspection_error(e: sqlx::Error) -> EngineError {
        EngineError::native(KIND.display_name(), format!("schema introspection failed: {}", e))
    }

    /// Helper to bind a Value to a MySQL query
    fn bind_param<'q>(
        query: sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
            Value::Json(j) => query.bind(j),
            // Fallback for arrays
            Value::Array(_) => query.bind(Option::<String>::None),
        }
    }

    async fn fetch_connection_id(conn: &mut PoolConnection<MySql>) -> Result<u64, sqlx::Error> {
        sqlx::query_scalar("SELECT CONNECTION_ID()")
            .fetch_one(&mut **conn)
            .await
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(mysql_row: &MySqlRow) -> QRow {
        let values: Vec<Value> = mysql_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(mysql_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Extracts a value from a MySqlRow at the given index
    fn extract_value(row: &MySqlRow, idx: usize) -> Value {
        // Try u64 first for BIGINT UNSIGNED columns
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
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
        // Exact decimals are kept as text so no precision is lost
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
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }

        Value::Null
    }

    /// Gets column info from a MySqlRow
    fn get_column_info(row: &MySqlRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
            .collect()
    }

    fn fold_flags(is_nullable: &str, column_key: &str, extra: &str) -> ColumnFlags {
        let mut flags = ColumnFlags::default();
        flags.set(ColumnFlags::NOT_NULL, is_nullable == "NO");
        flags.set(ColumnFlags::PRI_KEY, column_key == "PRI");
        flags.set(ColumnFlags::UNIQUE_KEY, column_key == "UNI");
        flags.set(
            ColumnFlags::AUTO_INCREMENT,
            extra.to_ascii_lowercase().contains("auto_increment"),
        );
        flags
    }

    async fn catalog_columns(
        pool: &MySqlPool,
        table: &str,
    ) -> Result<HashMap<String, CatalogColumn>, sqlx::Error> {
        // Cast to CHAR to avoid BINARY type mismatch with Rust String
        let rows: Vec<(String, String, String, String, Option<u64>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR),
                CAST(IS_NULLABLE AS CHAR),
                CAST(COLUMN_KEY AS CHAR),
                CAST(EXTRA AS CHAR),
                CAST(CHARACTER_MAXIMUM_LENGTH AS UNSIGNED),
                CAST(CHARACTER_SET_NAME AS CHAR)
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            "#,
        )
        .bind(table)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, is_nullable, column_key, extra, length, charset)| {
                let column = CatalogColumn {
                    flags: Self::fold_flags(&is_nullable, &column_key, &extra),
                    length,
                    charset,
                };
                (name, column)
            })
            .collect())
    }

    async fn run_query(
        conn: &mut PoolConnection<MySql>,
        request: &QueryRequest,
    ) -> Result<QueryResult, sqlx::Error> {
        let mut query = sqlx::query(&request.query);
        for param in &request.parameters {
            query = Self::bind_param(query, param);
        }

        let start = Instant::now();
        if sql_text::returns_rows(&request.query) {
            let mysql_rows: Vec<MySqlRow> = query.fetch_all(&mut **conn).await?;
            let execution_time_ms = elapsed_ms(start);

            if mysql_rows.is_empty() {
                return Ok(QueryResult::with_rows(Vec::new(), Vec::new(), execution_time_ms));
            }

            let columns = Self::get_column_info(&mysql_rows[0]);
            let rows: Vec<QRow> = mysql_rows.iter().map(Self::convert_row).collect();
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
        pool: &MySqlPool,
        name: String,
        kind: TableKind,
        row_count: Option<u64>,
        comment: Option<String>,
    ) -> Result<TableSchema, sqlx::Error> {
        let column_rows: Vec<ColumnRow> = sqlx::query_as(
            r#"
            SELECT
                CAST(c.COLUMN_NAME AS CHAR),
                CAST(c.COLUMN_TYPE AS CHAR),
                CAST(c.IS_NULLABLE AS CHAR),
                CAST(c.COLUMN_DEFAULT AS CHAR),
                CAST(c.COLUMN_KEY AS CHAR),
                CAST(c.EXTRA AS CHAR),
                CAST(c.CHARACTER_MAXIMUM_LENGTH AS UNSIGNED),
                CAST(c.NUMERIC_PRECISION AS UNSIGNED),
                CAST(c.NUMERIC_SCALE AS UNSIGNED),
                CAST(c.CHARACTER_SET_NAME AS CHAR),
                CAST(c.COLLATION_NAME AS CHAR),
                CAST(c.COLUMN_COMMENT AS CHAR)
            FROM information_schema.COLUMNS c
            WHERE c.TABLE_SCHEMA = DATABASE() AND c.TABLE_NAME = ?
            ORDER BY c.ORDINAL_POSITION
            "#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;

        let columns = column_rows
            .into_iter()
            .map(
                |(col, column_type, is_nullable, default, key, extra, length, precision, scale, charset, collation, col_comment)| {
                    let mut column = ColumnSchema::new(col, column_type, true)
                        .with_flags(Self::fold_flags(&is_nullable, &key, &extra))
                        .with_default(default)
                        .with_comment(col_comment);
                    column.length = length;
                    column.precision = precision;
                    column.scale = scale;
                    column.charset = charset;
                    column.collation = collation;
                    column
                },
            )
            .collect();

        let stat_rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT
                CAST(INDEX_NAME AS CHAR),
                CAST(COLUMN_NAME AS CHAR),
                CAST(NON_UNIQUE AS SIGNED)
            FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY INDEX_NAME, SEQ_IN_INDEX
            "#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;

        let mut indexes: Vec<IndexSchema> = Vec::new();
        for (index_name, column, non_unique) in stat_rows {
            match indexes.iter_mut().find(|i| i.name == index_name) {
                Some(index) => index.columns.push(column),
                None => indexes.push(IndexSchema {
                    primary: index_name == "PRIMARY",
                    unique: non_unique == 0,
                    name: index_name,
                    columns: vec![column],
                }),
            }
        }

        let fk_rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT
                CAST(k.CONSTRAINT_NAME AS CHAR),
                CAST(k.COLUMN_NAME AS CHAR),
                CAST(k.REFERENCED_TABLE_NAME AS CHAR),
                CAST(k.REFERENCED_COLUMN_NAME AS CHAR),
                CAST(r.DELETE_RULE AS CHAR),
                CAST(r.UPDATE_RULE AS CHAR)
            FROM information_schema.KEY_COLUMN_USAGE k
            JOIN information_schema.REFERENTIAL_CONSTRAINTS r
              ON r.CONSTRAINT_SCHEMA = k.TABLE_SCHEMA
             AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
            WHERE k.TABLE_SCHEMA = DATABASE()
              AND k.TABLE_NAME = ?
              AND k.REFERENCED_TABLE_NAME IS NOT NULL
            ORDER BY k.CONSTRAINT_NAME, k.ORDINAL_POSITION
            "#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;

        let mut table = TableSchema::new(name, kind);
        table.columns = columns;
        table.indexes = indexes;
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
        table.row_count = row_count;
        table.comment = comment.filter(|c| !c.is_empty() && c != "VIEW");
        Ok(table)
    }
}

#[async_trait]
impl DataEngine for MySqlClient {
    fn kind(&self) -> EngineKind {
        KIND
    }

    fn driver_name(&self) -> &'static str {
        "MySQL / MariaDB"
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
        let pool = MySqlPoolOptions::new()
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
                let msg = e.to_string();
                let message = if msg.contains("Access denied") {
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
        match Self::fetch_connection_id(&mut conn).await {
            Ok(connection_id) => {
                self.active_queries.lock().await.insert(query_id, connection_id);
            }
            Err(e) => debug!(error = %e, "could not resolve connection id, query will not be cancellable"),
        }

        let outcome = Self::run_query(&mut conn, request).await;
        self.active_queries.lock().await.remove(&query_id);
        drop(conn);

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => return execution_failure(KIND, e, 0.0),
        };

        if !result.columns.is_empty() {
            if let Some(table) = sql_text::single_source_table(&request.query) {
                if let Ok(catalog) = Self::catalog_columns(&pool, &table).await {
                    for column in result.columns.iter_mut() {
                        if let Some(facts) = catalog.get(&column.name) {
                            let mut resolved = column.clone().with_flags(facts.flags);
                            resolved.length = facts.length;
                            resolved.charset = facts.charset.clone();
                            *column = resolved;
                        }
                    }
                }
            }
        }
        result
    }

    async fn get_schema(&self) -> EngineResult<DatabaseSchema> {
        let pool = self.require_pool().await?;

        let table_rows: Vec<(String, String, Option<u64>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT
                CAST(TABLE_NAME AS CHAR),
                CAST(TABLE_TYPE AS CHAR),
                TABLE_ROWS,
                CAST(TABLE_COMMENT AS CHAR)
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE()
            ORDER BY TABLE_NAME
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(Self::introspection_error)?;

        let mut tables = Vec::with_capacity(table_rows.len());
        for (name, table_type, row_count, comment) in table_rows {
            let table = Self::describe_table(&pool, name, TableKind::parse(&table_type), row_count, comment)
                .await
                .map_err(Self::introspection_error)?;
            tables.push(table);
        }

        Ok(DatabaseSchema::new(self.config.database.clone(), KIND, tables))
    }

    async fn get_databases(&self) -> EngineResult<Vec<String>> {
        let pool = self.require_pool().await?;

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT CAST(SCHEMA_NAME AS CHAR)
            FROM information_schema.SCHEMATA
            WHERE SCHEMA_NAME NOT IN ('information_schema', 'mysql', 'performance_schema', 'sys')
            ORDER BY SCHEMA_NAME
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| EngineError::native(KIND.display_name(), format!("failed to list databases: {}", e)))?;

        Ok(rows.into_iter().map(|(db,)| db).collect())
    }

    async fn get_tables(&self, database: Option<&str>) -> EngineResult<Vec<TableSummary>> {
        let pool = self.require_pool().await?;

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT CAST(TABLE_NAME AS CHAR), CAST(TABLE_TYPE AS CHAR)
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE())
            ORDER BY TABLE_NAME
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
        let connection_id = {
            let active = self.active_queries.lock().await;
            active
                .get(&query_id)
                .copied()
                .ok_or_else(|| EngineError::native(KIND.display_name(), "query not found"))?
        };

        let sql = format!("KILL QUERY {}", connection_id);
        sqlx::query(&sql)
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
        let config = NetworkConfig::new("db.local", "shop")
            .with_credentials("app", "pw")
            .with_port(3307);

        let conn_str = MySqlClient::build_connection_string(&config);
        assert_eq!(conn_str, "mysql://app:pw@db.local:3307/shop?ssl-mode=DISABLED");
    }

    #[test]
    fn catalog_facts_fold_into_flag_bits() {
        let flags = MySqlClient::fold_flags("NO", "PRI", "auto_increment");
        assert!(flags.has(ColumnFlags::NOT_NULL));
        assert!(flags.has(ColumnFlags::PRI_KEY));
        assert!(flags.has(ColumnFlags::AUTO_INCREMENT));
        assert!(!flags.has(ColumnFlags::UNIQUE_KEY));

        let email = MySqlClient::fold_flags("YES", "UNI", "");
        assert!(email.has(ColumnFlags::UNIQUE_KEY));
        assert!(!email.has(ColumnFlags::NOT_NULL));

        let column = ColumnInfo::new("email", "VARCHAR").with_flags(email);
        assert!(column.nullable);
        assert_eq!(column.auto_increment, Some(false));
    }

    #[tokio::test]
    async fn introspection_requires_open_connection() {
        let client = MySqlClient::new(NetworkConfig::new("127.0.0.1", "shop"));

        let err = client.get_schema().await.expect_err("not connected");
        assert!(err.to_string().starts_with("MySQL"));
        assert!(client.get_tables(None).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_without_handle_records_error() {
        let client = MySqlClient::new(NetworkConfig::new("127.0.0.1", "shop"));

        assert!(!client.test_connection().await);
        assert_eq!(client.status().await, ConnectionStatus::Error);
        assert!(client.last_error().await.is_some());
    }
}
