//! SQLite Driver
//!
//! Engine client for file-backed SQLite databases using SQLx.
//!
//! Result column types are inferred from the storage class of the values in
//! the first returned row. Structure comes from the `pragma_*` table-valued
//! functions, which accept bound table names.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tokio::sync::RwLock;
use tracing::instrument;

use crate::engine::drivers::{elapsed_ms, execution_failure, not_connected_failure, HandleState};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::sql_text;
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    ColumnFlags, ColumnInfo, ColumnSchema, ConnectionStatus, DatabaseSchema, EmbeddedConfig,
    EngineKind, ForeignKeySchema, IndexSchema, QueryId, QueryRequest, QueryResult, Row as QRow,
    TableKind, TableSchema, TableSummary, Value,
};

const KIND: EngineKind = EngineKind::Embedded;

const LIST_TABLES: &str = r#"
    SELECT name, type FROM sqlite_master
    WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
    ORDER BY name
"#;

/// SQLite engine client. Owns one pool over one database file.
pub struct SqliteClient {
    config: EmbeddedConfig,
    pool: RwLock<Option<SqlitePool>>,
    state: HandleState,
}

impl SqliteClient {
    pub fn new(config: EmbeddedConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            state: HandleState::new(),
        }
    }

    fn connect_options(config: &EmbeddedConfig) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&config.file_path)
            .create_if_missing(!config.read_only)
            .read_only(config.read_only)
            .foreign_keys(true)
    }

    async fn current_pool(&self) -> Option<SqlitePool> {
        self.pool.read().await.clone()
    }

    async fn require_pool(&self) -> EngineResult<SqlitePool> {
        self.current_pool()
            .await
            .ok_or_else(|| EngineError::native(KIND.display_name(), "connection is not open"))
    }

    fn introspection_error(e: sqlx::Error) -> EngineError {
        EngineError::native(KIND.display_name(), format!("schema introspection failed: {}", e))
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
            Value::Json(j) => query.bind(j),
            Value::Array(_) => query.bind(Option::<String>::None),
        }
    }

    /// Storage class of the value at `idx` (`INTEGER`, `REAL`, `TEXT`, `BLOB` or `NULL`)
    fn storage_class(row: &SqliteRow, idx: usize) -> String {
        match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => "NULL".to_string(),
            Ok(raw) => raw.type_info().name().to_string(),
            Err(_) => "NULL".to_string(),
        }
    }

    fn extract_value(row: &SqliteRow, idx: usize) -> Value {
        match Self::storage_class(row, idx).as_str() {
            "INTEGER" => row.try_get::<i64, _>(idx).map(Value::Int).unwrap_or(Value::Null),
            "REAL" => row.try_get::<f64, _>(idx).map(Value::Float).unwrap_or(Value::Null),
            "TEXT" => row.try_get::<String, _>(idx).map(Value::Text).unwrap_or(Value::Null),
            "BLOB" => row.try_get::<Vec<u8>, _>(idx).map(Value::Bytes).unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    fn convert_row(row: &SqliteRow) -> QRow {
        QRow {
            values: (0..row.columns().len())
                .map(|idx| Self::extract_value(row, idx))
                .collect(),
        }
    }

    /// Column types from the first row. A NULL in that row falls back to the
    /// declared column type, if any.
    fn infer_columns(first: &SqliteRow) -> Vec<ColumnInfo> {
        first
            .columns()
            .iter()
            .map(|col| {
                let class = Self::storage_class(first, col.ordinal());
                let data_type = if class == "NULL" {
                    let declared = col.type_info().name();
                    if declared.is_empty() { class } else { declared.to_string() }
                } else {
                    class
                };
                ColumnInfo::new(col.name(), data_type)
            })
            .collect()
    }

    async fn run_query(pool: &SqlitePool, request: &QueryRequest) -> Result<QueryResult, sqlx::Error> {
        let mut query = sqlx::query(&request.query);
        for param in &request.parameters {
            query = Self::bind_param(query, param);
        }

        let start = Instant::now();
        if sql_text::returns_rows(&request.query) {
            let rows: Vec<SqliteRow> = query.fetch_all(pool).await?;
            let execution_time_ms = elapsed_ms(start);

            let Some(first) = rows.first() else {
                return Ok(QueryResult::with_rows(Vec::new(), Vec::new(), execution_time_ms));
            };
            let columns = Self::infer_columns(first);
            let rows = rows.iter().map(Self::convert_row).collect();
            Ok(QueryResult::with_rows(columns, rows, execution_time_ms))
        } else {
            let result = query.execute(pool).await?;
            Ok(QueryResult::with_affected_rows(result.rows_affected(), elapsed_ms(start)))
        }
    }

    async fn describe_table(pool: &SqlitePool, name: String, kind: TableKind) -> Result<TableSchema, sqlx::Error> {
        let column_rows: Vec<(String, String, i64, Option<String>, i64)> = sqlx::query_as(
            r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;

        // A lone INTEGER PRIMARY KEY aliases the rowid
        let pk_count = column_rows.iter().filter(|(.., pk)| *pk > 0).count();
        let columns = column_rows
            .into_iter()
            .map(|(col, data_type, notnull, default, pk)| {
                let mut flags = ColumnFlags::default();
                flags.set(ColumnFlags::NOT_NULL, notnull != 0 || pk > 0);
                flags.set(ColumnFlags::PRI_KEY, pk > 0);
                flags.set(
                    ColumnFlags::AUTO_INCREMENT,
                    pk > 0 && pk_count == 1 && data_type.eq_ignore_ascii_case("INTEGER"),
                );
                ColumnSchema::new(col, data_type, true)
                    .with_flags(flags)
                    .with_default(default)
            })
            .collect();

        let fk_rows: Vec<(i64, String, String, Option<String>, String, String)> = sqlx::query_as(
            r#"SELECT id, "table", "from", "to", on_update, on_delete FROM pragma_foreign_key_list(?1) ORDER BY id, seq"#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;

        let index_rows: Vec<(String, i64, String)> = sqlx::query_as(
            r#"SELECT name, "unique", origin FROM pragma_index_list(?1) ORDER BY seq"#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;

        let mut indexes = Vec::with_capacity(index_rows.len());
        for (index_name, unique, origin) in index_rows {
            let index_columns: Vec<(Option<String>,)> =
                sqlx::query_as("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
                    .bind(&index_name)
                    .fetch_all(pool)
                    .await?;
            let columns: Vec<String> = index_columns.into_iter().filter_map(|(c,)| c).collect();
            if columns.is_empty() {
                continue;
            }
            indexes.push(IndexSchema {
                name: index_name,
                columns,
                unique: unique != 0,
                primary: origin == "pk",
            });
        }

        let row_count = if kind == TableKind::Table {
            let count_sql = format!("SELECT COUNT(*) FROM \"{}\"", name.replace('"', "\"\""));
            let count: i64 = sqlx::query_scalar(&count_sql).fetch_one(pool).await?;
            u64::try_from(count).ok()
        } else {
            None
        };

        let mut table = TableSchema::new(name, kind);
        table.columns = columns;
        table.indexes = indexes;
        table.foreign_keys = fk_rows
            .into_iter()
            .map(|(_, ref_table, column, ref_column, on_update, on_delete)| ForeignKeySchema {
                name: None,
                referenced_column: ref_column.unwrap_or_default(),
                column,
                referenced_table: ref_table,
                on_delete: Some(on_delete),
                on_update: Some(on_update),
            })
            .collect();
        table.row_count = row_count;
        Ok(table)
    }
}

#[async_trait]
impl DataEngine for SqliteClient {
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

    #[instrument(skip(self), fields(file = %self.config.file_path))]
    async fn connect(&self) -> EngineResult<()> {
        self.config.validate()?;
        let options = Self::connect_options(&self.config);

        let mut handle = self.pool.write().await;
        if handle.is_some() {
            return Ok(());
        }
        self.state.mark_connecting().await;

        match SqlitePoolOptions::new().max_connections(5).connect_with(options).await {
            Ok(pool) => {
                *handle = Some(pool);
                self.state.mark_connected().await;
                Ok(())
            }
            Err(e) => {
                let message = format!("connection failed: {}", e);
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

    #[instrument(skip(self, request), fields(query_len = request.query.len(), %query_id))]
    async fn execute_query(&self, request: &QueryRequest, query_id: QueryId) -> QueryResult {
        let Some(pool) = self.current_pool().await else {
            return not_connected_failure(KIND);
        };

        match Self::run_query(&pool, request).await {
            Ok(result) => result,
            Err(e) => execution_failure(KIND, e, 0.0),
        }
    }

    async fn get_schema(&self) -> EngineResult<DatabaseSchema> {
        let pool = self.require_pool().await?;

        let table_rows: Vec<(String, String)> = sqlx::query_as(LIST_TABLES)
            .fetch_all(&pool)
            .await
            .map_err(Self::introspection_error)?;

        let mut tables = Vec::with_capacity(table_rows.len());
        for (name, table_type) in table_rows {
            let table = Self::describe_table(&pool, name, TableKind::parse(&table_type))
                .await
                .map_err(Self::introspection_error)?;
            tables.push(table);
        }

        Ok(DatabaseSchema::new(self.config.database.clone(), KIND, tables))
    }

    async fn get_databases(&self) -> EngineResult<Vec<String>> {
        let pool = self.require_pool().await?;

        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_database_list ORDER BY seq")
            .fetch_all(&pool)
            .await
            .map_err(|e| EngineError::native(KIND.display_name(), format!("failed to list databases: {}", e)))?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// A database file holds one catalog, so the argument is ignored.
    async fn get_tables(&self, _database: Option<&str>) -> EngineResult<Vec<TableSummary>> {
        let pool = self.require_pool().await?;

        let rows: Vec<(String, String)> = sqlx::query_as(LIST_TABLES)
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn client_in(dir: &TempDir) -> SqliteClient {
        let path = dir.path().join("app.db");
        SqliteClient::new(EmbeddedConfig::new("main", path.to_string_lossy()))
    }

    async fn run(client: &SqliteClient, sql: &str) -> QueryResult {
        client
            .execute_query(&QueryRequest::new("local", sql), QueryId::new())
            .await
    }

    #[tokio::test]
    async fn connect_validates_before_io() {
        let client = SqliteClient::new(EmbeddedConfig::new("main", ""));

        let err = client.connect().await.expect_err("file path is required");
        assert!(err.is_configuration());
        assert_eq!(client.status().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn read_only_missing_file_records_error_status() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = EmbeddedConfig::new("main", dir.path().join("missing.db").to_string_lossy());
        config.read_only = true;
        let client = SqliteClient::new(config);

        let err = client.connect().await.expect_err("file does not exist");
        assert!(err.to_string().starts_with("SQLite connection failed"));
        assert_eq!(client.status().await, ConnectionStatus::Error);
        assert!(client.last_error().await.is_some());
    }

    #[tokio::test]
    async fn successful_ping_clears_an_earlier_error() {
        let dir = TempDir::new().expect("tempdir");
        let client = client_in(&dir);
        client.connect().await.expect("connect");
        let since = client.connected_at().await;

        client.state.mark_error("transient failure").await;
        assert_eq!(client.status().await, ConnectionStatus::Error);

        assert!(client.test_connection().await);
        assert_eq!(client.status().await, ConnectionStatus::Connected);
        assert!(client.last_error().await.is_none());
        assert_eq!(client.connected_at().await, since);
    }

    #[tokio::test]
    async fn executes_and_infers_types_from_first_row() {
        let dir = TempDir::new().expect("tempdir");
        let client = client_in(&dir);
        client.connect().await.expect("connect");
        assert_eq!(client.status().await, ConnectionStatus::Connected);
        assert!(client.test_connection().await);

        let created = run(&client, "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price REAL, data BLOB)").await;
        assert!(created.error.is_none(), "{:?}", created.error);

        let insert = QueryRequest::new("local", "INSERT INTO items (name, price, data) VALUES (?, ?, ?)")
            .with_parameters(vec![
                Value::Text("widget".into()),
                Value::Float(2.5),
                Value::Bytes(vec![1, 2]),
            ]);
        let inserted = client.execute_query(&insert, QueryId::new()).await;
        assert_eq!(inserted.affected_rows, Some(1));

        let result = run(&client, "SELECT id, name, price, data FROM items").await;
        assert!(result.error.is_none());
        assert_eq!(result.total_rows, 1);
        let types: Vec<&str> = result.columns.iter().map(|c| c.data_type.as_str()).collect();
        assert_eq!(types, vec!["INTEGER", "TEXT", "REAL", "BLOB"]);
        assert_eq!(result.rows[0].values[1], Value::Text("widget".into()));
        assert_eq!(result.rows[0].values[3], Value::Bytes(vec![1, 2]));
    }

    #[tokio::test]
    async fn native_errors_become_error_results() {
        let dir = TempDir::new().expect("tempdir");
        let client = client_in(&dir);
        client.connect().await.expect("connect");

        let result = run(&client, "SELECT * FROM nowhere").await;
        let error = result.error.expect("error string");
        assert!(error.starts_with("SQLite query execution failed"));
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn introspects_columns_indexes_and_foreign_keys() {
        let dir = TempDir::new().expect("tempdir");
        let client = client_in(&dir);
        client.connect().await.expect("connect");

        for sql in [
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE, bio TEXT DEFAULT 'n/a')",
            "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id) ON DELETE CASCADE)",
            "CREATE INDEX idx_posts_user ON posts(user_id)",
            "CREATE VIEW user_emails AS SELECT email FROM users",
            "INSERT INTO users (email) VALUES ('a@example.com')",
        ] {
            assert!(run(&client, sql).await.error.is_none(), "{sql}");
        }

        let schema = client.get_schema().await.expect("schema");
        assert_eq!(schema.engine, EngineKind::Embedded);
        assert_eq!(schema.tables.len(), 3);

        let users = schema.table("users").expect("users");
        let id = &users.columns[0];
        assert!(id.primary_key);
        assert!(!id.nullable);
        assert_eq!(id.auto_increment, Some(true));
        let email = &users.columns[1];
        assert!(!email.nullable);
        assert!(!email.primary_key);
        assert_eq!(users.columns[2].default_value.as_deref(), Some("'n/a'"));
        assert!(users.indexes.iter().any(|i| i.unique && i.columns == vec!["email"]));
        assert_eq!(users.row_count, Some(1));

        let posts = schema.table("posts").expect("posts");
        assert_eq!(posts.foreign_keys.len(), 1);
        assert_eq!(posts.foreign_keys[0].referenced_table, "users");
        assert_eq!(posts.foreign_keys[0].on_delete.as_deref(), Some("CASCADE"));
        assert!(posts.indexes.iter().any(|i| i.name == "idx_posts_user"));

        assert_eq!(schema.table("user_emails").map(|t| t.kind), Some(TableKind::View));

        let tables = client.get_tables(None).await.expect("tables");
        assert_eq!(tables.len(), 3);
        assert_eq!(client.get_databases().await.expect("databases"), vec!["main"]);
    }

    #[tokio::test]
    async fn disconnect_closes_handle_and_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let client = client_in(&dir);
        client.connect().await.expect("connect");

        client.disconnect().await.expect("disconnect");
        client.disconnect().await.expect("disconnect again");
        assert_eq!(client.status().await, ConnectionStatus::Disconnected);

        let result = run(&client, "SELECT 1").await;
        assert!(result.error.is_some());
    }
}
