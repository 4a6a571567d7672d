//! Schema Service
//!
//! Caches introspected schemas per connection and answers table and column
//! lookups from the cached snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SchemaServiceConfig;
use crate::engine::connection_service::ConnectionService;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{ColumnSchema, DatabaseSchema, IndexSchema, TableSchema};
use crate::schema::cache::{CacheStats, SchemaCache};

/// A column matched by `search_columns`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMatch {
    pub table: String,
    pub column: ColumnSchema,
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

fn comment_matches(comment: Option<&String>, needle: &str) -> bool {
    comment.is_some_and(|c| contains_ci(c, needle))
}

pub struct SchemaService {
    config: SchemaServiceConfig,
    connections: Arc<ConnectionService>,
    cache: RwLock<SchemaCache>,
    refresh_tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl SchemaService {
    pub fn new(config: SchemaServiceConfig, connections: Arc<ConnectionService>) -> Self {
        let cache = SchemaCache::new(Duration::from_secs(config.cache_ttl_secs), config.max_cache_size);
        Self {
            config,
            connections,
            cache: RwLock::new(cache),
            refresh_tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Cached schema, or a fresh one on a miss or when forced.
    ///
    /// A hit returns the same `Arc` as the previous call.
    pub async fn get_schema(self: &Arc<Self>, connection_id: &str, force_refresh: bool) -> EngineResult<Arc<DatabaseSchema>> {
        if !force_refresh {
            if let Some(schema) = self.cache.write().await.get(connection_id) {
                debug!(connection_id, "schema cache hit");
                return Ok(schema);
            }
        }

        debug!(connection_id, force_refresh, "schema cache miss");
        let schema = self.fetch(connection_id).await?;
        if self.config.auto_refresh {
            self.start_auto_refresh(connection_id).await;
        }
        Ok(schema)
    }

    /// Fetches and caches a fresh schema
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn refresh_schema(&self, connection_id: &str) -> EngineResult<Arc<DatabaseSchema>> {
        self.fetch(connection_id).await
    }

    async fn fetch(&self, connection_id: &str) -> EngineResult<Arc<DatabaseSchema>> {
        let schema = Arc::new(self.connections.get_schema(connection_id).await?);
        self.cache
            .write()
            .await
            .insert(connection_id, Arc::clone(&schema));
        debug!(connection_id, tables = schema.tables.len(), "schema cached");
        Ok(schema)
    }

    pub async fn get_table_schema(self: &Arc<Self>, connection_id: &str, table: &str) -> EngineResult<Option<TableSchema>> {
        let schema = self.get_schema(connection_id, false).await?;
        Ok(schema.table(table).cloned())
    }

    /// Empty when the table does not exist
    pub async fn get_table_columns(self: &Arc<Self>, connection_id: &str, table: &str) -> EngineResult<Vec<ColumnSchema>> {
        let schema = self.get_schema(connection_id, false).await?;
        Ok(schema.table(table).map(|t| t.columns.clone()).unwrap_or_default())
    }

    pub async fn get_table_indexes(self: &Arc<Self>, connection_id: &str, table: &str) -> EngineResult<Vec<IndexSchema>> {
        let schema = self.get_schema(connection_id, false).await?;
        Ok(schema.table(table).map(|t| t.indexes.clone()).unwrap_or_default())
    }

    /// Tables whose name or comment contains `term`, ignoring case
    pub async fn search_tables(self: &Arc<Self>, connection_id: &str, term: &str) -> EngineResult<Vec<TableSchema>> {
        let schema = self.get_schema(connection_id, false).await?;
        let needle = term.to_lowercase();
        Ok(schema
            .tables
            .iter()
            .filter(|t| contains_ci(&t.name, &needle) || comment_matches(t.comment.as_ref(), &needle))
            .cloned()
            .collect())
    }

    pub async fn search_columns(self: &Arc<Self>, connection_id: &str, term: &str) -> EngineResult<Vec<ColumnMatch>> {
        let schema = self.get_schema(connection_id, false).await?;
        let needle = term.to_lowercase();
        Ok(schema
            .tables
            .iter()
            .flat_map(|table| {
                table
                    .columns
                    .iter()
                    .filter(|c| contains_ci(&c.name, &needle) || comment_matches(c.comment.as_ref(), &needle))
                    .map(|column| ColumnMatch {
                        table: table.name.clone(),
                        column: column.clone(),
                    })
            })
            .collect())
    }

    /// Forgets the cached snapshot; auto-refresh keeps running
    pub async fn invalidate(&self, connection_id: &str) {
        if self.cache.write().await.remove(connection_id) {
            debug!(connection_id, "schema cache invalidated");
        }
    }

    /// Drops one entry, or everything, and stops the matching refresh timers
    pub async fn clear_cache(&self, connection_id: Option<&str>) {
        let mut tasks = self.refresh_tasks.lock().await;
        match connection_id {
            Some(id) => {
                self.cache.write().await.remove(id);
                if let Some(token) = tasks.remove(id) {
                    token.cancel();
                }
            }
            None => {
                self.cache.write().await.clear();
                for (_, token) in tasks.drain() {
                    token.cancel();
                }
            }
        }
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        self.cache.read().await.stats()
    }

    pub async fn is_auto_refreshing(&self, connection_id: &str) -> bool {
        self.refresh_tasks.lock().await.contains_key(connection_id)
    }

    /// Spawns a timer that refreshes the schema every configured interval.
    ///
    /// A no-op if one is already running for the connection. The timer stops
    /// when the cache entry is cleared, the connection goes away, or the
    /// service is dropped.
    pub async fn start_auto_refresh(self: &Arc<Self>, connection_id: &str) {
        let mut tasks = self.refresh_tasks.lock().await;
        if tasks.contains_key(connection_id) {
            return;
        }

        let token = CancellationToken::new();
        tasks.insert(connection_id.to_string(), token.clone());

        let interval = Duration::from_secs(self.config.refresh_interval_secs.max(1));
        let service: Weak<Self> = Arc::downgrade(self);
        let connection_id = connection_id.to_string();
        info!(connection_id = %connection_id, interval_secs = interval.as_secs(), "schema auto-refresh started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(service) = service.upgrade() else {
                    break;
                };
                match service.refresh_schema(&connection_id).await {
                    Ok(schema) => {
                        debug!(connection_id = %connection_id, tables = schema.tables.len(), "schema auto-refreshed");
                    }
                    Err(EngineError::ConnectionNotFound { .. }) => {
                        warn!(connection_id = %connection_id, "connection closed, stopping schema auto-refresh");
                        service.refresh_tasks.lock().await.remove(&connection_id);
                        break;
                    }
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "schema auto-refresh failed");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::engine::types::{EmbeddedConfig, EngineConfig, QueryId, QueryRequest};
    use tempfile::TempDir;

    async fn setup(config: SchemaServiceConfig) -> (TempDir, Arc<ConnectionService>, Arc<SchemaService>) {
        let dir = TempDir::new().expect("tempdir");
        let connections = Arc::new(ConnectionService::new(&PoolConfig::default()));
        let path = dir.path().join("app.db");
        connections
            .create_connection(
                "local",
                EngineConfig::Embedded(EmbeddedConfig::new("main", path.to_string_lossy())),
            )
            .await
            .expect("connect");

        for statement in [
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, email TEXT NOT NULL)",
            "CREATE TABLE invoices (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers(id), total REAL)",
            "CREATE INDEX idx_invoices_customer ON invoices(customer_id)",
        ] {
            let result = connections
                .execute_query(&QueryRequest::new("local", statement), QueryId::new())
                .await;
            assert!(result.error.is_none(), "{:?}", result.error);
        }

        let schemas = Arc::new(SchemaService::new(config, Arc::clone(&connections)));
        (dir, connections, schemas)
    }

    #[tokio::test]
    async fn cache_hits_share_the_snapshot_and_forced_refresh_does_not() {
        let (_dir, _connections, schemas) = setup(SchemaServiceConfig::default()).await;

        let first = schemas.get_schema("local", false).await.expect("schema");
        let second = schemas.get_schema("local", false).await.expect("schema");
        assert!(Arc::ptr_eq(&first, &second));

        let forced = schemas.get_schema("local", true).await.expect("schema");
        assert!(!Arc::ptr_eq(&first, &forced));
        assert!(forced.has_table("invoices"));
    }

    #[tokio::test]
    async fn clear_cache_shrinks_the_stats() {
        let (_dir, _connections, schemas) = setup(SchemaServiceConfig::default()).await;
        schemas.get_schema("local", false).await.expect("schema");
        assert_eq!(schemas.get_cache_stats().await.size, 1);

        schemas.clear_cache(Some("local")).await;
        assert_eq!(schemas.get_cache_stats().await.size, 0);
    }

    #[tokio::test]
    async fn table_lookups_derive_from_the_cached_schema() {
        let (_dir, _connections, schemas) = setup(SchemaServiceConfig::default()).await;

        let table = schemas
            .get_table_schema("local", "INVOICES")
            .await
            .expect("lookup")
            .expect("table exists");
        assert_eq!(table.foreign_keys.len(), 1);

        let columns = schemas.get_table_columns("local", "customers").await.expect("columns");
        assert_eq!(columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), vec!["id", "email"]);

        let indexes = schemas.get_table_indexes("local", "invoices").await.expect("indexes");
        assert!(indexes.iter().any(|i| i.name == "idx_invoices_customer"));

        assert!(schemas.get_table_columns("local", "ghost").await.expect("columns").is_empty());
    }

    #[tokio::test]
    async fn search_is_case_insensitive() {
        let (_dir, _connections, schemas) = setup(SchemaServiceConfig::default()).await;

        let tables = schemas.search_tables("local", "VOICE").await.expect("search");
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "invoices");

        let columns = schemas.search_columns("local", "Customer").await.expect("search");
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].table, "invoices");
    }

    #[tokio::test]
    async fn unknown_connections_raise() {
        let (_dir, _connections, schemas) = setup(SchemaServiceConfig::default()).await;
        let err = schemas.get_schema("ghost", false).await.expect_err("unknown id");
        assert_eq!(err.to_string(), "Connection ghost not found");
    }

    #[tokio::test]
    async fn auto_refresh_registers_and_clear_cache_stops_it() {
        let config = SchemaServiceConfig {
            auto_refresh: true,
            refresh_interval_secs: 3600,
            ..SchemaServiceConfig::default()
        };
        let (_dir, _connections, schemas) = setup(config).await;

        schemas.get_schema("local", false).await.expect("schema");
        assert!(schemas.is_auto_refreshing("local").await);

        schemas.clear_cache(None).await;
        assert!(!schemas.is_auto_refreshing("local").await);
    }
}
