//! Connection Service
//!
//! Centralized registry of all named connections.
//! This is the SINGLE SOURCE OF TRUTH for connection state: each entry owns
//! exactly one engine client for its whole lifetime.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::{info, instrument, warn};

use crate::config::PoolConfig;
use crate::engine::client::EngineClient;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::pool::{EnginePools, PoolStats};
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    CancelSupport, ConnectionStatus, DatabaseSchema, EngineConfig, EngineKind, QueryId,
    QueryRequest, QueryResult, TableSummary,
};

/// Caller-facing view of one connection. Never carries credentials.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub id: String,
    pub engine: EngineKind,
    pub display_name: String,
    pub database: String,
    pub read_only: bool,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Registered connection with its engine client
struct ActiveConnection {
    id: String,
    config: EngineConfig,
    client: EngineClient,
    last_activity: RwLock<Option<DateTime<Utc>>>,
}

impl ActiveConnection {
    async fn touch(&self) {
        *self.last_activity.write().await = Some(Utc::now());
    }

    async fn snapshot(&self) -> Connection {
        Connection {
            id: self.id.clone(),
            engine: self.config.kind(),
            display_name: self.config.display_name(),
            database: self.config.database().to_string(),
            read_only: self.config.read_only(),
            status: self.client.status().await,
            error: self.client.last_error().await,
            connected_at: self.client.connected_at().await,
            last_activity: *self.last_activity.read().await,
        }
    }
}

pub struct ConnectionService {
    connections: RwLock<HashMap<String, Arc<ActiveConnection>>>,
    pools: EnginePools,
    connect_timeout: Duration,
    test_timeout: Duration,
}

impl ConnectionService {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            pools: EnginePools::new(config.max_connections_per_engine),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            test_timeout: Duration::from_millis(config.test_timeout_ms),
        }
    }

    async fn get(&self, id: &str) -> EngineResult<Arc<ActiveConnection>> {
        let connections = self.connections.read().await;
        connections
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(id))
    }

    /// Opens a named connection.
    ///
    /// Configuration errors, duplicate ids and a full pool are returned as
    /// `Err`. A native connect failure is not: the returned `Connection` has
    /// status `error` and carries the message, and nothing is registered.
    #[instrument(skip(self, config), fields(connection_id = %id, engine = %config.kind()))]
    pub async fn create_connection(&self, id: &str, config: EngineConfig) -> EngineResult<Connection> {
        config.validate()?;
        if self.connections.read().await.contains_key(id) {
            return Err(EngineError::configuration(
                "id",
                format!("Connection {} already exists", id),
            ));
        }

        let kind = config.kind();
        self.pools.reserve(kind).await?;

        let active = ActiveConnection {
            id: id.to_string(),
            config: config.clone(),
            client: EngineClient::from_config(config),
            last_activity: RwLock::new(None),
        };

        let outcome = match timeout(self.connect_timeout, active.client.connect()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(self.connect_timeout.as_millis() as u64)),
        };

        match outcome {
            Ok(()) => {
                let active = Arc::new(active);
                let snapshot = active.snapshot().await;
                let mut connections = self.connections.write().await;
                if connections.contains_key(id) {
                    drop(connections);
                    let _ = active.client.disconnect().await;
                    self.pools.release(kind).await;
                    return Err(EngineError::configuration(
                        "id",
                        format!("Connection {} already exists", id),
                    ));
                }
                connections.insert(id.to_string(), active);
                info!(display_name = %snapshot.display_name, "connection established");
                Ok(snapshot)
            }
            Err(e) => {
                self.pools.release(kind).await;
                warn!(error = %e, "connection failed");
                let mut snapshot = active.snapshot().await;
                snapshot.status = ConnectionStatus::Error;
                snapshot.error = Some(e.to_string());
                Ok(snapshot)
            }
        }
    }

    /// Tests a configuration without registering it
    #[instrument(skip(self, config), fields(engine = %config.kind()))]
    pub async fn test_connection(&self, config: &EngineConfig) -> EngineResult<bool> {
        config.validate()?;

        let client = EngineClient::from_config(config.clone());
        let probe = async {
            if client.connect().await.is_err() {
                return false;
            }
            client.test_connection().await
        };

        let reachable = timeout(self.test_timeout, probe).await.unwrap_or(false);
        let _ = client.disconnect().await;
        Ok(reachable)
    }

    /// Runs a query on a registered connection. Never fails: problems are
    /// reported in `QueryResult::error`.
    #[instrument(skip(self, request), fields(connection_id = %request.connection_id, query_len = request.query.len()))]
    pub async fn execute_query(&self, request: &QueryRequest, query_id: QueryId) -> QueryResult {
        let active = match self.get(&request.connection_id).await {
            Ok(active) => active,
            Err(e) => return QueryResult::failure(e.to_string(), 0.0),
        };

        let status = active.client.status().await;
        if status != ConnectionStatus::Connected {
            return QueryResult::failure(
                EngineError::not_connected(&request.connection_id, status).to_string(),
                0.0,
            );
        }

        active.touch().await;
        active.client.execute_query(request, query_id).await
    }

    pub async fn get_schema(&self, id: &str) -> EngineResult<DatabaseSchema> {
        let active = self.get(id).await?;
        active.touch().await;
        active.client.get_schema().await
    }

    pub async fn get_databases(&self, id: &str) -> EngineResult<Vec<String>> {
        let active = self.get(id).await?;
        active.touch().await;
        active.client.get_databases().await
    }

    pub async fn get_tables(&self, id: &str, database: Option<&str>) -> EngineResult<Vec<TableSummary>> {
        let active = self.get(id).await?;
        active.touch().await;
        active.client.get_tables(database).await
    }

    /// Closes and forgets a connection. Unknown ids are a no-op.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub async fn disconnect(&self, id: &str) -> EngineResult<()> {
        let removed = self.connections.write().await.remove(id);
        let Some(active) = removed else {
            return Ok(());
        };

        self.pools.release(active.config.kind()).await;
        active.client.disconnect().await?;
        info!("connection closed");
        Ok(())
    }

    /// Closes every connection concurrently. Individual failures are logged.
    #[instrument(skip(self))]
    pub async fn disconnect_all(&self) {
        let drained: Vec<Arc<ActiveConnection>> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, active)| active).collect()
        };
        // Only drained slots are returned; reservations for connects still in
        // flight stay counted
        for active in &drained {
            self.pools.release(active.config.kind()).await;
        }

        let results = join_all(drained.iter().map(|active| async move {
            (active.id.as_str(), active.client.disconnect().await)
        }))
        .await;

        for (id, result) in results {
            if let Err(e) = result {
                warn!(connection_id = %id, error = %e, "disconnect failed during teardown");
            }
        }

        info!(count = drained.len(), "all connections closed");
    }

    /// Pings every connection concurrently
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let snapshot: Vec<Arc<ActiveConnection>> =
            self.connections.read().await.values().cloned().collect();

        let results = join_all(snapshot.iter().map(|active| async move {
            let healthy = active.client.test_connection().await;
            if !healthy {
                warn!(connection_id = %active.id, "health check failed");
            }
            (active.id.clone(), healthy)
        }))
        .await;

        results.into_iter().collect()
    }

    pub async fn get_active_connections(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn get_connection_status(&self, id: &str) -> EngineResult<ConnectionStatus> {
        Ok(self.get(id).await?.client.status().await)
    }

    pub async fn get_connection_info(&self, id: &str) -> EngineResult<Connection> {
        Ok(self.get(id).await?.snapshot().await)
    }

    pub async fn get_pool_stats(&self) -> BTreeMap<EngineKind, PoolStats> {
        self.pools.stats().await
    }

    pub async fn engine_kind_of(&self, id: &str) -> Option<EngineKind> {
        self.get(id).await.ok().map(|active| active.config.kind())
    }

    pub async fn is_read_only(&self, id: &str) -> EngineResult<bool> {
        Ok(self.get(id).await?.config.read_only())
    }

    pub async fn cancel_support(&self, id: &str) -> EngineResult<CancelSupport> {
        Ok(self.get(id).await?.client.cancel_support())
    }

    /// Asks the engine to stop a running query
    pub async fn cancel_native(&self, id: &str, query_id: QueryId) -> EngineResult<()> {
        self.get(id).await?.client.cancel(query_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{EmbeddedConfig, NetworkConfig};
    use tempfile::TempDir;

    fn service(max: usize) -> ConnectionService {
        ConnectionService::new(&PoolConfig {
            max_connections_per_engine: max,
            ..PoolConfig::default()
        })
    }

    fn sqlite_config(dir: &TempDir, name: &str) -> EngineConfig {
        let path = dir.path().join(format!("{name}.db"));
        EngineConfig::Embedded(EmbeddedConfig::new("main", path.to_string_lossy()))
    }

    #[tokio::test]
    async fn create_connection_registers_connected_client() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(10);

        let connection = service
            .create_connection("local", sqlite_config(&dir, "a"))
            .await
            .expect("create");

        assert_eq!(connection.status, ConnectionStatus::Connected);
        assert!(connection.connected_at.is_some());
        assert_eq!(service.get_active_connections().await, vec!["local"]);
        assert_eq!(service.engine_kind_of("local").await, Some(EngineKind::Embedded));
        assert_eq!(
            service.get_connection_status("local").await.expect("status"),
            ConnectionStatus::Connected
        );
        assert_eq!(service.get_pool_stats().await[&EngineKind::Embedded].active, 1);
    }

    #[tokio::test]
    async fn empty_database_fails_before_any_io() {
        let service = service(10);
        for config in [
            EngineConfig::Document(NetworkConfig::new("127.0.0.1", "")),
            EngineConfig::RelationalA(NetworkConfig::new("127.0.0.1", "")),
            EngineConfig::RelationalB(NetworkConfig::new("127.0.0.1", "")),
            EngineConfig::Embedded(EmbeddedConfig::new("", "/tmp/unused.db")),
        ] {
            let err = service.create_connection("x", config).await.expect_err("invalid");
            assert!(err.is_configuration());
        }
        assert!(service.get_active_connections().await.is_empty());
        assert!(service.get_pool_stats().await.values().all(|s| s.active == 0));
    }

    #[tokio::test]
    async fn connect_failure_is_reported_in_the_returned_connection() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(10);
        let mut config = EmbeddedConfig::new("main", dir.path().join("absent.db").to_string_lossy());
        config.read_only = true;

        let connection = service
            .create_connection("broken", EngineConfig::Embedded(config))
            .await
            .expect("failure is a value");

        assert_eq!(connection.status, ConnectionStatus::Error);
        assert!(connection.error.is_some());
        assert!(service.get_active_connections().await.is_empty());
        assert_eq!(service.get_pool_stats().await[&EngineKind::Embedded].active, 0);
    }

    #[tokio::test]
    async fn pool_ceiling_rejects_the_eleventh_connection() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(10);

        for i in 0..10 {
            service
                .create_connection(&format!("c{i}"), sqlite_config(&dir, &format!("db{i}")))
                .await
                .expect("within ceiling");
        }

        let err = service
            .create_connection("c10", sqlite_config(&dir, "db10"))
            .await
            .expect_err("ceiling reached");
        assert!(matches!(err, EngineError::PoolExhausted { max: 10, .. }));
        assert_eq!(service.get_active_connections().await.len(), 10);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(10);
        service.create_connection("dup", sqlite_config(&dir, "a")).await.expect("first");

        let err = service
            .create_connection("dup", sqlite_config(&dir, "b"))
            .await
            .expect_err("duplicate");
        assert!(err.is_configuration());
        assert_eq!(service.get_pool_stats().await[&EngineKind::Embedded].active, 1);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(10);
        service.create_connection("local", sqlite_config(&dir, "a")).await.expect("create");

        service.disconnect("local").await.expect("first");
        service.disconnect("local").await.expect("second");

        assert!(service.get_active_connections().await.is_empty());
        assert_eq!(service.get_pool_stats().await[&EngineKind::Embedded].active, 0);
    }

    #[tokio::test]
    async fn unknown_ids_raise_for_lookups_and_fold_for_queries() {
        let service = service(10);

        let err = service.get_schema("ghost").await.expect_err("unknown");
        assert_eq!(err.to_string(), "Connection ghost not found");
        assert!(service.get_tables("ghost", None).await.is_err());
        assert!(service.get_connection_info("ghost").await.is_err());

        let result = service
            .execute_query(&QueryRequest::new("ghost", "SELECT 1"), QueryId::new())
            .await;
        assert_eq!(result.error.as_deref(), Some("Connection ghost not found"));
    }

    #[tokio::test]
    async fn health_check_and_disconnect_all() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(10);
        service.create_connection("a", sqlite_config(&dir, "a")).await.expect("a");
        service.create_connection("b", sqlite_config(&dir, "b")).await.expect("b");

        let health = service.health_check().await;
        assert_eq!(health.len(), 2);
        assert!(health.values().all(|ok| *ok));

        service.disconnect_all().await;
        assert!(service.get_active_connections().await.is_empty());
        assert!(service.get_pool_stats().await.values().all(|s| s.active == 0));
    }

    #[tokio::test]
    async fn disconnect_all_keeps_reservations_of_pending_connects() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(2);
        service.create_connection("a", sqlite_config(&dir, "a")).await.expect("a");
        service.pools.reserve(EngineKind::Embedded).await.expect("pending connect");

        service.disconnect_all().await;
        assert_eq!(service.get_pool_stats().await[&EngineKind::Embedded].active, 1);

        service.create_connection("b", sqlite_config(&dir, "b")).await.expect("b");
        let err = service
            .create_connection("c", sqlite_config(&dir, "c"))
            .await
            .expect_err("ceiling still counts the pending connect");
        assert!(matches!(err, EngineError::PoolExhausted { max: 2, .. }));
    }

    #[tokio::test]
    async fn test_connection_does_not_register() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(10);

        assert!(service.test_connection(&sqlite_config(&dir, "scratch")).await.expect("valid config"));
        assert!(service.get_active_connections().await.is_empty());

        let invalid = EngineConfig::Embedded(EmbeddedConfig::new("main", ""));
        assert!(service.test_connection(&invalid).await.is_err());
    }

    #[tokio::test]
    async fn connection_info_is_redacted() {
        let dir = TempDir::new().expect("tempdir");
        let service = service(10);
        service.create_connection("local", sqlite_config(&dir, "a")).await.expect("create");

        let info = service.get_connection_info("local").await.expect("info");
        assert!(info.display_name.starts_with("sqlite:"));
        assert!(info.last_activity.is_none());

        service.get_tables("local", None).await.expect("tables");
        let info = service.get_connection_info("local").await.expect("info");
        assert!(info.last_activity.is_some());
    }
}
