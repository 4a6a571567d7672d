// QoreDB Gateway - multi-engine database gateway
// Core library

pub mod config;
pub mod engine;
pub mod observability;
pub mod query;
pub mod schema;

use std::sync::Arc;

use config::GatewayConfig;
use engine::ConnectionService;
use query::QueryService;
use schema::SchemaService;

pub type SharedState = Arc<AppState>;

/// Owns every service for the process. Build it once and share the `Arc`.
pub struct AppState {
    pub config: GatewayConfig,
    pub connections: Arc<ConnectionService>,
    pub schemas: Arc<SchemaService>,
    pub queries: Arc<QueryService>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        let connections = Arc::new(ConnectionService::new(&config.pool));
        let schemas = Arc::new(SchemaService::new(
            config.schema.clone(),
            Arc::clone(&connections),
        ));
        let queries = Arc::new(QueryService::new(
            config.query.clone(),
            Arc::clone(&connections),
            Arc::clone(&schemas),
        ));

        Self {
            config,
            connections,
            schemas,
            queries,
        }
    }

    /// Loads the config from disk and the environment, then installs tracing
    pub fn from_env() -> SharedState {
        let config = GatewayConfig::load();
        observability::init_tracing(&config.logging);
        Arc::new(Self::new(config))
    }

    /// Stops auto-refresh timers and closes every connection
    pub async fn shutdown(&self) {
        self.schemas.clear_cache(None).await;
        self.connections.disconnect_all().await;
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{EmbeddedConfig, EngineConfig, EngineKind};
    use query::QueryOptions;

    #[tokio::test]
    async fn services_share_one_connection_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState::default();
        let path = dir.path().join("shared.db");

        state
            .connections
            .create_connection("main", EngineConfig::Embedded(EmbeddedConfig::new("main", path.to_string_lossy())))
            .await
            .expect("connect");

        let created = state
            .queries
            .execute_query("main", "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", Vec::new(), QueryOptions::default())
            .await;
        assert!(created.error.is_none(), "{:?}", created.error);

        let schema = state.schemas.get_schema("main", false).await.expect("schema");
        assert!(schema.has_table("notes"));

        state.shutdown().await;
        assert!(state.connections.get_active_connections().await.is_empty());
        assert_eq!(state.connections.get_pool_stats().await[&EngineKind::Embedded].active, 0);
        assert_eq!(state.schemas.get_cache_stats().await.size, 0);
    }
}
