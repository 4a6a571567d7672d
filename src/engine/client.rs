//! Engine client dispatch
//!
//! The engine set is closed, so clients are an enum rather than trait
//! objects behind a registry. Every arm delegates to the concrete driver.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::drivers::mongodb::MongoClient;
use crate::engine::drivers::mysql::MySqlClient;
use crate::engine::drivers::postgres::PostgresClient;
use crate::engine::drivers::sqlite::SqliteClient;
use crate::engine::error::EngineResult;
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    CancelSupport, ConnectionStatus, DatabaseSchema, EngineConfig, EngineKind, QueryId,
    QueryRequest, QueryResult, TableSummary,
};

/// The client owned by exactly one connection
pub enum EngineClient {
    Document(MongoClient),
    RelationalA(PostgresClient),
    RelationalB(MySqlClient),
    Embedded(SqliteClient),
}

macro_rules! dispatch {
    ($self:ident, $client:ident => $body:expr) => {
        match $self {
            EngineClient::Document($client) => $body,
            EngineClient::RelationalA($client) => $body,
            EngineClient::RelationalB($client) => $body,
            EngineClient::Embedded($client) => $body,
        }
    };
}

impl EngineClient {
    /// Builds the matching client without touching the network
    pub fn from_config(config: EngineConfig) -> Self {
        match config {
            EngineConfig::Document(c) => EngineClient::Document(MongoClient::new(c)),
            EngineConfig::RelationalA(c) => EngineClient::RelationalA(PostgresClient::new(c)),
            EngineConfig::RelationalB(c) => EngineClient::RelationalB(MySqlClient::new(c)),
            EngineConfig::Embedded(c) => EngineClient::Embedded(SqliteClient::new(c)),
        }
    }
}

#[async_trait]
impl DataEngine for EngineClient {
    fn kind(&self) -> EngineKind {
        dispatch!(self, c => c.kind())
    }

    fn driver_name(&self) -> &'static str {
        dispatch!(self, c => c.driver_name())
    }

    async fn status(&self) -> ConnectionStatus {
        dispatch!(self, c => c.status().await)
    }

    async fn last_error(&self) -> Option<String> {
        dispatch!(self, c => c.last_error().await)
    }

    async fn connected_at(&self) -> Option<DateTime<Utc>> {
        dispatch!(self, c => c.connected_at().await)
    }

    async fn connect(&self) -> EngineResult<()> {
        dispatch!(self, c => c.connect().await)
    }

    async fn disconnect(&self) -> EngineResult<()> {
        dispatch!(self, c => c.disconnect().await)
    }

    async fn test_connection(&self) -> bool {
        dispatch!(self, c => c.test_connection().await)
    }

    async fn execute_query(&self, request: &QueryRequest, query_id: QueryId) -> QueryResult {
        dispatch!(self, c => c.execute_query(request, query_id).await)
    }

    async fn get_schema(&self) -> EngineResult<DatabaseSchema> {
        dispatch!(self, c => c.get_schema().await)
    }

    async fn get_databases(&self) -> EngineResult<Vec<String>> {
        dispatch!(self, c => c.get_databases().await)
    }

    async fn get_tables(&self, database: Option<&str>) -> EngineResult<Vec<TableSummary>> {
        dispatch!(self, c => c.get_tables(database).await)
    }

    async fn cancel(&self, query_id: QueryId) -> EngineResult<()> {
        dispatch!(self, c => c.cancel(query_id).await)
    }

    fn cancel_support(&self) -> CancelSupport {
        dispatch!(self, c => c.cancel_support())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{EmbeddedConfig, NetworkConfig};

    #[test]
    fn builds_the_client_matching_the_config() {
        let configs = [
            EngineConfig::Document(NetworkConfig::new("localhost", "app")),
            EngineConfig::RelationalA(NetworkConfig::new("localhost", "app")),
            EngineConfig::RelationalB(NetworkConfig::new("localhost", "app")),
            EngineConfig::Embedded(EmbeddedConfig::new("main", "/tmp/app.db")),
        ];

        for config in configs {
            let expected = config.kind();
            let client = EngineClient::from_config(config);
            assert_eq!(client.kind(), expected);
        }
    }

    #[tokio::test]
    async fn new_clients_start_disconnected() {
        let client = EngineClient::from_config(EngineConfig::RelationalB(NetworkConfig::new(
            "localhost",
            "shop",
        )));
        assert_eq!(client.status().await, ConnectionStatus::Disconnected);
        assert_eq!(client.cancel_support(), CancelSupport::Driver);
        assert!(client.connected_at().await.is_none());
    }
}
