//! DataEngine trait definition
//!
//! This is the capability contract every engine client implements. One client
//! instance owns exactly one native handle (pool or driver client) for the
//! lifetime of one named connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{
    CancelSupport, ConnectionStatus, DatabaseSchema, EngineKind, QueryId, QueryRequest,
    QueryResult, TableSummary,
};

/// Core trait that all engine clients must implement
#[async_trait]
pub trait DataEngine: Send + Sync {
    /// Which engine family this client talks to
    fn kind(&self) -> EngineKind;

    /// Returns a human-readable name for this driver
    fn driver_name(&self) -> &'static str {
        self.kind().display_name()
    }

    async fn status(&self) -> ConnectionStatus;

    async fn last_error(&self) -> Option<String>;

    async fn connected_at(&self) -> Option<DateTime<Utc>>;

    /// Validates the configuration, then opens the native handle.
    ///
    /// Configuration problems fail before any I/O. Native failures leave the
    /// client in `error` status and are returned.
    async fn connect(&self) -> EngineResult<()>;

    /// Closes the native handle if open. Safe to call repeatedly.
    async fn disconnect(&self) -> EngineResult<()>;

    /// Issues a cheap round trip. Never fails; a `false` also records
    /// `error` status on the client.
    async fn test_connection(&self) -> bool;

    /// Executes a query. Native failures are reported in `QueryResult::error`.
    async fn execute_query(&self, request: &QueryRequest, query_id: QueryId) -> QueryResult;

    /// Introspects every table/collection of the configured database
    async fn get_schema(&self) -> EngineResult<DatabaseSchema>;

    async fn get_databases(&self) -> EngineResult<Vec<String>>;

    async fn get_tables(&self, database: Option<&str>) -> EngineResult<Vec<TableSummary>>;

    /// Cancels a running query on the native side
    async fn cancel(&self, query_id: QueryId) -> EngineResult<()> {
        let _ = query_id;
        Err(EngineError::not_supported(
            "Query cancellation is not supported by this driver",
        ))
    }

    fn cancel_support(&self) -> CancelSupport {
        CancelSupport::None
    }
}
