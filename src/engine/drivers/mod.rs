//! Engine drivers
//!
//! One client type per engine family. Each client owns its native handle and
//! a `HandleState` that tracks the connection lifecycle.

pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::engine::types::{ConnectionStatus, EngineKind, QueryResult};

#[derive(Debug, Clone)]
struct StateSnapshot {
    status: ConnectionStatus,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
}

/// Lifecycle bookkeeping shared by every client.
///
/// Status is `connected` exactly while the owning client holds an open
/// native handle; clients flip both under their own handle lock.
#[derive(Debug)]
pub struct HandleState {
    inner: RwLock<StateSnapshot>,
}

impl HandleState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StateSnapshot {
                status: ConnectionStatus::Disconnected,
                last_error: None,
                connected_at: None,
            }),
        }
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.read().await.status
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.read().await.last_error.clone()
    }

    pub async fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.connected_at
    }

    pub async fn mark_connecting(&self) {
        let mut state = self.inner.write().await;
        state.status = ConnectionStatus::Connecting;
        state.last_error = None;
    }

    pub async fn mark_connected(&self) {
        let mut state = self.inner.write().await;
        state.status = ConnectionStatus::Connected;
        state.last_error = None;
        state.connected_at = Some(Utc::now());
    }

    /// A successful ping on an open handle. Keeps the original `connected_at`.
    pub async fn mark_healthy(&self) {
        let mut state = self.inner.write().await;
        state.status = ConnectionStatus::Connected;
        state.last_error = None;
        state.connected_at.get_or_insert_with(Utc::now);
    }

    pub async fn mark_error(&self, message: impl Into<String>) {
        let mut state = self.inner.write().await;
        state.status = ConnectionStatus::Error;
        state.last_error = Some(message.into());
    }

    pub async fn mark_disconnected(&self) {
        let mut state = self.inner.write().await;
        state.status = ConnectionStatus::Disconnected;
        state.last_error = None;
    }
}

impl Default for HandleState {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds elapsed since `start`, with microsecond resolution
pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_micros() as f64 / 1000.0
}

/// Standard error-result for a failed native call
pub(crate) fn execution_failure(kind: EngineKind, cause: impl std::fmt::Display, time_ms: f64) -> QueryResult {
    QueryResult::failure(
        format!("{} query execution failed: {}", kind.display_name(), cause),
        time_ms,
    )
}

pub(crate) fn not_connected_failure(kind: EngineKind) -> QueryResult {
    execution_failure(kind, "connection is not open", 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_transitions_clear_errors() {
        let state = HandleState::new();
        assert_eq!(state.status().await, ConnectionStatus::Disconnected);

        state.mark_error("refused").await;
        assert_eq!(state.status().await, ConnectionStatus::Error);
        assert_eq!(state.last_error().await.as_deref(), Some("refused"));

        state.mark_connected().await;
        assert_eq!(state.status().await, ConnectionStatus::Connected);
        assert!(state.last_error().await.is_none());
        assert!(state.connected_at().await.is_some());

        state.mark_disconnected().await;
        assert_eq!(state.status().await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn healthy_ping_recovers_without_resetting_connected_at() {
        let state = HandleState::new();
        state.mark_connected().await;
        let since = state.connected_at().await;

        state.mark_error("timeout").await;
        state.mark_healthy().await;
        assert_eq!(state.status().await, ConnectionStatus::Connected);
        assert!(state.last_error().await.is_none());
        assert_eq!(state.connected_at().await, since);
    }

    #[test]
    fn execution_failure_is_engine_prefixed() {
        let result = execution_failure(EngineKind::RelationalB, "syntax error", 1.5);
        assert_eq!(
            result.error.as_deref(),
            Some("MySQL query execution failed: syntax error")
        );
        assert!(result.rows.is_empty());
        assert!(result.columns.is_empty());
    }
}
