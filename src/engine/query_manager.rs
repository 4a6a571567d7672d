//! Query Manager
//!
//! Tracks in-flight queries and their connections. Each query owns a cancellation
//! token that the query service races against the native call.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::QueryId;

struct TrackedQuery {
    connection_id: String,
    token: CancellationToken,
}

pub struct QueryManager {
    active: RwLock<HashMap<QueryId, TrackedQuery>>,
}

impl QueryManager {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a fresh query id and returns it with its token
    pub async fn register(&self, connection_id: &str) -> (QueryId, CancellationToken) {
        loop {
            let query_id = QueryId::new();
            if let Ok(token) = self.register_with_id(connection_id, query_id).await {
                return (query_id, token);
            }
        }
    }

    pub async fn register_with_id(
        &self,
        connection_id: &str,
        query_id: QueryId,
    ) -> EngineResult<CancellationToken> {
        let mut active = self.active.write().await;
        if active.contains_key(&query_id) {
            return Err(EngineError::validation(format!(
                "Query ID {} already registered",
                query_id
            )));
        }

        let token = CancellationToken::new();
        active.insert(
            query_id,
            TrackedQuery {
                connection_id: connection_id.to_string(),
                token: token.clone(),
            },
        );
        Ok(token)
    }

    pub async fn finish(&self, query_id: QueryId) {
        self.active.write().await.remove(&query_id);
    }

    /// Fires the query's token. Returns the owning connection id when the
    /// query was still in flight.
    pub async fn cancel(&self, query_id: QueryId) -> Option<String> {
        let active = self.active.read().await;
        let tracked = active.get(&query_id)?;
        tracked.token.cancel();
        Some(tracked.connection_id.clone())
    }
}

impl Default for QueryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finished_queries_can_be_registered_again() {
        let manager = QueryManager::new();
        let (query_id, _token) = manager.register("primary").await;

        manager.finish(query_id).await;
        manager
            .register_with_id("primary", query_id)
            .await
            .expect("id is free once finished");
    }

    #[tokio::test]
    async fn rejects_duplicate_query_id() {
        let manager = QueryManager::new();
        let query_id = QueryId::new();

        manager
            .register_with_id("primary", query_id)
            .await
            .expect("first registration should succeed");

        let err = manager
            .register_with_id("primary", query_id)
            .await
            .expect_err("duplicate should fail");

        assert!(err.to_string().contains("already"));
    }

    #[tokio::test]
    async fn cancel_fires_the_token_once_registered() {
        let manager = QueryManager::new();
        let (query_id, token) = manager.register("reports").await;

        assert_eq!(manager.cancel(query_id).await.as_deref(), Some("reports"));
        assert!(token.is_cancelled());

        manager.finish(query_id).await;
        assert_eq!(manager.cancel(query_id).await, None);
    }
}
