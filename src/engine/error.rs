//! Engine error types
//!
//! Every failure the gateway can raise is an `EngineError`. Query execution
//! folds these into `QueryResult::error` instead of returning them; lookups
//! and configuration checks propagate them with `?`.

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::engine::types::EngineKind;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Configuration error: {message}")]
    Configuration { field: String, message: String },

    #[error("Connection {id} not found")]
    ConnectionNotFound { id: String },

    #[error("Connection pool exhausted for {kind}: maximum of {max} connections reached")]
    PoolExhausted { kind: EngineKind, max: usize },

    #[error("Connection {id} is not connected (status: {status})")]
    NotConnected { id: String, status: String },

    #[error("Query validation failed: {message}")]
    Validation { message: String },

    #[error("{engine} {message}")]
    Native { engine: String, message: String },

    #[error("Syntax error: {message}")]
    Syntax { message: String },

    #[error("Query timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Query cancelled")]
    Cancelled,

    #[error("Not supported: {message}")]
    NotSupported { message: String },
}

impl EngineError {
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for the most common configuration failure.
    pub fn missing_field(field: &str) -> Self {
        Self::configuration(field, format!("'{}' is required", field))
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::ConnectionNotFound { id: id.into() }
    }

    pub fn pool_exhausted(kind: EngineKind, max: usize) -> Self {
        Self::PoolExhausted { kind, max }
    }

    pub fn not_connected(id: impl Into<String>, status: impl ToString) -> Self {
        Self::NotConnected {
            id: id.into(),
            status: status.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Wraps a driver failure, prefixed with the engine's display name.
    pub fn native(engine: &str, message: impl Into<String>) -> Self {
        Self::Native {
            engine: engine.to_string(),
            message: message.into(),
        }
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_errors_carry_engine_prefix() {
        let err = EngineError::native("PostgreSQL", "query execution failed: boom");
        assert_eq!(err.to_string(), "PostgreSQL query execution failed: boom");
    }

    #[test]
    fn not_found_message_names_the_id() {
        assert_eq!(
            EngineError::not_found("primary").to_string(),
            "Connection primary not found"
        );
    }

    #[test]
    fn serializes_as_display_string() {
        let json = serde_json::to_string(&EngineError::timeout(250)).expect("serialize");
        assert_eq!(json, "\"Query timed out after 250ms\"");
    }
}
