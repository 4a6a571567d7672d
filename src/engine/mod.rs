// Data Engine Module
// Universal abstraction layer over the document, relational and embedded engines

pub mod client;
pub mod connection_service;
pub mod drivers;
pub mod error;
pub mod pool;
pub mod query_manager;
pub mod sql_safety;
pub mod sql_text;
pub mod traits;
pub mod types;

pub use client::EngineClient;
pub use connection_service::{Connection, ConnectionService};
pub use error::{EngineError, EngineResult};
pub use pool::PoolStats;
pub use query_manager::QueryManager;
pub use traits::DataEngine;
pub use types::*;
