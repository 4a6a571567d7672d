// Query Service
// Validation, pagination, execution and history on top of the connection service

pub mod history;
pub mod pagination;
pub mod service;
pub mod validator;

pub use history::{HistoryEntry, PerformanceMetric};
pub use pagination::PageRequest;
pub use service::{QueryOptions, QueryService};
