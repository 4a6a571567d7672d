// Schema Service
// Cached structural metadata per connection

pub mod cache;
pub mod service;

pub use cache::CacheStats;
pub use service::{ColumnMatch, SchemaService};
