//! TTL-bounded schema snapshots, evicted in insertion order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::engine::types::DatabaseSchema;

struct CacheEntry {
    schema: Arc<DatabaseSchema>,
    cached_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntryStats {
    pub connection_id: String,
    pub table_count: usize,
    pub age_secs: u64,
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_secs: u64,
    pub entries: Vec<CacheEntryStats>,
}

pub struct SchemaCache {
    ttl: Duration,
    max_size: usize,
    entries: HashMap<String, CacheEntry>,
    /// Connection ids, oldest insertion first
    order: VecDeque<String>,
}

impl SchemaCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        entry.cached_at.elapsed() >= self.ttl
    }

    /// Live entry for `connection_id`. Expired entries are dropped.
    pub fn get(&mut self, connection_id: &str) -> Option<Arc<DatabaseSchema>> {
        let entry = self.entries.get(connection_id)?;
        if self.is_expired(entry) {
            self.remove(connection_id);
            return None;
        }
        Some(Arc::clone(&entry.schema))
    }

    /// Stores a snapshot, evicting the oldest entry when full
    pub fn insert(&mut self, connection_id: &str, schema: Arc<DatabaseSchema>) {
        if self.max_size == 0 {
            return;
        }
        if self.entries.contains_key(connection_id) {
            self.order.retain(|id| id != connection_id);
        } else {
            while self.entries.len() >= self.max_size {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.entries.remove(&oldest);
            }
        }

        self.order.push_back(connection_id.to_string());
        self.entries.insert(
            connection_id.to_string(),
            CacheEntry {
                schema,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn remove(&mut self, connection_id: &str) -> bool {
        self.order.retain(|id| id != connection_id);
        self.entries.remove(connection_id).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .order
            .iter()
            .filter_map(|id| {
                let entry = self.entries.get(id)?;
                let age = entry.cached_at.elapsed();
                Some(CacheEntryStats {
                    connection_id: id.clone(),
                    table_count: entry.schema.tables.len(),
                    age_secs: age.as_secs(),
                    expires_in_secs: self.ttl.saturating_sub(age).as_secs(),
                })
            })
            .collect();

        CacheStats {
            size: self.entries.len(),
            max_size: self.max_size,
            ttl_secs: self.ttl.as_secs(),
            entries,
        }
    }
}
