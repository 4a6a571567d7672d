//! Query history and performance metrics
//!
//! Both logs are bounded per connection and evict their oldest entry first.
//! Nothing here outlives the process.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::types::{QueryResult, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub query_id: String,
    pub connection_id: String,
    pub query: String,
    /// Milliseconds
    pub execution_time: f64,
    pub row_count: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceMetric {
    /// Derives the metric from a finished result. Mutations count affected rows.
    pub fn from_result(query_id: &str, connection_id: &str, query: &str, result: &QueryResult) -> Self {
        Self {
            query_id: query_id.to_string(),
            connection_id: connection_id.to_string(),
            query: query.to_string(),
            execution_time: result.execution_time_ms.max(0.0),
            row_count: result.affected_rows.unwrap_or(result.total_rows),
            success: !result.is_error(),
            timestamp: Utc::now(),
        }
    }
}

/// One executed query with its parameters, result and derived metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub connection_id: String,
    pub query: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
    pub executed_at: DateTime<Utc>,
    pub result: QueryResult,
    pub metrics: PerformanceMetric,
    pub success: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub favorite: bool,
}

impl HistoryEntry {
    pub fn new(metrics: PerformanceMetric, parameters: Vec<Value>, result: QueryResult) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            connection_id: metrics.connection_id.clone(),
            query: metrics.query.clone(),
            parameters,
            executed_at: metrics.timestamp,
            success: metrics.success,
            result,
            metrics,
            tags: Vec::new(),
            favorite: false,
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.result.error.as_deref()
    }

    fn matches(&self, needle: &str) -> bool {
        self.query.to_lowercase().contains(needle)
            || self.tags.iter().any(|tag| tag.to_lowercase().contains(needle))
    }
}

/// Per-connection FIFO with a shared capacity
#[derive(Debug)]
struct BoundedLog<T> {
    max_per_connection: usize,
    by_connection: HashMap<String, VecDeque<T>>,
}

impl<T> BoundedLog<T> {
    fn new(max_per_connection: usize) -> Self {
        Self {
            max_per_connection,
            by_connection: HashMap::new(),
        }
    }

    fn push(&mut self, connection_id: &str, item: T) {
        if self.max_per_connection == 0 {
            return;
        }
        let log = self.by_connection.entry(connection_id.to_string()).or_default();
        while log.len() >= self.max_per_connection {
            log.pop_front();
        }
        log.push_back(item);
    }

    fn iter<'a>(&'a self, connection_id: Option<&'a str>) -> impl Iterator<Item = &'a T> + 'a {
        self.by_connection
            .iter()
            .filter(move |(id, _)| connection_id.map_or(true, |wanted| wanted == id.as_str()))
            .flat_map(|(_, log)| log.iter())
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.by_connection.values_mut().flat_map(|log| log.iter_mut())
    }

    fn clear(&mut self, connection_id: Option<&str>) {
        match connection_id {
            Some(id) => {
                self.by_connection.remove(id);
            }
            None => self.by_connection.clear(),
        }
    }
}

/// Executed queries, oldest first
#[derive(Debug)]
pub struct QueryHistory {
    log: BoundedLog<HistoryEntry>,
}

impl QueryHistory {
    pub fn new(max_per_connection: usize) -> Self {
        Self {
            log: BoundedLog::new(max_per_connection),
        }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        let connection_id = entry.connection_id.clone();
        self.log.push(&connection_id, entry);
    }

    fn sorted(mut entries: Vec<&HistoryEntry>) -> Vec<HistoryEntry> {
        entries.sort_by_key(|entry| entry.executed_at);
        entries.into_iter().cloned().collect()
    }

    /// Entries oldest first; `limit` keeps the most recent ones
    pub fn entries(&self, connection_id: Option<&str>, limit: Option<usize>) -> Vec<HistoryEntry> {
        let mut entries = Self::sorted(self.log.iter(connection_id).collect());
        if let Some(limit) = limit {
            let skip = entries.len().saturating_sub(limit);
            entries.drain(..skip);
        }
        entries
    }

    /// Case-insensitive substring match over query text and tags
    pub fn search(&self, term: &str, connection_id: Option<&str>) -> Vec<HistoryEntry> {
        let needle = term.to_lowercase();
        Self::sorted(
            self.log
                .iter(connection_id)
                .filter(|entry| entry.matches(&needle))
                .collect(),
        )
    }

    /// Returns false when no entry has that id
    pub fn set_favorite(&mut self, entry_id: &str, favorite: bool) -> bool {
        match self.log.iter_mut().find(|entry| entry.id == entry_id) {
            Some(entry) => {
                entry.favorite = favorite;
                true
            }
            None => false,
        }
    }

    pub fn favorites(&self) -> Vec<HistoryEntry> {
        Self::sorted(self.log.iter(None).filter(|entry| entry.favorite).collect())
    }

    pub fn clear(&mut self, connection_id: Option<&str>) {
        self.log.clear(connection_id);
    }
}

#[derive(Debug)]
pub struct PerformanceLog {
    log: BoundedLog<PerformanceMetric>,
}

impl PerformanceLog {
    pub fn new(max_per_connection: usize) -> Self {
        Self {
            log: BoundedLog::new(max_per_connection),
        }
    }

    pub fn record(&mut self, metric: PerformanceMetric) {
        let connection_id = metric.connection_id.clone();
        self.log.push(&connection_id, metric);
    }

    pub fn metrics(&self, connection_id: Option<&str>) -> Vec<PerformanceMetric> {
        let mut metrics: Vec<PerformanceMetric> = self.log.iter(connection_id).cloned().collect();
        metrics.sort_by_key(|metric| metric.timestamp);
        metrics
    }

    /// Metrics strictly slower than `threshold_ms`
    pub fn slow(&self, threshold_ms: f64) -> Vec<PerformanceMetric> {
        let mut slow: Vec<PerformanceMetric> = self
            .log
            .iter(None)
            .filter(|metric| metric.execution_time > threshold_ms)
            .cloned()
            .collect();
        slow.sort_by_key(|metric| metric.timestamp);
        slow
    }

    pub fn clear(&mut self, connection_id: Option<&str>) {
        self.log.clear(connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(connection: &str, ms: f64) -> PerformanceMetric {
        let mut result = QueryResult::empty();
        result.execution_time_ms = ms;
        result.total_rows = 1;
        PerformanceMetric::from_result(&Uuid::new_v4().to_string(), connection, "SELECT 1", &result)
    }

    fn entry(connection: &str, query: &str, ms: f64) -> HistoryEntry {
        let mut metrics = metric(connection, ms);
        metrics.query = query.to_string();
        HistoryEntry::new(metrics, vec![Value::Int(1)], QueryResult::empty())
    }

    #[test]
    fn keeps_the_most_recent_entries_oldest_first() {
        let mut history = QueryHistory::new(2);
        history.record(entry("a", "SELECT 1", 1.0));
        history.record(entry("a", "SELECT 2", 1.0));
        history.record(entry("a", "SELECT 3", 1.0));

        let queries: Vec<String> = history.entries(Some("a"), None).into_iter().map(|e| e.query).collect();
        assert_eq!(queries, vec!["SELECT 2", "SELECT 3"]);
    }

    #[test]
    fn bounds_apply_per_connection() {
        let mut history = QueryHistory::new(1);
        history.record(entry("a", "SELECT 1", 1.0));
        history.record(entry("b", "SELECT 2", 1.0));

        assert_eq!(history.entries(None, None).len(), 2);
        assert_eq!(history.entries(None, Some(1)).len(), 1);
    }

    #[test]
    fn search_matches_query_text_and_tags() {
        let mut history = QueryHistory::new(10);
        history.record(entry("a", "SELECT * FROM Users", 1.0));
        let mut tagged = entry("a", "SELECT 1", 1.0);
        tagged.tags = vec!["Billing".to_string()];
        history.record(tagged);

        assert_eq!(history.search("users", None).len(), 1);
        assert_eq!(history.search("BILL", Some("a")).len(), 1);
        assert!(history.search("users", Some("b")).is_empty());
    }

    #[test]
    fn favorites_toggle_by_entry_id() {
        let mut history = QueryHistory::new(10);
        let first = entry("a", "SELECT 1", 1.0);
        let id = first.id.clone();
        history.record(first);

        assert!(history.set_favorite(&id, true));
        assert_eq!(history.favorites().len(), 1);
        assert!(history.set_favorite(&id, false));
        assert!(history.favorites().is_empty());
        assert!(!history.set_favorite("missing", true));
    }

    #[test]
    fn entries_keep_parameters_and_the_result() {
        let failed = QueryResult::failure("boom", 2.0);
        let metrics = PerformanceMetric::from_result("q1", "a", "SELECT $1", &failed);
        assert!(!metrics.success);

        let entry = HistoryEntry::new(metrics, vec![Value::Text("x".into())], failed);
        assert!(!entry.success);
        assert_eq!(entry.error(), Some("boom"));
        assert_eq!(entry.parameters, vec![Value::Text("x".into())]);
        assert_eq!(entry.metrics.query_id, "q1");
    }

    #[test]
    fn slow_queries_use_a_strict_threshold() {
        let mut log = PerformanceLog::new(10);
        log.record(metric("a", 5.0));
        log.record(metric("a", 10.0));
        log.record(metric("b", 50.0));

        assert_eq!(log.slow(10.0).len(), 1);
        assert_eq!(log.slow(4.9).len(), 3);
        assert!(log.slow(50.0).is_empty());

        log.clear(Some("b"));
        assert_eq!(log.metrics(None).len(), 2);
    }
}
