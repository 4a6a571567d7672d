//! Pagination injection
//!
//! SQL engines get a `LIMIT .. OFFSET ..` clause appended to the text. The
//! document store is paginated structurally through the request's
//! `limit`/`offset`, which its driver applies to the cursor.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::engine::drivers::mongodb::{self, DocumentOperation};
use crate::engine::sql_text;
use crate::engine::types::{EngineKind, QueryRequest};

static TRAILING_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+LIMIT\s+\d+(\s*,\s*\d+)?(\s+OFFSET\s+\d+)?\s*$").expect("valid regex")
});

/// Caller-requested pagination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

impl PageRequest {
    pub fn is_explicit(&self) -> bool {
        self.page_size.is_some() || self.limit.is_some() || self.offset.is_some()
    }

    /// Explicit `(limit, offset)`; `page_size` wins over `limit`.
    fn window(&self, default_limit: u64) -> (u64, u64) {
        if let Some(size) = self.page_size {
            let page = self.page.unwrap_or(1).max(1);
            let offset = self.offset.unwrap_or((page - 1).saturating_mul(size));
            return (size, offset);
        }
        (self.limit.unwrap_or(default_limit), self.offset.unwrap_or(0))
    }
}

/// Limits applied to every dispatched query
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub default_limit: u64,
    pub max_limit: u64,
}

/// What the rewrite decided
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Rewrites `request` in place for `kind`
pub fn apply(kind: EngineKind, request: &mut QueryRequest, page: &PageRequest, limits: Limits) -> Applied {
    match kind {
        EngineKind::Document => apply_structural(request, page, limits),
        _ => apply_sql(request, page, limits),
    }
}

fn apply_sql(request: &mut QueryRequest, page: &PageRequest, limits: Limits) -> Applied {
    let query = request.query.trim().trim_end_matches(';').trim_end();
    if !sql_text::is_select(query) {
        return Applied::default();
    }

    if page.is_explicit() {
        let (limit, offset) = page.window(limits.default_limit);
        let limit = limit.min(limits.max_limit);
        let base = TRAILING_LIMIT.replace(query, "").into_owned();
        request.query = if offset > 0 {
            format!("{} LIMIT {} OFFSET {}", base, limit, offset)
        } else {
            format!("{} LIMIT {}", base, limit)
        };
        return Applied {
            limit: Some(limit),
            offset: (offset > 0).then_some(offset),
        };
    }

    if sql_text::has_limit(query) || sql_text::has_aggregate(query) {
        return Applied::default();
    }

    let limit = limits.default_limit.min(limits.max_limit);
    request.query = format!("{} LIMIT {}", query, limit);
    Applied {
        limit: Some(limit),
        offset: None,
    }
}

fn apply_structural(request: &mut QueryRequest, page: &PageRequest, limits: Limits) -> Applied {
    if page.is_explicit() {
        let (limit, offset) = page.window(limits.default_limit);
        request.limit = Some(limit.min(limits.max_limit));
        request.offset = (offset > 0).then_some(offset);
        return Applied {
            limit: request.limit,
            offset: request.offset,
        };
    }

    // Only cursor-producing reads get a default; a chained .limit() is clamped
    let Ok(parsed) = mongodb::parse_query(&request.query) else {
        return Applied::default();
    };
    if !matches!(
        parsed.operation,
        DocumentOperation::Find { .. } | DocumentOperation::Aggregate { .. }
    ) || parsed.explain
    {
        return Applied::default();
    }

    let requested = parsed
        .limit
        .filter(|l| *l > 0)
        .map(|l| l as u64)
        .unwrap_or(limits.default_limit);
    request.limit = Some(requested.min(limits.max_limit));
    Applied {
        limit: request.limit,
        offset: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: Limits = Limits {
        default_limit: 100,
        max_limit: 1000,
    };

    fn rewrite(kind: EngineKind, query: &str, page: PageRequest) -> QueryRequest {
        let mut request = QueryRequest::new("c", query);
        apply(kind, &mut request, &page, LIMITS);
        request
    }

    #[test]
    fn page_and_size_translate_to_limit_offset() {
        let page = PageRequest {
            page: Some(2),
            page_size: Some(10),
            ..PageRequest::default()
        };
        let request = rewrite(EngineKind::RelationalA, "SELECT * FROM users", page);
        assert_eq!(request.query, "SELECT * FROM users LIMIT 10 OFFSET 10");
    }

    #[test]
    fn explicit_limit_is_clamped_to_max() {
        let page = PageRequest {
            page_size: Some(2000),
            ..PageRequest::default()
        };
        let request = rewrite(EngineKind::RelationalB, "SELECT * FROM orders;", page);
        assert_eq!(request.query, "SELECT * FROM orders LIMIT 1000");
    }

    #[test]
    fn explicit_pagination_replaces_a_trailing_limit() {
        let page = PageRequest {
            limit: Some(5),
            offset: Some(20),
            ..PageRequest::default()
        };
        let request = rewrite(EngineKind::Embedded, "SELECT * FROM t LIMIT 50 OFFSET 3", page);
        assert_eq!(request.query, "SELECT * FROM t LIMIT 5 OFFSET 20");
    }

    #[test]
    fn default_limit_is_injected_once() {
        let once = rewrite(EngineKind::Embedded, "SELECT * FROM t", PageRequest::default());
        assert_eq!(once.query, "SELECT * FROM t LIMIT 100");

        let twice = rewrite(EngineKind::Embedded, &once.query, PageRequest::default());
        assert_eq!(twice.query, "SELECT * FROM t LIMIT 100");
    }

    #[test]
    fn aggregates_and_mutations_are_untouched() {
        for query in [
            "SELECT COUNT(*) FROM t",
            "select avg(price) from items",
            "DELETE FROM t WHERE id = 1",
            "INSERT INTO t (a) VALUES (1)",
        ] {
            assert_eq!(rewrite(EngineKind::RelationalA, query, PageRequest::default()).query, query);
        }
    }

    #[test]
    fn document_store_pagination_is_structural() {
        let page = PageRequest {
            page: Some(3),
            page_size: Some(25),
            ..PageRequest::default()
        };
        let query = r#"users.find({"active": true})"#;
        let request = rewrite(EngineKind::Document, query, page);
        assert_eq!(request.query, query);
        assert_eq!(request.limit, Some(25));
        assert_eq!(request.offset, Some(50));
    }

    #[test]
    fn document_store_defaults_only_for_reads() {
        let find = rewrite(EngineKind::Document, "users.find({})", PageRequest::default());
        assert_eq!(find.limit, Some(100));

        let chained = rewrite(EngineKind::Document, "users.find({}).limit(5000)", PageRequest::default());
        assert_eq!(chained.limit, Some(1000));

        let count = rewrite(EngineKind::Document, "users.countDocuments({})", PageRequest::default());
        assert_eq!(count.limit, None);

        let unbounded = rewrite(EngineKind::Document, "users.find({}).limit(0)", PageRequest::default());
        assert_eq!(unbounded.limit, Some(100));
    }

    #[test]
    fn huge_page_numbers_saturate_the_offset() {
        let page = PageRequest {
            page: Some(u64::MAX),
            page_size: Some(u64::MAX),
            ..PageRequest::default()
        };
        let request = rewrite(EngineKind::Document, "users.find({})", page);
        assert_eq!(request.limit, Some(1000));
        assert_eq!(request.offset, Some(u64::MAX));
    }
}
