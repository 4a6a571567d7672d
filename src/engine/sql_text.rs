//! Lightweight SQL text inspection
//!
//! Heuristics over raw query text shared by the drivers, the validator and
//! the pagination rewriter. None of this is a parser; `sql_safety` is the
//! place for real statement classification.

use std::sync::LazyLock;

use regex::Regex;

static LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--[^\n]*").expect("valid regex"));
static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid regex"));
static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid regex"));
static TABLE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(FROM|JOIN|UPDATE|INTO)\s+((?:[`"\[]?[\w$]+[`"\]]?\.)?[`"\[]?[\w$]+[`"\]]?)"#)
        .expect("valid regex")
});
static LIMIT_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\s+\d+").expect("valid regex"));
static AGGREGATE_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(COUNT|SUM|AVG|MAX|MIN)\s*\(").expect("valid regex"));
static FROM_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bFROM\b").expect("valid regex"));

/// Removes comments and blanks string literals so keyword scans do not
/// trip over quoted text.
pub fn normalize(query: &str) -> String {
    let without_block = BLOCK_COMMENT.replace_all(query, " ");
    let without_line = LINE_COMMENT.replace_all(&without_block, " ");
    STRING_LITERAL.replace_all(&without_line, "''").into_owned()
}

/// First keyword of the statement, uppercased
pub fn leading_keyword(query: &str) -> String {
    normalize(query)
        .trim_start()
        .trim_start_matches('(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

pub fn is_select(query: &str) -> bool {
    matches!(leading_keyword(query).as_str(), "SELECT" | "WITH")
}

/// Statements that produce a row set rather than an affected-row count
pub fn returns_rows(query: &str) -> bool {
    matches!(
        leading_keyword(query).as_str(),
        "SELECT" | "WITH" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "PRAGMA" | "VALUES" | "TABLE"
    ) || has_returning_clause(query)
}

fn has_returning_clause(query: &str) -> bool {
    normalize(query).to_ascii_uppercase().contains(" RETURNING ")
}

pub fn has_limit(query: &str) -> bool {
    LIMIT_CLAUSE.is_match(&normalize(query))
}

pub fn has_aggregate(query: &str) -> bool {
    AGGREGATE_CALL.is_match(&normalize(query))
}

/// Strips identifier quoting and any schema qualifier
pub fn bare_identifier(raw: &str) -> String {
    let last = raw.rsplit('.').next().unwrap_or(raw);
    last.trim_matches(|c| c == '`' || c == '"' || c == '[' || c == ']')
        .to_string()
}

/// Table names referenced after FROM / JOIN / UPDATE / INTO, in order of
/// appearance, deduplicated.
pub fn referenced_tables(query: &str) -> Vec<String> {
    let normalized = normalize(query);
    let mut tables: Vec<String> = Vec::new();
    for caps in TABLE_REFERENCE.captures_iter(&normalized) {
        let name = bare_identifier(&caps[2]);
        if name.is_empty() || is_keyword(&name) {
            continue;
        }
        if !tables.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
            tables.push(name);
        }
    }
    tables
}

/// Single source table of a simple SELECT, used to resolve column flags
/// from the catalog. `None` for joins, subqueries and set operations.
pub fn single_source_table(query: &str) -> Option<String> {
    if !is_select(query) {
        return None;
    }
    let normalized = normalize(query).to_ascii_uppercase();
    if normalized.contains(" JOIN ") || normalized.contains(" UNION ") {
        return None;
    }
    if FROM_CLAUSE.find_iter(&normalized).count() != 1 {
        return None;
    }
    let tables = referenced_tables(query);
    match tables.as_slice() {
        [only] => Some(only.clone()),
        _ => None,
    }
}

/// 1-based (line, column) of a byte offset in the original text
pub fn position_of(query: &str, offset: usize) -> (usize, usize) {
    let prefix = &query[..offset.min(query.len())];
    let line = prefix.matches('\n').count() + 1;
    let column = prefix.rfind('\n').map(|nl| offset - nl).unwrap_or(offset + 1);
    (line, column)
}

/// Position of the first case-insensitive occurrence of `needle`, or (1, 1)
pub fn locate(query: &str, needle: &str) -> (usize, usize) {
    let haystack = query.to_ascii_lowercase();
    match haystack.find(&needle.to_ascii_lowercase()) {
        Some(offset) => position_of(query, offset),
        None => (1, 1),
    }
}

fn is_keyword(word: &str) -> bool {
    matches!(
        word.to_ascii_uppercase().as_str(),
        "SELECT" | "LATERAL" | "ONLY" | "UNNEST" | "DUAL" | "VALUES"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tables_from_joins_and_mutations() {
        let tables = referenced_tables(
            "SELECT * FROM public.users u JOIN `orders` o ON o.user_id = u.id",
        );
        assert_eq!(tables, vec!["users".to_string(), "orders".to_string()]);

        assert_eq!(referenced_tables("UPDATE items SET x = 1"), vec!["items"]);
        assert_eq!(referenced_tables("INSERT INTO logs VALUES (1)"), vec!["logs"]);
    }

    #[test]
    fn ignores_keywords_inside_strings_and_comments() {
        let query = "SELECT 'from nowhere' AS t FROM real_table -- FROM ghost";
        assert_eq!(referenced_tables(query), vec!["real_table"]);
    }

    #[test]
    fn detects_limit_and_aggregates() {
        assert!(has_limit("select * from t limit 5"));
        assert!(!has_limit("select * from t"));
        assert!(has_aggregate("SELECT COUNT(*) FROM t"));
        assert!(has_aggregate("select max (id) from t"));
        assert!(!has_aggregate("SELECT counter FROM t"));
    }

    #[test]
    fn classifies_row_returning_statements() {
        assert!(returns_rows("  with x as (select 1) select * from x"));
        assert!(returns_rows("PRAGMA table_info('t')"));
        assert!(returns_rows("INSERT INTO t (a) VALUES (1) RETURNING id"));
        assert!(!returns_rows("DELETE FROM t WHERE id = 1"));
    }

    #[test]
    fn single_source_table_only_for_simple_selects() {
        assert_eq!(single_source_table("SELECT id FROM users WHERE id = 1"), Some("users".into()));
        assert_eq!(single_source_table("SELECT * FROM a JOIN b ON a.id = b.id"), None);
        assert_eq!(single_source_table("DELETE FROM users"), None);
    }

    #[test]
    fn locates_line_and_column() {
        let query = "SELECT *\nFROM ghosts";
        assert_eq!(locate(query, "ghosts"), (2, 6));
        assert_eq!(locate(query, "missing"), (1, 1));
    }
}
