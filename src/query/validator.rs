//! Dialect-aware query validation
//!
//! Errors make a query invalid and stop it from being dispatched. Warnings
//! are informational and travel with the result.

use std::sync::LazyLock;

use regex::Regex;

use crate::engine::drivers::mongodb::{self, DocumentOperation};
use crate::engine::sql_text;
use crate::engine::types::{
    DatabaseSchema, EngineKind, Severity, ValidationError, ValidationResult, ValidationWarning,
};

static DROP_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bDROP\s+(TABLE|DATABASE)\b").expect("valid regex"));
static WHERE_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").expect("valid regex"));
static STACKED_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i);\s*(DROP|DELETE|INSERT|UPDATE)\b").expect("valid regex")
});
static UNION_SELECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bUNION\s+(ALL\s+)?SELECT\b").expect("valid regex"));
static UNSUPPORTED_JOIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(RIGHT\s+(OUTER\s+)?JOIN|FULL\s+(OUTER\s+)?JOIN)\b").expect("valid regex")
});
static CTE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bWITH\s+(?:RECURSIVE\s+)?|,\s*)([\w$]+)\s*(?:\([^)]*\)\s*)?\s+AS\s*\(").expect("valid regex")
});

/// Operators only PostgreSQL understands, with their display form
static POSTGRES_OPERATORS: LazyLock<[(Regex, &'static str); 4]> = LazyLock::new(|| {
    [
        (Regex::new(r"(?i)\bILIKE\b").expect("valid regex"), "ILIKE"),
        (Regex::new("::").expect("valid regex"), "::"),
        (Regex::new("->>").expect("valid regex"), "->>"),
        (Regex::new("#>").expect("valid regex"), "#>"),
    ]
});

#[derive(Default)]
struct Findings {
    errors: Vec<ValidationError>,
    warnings: Vec<ValidationWarning>,
}

impl Findings {
    fn error(&mut self, query: &str, needle: &str, message: String) {
        let (line, column) = sql_text::locate(query, needle);
        self.errors.push(ValidationError {
            line,
            column,
            message,
            severity: Severity::Error,
        });
    }

    fn warning(&mut self, query: &str, needle: &str, message: &str, suggestion: Option<&str>) {
        let (line, column) = sql_text::locate(query, needle);
        self.warnings.push(ValidationWarning {
            line,
            column,
            message: message.to_string(),
            suggestion: suggestion.map(str::to_string),
        });
    }

    fn finish(self) -> ValidationResult {
        ValidationResult {
            is_valid: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
        }
    }
}

/// Validates `query` for `kind`.
///
/// Table and collection existence is only checked when a schema is given.
pub fn validate(kind: EngineKind, query: &str, schema: Option<&DatabaseSchema>) -> ValidationResult {
    let mut findings = Findings::default();
    if query.trim().is_empty() {
        findings.error(query, "", "Query is empty".to_string());
        return findings.finish();
    }

    match kind {
        EngineKind::Document => validate_document(query, schema, &mut findings),
        _ => validate_sql(kind, query, schema, &mut findings),
    }
    findings.finish()
}

fn validate_sql(kind: EngineKind, query: &str, schema: Option<&DatabaseSchema>, findings: &mut Findings) {
    let normalized = sql_text::normalize(query);

    if let Some(schema) = schema {
        let ctes: Vec<String> = CTE_NAME
            .captures_iter(&normalized)
            .map(|caps| caps[1].to_string())
            .collect();
        for table in sql_text::referenced_tables(query) {
            if ctes.iter().any(|cte| cte.eq_ignore_ascii_case(&table)) {
                continue;
            }
            if !schema.has_table(&table) {
                findings.error(query, &table, format!("Table '{}' does not exist", table));
            }
        }
    }

    if let Some(found) = DROP_OBJECT.find(&normalized) {
        findings.warning(
            query,
            found.as_str(),
            &format!("{} is a dangerous operation", found.as_str().to_ascii_uppercase()),
            Some("Make sure you have a backup before dropping objects"),
        );
    }

    let keyword = sql_text::leading_keyword(query);
    if matches!(keyword.as_str(), "UPDATE" | "DELETE") && !WHERE_CLAUSE.is_match(&normalized) {
        findings.warning(
            query,
            &keyword,
            &format!("{} without WHERE clause will affect all rows", keyword),
            Some("Add a WHERE clause to limit the affected rows"),
        );
    }

    if let Some(found) = STACKED_STATEMENT.find(&normalized).or_else(|| UNION_SELECT.find(&normalized)) {
        findings.warning(
            query,
            found.as_str().trim_start_matches(';').trim(),
            "Potentially unsafe query pattern detected (possible SQL injection)",
            None,
        );
    }

    if kind == EngineKind::Embedded {
        if let Some(found) = UNSUPPORTED_JOIN.find(&normalized) {
            findings.error(
                query,
                found.as_str(),
                format!("{} is not supported by SQLite", found.as_str().to_ascii_uppercase()),
            );
        }
    }

    if kind != EngineKind::RelationalA {
        for (pattern, label) in POSTGRES_OPERATORS.iter() {
            if pattern.is_match(&normalized) {
                findings.error(
                    query,
                    label,
                    format!(
                        "Operator '{}' is PostgreSQL-specific and not supported by {}",
                        label,
                        kind.display_name()
                    ),
                );
            }
        }
    }

    if sql_text::is_select(query) && !sql_text::has_limit(query) && !sql_text::has_aggregate(query) {
        findings.warning(
            query,
            "SELECT",
            "Query may return a large result set",
            Some("Add a LIMIT clause"),
        );
    }
}

fn validate_document(query: &str, schema: Option<&DatabaseSchema>, findings: &mut Findings) {
    let parsed = match mongodb::parse_query(query) {
        Ok(parsed) => parsed,
        Err(e) => {
            findings.error(query, "", e.to_string());
            return;
        }
    };

    // Collections in another database are not covered by the cached schema
    let same_database = parsed
        .database
        .as_deref()
        .zip(schema)
        .map(|(db, schema)| db == schema.database)
        .unwrap_or(true);
    if let Some(schema) = schema.filter(|_| same_database) {
        let creates = matches!(parsed.operation, DocumentOperation::CreateCollection);
        if !creates && !schema.has_table(&parsed.collection) {
            findings.error(
                query,
                &parsed.collection,
                format!("Collection '{}' does not exist", parsed.collection),
            );
        }
    }

    if matches!(parsed.operation, DocumentOperation::Find { .. }) && parsed.limit.is_none() {
        findings.warning(
            query,
            "find",
            "Query may return a large result set",
            Some("Chain .limit(n) to bound the cursor"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{TableKind, TableSchema};

    fn schema(kind: EngineKind, tables: &[&str]) -> DatabaseSchema {
        DatabaseSchema::new(
            "app",
            kind,
            tables
                .iter()
                .map(|name| TableSchema::new(*name, TableKind::Table))
                .collect(),
        )
    }

    fn warnings(result: &ValidationResult) -> String {
        result.warning_messages().join("\n")
    }

    #[test]
    fn unknown_table_is_an_error_naming_the_table() {
        let schema = schema(EngineKind::RelationalA, &["users"]);
        let result = validate(
            EngineKind::RelationalA,
            "SELECT * FROM users u JOIN ghosts g ON g.id = u.id LIMIT 5",
            Some(&schema),
        );

        assert!(!result.is_valid);
        assert_eq!(result.error_messages(), vec!["Table 'ghosts' does not exist"]);
        assert_eq!((result.errors[0].line, result.errors[0].column), (1, 28));
    }

    #[test]
    fn cte_names_are_not_tables() {
        let schema = schema(EngineKind::RelationalA, &["orders"]);
        let result = validate(
            EngineKind::RelationalA,
            "WITH recent AS (SELECT * FROM orders) SELECT * FROM recent LIMIT 10",
            Some(&schema),
        );
        assert!(result.is_valid, "{:?}", result.errors);

        let recursive = validate(
            EngineKind::Embedded,
            "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 5) SELECT COUNT(*) FROM seq",
            Some(&schema),
        );
        assert!(recursive.is_valid, "{:?}", recursive.errors);
    }

    #[test]
    fn delete_without_where_warns_about_the_clause() {
        let schema = schema(EngineKind::RelationalB, &["t"]);
        let result = validate(EngineKind::RelationalB, "DELETE FROM t", Some(&schema));

        assert!(result.is_valid);
        assert!(warnings(&result).contains("WHERE clause"));
    }

    #[test]
    fn drop_table_is_dangerous() {
        let result = validate(EngineKind::Embedded, "DROP TABLE t", None);
        assert!(warnings(&result).contains("dangerous"));
    }

    #[test]
    fn stacked_statements_and_union_select_are_unsafe() {
        let stacked = validate(EngineKind::RelationalB, "SELECT id FROM t LIMIT 1; DROP TABLE t", None);
        assert!(warnings(&stacked).contains("unsafe"));

        let union = validate(
            EngineKind::RelationalB,
            "SELECT id FROM a UNION SELECT id FROM b LIMIT 1",
            None,
        );
        assert!(warnings(&union).contains("unsafe"));
    }

    #[test]
    fn sqlite_rejects_right_and_full_joins() {
        let result = validate(
            EngineKind::Embedded,
            "SELECT * FROM a RIGHT JOIN b ON a.id = b.id LIMIT 1",
            None,
        );
        assert!(!result.is_valid);
        assert!(result.error_messages()[0].contains("RIGHT JOIN"));

        let postgres = validate(
            EngineKind::RelationalA,
            "SELECT * FROM a FULL OUTER JOIN b ON a.id = b.id LIMIT 1",
            None,
        );
        assert!(postgres.is_valid);
    }

    #[test]
    fn postgres_operators_fail_elsewhere() {
        let query = "SELECT name FROM users WHERE name ILIKE 'a%' LIMIT 1";
        assert!(validate(EngineKind::RelationalA, query, None).is_valid);

        let result = validate(EngineKind::RelationalB, query, None);
        assert!(!result.is_valid);
        assert!(result.error_messages()[0].contains("ILIKE"));

        let cast = validate(EngineKind::Embedded, "SELECT id::text FROM t LIMIT 1", None);
        assert!(!cast.is_valid);
    }

    #[test]
    fn operators_inside_string_literals_are_ignored() {
        let result = validate(EngineKind::RelationalB, "SELECT 'a::b' AS x FROM t LIMIT 1", None);
        assert!(result.is_valid);
    }

    #[test]
    fn unbounded_select_warns_but_aggregates_do_not() {
        let unbounded = validate(EngineKind::Embedded, "SELECT * FROM t", None);
        assert!(warnings(&unbounded).contains("may return a large result set"));

        let count = validate(EngineKind::Embedded, "SELECT COUNT(*) FROM t", None);
        assert!(count.warnings.is_empty());
    }

    #[test]
    fn document_queries_check_collection_and_syntax() {
        let schema = schema(EngineKind::Document, &["users"]);

        let ok = validate(EngineKind::Document, r#"db.users.find({}).limit(5)"#, Some(&schema));
        assert!(ok.is_valid);
        assert!(ok.warnings.is_empty());

        let missing = validate(EngineKind::Document, r#"orders.find({})"#, Some(&schema));
        assert_eq!(missing.error_messages(), vec!["Collection 'orders' does not exist"]);

        let malformed = validate(EngineKind::Document, r#"users.find({broken)"#, Some(&schema));
        assert!(!malformed.is_valid);
    }

    #[test]
    fn empty_query_is_invalid() {
        assert!(!validate(EngineKind::RelationalA, "  ", None).is_valid);
    }
}
