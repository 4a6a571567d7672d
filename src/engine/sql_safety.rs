//! Statement classification for read-only enforcement.
//!
//! SQL engines are classified with `sqlparser`; the document store is
//! classified by the operation its query parses to.

use sqlparser::{
    ast::{Query, Select, SetExpr, Statement},
    dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect},
    parser::Parser,
};

use crate::engine::drivers::mongodb;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::EngineKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyAnalysis {
    pub is_mutation: bool,
}

/// Classifies a query for the given engine.
///
/// Fails when the text cannot be parsed; callers enforcing read-only mode
/// treat that as a refusal.
pub fn analyze(kind: EngineKind, query: &str) -> EngineResult<SafetyAnalysis> {
    match kind {
        EngineKind::Document => {
            let parsed = mongodb::parse_query(query)?;
            Ok(SafetyAnalysis {
                is_mutation: parsed.operation.is_mutation(),
            })
        }
        _ => analyze_sql(kind, query),
    }
}

pub fn analyze_sql(kind: EngineKind, sql: &str) -> EngineResult<SafetyAnalysis> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(EngineError::syntax_error("Empty SQL"));
    }

    let dialect = dialect_for(kind);
    let statements = Parser::parse_sql(&*dialect, trimmed)
        .map_err(|err| EngineError::syntax_error(err.to_string()))?;

    Ok(SafetyAnalysis {
        is_mutation: statements.iter().any(is_mutation_statement),
    })
}

fn dialect_for(kind: EngineKind) -> Box<dyn Dialect> {
    match kind {
        EngineKind::RelationalB => Box::new(MySqlDialect {}),
        EngineKind::Embedded => Box::new(SQLiteDialect {}),
        _ => Box::new(PostgreSqlDialect {}),
    }
}

fn is_mutation_statement(statement: &Statement) -> bool {
    match statement {
        Statement::Query(query) => query_is_mutation(query),
        Statement::Explain {
            analyze,
            statement,
            ..
        } => *analyze && is_mutation_statement(statement),
        Statement::ExplainTable { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowViews { .. }
        | Statement::ShowCollation { .. }
        | Statement::Set(_)
        | Statement::Use(_)
        | Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. } => false,
        _ => true,
    }
}

fn query_is_mutation(query: &Query) -> bool {
    set_expr_is_mutation(&query.body)
}

fn set_expr_is_mutation(expr: &SetExpr) -> bool {
    match expr {
        SetExpr::Select(select) => select_has_into(select),
        SetExpr::Query(query) => query_is_mutation(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_mutation(left) || set_expr_is_mutation(right)
        }
        SetExpr::Insert(_) | SetExpr::Update(_) | SetExpr::Delete(_) | SetExpr::Merge(_) => true,
        SetExpr::Values(_) | SetExpr::Table(_) => false,
    }
}

fn select_has_into(select: &Select) -> bool {
    select.into.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cte_select_is_read_only() {
        let analysis = analyze(
            EngineKind::RelationalA,
            "WITH cte AS (SELECT * FROM users) SELECT * FROM cte",
        )
        .expect("should parse");

        assert!(!analysis.is_mutation);
    }

    #[test]
    fn stacked_statements_flag_mutation() {
        let analysis = analyze(
            EngineKind::RelationalA,
            "SELECT 1; UPDATE users SET name = 'x' WHERE id = 1;",
        )
        .expect("should parse");

        assert!(analysis.is_mutation);
    }

    #[test]
    fn explain_is_a_mutation_only_when_it_executes_one() {
        let plain = analyze(EngineKind::RelationalA, "EXPLAIN DELETE FROM users").expect("should parse");
        assert!(!plain.is_mutation);

        let analyzed = analyze(EngineKind::RelationalA, "EXPLAIN ANALYZE DELETE FROM users").expect("should parse");
        assert!(analyzed.is_mutation);
    }

    #[test]
    fn select_into_is_mutation() {
        let analysis = analyze(EngineKind::RelationalA, "SELECT * INTO new_table FROM old_table")
            .expect("should parse");

        assert!(analysis.is_mutation);
    }

    #[test]
    fn sqlite_insert_is_mutation() {
        let analysis = analyze(EngineKind::Embedded, "INSERT INTO t (a) VALUES (1)").expect("should parse");
        assert!(analysis.is_mutation);

        let analysis = analyze(EngineKind::Embedded, "SELECT a FROM t").expect("should parse");
        assert!(!analysis.is_mutation);
    }

    #[test]
    fn document_queries_classify_by_operation() {
        let read = analyze(EngineKind::Document, r#"users.find({"active": true})"#).expect("parse");
        assert!(!read.is_mutation);

        let write = analyze(EngineKind::Document, r#"users.deleteMany({})"#).expect("parse");
        assert!(write.is_mutation);

        let out = analyze(
            EngineKind::Document,
            r#"users.aggregate([{"$match": {}}, {"$out": "copy"}])"#,
        )
        .expect("parse");
        assert!(out.is_mutation);
    }

    #[test]
    fn unparseable_sql_is_an_error() {
        assert!(analyze(EngineKind::RelationalB, "SELEC nonsense FROM").is_err());
        assert!(analyze(EngineKind::RelationalA, "   ").is_err());
    }
}
