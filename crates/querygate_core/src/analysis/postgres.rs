//! PostgreSQL analyzer.
//!
//! Each statement is matched against `POSTGRES_PATTERNS`; the highest-risk
//! match wins. Keyword checks run on a copy of the statement with literals
//! and comments blanked out, except the WHERE check which is deliberately
//! lexical over the raw statement text.

use std::sync::LazyLock;

use regex::Regex;

use super::patterns::{strongest, OperationPattern};
use super::report::AnalysisBuilder;
use super::splitter::{mask_literals, split_statements, SqlStatement};
use super::{contain_statement, QueryAnalyzer};
use crate::models::{
    AnalysisWarning, DatabaseType, OperationType, Priority, QueryAnalysis, RiskLevel, WarningLevel,
};

use OperationType::{Admin, Ddl, Dml, Read, Transaction};
use RiskLevel::{Critical, High, Low, Medium, Safe};

static POSTGRES_PATTERNS: LazyLock<Vec<OperationPattern>> = LazyLock::new(|| {
    vec![
        OperationPattern::regex("DROP_DATABASE", r"^DROP\s+DATABASE\b", Ddl, Critical)
            .describe("Drops an entire database", "database", Some(false), "All schemas and data in the database are deleted"),
        OperationPattern::regex("DROP_SCHEMA", r"^DROP\s+SCHEMA\b", Ddl, Critical)
            .describe("Drops a schema", "schema", Some(false), "All objects in the schema are deleted"),
        OperationPattern::regex("DROP_TABLE", r"^DROP\s+(?:FOREIGN\s+)?TABLE\b", Ddl, Critical)
            .describe("Drops a table", "table", Some(false), "Table structure and all rows are deleted"),
        OperationPattern::regex("DROP_ROLE", r"^DROP\s+(?:ROLE|USER|GROUP)\b", Admin, Critical)
            .describe("Drops a role", "role", Some(false), "Login and privileges are removed"),
        OperationPattern::regex("DROP_INDEX", r"^DROP\s+INDEX\b", Ddl, High)
            .describe("Drops an index", "index", Some(true), "Queries relying on the index slow down"),
        OperationPattern::regex("DROP_VIEW", r"^DROP\s+(?:MATERIALIZED\s+)?VIEW\b", Ddl, High)
            .describe("Drops a view", "view", Some(true), "Dependent queries stop working"),
        OperationPattern::regex("DROP_FUNCTION", r"^DROP\s+(?:FUNCTION|PROCEDURE|TRIGGER)\b", Ddl, High)
            .describe("Drops a routine", "routine", Some(true), "Callers of the routine fail"),
        OperationPattern::regex("DROP", r"^DROP\b", Ddl, High)
            .describe("Drops a database object", "object", Some(false), "The object is removed"),
        OperationPattern::regex("TRUNCATE", r"^TRUNCATE\b", Dml, Critical)
            .describe("Removes all rows from a table", "all rows", Some(false), "Every row is deleted without row-level triggers"),
        OperationPattern::regex("DELETE", r"^DELETE\s+FROM\b", Dml, High)
            .bounded(Medium)
            .describe("Deletes rows", "rows matching WHERE", Some(false), "Matching rows are deleted"),
        OperationPattern::regex("UPDATE", r"^UPDATE\b", Dml, High)
            .bounded(Medium)
            .describe("Updates rows", "rows matching WHERE", Some(false), "Matching rows are modified"),
        OperationPattern::regex("MERGE", r"^MERGE\s+INTO\b", Dml, Medium)
            .describe("Merges rows into a table", "rows", Some(false), "Rows are inserted, updated, or deleted"),
        OperationPattern::regex("ALTER_TABLE_DROP_COLUMN", r"^ALTER\s+TABLE\b.*\bDROP\s+COLUMN\b", Ddl, High)
            .describe("Drops a column", "column", Some(false), "Column data is deleted"),
        OperationPattern::regex(
            "ALTER_TABLE_ALTER_COLUMN_TYPE",
            r"^ALTER\s+TABLE\b.*\bALTER\s+(?:COLUMN\s+)?\S+\s+(?:SET\s+DATA\s+)?TYPE\b",
            Ddl,
            High,
        )
        .describe("Changes a column type", "column", None, "Table may be rewritten under an exclusive lock"),
        OperationPattern::regex("ALTER_TABLE_RENAME", r"^ALTER\s+TABLE\b.*\bRENAME\b", Ddl, Medium)
            .describe("Renames a table or column", "table", Some(true), "Queries using the old name fail"),
        OperationPattern::regex("ALTER_TABLE_ADD_COLUMN", r"^ALTER\s+TABLE\b.*\bADD\s+(?:COLUMN\b|\w)", Ddl, Medium)
            .describe("Adds a column or constraint", "table", Some(true), "Table structure changes"),
        OperationPattern::regex("ALTER_TABLE", r"^ALTER\s+TABLE\b", Ddl, Medium)
            .describe("Alters a table", "table", None, "Table structure changes"),
        OperationPattern::regex("ALTER_ROLE", r"^ALTER\s+(?:ROLE|USER|GROUP)\b", Admin, High)
            .describe("Alters a role", "role", Some(true), "Login or privileges change"),
        OperationPattern::regex("ALTER", r"^ALTER\b", Ddl, Medium)
            .describe("Alters a database object", "object", None, "Object definition changes"),
        OperationPattern::regex("GRANT", r"^GRANT\b", Admin, High)
            .describe("Grants privileges", "privileges", Some(true), "Access is widened"),
        OperationPattern::regex("REVOKE", r"^REVOKE\b", Admin, High)
            .describe("Revokes privileges", "privileges", Some(true), "Access is narrowed; dependent jobs may fail"),
        OperationPattern::regex("CREATE_ROLE", r"^CREATE\s+(?:ROLE|USER|GROUP)\b", Admin, Medium)
            .describe("Creates a role", "role", Some(true), "A new login or group exists"),
        OperationPattern::regex("CREATE_INDEX", r"^CREATE\s+(?:UNIQUE\s+)?INDEX\b", Ddl, Low)
            .describe("Creates an index", "index", Some(true), "Writes may block while the index builds"),
        OperationPattern::regex(
            "CREATE_TABLE",
            r"^CREATE\s+(?:(?:GLOBAL|LOCAL)\s+)?(?:(?:TEMP|TEMPORARY|UNLOGGED)\s+)?TABLE\b",
            Ddl,
            Low,
        )
        .describe("Creates a table", "table", Some(true), "A new table exists"),
        OperationPattern::regex("CREATE", r"^CREATE\b", Ddl, Low)
            .describe("Creates a database object", "object", Some(true), "A new object exists"),
        OperationPattern::regex("INSERT", r"^INSERT\s+INTO\b", Dml, Low)
            .describe("Inserts rows", "rows", Some(true), "New rows are added"),
        OperationPattern::regex("COPY", r"^COPY\b", Dml, Medium)
            .describe("Bulk copies data", "table", None, "Rows are bulk loaded or exported"),
        OperationPattern::regex("VACUUM", r"^VACUUM\b", Admin, Medium)
            .describe("Vacuums tables", "table", Some(true), "I/O heavy; FULL takes an exclusive lock"),
        OperationPattern::regex("REINDEX", r"^REINDEX\b", Admin, Medium)
            .describe("Rebuilds indexes", "index", Some(true), "Locks the table while rebuilding"),
        OperationPattern::regex("CLUSTER", r"^CLUSTER\b", Admin, Medium)
            .describe("Reorders a table by an index", "table", Some(true), "Exclusive lock while rewriting"),
        OperationPattern::regex("SELECT", r"^(?:SELECT|TABLE|VALUES)\b", Read, Safe)
            .describe("Reads rows", "rows", None, "No data is modified"),
        OperationPattern::regex("EXPLAIN", r"^EXPLAIN\b", Read, Safe)
            .describe("Shows a query plan", "none", None, "No data is modified"),
        OperationPattern::regex("SHOW", r"^SHOW\b", Read, Safe)
            .describe("Shows a setting", "none", None, "No data is modified"),
        OperationPattern::regex("SET", r"^(?:SET|RESET)\b", Admin, Safe)
            .describe("Changes a session setting", "session", Some(true), "Affects only this session"),
        OperationPattern::regex("BEGIN", r"^(?:BEGIN|START\s+TRANSACTION)\b", Transaction, Safe)
            .describe("Starts a transaction", "session", None, "Subsequent statements run atomically"),
        OperationPattern::regex("COMMIT", r"^(?:COMMIT|END)\b", Transaction, Safe)
            .describe("Commits a transaction", "session", None, "Pending changes become permanent"),
        OperationPattern::regex("ROLLBACK", r"^(?:ROLLBACK|ABORT)\b", Transaction, Safe)
            .describe("Rolls back a transaction", "session", None, "Pending changes are discarded"),
        OperationPattern::regex("SAVEPOINT", r"^(?:SAVEPOINT|RELEASE)\b", Transaction, Safe)
            .describe("Manages a savepoint", "session", None, "Marks a partial rollback point"),
    ]
});

static WHERE_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").expect("where regex is valid"));
static CASCADE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCASCADE\b").expect("cascade regex is valid"));
static SELECT_STAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^SELECT\s+\*").expect("select star regex is valid"));
static ROW_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:LIMIT|FETCH\s+(?:FIRST|NEXT))\b").expect("limit regex is valid")
});
static EXPLAIN_ANALYZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^EXPLAIN\s+(?:\([^)]*\bANALYZE\b[^)]*\)|ANALYZE\b(?:\s+VERBOSE\b)?)\s*")
        .expect("explain regex is valid")
});
static MAIN_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:SELECT|INSERT|UPDATE|DELETE|MERGE|VALUES|TABLE)\b")
        .expect("verb regex is valid")
});

/// Pattern-based PostgreSQL analyzer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAnalyzer;

impl QueryAnalyzer for PostgresAnalyzer {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgresql
    }

    fn analyze(&self, query: &str) -> QueryAnalysis {
        if query.trim().is_empty() {
            return QueryAnalysis::degraded(DatabaseType::Postgresql, "Query is empty");
        }

        let split = split_statements(query);
        let mut builder = AnalysisBuilder::new(DatabaseType::Postgresql);

        for statement in &split.statements {
            contain_statement(&mut builder, statement.line, |builder| analyze_statement(builder, statement));
        }

        if let Some(open) = split.unterminated {
            builder.warn(
                AnalysisWarning::new(
                    WarningLevel::Warning,
                    format!("Unterminated {} at end of input", open.describe()),
                )
                .with_suggestion("Check quoting; statements after this point may be misclassified"),
            );
        }

        if builder.statement_count() > 1
            && builder.current_risk() >= Medium
            && !builder.has_operation("BEGIN")
        {
            builder.warn(
                AnalysisWarning::new(
                    WarningLevel::Warning,
                    "Multiple modifying statements without an explicit transaction",
                )
                .with_suggestion("Wrap the statements in BEGIN ... COMMIT"),
            );
            builder.recommend(
                Priority::Medium,
                "Run the statements inside a transaction",
                "A failure part-way through leaves earlier statements applied",
            );
        }

        builder.finish()
    }
}

fn analyze_statement(builder: &mut AnalysisBuilder, statement: &SqlStatement) {
    builder.begin_statement(statement.line, &statement.text);

    let masked = mask_literals(&statement.text);
    let offset = main_statement_offset(&masked);
    let main_masked = &masked[offset..];
    let main_raw = &statement.text[offset..];

    let matches = POSTGRES_PATTERNS.iter().filter_map(|pattern| {
        let end = pattern.find_regex(main_masked)?;
        let bounded = pattern.is_boundable() && WHERE_CLAUSE.is_match(&main_raw[end..]);
        Some((pattern, bounded))
    });

    let Some((pattern, bounded)) = strongest(matches) else {
        builder.warn(
            AnalysisWarning::new(WarningLevel::Info, "Unrecognized statement")
                .with_suggestion("Review this statement manually")
                .at_line(statement.line),
        );
        return;
    };

    let mut op = pattern.to_operation(bounded, statement.line);
    if pattern.is_boundable() && !bounded {
        op.impact.scope = "all rows".to_string();
        builder.warn(
            AnalysisWarning::new(
                WarningLevel::Critical,
                format!("{} without WHERE clause affects every row in the table", pattern.operation),
            )
            .with_suggestion("Add a WHERE clause to limit the affected rows")
            .at_line(statement.line),
        );
        builder.recommend(
            Priority::High,
            "Add a WHERE clause to DELETE and UPDATE statements",
            "Unbounded modifications touch every row",
        );
    }

    if matches!(pattern.op_type, Ddl | Dml) && CASCADE.is_match(main_masked) {
        builder.warn(
            AnalysisWarning::new(
                WarningLevel::Warning,
                format!("{} with CASCADE also affects dependent objects", pattern.operation),
            )
            .with_suggestion("List dependent objects first and drop them explicitly")
            .at_line(statement.line),
        );
    }

    if SELECT_STAR.is_match(main_masked) && !ROW_LIMIT.is_match(main_masked) {
        builder.warn(
            AnalysisWarning::new(WarningLevel::Info, "SELECT * without LIMIT may return a large result")
                .with_suggestion("Select only the needed columns and add a LIMIT")
                .at_line(statement.line),
        );
        builder.recommend(
            Priority::Low,
            "Add a LIMIT or select only the needed columns",
            "Large results are truncated and slow to review",
        );
    }

    builder.record(op);
}

/// Byte offset of the statement that determines the operation: the body
/// after a `WITH` clause list, or the statement under `EXPLAIN ANALYZE`.
fn main_statement_offset(masked: &str) -> usize {
    if let Some(m) = EXPLAIN_ANALYZE.find(masked) {
        return m.end();
    }

    let head = masked.trim_start();
    let is_with = head.get(..4).is_some_and(|kw| kw.eq_ignore_ascii_case("WITH"))
        && !head[4..].starts_with(is_word_char);
    if !is_with {
        return 0;
    }

    let start = masked.len() - head.len() + 4;
    let mut depth = 0usize;
    // The char before `start` is the `H` of `WITH`.
    let mut after_word = true;
    for (n, c) in masked[start..].char_indices() {
        let i = start + n;
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 && !after_word && MAIN_VERB.is_match(&masked[i..]) => return i,
            _ => {}
        }
        after_word = is_word_char(c);
    }
    0
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
