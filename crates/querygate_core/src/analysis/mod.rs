//! Static query risk analysis.
//!
//! Analysis is a pure function of `(query text, database type)`: no I/O, no
//! shared mutable state. `analyze` never fails; malformed input degrades to a
//! safe analysis carrying a warning. The only fallible entry point is the
//! factory, which rejects unsupported database type names.

mod mongo;
mod patterns;
mod postgres;
mod report;
mod splitter;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub use mongo::MongoAnalyzer;
pub use patterns::{Matcher, OperationPattern};
pub use postgres::PostgresAnalyzer;
pub use splitter::{split_statements, SplitResult, SqlStatement, Unterminated};

use crate::error::GateError;
use crate::models::{AnalysisWarning, DatabaseType, QueryAnalysis, WarningLevel};
use report::AnalysisBuilder;

/// Capability shared by the per-dialect analyzers.
pub trait QueryAnalyzer: Send + Sync {
    /// Dialect this analyzer understands.
    fn database_type(&self) -> DatabaseType;

    /// Analyze a submission. Must not fail for any input.
    fn analyze(&self, query: &str) -> QueryAnalysis;
}

static POSTGRES: PostgresAnalyzer = PostgresAnalyzer;
static MONGO: MongoAnalyzer = MongoAnalyzer;

/// Analyzer for a database type.
pub fn analyzer_for(database_type: DatabaseType) -> &'static dyn QueryAnalyzer {
    match database_type {
        DatabaseType::Postgresql => &POSTGRES,
        DatabaseType::Mongodb => &MONGO,
    }
}

/// Analyzer for a database type name (`postgresql`, `postgres`, `mongodb`,
/// `mongo`; case-insensitive).
pub fn create_analyzer(database_type: &str) -> Result<&'static dyn QueryAnalyzer, GateError> {
    DatabaseType::parse(database_type).map(analyzer_for)
}

/// Analyze `query` for `database_type`.
///
/// A panic inside an analyzer is contained and reported as a degraded analysis.
pub fn analyze(query: &str, database_type: DatabaseType) -> QueryAnalysis {
    let analyzer = analyzer_for(database_type);
    match catch_unwind(AssertUnwindSafe(|| analyzer.analyze(query))) {
        Ok(analysis) => analysis,
        Err(panic) => {
            let reason = panic_reason(panic.as_ref());
            tracing::error!(database_type = %database_type, %reason, "Query analysis panicked");
            QueryAnalysis::degraded(database_type, format!("Analysis failed: {reason}"))
        }
    }
}

/// Analyze one statement. A panic degrades only that statement: it is
/// reported as a warning at its line and the remaining statements still count.
fn contain_statement(builder: &mut AnalysisBuilder, line: usize, analyze: impl FnOnce(&mut AnalysisBuilder)) {
    let Err(panic) = catch_unwind(AssertUnwindSafe(|| analyze(&mut *builder))) else {
        return;
    };
    let reason = panic_reason(panic.as_ref());
    tracing::error!(line, %reason, "Statement analysis panicked");
    builder.warn(
        AnalysisWarning::new(WarningLevel::Warning, format!("Statement could not be analyzed: {reason}"))
            .with_suggestion("Review this statement manually")
            .at_line(line),
    );
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown error".to_string())
}

/// Analyze `query` for a database type name.
///
/// Fails only when the type name is unsupported.
pub fn analyze_query(query: &str, database_type: &str) -> Result<QueryAnalysis, GateError> {
    let database_type = DatabaseType::parse(database_type)?;
    let analysis = analyze(query, database_type);
    tracing::debug!(
        database_type = %database_type,
        overall_risk = %analysis.overall_risk,
        operations = analysis.operations.len(),
        statements = analysis.statement_count,
        "Query analyzed"
    );
    Ok(analysis)
}
