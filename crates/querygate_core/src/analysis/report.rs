//! Aggregation of per-statement findings into a `QueryAnalysis`.

use std::collections::BTreeMap;

use crate::models::{
    AnalysisWarning, AnalyzedOperation, DatabaseType, Priority, QueryAnalysis, Recommendation,
    RiskBreakdown, RiskLevel, StatementDetail, WarningLevel,
};

const PREVIEW_CHARS: usize = 80;

/// Accumulates operations, warnings and recommendations statement by statement.
#[derive(Debug)]
pub struct AnalysisBuilder {
    database_type: DatabaseType,
    operations: Vec<AnalyzedOperation>,
    warnings: Vec<AnalysisWarning>,
    recommendations: Vec<Recommendation>,
    statements: Vec<StatementDetail>,
    operation_counts: BTreeMap<String, usize>,
    breakdown: RiskBreakdown,
}

impl AnalysisBuilder {
    pub fn new(database_type: DatabaseType) -> Self {
        Self {
            database_type,
            operations: Vec::new(),
            warnings: Vec::new(),
            recommendations: Vec::new(),
            statements: Vec::new(),
            operation_counts: BTreeMap::new(),
            breakdown: RiskBreakdown::default(),
        }
    }

    /// Start a new statement; subsequent `record` calls attach to it.
    pub fn begin_statement(&mut self, line: usize, text: &str) {
        self.statements.push(StatementDetail {
            index: self.statements.len() + 1,
            line_number: line,
            preview: preview(text),
            operations: Vec::new(),
            risk: RiskLevel::Safe,
        });
    }

    /// Number of statements begun so far.
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// Record one operation occurrence.
    ///
    /// Operations are deduplicated by canonical name: the highest-risk
    /// occurrence supplies risk and impact, counts and lines accumulate.
    pub fn record(&mut self, op: AnalyzedOperation) {
        self.breakdown.record(op.risk);
        *self.operation_counts.entry(op.operation.clone()).or_insert(0) += 1;

        if let Some(statement) = self.statements.last_mut() {
            statement.risk = statement.risk.max(op.risk);
            if !statement.operations.contains(&op.operation) {
                statement.operations.push(op.operation.clone());
            }
        }

        match self.operations.iter_mut().find(|existing| existing.operation == op.operation) {
            Some(existing) => {
                let lines = existing.line_numbers.get_or_insert_with(Vec::new);
                lines.extend(op.line_numbers.iter().flatten().copied());
                let count = existing.occurrences() + 1;
                existing.count = Some(count);
                if op.risk > existing.risk {
                    existing.risk = op.risk;
                    existing.description = op.description;
                    existing.impact = op.impact;
                }
            }
            None => self.operations.push(op),
        }
    }

    /// Whether an operation was recorded anywhere in the submission.
    pub fn has_operation(&self, name: &str) -> bool {
        self.operation_counts.contains_key(name)
    }

    /// Highest risk recorded so far.
    pub fn current_risk(&self) -> RiskLevel {
        RiskLevel::max_of(self.operations.iter().map(|op| op.risk))
    }

    pub fn warn(&mut self, warning: AnalysisWarning) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    /// Add a recommendation unless one with the same action exists.
    pub fn recommend(&mut self, priority: Priority, action: &str, reason: &str) {
        if self.recommendations.iter().any(|r| r.action == action) {
            return;
        }
        self.recommendations.push(Recommendation {
            priority,
            action: action.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn finish(mut self) -> QueryAnalysis {
        let overall_risk = self.current_risk();

        if self.operations.is_empty() && self.warnings.is_empty() {
            self.warn(
                AnalysisWarning::new(WarningLevel::Warning, "No recognized database operations")
                    .with_suggestion("Review the submission manually"),
            );
        }

        match overall_risk {
            RiskLevel::Critical => self.recommend(
                Priority::High,
                "Take a backup of the affected data before executing",
                "Critical operations can irreversibly destroy data or structure",
            ),
            RiskLevel::High => self.recommend(
                Priority::Medium,
                "Test on a staging environment first",
                "High-risk operations affect many rows or change privileges",
            ),
            _ => {}
        }
        self.recommendations.sort_by(|a, b| b.priority.cmp(&a.priority));

        let statement_count = self.statements.len();
        let summary = summarize(&self.operations, overall_risk, statement_count);
        let multi = statement_count > 1;

        QueryAnalysis {
            database_type: self.database_type,
            operations: self.operations,
            overall_risk,
            warnings: self.warnings,
            recommendations: self.recommendations,
            summary,
            is_multi_statement: multi,
            statement_count,
            statement_details: multi.then_some(self.statements),
            operation_counts: multi.then_some(self.operation_counts),
            risk_breakdown: multi.then_some(self.breakdown),
        }
    }
}

fn summarize(operations: &[AnalyzedOperation], risk: RiskLevel, statements: usize) -> String {
    if operations.is_empty() {
        return "No recognized database operations".to_string();
    }
    let names: Vec<String> = operations
        .iter()
        .map(|op| match op.count {
            Some(count) if count > 1 => format!("{} x{count}", op.operation),
            _ => op.operation.clone(),
        })
        .collect();
    let scope = if statements > 1 { format!(" across {statements} statements") } else { String::new() };
    format!("{} risk: {}{scope}", capitalize(risk.as_str()), names.join(", "))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Collapse whitespace and cut to a short preview on a char boundary.
pub fn preview(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(PREVIEW_CHARS) {
        Some((end, _)) => format!("{}...", &collapsed[..end]),
        None => collapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Impact, OperationType};

    fn op(name: &str, risk: RiskLevel, line: usize) -> AnalyzedOperation {
        AnalyzedOperation {
            operation: name.to_string(),
            op_type: OperationType::Dml,
            risk,
            description: String::new(),
            impact: Impact { scope: "table".into(), reversible: None, estimated_effect: String::new() },
            count: None,
            line_numbers: Some(vec![line]),
        }
    }

    #[test]
    fn test_dedup_keeps_highest_risk_and_accumulates() {
        let mut builder = AnalysisBuilder::new(DatabaseType::Postgresql);
        builder.begin_statement(1, "DELETE FROM a WHERE id = 1");
        builder.record(op("DELETE", RiskLevel::Medium, 1));
        builder.begin_statement(2, "DELETE FROM b");
        builder.record(op("DELETE", RiskLevel::High, 2));
        let analysis = builder.finish();

        assert_eq!(analysis.operations.len(), 1);
        let delete = &analysis.operations[0];
        assert_eq!(delete.risk, RiskLevel::High);
        assert_eq!(delete.count, Some(2));
        assert_eq!(delete.line_numbers, Some(vec![1, 2]));
        assert_eq!(analysis.overall_risk, RiskLevel::High);
        assert!(analysis.is_multi_statement);
        assert_eq!(analysis.operation_counts.unwrap()["DELETE"], 2);
        let breakdown = analysis.risk_breakdown.unwrap();
        assert_eq!(breakdown.medium, 1);
        assert_eq!(breakdown.high, 1);
    }

    #[test]
    fn test_single_statement_omits_multi_fields() {
        let mut builder = AnalysisBuilder::new(DatabaseType::Postgresql);
        builder.begin_statement(1, "DROP TABLE users");
        builder.record(op("DROP_TABLE", RiskLevel::Critical, 1));
        let analysis = builder.finish();

        assert!(!analysis.is_multi_statement);
        assert!(analysis.statement_details.is_none());
        assert!(analysis.risk_breakdown.is_none());
        assert_eq!(analysis.summary, "Critical risk: DROP_TABLE");
        assert_eq!(analysis.recommendations[0].priority, Priority::High);
    }

    #[test]
    fn test_empty_builder_warns() {
        let analysis = AnalysisBuilder::new(DatabaseType::Mongodb).finish();
        assert_eq!(analysis.overall_risk, RiskLevel::Safe);
        assert_eq!(analysis.warnings.len(), 1);
        assert_eq!(analysis.summary, "No recognized database operations");
    }

    #[test]
    fn test_recommendations_are_unique_and_sorted() {
        let mut builder = AnalysisBuilder::new(DatabaseType::Postgresql);
        builder.recommend(Priority::Low, "Add a LIMIT", "reason");
        builder.recommend(Priority::High, "Add a WHERE clause", "reason");
        builder.recommend(Priority::High, "Add a WHERE clause", "other reason");
        let analysis = builder.finish();
        assert_eq!(analysis.recommendations.len(), 2);
        assert_eq!(analysis.recommendations[0].action, "Add a WHERE clause");
    }

    #[test]
    fn test_preview_is_bounded() {
        let long = "SELECT ".repeat(40);
        let short = preview(&long);
        assert!(short.ends_with("..."));
        assert_eq!(short.chars().count(), PREVIEW_CHARS + 3);
        assert_eq!(preview("SELECT\n   1"), "SELECT 1");
    }
}
