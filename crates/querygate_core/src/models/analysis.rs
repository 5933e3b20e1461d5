//! Query risk analysis models.
//!
//! Everything here is a plain serde value object. A `QueryAnalysis` is built
//! once by an analyzer and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::GateError;

/// Target database engine of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum DatabaseType {
    /// PostgreSQL (alias `postgres`)
    Postgresql,
    /// MongoDB (alias `mongo`)
    Mongodb,
}

impl DatabaseType {
    /// Convert to the canonical string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgresql => "postgresql",
            Self::Mongodb => "mongodb",
        }
    }

    /// Parse a database type, case-insensitively, accepting the short aliases.
    ///
    /// An unknown type is a caller configuration error.
    pub fn parse(s: &str) -> Result<Self, GateError> {
        match s.trim().to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Self::Postgresql),
            "mongodb" | "mongo" => Ok(Self::Mongodb),
            other => Err(GateError::config(format!("Unsupported database type: {other:?}"))),
        }
    }
}

impl FromStr for DatabaseType {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DatabaseType {
    type Error = GateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered severity of a detected operation.
///
/// The derive order is the severity order: `Safe < Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only or transaction control
    #[default]
    Safe,
    /// Additive changes
    Low,
    /// Bounded destructive changes
    Medium,
    /// Unbounded or privilege-changing operations
    High,
    /// Irreversible loss of data or structure
    Critical,
}

impl RiskLevel {
    /// All levels in ascending order.
    pub const ALL: [RiskLevel; 5] =
        [Self::Safe, Self::Low, Self::Medium, Self::High, Self::Critical];

    /// Numeric score, 0 (safe) through 4 (critical).
    pub fn score(&self) -> u8 {
        *self as u8
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Highest level in an iterator, `Safe` when empty.
    pub fn max_of(levels: impl IntoIterator<Item = RiskLevel>) -> RiskLevel {
        levels.into_iter().max().unwrap_or_default()
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad category of a database operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Schema definition (CREATE, DROP, ALTER)
    #[serde(rename = "DDL")]
    Ddl,
    /// Data modification (INSERT, UPDATE, DELETE)
    #[serde(rename = "DML")]
    Dml,
    /// Reads (SELECT, find)
    #[serde(rename = "read")]
    Read,
    /// Privileges, roles, maintenance, raw commands
    #[serde(rename = "admin")]
    Admin,
    /// Transaction control
    #[serde(rename = "transaction")]
    Transaction,
}

/// Estimated blast radius of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Impact {
    /// What the operation touches (e.g. "table", "all rows", "database")
    pub scope: String,
    /// Whether the effect can be undone; `None` when it depends on context
    pub reversible: Option<bool>,
    /// Short description of the effect
    pub estimated_effect: String,
}

/// One recognized database action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedOperation {
    /// Canonical operation name, e.g. `DROP_TABLE`
    pub operation: String,
    /// Operation category
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Assigned risk
    pub risk: RiskLevel,
    /// Human-readable description
    pub description: String,
    /// Estimated impact
    pub impact: Impact,
    /// Number of occurrences, present when greater than one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// 1-based source lines where the operation occurs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_numbers: Option<Vec<usize>>,
}

impl AnalyzedOperation {
    /// Number of occurrences (at least one).
    pub fn occurrences(&self) -> usize {
        self.count.unwrap_or(1)
    }
}

/// Severity of an analysis warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    /// Informational
    Info,
    /// Worth a second look
    Warning,
    /// Likely to destroy data
    Critical,
}

/// A warning about a specific dangerous pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisWarning {
    /// Severity
    pub level: WarningLevel,
    /// What was detected
    pub message: String,
    /// How to make it safer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// 1-based line of the offending statement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
}

impl AnalysisWarning {
    /// Create a warning without suggestion or line.
    pub fn new(level: WarningLevel, message: impl Into<String>) -> Self {
        Self { level, message: message.into(), suggestion: None, line_number: None }
    }

    /// Attach a suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach a line number.
    pub fn at_line(mut self, line: usize) -> Self {
        self.line_number = Some(line);
        self
    }
}

/// Priority of a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Nice to have
    Low,
    /// Should do
    Medium,
    /// Do before approving
    High,
}

/// Advisory action for approvers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Priority
    pub priority: Priority,
    /// What to do
    pub action: String,
    /// Why
    pub reason: String,
}

/// Per-statement detail for multi-statement submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementDetail {
    /// 1-based statement index
    pub index: usize,
    /// 1-based line where the statement starts
    pub line_number: usize,
    /// Leading text of the statement
    pub preview: String,
    /// Operations recognized in this statement
    pub operations: Vec<String>,
    /// Highest risk in this statement
    pub risk: RiskLevel,
}

/// Number of operation occurrences per risk level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskBreakdown {
    /// Safe operations
    pub safe: usize,
    /// Low-risk operations
    pub low: usize,
    /// Medium-risk operations
    pub medium: usize,
    /// High-risk operations
    pub high: usize,
    /// Critical operations
    pub critical: usize,
}

impl RiskBreakdown {
    /// Count one occurrence at `risk`.
    pub fn record(&mut self, risk: RiskLevel) {
        match risk {
            RiskLevel::Safe => self.safe += 1,
            RiskLevel::Low => self.low += 1,
            RiskLevel::Medium => self.medium += 1,
            RiskLevel::High => self.high += 1,
            RiskLevel::Critical => self.critical += 1,
        }
    }

    /// Occurrences at `risk`.
    pub fn get(&self, risk: RiskLevel) -> usize {
        match risk {
            RiskLevel::Safe => self.safe,
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
            RiskLevel::Critical => self.critical,
        }
    }

    /// Total occurrences.
    pub fn total(&self) -> usize {
        RiskLevel::ALL.iter().map(|r| self.get(*r)).sum()
    }
}

/// Structured risk metadata for a query or script submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnalysis {
    /// Analyzed dialect
    pub database_type: DatabaseType,
    /// Recognized operations in order of first appearance
    pub operations: Vec<AnalyzedOperation>,
    /// Maximum risk over `operations`, `Safe` when empty
    pub overall_risk: RiskLevel,
    /// Pattern-specific warnings
    pub warnings: Vec<AnalysisWarning>,
    /// Advisory actions
    pub recommendations: Vec<Recommendation>,
    /// One-line synthesis
    pub summary: String,
    /// Whether more than one statement was found
    pub is_multi_statement: bool,
    /// Number of statements found
    pub statement_count: usize,
    /// Per-statement details (multi-statement only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_details: Option<Vec<StatementDetail>>,
    /// Occurrences per canonical operation (multi-statement only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_counts: Option<BTreeMap<String, usize>>,
    /// Occurrences per risk level (multi-statement only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_breakdown: Option<RiskBreakdown>,
}

impl QueryAnalysis {
    /// Analysis for input that could not be analyzed: safe, no operations,
    /// a single warning describing why.
    pub fn degraded(database_type: DatabaseType, reason: impl Into<String>) -> Self {
        Self {
            database_type,
            operations: Vec::new(),
            overall_risk: RiskLevel::Safe,
            warnings: vec![AnalysisWarning::new(WarningLevel::Warning, reason)
                .with_suggestion("Review the submission manually")],
            recommendations: Vec::new(),
            summary: "No recognized database operations".to_string(),
            is_multi_statement: false,
            statement_count: 0,
            statement_details: None,
            operation_counts: None,
            risk_breakdown: None,
        }
    }

    /// Find an operation by canonical name.
    pub fn operation(&self, name: &str) -> Option<&AnalyzedOperation> {
        self.operations.iter().find(|op| op.operation == name)
    }

    /// Check whether an operation was recognized.
    pub fn has_operation(&self, name: &str) -> bool {
        self.operation(name).is_some()
    }

    /// Check whether nothing risky was recognized.
    pub fn is_safe(&self) -> bool {
        self.overall_risk == RiskLevel::Safe
    }

    /// Check whether approvers should look twice.
    pub fn requires_attention(&self) -> bool {
        self.overall_risk >= RiskLevel::High
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_aliases() {
        assert_eq!(DatabaseType::parse("postgres").unwrap(), DatabaseType::Postgresql);
        assert_eq!(DatabaseType::parse("PostgreSQL").unwrap(), DatabaseType::Postgresql);
        assert_eq!(DatabaseType::parse(" MONGO ").unwrap(), DatabaseType::Mongodb);
        assert_eq!("mongodb".parse::<DatabaseType>().unwrap(), DatabaseType::Mongodb);
        assert!(DatabaseType::parse("oracle").unwrap_err().is_config());
    }

    #[test]
    fn test_database_type_serde() {
        let parsed: DatabaseType = serde_json::from_str("\"Postgres\"").unwrap();
        assert_eq!(parsed, DatabaseType::Postgresql);
        assert_eq!(serde_json::to_string(&DatabaseType::Mongodb).unwrap(), "\"mongodb\"");
        assert!(serde_json::from_str::<DatabaseType>("\"mysql\"").is_err());
    }

    #[test]
    fn test_risk_ordering() {
        assert!(RiskLevel::Safe < RiskLevel::Low);
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(RiskLevel::Critical.score(), 4);
        assert_eq!(RiskLevel::max_of([]), RiskLevel::Safe);
        assert_eq!(RiskLevel::max_of([RiskLevel::Low, RiskLevel::High]), RiskLevel::High);
    }

    #[test]
    fn test_degraded_analysis_shape() {
        let analysis = QueryAnalysis::degraded(DatabaseType::Postgresql, "Query is empty");
        assert!(analysis.operations.is_empty());
        assert_eq!(analysis.overall_risk, RiskLevel::Safe);
        assert_eq!(analysis.warnings.len(), 1);
        assert!(analysis.statement_details.is_none());
    }

    #[test]
    fn test_analysis_json_field_names() {
        let analysis = QueryAnalysis::degraded(DatabaseType::Mongodb, "Query is empty");
        let json = serde_json::to_value(&analysis).unwrap();
        assert_eq!(json["databaseType"], "mongodb");
        assert_eq!(json["overallRisk"], "safe");
        assert!(json.get("statementDetails").is_none());
    }

    #[test]
    fn test_risk_breakdown_totals() {
        let mut breakdown = RiskBreakdown::default();
        breakdown.record(RiskLevel::Critical);
        breakdown.record(RiskLevel::Safe);
        breakdown.record(RiskLevel::Safe);
        assert_eq!(breakdown.get(RiskLevel::Safe), 2);
        assert_eq!(breakdown.total(), 3);
    }
}
