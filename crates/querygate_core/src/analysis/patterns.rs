//! Declarative operation pattern tables.
//!
//! Each analyzer owns an ordered `&[OperationPattern]`. A pattern pairs a
//! matcher with the canonical operation it detects and that operation's risk.
//! Adding an operation means adding a row, not touching control flow.

use regex::Regex;

use crate::models::{AnalyzedOperation, Impact, OperationType, RiskLevel};

/// How a pattern recognizes its operation.
#[derive(Debug)]
pub enum Matcher {
    /// Case-insensitive regex applied to statement text
    Regex(Regex),
    /// Exact MongoDB method names
    Method(&'static [&'static str]),
}

/// One row of a pattern table.
#[derive(Debug)]
pub struct OperationPattern {
    /// Canonical operation name
    pub operation: &'static str,
    /// Recognizer
    pub matcher: Matcher,
    /// Operation category
    pub op_type: OperationType,
    /// Risk when the operation is unbounded (no WHERE / empty filter)
    pub risk: RiskLevel,
    /// Risk when a WHERE clause or non-empty filter bounds the operation
    pub bounded_risk: Option<RiskLevel>,
    /// Description shown to approvers
    pub description: &'static str,
    /// Impact scope
    pub scope: &'static str,
    /// Whether the effect can be undone
    pub reversible: Option<bool>,
    /// Estimated effect
    pub effect: &'static str,
}

impl OperationPattern {
    /// Regex pattern, compiled case-insensitive with `.` matching newlines.
    pub fn regex(
        operation: &'static str,
        pattern: &str,
        op_type: OperationType,
        risk: RiskLevel,
    ) -> Self {
        let regex = Regex::new(&format!("(?is){pattern}"))
            .unwrap_or_else(|e| panic!("invalid pattern for {operation}: {e}"));
        Self::with_matcher(operation, Matcher::Regex(regex), op_type, risk)
    }

    /// MongoDB method pattern.
    pub fn method(
        operation: &'static str,
        methods: &'static [&'static str],
        op_type: OperationType,
        risk: RiskLevel,
    ) -> Self {
        Self::with_matcher(operation, Matcher::Method(methods), op_type, risk)
    }

    fn with_matcher(
        operation: &'static str,
        matcher: Matcher,
        op_type: OperationType,
        risk: RiskLevel,
    ) -> Self {
        Self {
            operation,
            matcher,
            op_type,
            risk,
            bounded_risk: None,
            description: "",
            scope: "",
            reversible: None,
            effect: "",
        }
    }

    /// Use a different risk when the operation is bounded by a WHERE/filter.
    pub fn bounded(mut self, risk: RiskLevel) -> Self {
        self.bounded_risk = Some(risk);
        self
    }

    /// Attach approver-facing description and impact.
    pub fn describe(
        mut self,
        description: &'static str,
        scope: &'static str,
        reversible: Option<bool>,
        effect: &'static str,
    ) -> Self {
        self.description = description;
        self.scope = scope;
        self.reversible = reversible;
        self.effect = effect;
        self
    }

    /// Whether the risk of this operation depends on a WHERE/filter.
    pub fn is_boundable(&self) -> bool {
        self.bounded_risk.is_some()
    }

    /// Risk for a statement that is (or is not) bounded.
    pub fn risk_for(&self, bounded: bool) -> RiskLevel {
        match (bounded, self.bounded_risk) {
            (true, Some(risk)) => risk,
            _ => self.risk,
        }
    }

    /// Regex match end within `text`, for regex patterns.
    pub fn find_regex(&self, text: &str) -> Option<usize> {
        match &self.matcher {
            Matcher::Regex(regex) => regex.find(text).map(|m| m.end()),
            Matcher::Method(_) => None,
        }
    }

    /// Check whether this pattern recognizes a MongoDB method name.
    pub fn matches_method(&self, method: &str) -> bool {
        match &self.matcher {
            Matcher::Method(methods) => methods.contains(&method),
            Matcher::Regex(_) => false,
        }
    }

    /// Build the analyzed operation for one occurrence.
    pub fn to_operation(&self, bounded: bool, line: usize) -> AnalyzedOperation {
        AnalyzedOperation {
            operation: self.operation.to_string(),
            op_type: self.op_type,
            risk: self.risk_for(bounded),
            description: self.description.to_string(),
            impact: Impact {
                scope: self.scope.to_string(),
                reversible: self.reversible,
                estimated_effect: self.effect.to_string(),
            },
            count: None,
            line_numbers: Some(vec![line]),
        }
    }
}

/// Pick the winning pattern among several matches: highest risk first,
/// then earliest table position (tables list specific patterns before generic ones).
pub fn strongest<'a>(
    matches: impl IntoIterator<Item = (&'a OperationPattern, bool)>,
) -> Option<(&'a OperationPattern, bool)> {
    let mut best: Option<(&OperationPattern, bool)> = None;
    for (pattern, bounded) in matches {
        let replace = match best {
            None => true,
            Some((current, current_bounded)) => {
                pattern.risk_for(bounded) > current.risk_for(current_bounded)
            }
        };
        if replace {
            best = Some((pattern, bounded));
        }
    }
    best
}
