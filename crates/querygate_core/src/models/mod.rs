//! Data models for querygate.
//!
//! This module contains all core data structures:
//! - `analysis` - DatabaseType, RiskLevel, QueryAnalysis and its parts
//! - `connection` - InstanceConnectionInfo, PoolStatus
//! - `execution` - ExecutionRequest, ExecutionResult, ExecutionHandle

pub mod analysis;
pub mod connection;
pub mod execution;

pub use analysis::{
    AnalysisWarning, AnalyzedOperation, DatabaseType, Impact, OperationType, Priority,
    QueryAnalysis, Recommendation, RiskBreakdown, RiskLevel, StatementDetail, WarningLevel,
};
pub use connection::{InstanceConnectionInfo, InstanceConnectionInfoBuilder, PoolStatus};
pub use execution::{
    ErrorKind, ExecutionError, ExecutionHandle, ExecutionOutput, ExecutionRequest,
    ExecutionResult, ExecutionState, ExecutionStatus, SubmissionType,
};
