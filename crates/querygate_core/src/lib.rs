//! Query risk analysis and sandboxed execution for approved database changes.
//!
//! This crate is the gate between an approval workflow and production
//! databases:
//!
//! - **analysis**: Static risk classification of PostgreSQL and MongoDB submissions
//! - **engine**: Execution of approved queries and scripts under hard timeouts
//! - **services**: Connection pools, query and script executors, output bounds
//! - **mongo_shell**: Lexer and parser for `db.<collection>.<method>(...)` commands
//! - **config**: Layered engine configuration
//! - **error**: Error handling with driver-specific details
//! - **logging**: Per-execution spans and optional subscriber setup

pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod mongo_shell;
pub mod services;


pub use analysis::{analyze, analyze_query, create_analyzer, QueryAnalyzer};
pub use config::{EngineConfig, ExecutionLimits, LoggingSettings, PoolSettings, SandboxConfig};
pub use engine::ExecutionEngine;
pub use error::GateError;
pub use models::{
    AnalysisWarning, AnalyzedOperation, DatabaseType, ErrorKind, ExecutionError, ExecutionRequest,
    ExecutionResult, ExecutionStatus, InstanceConnectionInfo, OperationType, QueryAnalysis,
    Recommendation, RiskLevel, SubmissionType,
};
pub use services::PoolManager;
