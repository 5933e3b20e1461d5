//! Execution services.
//!
//! This module contains the pieces the execution engine is built from:
//! - `pool` - Per-instance PostgreSQL pools and MongoDB clients
//! - `query` - Query execution under a statement timeout
//! - `script` - Child-process sandbox lifecycle
//! - `output` - Bounded output capture
//! - `sanitize` - Credential redaction for error messages

pub mod output;
pub mod pool;
pub mod query;
pub mod sanitize;
pub mod script;

pub use output::{BoundedOutput, TRUNCATION_MARKER};
pub use pool::{InstancePoolStatus, PoolManager, PostgresPool, PooledConnection};
pub use query::QueryExecutor;
pub use sanitize::Redactor;
pub use script::{SandboxContext, ScriptExecutor, ScriptExit, ScriptRun, SANDBOX_WORKER};
