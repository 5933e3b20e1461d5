//! Execution request, result, and lifecycle models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

use super::{DatabaseType, InstanceConnectionInfo};
use crate::error::GateError;

/// Kind of approved submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionType {
    /// A query run directly through the database driver
    Query,
    /// A script run in a sandboxed child process
    Script,
}

/// An approved submission handed to the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Identifier used for logging and correlation
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Query or script
    pub submission_type: SubmissionType,
    /// Target database engine
    pub database_type: DatabaseType,
    /// Query text (query submissions)
    #[serde(default)]
    pub query_content: Option<String>,
    /// Script source (script submissions)
    #[serde(default)]
    pub script_content: Option<String>,
    /// Database to run against, overriding the instance default
    #[serde(default)]
    pub database_name: Option<String>,
    /// Connection descriptor resolved by the caller
    #[serde(default)]
    pub instance_connection_info: Option<InstanceConnectionInfo>,
}

impl ExecutionRequest {
    /// Create a query submission.
    pub fn query(
        database_type: DatabaseType,
        instance: InstanceConnectionInfo,
        query: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            submission_type: SubmissionType::Query,
            database_type,
            query_content: Some(query.into()),
            script_content: None,
            database_name: None,
            instance_connection_info: Some(instance),
        }
    }

    /// Create a script submission.
    pub fn script(
        database_type: DatabaseType,
        instance: InstanceConnectionInfo,
        script: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            submission_type: SubmissionType::Script,
            database_type,
            query_content: None,
            script_content: Some(script.into()),
            database_name: None,
            instance_connection_info: Some(instance),
        }
    }

    /// Override the target database name.
    pub fn with_database_name(mut self, database_name: impl Into<String>) -> Self {
        self.database_name = Some(database_name.into());
        self
    }

    /// Database to run against: the override, else the instance default.
    pub fn target_database(&self) -> &str {
        self.database_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| self.instance_connection_info.as_ref().map(|i| i.database.as_str()))
            .unwrap_or_default()
    }

    /// The submitted text for this request's submission type.
    pub fn content(&self) -> Option<&str> {
        match self.submission_type {
            SubmissionType::Query => self.query_content.as_deref(),
            SubmissionType::Script => self.script_content.as_deref(),
        }
    }

    /// Check caller preconditions: content and connection info present and usable.
    pub fn validate(&self) -> Result<&InstanceConnectionInfo, GateError> {
        if self.content().map_or(true, |c| c.trim().is_empty()) {
            let field = match self.submission_type {
                SubmissionType::Query => "queryContent",
                SubmissionType::Script => "scriptContent",
            };
            return Err(GateError::config(format!("{field} is required")));
        }
        let info = self
            .instance_connection_info
            .as_ref()
            .ok_or_else(|| GateError::config("instanceConnectionInfo is required"))?;
        info.validate(self.database_type)?;
        Ok(info)
    }
}

/// Final status of an execution. There is no partial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Ran to completion
    Completed,
    /// Timed out or errored
    Failed,
}

/// Failure category reported on a failed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Deadline expired; the operation was terminated
    Timeout,
    /// Network, pool, or connection failure
    Connection,
    /// Bad credentials
    Authentication,
    /// Missing privileges
    Permission,
    /// Query text rejected by the parser
    Syntax,
    /// Any other server-side failure
    Query,
    /// Script exited unsuccessfully
    ScriptError,
    /// Sandbox process could not be started or supervised
    Sandbox,
    /// Caller precondition violation
    Config,
    /// Unexpected failure inside querygate
    Internal,
}

/// Structured error carried by a failed result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Failure category
    pub kind: ErrorKind,
    /// Sanitized, length-bounded message
    pub message: String,
}

/// Captured output of a finished execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    /// Serialized rows/documents or captured stdout
    pub output: String,
    /// Whether `output` was cut at the output cap
    pub truncated: bool,
    /// Rows or documents returned/affected (queries)
    pub row_count: Option<u64>,
    /// Process exit code (scripts)
    pub exit_code: Option<i32>,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Identifier of the originating request
    pub execution_id: Uuid,
    /// Completed or failed
    pub status: ExecutionStatus,
    /// Serialized rows/documents or captured stdout, bounded in size
    pub output: String,
    /// Present iff `status` is `Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Whether `output` was truncated
    pub truncated: bool,
    /// Rows or documents returned/affected (queries)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    /// Process exit code (scripts)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// When the engine started the attempt
    pub started_at: DateTime<Utc>,
    /// When the engine finished the attempt
    pub completed_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Check if the execution completed.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// Failure kind, if failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Lifecycle of a single execution attempt.
///
/// `Created -> Running -> {Completed | Failed}`; no retries, no re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionState {
    /// Accepted, not yet started
    #[default]
    Created,
    /// Connection acquired or process spawned
    Running,
    /// Finished successfully
    Completed,
    /// Timed out or errored
    Failed,
}

impl ExecutionState {
    /// Check if this state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Tracks one execution attempt from start to result.
///
/// Finishing consumes the handle, so an attempt yields exactly one result.
pub struct ExecutionHandle {
    /// Request identifier
    id: Uuid,
    /// Query or script
    submission_type: SubmissionType,
    /// Current lifecycle state
    state: ExecutionState,
    /// Wall-clock start
    started_at: DateTime<Utc>,
    /// Monotonic start, for duration
    started: Instant,
}

impl ExecutionHandle {
    /// Create a handle for a request.
    pub fn new(request: &ExecutionRequest) -> Self {
        Self {
            id: request.id,
            submission_type: request.submission_type,
            state: ExecutionState::Created,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Get the request identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the submission type.
    pub fn submission_type(&self) -> SubmissionType {
        self.submission_type
    }

    /// Get the current state.
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Get when execution started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Move from `Created` to `Running`, resetting the start time.
    pub fn start(&mut self) {
        debug_assert_eq!(self.state, ExecutionState::Created);
        self.state = ExecutionState::Running;
        self.started_at = Utc::now();
        self.started = Instant::now();
        tracing::trace!(execution_id = %self.id, "Execution running");
    }

    /// Finish successfully.
    pub fn complete(mut self, output: ExecutionOutput) -> ExecutionResult {
        self.state = ExecutionState::Completed;
        self.finish(output, None)
    }

    /// Finish with an error, keeping whatever output was captured.
    pub fn fail(mut self, error: ExecutionError, output: ExecutionOutput) -> ExecutionResult {
        self.state = ExecutionState::Failed;
        self.finish(output, Some(error))
    }

    fn finish(self, output: ExecutionOutput, error: Option<ExecutionError>) -> ExecutionResult {
        let status = match self.state {
            ExecutionState::Completed => ExecutionStatus::Completed,
            _ => ExecutionStatus::Failed,
        };
        ExecutionResult {
            execution_id: self.id,
            status,
            output: output.output,
            error,
            truncated: output.truncated,
            row_count: output.row_count,
            exit_code: output.exit_code,
            started_at: self.started_at,
            completed_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .field("submission_type", &self.submission_type)
            .field("state", &self.state)
            .field("started_at", &self.started_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceConnectionInfo {
        InstanceConnectionInfo::builder()
            .host("localhost")
            .database("app")
            .username("app")
            .password("secret")
            .build()
    }

    #[test]
    fn test_validate_requires_content() {
        let mut request = ExecutionRequest::query(DatabaseType::Postgresql, instance(), "  ");
        assert!(request.validate().unwrap_err().is_config());
        request.query_content = Some("SELECT 1".into());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_connection_info() {
        let mut request = ExecutionRequest::script(DatabaseType::Mongodb, instance(), "print(1)");
        request.instance_connection_info = None;
        let error = request.validate().unwrap_err();
        assert!(error.to_string().contains("instanceConnectionInfo"));
    }

    #[test]
    fn test_target_database_prefers_override() {
        let request = ExecutionRequest::query(DatabaseType::Postgresql, instance(), "SELECT 1");
        assert_eq!(request.target_database(), "app");
        let request = request.with_database_name("reporting");
        assert_eq!(request.target_database(), "reporting");
    }

    #[test]
    fn test_handle_lifecycle_complete() {
        let request = ExecutionRequest::query(DatabaseType::Postgresql, instance(), "SELECT 1");
        let mut handle = ExecutionHandle::new(&request);
        assert_eq!(handle.state(), ExecutionState::Created);
        handle.start();
        assert_eq!(handle.state(), ExecutionState::Running);

        let result = handle.complete(ExecutionOutput {
            output: "[]".into(),
            row_count: Some(0),
            ..Default::default()
        });
        assert!(result.is_success());
        assert!(result.error.is_none());
        assert_eq!(result.execution_id, request.id);
        assert!(result.completed_at >= result.started_at);
    }

    #[test]
    fn test_handle_lifecycle_fail_keeps_output() {
        let request = ExecutionRequest::script(DatabaseType::Postgresql, instance(), "exit 1");
        let mut handle = ExecutionHandle::new(&request);
        handle.start();
        let result = handle.fail(
            ExecutionError { kind: ErrorKind::ScriptError, message: "boom".into() },
            ExecutionOutput { output: "partial".into(), exit_code: Some(1), ..Default::default() },
        );
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error_kind(), Some(ErrorKind::ScriptError));
        assert_eq!(result.output, "partial");
        assert_eq!(result.exit_code, Some(1));
    }

    #[test]
    fn test_request_deserializes_from_caller_json() {
        let json = r#"{
            "submissionType": "query",
            "databaseType": "postgres",
            "queryContent": "SELECT 1",
            "instanceConnectionInfo": {
                "id": "6f1c1a5e-8a8e-4a37-9a5b-8f4f5f5a1b2c",
                "host": "localhost", "database": "app", "username": "app"
            }
        }"#;
        let request: ExecutionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.database_type, DatabaseType::Postgresql);
        assert_eq!(request.submission_type, SubmissionType::Query);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionState::Created.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
    }
}
