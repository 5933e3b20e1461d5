//! Error types for querygate.
//!
//! `GateError` covers everything the analyzer factory and the execution engine
//! can report. Only [`GateError::Config`] is meant to escape to callers as an
//! `Err`; every other variant is folded into a failed `ExecutionResult`.

use thiserror::Error;

use crate::models::ErrorKind;

/// Main error type for querygate.
#[derive(Debug, Error)]
pub enum GateError {
    /// Caller precondition violation (bad database type, missing connection info).
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Database connection failed or was lost.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication failed.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// The database user lacks a privilege required by the statement.
    #[error("Permission denied: {message}")]
    Permission {
        /// Human-readable error message.
        message: String,
    },

    /// The query text could not be parsed by the server or the shell parser.
    #[error("Syntax error: {message}")]
    Syntax {
        /// Human-readable error message.
        message: String,
        /// Position in query (1-indexed), when the server reports one.
        position: Option<usize>,
    },

    /// Query execution error with PostgreSQL-specific details.
    #[error("{message}")]
    Query {
        /// Server error message.
        message: String,
        /// Additional detail from the server.
        detail: Option<String>,
        /// Server hint.
        hint: Option<String>,
        /// SQLSTATE or MongoDB error code.
        code: Option<String>,
    },

    /// The operation ran past its deadline and was terminated.
    #[error("{message}")]
    Timeout {
        /// Human-readable error message.
        message: String,
    },

    /// Connection pool exhausted.
    #[error("Pool timeout: {message}")]
    PoolTimeout {
        /// Human-readable error message.
        message: String,
        /// Number of tasks waiting for connections.
        waiting: usize,
    },

    /// A user script exited unsuccessfully.
    #[error("{message}")]
    Script {
        /// Message drawn from the script's stderr.
        message: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// The sandbox process could not be started or supervised.
    #[error("Sandbox error: {message}")]
    Sandbox {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl GateError {
    // ========== Constructors ==========

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            hint: Some("Check the instance credentials".to_string()),
        }
    }

    /// Create a new permission error.
    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission { message: message.into() }
    }

    /// Create a new syntax error.
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax { message: message.into(), position: None }
    }

    /// Create a new query error with full server details.
    pub fn query(
        message: impl Into<String>,
        detail: Option<String>,
        hint: Option<String>,
        code: Option<String>,
    ) -> Self {
        Self::Query { message: message.into(), detail, hint, code }
    }

    /// Create a new timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout { message: message.into() }
    }

    /// Create a new pool timeout error.
    pub fn pool_timeout(message: impl Into<String>, waiting: usize) -> Self {
        Self::PoolTimeout { message: message.into(), waiting }
    }

    /// Create a new script error.
    pub fn script(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::Script { message: message.into(), exit_code }
    }

    /// Create a new sandbox error.
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox { message: message.into(), source: None }
    }

    /// Create a new sandbox error with source.
    pub fn sandbox_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Sandbox { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Error for a MongoDB server error code, from a command failure or a
    /// `writeErrors` entry in a command reply.
    pub fn mongo_server(code: i32, message: impl Into<String>) -> Self {
        match code {
            // MaxTimeMSExpired
            50 => GateError::timeout(message),
            // Unauthorized
            13 => GateError::permission(message),
            _ => GateError::query(message, None, None, Some(code.to_string())),
        }
    }

    // ========== Methods ==========

    /// Check if this error is a caller precondition violation.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Check if this error represents an expired deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "Config",
            Self::Connection { .. } => "Connection",
            Self::Authentication { .. } => "Authentication",
            Self::Permission { .. } => "Permission",
            Self::Syntax { .. } => "Syntax",
            Self::Query { .. } => "Query",
            Self::Timeout { .. } => "Timeout",
            Self::PoolTimeout { .. } => "Pool",
            Self::Script { .. } => "Script",
            Self::Sandbox { .. } => "Sandbox",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Map to the wire-level error kind stored on `ExecutionResult`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::Connection { .. } | Self::PoolTimeout { .. } => ErrorKind::Connection,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::Query { .. } => ErrorKind::Query,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Script { .. } => ErrorKind::ScriptError,
            Self::Sandbox { .. } => ErrorKind::Sandbox,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get actionable hint for the requester.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Config { .. } => None,
            Self::Connection { .. } => Some("Check that the database instance is reachable"),
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::Permission { .. } => Some("The instance user lacks the required privileges"),
            Self::Syntax { .. } => Some("Check the query syntax"),
            Self::Query { hint, .. } => hint.as_deref(),
            Self::Timeout { .. } => Some("Narrow the query or split the work into smaller batches"),
            Self::PoolTimeout { .. } => Some("Too many executions are running against this instance"),
            Self::Script { .. } => Some("Inspect the script output for the failing line"),
            Self::Sandbox { .. } => Some("Check the sandbox program configuration"),
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get the server error code (if applicable).
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to GateError.
impl From<tokio_postgres::Error> for GateError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();

            return match code_str {
                // query_canceled: raised when statement_timeout fires
                "57014" => GateError::Timeout { message },
                "42501" => GateError::Permission { message },
                "42601" => {
                    let position = db_err.position().and_then(|p| match p {
                        tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos as usize),
                        tokio_postgres::error::ErrorPosition::Internal { .. } => None,
                    });
                    GateError::Syntax { message, position }
                }
                _ if code_str.starts_with("28") => GateError::Authentication {
                    message,
                    hint: Some("Authentication failed - check the instance credentials".to_string()),
                },
                _ if code_str.starts_with("08") => {
                    GateError::Connection { message, source: Some(Box::new(err)) }
                }
                _ => GateError::Query {
                    message,
                    detail: db_err.detail().map(String::from),
                    hint: db_err.hint().map(String::from),
                    code: Some(code_str.to_string()),
                },
            };
        }

        if err.is_closed() {
            return GateError::Connection {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        GateError::Connection { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from mongodb::error::Error to GateError.
impl From<mongodb::error::Error> for GateError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind as MongoKind;

        let message = err.to_string();
        match err.kind.as_ref() {
            MongoKind::Authentication { .. } => GateError::authentication(message),
            MongoKind::ServerSelection { .. } | MongoKind::Io(_) | MongoKind::ConnectionPoolCleared { .. } => {
                GateError::Connection { message, source: Some(Box::new(err)) }
            }
            MongoKind::InvalidArgument { .. } => GateError::syntax(message),
            MongoKind::Command(command) => GateError::mongo_server(command.code, message),
            MongoKind::Write(mongodb::error::WriteFailure::WriteError(write)) => {
                GateError::mongo_server(write.code, message)
            }
            MongoKind::Write(mongodb::error::WriteFailure::WriteConcernError(concern)) => {
                GateError::mongo_server(concern.code, message)
            }
            _ => GateError::query(message, None, None, None),
        }
    }
}

/// Convert from std::io::Error to GateError.
impl From<std::io::Error> for GateError {
    fn from(err: std::io::Error) -> Self {
        GateError::Sandbox { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from serde_json::Error to GateError.
impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::Internal { message: format!("JSON error: {err}"), source: Some(Box::new(err)) }
    }
}

/// Convert from figment::Error to GateError.
impl From<figment::Error> for GateError {
    fn from(err: figment::Error) -> Self {
        GateError::Config { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_flagged() {
        let error = GateError::config("unsupported database type: oracle");
        assert!(error.is_config());
        assert_eq!(error.kind(), ErrorKind::Config);
        assert_eq!(error.to_string(), "Config error: unsupported database type: oracle");
    }

    #[test]
    fn test_timeout_displays_message_verbatim() {
        let error = GateError::timeout("execution timed out after 30s");
        assert!(error.is_timeout());
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert_eq!(error.to_string(), "execution timed out after 30s");
    }

    #[test]
    fn test_kind_mapping_covers_runtime_failures() {
        assert_eq!(GateError::connection("refused").kind(), ErrorKind::Connection);
        assert_eq!(GateError::pool_timeout("exhausted", 3).kind(), ErrorKind::Connection);
        assert_eq!(GateError::authentication("bad password").kind(), ErrorKind::Authentication);
        assert_eq!(GateError::permission("denied").kind(), ErrorKind::Permission);
        assert_eq!(GateError::syntax("near FROM").kind(), ErrorKind::Syntax);
        assert_eq!(GateError::script("boom", Some(1)).kind(), ErrorKind::ScriptError);
        assert_eq!(GateError::sandbox("no such program").kind(), ErrorKind::Sandbox);
        assert_eq!(GateError::internal("bug").kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_mongo_server_codes() {
        assert!(GateError::mongo_server(50, "operation exceeded time limit").is_timeout());
        assert_eq!(GateError::mongo_server(13, "not authorized").kind(), ErrorKind::Permission);
        let error = GateError::mongo_server(11000, "E11000 duplicate key");
        assert_eq!(error.code(), Some("11000"));
    }

    #[test]
    fn test_hints_for_runtime_failures() {
        assert!(GateError::connection("refused").hint().is_some());
        assert!(GateError::timeout("slow").hint().is_some());
        assert!(GateError::config("bad").hint().is_none());
        let error = GateError::query("relation does not exist", None, None, Some("42P01".into()));
        assert_eq!(error.code(), Some("42P01"));
    }
}
