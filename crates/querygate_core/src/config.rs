//! Engine configuration.
//!
//! Hierarchical loading, lowest priority first:
//! - built-in defaults
//! - `querygate.toml` in the working directory (optional)
//! - environment variables (`QUERYGATE_*` prefix, `__` between sections)
//!
//! ```toml
//! [execution]
//! query_timeout_secs = 30
//! script_timeout_secs = 30
//! max_output_bytes = 1048576
//!
//! [sandbox]
//! program = "/usr/bin/python3"
//! bundled_worker = true
//!
//! [logging]
//! filter = "info,querygate_core=debug"
//! file = true
//! ```
//!
//! ```bash
//! QUERYGATE_EXECUTION__SCRIPT_TIMEOUT_SECS=60
//! QUERYGATE_SANDBOX__PROGRAM=/opt/venv/bin/python
//! ```
//!
//! Connection credentials are never part of this configuration; they arrive
//! with each request.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::GateError;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "querygate.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "QUERYGATE_";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub execution: ExecutionLimits,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Timeouts and output bounds applied to every execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Statement timeout for queries
    #[serde(default = "default_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Wall-clock timeout for scripts
    #[serde(default = "default_timeout_secs")]
    pub script_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL for a timed-out script
    #[serde(default = "default_kill_grace_period_ms")]
    pub kill_grace_period_ms: u64,
    /// Cap on captured output per stream
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Cap on `error.message` length
    #[serde(default = "default_max_error_message_len")]
    pub max_error_message_len: usize,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_kill_grace_period_ms() -> u64 {
    2_000
}
fn default_max_output_bytes() -> usize {
    1_048_576
}
fn default_max_error_message_len() -> usize {
    4_096
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            query_timeout_secs: default_timeout_secs(),
            script_timeout_secs: default_timeout_secs(),
            kill_grace_period_ms: default_kill_grace_period_ms(),
            max_output_bytes: default_max_output_bytes(),
            max_error_message_len: default_max_error_message_len(),
        }
    }
}

impl ExecutionLimits {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_millis(self.kill_grace_period_ms)
    }
}

/// How scripts are launched.
///
/// The script is written to a private temporary file. With `bundled_worker`
/// the command is `program args... <worker.py> <script>`: the worker reads
/// the sandbox context from stdin and gives the script a `db` handle. Without
/// it the command is `program args... <script>` and the context is still
/// written to stdin for the program to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Interpreter (a Python 3 interpreter when `bundled_worker` is set)
    #[serde(default = "default_program")]
    pub program: String,
    /// Run scripts through the bundled Python worker that injects `db`
    #[serde(default = "default_true")]
    pub bundled_worker: bool,
    /// Arguments placed before the script path
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; a fresh temporary directory when unset
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the child
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Start the child with an empty environment (plus `PATH` and `env`)
    #[serde(default = "default_true")]
    pub clear_env: bool,
}

fn default_program() -> String {
    "python3".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            bundled_worker: true,
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            clear_env: true,
        }
    }
}

/// Connection pool sizing for target instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Connections per instance
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
    /// How long to wait for a free connection
    #[serde(default = "default_pool_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// How long to wait for a new connection
    #[serde(default = "default_pool_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// `application_name` reported to PostgreSQL / app name for MongoDB
    #[serde(default = "default_application_name")]
    pub application_name: String,
    /// Pools unused for this long are closed
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_pool_max_size() -> usize {
    4
}
fn default_pool_timeout_secs() -> u64 {
    10
}
fn default_application_name() -> String {
    "querygate".to_string()
}
fn default_pool_idle_timeout_secs() -> u64 {
    600
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            wait_timeout_secs: default_pool_timeout_secs(),
            connect_timeout_secs: default_pool_timeout_secs(),
            application_name: default_application_name(),
            idle_timeout_secs: default_pool_idle_timeout_secs(),
        }
    }
}

impl PoolSettings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Subscriber installed by `logging::init_logging` when the host has none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, overriding `QUERYGATE_LOG` and `RUST_LOG`
    #[serde(default)]
    pub filter: Option<String>,
    /// Also write a daily rotating file (non-interactive runs only)
    #[serde(default)]
    pub file: bool,
    /// Log file directory; `<data dir>/querygate/logs` when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl EngineConfig {
    /// Load configuration from `querygate.toml` and the environment.
    pub fn load() -> Result<Self, GateError> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load configuration from a specific file plus the environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, GateError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string over the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self, GateError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a safety bound.
    pub fn validate(&self) -> Result<(), GateError> {
        let limits = &self.execution;
        if limits.query_timeout_secs == 0 || limits.script_timeout_secs == 0 {
            return Err(GateError::config("Execution timeouts must be greater than zero"));
        }
        if limits.max_output_bytes == 0 {
            return Err(GateError::config("max_output_bytes must be greater than zero"));
        }
        if limits.max_error_message_len == 0 {
            return Err(GateError::config("max_error_message_len must be greater than zero"));
        }
        if self.sandbox.program.trim().is_empty() {
            return Err(GateError::config("Sandbox program must not be empty"));
        }
        if self.pool.max_size == 0 {
            return Err(GateError::config("Pool max_size must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.execution.query_timeout(), Duration::from_secs(30));
        assert_eq!(config.execution.script_timeout(), Duration::from_secs(30));
        assert_eq!(config.execution.kill_grace_period(), Duration::from_secs(2));
        assert_eq!(config.execution.max_output_bytes, 1024 * 1024);
        assert_eq!(config.sandbox.program, "python3");
        assert!(config.sandbox.bundled_worker);
        assert!(config.sandbox.clear_env);
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.logging, LoggingSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_overrides_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [execution]
            script_timeout_secs = 5

            [sandbox]
            program = "/bin/sh"
            bundled_worker = false
            args = ["-e"]
            env = { LANG = "C" }

            [pool]
            idle_timeout_secs = 0

            [logging]
            filter = "warn"
            file = true
            "#,
        )
        .unwrap();
        assert_eq!(config.execution.script_timeout_secs, 5);
        assert_eq!(config.execution.query_timeout_secs, 30);
        assert_eq!(config.sandbox.program, "/bin/sh");
        assert!(!config.sandbox.bundled_worker);
        assert_eq!(config.sandbox.args, vec!["-e"]);
        assert_eq!(config.sandbox.env.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(config.pool.application_name, "querygate");
        assert!(config.pool.idle_timeout().is_zero());
        assert_eq!(config.logging.filter.as_deref(), Some("warn"));
        assert!(config.logging.file);
        assert!(config.logging.directory.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let err = EngineConfig::from_toml_str("[execution]\nquery_timeout_secs = 0").unwrap_err();
        assert!(err.is_config());
        let err = EngineConfig::from_toml_str("[execution]\nmax_output_bytes = 0").unwrap_err();
        assert!(err.is_config());
        let err = EngineConfig::from_toml_str("[pool]\nmax_size = 0").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EngineConfig::from_toml_str("[execution]\nquery_timeout_secs = \"soon\"").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = EngineConfig::load_from("/nonexistent/querygate.toml").unwrap();
        assert_eq!(config.execution.script_timeout_secs, 30);
    }
}
