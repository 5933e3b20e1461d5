//! Sandboxed script execution.
//!
//! A script runs in a separate child process, never in-process:
//! - the source is written to a private temporary file whose path is the
//!   last argument to the configured `program args...`
//! - with the bundled worker ([`SANDBOX_WORKER`]) the worker path comes
//!   before the script path; the worker runs the script with restricted
//!   builtins and a `db` handle for the target instance
//! - a JSON [`SandboxContext`] is written to the child's stdin, then stdin is
//!   closed
//! - stdout and stderr are drained continuously into bounded buffers
//! - the child leads its own process group, so on timeout the whole tree is
//!   sent SIGTERM, then SIGKILL after the grace period, and the child is
//!   reaped before `run` returns

use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::{ExecutionLimits, SandboxConfig};
use crate::error::GateError;
use crate::models::{DatabaseType, ExecutionOutput, ExecutionRequest, InstanceConnectionInfo};
use crate::services::output::BoundedOutput;

/// Python worker that exposes `db` to scripts and prints a JSON result.
pub const SANDBOX_WORKER: &str = include_str!("../../sandbox/worker.py");

/// How long to wait for the output pipes to drain after the child exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Context handed to the sandbox on stdin.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxContext<'a> {
    pub database_type: DatabaseType,
    pub database_name: &'a str,
    pub instance: &'a InstanceConnectionInfo,
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
}

/// How a script run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptExit {
    /// Exited on its own with this code
    Exited(i32),
    /// Killed by a signal it did not get from us
    Signalled(i32),
    /// Ran past the timeout and was terminated; `forced` if SIGKILL was needed
    TimedOut { forced: bool },
}

/// Captured result of one script run.
#[derive(Debug)]
pub struct ScriptRun {
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub exit: ScriptExit,
    pub pid: Option<u32>,
    pub elapsed: Duration,
}

impl ScriptRun {
    /// Output recorded on the execution result, success or not.
    pub fn output(&self) -> ExecutionOutput {
        ExecutionOutput {
            output: self.stdout.clone(),
            truncated: self.stdout_truncated,
            row_count: None,
            exit_code: match self.exit {
                ScriptExit::Exited(code) => Some(code),
                _ => None,
            },
        }
    }
}

/// Launches scripts in the configured sandbox program.
pub struct ScriptExecutor {
    limits: ExecutionLimits,
    sandbox: SandboxConfig,
}

impl ScriptExecutor {
    pub fn new(limits: ExecutionLimits, sandbox: SandboxConfig) -> Self {
        Self { limits, sandbox }
    }

    /// Message reported when a script runs past its deadline.
    pub fn timeout_message(&self) -> String {
        format!("script execution timed out after {}s", self.limits.script_timeout_secs)
    }

    /// Run the script for `request`.
    ///
    /// Returns `Err` only when the sandbox cannot be set up or supervised;
    /// script failures and timeouts are reported through [`ScriptRun::exit`].
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        info: &InstanceConnectionInfo,
        script: &str,
    ) -> Result<ScriptRun, GateError> {
        let context = SandboxContext {
            database_type: request.database_type,
            database_name: request.target_database(),
            instance: info,
            timeout_ms: self.limits.script_timeout().as_millis() as u64,
            max_output_bytes: self.limits.max_output_bytes,
        };
        let run = self.run(script, &context).await?;

        tracing::debug!(
            pid = ?run.pid,
            exit = ?run.exit,
            elapsed_ms = run.elapsed.as_millis() as u64,
            stdout_truncated = run.stdout_truncated,
            "Script finished"
        );
        Ok(run)
    }

    /// Error for an unsuccessful run, `None` when the script exited zero.
    pub fn failure(&self, run: &ScriptRun) -> Option<GateError> {
        let stderr = run.stderr.trim();
        let from_stderr = |fallback: String| {
            if stderr.is_empty() {
                fallback
            } else {
                stderr.to_string()
            }
        };
        match run.exit {
            ScriptExit::Exited(0) => None,
            ScriptExit::Exited(code) => Some(GateError::script(
                from_stderr(format!("script exited with code {code}")),
                Some(code),
            )),
            ScriptExit::Signalled(signal) => Some(GateError::script(
                from_stderr(format!("script terminated by signal {signal}")),
                None,
            )),
            ScriptExit::TimedOut { .. } => Some(GateError::timeout(self.timeout_message())),
        }
    }

    /// Spawn the sandbox for `script` and supervise it to completion.
    pub async fn run(
        &self,
        script: &str,
        context: &SandboxContext<'_>,
    ) -> Result<ScriptRun, GateError> {
        let mut script_file = tempfile::Builder::new().prefix("querygate-script-").tempfile()?;
        script_file.write_all(script.as_bytes())?;
        script_file.flush()?;
        let worker_file = if self.sandbox.bundled_worker {
            let mut file = tempfile::Builder::new().prefix("querygate-worker-").suffix(".py").tempfile()?;
            file.write_all(SANDBOX_WORKER.as_bytes())?;
            file.flush()?;
            Some(file)
        } else {
            None
        };

        // Held until the child is reaped.
        let scratch_dir = match &self.sandbox.working_dir {
            Some(_) => None,
            None => Some(tempfile::Builder::new().prefix("querygate-sandbox-").tempdir()?),
        };
        let working_dir: PathBuf = match (&self.sandbox.working_dir, &scratch_dir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) => dir.path().to_path_buf(),
            (None, None) => std::env::temp_dir(),
        };

        let mut command = Command::new(&self.sandbox.program);
        command
            .args(&self.sandbox.args)
            .args(worker_file.as_ref().map(|file| file.path()))
            .arg(script_file.path())
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.sandbox.clear_env {
            command.env_clear();
            if let Some(path) = std::env::var_os("PATH") {
                command.env("PATH", path);
            }
        }
        command.envs(&self.sandbox.env);
        #[cfg(unix)]
        command.process_group(0);

        let payload = serde_json::to_vec(context)?;
        let started = Instant::now();
        let mut child = command.spawn().map_err(|err| {
            GateError::sandbox_with_source(
                format!("Failed to start sandbox program `{}`", self.sandbox.program),
                err,
            )
        })?;
        let pid = child.id();
        tracing::debug!(pid = ?pid, program = %self.sandbox.program, "Sandbox process started");

        let stdin_task = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // A script that never reads stdin gets a broken pipe; that is fine.
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            })
        });
        let stdout = Arc::new(Mutex::new(BoundedOutput::new(self.limits.max_output_bytes)));
        let stderr = Arc::new(Mutex::new(BoundedOutput::new(self.limits.max_output_bytes)));
        let stdout_task = child.stdout.take().map(|pipe| tokio::spawn(drain(pipe, Arc::clone(&stdout))));
        let stderr_task = child.stderr.take().map(|pipe| tokio::spawn(drain(pipe, Arc::clone(&stderr))));

        let exit = match tokio::time::timeout(self.limits.script_timeout(), child.wait()).await {
            Ok(status) => exit_from_status(status?),
            Err(_) => {
                let forced = self.terminate(&mut child, pid).await?;
                ScriptExit::TimedOut { forced }
            }
        };
        let elapsed = started.elapsed();

        // Descendants that outlived the script still hold the pipes open.
        #[cfg(unix)]
        if let Some(pid) = pid {
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        }

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            join_or_abort(task).await;
        }
        if let Some(task) = stdin_task {
            task.abort();
        }

        let stdout = std::mem::replace(&mut *stdout.lock(), BoundedOutput::new(0));
        let stderr = std::mem::replace(&mut *stderr.lock(), BoundedOutput::new(0));
        let stdout_truncated = stdout.is_truncated();
        drop(scratch_dir);

        Ok(ScriptRun {
            stdout: stdout.into_string(),
            stdout_truncated,
            stderr: stderr.into_string(),
            exit,
            pid,
            elapsed,
        })
    }

    /// SIGTERM the process group, then SIGKILL after the grace period.
    ///
    /// Returns whether SIGKILL was needed. The child is reaped either way.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) -> Result<bool, GateError> {
        let grace = self.limits.kill_grace_period();
        tracing::warn!(
            pid = ?pid,
            timeout_secs = self.limits.script_timeout_secs,
            "Script timed out, terminating"
        );

        #[cfg(unix)]
        if let Some(pid) = pid {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
            if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                status?;
                return Ok(false);
            }
            tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "Script ignored SIGTERM, killing");
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = grace;

        // Covers a child that left its process group.
        if let Err(err) = child.start_kill() {
            tracing::debug!(error = %err, "start_kill after SIGKILL");
        }
        child.wait().await?;
        Ok(true)
    }
}

/// Read `pipe` to EOF into `sink`. Bytes past the cap are discarded, never
/// buffered, and the pipe keeps draining so the child cannot block on it.
async fn drain<R>(mut pipe: R, sink: Arc<Mutex<BoundedOutput>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.lock().push(&buf[..n]),
            Err(err) => {
                tracing::debug!(error = %err, "Sandbox pipe read failed");
                break;
            }
        }
    }
}

async fn join_or_abort(mut task: JoinHandle<()>) {
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut task).await.is_err() {
        tracing::debug!("Sandbox pipe still open after exit, abandoning reader");
        task.abort();
    }
}

fn exit_from_status(status: ExitStatus) -> ScriptExit {
    if let Some(code) = status.code() {
        return ScriptExit::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ScriptExit::Signalled(signal);
        }
    }
    ScriptExit::Exited(-1)
}

/// Signal every process in the group led by `pid`. A group that is already
/// gone is not an error.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            tracing::warn!(pid, signal = signal.as_str(), error = %err, "Failed to signal process group")
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor(timeout_secs: u64, max_output_bytes: usize) -> ScriptExecutor {
        let limits = ExecutionLimits {
            script_timeout_secs: timeout_secs,
            kill_grace_period_ms: 300,
            max_output_bytes,
            ..ExecutionLimits::default()
        };
        let sandbox = SandboxConfig {
            program: "/bin/sh".to_string(),
            bundled_worker: false,
            ..SandboxConfig::default()
        };
        ScriptExecutor::new(limits, sandbox)
    }

    /// Executor running the bundled worker, or `None` without a python3.
    fn worker_executor() -> Option<ScriptExecutor> {
        let available = std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success());
        if !available {
            eprintln!("python3 not found, skipping worker test");
            return None;
        }
        let limits = ExecutionLimits { script_timeout_secs: 20, ..ExecutionLimits::default() };
        Some(ScriptExecutor::new(limits, SandboxConfig::default()))
    }

    fn worker_result(run: &ScriptRun) -> serde_json::Value {
        serde_json::from_str(run.stdout.trim()).unwrap()
    }

    fn info() -> InstanceConnectionInfo {
        InstanceConnectionInfo::builder()
            .host("db.internal")
            .database("app")
            .username("app")
            .password("hunter2")
            .build()
    }

    async fn run(executor: &ScriptExecutor, script: &str) -> ScriptRun {
        let request = ExecutionRequest::script(DatabaseType::Postgresql, info(), script);
        let info = info();
        executor.execute(&request, &info, script).await.unwrap()
    }

    fn is_alive(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let executor = executor(10, 1024);
        let run = run(&executor, "echo hello\necho world").await;
        assert_eq!(run.exit, ScriptExit::Exited(0));
        assert_eq!(run.stdout, "hello\nworld\n");
        assert!(executor.failure(&run).is_none());

        let output = run.output();
        assert_eq!(output.output, "hello\nworld\n");
        assert_eq!(output.exit_code, Some(0));
        assert!(!output.truncated);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let executor = executor(10, 1024);
        let run = run(&executor, "echo partial\necho 'relation \"users\" does not exist' >&2\nexit 3").await;
        assert_eq!(run.exit, ScriptExit::Exited(3));
        assert_eq!(run.stdout, "partial\n");

        let err = executor.failure(&run).unwrap();
        assert_eq!(err.category(), "Script");
        assert_eq!(err.to_string(), "relation \"users\" does not exist");
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_stderr_uses_fallback() {
        let executor = executor(10, 1024);
        let run = run(&executor, "exit 7").await;
        let err = executor.failure(&run).unwrap();
        assert_eq!(err.to_string(), "script exited with code 7");
        assert_eq!(run.output().exit_code, Some(7));
    }

    #[tokio::test]
    async fn test_timeout_terminates_with_sigterm() {
        let executor = executor(1, 1024);
        let start = Instant::now();
        let run = run(&executor, "sleep 30").await;

        assert_eq!(run.exit, ScriptExit::TimedOut { forced: false });
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!is_alive(run.pid.unwrap()));

        let err = executor.failure(&run).unwrap();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "script execution timed out after 1s");
    }

    #[tokio::test]
    async fn test_timeout_escalates_to_sigkill() {
        let executor = executor(1, 1024);
        let start = Instant::now();
        let run = run(&executor, "trap '' TERM\nwhile :; do sleep 1; done").await;

        assert_eq!(run.exit, ScriptExit::TimedOut { forced: true });
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!is_alive(run.pid.unwrap()));
    }

    #[tokio::test]
    async fn test_unbounded_output_is_capped() {
        let executor = executor(1, 4096);
        let run = run(&executor, "while :; do echo 0123456789abcdef; done").await;

        assert!(matches!(run.exit, ScriptExit::TimedOut { .. }));
        assert!(run.stdout_truncated);
        assert!(run.stdout.len() <= 4096 + crate::services::output::TRUNCATION_MARKER.len());
        assert!(run.stdout.ends_with(crate::services::output::TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn test_large_output_on_success_is_truncated() {
        let executor = executor(10, 1000);
        let run = run(&executor, "head -c 100000 /dev/zero | tr '\\0' x").await;
        assert_eq!(run.exit, ScriptExit::Exited(0));
        assert!(run.output().truncated);
        assert!(run.stdout.starts_with(&"x".repeat(1000)));
    }

    #[tokio::test]
    async fn test_context_is_written_to_stdin() {
        let executor = executor(10, 64 * 1024);
        let run = run(&executor, "cat").await;
        let context: serde_json::Value = serde_json::from_str(&run.stdout).unwrap();
        assert_eq!(context["databaseType"], "postgresql");
        assert_eq!(context["databaseName"], "app");
        assert_eq!(context["timeoutMs"], 10_000);
        assert_eq!(context["maxOutputBytes"], 64 * 1024);
        assert_eq!(context["instance"]["host"], "db.internal");
    }

    #[tokio::test]
    async fn test_environment_is_cleared_except_configured() {
        let mut executor = executor(10, 1024);
        executor.sandbox.env.insert("GREETING".to_string(), "hi".to_string());
        let run = run(&executor, "echo \"$GREETING ${HOME:-nohome}\"").await;
        assert_eq!(run.stdout, "hi nohome\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_sandbox_error() {
        let mut executor = executor(10, 1024);
        executor.sandbox.program = "/nonexistent/interpreter".to_string();
        let request = ExecutionRequest::script(DatabaseType::Mongodb, info(), "print(1)");
        let err = executor.execute(&request, &info(), "print(1)").await.unwrap_err();
        assert_eq!(err.category(), "Sandbox");
    }

    #[tokio::test]
    async fn test_worker_injects_db_handle() {
        let Some(executor) = worker_executor() else { return };
        let run = run(&executor, "print(type(db).__name__, callable(db.query))").await;

        assert_eq!(run.exit, ScriptExit::Exited(0), "stderr: {}", run.stderr);
        let result = worker_result(&run);
        assert_eq!(result["success"], true);
        assert_eq!(result["output"][0]["type"], "info");
        assert_eq!(result["output"][0]["message"], "PostgresHandle True");
    }

    #[tokio::test]
    async fn test_worker_mongo_handle_resolves_collections() {
        let Some(executor) = worker_executor() else { return };
        let request = ExecutionRequest::script(DatabaseType::Mongodb, info(), "");
        let script = "print(type(db.users).__name__, type(db['orders']).__name__)";
        let run = executor.execute(&request, &info(), script).await.unwrap();

        assert_eq!(run.exit, ScriptExit::Exited(0), "stderr: {}", run.stderr);
        assert_eq!(worker_result(&run)["output"][0]["message"], "MongoCollection MongoCollection");
    }

    #[tokio::test]
    async fn test_worker_restricts_imports_and_builtins() {
        let Some(executor) = worker_executor() else { return };

        let blocked = run(&executor, "import os\nos.system('true')").await;
        assert_eq!(blocked.exit, ScriptExit::Exited(1));
        let err = executor.failure(&blocked).unwrap();
        assert!(err.to_string().starts_with("ImportError: import of 'os' is not allowed"), "{err}");

        let no_open = run(&executor, "open('/etc/passwd')").await;
        assert_eq!(executor.failure(&no_open).unwrap().to_string(), "NameError: name 'open' is not defined");

        let allowed = run(&executor, "import json\nprint(json.dumps({'a': 1}))").await;
        assert_eq!(worker_result(&allowed)["output"][0]["message"], "{\"a\": 1}");
    }

    #[tokio::test]
    async fn test_worker_reports_syntax_errors() {
        let Some(executor) = worker_executor() else { return };
        let run = run(&executor, "print('a'\n").await;
        let result = worker_result(&run);
        assert_eq!(result["success"], false);
        assert_eq!(result["error"]["type"], "SyntaxError");
        assert!(executor.failure(&run).unwrap().to_string().starts_with("SyntaxError: line "));
    }

    #[tokio::test]
    async fn test_worker_bounds_its_own_output() {
        let Some(mut executor) = worker_executor() else { return };
        executor.limits.max_output_bytes = 2048;
        let run = run(&executor, "for i in range(10000):\n    print('row', i)").await;

        assert_eq!(run.exit, ScriptExit::Exited(0));
        let result = worker_result(&run);
        assert_eq!(result["truncated"], true);
        assert!(result["output"].as_array().unwrap().len() < 100);
    }
}
