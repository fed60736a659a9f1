//! Runtime status and process handles
//!
//! [`RuntimeStatus`] is the supervisor's per-service record; [`ServiceProcess`]
//! owns the spawned child and its three pipes until they are handed out.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::command::ServiceProcessSpec;
use crate::config::RunMode;
use crate::rpc::{ChildRpcClient, RpcError};

/// Stderr keywords that mark a failure restarts cannot fix
const PERMANENT_FAILURE_KEYWORDS: &[&str] = &[
    "auth",
    "credential",
    "unauthorized",
    "forbidden",
    "permission",
    "invalid token",
];

/// Upper bound on draining stderr from a dead process
const STDERR_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Stderr bytes kept per process; older output is discarded
const STDERR_TAIL_BYTES: usize = 64 * 1024;

pub const WARN_EXITED_NORMALLY: &str = "exited normally";
pub const WARN_PERMANENT_FAILURE: &str = "permanent failure (auth error detected); restart skipped";
pub const WARN_RESTART_LIMIT: &str = "restart limit reached";
pub const WARN_DEFINITION_MISSING: &str = "definition missing";

// ============================================================================
// State
// ============================================================================

/// Lifecycle state of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Pending,
    Starting,
    Ready,
    StartFailed,
    Restarting,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ServiceState::Pending => "pending",
            ServiceState::Starting => "starting",
            ServiceState::Ready => "ready",
            ServiceState::StartFailed => "start_failed",
            ServiceState::Restarting => "restarting",
            ServiceState::Stopped => "stopped",
        };
        f.pad(label)
    }
}

/// What to do after a watched process exits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    Clean,
    PermanentFailure,
    Restart,
    RestartLimit,
}

/// True when stderr text names an authentication or permission problem
pub fn is_permanent_failure(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    PERMANENT_FAILURE_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Classify an exit; `code` is `None` when the process died from a signal
pub fn classify_exit(
    code: Option<i32>,
    stderr: &str,
    restart_count: u32,
    max_restarts: u32,
) -> ExitDisposition {
    if code == Some(0) {
        ExitDisposition::Clean
    } else if is_permanent_failure(stderr) {
        ExitDisposition::PermanentFailure
    } else if restart_count < max_restarts {
        ExitDisposition::Restart
    } else {
        ExitDisposition::RestartLimit
    }
}

// ============================================================================
// Process handle
// ============================================================================

/// A spawned tool server with piped stdio
///
/// Stderr is drained by a background task from spawn onwards so a chatty
/// child never blocks on a full pipe; only the last [`STDERR_TAIL_BYTES`]
/// are kept.
#[derive(Debug)]
pub struct ServiceProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
    stderr_drain: Option<JoinHandle<()>>,
}

fn spawn_stderr_drain(mut stderr: ChildStderr, tail: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            let read = match stderr.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };
            let Ok(mut tail) = tail.lock() else {
                break;
            };
            tail.extend_from_slice(&chunk[..read]);
            if tail.len() > STDERR_TAIL_BYTES {
                let excess = tail.len() - STDERR_TAIL_BYTES;
                tail.drain(..excess);
            }
        }
    })
}

impl ServiceProcess {
    pub(crate) fn spawn(spec: &ServiceProcessSpec) -> std::io::Result<Self> {
        let mut child = Command::new(spec.program())
            .args(spec.args())
            .env_clear()
            .envs(&spec.env)
            .current_dir(&spec.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        let stderr_drain = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_drain(stderr, Arc::clone(&stderr_tail)));

        Ok(Self {
            stdin: child.stdin.take(),
            stdout: child.stdout.take().map(BufReader::new),
            stderr_tail,
            stderr_drain,
            child,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Move stdin/stdout into an RPC client; fails once already taken
    pub fn take_client(&mut self, service: &str) -> Result<ChildRpcClient, RpcError> {
        match (self.stdin.take(), self.stdout.take()) {
            (Some(stdin), Some(stdout)) => Ok(ChildRpcClient::new(service, stdin, stdout)),
            (stdin, stdout) => {
                self.stdin = stdin;
                self.stdout = stdout;
                Err(RpcError::PipesUnavailable {
                    service: service.to_string(),
                })
            }
        }
    }

    /// Next stdout line; `Ok(None)` at end of stream
    pub(crate) async fn first_line(&mut self) -> std::io::Result<Option<String>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };
        let mut line = String::new();
        let read = stdout.read_line(&mut line).await?;
        Ok((read > 0).then_some(line))
    }

    /// Not yet reaped
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Wait up to `grace` for exit, killing the process if it lingers
    pub(crate) async fn reap(&mut self, grace: Duration) -> Option<i32> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                tracing::warn!("failed to wait for process: {}", e);
                None
            }
            Err(_) => {
                let _ = self.child.kill().await;
                None
            }
        }
    }

    /// Captured stderr tail, lossily decoded; empty once taken
    ///
    /// Waits (bounded) for the drain to reach end of stream first, so call it
    /// after the process has exited.
    pub async fn read_stderr(&mut self) -> String {
        if let Some(drain) = self.stderr_drain.take() {
            let _ = tokio::time::timeout(STDERR_READ_TIMEOUT, drain).await;
        }
        let buffer = match self.stderr_tail.lock() {
            Ok(mut tail) => std::mem::take(&mut *tail),
            Err(_) => Vec::new(),
        };
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// SIGTERM, then kill after `grace`
    pub async fn terminate(&mut self, grace: Duration) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        self.stdin.take();

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        }

        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            tracing::warn!("process {:?} ignored SIGTERM, killing", self.child.id());
            let _ = self.child.kill().await;
        }
    }
}

// ============================================================================
// Runtime status
// ============================================================================

/// Supervisor-owned record for one service
#[derive(Debug)]
pub struct RuntimeStatus {
    pub name: String,
    pub mode: RunMode,
    pub command: Option<Vec<String>>,
    pub process: Option<ServiceProcess>,
    pub state: ServiceState,
    pub ready: bool,
    pub restart_count: u32,
    pub warning: Option<String>,
    pub error: Option<String>,
}

impl RuntimeStatus {
    pub fn new(name: impl Into<String>, mode: RunMode) -> Self {
        Self {
            name: name.into(),
            mode,
            command: None,
            process: None,
            state: ServiceState::Pending,
            ready: false,
            restart_count: 0,
            warning: None,
            error: None,
        }
    }

    /// Handle present and no error recorded
    pub fn started(&self) -> bool {
        self.process.is_some() && self.error.is_none()
    }

    pub(crate) fn fail_start(&mut self, warning: Option<String>, error: String) {
        self.process = None;
        self.ready = false;
        self.state = ServiceState::StartFailed;
        self.warning = warning;
        self.error = Some(error);
    }

    /// Clear the handle after the process is confirmed dead
    pub(crate) fn mark_stopped(&mut self, warning: &str) {
        self.process = None;
        self.ready = false;
        self.state = ServiceState::Stopped;
        self.warning = Some(warning.to_string());
        self.error = Some(warning.to_string());
    }

    /// Adopt a relaunch result; the restart counter stays with this record
    pub(crate) fn replace_with(&mut self, replacement: RuntimeStatus) {
        self.command = replacement.command;
        self.process = replacement.process;
        self.state = replacement.state;
        self.ready = replacement.ready;
        self.warning = replacement.warning;
        self.error = replacement.error;
    }
}
