//! Exec protocol with the agent runtime.
//!
//! Launch parameters go in as a single JSON document on stdin; the runtime
//! answers with newline-delimited JSON events on stdout. Credentials travel
//! only through stdin, never as process arguments or `-e` flags, so they
//! cannot be read back from `inspect` or the host process table.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::context::ToolConfig;
use crate::credentials::CredentialSet;
use crate::policy::ExecutionMode;

/// Exit code of a process killed by SIGKILL; inside a memory-limited
/// container this is the OOM killer.
pub const EXIT_OOM_KILLED: i32 = 137;

/// Exit code of the entrypoint when the session id fails validation.
pub const EXIT_INVALID_IDENTIFIER: i32 = 64;

/// Capacity of the per-exec event channel.
const EVENT_BUFFER: usize = 64;

/// Document written to the agent runtime's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchParams {
    pub working_dir: Option<String>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    pub trust_level: ExecutionMode,
    pub credentials: CredentialSet,
    pub tool_config: ToolConfig,
    pub payload: serde_json::Value,
}

/// One event read from the agent runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecEvent {
    /// Streamed output text
    Delta { text: String },
    ToolCall {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    Error {
        message: String,
        /// The same request may be retried against the same container
        #[serde(default)]
        retriable: bool,
    },
    /// Final event of a successful run
    Done {
        #[serde(default)]
        result: serde_json::Value,
    },
    /// Non-JSON output line, passed through for diagnostics
    Log { line: String },
}

/// Events of one exec, in order. Dropping the receiver cancels the exec.
pub type EventStream = mpsc::Receiver<ExecEvent>;

/// Parses one stdout line. Blank lines are skipped; anything that is not
/// a known event becomes `ExecEvent::Log`.
pub fn parse_event_line(line: &str) -> Option<ExecEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<ExecEvent>(trimmed) {
        Ok(event) => Some(event),
        Err(_) => Some(ExecEvent::Log {
            line: trimmed.to_string(),
        }),
    }
}

/// What a command looks like once it has to run somewhere.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    /// Non-secret environment only
    pub env: Vec<(String, String)>,
    pub stdin: Vec<u8>,
    /// Set when the argv records its pid under this id, so the process
    /// tree can be killed where it runs
    pub exec_id: Option<String>,
}

/// A running process: stdout lines, exit code, and a kill switch.
pub struct ExecProcess {
    pub lines: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<Option<i32>>,
    kill: Option<oneshot::Sender<()>>,
}

impl ExecProcess {
    pub fn new(
        lines: mpsc::Receiver<String>,
        exit: oneshot::Receiver<Option<i32>>,
        kill: oneshot::Sender<()>,
    ) -> Self {
        Self {
            lines,
            exit,
            kill: Some(kill),
        }
    }

    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// How an exec ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Killed for memory; routed to crash backoff
    OomKilled,
    /// The entrypoint rejected the session id; fatal
    InvalidIdentifier,
    /// Timeout or lost process; retriable
    Interrupted,
    Failed(i32),
}

impl ExitClass {
    pub fn from_exit(code: Option<i32>, timed_out: bool) -> Self {
        if timed_out {
            return ExitClass::Interrupted;
        }
        match code {
            Some(0) => ExitClass::Success,
            Some(EXIT_OOM_KILLED) => ExitClass::OomKilled,
            Some(EXIT_INVALID_IDENTIFIER) => ExitClass::InvalidIdentifier,
            Some(code) => ExitClass::Failed(code),
            None => ExitClass::Interrupted,
        }
    }

    /// Terminal error event for this class, if any.
    pub fn error_event(self, timeout: Duration) -> Option<ExecEvent> {
        let (message, retriable) = match self {
            ExitClass::Success => return None,
            ExitClass::OomKilled => (
                "agent runtime was killed for exceeding its memory limit".to_string(),
                true,
            ),
            ExitClass::InvalidIdentifier => ("invalid session identifier".to_string(), false),
            ExitClass::Interrupted => (
                format!(
                    "exec interrupted (timeout {}s or disconnect)",
                    timeout.as_secs()
                ),
                true,
            ),
            ExitClass::Failed(code) => (format!("agent runtime exited with code {code}"), false),
        };
        Some(ExecEvent::Error { message, retriable })
    }
}

/// Spawns `cmd`, feeds `stdin` and streams stdout lines. Stderr is logged
/// at debug level.
pub fn spawn_process(mut cmd: Command, stdin: Vec<u8>) -> std::io::Result<ExecProcess> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    if let Some(mut child_stdin) = child.stdin.take() {
        tokio::spawn(async move {
            if let Err(e) = child_stdin.write_all(&stdin).await {
                warn!("Failed to write launch parameters: {e}");
            }
            // Dropping closes stdin so the runtime sees EOF
        });
    }

    let (line_tx, line_rx) = mpsc::channel(EVENT_BUFFER);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("exec stderr: {line}");
            }
        });
    }

    let (exit_tx, exit_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let code = tokio::select! {
            status = child.wait() => status.ok().and_then(exit_code),
            Ok(()) = kill_rx => {
                let _ = child.kill().await;
                None
            }
        };
        let _ = exit_tx.send(code);
    });

    Ok(ExecProcess::new(line_rx, exit_rx, kill_tx))
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|sig| 128 + sig))
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

/// Forwards parsed events from `process` into `tx` until the process ends,
/// the deadline passes, or the receiver is dropped. Returns how it ended.
///
/// On timeout or cancellation the process is killed before returning.
pub async fn pump_events(
    mut process: ExecProcess,
    timeout: Duration,
    tx: &mpsc::Sender<ExecEvent>,
) -> ExitClass {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut timed_out = false;

    loop {
        tokio::select! {
            line = process.lines.recv() => match line {
                Some(line) => {
                    if let Some(event) = parse_event_line(&line) {
                        if tx.send(event).await.is_err() {
                            debug!("Event receiver dropped, cancelling exec");
                            process.kill();
                            timed_out = true;
                            break;
                        }
                    }
                }
                None => break,
            },
            _ = &mut deadline => {
                warn!("Exec timed out after {}s", timeout.as_secs());
                process.kill();
                timed_out = true;
                break;
            }
            _ = tx.closed() => {
                debug!("Event receiver dropped, cancelling exec");
                process.kill();
                timed_out = true;
                break;
            }
        }
    }

    let code = process.exit.await.ok().flatten();
    ExitClass::from_exit(code, timed_out)
}

/// Creates the channel pair for one exec's events.
pub fn event_channel() -> (mpsc::Sender<ExecEvent>, EventStream) {
    mpsc::channel(EVENT_BUFFER)
}
