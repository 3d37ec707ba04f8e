//! Subprocess-backed `AgentDriver`: owns one child process, talking
//! newline-delimited JSON over its stdin/stdout — the same record shape the
//! Event Log persists, so the driver's parser and the log's shape stay
//! structurally close.
//!
//! Runs the child as a persistent bidirectional stream rather than a
//! one-shot exec-to-completion: waiting for full process exit before
//! returning output cannot support live tool-use/permission-request event
//! streaming.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use super::{AgentDriver, DriverEvent, DriverStartParams};
use crate::domain::PermissionDecision;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundCommand {
    UserInput { body: String, attachments: Vec<String> },
    PermissionResponse { request_id: String, decision: PermissionDecision },
    SetMode { mode: crate::domain::PermissionMode },
    Interrupt,
    Stop,
}

struct ChildHandle {
    child: Child,
    stdin_tx: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct ProcessAgentDriver {
    child: Mutex<Option<ChildHandle>>,
    events_tx: mpsc::Sender<DriverEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DriverEvent>>>,
    stop_grace: Duration,
}

impl ProcessAgentDriver {
    pub fn new(stop_grace: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(256);
        Arc::new(Self {
            child: Mutex::new(None),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            stop_grace,
        })
    }

    async fn send_command(&self, cmd: OutboundCommand) -> CoreResult<()> {
        let guard = self.child.lock().await;
        let Some(handle) = guard.as_ref() else {
            return Err(CoreError::InvalidState("driver has no running process".into()));
        };
        let mut line = serde_json::to_vec(&cmd)?;
        line.push(b'\n');
        handle
            .stdin_tx
            .send(line)
            .map_err(|_| CoreError::Unavailable("driver stdin writer task gone".into()))?;
        Ok(())
    }
}

#[async_trait]
impl AgentDriver for ProcessAgentDriver {
    async fn start(&self, params: DriverStartParams) -> CoreResult<()> {
        let mut cmd_parts = params.command.into_iter();
        let program = cmd_parts
            .next()
            .ok_or_else(|| CoreError::BadRequest("driver command must not be empty".into()))?;

        let mut command = Command::new(program);
        command
            .args(cmd_parts)
            .current_dir(&params.working_directory)
            .env("LEGION_SESSION_ID", &params.session_id)
            .env("LEGION_MODEL", &params.model)
            .env("LEGION_PERMISSION_MODE", format!("{:?}", params.permission_mode))
            .env("LEGION_ALLOWED_TOOLS", params.allowed_tools.join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(extra) = &params.system_prompt_append {
            command.env("LEGION_SYSTEM_PROMPT_APPEND", extra);
        }

        let mut child = command
            .spawn()
            .map_err(|e| CoreError::Unavailable(format!("failed to spawn agent process: {e}")))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        if let Some(parent) = params.debug_log_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let debug_log = Arc::new(Mutex::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&params.debug_log_path)
                .await
                .ok(),
        ));

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(&line).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let events_tx = self.events_tx.clone();
        let session_id = params.session_id.clone();
        let stdout_debug_log = debug_log.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        write_debug_line(&stdout_debug_log, "stdout", &line).await;
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<DriverEvent>(&line) {
                            Ok(event) => {
                                if events_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(session_id = %session_id, error = %e, line = %line, "unparsable driver event line");
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = events_tx
                            .send(DriverEvent::DriverDown { reason: "stdout closed".into() })
                            .await;
                        break;
                    }
                    Err(e) => {
                        let _ = events_tx
                            .send(DriverEvent::DriverDown { reason: format!("stdout read error: {e}") })
                            .await;
                        break;
                    }
                }
            }
        });

        let session_id_err = params.session_id.clone();
        let stderr_debug_log = debug_log.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                write_debug_line(&stderr_debug_log, "stderr", &line).await;
                tracing::debug!(session_id = %session_id_err, "driver stderr: {line}");
            }
        });

        let mut guard = self.child.lock().await;
        *guard = Some(ChildHandle { child, stdin_tx });
        Ok(())
    }

    async fn send(&self, user_input: String, attachments: Vec<String>) -> CoreResult<()> {
        self.send_command(OutboundCommand::UserInput { body: user_input, attachments }).await
    }

    async fn respond_to_permission(
        &self,
        request_id: String,
        decision: PermissionDecision,
    ) -> CoreResult<()> {
        self.send_command(OutboundCommand::PermissionResponse { request_id, decision }).await
    }

    async fn set_mode(&self, mode: crate::domain::PermissionMode) -> CoreResult<()> {
        self.send_command(OutboundCommand::SetMode { mode }).await
    }

    async fn interrupt(&self) -> CoreResult<()> {
        self.send_command(OutboundCommand::Interrupt).await
    }

    async fn stop(&self) -> CoreResult<()> {
        let _ = self.send_command(OutboundCommand::Stop).await;

        let mut guard = self.child.lock().await;
        let Some(mut handle) = guard.take() else {
            return Ok(());
        };
        drop(guard);

        graceful_signal(&handle.child);

        let waited = tokio::time::timeout(self.stop_grace, handle.child.wait()).await;
        if waited.is_err() {
            tracing::warn!("agent process did not exit within grace period, killing");
            let _ = handle.child.kill().await;
            let _ = handle.child.wait().await;
        }
        Ok(())
    }

    fn take_events(&self) -> mpsc::Receiver<DriverEvent> {
        self.events_rx
            .try_lock()
            .expect("take_events called concurrently")
            .take()
            .expect("take_events called more than once")
    }
}

/// Mirror one raw line from the child's stdout/stderr into the per-session
/// debug log, best-effort — a write failure here must never affect the
/// event stream.
async fn write_debug_line(log: &Mutex<Option<tokio::fs::File>>, stream: &str, line: &str) {
    let mut guard = log.lock().await;
    if let Some(file) = guard.as_mut() {
        let entry = format!("[{stream}] {line}\n");
        let _ = file.write_all(entry.as_bytes()).await;
    }
}

#[cfg(unix)]
fn graceful_signal(child: &Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn graceful_signal(_child: &Child) {}
