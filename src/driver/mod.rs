//! Agent Driver (§4.3): owns one external agent process per session and
//! translates typed requests/responses to and from it.

pub mod fake;
pub mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::PermissionDecision;
use crate::error::CoreResult;

/// Parameters needed to start a driver for one session.
#[derive(Debug, Clone)]
pub struct DriverStartParams {
    pub session_id: String,
    pub working_directory: std::path::PathBuf,
    pub model: String,
    pub system_prompt_append: Option<String>,
    pub allowed_tools: Vec<String>,
    pub permission_mode: crate::domain::PermissionMode,
    /// Binary (and args) to spawn. Selecting which agent binary a template
    /// targets (Claude Code, Codex, a custom script) happens one layer up;
    /// the driver itself is agnostic as long as the child speaks the same
    /// newline-delimited JSON event protocol.
    pub command: Vec<String>,
    /// Where to mirror the child's raw stdout/stderr for postmortem
    /// debugging, alongside the session's event log.
    pub debug_log_path: std::path::PathBuf,
}

/// Typed events the driver surfaces to the Session Runtime, one line of
/// input producing zero or more of these before a terminal `Result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverEvent {
    SystemInit { subtype: String },
    AssistantText { text: String },
    AssistantThinking { text: String },
    ToolUse { tool_use_id: String, name: String, input: serde_json::Value },
    PermissionNeeded {
        tool_use_id: String,
        suggestions: Vec<crate::domain::PermissionSuggestion>,
    },
    ToolResult { tool_use_id: String, output: serde_json::Value, is_error: bool },
    Result { is_error: bool, summary: Option<String> },
    /// The child process exited (expectedly via `stop()` or not). The
    /// Session Runtime decides what, if anything, to do next — the driver
    /// itself never auto-restarts.
    DriverDown { reason: String },
}

/// One external agent process, owned exclusively by its driver (§5).
///
/// `send` and `respond_to_permission` may suspend if the driver is mid-turn;
/// implementations serialise such requests FIFO rather than rejecting them.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn start(&self, params: DriverStartParams) -> CoreResult<()>;
    async fn send(&self, user_input: String, attachments: Vec<String>) -> CoreResult<()>;
    async fn respond_to_permission(
        &self,
        request_id: String,
        decision: PermissionDecision,
    ) -> CoreResult<()>;
    async fn set_mode(&self, mode: crate::domain::PermissionMode) -> CoreResult<()>;
    async fn interrupt(&self) -> CoreResult<()>;
    async fn stop(&self) -> CoreResult<()>;

    /// Take ownership of the event receiver. Called exactly once by the
    /// Session Runtime right after `start` succeeds.
    fn take_events(&self) -> tokio::sync::mpsc::Receiver<DriverEvent>;
}
