use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PermissionRequestId;

/// Status of a tool-call projection. Exactly one terminal status is ever
/// reached (`completed`, `cancelled`, `error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    PermissionRequired,
    Executing,
    Completed,
    Cancelled,
    Error,
}

impl ToolCallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ToolCallStatus::Completed | ToolCallStatus::Cancelled | ToolCallStatus::Error
        )
    }
}

/// Derived projection of a tool-use/tool-result pair, keyed by `tool_use_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_use_id: String,
    pub name: String,
    pub input: serde_json::Value,
    pub status: ToolCallStatus,
    pub permission_request_id: Option<PermissionRequestId>,
    pub result: Option<serde_json::Value>,
    pub is_error: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ToolCall {
    pub fn new(tool_use_id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            name: name.into(),
            input,
            status: ToolCallStatus::Pending,
            permission_request_id: None,
            result: None,
            is_error: false,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}
