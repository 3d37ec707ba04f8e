use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{QueueItemId, QueueItemStatus, SessionId};

/// One entry in a session's event log (§4.1). `seq` is assigned at append
/// time and is monotonic per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: SessionId,
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

/// Closed set of event kinds a session's log may contain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    UserInput {
        body: String,
        attachments: Vec<String>,
        origin: InputOrigin,
    },
    AssistantText {
        text: String,
    },
    AssistantThinking {
        text: String,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        output: serde_json::Value,
        is_error: bool,
        synthetic: bool,
    },
    PermissionRequest {
        request_id: String,
        tool_use_id: String,
    },
    PermissionResponse {
        request_id: String,
        decision: super::PermissionDecision,
    },
    SystemNotice {
        text: String,
    },
    StateChange {
        from: String,
        to: String,
    },
    CompactionMarker {
        summary: String,
    },
    /// A queue item changed status or position (enqueue, cancel, reorder,
    /// dispatch-to-running, completion) — the session stream's only signal
    /// of queue state short of re-polling `list_queue` (§4.4).
    QueueUpdate {
        queue_item_id: QueueItemId,
        status: QueueItemStatus,
    },
}

/// Where a queued user-input originated, carried through to the event so
/// replay can distinguish a human prompt from a comm or a scheduled firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputOrigin {
    User,
    Comm,
    Scheduled,
}
