use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CommId, LegionId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommKind {
    Task,
    Question,
    Report,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommPriority {
    None,
    Pivot,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommDeliveryStatus {
    Delivered,
    NotDelivered,
    SurfacedOnly,
}

/// A recipient of a comm: a named minion, a broadcast fan-out, or the
/// external user/orchestrator (observed only, never enqueued as input).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommTarget {
    Minion { session_id: SessionId },
    Broadcast,
    External,
}

/// A structured inter-minion message (§4.5), totally ordered within its legion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comm {
    pub id: CommId,
    pub legion_id: LegionId,
    pub sender_id: SessionId,
    pub target: CommTarget,
    pub kind: CommKind,
    pub summary: String,
    pub body: String,
    pub priority: CommPriority,
    pub created_at: DateTime<Utc>,
    pub legion_seq: u64,
    pub delivery_status: CommDeliveryStatus,
}
