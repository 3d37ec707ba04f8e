use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::QueueItemId;
use super::event::InputOrigin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Running,
    Done,
    Cancelled,
}

/// An entry on a session's pending-input queue (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub body: String,
    pub attachments: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub origin: InputOrigin,
    pub arrived_at: DateTime<Utc>,
    pub status: QueueItemStatus,
}

impl QueueItem {
    pub fn new(
        body: impl Into<String>,
        attachments: Vec<String>,
        metadata: HashMap<String, serde_json::Value>,
        origin: InputOrigin,
    ) -> Self {
        Self {
            id: QueueItemId::new(),
            body: body.into(),
            attachments,
            metadata,
            origin,
            arrived_at: Utc::now(),
            status: QueueItemStatus::Pending,
        }
    }
}
