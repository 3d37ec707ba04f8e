use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LegionId, ScheduleId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Ok,
    Timeout,
    Error,
    TargetUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<ScheduleOutcome>,
    pub error: Option<String>,
    pub attempt: u32,
}

/// A cron-driven recurring prompt dispatch (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub legion_id: LegionId,
    pub target_session_id: SessionId,
    pub cron_expression: String,
    pub prompt_template: String,
    pub reset_session: bool,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub status: ScheduleStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub history: Vec<ScheduleExecution>,
    pub history_limit: usize,
}

impl Schedule {
    pub fn push_history(&mut self, entry: ScheduleExecution) {
        self.history.push(entry);
        while self.history.len() > self.history_limit {
            self.history.remove(0);
        }
    }
}
