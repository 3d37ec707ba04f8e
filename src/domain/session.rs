use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ProjectId, SessionId, SuggestionRule};

/// Permission mode governing how eagerly the driver may act without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Every tool-use requires an explicit decision.
    Default,
    /// File edits are auto-accepted; other tools still prompt.
    AcceptEdits,
    /// Nothing prompts; everything is auto-allowed.
    BypassPermissions,
    /// A fixed plan is being built; mutating tools are rejected until the
    /// plan is accepted (which implicitly switches to `AcceptEdits`, §4.4).
    Plan,
}

/// The session lifecycle state machine (§4.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Starting,
    /// `processing` tracks whether the driver currently has an in-flight
    /// turn; `paused_on` holds the tool-use id blocking on a permission
    /// decision, if any.
    Active {
        processing: bool,
        paused_on: Option<String>,
    },
    Terminating,
    Terminated {
        disposed: bool,
    },
    Error {
        reason: String,
    },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated { .. } | SessionState::Error { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, SessionState::Active { paused_on: Some(_), .. })
    }
}

/// Derived convenience status combining state and processing flag, for UI
/// consumers that don't want to pattern-match the full state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveStatus {
    Created,
    Starting,
    Idle,
    Working,
    WaitingOnUser,
    Terminating,
    Terminated,
    Disposed,
    Error,
}

impl SessionState {
    pub fn effective_status(&self) -> EffectiveStatus {
        match self {
            SessionState::Created => EffectiveStatus::Created,
            SessionState::Starting => EffectiveStatus::Starting,
            SessionState::Active { processing: false, paused_on: None } => EffectiveStatus::Idle,
            SessionState::Active { paused_on: Some(_), .. } => EffectiveStatus::WaitingOnUser,
            SessionState::Active { processing: true, paused_on: None } => EffectiveStatus::Working,
            SessionState::Terminating => EffectiveStatus::Terminating,
            SessionState::Terminated { disposed: false } => EffectiveStatus::Terminated,
            SessionState::Terminated { disposed: true } => EffectiveStatus::Disposed,
            SessionState::Error { .. } => EffectiveStatus::Error,
        }
    }
}

/// A minion: one conversation with one external agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub project_id: ProjectId,
    pub parent_id: Option<SessionId>,
    pub child_ids: Vec<SessionId>,
    /// Unique within the owning legion; single token, no whitespace.
    pub name: String,
    pub role: Option<String>,
    pub model: String,
    pub initial_permission_mode: PermissionMode,
    pub current_permission_mode: PermissionMode,
    pub allowed_tools: HashSet<String>,
    pub system_prompt_append: Option<String>,
    pub agent_command: Vec<String>,
    /// Standing auto-decision rules added via `extend_suggestion_rule`
    /// permission suggestions (§9), consulted before a new tool-use of a
    /// matching name blocks on the user again.
    pub suggestion_rules: Vec<SuggestionRule>,
    pub state: SessionState,
    pub latest_message_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: ProjectId,
        parent_id: Option<SessionId>,
        name: impl Into<String>,
        role: Option<String>,
        model: impl Into<String>,
        permission_mode: PermissionMode,
        allowed_tools: HashSet<String>,
        system_prompt_append: Option<String>,
        agent_command: Vec<String>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            project_id,
            parent_id,
            child_ids: Vec::new(),
            name: name.into(),
            role,
            model: model.into(),
            initial_permission_mode: permission_mode,
            current_permission_mode: permission_mode,
            allowed_tools,
            system_prompt_append,
            agent_command,
            suggestion_rules: Vec::new(),
            state: SessionState::Created,
            latest_message_summary: None,
            created_at: Utc::now(),
            started_at: None,
            last_active_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_active_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_status_prioritises_pause_over_processing() {
        let s = SessionState::Active { processing: true, paused_on: Some("tu_1".into()) };
        assert_eq!(s.effective_status(), EffectiveStatus::WaitingOnUser);
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Terminated { disposed: false }.is_terminal());
        assert!(SessionState::Error { reason: "x".into() }.is_terminal());
        assert!(!SessionState::Active { processing: false, paused_on: None }.is_terminal());
    }
}
