use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PermissionMode, TemplateId};

/// An immutable, reusable seed for a minion. Edits create a new version
/// referenced by new sessions only — existing sessions keep the template
/// they were created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub default_permission_mode: PermissionMode,
    pub allowed_tools: HashSet<String>,
    pub model: String,
    pub initialization_context: String,
    /// The external agent binary (and fixed args) sessions created from this
    /// template spawn, e.g. `["claude-code-agent"]` or `["codex-agent",
    /// "--stdio"]`. The driver is agnostic to which binary this is as long
    /// as it speaks the shared newline-delimited JSON event protocol.
    pub agent_command: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn new(
        name: impl Into<String>,
        default_permission_mode: PermissionMode,
        allowed_tools: HashSet<String>,
        model: impl Into<String>,
        initialization_context: impl Into<String>,
        agent_command: Vec<String>,
    ) -> Self {
        Self {
            id: TemplateId::new(),
            name: name.into(),
            default_permission_mode,
            allowed_tools,
            model: model.into(),
            initialization_context: initialization_context.into(),
            agent_command,
            created_at: Utc::now(),
        }
    }

    /// A new version: same id-space semantics (a new identity), copying the
    /// fields forward so the catalogue entry can be replaced atomically.
    pub fn new_version(&self, initialization_context: impl Into<String>) -> Self {
        Self {
            id: TemplateId::new(),
            name: self.name.clone(),
            default_permission_mode: self.default_permission_mode,
            allowed_tools: self.allowed_tools.clone(),
            model: self.model.clone(),
            initialization_context: initialization_context.into(),
            agent_command: self.agent_command.clone(),
            created_at: Utc::now(),
        }
    }
}
