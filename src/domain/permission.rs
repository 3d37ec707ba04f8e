use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PermissionRequestId, SessionId};

/// Closed set of decisions a permission request may receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny,
    AllowWithModifiedInput { modified_input: serde_json::Value },
}

/// Closed set of suggestion kinds the driver may attach to a request, e.g.
/// "always allow this tool" or "switch to acceptEdits".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PermissionSuggestion {
    SetPermissionMode { mode: super::PermissionMode },
    AddAllowedTool { tool_name: String },
    /// `{type: extend_suggestion_rule, match, effect}` (§9): adds a
    /// standing auto-decision rule to the session so that future tool-uses
    /// matching `rule_match` resolve as `effect` without blocking on the
    /// user again.
    ExtendSuggestionRule { rule_match: SuggestionRuleMatch, effect: PermissionDecision },
}

/// What a `SuggestionRule` matches against on a later tool-use. Only
/// tool-name matching is named by the spec's directive shape; this is the
/// smallest closed set that expresses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum SuggestionRuleMatch {
    ToolName { tool_name: String },
}

impl SuggestionRuleMatch {
    fn matches_tool(&self, tool_name: &str) -> bool {
        match self {
            SuggestionRuleMatch::ToolName { tool_name: t } => t == tool_name,
        }
    }
}

/// A standing rule applied atomically from a `PermissionResponse`'s
/// `extend_suggestion_rule` suggestion (§9), consulted by the permission
/// mediator before it raises a new blocking request for a matching tool-use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionRule {
    pub rule_match: SuggestionRuleMatch,
    pub effect: PermissionDecision,
}

impl SuggestionRule {
    /// The decision this rule applies to `tool_name`, if it matches.
    pub fn effect_for(&self, tool_name: &str) -> Option<PermissionDecision> {
        self.rule_match.matches_tool(tool_name).then(|| self.effect.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Responder {
    User,
    AutoRule,
    Synthetic,
}

/// A live or resolved permission prompt raised by a tool-use (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: PermissionRequestId,
    pub session_id: SessionId,
    pub tool_use_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub suggestions: Vec<PermissionSuggestion>,
    pub created_at: DateTime<Utc>,
    pub decision: Option<PermissionDecision>,
    pub responder: Option<Responder>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PermissionRequest {
    pub fn new(
        session_id: SessionId,
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: serde_json::Value,
        suggestions: Vec<PermissionSuggestion>,
    ) -> Self {
        Self {
            id: PermissionRequestId::new(),
            session_id,
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
            tool_input,
            suggestions,
            created_at: Utc::now(),
            decision: None,
            responder: None,
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.decision.is_some()
    }

    pub fn resolve(&mut self, decision: PermissionDecision, responder: Responder) {
        self.decision = Some(decision);
        self.responder = Some(responder);
        self.resolved_at = Some(Utc::now());
    }
}
