//! Core data model: the types shared by every component, independent of how
//! any one of them is implemented.

pub mod comm;
pub mod event;
pub mod permission;
pub mod project;
pub mod queue;
pub mod schedule;
pub mod session;
pub mod template;
pub mod tool_call;

pub use comm::{Comm, CommDeliveryStatus, CommKind, CommPriority, CommTarget};
pub use event::{Event, EventKind, InputOrigin};
pub use permission::{
    PermissionDecision, PermissionRequest, PermissionSuggestion, Responder, SuggestionRule, SuggestionRuleMatch,
};
pub use project::Project;
pub use queue::{QueueItem, QueueItemStatus};
pub use schedule::{Schedule, ScheduleExecution, ScheduleOutcome, ScheduleStatus};
pub use session::{EffectiveStatus, PermissionMode, Session, SessionState};
pub use template::Template;
pub use tool_call::{ToolCall, ToolCallStatus};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

opaque_id!(ProjectId);
opaque_id!(SessionId);
opaque_id!(LegionId);
opaque_id!(ScheduleId);
opaque_id!(TemplateId);
opaque_id!(PermissionRequestId);
opaque_id!(QueueItemId);
opaque_id!(CommId);

/// A legion is a project with `is_legion = true` (§2 GLOSSARY); the two id
/// spaces share the same underlying uuid so a project's legion identity is
/// just a typed reinterpretation of its project id, not a separate entity.
impl From<ProjectId> for LegionId {
    fn from(p: ProjectId) -> Self {
        LegionId(p.0)
    }
}

impl From<LegionId> for ProjectId {
    fn from(l: LegionId) -> Self {
        ProjectId(l.0)
    }
}
