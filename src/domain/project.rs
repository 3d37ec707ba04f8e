use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ProjectId, SessionId};

/// A project groups sessions under one working directory and ordering.
///
/// A legion is a project with `is_legion = true`: its sessions may spawn
/// children and exchange comms (§4.5, §4.6). A non-legion project is just a
/// flat list of independent sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub working_directory: PathBuf,
    /// Dense rank among sibling projects; used for stable ordering in listings.
    pub rank: u32,
    pub expanded: bool,
    pub is_legion: bool,
    pub child_session_ids: Vec<SessionId>,
    pub max_concurrent_minions: usize,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(
        name: impl Into<String>,
        working_directory: PathBuf,
        rank: u32,
        is_legion: bool,
        max_concurrent_minions: usize,
    ) -> Self {
        Self {
            id: ProjectId::new(),
            name: name.into(),
            working_directory,
            rank,
            expanded: true,
            is_legion,
            child_session_ids: Vec::new(),
            max_concurrent_minions,
            created_at: Utc::now(),
        }
    }
}
