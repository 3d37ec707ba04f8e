//! Durable metadata for projects, sessions, templates, schedules.
//!
//! Each entity is one JSON file written via write-temp-then-rename for
//! atomicity. A process-wide coarse lock serialises mutations; reads take a
//! snapshot (a cloned in-memory map) so they never block on a writer, the
//! same `Arc<RwLock<HashMap<...>>>` shape as an in-memory cache but backed
//! by disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::{Project, ProjectId, Schedule, ScheduleId, Session, SessionId, Template, TemplateId};
use crate::error::{CoreError, CoreResult};

/// A typed, file-backed table of one entity kind.
pub struct Table<K, V> {
    dir: PathBuf,
    cache: RwLock<HashMap<K, V>>,
}

impl<K, V> Table<K, V>
where
    K: std::hash::Hash + Eq + Clone + std::fmt::Display + std::str::FromStr,
    V: Serialize + DeserializeOwned + Clone,
{
    fn new(dir: PathBuf) -> CoreResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let mut cache = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match load_entity::<V>(&path) {
                Ok(value) => {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        if let Ok(key) = stem.parse::<K>() {
                            cache.insert(key, value);
                            continue;
                        }
                    }
                    tracing::warn!(path = %path.display(), "dropping entity with unparsable id");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding partially written entity on startup");
                }
            }
        }
        Ok(Self { dir, cache: RwLock::new(cache) })
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.cache.read().expect("table lock poisoned").get(key).cloned()
    }

    pub fn list(&self) -> Vec<V> {
        self.cache.read().expect("table lock poisoned").values().cloned().collect()
    }

    pub fn put(&self, key: K, value: V) -> CoreResult<()> {
        let path = self.dir.join(format!("{key}"));
        write_atomic(&path, &value)?;
        self.cache.write().expect("table lock poisoned").insert(key, value);
        Ok(())
    }

    /// Atomic read-modify-write: holds the table's write lock across the
    /// whole operation so two concurrent patches of the same entity can't
    /// race — one reads a value, mutates, and writes back while the other
    /// is blocked at the lock, rather than both reading the old value and
    /// one silently clobbering the other's write (§4.2's optimistic-version
    /// check requirement, realised here via the same coarse lock the module
    /// doc already names instead of a separate version counter).
    pub fn update<F>(&self, key: &K, f: F) -> CoreResult<V>
    where
        F: FnOnce(&mut V) -> CoreResult<()>,
    {
        let mut cache = self.cache.write().expect("table lock poisoned");
        let mut value = cache.get(key).cloned().ok_or_else(|| CoreError::NotFound(format!("{key}")))?;
        f(&mut value)?;
        let path = self.dir.join(format!("{key}"));
        write_atomic(&path, &value)?;
        cache.insert(key.clone(), value.clone());
        Ok(value)
    }

    pub fn delete(&self, key: &K) -> CoreResult<()> {
        let path = self.dir.join(format!("{key}"));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.cache.write().expect("table lock poisoned").remove(key);
        Ok(())
    }
}

fn load_entity<V: DeserializeOwned>(path: &Path) -> CoreResult<V> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_atomic<V: Serialize>(path: &Path, value: &V) -> CoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// The full set of persisted tables. One `StateStore` per process, per §9
/// ("single State Store singleton").
pub struct StateStore {
    pub projects: Table<ProjectId, Project>,
    pub sessions: Table<SessionId, Session>,
    pub templates: Table<TemplateId, Template>,
    pub schedules: Table<ScheduleId, Schedule>,
}

impl StateStore {
    /// Open (or create) a state store rooted at `data_dir`, running the
    /// startup sweep: unresolved permission requests are handled by the
    /// Session Runtime on restore, but any session left in a non-terminal
    /// state from a previous process is forced to `terminated` here since no
    /// driver is alive to own it.
    pub fn open(data_dir: impl Into<PathBuf>) -> CoreResult<Arc<Self>> {
        let data_dir = data_dir.into();
        let projects = Table::new(data_dir.join("projects"))?;
        let mut sessions = Table::new(data_dir.join("sessions"))?;
        let templates = Table::new(data_dir.join("templates"))?;
        let schedules = Table::new(data_dir.join("schedules"))?;

        sweep_nonterminal_sessions(&mut sessions)?;

        Ok(Arc::new(Self { projects, sessions, templates, schedules }))
    }

    pub fn list_children(&self, project_id: ProjectId) -> Vec<Session> {
        self.sessions
            .list()
            .into_iter()
            .filter(|s| s.project_id == project_id)
            .collect()
    }

    pub fn list_descendants(&self, root: SessionId) -> Vec<Session> {
        let all = self.sessions.list();
        let mut out = Vec::new();
        let mut frontier = vec![root];
        while let Some(id) = frontier.pop() {
            for s in &all {
                if s.parent_id == Some(id) {
                    frontier.push(s.id);
                    out.push(s.clone());
                }
            }
        }
        out
    }

    pub fn require_project(&self, id: ProjectId) -> CoreResult<Project> {
        self.projects.get(&id).ok_or_else(|| CoreError::NotFound(format!("project {id}")))
    }

    pub fn require_session(&self, id: SessionId) -> CoreResult<Session> {
        self.sessions.get(&id).ok_or_else(|| CoreError::NotFound(format!("session {id}")))
    }

    pub fn require_schedule(&self, id: ScheduleId) -> CoreResult<Schedule> {
        self.schedules.get(&id).ok_or_else(|| CoreError::NotFound(format!("schedule {id}")))
    }

    pub fn require_template(&self, id: TemplateId) -> CoreResult<Template> {
        self.templates.get(&id).ok_or_else(|| CoreError::NotFound(format!("template {id}")))
    }
}

fn sweep_nonterminal_sessions(sessions: &mut Table<SessionId, Session>) -> CoreResult<()> {
    use crate::domain::SessionState;
    let stuck: Vec<Session> = sessions
        .list()
        .into_iter()
        .filter(|s| !s.state.is_terminal())
        .collect();
    for mut s in stuck {
        tracing::info!(session_id = %s.id, "startup sweep: forcing non-terminal session to terminated");
        s.state = SessionState::Terminated { disposed: false };
        sessions.put(s.id, s)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn put_get_list_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let project = Project::new("demo", PathBuf::from("/tmp"), 0, false, 10);
        store.projects.put(project.id, project.clone()).unwrap();
        assert_eq!(store.projects.get(&project.id).unwrap().name, "demo");
        assert_eq!(store.projects.list().len(), 1);
        store.projects.delete(&project.id).unwrap();
        assert!(store.projects.get(&project.id).is_none());
    }

    #[test]
    fn reopen_loads_persisted_entities() {
        let dir = tempfile::tempdir().unwrap();
        let project_id;
        {
            let store = StateStore::open(dir.path()).unwrap();
            let project = Project::new("demo", PathBuf::from("/tmp"), 0, false, 10);
            project_id = project.id;
            store.projects.put(project.id, project).unwrap();
        }
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.projects.get(&project_id).is_some());
    }

    #[test]
    fn startup_sweep_terminates_stuck_sessions() {
        use crate::domain::{PermissionMode, SessionState};
        use std::collections::HashSet;
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new("demo", PathBuf::from("/tmp"), 0, true, 10);
        let mut session = Session::new(
            project.id,
            None,
            "alpha",
            None,
            "claude",
            PermissionMode::Default,
            HashSet::new(),
            None,
            vec!["fake-agent".into()],
        );
        session.state = SessionState::Active { processing: true, paused_on: None };
        {
            let store = StateStore::open(dir.path()).unwrap();
            store.projects.put(project.id, project).unwrap();
            store.sessions.put(session.id, session.clone()).unwrap();
        }
        let store = StateStore::open(dir.path()).unwrap();
        let reloaded = store.sessions.get(&session.id).unwrap();
        assert!(reloaded.state.is_terminal());
    }
}
