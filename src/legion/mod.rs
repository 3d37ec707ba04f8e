//! Legion Coordinator (§4.6): owns the minion hierarchy, spawn/dispose,
//! name uniqueness, and the `max_concurrent_minions` cap.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::domain::{LegionId, PermissionMode, Project, ProjectId, Session, SessionId, Template, TemplateId};
use crate::driver::AgentDriver;
use crate::error::{CoreError, CoreResult};
use crate::event_log::EventLog;
use crate::observer::{LegionNotice, ObserverHub};
use crate::runtime::{self, RuntimeRegistry};
use crate::state_store::StateStore;

pub type DriverFactory = Arc<dyn Fn() -> Arc<dyn AgentDriver> + Send + Sync>;

pub struct LegionCoordinator {
    store: Arc<StateStore>,
    observer: Arc<ObserverHub>,
    runtimes: RuntimeRegistry,
    config: Arc<RuntimeConfig>,
    data_dir: PathBuf,
    driver_factory: DriverFactory,
}

impl LegionCoordinator {
    pub fn new(
        store: Arc<StateStore>,
        observer: Arc<ObserverHub>,
        runtimes: RuntimeRegistry,
        config: Arc<RuntimeConfig>,
        data_dir: PathBuf,
        driver_factory: DriverFactory,
    ) -> Self {
        Self { store, observer, runtimes, config, data_dir, driver_factory }
    }

    fn session_log(&self, session_id: SessionId) -> CoreResult<Arc<EventLog>> {
        let path = self.data_dir.join("sessions").join(session_id.to_string()).join("events");
        let log = Arc::new(EventLog::open(path)?);
        self.observer.register_session_log(session_id, log.clone());
        Ok(log)
    }

    /// Materialise a session from `template` under `project_id` (a legion),
    /// optionally as a child of `parent_id`. Does not start it — the caller
    /// decides when to call `RuntimeHandle::start`.
    pub fn spawn_minion(
        &self,
        project_id: ProjectId,
        parent_id: Option<SessionId>,
        template_id: TemplateId,
        name: String,
        role: Option<String>,
        extra_context: Option<String>,
    ) -> CoreResult<Session> {
        let project = self.store.require_project(project_id)?;
        if !project.is_legion {
            return Err(CoreError::BadRequest("project is not a legion".into()));
        }

        if let Some(pid) = parent_id {
            let parent = self.store.require_session(pid)?;
            if !parent.state.is_active() {
                return Err(CoreError::InvalidState("parent minion is not active".into()));
            }
        }

        if name.split_whitespace().count() != 1 {
            return Err(CoreError::BadRequest("minion name must be a single token with no whitespace".into()));
        }
        let siblings = self.store.list_children(project_id);
        if siblings.iter().any(|s| s.name == name) {
            return Err(CoreError::Conflict(format!("minion name '{name}' already in use in this legion")));
        }

        let live_descendants = siblings.iter().filter(|s| !s.state.is_terminal()).count();
        if live_descendants >= project.max_concurrent_minions {
            return Err(CoreError::Conflict("max_concurrent_minions exceeded for this legion".into()));
        }

        let template = self.store.require_template(template_id)?;
        let mut init_context = template.initialization_context.clone();
        if let Some(extra) = &extra_context {
            init_context.push_str("\n\n");
            init_context.push_str(extra);
        }

        let session = Session::new(
            project_id,
            parent_id,
            name,
            role,
            template.model.clone(),
            template.default_permission_mode,
            template.allowed_tools.clone(),
            Some(init_context),
            template.agent_command.clone(),
        );
        self.store.sessions.put(session.id, session.clone())?;

        if let Some(pid) = parent_id {
            self.store.sessions.update(&pid, |parent| {
                parent.child_ids.push(session.id);
                Ok(())
            })?;
        } else {
            self.store.projects.update(&project_id, |project| {
                project.child_session_ids.push(session.id);
                Ok(())
            })?;
        }

        let log = self.session_log(session.id)?;
        let driver = (self.driver_factory)();
        let handle = runtime::spawn(session.clone(), self.config.clone(), self.store.clone(), log, self.observer.clone(), driver);
        self.runtimes.insert(handle);

        let legion_id: LegionId = project_id.into();
        self.observer.publish_legion_notice(legion_id, LegionNotice::MinionCreated { session_id: session.id });

        Ok(session)
    }

    /// Tear down `session_id` and every descendant beneath it, deepest
    /// first.
    pub async fn dispose_minion(&self, session_id: SessionId, archive_knowledge: bool) -> CoreResult<()> {
        let root = self.store.require_session(session_id)?;
        let legion_id: LegionId = root.project_id.into();
        let mut subtree = self.store.list_descendants(session_id);
        subtree.push(root);
        let depths = depths_from_root(session_id, &subtree);
        subtree.sort_by_key(|s| std::cmp::Reverse(*depths.get(&s.id).unwrap_or(&0)));

        for s in subtree {
            if let Some(handle) = self.runtimes.get(s.id) {
                if archive_knowledge {
                    let _ = handle
                        .enqueue_input(
                            "[legion] archiving final knowledge report before disposal".into(),
                            Vec::new(),
                            Default::default(),
                            crate::domain::InputOrigin::Comm,
                            false,
                        )
                        .await;
                }
                let _ = handle.dispose().await;
                self.runtimes.remove(s.id);
            } else {
                let mut s = s;
                s.state = crate::domain::SessionState::Terminated { disposed: true };
                let _ = self.store.sessions.put(s.id, s);
            }
            self.observer.publish_legion_notice(legion_id, LegionNotice::MinionDisposed { session_id: s.id });
        }
        Ok(())
    }

    pub fn list_minions(&self, project_id: ProjectId) -> CoreResult<Vec<Session>> {
        self.store.require_project(project_id)?;
        Ok(self.store.list_children(project_id))
    }

    pub fn hierarchy(&self, project_id: ProjectId) -> CoreResult<Vec<Session>> {
        self.list_minions(project_id)
    }

    pub async fn halt_all(&self, project_id: ProjectId) -> CoreResult<()> {
        self.store.require_project(project_id)?;
        for s in self.store.list_children(project_id) {
            if let Some(handle) = self.runtimes.get(s.id) {
                let _ = handle.interrupt().await;
                let _ = handle.pause_queue().await;
            }
        }
        Ok(())
    }

    pub async fn resume_all(&self, project_id: ProjectId) -> CoreResult<()> {
        self.store.require_project(project_id)?;
        for s in self.store.list_children(project_id) {
            if let Some(handle) = self.runtimes.get(s.id) {
                let _ = handle.resume_queue().await;
            }
        }
        Ok(())
    }

    pub fn create_template(
        &self,
        name: String,
        default_permission_mode: PermissionMode,
        allowed_tools: std::collections::HashSet<String>,
        model: String,
        initialization_context: String,
        agent_command: Vec<String>,
    ) -> CoreResult<Template> {
        let template = Template::new(name, default_permission_mode, allowed_tools, model, initialization_context, agent_command);
        self.store.templates.put(template.id, template.clone())?;
        Ok(template)
    }
}

/// BFS depth of each session in `subtree` relative to `root`, so the cascade
/// can dispose leaves before their ancestors.
fn depths_from_root(root: SessionId, subtree: &[Session]) -> std::collections::HashMap<SessionId, u32> {
    use std::collections::{HashMap, VecDeque};
    let mut depths = HashMap::new();
    depths.insert(root, 0u32);
    let mut frontier = VecDeque::from([root]);
    while let Some(id) = frontier.pop_front() {
        let d = depths[&id];
        for s in subtree {
            if s.parent_id == Some(id) && !depths.contains_key(&s.id) {
                depths.insert(s.id, d + 1);
                frontier.push_back(s.id);
            }
        }
    }
    depths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeAgentDriver;
    use std::collections::HashSet;

    fn make_coordinator(dir: &std::path::Path) -> (LegionCoordinator, Arc<StateStore>) {
        let store = StateStore::open(dir).unwrap();
        let observer = ObserverHub::new(32);
        let runtimes = RuntimeRegistry::new();
        let config = Arc::new(RuntimeConfig::default());
        let factory: DriverFactory = Arc::new(|| FakeAgentDriver::new().0 as Arc<dyn AgentDriver>);
        let coordinator = LegionCoordinator::new(store.clone(), observer, runtimes, config, dir.to_path_buf(), factory);
        (coordinator, store)
    }

    #[tokio::test]
    async fn spawn_enforces_name_uniqueness_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, store) = make_coordinator(dir.path());
        let project = Project::new("legion", std::path::PathBuf::from("/tmp"), 0, true, 1);
        store.projects.put(project.id, project.clone()).unwrap();
        let template = coordinator
            .create_template("default".into(), PermissionMode::Default, HashSet::new(), "claude".into(), "ctx".into(), vec!["fake".into()])
            .unwrap();

        let first = coordinator
            .spawn_minion(project.id, None, template.id, "alpha".into(), None, None)
            .unwrap();
        assert_eq!(first.name, "alpha");

        let err = coordinator
            .spawn_minion(project.id, None, template.id, "alpha".into(), None, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let err = coordinator
            .spawn_minion(project.id, None, template.id, "beta".into(), None, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn dispose_cascades_to_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, store) = make_coordinator(dir.path());
        let project = Project::new("legion", std::path::PathBuf::from("/tmp"), 0, true, 10);
        store.projects.put(project.id, project.clone()).unwrap();
        let template = coordinator
            .create_template("default".into(), PermissionMode::Default, HashSet::new(), "claude".into(), "ctx".into(), vec!["fake".into()])
            .unwrap();

        let parent = coordinator
            .spawn_minion(project.id, None, template.id, "parent".into(), None, None)
            .unwrap();
        let child = coordinator
            .spawn_minion(project.id, Some(parent.id), template.id, "child".into(), None, None)
            .unwrap();

        coordinator.dispose_minion(parent.id, false).await.unwrap();

        let parent_after = store.require_session(parent.id).unwrap();
        let child_after = store.require_session(child.id).unwrap();
        assert!(matches!(parent_after.state, crate::domain::SessionState::Terminated { disposed: true }));
        assert!(matches!(child_after.state, crate::domain::SessionState::Terminated { disposed: true }));
    }
}
