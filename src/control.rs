//! Control Surface (§4.9): the stateless RPC-shaped facade in front of every
//! other component. Every method validates its arguments, consults the
//! State Store and/or a session's runtime actor, and returns a typed
//! `CoreResult` — this is the only component that mutates State Store
//! entities in response to an external request (§4.9), so transports (the
//! out-of-scope HTTP/WebSocket server, a CLI) only ever need to hold one of
//! these.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::comm::CommRouter;
use crate::config::RuntimeConfig;
use crate::domain::{
    Comm, CommKind, CommPriority, CommTarget, Event, InputOrigin, LegionId, PermissionDecision,
    PermissionMode, PermissionRequest, Project, ProjectId, QueueItem, QueueItemId, Schedule,
    ScheduleId, ScheduleStatus, Session, SessionId, Template, TemplateId, ToolCall,
};
use crate::error::{CoreError, CoreResult};
use crate::event_log::EventLog;
use crate::legion::{DriverFactory, LegionCoordinator};
use crate::observer::{LegionSubscription, ObserverHub, SessionSubscription, UiMessage};
use crate::runtime::{self, RuntimeRegistry, SessionSnapshot};
use crate::scheduler::{self, SchedulerHandle};
use crate::state_store::StateStore;

/// Everything a Control Surface method needs to hand back about one
/// session, assembled from the State Store plus its live runtime actor
/// (when it has one).
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session: Session,
    pub queue: Vec<QueueItem>,
    pub tool_calls: Vec<ToolCall>,
    pub undecided_permission_requests: Vec<PermissionRequest>,
    pub input_cache: String,
}

pub struct ControlSurface {
    store: Arc<StateStore>,
    observer: Arc<ObserverHub>,
    runtimes: RuntimeRegistry,
    legion: LegionCoordinator,
    comms: CommRouter,
    scheduler: SchedulerHandle,
    config: Arc<RuntimeConfig>,
    data_dir: PathBuf,
    driver_factory: DriverFactory,
}

impl ControlSurface {
    /// Wire up every component against `data_dir`, running the State
    /// Store's startup sweep and starting the Scheduler's dispatch loop.
    /// Does not start any session — callers decide that explicitly.
    pub fn open(
        data_dir: impl Into<PathBuf>,
        config: RuntimeConfig,
        driver_factory: DriverFactory,
    ) -> CoreResult<Arc<Self>> {
        let data_dir = data_dir.into();
        let config = Arc::new(config);
        let store = StateStore::open(&data_dir)?;
        let observer =
            ObserverHub::with_heartbeat(config.observer_queue_depth, config.heartbeat_interval(), config.heartbeat_grace());
        observer.clone().spawn_heartbeat();
        let runtimes = RuntimeRegistry::new();

        let legion = LegionCoordinator::new(
            store.clone(),
            observer.clone(),
            runtimes.clone(),
            config.clone(),
            data_dir.clone(),
            driver_factory.clone(),
        );
        let comms = CommRouter::new(store.clone(), observer.clone(), runtimes.clone(), data_dir.clone());
        let scheduler_handle = scheduler::spawn(
            store.clone(),
            runtimes.clone(),
            observer.clone(),
            config.clone(),
            data_dir.clone(),
            driver_factory.clone(),
        );

        Ok(Arc::new(Self {
            store,
            observer,
            runtimes,
            legion,
            comms,
            scheduler: scheduler_handle,
            config,
            data_dir,
            driver_factory,
        }))
    }

    fn session_log_path(&self, session_id: SessionId) -> PathBuf {
        self.data_dir.join("sessions").join(session_id.to_string()).join("events")
    }

    fn view_of(&self, session: Session, snapshot: Option<SessionSnapshot>) -> SessionView {
        match snapshot {
            Some(s) => SessionView {
                session: s.session,
                queue: s.queue,
                tool_calls: s.tool_calls,
                undecided_permission_requests: s.undecided_permission_requests,
                input_cache: s.input_cache,
            },
            None => SessionView {
                session,
                queue: Vec::new(),
                tool_calls: Vec::new(),
                undecided_permission_requests: Vec::new(),
                input_cache: String::new(),
            },
        }
    }

    // ---------------------------------------------------------------
    // Projects
    // ---------------------------------------------------------------

    pub fn create_project(
        &self,
        name: String,
        working_directory: PathBuf,
        is_legion: bool,
        max_concurrent_minions: Option<usize>,
    ) -> CoreResult<Project> {
        if !working_directory.is_absolute() {
            return Err(CoreError::BadRequest("working_directory must be an absolute path".into()));
        }
        let rank = self.store.projects.list().len() as u32;
        let project = Project::new(
            name,
            working_directory,
            rank,
            is_legion,
            max_concurrent_minions.unwrap_or(self.config.default_max_concurrent_minions),
        );
        self.store.projects.put(project.id, project.clone())?;
        self.observer.publish_ui(UiMessage::ProjectListChanged);
        Ok(project)
    }

    pub fn list_projects(&self) -> Vec<Project> {
        let mut all = self.store.projects.list();
        all.sort_by_key(|p| p.rank);
        all
    }

    pub fn get_project(&self, id: ProjectId) -> CoreResult<Project> {
        self.store.require_project(id)
    }

    pub fn patch_project(
        &self,
        id: ProjectId,
        name: Option<String>,
        expanded: Option<bool>,
        max_concurrent_minions: Option<usize>,
    ) -> CoreResult<Project> {
        let project = self.store.projects.update(&id, |project| {
            if let Some(name) = name {
                project.name = name;
            }
            if let Some(expanded) = expanded {
                project.expanded = expanded;
            }
            if let Some(cap) = max_concurrent_minions {
                project.max_concurrent_minions = cap;
            }
            Ok(())
        })?;
        self.observer.publish_ui(UiMessage::ProjectListChanged);
        Ok(project)
    }

    /// Deletes a project and cascades to every owned session (§3 Project
    /// invariant). Live runtimes are disposed first so their drivers don't
    /// leak.
    pub async fn delete_project(&self, id: ProjectId) -> CoreResult<()> {
        let project = self.store.require_project(id)?;
        for session in self.store.list_children(id) {
            if let Some(handle) = self.runtimes.get(session.id) {
                let _ = handle.dispose().await;
                self.runtimes.remove(session.id);
            }
            self.store.sessions.delete(&session.id)?;
        }
        let _ = project;
        self.store.projects.delete(&id)?;
        self.observer.publish_ui(UiMessage::ProjectListChanged);
        Ok(())
    }

    /// Reassigns each listed project's rank to its position in `ordered_ids`
    /// (§8 round-trip property: `reorder -> reorder with returned order ->
    /// same list`). Every existing project must appear exactly once.
    pub fn reorder_projects(&self, ordered_ids: Vec<ProjectId>) -> CoreResult<Vec<Project>> {
        let mut all = self.store.projects.list();
        if ordered_ids.len() != all.len() || !ordered_ids.iter().all(|id| all.iter().any(|p| p.id == *id)) {
            return Err(CoreError::BadRequest("reorder must name every existing project exactly once".into()));
        }
        for (rank, id) in ordered_ids.iter().enumerate() {
            if let Some(p) = all.iter_mut().find(|p| p.id == *id) {
                p.rank = rank as u32;
                self.store.projects.put(p.id, p.clone())?;
            }
        }
        self.observer.publish_ui(UiMessage::ProjectListChanged);
        Ok(self.list_projects())
    }

    /// Reorders a project's `child_session_ids` to match `ordered_ids`,
    /// without touching any other project's children.
    pub fn reorder_sessions_within(&self, project_id: ProjectId, ordered_ids: Vec<SessionId>) -> CoreResult<Project> {
        let children = self.store.list_children(project_id);
        if ordered_ids.len() != children.len()
            || !ordered_ids.iter().all(|id| children.iter().any(|s| s.id == *id))
        {
            return Err(CoreError::BadRequest(
                "reorder must name every direct child session exactly once".into(),
            ));
        }
        self.store.projects.update(&project_id, |project| {
            project.child_session_ids = ordered_ids;
            Ok(())
        })
    }

    // ---------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------

    /// Creates a session under `project_id`. When `template_id` is given its
    /// defaults seed the session (a legion minion convenience); otherwise
    /// every field must be supplied explicitly. Legion membership (name
    /// uniqueness, `max_concurrent_minions`) is enforced whenever the
    /// project is a legion, whether or not a parent is given — a template-
    /// rooted session with no parent is still subject to the same cap
    /// (the cap counts every live descendant of the project root, not just
    /// direct children).
    #[allow(clippy::too_many_arguments)]
    pub fn create_session(
        &self,
        project_id: ProjectId,
        template_id: Option<TemplateId>,
        name: String,
        role: Option<String>,
        model: Option<String>,
        permission_mode: Option<PermissionMode>,
        allowed_tools: HashSet<String>,
        system_prompt_append: Option<String>,
        agent_command: Option<Vec<String>>,
    ) -> CoreResult<Session> {
        if template_id.is_some() {
            let template_id = template_id.unwrap();
            return self.legion.spawn_minion(project_id, None, template_id, name, role, system_prompt_append);
        }

        let project = self.store.require_project(project_id)?;
        if name.split_whitespace().count() != 1 {
            return Err(CoreError::BadRequest("session name must be a single token with no whitespace".into()));
        }
        if project.is_legion {
            let siblings = self.store.list_children(project_id);
            if siblings.iter().any(|s| s.name == name) {
                return Err(CoreError::Conflict(format!("name '{name}' already in use in this legion")));
            }
            let live = siblings.iter().filter(|s| !s.state.is_terminal()).count();
            if live >= project.max_concurrent_minions {
                return Err(CoreError::Conflict("max_concurrent_minions exceeded".into()));
            }
        }

        let model = model.ok_or_else(|| CoreError::BadRequest("model is required without a template".into()))?;
        let permission_mode =
            permission_mode.ok_or_else(|| CoreError::BadRequest("permission_mode is required without a template".into()))?;
        let agent_command =
            agent_command.ok_or_else(|| CoreError::BadRequest("agent_command is required without a template".into()))?;

        let session = Session::new(
            project_id,
            None,
            name,
            role,
            model,
            permission_mode,
            allowed_tools,
            system_prompt_append,
            agent_command,
        );
        self.store.sessions.put(session.id, session.clone())?;
        self.store.projects.update(&project_id, |project| {
            project.child_session_ids.push(session.id);
            Ok(())
        })?;

        let log = Arc::new(EventLog::open(self.session_log_path(session.id))?);
        self.observer.register_session_log(session.id, log.clone());
        let driver = (self.driver_factory)();
        let handle = runtime::spawn(session.clone(), self.config.clone(), self.store.clone(), log, self.observer.clone(), driver);
        self.runtimes.insert(handle);
        self.observer.publish_ui(UiMessage::ProjectListChanged);
        Ok(session)
    }

    pub fn get_session(&self, id: SessionId) -> CoreResult<Session> {
        self.store.require_session(id)
    }

    pub fn list_sessions(&self, project_id: ProjectId) -> CoreResult<Vec<Session>> {
        self.store.require_project(project_id)?;
        Ok(self.store.list_children(project_id))
    }

    pub fn list_descendants(&self, session_id: SessionId) -> CoreResult<Vec<Session>> {
        self.store.require_session(session_id)?;
        Ok(self.store.list_descendants(session_id))
    }

    /// A live-runtime-aware view combining durable metadata with in-memory
    /// queue/tool-call/permission state when the session has a running actor.
    pub async fn view_session(&self, id: SessionId) -> CoreResult<SessionView> {
        let session = self.store.require_session(id)?;
        let snapshot = match self.runtimes.get(id) {
            Some(handle) => Some(handle.snapshot().await?),
            None => None,
        };
        Ok(self.view_of(session, snapshot))
    }

    pub fn patch_session(
        &self,
        id: SessionId,
        role: Option<String>,
        system_prompt_append: Option<String>,
        allowed_tools: Option<HashSet<String>>,
    ) -> CoreResult<Session> {
        self.store.sessions.update(&id, |session| {
            if let Some(role) = role {
                session.role = Some(role);
            }
            if let Some(append) = system_prompt_append {
                session.system_prompt_append = Some(append);
            }
            if let Some(tools) = allowed_tools {
                session.allowed_tools = tools;
            }
            Ok(())
        })
    }

    pub fn set_name(&self, id: SessionId, name: String) -> CoreResult<Session> {
        if name.split_whitespace().count() != 1 {
            return Err(CoreError::BadRequest("session name must be a single token with no whitespace".into()));
        }
        let project_id = self.store.require_session(id)?.project_id;
        let siblings = self.store.list_children(project_id);
        if siblings.iter().any(|s| s.id != id && s.name == name) {
            return Err(CoreError::Conflict(format!("name '{name}' already in use in this legion")));
        }
        self.store.sessions.update(&id, |session| {
            session.name = name;
            Ok(())
        })
    }

    async fn handle_for(&self, id: SessionId) -> CoreResult<runtime::RuntimeHandle> {
        self.store.require_session(id)?;
        self.runtimes
            .get(id)
            .ok_or_else(|| CoreError::InvalidState("session has no live runtime; call start first".into()))
    }

    /// Start (or re-spawn, if its runtime actor was torn down) a session.
    pub async fn start_session(&self, id: SessionId) -> CoreResult<()> {
        let session = self.store.require_session(id)?;
        let handle = match self.runtimes.get(id) {
            Some(handle) => handle,
            None => {
                let log = Arc::new(EventLog::open(self.session_log_path(id))?);
                self.observer.register_session_log(id, log.clone());
                let driver = (self.driver_factory)();
                let handle =
                    runtime::spawn(session, self.config.clone(), self.store.clone(), log, self.observer.clone(), driver);
                self.runtimes.insert(handle.clone());
                handle
            }
        };
        handle.start().await
    }

    pub async fn pause_session(&self, id: SessionId) -> CoreResult<()> {
        self.handle_for(id).await?.pause_queue().await
    }

    pub async fn terminate_session(&self, id: SessionId) -> CoreResult<()> {
        self.handle_for(id).await?.terminate().await
    }

    pub async fn restart_session(&self, id: SessionId) -> CoreResult<()> {
        self.handle_for(id).await?.restart().await
    }

    pub async fn reset_session(&self, id: SessionId) -> CoreResult<()> {
        self.handle_for(id).await?.reset().await
    }

    pub async fn disconnect_session(&self, id: SessionId) -> CoreResult<()> {
        self.handle_for(id).await?.disconnect().await
    }

    /// Deletes session metadata outright. Only legal once the session is
    /// terminal — a live one must be terminated first.
    pub async fn delete_session(&self, id: SessionId) -> CoreResult<()> {
        let session = self.store.require_session(id)?;
        if !session.state.is_terminal() {
            return Err(CoreError::InvalidState("terminate the session before deleting it".into()));
        }
        self.runtimes.remove(id);
        self.store.sessions.delete(&id)?;
        Ok(())
    }

    pub async fn set_permission_mode(&self, id: SessionId, mode: PermissionMode) -> CoreResult<()> {
        self.handle_for(id).await?.set_permission_mode(mode).await
    }

    pub async fn send_message(
        &self,
        id: SessionId,
        body: String,
        attachments: Vec<String>,
    ) -> CoreResult<QueueItemId> {
        self.handle_for(id)
            .await?
            .enqueue_input(body, attachments, Default::default(), InputOrigin::User, false)
            .await
    }

    pub fn get_messages(&self, id: SessionId, offset: u64, limit: u64) -> CoreResult<Vec<Event>> {
        self.store.require_session(id)?;
        Ok(self.observer.session_messages(id, offset, limit))
    }

    // ---------------------------------------------------------------
    // Queue
    // ---------------------------------------------------------------

    pub async fn enqueue(
        &self,
        id: SessionId,
        body: String,
        metadata: std::collections::HashMap<String, serde_json::Value>,
    ) -> CoreResult<QueueItemId> {
        self.handle_for(id).await?.enqueue_input(body, Vec::new(), metadata, InputOrigin::User, false).await
    }

    pub async fn list_queue(&self, id: SessionId) -> CoreResult<Vec<QueueItem>> {
        Ok(self.handle_for(id).await?.snapshot().await?.queue)
    }

    pub async fn cancel_queue_item(&self, id: SessionId, item_id: QueueItemId) -> CoreResult<()> {
        self.handle_for(id).await?.cancel_queue_item(item_id).await
    }

    pub async fn requeue_item(&self, id: SessionId, item_id: QueueItemId) -> CoreResult<()> {
        self.handle_for(id).await?.requeue_front(item_id).await
    }

    pub async fn clear_queue(&self, id: SessionId) -> CoreResult<()> {
        self.handle_for(id).await?.clear_queue().await
    }

    /// `patch_timing`: reposition a still-pending queue item relative to its
    /// peers, taking an explicit target position among pending items —
    /// generalizing `requeue`'s front-only move.
    pub async fn patch_queue_item_timing(&self, id: SessionId, item_id: QueueItemId, position: usize) -> CoreResult<()> {
        self.handle_for(id).await?.reorder_queue_item(item_id, position).await
    }

    pub async fn pause_queue(&self, id: SessionId, paused: bool) -> CoreResult<()> {
        let handle = self.handle_for(id).await?;
        if paused {
            handle.pause_queue().await
        } else {
            handle.resume_queue().await
        }
    }

    // ---------------------------------------------------------------
    // Permissions
    // ---------------------------------------------------------------

    pub async fn respond_permission(
        &self,
        session_id: SessionId,
        request_id: String,
        decision: PermissionDecision,
        apply_suggestions: bool,
    ) -> CoreResult<()> {
        self.handle_for(session_id).await?.respond_permission(request_id, decision, apply_suggestions).await
    }

    /// Simulates whether each of `tool_names` would be allowed under
    /// `session_allowed_tools` and `permission_mode`, layered under
    /// `setting_sources` (lowest to highest precedence), without mutating
    /// any state. A read-only companion to the live permission mediator,
    /// useful for a UI to show "what would happen" before a tool-use ever
    /// arrives.
    pub fn preview_effective_permissions(
        &self,
        setting_sources: &[PermissionSettingSource],
        session_allowed_tools: &HashSet<String>,
        permission_mode: PermissionMode,
        tool_names: &[String],
    ) -> Vec<EffectivePermissionPreview> {
        tool_names
            .iter()
            .map(|tool| self.preview_one(tool, setting_sources, session_allowed_tools, permission_mode))
            .collect()
    }

    fn preview_one(
        &self,
        tool: &str,
        setting_sources: &[PermissionSettingSource],
        session_allowed_tools: &HashSet<String>,
        permission_mode: PermissionMode,
    ) -> EffectivePermissionPreview {
        if permission_mode == PermissionMode::BypassPermissions {
            return EffectivePermissionPreview {
                tool_name: tool.to_string(),
                decision: PreviewDecision::Allow,
                reason: "bypassPermissions mode allows every tool".into(),
            };
        }

        for source in setting_sources.iter().rev() {
            if source.denied_tools.iter().any(|t| t == tool) {
                return EffectivePermissionPreview {
                    tool_name: tool.to_string(),
                    decision: PreviewDecision::Deny,
                    reason: format!("denied by setting source '{}'", source.label),
                };
            }
            if source.allowed_tools.iter().any(|t| t == tool) {
                return EffectivePermissionPreview {
                    tool_name: tool.to_string(),
                    decision: PreviewDecision::Allow,
                    reason: format!("allowed by setting source '{}'", source.label),
                };
            }
        }

        if session_allowed_tools.contains(tool) {
            return EffectivePermissionPreview {
                tool_name: tool.to_string(),
                decision: PreviewDecision::Allow,
                reason: "already in the session's allowed-tools set".into(),
            };
        }

        match permission_mode {
            PermissionMode::BypassPermissions => unreachable!("handled above"),
            PermissionMode::AcceptEdits if is_edit_tool(tool) => EffectivePermissionPreview {
                tool_name: tool.to_string(),
                decision: PreviewDecision::Allow,
                reason: "acceptEdits mode auto-allows file-editing tools".into(),
            },
            PermissionMode::Plan if is_mutating_tool(tool) => EffectivePermissionPreview {
                tool_name: tool.to_string(),
                decision: PreviewDecision::Deny,
                reason: "plan mode rejects mutating tools until the plan is accepted".into(),
            },
            _ => EffectivePermissionPreview {
                tool_name: tool.to_string(),
                decision: PreviewDecision::Prompt,
                reason: "no rule decides this tool; a live permission request would be raised".into(),
            },
        }
    }

    // ---------------------------------------------------------------
    // Legion
    // ---------------------------------------------------------------

    pub fn list_minions(&self, project_id: ProjectId) -> CoreResult<Vec<Session>> {
        self.legion.list_minions(project_id)
    }

    pub fn get_hierarchy(&self, project_id: ProjectId) -> CoreResult<Vec<Session>> {
        self.legion.hierarchy(project_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_comm(
        &self,
        sender_id: SessionId,
        to: CommTarget,
        summary: String,
        body: String,
        kind: CommKind,
        priority: CommPriority,
    ) -> CoreResult<Comm> {
        match to {
            CommTarget::Broadcast => self.comms.broadcast(sender_id, kind, summary, body, priority).await,
            target => self.comms.send_comm(sender_id, target, kind, summary, body, priority).await,
        }
    }

    pub async fn halt_all(&self, project_id: ProjectId) -> CoreResult<()> {
        self.legion.halt_all(project_id).await
    }

    pub async fn resume_all(&self, project_id: ProjectId) -> CoreResult<()> {
        self.legion.resume_all(project_id).await
    }

    pub fn create_minion(
        &self,
        project_id: ProjectId,
        parent_id: Option<SessionId>,
        template_id: TemplateId,
        name: String,
        role: Option<String>,
        context: Option<String>,
    ) -> CoreResult<Session> {
        self.legion.spawn_minion(project_id, parent_id, template_id, name, role, context)
    }

    pub async fn dispose_minion(&self, session_id: SessionId, archive_knowledge: bool) -> CoreResult<()> {
        self.legion.dispose_minion(session_id, archive_knowledge).await
    }

    // ---------------------------------------------------------------
    // Schedules
    // ---------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_schedule(
        &self,
        legion_id: LegionId,
        target_session_id: SessionId,
        cron_expression: String,
        prompt_template: String,
        reset_session: bool,
        max_retries: u32,
        timeout_seconds: u64,
    ) -> CoreResult<Schedule> {
        self.store.require_session(target_session_id)?;
        let next_run_at = Some(scheduler::initial_next_run(&cron_expression)?);
        let schedule = Schedule {
            id: ScheduleId::new(),
            legion_id,
            target_session_id,
            cron_expression,
            prompt_template,
            reset_session,
            max_retries,
            timeout_seconds,
            status: ScheduleStatus::Active,
            next_run_at,
            history: Vec::new(),
            history_limit: self.config.schedule_history_limit,
        };
        self.store.schedules.put(schedule.id, schedule.clone())?;
        self.scheduler.notify_changed(schedule.id).await;
        Ok(schedule)
    }

    pub fn list_schedules(&self, legion_id: LegionId) -> Vec<Schedule> {
        self.store.schedules.list().into_iter().filter(|s| s.legion_id == legion_id).collect()
    }

    pub fn get_schedule(&self, id: ScheduleId) -> CoreResult<Schedule> {
        self.store.require_schedule(id)
    }

    pub async fn patch_schedule(
        &self,
        id: ScheduleId,
        cron_expression: Option<String>,
        prompt_template: Option<String>,
        max_retries: Option<u32>,
        timeout_seconds: Option<u64>,
    ) -> CoreResult<Schedule> {
        let schedule = self.store.schedules.update(&id, |schedule| {
            if let Some(cron) = cron_expression {
                schedule.next_run_at = Some(scheduler::initial_next_run(&cron)?);
                schedule.cron_expression = cron;
            }
            if let Some(prompt) = prompt_template {
                schedule.prompt_template = prompt;
            }
            if let Some(retries) = max_retries {
                schedule.max_retries = retries;
            }
            if let Some(timeout) = timeout_seconds {
                schedule.timeout_seconds = timeout;
            }
            Ok(())
        })?;
        self.scheduler.notify_changed(id).await;
        Ok(schedule)
    }

    async fn set_schedule_status(&self, id: ScheduleId, status: ScheduleStatus) -> CoreResult<Schedule> {
        let schedule = self.store.schedules.update(&id, |schedule| {
            schedule.status = status;
            Ok(())
        })?;
        self.scheduler.notify_changed(id).await;
        Ok(schedule)
    }

    pub async fn pause_schedule(&self, id: ScheduleId) -> CoreResult<Schedule> {
        self.set_schedule_status(id, ScheduleStatus::Paused).await
    }

    pub async fn resume_schedule(&self, id: ScheduleId) -> CoreResult<Schedule> {
        let schedule = self.store.schedules.update(&id, |schedule| {
            schedule.next_run_at = Some(scheduler::initial_next_run(&schedule.cron_expression)?);
            schedule.status = ScheduleStatus::Active;
            Ok(())
        })?;
        self.scheduler.notify_changed(id).await;
        Ok(schedule)
    }

    pub async fn cancel_schedule(&self, id: ScheduleId) -> CoreResult<Schedule> {
        self.set_schedule_status(id, ScheduleStatus::Cancelled).await
    }

    /// Deleting an active schedule implicitly cancels it first (§4.7).
    pub async fn delete_schedule(&self, id: ScheduleId) -> CoreResult<()> {
        let schedule = self.store.require_schedule(id)?;
        if schedule.status != ScheduleStatus::Cancelled {
            self.cancel_schedule(id).await?;
        }
        self.store.schedules.delete(&id)?;
        Ok(())
    }

    pub fn list_history(&self, id: ScheduleId) -> CoreResult<Vec<crate::domain::ScheduleExecution>> {
        Ok(self.store.require_schedule(id)?.history)
    }

    // ---------------------------------------------------------------
    // Templates
    // ---------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_template(
        &self,
        name: String,
        default_permission_mode: PermissionMode,
        allowed_tools: HashSet<String>,
        model: String,
        initialization_context: String,
        agent_command: Vec<String>,
    ) -> CoreResult<Template> {
        self.legion.create_template(name, default_permission_mode, allowed_tools, model, initialization_context, agent_command)
    }

    pub fn list_templates(&self) -> Vec<Template> {
        self.store.templates.list()
    }

    pub fn get_template(&self, id: TemplateId) -> CoreResult<Template> {
        self.store.require_template(id)
    }

    /// Templates are immutable by identity (§3); "updating" one creates a
    /// new version that only new sessions will reference.
    pub fn update_template(&self, id: TemplateId, initialization_context: String) -> CoreResult<Template> {
        let existing = self.store.require_template(id)?;
        let next = existing.new_version(initialization_context);
        self.store.templates.put(next.id, next.clone())?;
        Ok(next)
    }

    pub fn delete_template(&self, id: TemplateId) -> CoreResult<()> {
        self.store.require_template(id)?;
        self.store.templates.delete(&id)
    }

    // ---------------------------------------------------------------
    // Event Stream subscriptions
    // ---------------------------------------------------------------

    pub fn subscribe_ui(&self) -> tokio::sync::broadcast::Receiver<UiMessage> {
        self.observer.subscribe_ui()
    }

    pub fn subscribe_session(&self, id: SessionId, from_seq: u64) -> SessionSubscription {
        self.observer.subscribe_session(id, from_seq)
    }

    pub fn subscribe_legion(&self, id: LegionId, from_seq: u64) -> LegionSubscription {
        self.observer.subscribe_legion(id, from_seq)
    }
}

/// One layer of tool-permission settings (e.g. "user settings", "project
/// settings", "enterprise policy"), in increasing precedence order, for
/// `preview_effective_permissions`.
#[derive(Debug, Clone)]
pub struct PermissionSettingSource {
    pub label: String,
    pub allowed_tools: Vec<String>,
    pub denied_tools: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewDecision {
    Allow,
    Deny,
    Prompt,
}

#[derive(Debug, Clone)]
pub struct EffectivePermissionPreview {
    pub tool_name: String,
    pub decision: PreviewDecision,
    pub reason: String,
}

fn is_edit_tool(tool: &str) -> bool {
    matches!(tool, "Write" | "Edit" | "NotebookEdit" | "MultiEdit")
}

fn is_mutating_tool(tool: &str) -> bool {
    is_edit_tool(tool) || matches!(tool, "Bash" | "NotebookEdit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeAgentDriver;

    fn make_surface(dir: &std::path::Path) -> Arc<ControlSurface> {
        let factory: DriverFactory = Arc::new(|| FakeAgentDriver::new().0 as Arc<dyn crate::driver::AgentDriver>);
        ControlSurface::open(dir, RuntimeConfig::default(), factory).unwrap()
    }

    #[test]
    fn create_then_get_preserves_identity() {
        let dir = tempfile::tempdir().unwrap();
        let surface = make_surface(dir.path());
        let project = surface
            .create_project("demo".into(), dir.path().to_path_buf(), false, None)
            .unwrap();
        let fetched = surface.get_project(project.id).unwrap();
        assert_eq!(fetched.id, project.id);
        assert_eq!(fetched.name, "demo");
    }

    #[test]
    fn reorder_projects_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let surface = make_surface(dir.path());
        let a = surface.create_project("a".into(), dir.path().to_path_buf(), false, None).unwrap();
        let b = surface.create_project("b".into(), dir.path().to_path_buf(), false, None).unwrap();

        let reordered = surface.reorder_projects(vec![b.id, a.id]).unwrap();
        assert_eq!(reordered[0].id, b.id);
        assert_eq!(reordered[1].id, a.id);

        let again = surface.reorder_projects(reordered.iter().map(|p| p.id).collect()).unwrap();
        assert_eq!(again[0].id, b.id);
        assert_eq!(again[1].id, a.id);
    }

    #[tokio::test]
    async fn delete_terminated_session_succeeds_live_one_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let surface = make_surface(dir.path());
        let project = surface.create_project("demo".into(), dir.path().to_path_buf(), false, None).unwrap();
        let session = surface
            .create_session(
                project.id,
                None,
                "alpha".into(),
                None,
                Some("claude".into()),
                Some(PermissionMode::Default),
                HashSet::new(),
                None,
                Some(vec!["fake-agent".into()]),
            )
            .unwrap();

        let err = surface.delete_session(session.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));

        surface.start_session(session.id).await.unwrap();
        surface.terminate_session(session.id).await.unwrap();
        surface.delete_session(session.id).await.unwrap();
        assert!(surface.get_session(session.id).is_err());
    }

    #[tokio::test]
    async fn patch_queue_item_timing_reorders_pending_items() {
        let dir = tempfile::tempdir().unwrap();
        let surface = make_surface(dir.path());
        let project = surface.create_project("demo".into(), dir.path().to_path_buf(), false, None).unwrap();
        let session = surface
            .create_session(
                project.id,
                None,
                "alpha".into(),
                None,
                Some("claude".into()),
                Some(PermissionMode::Default),
                HashSet::new(),
                None,
                Some(vec!["fake-agent".into()]),
            )
            .unwrap();
        surface.start_session(session.id).await.unwrap();
        surface.pause_queue(session.id, true).await.unwrap();

        surface.enqueue(session.id, "first".into(), std::collections::HashMap::new()).await.unwrap();
        surface.enqueue(session.id, "second".into(), std::collections::HashMap::new()).await.unwrap();
        let third = surface
            .enqueue(session.id, "third".into(), std::collections::HashMap::new())
            .await
            .unwrap();

        surface.patch_queue_item_timing(session.id, third, 0).await.unwrap();
        let queue = surface.list_queue(session.id).await.unwrap();
        assert_eq!(
            queue.iter().map(|i| i.body.as_str()).collect::<Vec<_>>(),
            vec!["third", "first", "second"]
        );
    }

    #[test]
    fn preview_permissions_respects_layered_sources() {
        let dir = tempfile::tempdir().unwrap();
        let surface = make_surface(dir.path());
        let sources = vec![
            PermissionSettingSource {
                label: "user".into(),
                allowed_tools: vec!["Bash".into()],
                denied_tools: vec![],
            },
            PermissionSettingSource {
                label: "project".into(),
                allowed_tools: vec![],
                denied_tools: vec!["Bash".into()],
            },
        ];
        let previews = surface.preview_effective_permissions(
            &sources,
            &HashSet::new(),
            PermissionMode::Default,
            &["Bash".to_string(), "Read".to_string()],
        );
        assert_eq!(previews[0].decision, PreviewDecision::Deny, "project settings override user settings");
        assert_eq!(previews[1].decision, PreviewDecision::Prompt);
    }

    #[test]
    fn bypass_mode_allows_everything() {
        let dir = tempfile::tempdir().unwrap();
        let surface = make_surface(dir.path());
        let previews = surface.preview_effective_permissions(
            &[],
            &HashSet::new(),
            PermissionMode::BypassPermissions,
            &["Bash".to_string()],
        );
        assert_eq!(previews[0].decision, PreviewDecision::Allow);
    }
}
