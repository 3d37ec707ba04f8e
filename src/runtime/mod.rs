//! Session Runtime: the per-session state machine, input queue, tool-call
//! tracker, and permission mediator — the central actor this crate builds
//! everything else around.
//!
//! Each session gets one private execution context — a `tokio::spawn`ed
//! actor loop owning an `mpsc::Receiver<RuntimeCommand>` mailbox — so every
//! external operation against that session is serialised in arrival order
//! without a lock, one loop per session rather than one shared loop over
//! many sessions.

pub mod state_machine;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::config::RuntimeConfig;
use crate::domain::{
    Event, EventKind, InputOrigin, PermissionDecision, PermissionMode, PermissionRequest,
    PermissionRequestId, PermissionSuggestion, QueueItem, QueueItemId, QueueItemStatus, Responder,
    Session, SessionId, SessionState, SuggestionRule, ToolCall, ToolCallStatus,
};
use crate::driver::{AgentDriver, DriverEvent, DriverStartParams};
use crate::error::{CoreError, CoreResult};
use crate::event_log::EventLog;
use crate::observer::{ObserverHub, UiMessage};
use crate::state_store::StateStore;

/// A read-only view of a session's live runtime state, for the Control
/// Surface to hand back on queries.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session: Session,
    pub queue: Vec<QueueItem>,
    pub tool_calls: Vec<ToolCall>,
    pub undecided_permission_requests: Vec<PermissionRequest>,
    pub input_cache: String,
}

enum RuntimeCommand {
    Start(oneshot::Sender<CoreResult<()>>),
    EnqueueInput {
        body: String,
        attachments: Vec<String>,
        metadata: HashMap<String, serde_json::Value>,
        origin: InputOrigin,
        front: bool,
        reply: oneshot::Sender<CoreResult<QueueItemId>>,
    },
    CancelQueueItem(QueueItemId, oneshot::Sender<CoreResult<()>>),
    RequeueFront(QueueItemId, oneshot::Sender<CoreResult<()>>),
    ReorderQueueItem(QueueItemId, usize, oneshot::Sender<CoreResult<()>>),
    PauseQueue(oneshot::Sender<CoreResult<()>>),
    ResumeQueue(oneshot::Sender<CoreResult<()>>),
    ClearQueue(oneshot::Sender<CoreResult<()>>),
    RespondPermission {
        request_id: String,
        decision: PermissionDecision,
        apply_suggestions: bool,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    Interrupt(oneshot::Sender<CoreResult<()>>),
    Terminate(oneshot::Sender<CoreResult<()>>),
    Dispose(oneshot::Sender<CoreResult<()>>),
    Restart(oneshot::Sender<CoreResult<()>>),
    Reset(oneshot::Sender<CoreResult<()>>),
    Disconnect(oneshot::Sender<CoreResult<()>>),
    SetPermissionMode(PermissionMode, oneshot::Sender<CoreResult<()>>),
    SetInputCache(String, oneshot::Sender<CoreResult<()>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// A cheaply-cloneable handle to a session's private execution context.
#[derive(Clone)]
pub struct RuntimeHandle {
    pub session_id: SessionId,
    tx: mpsc::Sender<RuntimeCommand>,
}

macro_rules! call {
    ($self:ident, $variant:ident) => {{
        let (tx, rx) = oneshot::channel();
        $self
            .tx
            .send(RuntimeCommand::$variant(tx))
            .await
            .map_err(|_| CoreError::Unavailable("session runtime actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Unavailable("session runtime actor dropped reply".into()))?
    }};
}

impl RuntimeHandle {
    pub async fn start(&self) -> CoreResult<()> {
        call!(self, Start)
    }

    pub async fn enqueue_input(
        &self,
        body: String,
        attachments: Vec<String>,
        metadata: HashMap<String, serde_json::Value>,
        origin: InputOrigin,
        front: bool,
    ) -> CoreResult<QueueItemId> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RuntimeCommand::EnqueueInput { body, attachments, metadata, origin, front, reply: tx })
            .await
            .map_err(|_| CoreError::Unavailable("session runtime actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Unavailable("session runtime actor dropped reply".into()))?
    }

    pub async fn cancel_queue_item(&self, id: QueueItemId) -> CoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RuntimeCommand::CancelQueueItem(id, tx))
            .await
            .map_err(|_| CoreError::Unavailable("session runtime actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Unavailable("session runtime actor dropped reply".into()))?
    }

    pub async fn requeue_front(&self, id: QueueItemId) -> CoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RuntimeCommand::RequeueFront(id, tx))
            .await
            .map_err(|_| CoreError::Unavailable("session runtime actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Unavailable("session runtime actor dropped reply".into()))?
    }

    /// Move a still-pending queue item to an arbitrary position among the
    /// other pending items, clamped to the pending sub-list's bounds.
    pub async fn reorder_queue_item(&self, id: QueueItemId, position: usize) -> CoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RuntimeCommand::ReorderQueueItem(id, position, tx))
            .await
            .map_err(|_| CoreError::Unavailable("session runtime actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Unavailable("session runtime actor dropped reply".into()))?
    }

    pub async fn pause_queue(&self) -> CoreResult<()> {
        call!(self, PauseQueue)
    }

    pub async fn resume_queue(&self) -> CoreResult<()> {
        call!(self, ResumeQueue)
    }

    pub async fn clear_queue(&self) -> CoreResult<()> {
        call!(self, ClearQueue)
    }

    pub async fn respond_permission(
        &self,
        request_id: String,
        decision: PermissionDecision,
        apply_suggestions: bool,
    ) -> CoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RuntimeCommand::RespondPermission { request_id, decision, apply_suggestions, reply: tx })
            .await
            .map_err(|_| CoreError::Unavailable("session runtime actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Unavailable("session runtime actor dropped reply".into()))?
    }

    pub async fn interrupt(&self) -> CoreResult<()> {
        call!(self, Interrupt)
    }

    pub async fn terminate(&self) -> CoreResult<()> {
        call!(self, Terminate)
    }

    /// Terminate and mark the session as disposed (§4.6): a terminal subtype
    /// distinguishing a deliberate Legion Coordinator teardown from a plain
    /// `terminate`.
    pub async fn dispose(&self) -> CoreResult<()> {
        call!(self, Dispose)
    }

    pub async fn restart(&self) -> CoreResult<()> {
        call!(self, Restart)
    }

    pub async fn reset(&self) -> CoreResult<()> {
        call!(self, Reset)
    }

    pub async fn disconnect(&self) -> CoreResult<()> {
        call!(self, Disconnect)
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> CoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RuntimeCommand::SetPermissionMode(mode, tx))
            .await
            .map_err(|_| CoreError::Unavailable("session runtime actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Unavailable("session runtime actor dropped reply".into()))?
    }

    pub async fn set_input_cache(&self, text: String) -> CoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RuntimeCommand::SetInputCache(text, tx))
            .await
            .map_err(|_| CoreError::Unavailable("session runtime actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Unavailable("session runtime actor dropped reply".into()))?
    }

    pub async fn snapshot(&self) -> CoreResult<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RuntimeCommand::Snapshot(tx))
            .await
            .map_err(|_| CoreError::Unavailable("session runtime actor gone".into()))?;
        rx.await.map_err(|_| CoreError::Unavailable("session runtime actor dropped reply".into()))
    }
}

/// Process-wide registry of live session actors, keyed by session id. Every
/// component that needs to talk to a running session (Control Surface,
/// Comm Router, Legion Coordinator, Scheduler) goes through this rather than
/// holding its own copy of handles.
#[derive(Clone)]
pub struct RuntimeRegistry {
    handles: Arc<dashmap::DashMap<SessionId, RuntimeHandle>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self { handles: Arc::new(dashmap::DashMap::new()) }
    }

    pub fn insert(&self, handle: RuntimeHandle) {
        self.handles.insert(handle.session_id, handle);
    }

    pub fn get(&self, session_id: SessionId) -> Option<RuntimeHandle> {
        self.handles.get(&session_id).map(|e| e.clone())
    }

    pub fn remove(&self, session_id: SessionId) {
        self.handles.remove(&session_id);
    }

    pub fn require(&self, session_id: SessionId) -> CoreResult<RuntimeHandle> {
        self.get(session_id).ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))
    }

    pub fn all_ids(&self) -> Vec<SessionId> {
        self.handles.iter().map(|e| *e.key()).collect()
    }
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn next_driver_event(rx: &mut Option<mpsc::Receiver<DriverEvent>>) -> Option<DriverEvent> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

struct SessionActor {
    session: Session,
    config: Arc<RuntimeConfig>,
    store: Arc<StateStore>,
    log: Arc<EventLog>,
    observer: Arc<ObserverHub>,
    driver: Arc<dyn AgentDriver>,
    driver_rx: Option<mpsc::Receiver<DriverEvent>>,
    queue: VecDeque<QueueItem>,
    queue_paused: bool,
    tool_calls: HashMap<String, ToolCall>,
    active_tool_ids: HashSet<String>,
    permission_requests: HashMap<String, PermissionRequest>,
    input_cache: String,
    /// tool_use_id currently blocking the queue's running item, if any.
    running_item: Option<QueueItemId>,
    /// Whether `driver.take_events()` has already been called. The driver's
    /// event receiver is taken exactly once for the actor's lifetime (the
    /// same channel keeps delivering events across a restarted child
    /// process) — a later `do_start` after `restart`/`reset` must not call
    /// `take_events` again.
    driver_events_taken: bool,
}

pub fn spawn(
    session: Session,
    config: Arc<RuntimeConfig>,
    store: Arc<StateStore>,
    log: Arc<EventLog>,
    observer: Arc<ObserverHub>,
    driver: Arc<dyn AgentDriver>,
) -> RuntimeHandle {
    let session_id = session.id;
    let (tx, rx) = mpsc::channel(256);
    let actor = SessionActor {
        session,
        config,
        store,
        log,
        observer,
        driver,
        driver_rx: None,
        queue: VecDeque::new(),
        queue_paused: false,
        tool_calls: HashMap::new(),
        active_tool_ids: HashSet::new(),
        permission_requests: HashMap::new(),
        input_cache: String::new(),
        running_item: None,
        driver_events_taken: false,
    };
    tokio::spawn(actor.run(rx));
    RuntimeHandle { session_id, tx }
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<RuntimeCommand>) {
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                ev = next_driver_event(&mut self.driver_rx) => {
                    match ev {
                        Some(ev) => self.handle_driver_event(ev).await,
                        None => { self.driver_rx = None; }
                    }
                }
            }
            self.try_dispatch_next().await;
        }
    }

    fn persist_session(&self) {
        if let Err(e) = self.store.sessions.put(self.session.id, self.session.clone()) {
            tracing::error!(session_id = %self.session.id, error = %e, "failed to persist session state");
        }
    }

    fn append(&self, kind: EventKind) -> Option<Event> {
        let event = Event { session_id: self.session.id, seq: 0, at: Utc::now(), kind };
        match self.log.append(&event) {
            Ok(seq) => {
                let mut event = event;
                event.seq = seq;
                self.observer.publish_session_event(self.session.id, event.clone());
                Some(event)
            }
            Err(e) => {
                tracing::error!(session_id = %self.session.id, error = %e, "event log append failed; transitioning to error");
                None
            }
        }
    }

    fn transition(&mut self, new_state: SessionState) {
        let from = format!("{:?}", self.session.state.effective_status());
        self.session.state = new_state;
        let to = format!("{:?}", self.session.state.effective_status());
        self.append(EventKind::StateChange { from, to });
        self.persist_session();
        self.observer.publish_ui(UiMessage::SessionStateChanged {
            session_id: self.session.id,
            status: self.session.state.effective_status(),
        });
    }

    async fn handle_command(&mut self, cmd: RuntimeCommand) {
        match cmd {
            RuntimeCommand::Start(reply) => {
                let _ = reply.send(self.do_start().await);
            }
            RuntimeCommand::EnqueueInput { body, attachments, metadata, origin, front, reply } => {
                let _ = reply.send(self.do_enqueue_input(body, attachments, metadata, origin, front));
            }
            RuntimeCommand::CancelQueueItem(id, reply) => {
                let before = self.queue.len();
                self.queue.retain(|i| i.id != id);
                if self.queue.len() == before {
                    let _ = reply.send(Err(CoreError::NotFound(format!("queue item {id}"))));
                } else {
                    self.append(EventKind::QueueUpdate { queue_item_id: id, status: QueueItemStatus::Cancelled });
                    let _ = reply.send(Ok(()));
                }
            }
            RuntimeCommand::RequeueFront(id, reply) => {
                if let Some(pos) = self.queue.iter().position(|i| i.id == id) {
                    let item = self.queue.remove(pos).unwrap();
                    let status = item.status;
                    self.queue.push_front(item);
                    self.append(EventKind::QueueUpdate { queue_item_id: id, status });
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(CoreError::NotFound(format!("queue item {id}"))));
                }
            }
            RuntimeCommand::ReorderQueueItem(id, position, reply) => {
                let _ = reply.send(self.do_reorder_queue_item(id, position));
            }
            RuntimeCommand::PauseQueue(reply) => {
                self.queue_paused = true;
                let _ = reply.send(Ok(()));
            }
            RuntimeCommand::ResumeQueue(reply) => {
                self.queue_paused = false;
                let _ = reply.send(Ok(()));
            }
            RuntimeCommand::ClearQueue(reply) => {
                let cleared: Vec<QueueItemId> =
                    self.queue.iter().filter(|i| i.status != QueueItemStatus::Running).map(|i| i.id).collect();
                self.queue.retain(|i| i.status == QueueItemStatus::Running);
                for id in cleared {
                    self.append(EventKind::QueueUpdate { queue_item_id: id, status: QueueItemStatus::Cancelled });
                }
                let _ = reply.send(Ok(()));
            }
            RuntimeCommand::RespondPermission { request_id, decision, apply_suggestions, reply } => {
                let _ = reply.send(self.do_respond_permission(request_id, decision, apply_suggestions).await);
            }
            RuntimeCommand::Interrupt(reply) => {
                let _ = reply.send(self.do_interrupt().await);
            }
            RuntimeCommand::Terminate(reply) => {
                let _ = reply.send(self.do_terminate().await);
            }
            RuntimeCommand::Dispose(reply) => {
                let _ = reply.send(self.do_dispose().await);
            }
            RuntimeCommand::Restart(reply) => {
                let _ = reply.send(self.do_restart().await);
            }
            RuntimeCommand::Reset(reply) => {
                let _ = reply.send(self.do_reset().await);
            }
            RuntimeCommand::Disconnect(reply) => {
                let _ = reply.send(self.do_disconnect().await);
            }
            RuntimeCommand::SetPermissionMode(mode, reply) => {
                let _ = reply.send(self.do_set_permission_mode(mode).await);
            }
            RuntimeCommand::SetInputCache(text, reply) => {
                self.input_cache = text;
                let _ = reply.send(Ok(()));
            }
            RuntimeCommand::Snapshot(reply) => {
                let _ = reply.send(SessionSnapshot {
                    session: self.session.clone(),
                    queue: self.queue.iter().cloned().collect(),
                    tool_calls: self.tool_calls.values().cloned().collect(),
                    undecided_permission_requests: self
                        .permission_requests
                        .values()
                        .filter(|p| !p.is_resolved())
                        .cloned()
                        .collect(),
                    input_cache: self.input_cache.clone(),
                });
            }
        }
    }

    /// Reject enqueue while the session is terminating or terminal (§8
    /// boundary behaviour); otherwise append to the FIFO, honouring `front`
    /// for comm-priority `pivot` insertion and scheduled prompts.
    fn do_enqueue_input(
        &mut self,
        body: String,
        attachments: Vec<String>,
        metadata: HashMap<String, serde_json::Value>,
        origin: InputOrigin,
        front: bool,
    ) -> CoreResult<QueueItemId> {
        if matches!(self.session.state, SessionState::Terminating) || self.session.state.is_terminal() {
            return Err(CoreError::InvalidState("session is terminating or terminated".into()));
        }
        let pending = self.queue.iter().filter(|i| i.status == QueueItemStatus::Pending).count();
        if pending >= self.config.max_queue_depth {
            return Err(CoreError::Conflict("queue depth limit reached".into()));
        }
        let item = QueueItem::new(body, attachments, metadata, origin);
        let id = item.id;
        if front {
            self.queue.push_front(item);
        } else {
            self.queue.push_back(item);
        }
        self.append(EventKind::QueueUpdate { queue_item_id: id, status: QueueItemStatus::Pending });
        Ok(id)
    }

    /// Reposition a still-pending item among the other pending items,
    /// leaving any running item's position untouched. `position` is an index
    /// into the pending sub-list, clamped to its length.
    fn do_reorder_queue_item(&mut self, id: QueueItemId, position: usize) -> CoreResult<()> {
        let pos = self
            .queue
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("queue item {id}")))?;
        if self.queue[pos].status != QueueItemStatus::Pending {
            return Err(CoreError::InvalidState("only pending items can be reordered".into()));
        }
        let item = self.queue.remove(pos).unwrap();

        let pending_before = self.queue.iter().filter(|i| i.status == QueueItemStatus::Pending).count();
        let target_pending_index = position.min(pending_before);

        let mut seen_pending = 0usize;
        let mut insert_at = self.queue.len();
        for (idx, existing) in self.queue.iter().enumerate() {
            if existing.status == QueueItemStatus::Pending {
                if seen_pending == target_pending_index {
                    insert_at = idx;
                    break;
                }
                seen_pending += 1;
            }
        }
        self.queue.insert(insert_at, item);
        self.append(EventKind::QueueUpdate { queue_item_id: id, status: QueueItemStatus::Pending });
        Ok(())
    }

    async fn do_start(&mut self) -> CoreResult<()> {
        if self.session.state.is_active() {
            return Err(CoreError::InvalidState("session already active".into()));
        }
        self.transition(SessionState::Starting);

        let params = DriverStartParams {
            session_id: self.session.id.to_string(),
            working_directory: self.store.require_project(self.session.project_id)?.working_directory,
            model: self.session.model.clone(),
            system_prompt_append: self.session.system_prompt_append.clone(),
            allowed_tools: self.session.allowed_tools.iter().cloned().collect(),
            permission_mode: self.session.current_permission_mode,
            command: self.session.agent_command.clone(),
            debug_log_path: self
                .log
                .path()
                .parent()
                .map(|p| p.join("driver.log"))
                .unwrap_or_else(|| std::path::PathBuf::from("driver.log")),
        };

        let result = tokio::time::timeout(self.config.init_timeout(), self.driver.start(params)).await;
        match result {
            Ok(Ok(())) => {
                if !self.driver_events_taken {
                    self.driver_rx = Some(self.driver.take_events());
                    self.driver_events_taken = true;
                }
                self.session.started_at = Some(Utc::now());
                self.transition(SessionState::Active { processing: false, paused_on: None });
                Ok(())
            }
            Ok(Err(e)) => {
                self.transition(SessionState::Error { reason: e.to_string() });
                Err(e)
            }
            Err(_) => {
                self.transition(SessionState::Error { reason: "driver init timed out".into() });
                Err(CoreError::Timeout("agent driver did not initialize in time".into()))
            }
        }
    }

    async fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::SystemInit { .. } => {}
            DriverEvent::AssistantText { text } => {
                self.append(EventKind::AssistantText { text });
            }
            DriverEvent::AssistantThinking { text } => {
                self.append(EventKind::AssistantThinking { text });
            }
            DriverEvent::ToolUse { tool_use_id, name, input } => {
                self.active_tool_ids.insert(tool_use_id.clone());
                self.tool_calls.insert(tool_use_id.clone(), ToolCall::new(tool_use_id.clone(), name.clone(), input.clone()));
                self.append(EventKind::ToolUse { tool_use_id, name, input });
            }
            DriverEvent::PermissionNeeded { tool_use_id, suggestions } => {
                self.on_permission_needed(tool_use_id, suggestions).await;
            }
            DriverEvent::ToolResult { tool_use_id, output, is_error } => {
                if let Some(tc) = self.tool_calls.get_mut(&tool_use_id) {
                    tc.status = if is_error { ToolCallStatus::Error } else { ToolCallStatus::Completed };
                    tc.result = Some(output.clone());
                    tc.is_error = is_error;
                    tc.ended_at = Some(Utc::now());
                }
                self.active_tool_ids.remove(&tool_use_id);
                self.append(EventKind::ToolResult { tool_use_id, output, is_error, synthetic: false });
            }
            DriverEvent::Result { is_error, summary } => {
                if let Some(id) = self.running_item.take() {
                    if let Some(item) = self.queue.iter_mut().find(|i| i.id == id) {
                        item.status = QueueItemStatus::Done;
                    }
                    self.append(EventKind::QueueUpdate { queue_item_id: id, status: QueueItemStatus::Done });
                }
                self.session.latest_message_summary = summary;
                self.session.touch();
                let _ = is_error;
                self.transition(SessionState::Active { processing: false, paused_on: None });
            }
            DriverEvent::DriverDown { reason } => {
                self.orphan_active_work(Responder::Synthetic).await;
                self.transition(SessionState::Error { reason });
            }
        }
    }

    /// Raise a permission request for `tool_use_id`. If an earlier
    /// `extend_suggestion_rule` suggestion already covers this tool's name,
    /// the request is recorded and immediately auto-resolved (§9) instead of
    /// pausing the session on the user.
    async fn on_permission_needed(&mut self, tool_use_id: String, suggestions: Vec<PermissionSuggestion>) {
        let Some(tc) = self.tool_calls.get(&tool_use_id) else {
            tracing::warn!(session_id = %self.session.id, tool_use_id, "permission request for unknown tool-use");
            return;
        };
        let tool_name = tc.name.clone();
        let req = PermissionRequest::new(self.session.id, tool_use_id.clone(), tool_name.clone(), tc.input.clone(), suggestions);
        let request_id = req.id.to_string();

        if let Some(tc) = self.tool_calls.get_mut(&tool_use_id) {
            tc.status = ToolCallStatus::PermissionRequired;
            tc.permission_request_id = Some(req.id);
        }
        let auto_effect = self.session.suggestion_rules.iter().find_map(|r| r.effect_for(&tool_name));
        self.permission_requests.insert(request_id.clone(), req);
        self.append(EventKind::PermissionRequest { request_id: request_id.clone(), tool_use_id: tool_use_id.clone() });

        match auto_effect {
            Some(decision) => {
                if let Err(e) = self.resolve_permission(request_id, tool_use_id, decision, Responder::AutoRule, false).await {
                    tracing::warn!(session_id = %self.session.id, error = %e, "auto-rule permission response failed");
                }
            }
            None => {
                self.session.state = SessionState::Active { processing: true, paused_on: Some(tool_use_id) };
                self.persist_session();
            }
        }
    }

    async fn do_respond_permission(
        &mut self,
        request_id: String,
        decision: PermissionDecision,
        apply_suggestions: bool,
    ) -> CoreResult<()> {
        let tool_use_id = {
            let req = self
                .permission_requests
                .get(&request_id)
                .ok_or_else(|| CoreError::NotFound(format!("permission request {request_id}")))?;
            if req.is_resolved() {
                return Err(CoreError::InvalidState("permission request already resolved".into()));
            }
            req.tool_use_id.clone()
        };
        self.resolve_permission(request_id, tool_use_id, decision, Responder::User, apply_suggestions).await
    }

    /// Common tail shared by a user's live response and an auto-rule's
    /// instant response: marks the request resolved, writes the
    /// `PermissionResponse` event, updates the tool-call projection, clears
    /// `paused_on` if this tool-use was blocking the session, applies
    /// suggestions, handles the `exit_plan_mode` coupling (§4.4 step 6), and
    /// forwards the decision to the driver.
    async fn resolve_permission(
        &mut self,
        request_id: String,
        tool_use_id: String,
        decision: PermissionDecision,
        responder: Responder,
        apply_suggestions: bool,
    ) -> CoreResult<()> {
        let suggestions = match self.permission_requests.get_mut(&request_id) {
            Some(req) => {
                req.resolve(decision.clone(), responder);
                req.suggestions.clone()
            }
            None => Vec::new(),
        };
        let is_exit_plan_mode = self
            .tool_calls
            .get(&tool_use_id)
            .map(|tc| tc.name == "exit_plan_mode")
            .unwrap_or(false);

        self.append(EventKind::PermissionResponse { request_id: request_id.clone(), decision: decision.clone() });

        if let Some(tc) = self.tool_calls.get_mut(&tool_use_id) {
            tc.status = match &decision {
                PermissionDecision::Deny => ToolCallStatus::Cancelled,
                _ => ToolCallStatus::Executing,
            };
        }

        if matches!(self.session.state, SessionState::Active { paused_on: Some(ref p), .. } if *p == tool_use_id) {
            self.session.state = SessionState::Active { processing: true, paused_on: None };
            self.persist_session();
        }

        if apply_suggestions {
            for s in suggestions {
                self.apply_suggestion(s).await;
            }
        }
        if matches!(decision, PermissionDecision::Allow | PermissionDecision::AllowWithModifiedInput { .. })
            && is_exit_plan_mode
        {
            self.do_set_permission_mode(PermissionMode::AcceptEdits).await.ok();
        }

        self.driver.respond_to_permission(request_id, decision).await
    }

    async fn apply_suggestion(&mut self, suggestion: PermissionSuggestion) {
        match suggestion {
            PermissionSuggestion::SetPermissionMode { mode } => {
                let _ = self.do_set_permission_mode(mode).await;
            }
            PermissionSuggestion::AddAllowedTool { tool_name } => {
                self.session.allowed_tools.insert(tool_name);
                self.persist_session();
            }
            PermissionSuggestion::ExtendSuggestionRule { rule_match, effect } => {
                self.session.suggestion_rules.push(SuggestionRule { rule_match, effect });
                self.persist_session();
            }
        }
    }

    async fn do_set_permission_mode(&mut self, mode: PermissionMode) -> CoreResult<()> {
        if !self.session.state.is_active() {
            return Err(CoreError::InvalidState("session is not active".into()));
        }
        self.session.current_permission_mode = mode;
        self.persist_session();
        self.driver.set_mode(mode).await
    }

    /// Cancel any undecided permission requests (synthetic deny) and any
    /// still-running tool-uses (synthetic result), then clear the pause and
    /// resume idling (§8 scenario 2). Unlike terminate/dispose/restart this
    /// keeps the session `Active`, just no longer processing or paused.
    async fn do_interrupt(&mut self) -> CoreResult<()> {
        self.cancel_active_tool_uses();
        if self.session.state.is_active() {
            self.transition(SessionState::Active { processing: false, paused_on: None });
        }
        self.driver.interrupt().await
    }

    async fn do_terminate(&mut self) -> CoreResult<()> {
        self.driver.stop().await.ok();
        self.orphan_active_work(Responder::Synthetic).await;
        self.transition(SessionState::Terminated { disposed: false });
        Ok(())
    }

    async fn do_dispose(&mut self) -> CoreResult<()> {
        self.driver.stop().await.ok();
        self.orphan_active_work(Responder::Synthetic).await;
        self.transition(SessionState::Terminated { disposed: true });
        self.driver_rx = None;
        Ok(())
    }

    async fn do_restart(&mut self) -> CoreResult<()> {
        self.driver.stop().await.ok();
        self.orphan_active_work(Responder::Synthetic).await;
        self.transition(SessionState::Terminating);
        self.do_start().await
    }

    async fn do_reset(&mut self) -> CoreResult<()> {
        self.driver.stop().await.ok();
        self.transition(SessionState::Terminating);
        self.log.truncate()?;
        self.tool_calls.clear();
        self.active_tool_ids.clear();
        self.permission_requests.clear();
        self.queue.clear();
        self.running_item = None;
        self.session.started_at = None;
        self.session.current_permission_mode = self.session.initial_permission_mode;
        self.transition(SessionState::Created);
        Ok(())
    }

    async fn do_disconnect(&mut self) -> CoreResult<()> {
        self.driver.stop().await.ok();
        self.orphan_active_work(Responder::Synthetic).await;
        self.transition(SessionState::Created);
        Ok(())
    }

    fn resolve_undecided_with_synthetic_denial(&mut self) {
        let undecided_ids: Vec<String> = self
            .permission_requests
            .iter()
            .filter(|(_, r)| !r.is_resolved())
            .map(|(id, _)| id.clone())
            .collect();
        for id in undecided_ids {
            if let Some(req) = self.permission_requests.get_mut(&id) {
                req.resolve(PermissionDecision::Deny, Responder::Synthetic);
                let tool_use_id = req.tool_use_id.clone();
                if let Some(tc) = self.tool_calls.get_mut(&tool_use_id) {
                    tc.status = ToolCallStatus::Cancelled;
                    tc.ended_at = Some(Utc::now());
                }
                self.append(EventKind::PermissionResponse { request_id: id, decision: PermissionDecision::Deny });
            }
        }
    }

    /// Resolve undecided permission requests and cancel any tool-uses that
    /// never got a terminal result, writing synthetic tool-result markers so
    /// the log reflects a complete lifecycle (§4.4 tool-call invariant).
    fn cancel_active_tool_uses(&mut self) {
        self.resolve_undecided_with_synthetic_denial();
        let orphaned: Vec<String> = self.active_tool_ids.iter().cloned().collect();
        for tool_use_id in orphaned {
            if let Some(tc) = self.tool_calls.get_mut(&tool_use_id) {
                if !tc.status.is_terminal() {
                    tc.status = ToolCallStatus::Cancelled;
                    tc.ended_at = Some(Utc::now());
                }
            }
            self.append(EventKind::ToolResult {
                tool_use_id,
                output: serde_json::Value::Null,
                is_error: false,
                synthetic: true,
            });
        }
        self.active_tool_ids.clear();
    }

    /// Used by terminate/dispose/restart/disconnect: cancels active
    /// tool-uses (see `cancel_active_tool_uses`) and also abandons the
    /// currently running queue item, since the session is leaving `active`
    /// entirely.
    async fn orphan_active_work(&mut self, _responder: Responder) {
        self.cancel_active_tool_uses();
        if let Some(id) = self.running_item.take() {
            if let Some(item) = self.queue.iter_mut().find(|i| i.id == id) {
                item.status = QueueItemStatus::Cancelled;
            }
            self.append(EventKind::QueueUpdate { queue_item_id: id, status: QueueItemStatus::Cancelled });
        }
    }

    async fn try_dispatch_next(&mut self) {
        if self.queue_paused || self.running_item.is_some() {
            return;
        }
        if !matches!(self.session.state, SessionState::Active { processing: false, paused_on: None }) {
            return;
        }
        let Some(pos) = self.queue.iter().position(|i| i.status == QueueItemStatus::Pending) else {
            return;
        };
        let item = self.queue.get_mut(pos).unwrap();
        item.status = QueueItemStatus::Running;
        let item = item.clone();
        self.running_item = Some(item.id);

        self.append(EventKind::QueueUpdate { queue_item_id: item.id, status: QueueItemStatus::Running });
        self.append(EventKind::UserInput {
            body: item.body.clone(),
            attachments: item.attachments.clone(),
            origin: item.origin,
        });
        self.session.state = SessionState::Active { processing: true, paused_on: None };
        self.persist_session();

        if let Err(e) = self.driver.send(item.body.clone(), item.attachments.clone()).await {
            tracing::error!(session_id = %self.session.id, error = %e, "failed to forward queued input to driver");
            self.session.state = SessionState::Error { reason: e.to_string() };
            self.persist_session();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EffectiveStatus, PermissionMode, Project, ToolCallStatus};
    use crate::driver::fake::FakeAgentDriver;
    use std::collections::HashSet;

    async fn spawn_test_session() -> (RuntimeHandle, Arc<dyn AgentDriver>, mpsc::Sender<DriverEvent>, Arc<EventLog>) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let project = Project::new("demo", dir.path().to_path_buf(), 0, true, 10);
        store.projects.put(project.id, project.clone()).unwrap();
        let session = Session::new(
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
        store.sessions.put(session.id, session.clone()).unwrap();

        let log = Arc::new(EventLog::open(dir.path().join("events")).unwrap());
        let observer = ObserverHub::new(32);
        let (driver, driver_tx) = FakeAgentDriver::new();
        let driver: Arc<dyn AgentDriver> = driver;
        let config = Arc::new(RuntimeConfig::default());
        let handle = spawn(session, config, store, log.clone(), observer, driver.clone());
        (handle, driver, driver_tx, log)
    }

    /// §8 scenario 1: tool approval happy path.
    #[tokio::test]
    async fn tool_approval_happy_path() {
        let (handle, _driver, driver_tx, _log) = spawn_test_session().await;
        handle.start().await.unwrap();
        handle
            .enqueue_input("write file A".into(), Vec::new(), HashMap::new(), InputOrigin::User, false)
            .await
            .unwrap();

        driver_tx
            .send(DriverEvent::ToolUse {
                tool_use_id: "tu1".into(),
                name: "Write".into(),
                input: serde_json::json!({"path": "A"}),
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.tool_calls[0].status, ToolCallStatus::Pending);

        driver_tx
            .send(DriverEvent::PermissionNeeded { tool_use_id: "tu1".into(), suggestions: Vec::new() })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.undecided_permission_requests.len(), 1);
        let request_id = snap.undecided_permission_requests[0].id.to_string();

        handle.respond_permission(request_id, PermissionDecision::Allow, false).await.unwrap();

        driver_tx
            .send(DriverEvent::ToolResult {
                tool_use_id: "tu1".into(),
                output: serde_json::json!({"ok": true}),
                is_error: false,
            })
            .await
            .unwrap();
        driver_tx
            .send(DriverEvent::AssistantText { text: "done".into() })
            .await
            .unwrap();
        driver_tx.send(DriverEvent::Result { is_error: false, summary: Some("done".into()) }).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.session.state.effective_status(), EffectiveStatus::Idle);
        assert_eq!(snap.tool_calls[0].status, ToolCallStatus::Completed);
        assert!(snap.undecided_permission_requests.is_empty());
    }

    /// §8 scenario 2: interrupt while a permission request is outstanding
    /// resolves it with a synthetic denial.
    #[tokio::test]
    async fn interrupt_during_permission_synthesizes_denial() {
        let (handle, _driver, driver_tx, log) = spawn_test_session().await;
        handle.start().await.unwrap();
        handle
            .enqueue_input("do something".into(), Vec::new(), HashMap::new(), InputOrigin::User, false)
            .await
            .unwrap();
        driver_tx
            .send(DriverEvent::ToolUse { tool_use_id: "tu1".into(), name: "Bash".into(), input: serde_json::json!({}) })
            .await
            .unwrap();
        driver_tx
            .send(DriverEvent::PermissionNeeded { tool_use_id: "tu1".into(), suggestions: Vec::new() })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        handle.interrupt().await.unwrap();

        let snap = handle.snapshot().await.unwrap();
        assert!(snap.undecided_permission_requests.is_empty());
        assert_eq!(snap.tool_calls[0].status, ToolCallStatus::Cancelled);

        // §8 scenario 2's exact expected tail: a synthetic deny, a
        // synthetic cancelled tool-result for the still-active tool-use,
        // then the state change back to idle.
        let tail: Vec<Event> = log.read_tail(0).unwrap();
        let mut it = tail.iter().rev();
        match it.next().map(|e| &e.kind) {
            Some(EventKind::StateChange { from, to }) => {
                assert_eq!(from, "WaitingOnUser");
                assert_eq!(to, "Idle");
            }
            other => panic!("expected trailing state_change event, got {other:?}"),
        }
        match it.next().map(|e| &e.kind) {
            Some(EventKind::ToolResult { tool_use_id, synthetic, .. }) => {
                assert_eq!(tool_use_id, "tu1");
                assert!(*synthetic);
            }
            other => panic!("expected synthetic tool_result event, got {other:?}"),
        }
        match it.next().map(|e| &e.kind) {
            Some(EventKind::PermissionResponse { decision, .. }) => {
                assert!(matches!(decision, PermissionDecision::Deny));
            }
            other => panic!("expected permission_response(deny) event, got {other:?}"),
        }
    }

    /// §8 scenario 3: driver crash mid-turn cancels the in-flight tool-use
    /// and the queue item, and moves the session to `error`.
    #[tokio::test]
    async fn driver_crash_orphans_tool_use() {
        let (handle, _driver, driver_tx, _log) = spawn_test_session().await;
        handle.start().await.unwrap();
        handle
            .enqueue_input("do something".into(), Vec::new(), HashMap::new(), InputOrigin::User, false)
            .await
            .unwrap();
        driver_tx
            .send(DriverEvent::ToolUse { tool_use_id: "tu1".into(), name: "Bash".into(), input: serde_json::json!({}) })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        driver_tx.send(DriverEvent::DriverDown { reason: "child exited".into() }).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.session.state.effective_status(), EffectiveStatus::Error);
        assert_eq!(snap.tool_calls[0].status, ToolCallStatus::Cancelled);
        assert!(snap.queue.iter().all(|q| q.status == QueueItemStatus::Cancelled));

        handle.start().await.unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.session.state.effective_status(), EffectiveStatus::Idle);
    }

    #[tokio::test]
    async fn enqueue_rejected_once_terminating() {
        let (handle, _driver, _driver_tx, _log) = spawn_test_session().await;
        handle.start().await.unwrap();
        handle.terminate().await.unwrap();
        let err = handle
            .enqueue_input("late".into(), Vec::new(), HashMap::new(), InputOrigin::User, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn restart_preserves_events_reset_clears_them() {
        let (handle, _driver, driver_tx, _log) = spawn_test_session().await;
        handle.start().await.unwrap();
        handle
            .enqueue_input("hi".into(), Vec::new(), HashMap::new(), InputOrigin::User, false)
            .await
            .unwrap();
        driver_tx.send(DriverEvent::Result { is_error: false, summary: None }).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        handle.restart().await.unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.session.state.effective_status(), EffectiveStatus::Idle);

        handle.reset().await.unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.session.state.effective_status(), EffectiveStatus::Created);
        assert!(snap.queue.is_empty());
        assert!(snap.tool_calls.is_empty());
    }

    /// `patch_timing`: reordering only moves pending items, leaving the
    /// in-flight running item's position untouched.
    #[tokio::test]
    async fn reorder_queue_item_moves_among_pending_only() {
        let (handle, _driver, _driver_tx, _log) = spawn_test_session().await;
        handle.start().await.unwrap();
        handle.pause_queue().await.unwrap();
        handle
            .enqueue_input("first".into(), Vec::new(), HashMap::new(), InputOrigin::User, false)
            .await
            .unwrap();
        handle
            .enqueue_input("second".into(), Vec::new(), HashMap::new(), InputOrigin::User, false)
            .await
            .unwrap();
        handle
            .enqueue_input("third".into(), Vec::new(), HashMap::new(), InputOrigin::User, false)
            .await
            .unwrap();

        let snap = handle.snapshot().await.unwrap();
        let third_id = snap.queue[2].id;
        assert_eq!(
            snap.queue.iter().map(|i| i.body.as_str()).collect::<Vec<_>>(),
            vec!["first", "second", "third"]
        );

        handle.reorder_queue_item(third_id, 0).await.unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(
            snap.queue.iter().map(|i| i.body.as_str()).collect::<Vec<_>>(),
            vec!["third", "first", "second"]
        );
        assert!(snap.queue.iter().all(|i| i.status == QueueItemStatus::Pending));

        let err = handle.reorder_queue_item(QueueItemId::new(), 0).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
