//! Comm Router (§4.5): delivers typed inter-minion messages with at-most-one
//! delivery per recipient and the three priority-driven dispatch rules.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::domain::{
    Comm, CommDeliveryStatus, CommKind, CommPriority, CommTarget, InputOrigin, LegionId, ProjectId,
    SessionId, SessionState,
};
use crate::error::{CoreError, CoreResult};
use crate::event_log::EventLog;
use crate::observer::ObserverHub;
use crate::runtime::RuntimeRegistry;
use crate::state_store::StateStore;

pub struct CommRouter {
    store: Arc<StateStore>,
    observer: Arc<ObserverHub>,
    runtimes: RuntimeRegistry,
    legion_logs: std::sync::Mutex<HashMap<LegionId, Arc<EventLog>>>,
    data_dir: std::path::PathBuf,
}

impl CommRouter {
    pub fn new(
        store: Arc<StateStore>,
        observer: Arc<ObserverHub>,
        runtimes: RuntimeRegistry,
        data_dir: std::path::PathBuf,
    ) -> Self {
        Self { store, observer, runtimes, legion_logs: std::sync::Mutex::new(HashMap::new()), data_dir }
    }

    fn legion_log(&self, legion_id: LegionId) -> CoreResult<Arc<EventLog>> {
        let mut logs = self.legion_logs.lock().unwrap();
        if let Some(log) = logs.get(&legion_id) {
            return Ok(log.clone());
        }
        let path = self.data_dir.join("legions").join(legion_id.to_string()).join("comms");
        let log = Arc::new(EventLog::open(path)?);
        self.observer.register_legion_log(legion_id, log.clone());
        logs.insert(legion_id, log.clone());
        Ok(log)
    }

    /// Validate, order, dispatch, and persist one outbound comm.
    pub async fn send_comm(
        &self,
        sender_id: SessionId,
        target: CommTarget,
        kind: CommKind,
        summary: String,
        body: String,
        priority: CommPriority,
    ) -> CoreResult<Comm> {
        let sender = self.store.require_session(sender_id)?;
        let legion_id: LegionId = sender.project_id.into();
        let project = self.store.require_project(sender.project_id)?;
        if !project.is_legion {
            return Err(CoreError::BadRequest("sender's project is not a legion".into()));
        }

        match &target {
            CommTarget::Minion { session_id } => {
                let recipient = self.store.require_session(*session_id)?;
                if recipient.project_id != sender.project_id {
                    return Err(CoreError::BadRequest("recipient is not a member of the sender's legion".into()));
                }
            }
            CommTarget::Broadcast => {
                return Err(CoreError::BadRequest("use broadcast() for fan-out comms".into()));
            }
            CommTarget::External => {}
        }

        let log = self.legion_log(legion_id)?;
        let legion_seq = log.count();

        let delivery_status = self.dispatch(&target, &kind, &summary, &body, priority).await;

        let comm = Comm {
            id: crate::domain::CommId::new(),
            legion_id,
            sender_id,
            target,
            kind,
            summary,
            body,
            priority,
            created_at: Utc::now(),
            legion_seq,
            delivery_status,
        };

        log.append(&comm)?;
        self.observer.publish_comm(legion_id, comm.clone());
        Ok(comm)
    }

    async fn dispatch(
        &self,
        target: &CommTarget,
        kind: &CommKind,
        summary: &str,
        body: &str,
        priority: CommPriority,
    ) -> CommDeliveryStatus {
        match target {
            CommTarget::External => CommDeliveryStatus::SurfacedOnly,
            CommTarget::Minion { session_id } => {
                if self.deliver_to(*session_id, kind, summary, body, priority).await {
                    CommDeliveryStatus::Delivered
                } else {
                    CommDeliveryStatus::NotDelivered
                }
            }
            CommTarget::Broadcast => unreachable!("send_comm rejects Broadcast before dispatch"),
        }
    }

    /// Broadcast fan-out, filtered by legion membership, excluding the
    /// sender. At-most-once per live recipient; a recipient with no live
    /// runtime drops silently (logged, not persisted per-recipient — the
    /// aggregate `Comm.delivery_status` reflects whether anyone received it).
    pub async fn broadcast(
        &self,
        sender_id: SessionId,
        kind: CommKind,
        summary: String,
        body: String,
        priority: CommPriority,
    ) -> CoreResult<Comm> {
        let sender = self.store.require_session(sender_id)?;
        let project: ProjectId = sender.project_id;
        let legion_id: LegionId = project.into();
        let siblings = self.store.list_children(project);

        let mut any_delivered = false;
        for s in siblings {
            if s.id == sender_id {
                continue;
            }
            if self.deliver_to(s.id, &kind, &summary, &body, priority).await {
                any_delivered = true;
            }
        }

        let log = self.legion_log(legion_id)?;
        let legion_seq = log.count();
        let comm = Comm {
            id: crate::domain::CommId::new(),
            legion_id,
            sender_id,
            target: CommTarget::Broadcast,
            kind,
            summary,
            body,
            priority,
            created_at: Utc::now(),
            legion_seq,
            delivery_status: if any_delivered { CommDeliveryStatus::Delivered } else { CommDeliveryStatus::NotDelivered },
        };
        log.append(&comm)?;
        self.observer.publish_comm(legion_id, comm.clone());
        Ok(comm)
    }

    async fn deliver_to(
        &self,
        recipient_id: SessionId,
        kind: &CommKind,
        summary: &str,
        body: &str,
        priority: CommPriority,
    ) -> bool {
        let Some(handle) = self.runtimes.get(recipient_id) else {
            return false;
        };
        let Ok(snapshot) = handle.snapshot().await else {
            return false;
        };
        if snapshot.session.state.is_terminal() {
            return false;
        }

        if priority == CommPriority::Halt {
            let _ = handle.interrupt().await;
        }

        let header = format!("[comm:{:?}] {}", kind, summary);
        let full_body = format!("{header}\n\n{body}");
        // `halt` interrupts the recipient's in-flight turn and the new item
        // must be the next thing it processes; `pivot` drains the queue to
        // front without interrupting. Both land at head (§8 scenario 4).
        let front = matches!(priority, CommPriority::Halt | CommPriority::Pivot);

        handle
            .enqueue_input(full_body, Vec::new(), HashMap::new(), InputOrigin::Comm, front)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PermissionMode, Project};
    use std::collections::HashSet;

    fn legion_with_two_minions(store: &Arc<StateStore>) -> (SessionId, SessionId) {
        let project = Project::new("legion-a", std::path::PathBuf::from("/tmp"), 0, true, 10);
        store.projects.put(project.id, project.clone()).unwrap();
        let a = crate::domain::Session::new(
            project.id, None, "alpha", None, "claude", PermissionMode::Default, HashSet::new(), None, vec!["x".into()],
        );
        let mut b = crate::domain::Session::new(
            project.id, None, "beta", None, "claude", PermissionMode::Default, HashSet::new(), None, vec!["x".into()],
        );
        b.state = SessionState::Active { processing: false, paused_on: None };
        store.sessions.put(a.id, a.clone()).unwrap();
        store.sessions.put(b.id, b.clone()).unwrap();
        (a.id, b.id)
    }

    #[tokio::test]
    async fn rejects_recipient_outside_legion() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let (a, _b) = legion_with_two_minions(&store);
        let other_project = Project::new("other", std::path::PathBuf::from("/tmp"), 1, true, 10);
        store.projects.put(other_project.id, other_project.clone()).unwrap();
        let outsider = crate::domain::Session::new(
            other_project.id, None, "gamma", None, "claude", PermissionMode::Default, HashSet::new(), None, vec!["x".into()],
        );
        store.sessions.put(outsider.id, outsider.clone()).unwrap();

        let observer = ObserverHub::new(16);
        let runtimes = RuntimeRegistry::new();
        let router = CommRouter::new(store.clone(), observer, runtimes, dir.path().to_path_buf());

        let err = router
            .send_comm(
                a,
                CommTarget::Minion { session_id: outsider.id },
                CommKind::Info,
                "hi".into(),
                "body".into(),
                CommPriority::None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BadRequest(_)));
    }

    #[tokio::test]
    async fn comm_to_recipient_with_no_runtime_is_not_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let (a, b) = legion_with_two_minions(&store);
        let observer = ObserverHub::new(16);
        let runtimes = RuntimeRegistry::new();
        let router = CommRouter::new(store.clone(), observer, runtimes, dir.path().to_path_buf());

        let comm = router
            .send_comm(a, CommTarget::Minion { session_id: b }, CommKind::Task, "s".into(), "b".into(), CommPriority::None)
            .await
            .unwrap();
        assert_eq!(comm.delivery_status, CommDeliveryStatus::NotDelivered);
    }
}
