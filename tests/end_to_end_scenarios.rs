//! Multi-component end-to-end scenarios exercised through the Control
//! Surface, the same way a transport would drive this crate. Mirrors the
//! teacher's flat `tests/` integration style (`simple_integration_test.rs`)
//! rather than unit-testing one component in isolation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use legion_core::config::RuntimeConfig;
use legion_core::control::ControlSurface;
use legion_core::domain::{CommKind, CommPriority, CommTarget, EffectiveStatus, PermissionMode};
use legion_core::driver::fake::FakeAgentDriver;
use legion_core::driver::{AgentDriver, DriverEvent, DriverStartParams};
use legion_core::error::CoreError;
use legion_core::legion::DriverFactory;
use legion_core::observer::Disconnect;

/// A driver that completes every `send` on its own after a short delay,
/// standing in for an external agent that actually answers.
struct AutoReplyDriver {
    events_tx: mpsc::Sender<DriverEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DriverEvent>>>,
}

impl AutoReplyDriver {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self { events_tx: tx, events_rx: Mutex::new(Some(rx)) })
    }
}

#[async_trait]
impl AgentDriver for AutoReplyDriver {
    async fn start(&self, _params: DriverStartParams) -> Result<(), CoreError> {
        Ok(())
    }

    async fn send(&self, user_input: String, _attachments: Vec<String>) -> Result<(), CoreError> {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(DriverEvent::AssistantText { text: format!("ack: {user_input}") }).await;
            let _ = tx.send(DriverEvent::Result { is_error: false, summary: None }).await;
        });
        Ok(())
    }

    async fn respond_to_permission(
        &self,
        _request_id: String,
        _decision: legion_core::domain::PermissionDecision,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    async fn set_mode(&self, _mode: PermissionMode) -> Result<(), CoreError> {
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn take_events(&self) -> mpsc::Receiver<DriverEvent> {
        self.events_rx.lock().unwrap().take().expect("take_events called once")
    }
}

/// A driver whose `send` fires a burst of assistant-text events back to
/// back, fast enough to overrun a small observer queue.
struct BurstDriver {
    events_tx: mpsc::Sender<DriverEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DriverEvent>>>,
    burst: usize,
}

impl BurstDriver {
    fn new(burst: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1024);
        Arc::new(Self { events_tx: tx, events_rx: Mutex::new(Some(rx)), burst })
    }
}

#[async_trait]
impl AgentDriver for BurstDriver {
    async fn start(&self, _params: DriverStartParams) -> Result<(), CoreError> {
        Ok(())
    }

    async fn send(&self, _user_input: String, _attachments: Vec<String>) -> Result<(), CoreError> {
        let tx = self.events_tx.clone();
        let burst = self.burst;
        tokio::spawn(async move {
            for i in 0..burst {
                if tx.send(DriverEvent::AssistantText { text: format!("line {i}") }).await.is_err() {
                    break;
                }
            }
            let _ = tx.send(DriverEvent::Result { is_error: false, summary: None }).await;
        });
        Ok(())
    }

    async fn respond_to_permission(
        &self,
        _request_id: String,
        _decision: legion_core::domain::PermissionDecision,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    async fn set_mode(&self, _mode: PermissionMode) -> Result<(), CoreError> {
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn take_events(&self) -> mpsc::Receiver<DriverEvent> {
        self.events_rx.lock().unwrap().take().expect("take_events called once")
    }
}

/// §8 scenario 4: a `halt`-priority comm interrupts the recipient's in-flight
/// turn and is queued ahead of whatever else is still pending.
#[tokio::test]
async fn comm_with_halt_priority_interrupts_and_queues_at_head() {
    let dir = tempfile::tempdir().unwrap();
    let shared_driver = FakeAgentDriver::new().0;
    let factory_driver = shared_driver.clone();
    let factory: DriverFactory = Arc::new(move || factory_driver.clone() as Arc<dyn AgentDriver>);
    let surface = ControlSurface::open(dir.path(), RuntimeConfig::default(), factory).unwrap();

    let project = surface.create_project("legion".into(), dir.path().to_path_buf(), true, Some(10)).unwrap();
    let sender = surface
        .create_session(
            project.id,
            None,
            "alpha".into(),
            None,
            Some("claude".into()),
            Some(PermissionMode::Default),
            HashSet::new(),
            None,
            Some(vec!["fake".into()]),
        )
        .unwrap();
    let recipient = surface
        .create_session(
            project.id,
            None,
            "beta".into(),
            None,
            Some("claude".into()),
            Some(PermissionMode::Default),
            HashSet::new(),
            None,
            Some(vec!["fake".into()]),
        )
        .unwrap();

    surface.start_session(recipient.id).await.unwrap();
    // First turn dispatches immediately and never completes (no Result
    // pushed) so the recipient is mid-processing when the comm arrives.
    surface.send_message(recipient.id, "task1".into(), Vec::new()).await.unwrap();
    let second = surface.send_message(recipient.id, "task2".into(), Vec::new()).await.unwrap();

    surface
        .send_comm(
            sender.id,
            CommTarget::Minion { session_id: recipient.id },
            "urgent".into(),
            "drop everything".into(),
            CommKind::Task,
            CommPriority::Halt,
        )
        .await
        .unwrap();

    assert!(
        shared_driver.calls.lock().unwrap().iter().any(|c| matches!(c, legion_core::driver::fake::RecordedCall::Interrupt)),
        "halt priority must interrupt the recipient"
    );

    let queue = surface.list_queue(recipient.id).await.unwrap();
    let comm_index = queue.iter().position(|i| i.body.contains("drop everything")).expect("comm item queued");
    let second_index = queue.iter().position(|i| i.id == second).expect("task2 still queued");
    assert!(comm_index < second_index, "comm queues ahead of the item that was already pending");
    assert_eq!(queue[comm_index].origin, legion_core::domain::InputOrigin::Comm);
}

/// §8 scenario 5: a schedule firing with `reset_session=true` resets,
/// restarts, enqueues the prompt, completes the turn, and recomputes
/// `next_run_at`.
#[tokio::test]
async fn scheduled_prompt_with_reset_completes_and_reschedules() {
    let dir = tempfile::tempdir().unwrap();
    let factory: DriverFactory = Arc::new(|| AutoReplyDriver::new() as Arc<dyn AgentDriver>);
    let surface = ControlSurface::open(dir.path(), RuntimeConfig::default(), factory).unwrap();

    let project = surface.create_project("demo".into(), dir.path().to_path_buf(), false, None).unwrap();
    let minion = surface
        .create_session(
            project.id,
            None,
            "m".into(),
            None,
            Some("claude".into()),
            Some(PermissionMode::Default),
            HashSet::new(),
            None,
            Some(vec!["fake".into()]),
        )
        .unwrap();

    surface.start_session(minion.id).await.unwrap();
    surface.send_message(minion.id, "warm up".into(), Vec::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let legion_id: legion_core::domain::LegionId = project.id.into();
    let schedule = surface
        .create_schedule(legion_id, minion.id, "* * * * * *".into(), "scheduled prompt".into(), true, 1, 5)
        .await
        .unwrap();
    let first_next_run = schedule.next_run_at;

    let mut fired = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let current = surface.get_schedule(schedule.id).unwrap();
        if !current.history.is_empty() {
            assert_eq!(current.history[0].outcome, Some(legion_core::domain::ScheduleOutcome::Ok));
            assert_ne!(current.next_run_at, first_next_run, "next_run_at must be recomputed after firing");
            fired = true;
            break;
        }
    }
    assert!(fired, "schedule did not fire within the polling window");

    let view = surface.view_session(minion.id).await.unwrap();
    assert_eq!(view.session.state.effective_status(), EffectiveStatus::Idle);
}

/// §8 scenario 6: a subscriber that can't keep up is dropped with `lagged`,
/// and the session producing events is never blocked by it.
#[tokio::test]
async fn slow_subscriber_is_dropped_without_blocking_the_writer() {
    let dir = tempfile::tempdir().unwrap();
    let factory: DriverFactory = Arc::new(|| BurstDriver::new(200) as Arc<dyn AgentDriver>);
    let mut config = RuntimeConfig::default();
    config.observer_queue_depth = 4;
    let surface = ControlSurface::open(dir.path(), config, factory).unwrap();

    let project = surface.create_project("demo".into(), dir.path().to_path_buf(), false, None).unwrap();
    let session = surface
        .create_session(
            project.id,
            None,
            "m".into(),
            None,
            Some("claude".into()),
            Some(PermissionMode::Default),
            HashSet::new(),
            None,
            Some(vec!["fake".into()]),
        )
        .unwrap();

    surface.start_session(session.id).await.unwrap();
    let mut sub = surface.subscribe_session(session.id, 0);
    surface.send_message(session.id, "go".into(), Vec::new()).await.unwrap();

    let mut saw_lag = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        match sub.recv().await {
            Ok(_) => {}
            Err(Disconnect::Lagged) => {
                saw_lag = true;
                break;
            }
            Err(Disconnect::Closed) => break,
        }
    }
    assert!(saw_lag, "a subscriber far slower than the writer must eventually be marked lagged");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let view = surface.view_session(session.id).await.unwrap();
    assert_eq!(
        view.session.state.effective_status(),
        EffectiveStatus::Idle,
        "the writer must finish the turn regardless of the lagging subscriber"
    );
}
