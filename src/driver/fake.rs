//! A scripted in-process driver double used by runtime tests, standing in
//! for a real child process without spawning anything external.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{AgentDriver, DriverEvent, DriverStartParams};
use crate::domain::PermissionDecision;
use crate::error::{CoreError, CoreResult};

/// Calls the fake driver observed, for assertions in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Start,
    Send(String),
    RespondToPermission(String, String),
    SetMode(String),
    Interrupt,
    Stop,
}

pub struct FakeAgentDriver {
    events_tx: mpsc::Sender<DriverEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DriverEvent>>>,
    pub calls: Mutex<Vec<RecordedCall>>,
    started: Mutex<bool>,
}

impl FakeAgentDriver {
    pub fn new() -> (std::sync::Arc<Self>, mpsc::Sender<DriverEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let driver = std::sync::Arc::new(Self {
            events_tx: tx.clone(),
            events_rx: Mutex::new(Some(rx)),
            calls: Mutex::new(Vec::new()),
            started: Mutex::new(false),
        });
        (driver, tx)
    }

    pub async fn push(&self, event: DriverEvent) {
        let _ = self.events_tx.send(event).await;
    }
}

#[async_trait]
impl AgentDriver for FakeAgentDriver {
    async fn start(&self, _params: DriverStartParams) -> CoreResult<()> {
        *self.started.lock().unwrap() = true;
        self.calls.lock().unwrap().push(RecordedCall::Start);
        let _ = self
            .events_tx
            .send(DriverEvent::SystemInit { subtype: "ready".into() })
            .await;
        Ok(())
    }

    async fn send(&self, user_input: String, _attachments: Vec<String>) -> CoreResult<()> {
        if !*self.started.lock().unwrap() {
            return Err(CoreError::InvalidState("driver not started".into()));
        }
        self.calls.lock().unwrap().push(RecordedCall::Send(user_input));
        Ok(())
    }

    async fn respond_to_permission(
        &self,
        request_id: String,
        decision: PermissionDecision,
    ) -> CoreResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedCall::RespondToPermission(request_id, format!("{decision:?}")));
        Ok(())
    }

    async fn set_mode(&self, mode: crate::domain::PermissionMode) -> CoreResult<()> {
        self.calls.lock().unwrap().push(RecordedCall::SetMode(format!("{mode:?}")));
        Ok(())
    }

    async fn interrupt(&self) -> CoreResult<()> {
        self.calls.lock().unwrap().push(RecordedCall::Interrupt);
        Ok(())
    }

    async fn stop(&self) -> CoreResult<()> {
        self.calls.lock().unwrap().push(RecordedCall::Stop);
        *self.started.lock().unwrap() = false;
        Ok(())
    }

    fn take_events(&self) -> mpsc::Receiver<DriverEvent> {
        self.events_rx.lock().unwrap().take().expect("take_events called more than once")
    }
}
