//! Observer Hub (§4.8): fans out events to subscribers with a resumable
//! cursor, bounded per-subscriber backpressure, and heartbeats.
//!
//! Built on `tokio::sync::broadcast` rather than a hand-rolled ring buffer —
//! its bounded capacity and `RecvError::Lagged` signal give a "bounded
//! outbound queue, drop on overflow" contract for free, and broadcast
//! channels are a natural fit for fanning a single event stream out to
//! many listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::domain::{Comm, Event, EffectiveStatus, LegionId, ScheduleId, SessionId};
use crate::event_log::EventLog;

/// A legion-scoped notice that isn't a comm but still belongs on the legion
/// stream (§6: `minion_created`, `minion_disposed`, `schedule_updated`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LegionNotice {
    MinionCreated { session_id: SessionId },
    MinionDisposed { session_id: SessionId },
    ScheduleUpdated { schedule_id: ScheduleId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LegionMessage {
    Comm(Comm),
    Notice(LegionNotice),
    Heartbeat { at: DateTime<Utc> },
}

/// A coarse, project/session-list-level notice for the global UI stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UiMessage {
    SessionStateChanged { session_id: SessionId, status: EffectiveStatus },
    ProjectListChanged,
    Heartbeat { at: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionMessage {
    Event(Event),
    Heartbeat { at: DateTime<Utc> },
}

/// What a replay-then-live subscription ends with when it cannot keep up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    Lagged,
    Closed,
    /// No `ack()` was observed within `heartbeat_interval + heartbeat_grace`
    /// of the last one (§4.8: "subscribers that do not acknowledge within a
    /// grace window are disconnected").
    Stale,
}

struct Channel<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> Channel<T> {
    fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }
}

pub struct ObserverHub {
    capacity: usize,
    sessions: DashMap<SessionId, Arc<Channel<SessionMessage>>>,
    legions: DashMap<LegionId, Arc<Channel<LegionMessage>>>,
    ui: Arc<Channel<UiMessage>>,
    event_logs: Mutex<HashMap<SessionId, Arc<EventLog>>>,
    legion_logs: Mutex<HashMap<LegionId, Arc<EventLog>>>,
    heartbeat_interval: Duration,
    heartbeat_grace: Duration,
}

impl ObserverHub {
    /// Convenience constructor for call sites (mostly tests) that don't care
    /// about heartbeat timing; uses the same defaults as `RuntimeConfig`.
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::with_heartbeat(capacity, Duration::from_secs(15), Duration::from_secs(45))
    }

    pub fn with_heartbeat(capacity: usize, heartbeat_interval: Duration, heartbeat_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            sessions: DashMap::new(),
            legions: DashMap::new(),
            ui: Arc::new(Channel::new(capacity)),
            event_logs: Mutex::new(HashMap::new()),
            legion_logs: Mutex::new(HashMap::new()),
            heartbeat_interval,
            heartbeat_grace,
        })
    }

    pub fn register_session_log(&self, session_id: SessionId, log: Arc<EventLog>) {
        self.event_logs.lock().unwrap().insert(session_id, log);
    }

    pub fn register_legion_log(&self, legion_id: LegionId, log: Arc<EventLog>) {
        self.legion_logs.lock().unwrap().insert(legion_id, log);
    }

    fn session_channel(&self, session_id: SessionId) -> Arc<Channel<SessionMessage>> {
        self.sessions
            .entry(session_id)
            .or_insert_with(|| Arc::new(Channel::new(self.capacity)))
            .clone()
    }

    fn legion_channel(&self, legion_id: LegionId) -> Arc<Channel<LegionMessage>> {
        self.legions
            .entry(legion_id)
            .or_insert_with(|| Arc::new(Channel::new(self.capacity)))
            .clone()
    }

    pub fn publish_session_event(&self, session_id: SessionId, event: Event) {
        let ch = self.session_channel(session_id);
        let _ = ch.tx.send(SessionMessage::Event(event));
    }

    pub fn publish_comm(&self, legion_id: LegionId, comm: Comm) {
        let ch = self.legion_channel(legion_id);
        let _ = ch.tx.send(LegionMessage::Comm(comm));
    }

    pub fn publish_legion_notice(&self, legion_id: LegionId, notice: LegionNotice) {
        let ch = self.legion_channel(legion_id);
        let _ = ch.tx.send(LegionMessage::Notice(notice));
    }

    pub fn publish_ui(&self, msg: UiMessage) {
        let _ = self.ui.tx.send(msg);
    }

    /// Replay `[from_seq, tail)` from the session's event log, then stream
    /// live appends. Returns the combined queue and a handle the caller
    /// polls with `recv_session`.
    pub fn subscribe_session(&self, session_id: SessionId, from_seq: u64) -> SessionSubscription {
        let backlog: Vec<Event> = self
            .event_logs
            .lock()
            .unwrap()
            .get(&session_id)
            .map(|log| log.read_tail(from_seq).unwrap_or_default())
            .unwrap_or_default();
        let rx = self.session_channel(session_id).tx.subscribe();
        SessionSubscription {
            backlog,
            rx,
            last_ack: Instant::now(),
            grace_deadline: self.heartbeat_interval + self.heartbeat_grace,
        }
    }

    pub fn subscribe_legion(&self, legion_id: LegionId, from_seq: u64) -> LegionSubscription {
        let backlog: Vec<Comm> = self
            .legion_logs
            .lock()
            .unwrap()
            .get(&legion_id)
            .map(|log| log.read_tail(from_seq).unwrap_or_default())
            .unwrap_or_default();
        let rx = self.legion_channel(legion_id).tx.subscribe();
        LegionSubscription {
            backlog,
            rx,
            last_ack: Instant::now(),
            grace_deadline: self.heartbeat_interval + self.heartbeat_grace,
        }
    }

    /// Page through a session's durable event history for `get_messages`,
    /// independent of any live subscription.
    pub fn session_messages(&self, session_id: SessionId, offset: u64, limit: u64) -> Vec<Event> {
        let Some(log) = self.event_logs.lock().unwrap().get(&session_id).cloned() else {
            return Vec::new();
        };
        if limit == 0 {
            return Vec::new();
        }
        log.read_range(offset, offset + limit - 1).unwrap_or_default()
    }

    pub fn subscribe_ui(&self) -> broadcast::Receiver<UiMessage> {
        self.ui.tx.subscribe()
    }

    /// Drive periodic heartbeats; spawned once per process.
    pub fn spawn_heartbeat(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.heartbeat_interval);
            loop {
                ticker.tick().await;
                let at = Utc::now();
                for entry in self.sessions.iter() {
                    let _ = entry.value().tx.send(SessionMessage::Heartbeat { at });
                }
                for entry in self.legions.iter() {
                    let _ = entry.value().tx.send(LegionMessage::Heartbeat { at });
                }
                let _ = self.ui.tx.send(UiMessage::Heartbeat { at });
            }
        });
    }
}

pub struct SessionSubscription {
    backlog: Vec<Event>,
    rx: broadcast::Receiver<SessionMessage>,
    last_ack: Instant,
    grace_deadline: Duration,
}

impl SessionSubscription {
    /// Drains the replayed backlog first, then the live stream. Returns
    /// `Err(Disconnect::Lagged)` once the subscriber falls behind the
    /// channel's bounded capacity, or `Err(Disconnect::Stale)` once
    /// `heartbeat_interval + heartbeat_grace` has elapsed since the last
    /// call to `ack()` without one (§4.8).
    pub async fn recv(&mut self) -> Result<SessionMessage, Disconnect> {
        if !self.backlog.is_empty() {
            return Ok(SessionMessage::Event(self.backlog.remove(0)));
        }
        let deadline = self.last_ack + self.grace_deadline;
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => Err(Disconnect::Stale),
            msg = self.rx.recv() => match msg {
                Ok(msg) => Ok(msg),
                Err(broadcast::error::RecvError::Lagged(_)) => Err(Disconnect::Lagged),
                Err(broadcast::error::RecvError::Closed) => Err(Disconnect::Closed),
            },
        }
    }

    /// Record that the subscriber is alive, resetting the grace-window
    /// deadline. Transports call this whenever they receive an acknowledgment
    /// from the far end (e.g. a WebSocket pong) — not on every `recv()`.
    pub fn ack(&mut self) {
        self.last_ack = Instant::now();
    }
}

pub struct LegionSubscription {
    backlog: Vec<Comm>,
    rx: broadcast::Receiver<LegionMessage>,
    last_ack: Instant,
    grace_deadline: Duration,
}

impl LegionSubscription {
    pub async fn recv(&mut self) -> Result<LegionMessage, Disconnect> {
        if !self.backlog.is_empty() {
            return Ok(LegionMessage::Comm(self.backlog.remove(0)));
        }
        let deadline = self.last_ack + self.grace_deadline;
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => Err(Disconnect::Stale),
            msg = self.rx.recv() => match msg {
                Ok(msg) => Ok(msg),
                Err(broadcast::error::RecvError::Lagged(_)) => Err(Disconnect::Lagged),
                Err(broadcast::error::RecvError::Closed) => Err(Disconnect::Closed),
            },
        }
    }

    pub fn ack(&mut self) {
        self.last_ack = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventKind;

    fn sample_event(session_id: SessionId, seq: u64) -> Event {
        Event { session_id, seq, at: Utc::now(), kind: EventKind::SystemNotice { text: "hi".into() } }
    }

    #[tokio::test]
    async fn replays_backlog_then_live() {
        let hub = ObserverHub::new(8);
        let session_id = SessionId::new();
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path().join("events")).unwrap());
        log.append(&sample_event(session_id, 0)).unwrap();
        hub.register_session_log(session_id, log.clone());

        let mut sub = hub.subscribe_session(session_id, 0);
        hub.publish_session_event(session_id, sample_event(session_id, 1));

        let first = sub.recv().await.unwrap();
        assert!(matches!(first, SessionMessage::Event(e) if e.seq == 0));
        let second = sub.recv().await.unwrap();
        assert!(matches!(second, SessionMessage::Event(e) if e.seq == 1));
    }

    #[tokio::test]
    async fn overflow_disconnects_as_lagged() {
        let hub = ObserverHub::new(2);
        let session_id = SessionId::new();
        let mut sub = hub.subscribe_session(session_id, 0);
        for i in 0..10 {
            hub.publish_session_event(session_id, sample_event(session_id, i));
        }
        let mut saw_lag = false;
        for _ in 0..10 {
            if sub.recv().await.is_err() {
                saw_lag = true;
                break;
            }
        }
        assert!(saw_lag);
    }
}
