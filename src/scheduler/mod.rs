//! Scheduler (§4.7): a cron-dispatch loop over a min-heap of
//! `(next_run_at, schedule_id)`, with retries, per-run timeout, and bounded
//! history.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::config::RuntimeConfig;
use crate::domain::{
    InputOrigin, QueueItemStatus, ScheduleExecution, ScheduleId, ScheduleOutcome, ScheduleStatus,
    SessionId,
};
use crate::error::{CoreError, CoreResult};
use crate::event_log::EventLog;
use crate::legion::DriverFactory;
use crate::observer::{LegionNotice, ObserverHub};
use crate::runtime::{self, RuntimeRegistry};
use crate::state_store::StateStore;

#[derive(Eq, PartialEq)]
struct HeapKey(DateTime<Utc>, ScheduleId);

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0).then_with(|| self.1 .0.cmp(&other.1 .0))
    }
}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

enum SchedulerCommand {
    Upsert(ScheduleId),
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Tell the scheduler to (re)compute and (re)insert a schedule's next
    /// firing — call after create/patch/pause/resume/cancel.
    pub async fn notify_changed(&self, schedule_id: ScheduleId) {
        let _ = self.tx.send(SchedulerCommand::Upsert(schedule_id)).await;
    }
}

struct SchedulerActor {
    store: Arc<StateStore>,
    runtimes: RuntimeRegistry,
    observer: Arc<ObserverHub>,
    config: Arc<RuntimeConfig>,
    data_dir: PathBuf,
    driver_factory: DriverFactory,
    heap: BinaryHeap<Reverse<HeapKey>>,
}

pub fn spawn(
    store: Arc<StateStore>,
    runtimes: RuntimeRegistry,
    observer: Arc<ObserverHub>,
    config: Arc<RuntimeConfig>,
    data_dir: PathBuf,
    driver_factory: DriverFactory,
) -> SchedulerHandle {
    let (tx, rx) = mpsc::channel(256);
    let mut heap = BinaryHeap::new();
    for schedule in store.schedules.list() {
        if schedule.status == ScheduleStatus::Active {
            if let Some(next) = schedule.next_run_at {
                heap.push(Reverse(HeapKey(next, schedule.id)));
            }
        }
    }
    let actor = SchedulerActor { store, runtimes, observer, config, data_dir, driver_factory, heap };
    tokio::spawn(actor.run(rx));
    SchedulerHandle { tx }
}

impl SchedulerActor {
    async fn run(mut self, mut rx: mpsc::Receiver<SchedulerCommand>) {
        let mut ticker = tokio::time::interval(self.config.scheduler_tick());
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::Upsert(id)) => self.upsert(id),
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.process_due().await;
                }
            }
        }
    }

    fn upsert(&mut self, id: ScheduleId) {
        if let Ok(schedule) = self.store.require_schedule(id) {
            if schedule.status == ScheduleStatus::Active {
                if let Some(next) = schedule.next_run_at {
                    self.heap.push(Reverse(HeapKey(next, id)));
                }
            }
        }
    }

    async fn process_due(&mut self) {
        let now = Utc::now();
        loop {
            let Some(Reverse(HeapKey(when, id))) = self.heap.peek() else { break };
            if *when > now {
                break;
            }
            let Reverse(HeapKey(_, id)) = self.heap.pop().unwrap();
            let _ = id;
            let Ok(schedule) = self.store.require_schedule(id) else { continue };
            if schedule.status != ScheduleStatus::Active {
                continue;
            }
            self.fire(id).await;
        }
    }

    async fn fire(&mut self, id: ScheduleId) {
        let mut schedule = match self.store.require_schedule(id) {
            Ok(s) => s,
            Err(_) => return,
        };

        let started_at = Utc::now();
        let (outcome, error) = self.run_with_retries(&schedule).await;
        let ended_at = Utc::now();

        schedule.push_history(ScheduleExecution {
            started_at,
            ended_at: Some(ended_at),
            outcome: Some(outcome),
            error,
            attempt: schedule.history.len() as u32 + 1,
        });

        schedule.next_run_at = compute_next_run(&schedule.cron_expression, ended_at);
        let legion_id = schedule.legion_id;
        let _ = self.store.schedules.put(id, schedule.clone());
        self.observer.publish_legion_notice(legion_id, LegionNotice::ScheduleUpdated { schedule_id: id });

        if schedule.status == ScheduleStatus::Active {
            if let Some(next) = schedule.next_run_at {
                self.heap.push(Reverse(HeapKey(next, id)));
            }
        }
    }

    async fn run_with_retries(&mut self, schedule: &crate::domain::Schedule) -> (ScheduleOutcome, Option<String>) {
        let deadline = std::time::Duration::from_secs(schedule.timeout_seconds);
        let mut attempt = 0u32;
        loop {
            let result = tokio::time::timeout(deadline, self.run_once(schedule)).await;
            match result {
                Ok(Ok(())) => return (ScheduleOutcome::Ok, None),
                Ok(Err(CoreError::Unavailable(msg))) | Ok(Err(CoreError::Timeout(msg))) => {
                    // A target that is unavailable or whose own `start` init
                    // timeout expired is recorded as `target-unavailable`,
                    // not a generic `error` (§9 open question 3).
                    if attempt >= schedule.max_retries {
                        return (ScheduleOutcome::TargetUnavailable, Some(msg));
                    }
                }
                Ok(Err(e)) => {
                    if attempt >= schedule.max_retries {
                        return (ScheduleOutcome::Error, Some(e.to_string()));
                    }
                }
                Err(_) => {
                    if let Some(handle) = self.runtimes.get(schedule.target_session_id) {
                        let _ = handle.interrupt().await;
                    }
                    if attempt >= schedule.max_retries {
                        return (ScheduleOutcome::Timeout, Some("run exceeded timeout_seconds".into()));
                    }
                }
            }
            attempt += 1;
            let backoff = std::time::Duration::from_millis(200 * 2u64.pow(attempt.min(6)));
            tokio::time::sleep(backoff).await;
        }
    }

    async fn run_once(&mut self, schedule: &crate::domain::Schedule) -> CoreResult<()> {
        if schedule.reset_session {
            if let Some(handle) = self.runtimes.get(schedule.target_session_id) {
                handle.reset().await?;
            }
        }

        let handle = self.ensure_runtime(schedule.target_session_id).await?;
        let snapshot = handle.snapshot().await?;
        if !snapshot.session.state.is_active() {
            handle.start().await?;
        }

        let item_id = handle
            .enqueue_input(
                schedule.prompt_template.clone(),
                Vec::new(),
                Default::default(),
                InputOrigin::Scheduled,
                false,
            )
            .await?;

        loop {
            let snapshot = handle.snapshot().await?;
            if let Some(item) = snapshot.queue.iter().find(|i| i.id == item_id) {
                match item.status {
                    QueueItemStatus::Done => return Ok(()),
                    QueueItemStatus::Cancelled => {
                        return Err(CoreError::Internal("scheduled prompt was cancelled".into()))
                    }
                    _ => {}
                }
            } else {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    /// A firing on a `terminated` or fully-disposed target auto-starts it,
    /// recreating the runtime actor if it was removed entirely.
    async fn ensure_runtime(&mut self, session_id: SessionId) -> CoreResult<runtime::RuntimeHandle> {
        if let Some(handle) = self.runtimes.get(session_id) {
            return Ok(handle);
        }
        let session = self.store.require_session(session_id)?;
        let path = self.data_dir.join("sessions").join(session_id.to_string()).join("events");
        let log = Arc::new(EventLog::open(path)?);
        self.observer.register_session_log(session_id, log.clone());
        let driver = (self.driver_factory)();
        let handle = runtime::spawn(session, self.config.clone(), self.store.clone(), log, self.observer.clone(), driver);
        self.runtimes.insert(handle.clone());
        Ok(handle)
    }
}

fn compute_next_run(cron_expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = cron::Schedule::from_str(cron_expression).ok()?;
    schedule.after(&after).next()
}

/// Used by the Control Surface when creating or patching a schedule, before
/// the scheduler actor has a chance to recompute it independently.
pub fn initial_next_run(cron_expression: &str) -> CoreResult<DateTime<Utc>> {
    compute_next_run(cron_expression, Utc::now())
        .ok_or_else(|| CoreError::BadRequest(format!("invalid cron expression: {cron_expression}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_next_run_advances() {
        let next = initial_next_run("0 * * * * *").unwrap();
        assert!(next > Utc::now() - chrono::Duration::seconds(1));
    }

    #[test]
    fn invalid_cron_is_bad_request() {
        let err = initial_next_run("not a cron").unwrap_err();
        assert!(matches!(err, CoreError::BadRequest(_)));
    }
}
