//! Admission control and slot management.
//!
//! All mutable scheduling state lives in one `SchedulerState` behind a single
//! lock. Admission happens only in `fill_slots`, which runs while that lock is
//! held, so two terminations arriving together can never both see the same
//! free slot.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};

use crate::download::{DownloadKind, DownloadRequest, TaskId};
use crate::error::{AdmissionError, ControlError};
use crate::task::{spawn_transfer, EventSender, Outcome, ProgressUpdate, TaskState, TransferHandle};
use crate::transfer::TransferFactory;

/// Scheduler bookkeeping for one request over its whole lifetime.
#[derive(Debug)]
struct TaskRecord {
    request: Arc<DownloadRequest>,
    state: TaskState,
    downloaded_bytes: u64,
    total_bytes: Option<u64>,
    percent: f64,
    speed_bytes_per_sec: f64,
    status: Option<String>,
    last_error: Option<String>,
    output: Option<PathBuf>,
}

impl TaskRecord {
    fn new(request: DownloadRequest) -> Self {
        let total_bytes = Some(request.total_size).filter(|size| *size > 0);
        Self {
            request: Arc::new(request),
            state: TaskState::Queued,
            downloaded_bytes: 0,
            total_bytes,
            percent: 0.0,
            speed_bytes_per_sec: 0.0,
            status: None,
            last_error: None,
            output: None,
        }
    }

    fn transition(&mut self, next: TaskState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.request.id.clone(),
            kind: self.request.kind,
            source: self.request.source.to_string(),
            destination: self.request.destination.clone(),
            state: self.state,
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
            percent: self.percent,
            speed_bytes_per_sec: self.speed_bytes_per_sec,
            status: self.status.clone(),
            last_error: self.last_error.clone(),
            output: self.output.clone(),
        }
    }
}

/// Point-in-time copy of a task's record.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub kind: DownloadKind,
    pub source: String,
    pub destination: PathBuf,
    pub state: TaskState,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub percent: f64,
    pub speed_bytes_per_sec: f64,
    pub status: Option<String>,
    pub last_error: Option<String>,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerCounts {
    pub queued: usize,
    pub running: usize,
    pub paused: usize,
    /// Slots still held by live transfers, including cancelled ones that have
    /// not reported their teardown yet.
    pub slots_in_use: usize,
}

/// Terminal notification to surface to the caller.
#[derive(Debug, Clone)]
pub enum TerminalNotice {
    Finished {
        request: Arc<DownloadRequest>,
        output: PathBuf,
    },
    Failed {
        request: Arc<DownloadRequest>,
        error: String,
    },
}

#[derive(Debug, Default)]
pub struct Termination {
    /// Set when this call released the task's slot.
    pub released: bool,
    pub notice: Option<TerminalNotice>,
    /// Requests promoted into the freed slot(s), in admission order.
    pub admitted: Vec<TaskId>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// Queued requests cancelled without ever being started.
    pub dequeued: Vec<TaskId>,
    /// Running or paused tasks that were signalled.
    pub signalled: Vec<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReading {
    pub percent: f64,
    pub speed_bytes_per_sec: f64,
    pub paused: bool,
}

#[derive(Default)]
struct SchedulerState {
    pending: VecDeque<TaskId>,
    active: HashMap<TaskId, TransferHandle>,
    records: HashMap<TaskId, TaskRecord>,
    order: Vec<TaskId>,
}

impl SchedulerState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }
}

pub struct Scheduler {
    state: Mutex<SchedulerState>,
    max_concurrent: usize,
    factory: Arc<dyn TransferFactory>,
    events: EventSender,
    idle: Notify,
}

impl Scheduler {
    pub fn new(
        max_concurrent: usize,
        factory: Arc<dyn TransferFactory>,
        events: EventSender,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            max_concurrent: max_concurrent.max(1),
            factory,
            events,
            idle: Notify::new(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub async fn enqueue(&self, request: DownloadRequest) -> Result<TaskSnapshot, AdmissionError> {
        let mut snapshots = self.enqueue_batch(vec![request]).await?;
        Ok(snapshots.remove(0))
    }

    /// Validates every request first; either all are accepted or none are.
    /// Accepted requests are admitted immediately while slots are free and
    /// queued in order otherwise.
    pub async fn enqueue_batch(
        &self,
        requests: Vec<DownloadRequest>,
    ) -> Result<Vec<TaskSnapshot>, AdmissionError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().await;
        let mut batch_ids = HashSet::new();
        for request in &requests {
            request.validate()?;
            // a cancelled transfer keeps its slot until its teardown arrives
            let live = state.active.contains_key(&request.id)
                || state
                    .records
                    .get(&request.id)
                    .map_or(false, |record| !record.state.is_terminal());
            if live || !batch_ids.insert(request.id.clone()) {
                return Err(AdmissionError::Duplicate(request.id.clone()));
            }
        }

        let ids: Vec<TaskId> = requests.iter().map(|r| r.id.clone()).collect();
        for request in requests {
            let id = request.id.clone();
            if state.records.remove(&id).is_some() {
                // resubmission of a terminal task starts a fresh record
                state.order.retain(|existing| existing != &id);
            }
            debug!("queued {id}: {} -> {}", request.source, request.destination.display());
            state.records.insert(id.clone(), TaskRecord::new(request));
            state.order.push(id.clone());
            state.pending.push_back(id);
        }
        self.fill_slots(&mut state);

        Ok(ids
            .iter()
            .filter_map(|id| state.records.get(id).map(TaskRecord::snapshot))
            .collect())
    }

    /// Releases the slot held by `id` and promotes queued requests into it.
    /// Calling this again for the same task is a no-op.
    pub async fn on_task_terminated(&self, id: &TaskId, outcome: Outcome) -> Termination {
        let mut state = self.state.lock().await;
        if state.active.remove(id).is_none() {
            debug!("ignoring repeated termination of {id}");
            return Termination::default();
        }

        let mut notice = None;
        if let Some(record) = state.records.get_mut(id) {
            let next = outcome.state();
            if record.transition(next) {
                record.speed_bytes_per_sec = 0.0;
                match outcome {
                    Outcome::Finished(output) => {
                        info!("{id} finished: {}", output.display());
                        record.percent = 100.0;
                        record.output = Some(output.clone());
                        notice = Some(TerminalNotice::Finished {
                            request: record.request.clone(),
                            output,
                        });
                    }
                    Outcome::Failed(error) => {
                        warn!("{id} failed: {error}");
                        record.last_error = Some(error.clone());
                        notice = Some(TerminalNotice::Failed {
                            request: record.request.clone(),
                            error,
                        });
                    }
                    Outcome::Cancelled => info!("{id} cancelled"),
                }
            } else {
                debug!(
                    "{id} already {:?}; ignoring late {:?} outcome",
                    record.state, next
                );
            }
        }

        let admitted = self.fill_slots(&mut state);
        if state.is_idle() {
            self.idle.notify_waiters();
        }
        Termination {
            released: true,
            notice,
            admitted,
        }
    }

    /// Applies a progress event. Returns `None` for tasks that no longer hold
    /// a slot, so late events after a terminal state are dropped.
    pub async fn record_progress(
        &self,
        id: &TaskId,
        update: &ProgressUpdate,
    ) -> Option<ProgressReading> {
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(id)?;
        if !record.state.holds_slot() {
            return None;
        }
        record.downloaded_bytes = update.downloaded;
        if update.total.is_some() {
            record.total_bytes = update.total;
        }
        if let Some(percent) = update.percent() {
            record.percent = percent;
        }
        record.speed_bytes_per_sec = update.speed;
        if update.status.is_some() {
            record.status = update.status.clone();
        }
        Some(ProgressReading {
            percent: record.percent,
            speed_bytes_per_sec: record.speed_bytes_per_sec,
            paused: record.state == TaskState::Paused,
        })
    }

    pub async fn pause(&self, id: &TaskId) -> Result<bool, ControlError> {
        let mut state = self.state.lock().await;
        Self::pause_locked(&mut state, id)
    }

    pub async fn resume(&self, id: &TaskId) -> Result<bool, ControlError> {
        let mut state = self.state.lock().await;
        Self::resume_locked(&mut state, id)
    }

    /// Cancels one task. A queued request is dropped from the pending list
    /// without ever starting; a running or paused one is signalled and keeps
    /// its slot until its transfer reports the teardown.
    pub async fn cancel(&self, id: &TaskId) -> Result<bool, ControlError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| ControlError::UnknownTask(id.clone()))?;
        match record.state {
            TaskState::Queued => {
                record.transition(TaskState::Cancelled);
                state.pending.retain(|pending| pending != id);
                info!("{id} cancelled before start");
                if state.is_idle() {
                    self.idle.notify_waiters();
                }
                Ok(true)
            }
            TaskState::Running | TaskState::Paused => {
                record.transition(TaskState::Cancelled);
                record.speed_bytes_per_sec = 0.0;
                if let Some(handle) = state.active.get(id) {
                    handle.control().cancel();
                }
                info!("{id} cancellation requested");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Pauses every running task. Queued requests are not touched and will
    /// start running when admitted.
    pub async fn pause_all(&self) -> Vec<TaskId> {
        let mut state = self.state.lock().await;
        let ids: Vec<TaskId> = state.active.keys().cloned().collect();
        ids.into_iter()
            .filter(|id| Self::pause_locked(&mut state, id).unwrap_or(false))
            .collect()
    }

    pub async fn resume_all(&self) -> Vec<TaskId> {
        let mut state = self.state.lock().await;
        let ids: Vec<TaskId> = state.active.keys().cloned().collect();
        ids.into_iter()
            .filter(|id| Self::resume_locked(&mut state, id).unwrap_or(false))
            .collect()
    }

    /// Drops every pending request and signals every live transfer. Does not
    /// wait for teardown; each transfer still reports its own termination.
    pub async fn cancel_all(&self) -> CancelReport {
        let mut state = self.state.lock().await;
        let mut report = CancelReport::default();

        let pending: Vec<TaskId> = state.pending.drain(..).collect();
        for id in pending {
            if let Some(record) = state.records.get_mut(&id) {
                if record.transition(TaskState::Cancelled) {
                    report.dequeued.push(id);
                }
            }
        }

        let SchedulerState {
            active, records, ..
        } = &mut *state;
        for (id, handle) in active.iter() {
            if let Some(record) = records.get_mut(id) {
                if record.transition(TaskState::Cancelled) {
                    record.speed_bytes_per_sec = 0.0;
                    report.signalled.push(id.clone());
                }
            }
            handle.control().cancel();
        }
        report.signalled.sort();

        info!(
            "cancel requested: {} queued dropped, {} running signalled",
            report.dequeued.len(),
            report.signalled.len()
        );
        if state.is_idle() {
            self.idle.notify_waiters();
        }
        report
    }

    pub async fn snapshot(&self, id: &TaskId) -> Option<TaskSnapshot> {
        let state = self.state.lock().await;
        state.records.get(id).map(TaskRecord::snapshot)
    }

    /// All known tasks in submission order.
    pub async fn snapshots(&self) -> Vec<TaskSnapshot> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id).map(TaskRecord::snapshot))
            .collect()
    }

    pub async fn counts(&self) -> SchedulerCounts {
        let state = self.state.lock().await;
        let mut counts = SchedulerCounts {
            slots_in_use: state.active.len(),
            ..SchedulerCounts::default()
        };
        for record in state.records.values() {
            match record.state {
                TaskState::Queued => counts.queued += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Paused => counts.paused += 1,
                _ => {}
            }
        }
        counts
    }

    /// Output paths already promised to queued or live tasks.
    pub async fn reserved_destinations(&self) -> HashSet<PathBuf> {
        let state = self.state.lock().await;
        state
            .records
            .values()
            .filter(|record| !record.state.is_terminal() || state.active.contains_key(&record.request.id))
            .map(|record| record.request.destination.clone())
            .collect()
    }

    /// Forgets terminal tasks whose transfers have been reaped.
    pub async fn prune_terminal(&self) -> usize {
        let mut state = self.state.lock().await;
        let SchedulerState {
            active,
            records,
            order,
            ..
        } = &mut *state;
        let before = records.len();
        records.retain(|id, record| !record.state.is_terminal() || active.contains_key(id));
        order.retain(|id| records.contains_key(id));
        before - records.len()
    }

    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.is_idle()
    }

    /// Resolves once nothing is queued and no transfer holds a slot.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.idle.notified());
            notified.as_mut().enable();
            if self.is_idle().await {
                return;
            }
            notified.await;
        }
    }

    fn fill_slots(&self, state: &mut SchedulerState) -> Vec<TaskId> {
        let mut admitted = Vec::new();
        while state.active.len() < self.max_concurrent {
            let Some(id) = state.pending.pop_front() else {
                break;
            };
            let Some(record) = state.records.get_mut(&id) else {
                continue;
            };
            if !record.transition(TaskState::Running) {
                continue;
            }
            let request = record.request.clone();
            let transfer = self.factory.create(&request);
            let handle = spawn_transfer(request.clone(), transfer, self.events.clone());
            state.active.insert(id.clone(), handle);
            info!(
                "started {id} ({}) [{}/{} slots]",
                request.kind,
                state.active.len(),
                self.max_concurrent
            );
            admitted.push(id);
        }
        admitted
    }

    fn pause_locked(state: &mut SchedulerState, id: &TaskId) -> Result<bool, ControlError> {
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| ControlError::UnknownTask(id.clone()))?;
        if record.state != TaskState::Running || !record.transition(TaskState::Paused) {
            return Ok(false);
        }
        if let Some(handle) = state.active.get(id) {
            handle.control().pause();
        }
        debug!("{id} paused");
        Ok(true)
    }

    fn resume_locked(state: &mut SchedulerState, id: &TaskId) -> Result<bool, ControlError> {
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| ControlError::UnknownTask(id.clone()))?;
        if record.state != TaskState::Paused || !record.transition(TaskState::Running) {
            return Ok(false);
        }
        if let Some(handle) = state.active.get(id) {
            handle.control().resume();
        }
        debug!("{id} resumed");
        Ok(true)
    }
}
