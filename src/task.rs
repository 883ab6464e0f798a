//! Task lifecycle plumbing shared by every transfer backend.
//!
//! The scheduler owns a [`TaskControl`] per admitted task; the backend gets a
//! [`TransferContext`] carrying the matching control receiver and a sink for
//! progress events. Terminal events are emitted by [`spawn_transfer`] once the
//! backend future has returned, so a backend cannot emit anything after its
//! own terminal event.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use log::debug;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::download::{DownloadRequest, TaskId};
use crate::error::TransferError;
use crate::transfer::Transfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Paused,
    Finished,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    /// Running and Paused tasks hold one concurrency slot each.
    pub fn holds_slot(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Queued, Running) | (Queued, Cancelled) => true,
            (Running, Paused) | (Paused, Running) => true,
            // a pause may race with the transfer's own completion
            (Running | Paused, Finished | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Run,
    Pause,
    Cancel,
}

/// Scheduler-side control for one running transfer.
#[derive(Debug)]
pub struct TaskControl {
    tx: watch::Sender<Signal>,
}

impl TaskControl {
    pub fn pause(&self) {
        self.send(Signal::Pause);
    }

    pub fn resume(&self) {
        self.send(Signal::Run);
    }

    /// Irreversible; later pause/resume signals are dropped.
    pub fn cancel(&self) {
        self.send(Signal::Cancel);
    }

    fn send(&self, signal: Signal) {
        self.tx.send_if_modified(|current| {
            if *current == Signal::Cancel || *current == signal {
                return false;
            }
            *current = signal;
            true
        });
    }
}

/// Transfer-side view of the control signal.
#[derive(Debug, Clone)]
pub struct ControlReceiver {
    rx: watch::Receiver<Signal>,
}

impl ControlReceiver {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() == Signal::Cancel
    }

    pub fn is_paused(&self) -> bool {
        *self.rx.borrow() == Signal::Pause
    }

    /// Returns immediately while running, parks while paused, and fails with
    /// [`TransferError::Cancelled`] once cancellation has been requested.
    pub async fn checkpoint(&mut self) -> Result<(), TransferError> {
        loop {
            let signal = *self.rx.borrow_and_update();
            match signal {
                Signal::Run => return Ok(()),
                Signal::Cancel => return Err(TransferError::Cancelled),
                Signal::Pause => {
                    if self.rx.changed().await.is_err() {
                        return Err(TransferError::Cancelled);
                    }
                }
            }
        }
    }

    /// Resolves once cancellation has been requested (or the scheduler side
    /// has gone away).
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() == Signal::Cancel {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub fn control_pair() -> (TaskControl, ControlReceiver) {
    let (tx, rx) = watch::channel(Signal::Run);
    (TaskControl { tx }, ControlReceiver { rx })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed: f64,
    pub status: Option<String>,
}

impl ProgressUpdate {
    pub fn percent(&self) -> Option<f64> {
        let total = self.total.filter(|t| *t > 0)?;
        Some((self.downloaded as f64 / total as f64 * 100.0).min(100.0))
    }
}

/// How a started task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Finished(PathBuf),
    Failed(String),
    Cancelled,
}

impl Outcome {
    pub fn state(&self) -> TaskState {
        match self {
            Outcome::Finished(_) => TaskState::Finished,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Cancelled => TaskState::Cancelled,
        }
    }
}

/// Everything a task can report. Exactly one `Terminated` is delivered per
/// started task, after all of its progress events.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Progress(ProgressUpdate),
    Terminated(Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage {
    pub id: TaskId,
    pub event: TaskEvent,
}

pub type EventSender = mpsc::UnboundedSender<TaskMessage>;
pub type EventReceiver = mpsc::UnboundedReceiver<TaskMessage>;

/// Handed to a [`Transfer`] for the duration of its run.
pub struct TransferContext {
    request: Arc<DownloadRequest>,
    control: ControlReceiver,
    events: EventSender,
    last_status: Option<String>,
}

impl TransferContext {
    pub fn new(request: Arc<DownloadRequest>, control: ControlReceiver, events: EventSender) -> Self {
        Self {
            request,
            control,
            events,
            last_status: None,
        }
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn control(&mut self) -> &mut ControlReceiver {
        &mut self.control
    }

    pub async fn checkpoint(&mut self) -> Result<(), TransferError> {
        self.control.checkpoint().await
    }

    /// Cancellation-aware sleep. Pause requests are honoured at the next
    /// checkpoint, not mid-sleep.
    pub async fn idle(&mut self, duration: Duration) -> Result<(), TransferError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.control.cancelled() => Err(TransferError::Cancelled),
        }
    }

    pub fn report(&self, downloaded: u64, total: Option<u64>, speed: f64) {
        self.emit(TaskEvent::Progress(ProgressUpdate {
            downloaded,
            total,
            speed,
            status: self.last_status.clone(),
        }));
    }

    /// Sets the human-readable phase carried by subsequent progress events.
    pub fn set_status(&mut self, status: impl Into<String>) {
        let status = status.into();
        debug!("task {}: {status}", self.request.id);
        self.last_status = Some(status);
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(TaskMessage {
            id: self.request.id.clone(),
            event,
        });
    }
}

/// Owned by the scheduler while the task holds a slot. Dropping the handle
/// aborts the underlying tokio task.
#[derive(Debug)]
pub struct TransferHandle {
    control: TaskControl,
    join: JoinHandle<()>,
}

impl TransferHandle {
    pub fn control(&self) -> &TaskControl {
        &self.control
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

/// Starts `transfer` on the runtime and returns immediately. The spawned task
/// always finishes by sending exactly one terminal event for `request`.
pub fn spawn_transfer(
    request: Arc<DownloadRequest>,
    transfer: Box<dyn Transfer>,
    events: EventSender,
) -> TransferHandle {
    let (control, receiver) = control_pair();
    let id = request.id.clone();
    let ctx = TransferContext::new(request, receiver, events.clone());
    let join = tokio::spawn(async move {
        let outcome = AssertUnwindSafe(transfer.run(ctx)).catch_unwind().await;
        let outcome = match outcome {
            Ok(Ok(path)) => Outcome::Finished(path),
            Ok(Err(TransferError::Cancelled)) => Outcome::Cancelled,
            Ok(Err(err)) => Outcome::Failed(err.to_string()),
            Err(_) => Outcome::Failed("transfer task panicked".to_string()),
        };
        let _ = events.send(TaskMessage {
            id,
            event: TaskEvent::Terminated(outcome),
        });
    });
    TransferHandle { control, join }
}

/// Rolling throughput estimate over roughly one-second windows.
#[derive(Debug)]
pub struct SpeedMeter {
    window_start: Instant,
    window_bytes: u64,
    speed: f64,
}

impl SpeedMeter {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            speed: 0.0,
        }
    }

    pub fn record(&mut self, bytes: u64) -> f64 {
        self.window_bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Self::WINDOW {
            self.speed = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
        self.speed
    }

    /// Restarts the window, e.g. after a pause.
    pub fn reset(&mut self) {
        self.window_start = Instant::now();
        self.window_bytes = 0;
        self.speed = 0.0;
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transitions() {
        use TaskState::*;
        for terminal in [Finished, Failed, Cancelled] {
            for next in [Queued, Running, Paused, Finished, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Paused));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
    }

    #[tokio::test]
    async fn checkpoint_parks_while_paused() {
        let (control, mut receiver) = control_pair();
        control.pause();
        assert!(receiver.is_paused());

        let waiter = tokio::spawn(async move { receiver.checkpoint().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.resume();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_is_sticky() {
        let (control, mut receiver) = control_pair();
        control.cancel();
        control.resume();
        control.pause();
        assert!(receiver.is_cancelled());
        assert!(matches!(
            receiver.checkpoint().await,
            Err(TransferError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn cancel_wakes_a_paused_checkpoint() {
        let (control, mut receiver) = control_pair();
        control.pause();
        let waiter = tokio::spawn(async move { receiver.checkpoint().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        control.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(TransferError::Cancelled)
        ));
    }

    #[test]
    fn percent_requires_known_total() {
        let mut update = ProgressUpdate {
            downloaded: 40,
            total: Some(100),
            speed: 0.0,
            status: None,
        };
        assert_eq!(update.percent(), Some(40.0));
        update.total = Some(0);
        assert_eq!(update.percent(), None);
        update.total = None;
        assert_eq!(update.percent(), None);
    }
}
