//! Public control surface over the scheduler and the progress aggregator.
//!
//! Every task event funnels through one event loop. Control calls and event
//! handling take the same `gate` lock, so a progress event can never be
//! applied to the aggregator after the task was cancelled, and admission into
//! a freed slot is tracked before that task's first event is looked at.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use log::{debug, info};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{DownloadRequest, OrchestratorConfig, SelectableItem, TaskId};
use crate::error::{AdmissionError, ControlError};
use crate::progress::{AggregateStatus, ProgressAggregator};
use crate::scheduler::{CancelReport, Scheduler, TaskSnapshot, TerminalNotice};
use crate::task::{EventReceiver, Outcome, ProgressUpdate, TaskEvent, TaskMessage};
use crate::transfer::{ProtocolFactory, TransferFactory};
use crate::util::{absolutize, sanitize_filename, unique_destination};

/// How `submit` treats a file that already exists at the chosen name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExistingFilePolicy {
    /// Pick a fresh " (n)" name.
    #[default]
    Rename,
    /// Write to the existing path; backends that can resume will do so.
    Resume,
}

#[derive(Debug, Clone)]
pub struct TaskFinished {
    pub id: TaskId,
    pub request: Arc<DownloadRequest>,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TaskFailed {
    pub id: TaskId,
    pub request: Arc<DownloadRequest>,
    pub error: String,
}

type FinishedCallback = Arc<dyn Fn(&TaskFinished) + Send + Sync>;
type FailedCallback = Arc<dyn Fn(&TaskFailed) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    finished: StdMutex<Vec<FinishedCallback>>,
    failed: StdMutex<Vec<FailedCallback>>,
}

impl Callbacks {
    fn notify(&self, notice: TerminalNotice) {
        match notice {
            TerminalNotice::Finished { request, output } => {
                let event = TaskFinished {
                    id: request.id.clone(),
                    request,
                    output,
                };
                let callbacks = self
                    .finished
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for callback in callbacks {
                    callback(&event);
                }
            }
            TerminalNotice::Failed { request, error } => {
                let event = TaskFailed {
                    id: request.id.clone(),
                    request,
                    error,
                };
                let callbacks = self
                    .failed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for callback in callbacks {
                    callback(&event);
                }
            }
        }
    }
}

struct Inner {
    config: OrchestratorConfig,
    scheduler: Scheduler,
    aggregator: ProgressAggregator,
    callbacks: Callbacks,
    gate: Mutex<()>,
}

impl Inner {
    async fn on_progress(&self, id: &TaskId, update: &ProgressUpdate) {
        let _gate = self.gate.lock().await;
        let Some(reading) = self.scheduler.record_progress(id, update).await else {
            return;
        };
        self.aggregator
            .update(id, reading.percent, reading.speed_bytes_per_sec)
            .await;
        if reading.paused {
            self.aggregator.set_paused(id).await;
        }
    }

    async fn on_terminated(&self, id: &TaskId, outcome: Outcome) {
        let _gate = self.gate.lock().await;
        self.aggregator.remove(id).await;
        let termination = self.scheduler.on_task_terminated(id, outcome).await;
        for admitted in &termination.admitted {
            self.aggregator.track(admitted).await;
        }
        // callbacks run before the gate opens so `wait_idle` observes them
        if let Some(notice) = termination.notice {
            self.callbacks.notify(notice);
        }
    }
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    event_loop: JoinHandle<()>,
}

impl Orchestrator {
    /// Builds an orchestrator backed by the protocol transfers. Must be
    /// called from within a tokio runtime.
    pub fn new(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let factory = ProtocolFactory::new(&config)?;
        Ok(Self::with_factory(config, Arc::new(factory)))
    }

    pub fn with_factory(config: OrchestratorConfig, factory: Arc<dyn TransferFactory>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(config.max_concurrent, factory, events_tx);
        let inner = Arc::new(Inner {
            config,
            scheduler,
            aggregator: ProgressAggregator::new(),
            callbacks: Callbacks::default(),
            gate: Mutex::new(()),
        });
        let event_loop = tokio::spawn(run_events(inner.clone(), events_rx));
        Self { inner, event_loop }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Turns selected items into requests under `destination_dir` and queues
    /// them. The batch is accepted or rejected as a whole.
    pub async fn submit(
        &self,
        items: Vec<SelectableItem>,
        destination_dir: &Path,
    ) -> Result<Vec<TaskId>, AdmissionError> {
        self.submit_with(items, destination_dir, ExistingFilePolicy::Rename)
            .await
    }

    pub async fn submit_with(
        &self,
        items: Vec<SelectableItem>,
        destination_dir: &Path,
        policy: ExistingFilePolicy,
    ) -> Result<Vec<TaskId>, AdmissionError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if destination_dir.as_os_str().is_empty() {
            return Err(AdmissionError::MissingDestination);
        }
        let dir = absolutize(destination_dir)
            .map_err(|_| AdmissionError::RelativeDestination(destination_dir.to_path_buf()))?;

        let _gate = self.inner.gate.lock().await;
        let mut taken = self.inner.scheduler.reserved_destinations().await;
        let requests = items
            .into_iter()
            .map(|item| plan_request(item, &dir, policy, &mut taken))
            .collect();
        self.enqueue_locked(requests).await
    }

    /// Queues prebuilt requests as-is. Destinations must already be unique.
    pub async fn enqueue(
        &self,
        requests: Vec<DownloadRequest>,
    ) -> Result<Vec<TaskId>, AdmissionError> {
        let _gate = self.inner.gate.lock().await;
        self.enqueue_locked(requests).await
    }

    async fn enqueue_locked(
        &self,
        requests: Vec<DownloadRequest>,
    ) -> Result<Vec<TaskId>, AdmissionError> {
        let snapshots = self.inner.scheduler.enqueue_batch(requests).await?;
        let mut ids = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            if snapshot.state.holds_slot() {
                self.inner.aggregator.track(&snapshot.id).await;
            }
            ids.push(snapshot.id);
        }
        info!("submitted {} download(s)", ids.len());
        Ok(ids)
    }

    pub async fn pause_all(&self) -> Vec<TaskId> {
        let _gate = self.inner.gate.lock().await;
        let paused = self.inner.scheduler.pause_all().await;
        for id in &paused {
            self.inner.aggregator.set_paused(id).await;
        }
        info!("paused {} task(s)", paused.len());
        paused
    }

    pub async fn resume_all(&self) -> Vec<TaskId> {
        let _gate = self.inner.gate.lock().await;
        let resumed = self.inner.scheduler.resume_all().await;
        for id in &resumed {
            self.inner.aggregator.set_resumed(id).await;
        }
        info!("resumed {} task(s)", resumed.len());
        resumed
    }

    /// Empties the queue and signals every live transfer. Returns without
    /// waiting for the transfers to tear down; see [`Orchestrator::wait_idle`].
    pub async fn cancel_all(&self) -> CancelReport {
        let _gate = self.inner.gate.lock().await;
        let report = self.inner.scheduler.cancel_all().await;
        for id in &report.signalled {
            self.inner.aggregator.remove(id).await;
        }
        report
    }

    pub async fn pause(&self, id: &TaskId) -> Result<bool, ControlError> {
        let _gate = self.inner.gate.lock().await;
        let paused = self.inner.scheduler.pause(id).await?;
        if paused {
            self.inner.aggregator.set_paused(id).await;
        }
        Ok(paused)
    }

    pub async fn resume(&self, id: &TaskId) -> Result<bool, ControlError> {
        let _gate = self.inner.gate.lock().await;
        let resumed = self.inner.scheduler.resume(id).await?;
        if resumed {
            self.inner.aggregator.set_resumed(id).await;
        }
        Ok(resumed)
    }

    pub async fn cancel(&self, id: &TaskId) -> Result<bool, ControlError> {
        let _gate = self.inner.gate.lock().await;
        let cancelled = self.inner.scheduler.cancel(id).await?;
        if cancelled {
            self.inner.aggregator.remove(id).await;
        }
        Ok(cancelled)
    }

    pub async fn aggregate_status(&self) -> AggregateStatus {
        let counts = self.inner.scheduler.counts().await;
        self.inner
            .aggregator
            .snapshot(
                counts.running + counts.paused,
                self.inner.scheduler.max_concurrent(),
            )
            .await
    }

    pub async fn task(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.inner.scheduler.snapshot(id).await
    }

    pub async fn tasks(&self) -> Vec<TaskSnapshot> {
        self.inner.scheduler.snapshots().await
    }

    pub async fn prune_terminal(&self) -> usize {
        self.inner.scheduler.prune_terminal().await
    }

    /// Resolves once nothing is queued, every transfer has torn down, and the
    /// callbacks for the last terminal event have run.
    pub async fn wait_idle(&self) {
        self.inner.scheduler.wait_idle().await;
        drop(self.inner.gate.lock().await);
    }

    /// Runs on the event loop; keep it short and non-blocking.
    pub fn on_task_finished<F>(&self, callback: F)
    where
        F: Fn(&TaskFinished) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Runs on the event loop; keep it short and non-blocking.
    pub fn on_task_failed<F>(&self, callback: F)
    where
        F: Fn(&TaskFailed) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

async fn run_events(inner: Arc<Inner>, mut events: EventReceiver) {
    while let Some(TaskMessage { id, event }) = events.recv().await {
        match event {
            TaskEvent::Progress(update) => inner.on_progress(&id, &update).await,
            TaskEvent::Terminated(outcome) => {
                debug!("{id} terminated: {:?}", outcome.state());
                inner.on_terminated(&id, outcome).await;
            }
        }
    }
}

fn plan_request(
    item: SelectableItem,
    dir: &Path,
    policy: ExistingFilePolicy,
    taken: &mut HashSet<PathBuf>,
) -> DownloadRequest {
    let name = sanitize_filename(&item.suggested_filename);
    let requested = dir.join(&name);
    let destination = match policy {
        ExistingFilePolicy::Resume if !taken.contains(&requested) => requested.clone(),
        _ => unique_destination(dir, &name, taken),
    };
    taken.insert(destination.clone());

    DownloadRequest {
        id: TaskId::derive(&item.source, &requested),
        source: item.source,
        destination,
        kind: item.kind,
        total_size: item.estimated_size.unwrap_or(0),
        checksum: item.checksum,
    }
}
