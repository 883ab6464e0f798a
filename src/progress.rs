use std::collections::HashMap;
use std::io::{IsTerminal, Write};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::download::{Orchestrator, TaskId};
use crate::util::format_speed;

const PAUSED_LABEL: &str = "paused";
const IDLE_TEXT: &str = "idle";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Quiet,
    Text,
    Json,
}

/// One combined view over every task that currently holds a slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateStatus {
    pub percent: f64,
    pub status_text: String,
    pub active_count: usize,
    pub max_concurrent: usize,
}

impl AggregateStatus {
    pub fn is_idle(&self) -> bool {
        self.active_count == 0
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    percent: f64,
    label: String,
}

#[derive(Debug, Default)]
struct Entries {
    next_seq: u64,
    map: HashMap<TaskId, Entry>,
}

/// Latest `(percent, speed label)` per tracked task. Updates are a single map
/// write; the mean is only computed when a snapshot is asked for.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    entries: Mutex<Entries>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a newly admitted task at 0%.
    pub async fn track(&self, id: &TaskId) {
        let mut entries = self.entries.lock().await;
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.map.entry(id.clone()).or_insert(Entry {
            seq,
            percent: 0.0,
            label: format_speed(0.0),
        });
    }

    /// Ignored for tasks that are not tracked, which covers late events from
    /// tasks already removed on their terminal event.
    pub async fn update(&self, id: &TaskId, percent: f64, speed_bytes_per_sec: f64) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.map.get_mut(id) {
            entry.percent = percent.clamp(0.0, 100.0);
            entry.label = format_speed(speed_bytes_per_sec);
        }
    }

    /// Keeps the task's last percent but shows it as paused.
    pub async fn set_paused(&self, id: &TaskId) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.map.get_mut(id) {
            entry.label = PAUSED_LABEL.to_string();
        }
    }

    pub async fn set_resumed(&self, id: &TaskId) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.map.get_mut(id) {
            entry.label = format_speed(0.0);
        }
    }

    pub async fn remove(&self, id: &TaskId) {
        self.entries.lock().await.map.remove(id);
    }

    pub async fn snapshot(&self, active_count: usize, max_concurrent: usize) -> AggregateStatus {
        let entries = self.entries.lock().await;
        if entries.map.is_empty() {
            return AggregateStatus {
                percent: 0.0,
                status_text: IDLE_TEXT.to_string(),
                active_count,
                max_concurrent,
            };
        }

        let mut ordered: Vec<&Entry> = entries.map.values().collect();
        ordered.sort_by_key(|entry| entry.seq);
        let percent = ordered.iter().map(|entry| entry.percent).sum::<f64>() / ordered.len() as f64;
        let labels: Vec<&str> = ordered.iter().map(|entry| entry.label.as_str()).collect();
        AggregateStatus {
            percent,
            status_text: format!(
                "{} | active: {active_count}/{max_concurrent}",
                labels.join(", ")
            ),
            active_count,
            max_concurrent,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressFinish {
    Success,
    Failure,
}

/// Renders the orchestrator's aggregate status on a fixed tick until stopped.
pub struct ProgressReporter {
    stop_tx: Option<oneshot::Sender<ProgressFinish>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(mode: ProgressMode, orchestrator: Arc<Orchestrator>) -> Option<Self> {
        let tick = orchestrator.config().tick;
        match mode {
            ProgressMode::Quiet => None,
            ProgressMode::Text => Some(Self::spawn_with(tick, orchestrator, TextRenderer::new())),
            ProgressMode::Json => Some(Self::spawn_with(tick, orchestrator, JsonRenderer)),
        }
    }

    pub async fn finish(mut self, finish: ProgressFinish) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(finish);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    fn spawn_with<R: Render + Send + 'static>(
        tick: Duration,
        orchestrator: Arc<Orchestrator>,
        mut renderer: R,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let start = Instant::now();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let status = orchestrator.aggregate_status().await;
                        renderer.render(&status, start.elapsed(), None);
                    }
                    result = &mut stop_rx => {
                        let finish = result.unwrap_or(ProgressFinish::Failure);
                        let status = orchestrator.aggregate_status().await;
                        renderer.render(&status, start.elapsed(), Some(finish));
                        break;
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

trait Render {
    fn render(&mut self, status: &AggregateStatus, elapsed: Duration, finish: Option<ProgressFinish>);
}

struct TextRenderer {
    is_tty: bool,
    last_line_len: usize,
    last_log: Option<Instant>,
    last_line: Option<String>,
}

impl TextRenderer {
    fn new() -> Self {
        Self {
            is_tty: std::io::stderr().is_terminal(),
            last_line_len: 0,
            last_log: None,
            last_line: None,
        }
    }
}

fn text_line(status: &AggregateStatus) -> String {
    if status.is_idle() && status.status_text == IDLE_TEXT {
        return IDLE_TEXT.to_string();
    }
    format!("{:5.1}% • {}", status.percent, status.status_text)
}

impl Render for TextRenderer {
    fn render(&mut self, status: &AggregateStatus, _elapsed: Duration, finish: Option<ProgressFinish>) {
        let line = text_line(status);
        if self.is_tty {
            let mut to_print = line.clone();
            if self.last_line_len > line.len() {
                to_print.push_str(&" ".repeat(self.last_line_len - line.len()));
            }
            eprint!("\r{to_print}");
            let _ = std::io::stderr().flush();
            self.last_line_len = line.len();
            if finish.is_some() {
                eprintln!();
            }
        } else {
            // idle ticks are only worth a line when something changed
            let now = Instant::now();
            let is_new_line = self.last_line.as_ref().map_or(true, |prev| prev != &line);
            let should_emit = finish.is_some()
                || is_new_line
                || (!status.is_idle()
                    && self
                        .last_log
                        .map_or(true, |prev| now.duration_since(prev) >= Duration::from_secs(1)));
            if should_emit {
                eprintln!("{line}");
                self.last_log = Some(now);
                self.last_line = Some(line);
            }
        }
    }
}

struct JsonRenderer;

impl Render for JsonRenderer {
    fn render(&mut self, status: &AggregateStatus, elapsed: Duration, finish: Option<ProgressFinish>) {
        let event = match finish {
            None => "progress",
            Some(ProgressFinish::Success) => "complete",
            Some(ProgressFinish::Failure) => "failed",
        };
        let event = JsonProgressEvent::new(event, status, elapsed);
        if let Ok(serialized) = serde_json::to_string(&event) {
            println!("{serialized}");
            let _ = std::io::stdout().flush();
        }
    }
}

#[derive(Serialize)]
struct JsonProgressEvent<'a> {
    event: &'static str,
    timestamp_ms: u128,
    elapsed_ms: u128,
    #[serde(flatten)]
    status: &'a AggregateStatus,
}

impl<'a> JsonProgressEvent<'a> {
    fn new(event: &'static str, status: &'a AggregateStatus, elapsed: Duration) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            event,
            timestamp_ms,
            elapsed_ms: elapsed.as_millis(),
            status,
        }
    }
}
