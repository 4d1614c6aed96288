//! Worker handles, lifecycle states and the context a worker runs with.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::messaging::{Inbox, Message};
use crate::pool::handoff::Handoff;
use crate::signals::{AlgedonicSignal, BlockerSignal, Category, extract_signals};
use crate::store::{Task, TaskId};
use crate::workspace::WorkspaceHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("w-{}", &uuid[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returned by `WorkerPool::dispatch`. The worker exclusively owns `task`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub task: TaskId,
    /// 1 for a first dispatch, 2 for a stall retry
    pub attempt: u32,
}

/// `spawned -> working -> {completed | blocked | stalled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawned,
    Working,
    Completed,
    Blocked,
    Stalled,
}

impl WorkerState {
    /// Whether the worker may still be running code.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Spawned | Self::Working | Self::Blocked)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stalled)
    }
}

/// Events flowing from running workers back to the pool.
#[derive(Debug)]
pub enum WorkerEventKind {
    Started,
    Progress { note: String },
    Touched { paths: Vec<String> },
    Blocker(BlockerSignal),
    Algedonic(AlgedonicSignal),
    Finished(anyhow::Result<Handoff>),
}

#[derive(Debug)]
pub struct WorkerEvent {
    pub worker: WorkerId,
    pub kind: WorkerEventKind,
}

/// Lets a running worker report observable progress and signals.
#[derive(Clone)]
pub struct ProgressReporter {
    worker: WorkerId,
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ProgressReporter {
    pub(crate) fn new(worker: WorkerId, tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self { worker, tx }
    }

    fn emit(&self, kind: WorkerEventKind) {
        let _ = self.tx.send(WorkerEvent {
            worker: self.worker.clone(),
            kind,
        });
    }

    pub fn progress(&self, note: impl Into<String>) {
        self.emit(WorkerEventKind::Progress { note: note.into() });
    }

    pub fn touched(&self, paths: Vec<String>) {
        self.emit(WorkerEventKind::Touched { paths });
    }

    pub fn blocker(&self, description: impl Into<String>) {
        self.emit(WorkerEventKind::Blocker(BlockerSignal::new(description)));
    }

    pub fn algedonic(&self, category: Category, description: impl Into<String>) {
        self.emit(WorkerEventKind::Algedonic(AlgedonicSignal::new(category, description)));
    }

    /// Scan free-form output for signal tags and report what was found.
    /// Any output at all counts as progress.
    pub fn output(&self, text: &str) {
        let signals = extract_signals(text);
        let note = match signals.latest_progress() {
            Some(p) => format!("{}%", p),
            None => "output".to_string(),
        };
        self.progress(note);
        if !signals.touched.is_empty() {
            self.touched(signals.touched);
        }
        for blocker in signals.blockers {
            self.emit(WorkerEventKind::Blocker(blocker));
        }
        for signal in signals.algedonic {
            self.emit(WorkerEventKind::Algedonic(signal));
        }
    }
}

/// Everything a worker needs, passed by value at dispatch.
pub struct WorkerContext {
    pub worker: WorkerId,
    pub task: Task,
    pub attempt: u32,
    pub workspace: WorkspaceHandle,
    pub progress: ProgressReporter,
    /// Messages and stop requests addressed to this worker
    pub inbox: Inbox,
}

impl WorkerContext {
    /// Resolves when the worker has been asked to stop.
    pub async fn stopped(&mut self) -> Message {
        self.inbox.stopped().await
    }

    pub fn is_stopped(&mut self) -> bool {
        self.inbox.is_stopped()
    }
}
