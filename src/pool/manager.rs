//! Worker Pool Manager.
//!
//! Dispatches bounded-concurrency workers against ready tasks, tracks each
//! worker's lifecycle, detects stalls and recovers from them. The pool never
//! blocks its caller: `dispatch`, `fill` and `poll` do their work and return,
//! while workers run as tokio tasks and report back through a channel.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::messaging::{Message, MessageBus};
use crate::pool::handoff::{HANDOFF_KEY, Handoff};
use crate::pool::registry::CapabilityRegistry;
use crate::pool::resources;
use crate::pool::worker::{
    ProgressReporter, WorkerContext, WorkerEvent, WorkerEventKind, WorkerHandle, WorkerId,
    WorkerState,
};
use crate::signals::Category;
use crate::store::{NewTask, Task, TaskId, TaskKind, TaskPatch, TaskStatus, TaskStore};
use crate::workspace::WorkspaceHandle;

/// A task lineage gets at most this many dispatches before a stall escalates.
pub const MAX_STALL_DISPATCHES: u32 = 2;

/// Metadata keys written by the pool itself; never copied into retry context.
const LINEAGE_KEYS: [&str; 5] = ["retry_of", "previous", "attempt", "context", HANDOFF_KEY];

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_parallel: usize,
    /// No observable progress for this long marks a working worker stalled
    pub stall_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            stall_timeout: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireOutcome {
    Retired,
    /// Mid-task; the pool retires it once it finishes
    Busy,
}

/// What happened during a `poll`, for the engine to route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    Completed {
        worker: WorkerId,
        task: TaskId,
    },
    /// The worker finished but the task is held by an unresolved signal.
    CompletionDeferred {
        task: TaskId,
        by: TaskId,
    },
    Stalled {
        task: TaskId,
        attempt: u32,
        retry: TaskId,
    },
    /// Second stall in one lineage. No further dispatch happens.
    StallEscalated {
        task: TaskId,
        lineage: TaskId,
        attempts: u32,
    },
    Blocker {
        worker: WorkerId,
        task: TaskId,
        description: String,
    },
    Algedonic {
        worker: WorkerId,
        task: TaskId,
        category: Category,
        description: String,
    },
    /// Resource overlap found between concurrently running tasks.
    Conflict {
        task: TaskId,
        other: TaskId,
        resources: Vec<String>,
    },
    /// A task stopped by HALT was replaced by a fresh one.
    Resumed {
        task: TaskId,
        retry: TaskId,
    },
    Retired {
        worker: WorkerId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    Halt,
    Cancel,
    Stall,
}

/// Why a task is being replaced by a fresh copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replacement {
    Stalled,
    Interrupted,
    Redo,
}

impl Replacement {
    fn flag(self) -> &'static str {
        match self {
            Self::Stalled => "stalled",
            Self::Interrupted => "interrupted",
            Self::Redo => "superseded",
        }
    }
}

struct WorkerSlot {
    handle: WorkerHandle,
    state: WorkerState,
    file_scope: Vec<String>,
    touched: Vec<String>,
    last_progress: Instant,
    last_seen_update: DateTime<Utc>,
    stop: Option<StopCause>,
    retire_requested: bool,
    /// The capability returned; the slot is released at the end of the poll
    exited: bool,
    join: JoinHandle<()>,
}

impl WorkerSlot {
    fn mark_progress(&mut self) {
        self.last_progress = Instant::now();
        if matches!(self.state, WorkerState::Spawned | WorkerState::Blocked) {
            self.state = WorkerState::Working;
        }
    }

    fn is_running(&self) -> bool {
        self.state.is_active() && !self.exited
    }

    fn resources(&self) -> Vec<String> {
        self.file_scope
            .iter()
            .chain(self.touched.iter())
            .cloned()
            .collect()
    }
}

pub struct WorkerPool {
    store: TaskStore,
    registry: CapabilityRegistry,
    bus: MessageBus,
    bus_observer: broadcast::Receiver<Message>,
    workspace: WorkspaceHandle,
    config: PoolConfig,
    workers: HashMap<WorkerId, WorkerSlot>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    deferred: Vec<TaskId>,
    interrupted: Vec<TaskId>,
    halt: Option<Message>,
}

impl WorkerPool {
    pub fn new(
        store: TaskStore,
        registry: CapabilityRegistry,
        bus: MessageBus,
        workspace: WorkspaceHandle,
        config: PoolConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bus_observer = bus.observe();
        Self {
            store,
            registry,
            bus,
            bus_observer,
            workspace,
            config,
            workers: HashMap::new(),
            events_tx,
            events_rx,
            deferred: Vec::new(),
            interrupted: Vec::new(),
            halt: None,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    pub fn active_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_running()).count()
    }

    /// No active workers and nothing waiting to be finalised.
    pub fn is_idle(&self) -> bool {
        self.active_count() == 0 && self.deferred.is_empty()
    }

    pub fn state(&self, worker: &WorkerId) -> Option<WorkerState> {
        self.workers.get(worker).map(|w| w.state)
    }

    /// Active worker currently owning `task`.
    pub fn worker_for(&self, task: TaskId) -> Option<&WorkerHandle> {
        self.workers
            .values()
            .find(|w| w.handle.task == task && w.state.is_active())
            .map(|w| &w.handle)
    }

    pub fn workers(&self) -> Vec<(WorkerHandle, WorkerState)> {
        let mut out: Vec<_> = self
            .workers
            .values()
            .map(|w| (w.handle.clone(), w.state))
            .collect();
        out.sort_by_key(|(h, _)| (h.task, h.attempt));
        out
    }

    /// Tasks whose workers were stopped by HALT and await `resume`.
    pub fn interrupted(&self) -> &[TaskId] {
        &self.interrupted
    }

    /// Start a worker on a pending task. The claim is a compare-and-swap, so
    /// two dispatches of the same task cannot both succeed.
    pub fn dispatch(&mut self, task_id: TaskId) -> EngineResult<WorkerHandle> {
        let task = self.store.get(task_id)?;
        if task.status != TaskStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id: task_id,
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }
        if let Some(by) = self.store.held_by(task_id)? {
            return Err(EngineError::Blocked { id: task_id, by });
        }
        for blocker in &task.blocked_by {
            if !self.store.get(*blocker)?.is_completed() {
                return Err(EngineError::Blocked {
                    id: task_id,
                    by: *blocker,
                });
            }
        }
        let capability = self
            .registry
            .resolve(task.capability.as_deref())
            .ok_or_else(|| {
                EngineError::Other(anyhow::anyhow!(
                    "No execution capability registered for '{}'",
                    task.capability.as_deref().unwrap_or("<default>")
                ))
            })?;

        let worker = WorkerId::generate();
        if !self.store.claim(task_id, worker.as_str())? {
            let current = self.store.get(task_id)?;
            return Err(EngineError::InvalidTransition {
                id: task_id,
                from: current.status,
                to: TaskStatus::InProgress,
            });
        }

        let task = self.store.get(task_id)?;
        let attempt = task.meta_u64("attempt").unwrap_or(1) as u32;
        let handle = WorkerHandle {
            id: worker.clone(),
            task: task_id,
            attempt,
        };
        let inbox = self.bus.register(worker.as_str())?;
        let last_seen_update = task.updated_at;
        let file_scope = task.file_scope.clone();

        let ctx = WorkerContext {
            worker: worker.clone(),
            task,
            attempt,
            workspace: self.workspace.clone(),
            progress: ProgressReporter::new(worker.clone(), self.events_tx.clone()),
            inbox,
        };

        let tx = self.events_tx.clone();
        let id = worker.clone();
        let join = tokio::spawn(async move {
            let _ = tx.send(WorkerEvent {
                worker: id.clone(),
                kind: WorkerEventKind::Started,
            });
            let result = capability.execute(ctx).await;
            let _ = tx.send(WorkerEvent {
                worker: id,
                kind: WorkerEventKind::Finished(result),
            });
        });

        info!(worker = %worker, task = %task_id, attempt, "worker dispatched");
        self.workers.insert(
            worker,
            WorkerSlot {
                handle: handle.clone(),
                state: WorkerState::Spawned,
                file_scope,
                touched: Vec::new(),
                last_progress: Instant::now(),
                last_seen_update,
                stop: None,
                retire_requested: false,
                exited: false,
                join,
            },
        );
        Ok(handle)
    }

    /// Eagerly dispatch candidates up to the concurrency bound. A candidate
    /// whose declared resources overlap a running task is held back.
    pub fn fill(&mut self, candidates: &[Task]) -> EngineResult<Vec<WorkerHandle>> {
        let mut dispatched = Vec::new();
        if self.halt.is_some() {
            return Ok(dispatched);
        }

        for task in candidates {
            if self.active_count() >= self.config.max_parallel {
                break;
            }
            if self.worker_for(task.id).is_some() {
                continue;
            }
            if let Some((other, shared)) = self.resource_holder(&task.file_scope) {
                info!(
                    task = %task.id,
                    waiting_for = %other,
                    resources = ?shared,
                    justification = "shared file",
                    "sequencing dispatch"
                );
                continue;
            }
            match self.dispatch(task.id) {
                Ok(handle) => dispatched.push(handle),
                Err(e @ (EngineError::InvalidTransition { .. } | EngineError::Blocked { .. })) => {
                    debug!(task = %task.id, error = %e, "candidate no longer dispatchable");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(dispatched)
    }

    fn resource_holder(&self, file_scope: &[String]) -> Option<(TaskId, Vec<String>)> {
        if file_scope.is_empty() {
            return None;
        }
        self.workers
            .values()
            .filter(|w| w.is_running())
            .find_map(|w| {
                let shared = resources::overlapping(file_scope, &w.resources());
                (!shared.is_empty()).then(|| (w.handle.task, shared))
            })
    }

    /// Drain worker events, finalise completions, and check liveness.
    pub fn poll(&mut self) -> EngineResult<Vec<PoolEvent>> {
        let mut out = Vec::new();

        self.observe_bus();
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event, &mut out)?;
        }
        self.retry_deferred(&mut out)?;
        self.detect_stalls(&mut out)?;
        self.redeliver_halt()?;
        self.process_retirements(&mut out)?;
        self.release_exited()?;

        Ok(out)
    }

    /// Drop slots whose worker has exited and close their inboxes. A stalled
    /// worker's events are ignored, so its slot goes once its task ends.
    fn release_exited(&mut self) -> EngineResult<()> {
        let gone: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.exited || (w.state == WorkerState::Stalled && w.join.is_finished()))
            .map(|(id, _)| id.clone())
            .collect();
        for worker in gone {
            self.workers.remove(&worker);
            self.bus.unregister(worker.as_str())?;
            debug!(worker = %worker, "worker slot released");
        }
        Ok(())
    }

    fn observe_bus(&mut self) {
        loop {
            match self.bus_observer.try_recv() {
                Ok(message) if message.is_stop() && message.recipient.is_none() => {
                    for slot in self.workers.values_mut() {
                        if slot.state.is_active() && slot.stop.is_none() {
                            slot.stop = Some(StopCause::Halt);
                        }
                    }
                    self.halt = Some(message);
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "pool lagged behind message bus");
                }
                Err(_) => break,
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent, out: &mut Vec<PoolEvent>) -> EngineResult<()> {
        let Some(slot) = self.workers.get_mut(&event.worker) else {
            debug!(worker = %event.worker, "event from unknown worker");
            return Ok(());
        };
        if slot.state == WorkerState::Stalled {
            debug!(worker = %event.worker, "ignoring event from stalled worker");
            return Ok(());
        }
        let task = slot.handle.task;

        match event.kind {
            WorkerEventKind::Started => {
                slot.mark_progress();
                debug!(worker = %event.worker, task = %task, "worker working");
            }
            WorkerEventKind::Progress { note } => {
                slot.mark_progress();
                debug!(worker = %event.worker, task = %task, note = %note, "worker progress");
            }
            WorkerEventKind::Touched { paths } => {
                slot.mark_progress();
                slot.touched.extend(paths.iter().cloned());
                let worker = event.worker.clone();
                for other in self.workers.values() {
                    if other.handle.id == worker || !other.state.is_active() {
                        continue;
                    }
                    let shared = resources::overlapping(&paths, &other.resources());
                    if !shared.is_empty() {
                        warn!(
                            task = %task,
                            other = %other.handle.task,
                            resources = ?shared,
                            "resource conflict between running tasks"
                        );
                        out.push(PoolEvent::Conflict {
                            task,
                            other: other.handle.task,
                            resources: shared,
                        });
                    }
                }
            }
            WorkerEventKind::Blocker(blocker) => {
                slot.last_progress = Instant::now();
                slot.state = WorkerState::Blocked;
                info!(worker = %event.worker, task = %task, blocker = %blocker.description, "worker blocked");
                out.push(PoolEvent::Blocker {
                    worker: event.worker,
                    task,
                    description: blocker.description,
                });
            }
            WorkerEventKind::Algedonic(signal) => {
                slot.mark_progress();
                warn!(
                    worker = %event.worker,
                    task = %task,
                    severity = %signal.severity(),
                    category = %signal.category,
                    "worker raised algedonic signal"
                );
                out.push(PoolEvent::Algedonic {
                    worker: event.worker,
                    task,
                    category: signal.category,
                    description: signal.description,
                });
            }
            WorkerEventKind::Finished(result) => {
                let stop = slot.stop;
                slot.state = WorkerState::Completed;
                slot.exited = true;
                let worker = event.worker;
                match (stop, result) {
                    (Some(StopCause::Halt), result) => {
                        let mut patch = TaskPatch::new().meta("interrupted", true);
                        if let Ok(handoff) = result {
                            patch = patch.meta(HANDOFF_KEY, handoff.to_value());
                        }
                        self.patch_if_open(task, patch)?;
                        self.interrupted.push(task);
                        info!(worker = %worker, task = %task, "worker stopped by HALT");
                    }
                    (Some(StopCause::Cancel), _) | (Some(StopCause::Stall), _) => {
                        debug!(worker = %worker, task = %task, "cancelled worker exited");
                    }
                    (None, Ok(handoff)) => {
                        self.finish_task(&worker, task, handoff, out)?;
                    }
                    (None, Err(e)) => {
                        if let Some(slot) = self.workers.get_mut(&worker) {
                            slot.state = WorkerState::Blocked;
                        }
                        warn!(worker = %worker, task = %task, error = %format!("{:#}", e), "worker failed");
                        out.push(PoolEvent::Blocker {
                            worker,
                            task,
                            description: format!("worker failed: {:#}", e),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn patch_if_open(&self, task: TaskId, patch: TaskPatch) -> EngineResult<()> {
        match self.store.update(task, patch) {
            Ok(_) | Err(EngineError::Closed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn finish_task(
        &mut self,
        worker: &WorkerId,
        task: TaskId,
        handoff: Handoff,
        out: &mut Vec<PoolEvent>,
    ) -> EngineResult<()> {
        let patch = TaskPatch::new()
            .status(TaskStatus::Completed)
            .meta(HANDOFF_KEY, handoff.to_value());
        match self.store.update(task, patch) {
            Ok(_) => {
                info!(worker = %worker, task = %task, "task completed");
                out.push(PoolEvent::Completed {
                    worker: worker.clone(),
                    task,
                });
            }
            Err(EngineError::Blocked { by, .. }) => {
                self.store
                    .update(task, TaskPatch::new().meta(HANDOFF_KEY, handoff.to_value()))?;
                self.deferred.push(task);
                info!(task = %task, held_by = %by, "completion deferred until signal resolves");
                out.push(PoolEvent::CompletionDeferred { task, by });
            }
            Err(EngineError::Closed { .. }) => {
                debug!(task = %task, "task already closed; dropping late handoff");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn retry_deferred(&mut self, out: &mut Vec<PoolEvent>) -> EngineResult<()> {
        let pending = std::mem::take(&mut self.deferred);
        for task in pending {
            match self
                .store
                .update(task, TaskPatch::new().status(TaskStatus::Completed))
            {
                Ok(t) => {
                    info!(task = %task, "deferred completion applied");
                    let worker = t
                        .owner
                        .map(WorkerId::from)
                        .unwrap_or_else(WorkerId::generate);
                    out.push(PoolEvent::Completed { worker, task });
                }
                Err(EngineError::Blocked { .. }) => self.deferred.push(task),
                Err(EngineError::Closed { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn detect_stalls(&mut self, out: &mut Vec<PoolEvent>) -> EngineResult<()> {
        let now = Instant::now();
        let window = self.config.stall_timeout;
        let mut suspects: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.state == WorkerState::Working)
            .filter(|(_, w)| now.duration_since(w.last_progress) >= window)
            .map(|(id, _)| id.clone())
            .collect();
        suspects.sort();

        for worker in suspects {
            let Some(slot) = self.workers.get(&worker) else {
                continue;
            };
            let task = self.store.get(slot.handle.task)?;
            let attempt = slot.handle.attempt;
            let last_seen = slot.last_seen_update;

            // A status or metadata write through the Task API is progress too.
            if task.updated_at > last_seen || task.is_completed() || self.store.held_by(task.id)?.is_some() {
                if let Some(slot) = self.workers.get_mut(&worker) {
                    slot.last_seen_update = task.updated_at;
                    slot.last_progress = now;
                    if task.is_completed() {
                        slot.state = WorkerState::Completed;
                    }
                }
                continue;
            }

            if let Some(slot) = self.workers.get_mut(&worker) {
                slot.state = WorkerState::Stalled;
                slot.stop = Some(StopCause::Stall);
            }
            if let Err(e) = self.bus.send_stop(worker.as_str(), "stalled") {
                warn!(worker = %worker, error = %e, "failed to deliver stop to stalled worker");
            }
            let reason = format!("no progress within {}s", window.as_secs());
            warn!(worker = %worker, task = %task.id, attempt, reason = %reason, "worker stalled");

            if attempt < MAX_STALL_DISPATCHES {
                let retry = self.replace_task(&task, Replacement::Stalled, &reason)?;
                out.push(PoolEvent::Stalled {
                    task: task.id,
                    attempt,
                    retry,
                });
            } else {
                let lineage = lineage_root(&task);
                self.patch_if_open(
                    task.id,
                    TaskPatch::new()
                        .status(TaskStatus::Completed)
                        .meta("stalled", true)
                        .meta("reason", reason.as_str())
                        .meta("escalated", true),
                )?;
                warn!(task = %task.id, lineage = %lineage, attempts = attempt, "stall retry exhausted");
                out.push(PoolEvent::StallEscalated {
                    task: task.id,
                    lineage,
                    attempts: attempt,
                });
            }
        }
        Ok(())
    }

    /// Close `task` and create a fresh copy that every dependent now waits
    /// on. Dependents are repointed before the old task completes, so they
    /// never treat an abandoned predecessor as satisfied.
    pub fn replace_task(&mut self, task: &Task, why: Replacement, reason: &str) -> EngineResult<TaskId> {
        let attempt = task.meta_u64("attempt").unwrap_or(1) as u32;
        let next_attempt = match why {
            Replacement::Stalled => attempt + 1,
            Replacement::Interrupted | Replacement::Redo => attempt,
        };
        let lineage = lineage_root(task);

        let mut context: Map<String, Value> = task
            .metadata
            .iter()
            .filter(|(k, _)| !LINEAGE_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(handoff) = task.metadata.get(HANDOFF_KEY) {
            context.insert("partial_handoff".to_string(), handoff.clone());
        }

        let mut new = NewTask::new(TaskKind::Retry, task.subject.clone(), task.description.clone())
            .with_file_scope(task.file_scope.clone())
            .with_meta("retry_of", lineage.0)
            .with_meta("previous", task.id.0)
            .with_meta("attempt", next_attempt)
            .with_meta("context", Value::Object(context));
        if let Some(parent) = task.parent {
            new = new.with_parent(parent);
        }
        if let Some(ref scope) = task.scope_id {
            new = new.with_scope(scope.clone());
        }
        if let Some(ref capability) = task.capability {
            new = new.with_capability(capability.clone());
        }
        let retry = self.store.create(new)?;

        for dependent in self.store.dependents(task.id)? {
            match self
                .store
                .update(dependent, TaskPatch::new().add_blocked_by(retry))
            {
                Ok(_) | Err(EngineError::Closed { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.patch_if_open(
            task.id,
            TaskPatch::new()
                .status(TaskStatus::Completed)
                .meta(why.flag(), true)
                .meta("reason", reason)
                .meta("retried_as", retry.0),
        )?;

        info!(task = %task.id, retry = %retry, attempt = next_attempt, reason, "task replaced");
        Ok(retry)
    }

    /// Replace a task whose worker gave up, once triage decided to carry
    /// on. A worker that is still running keeps its task and `None` is
    /// returned.
    pub fn redo(&mut self, task_id: TaskId, reason: &str) -> EngineResult<Option<TaskId>> {
        let task = self.store.get(task_id)?;
        if task.is_completed() {
            return Ok(None);
        }
        if self
            .workers
            .values()
            .any(|w| w.handle.task == task_id && w.is_running())
        {
            return Ok(None);
        }
        for slot in self.workers.values_mut() {
            if slot.handle.task == task_id && slot.state == WorkerState::Blocked {
                slot.state = WorkerState::Completed;
            }
        }
        self.replace_task(&task, Replacement::Redo, reason).map(Some)
    }

    fn redeliver_halt(&mut self) -> EngineResult<()> {
        let Some(ref message) = self.halt else {
            return Ok(());
        };
        for slot in self.workers.values() {
            if slot.is_running() {
                self.bus.redeliver(message, slot.handle.id.as_str())?;
            }
        }
        Ok(())
    }

    /// Gracefully ask a worker to leave the pool. Workers that are mid-task
    /// answer `Busy` and are retired by a later `poll` once they finish.
    pub fn retire(&mut self, worker: &WorkerId) -> EngineResult<RetireOutcome> {
        let Some(slot) = self.workers.get_mut(worker) else {
            return Err(EngineError::Other(anyhow::anyhow!("Unknown worker {}", worker)));
        };
        if slot.state.is_active() {
            slot.retire_requested = true;
            debug!(worker = %worker, "retire deferred: worker busy");
            return Ok(RetireOutcome::Busy);
        }
        self.workers.remove(worker);
        self.bus.unregister(worker.as_str())?;
        debug!(worker = %worker, "worker retired");
        Ok(RetireOutcome::Retired)
    }

    fn process_retirements(&mut self, out: &mut Vec<PoolEvent>) -> EngineResult<()> {
        let ready: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.retire_requested && !w.state.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        for worker in ready {
            if self.retire(&worker)? == RetireOutcome::Retired {
                out.push(PoolEvent::Retired { worker });
            }
        }
        Ok(())
    }

    /// Broadcast a stop to every worker on the bus (all pools sharing it).
    pub fn halt_all(&mut self, reason: &str) -> EngineResult<usize> {
        let message = self.bus.broadcast_stop(reason)?;
        let mut stopped = 0;
        for slot in self.workers.values_mut() {
            if slot.state.is_active() {
                slot.stop.get_or_insert(StopCause::Halt);
                stopped += 1;
            }
        }
        self.halt = Some(message);
        warn!(workers = stopped, reason, "HALT broadcast to all workers");
        Ok(stopped)
    }

    /// Lift a HALT and replace every task its stop interrupted.
    pub fn resume(&mut self) -> EngineResult<Vec<PoolEvent>> {
        self.halt = None;
        let mut out = Vec::new();
        for task_id in std::mem::take(&mut self.interrupted) {
            let task = self.store.get(task_id)?;
            if task.is_completed() {
                continue;
            }
            let retry = self.replace_task(&task, Replacement::Interrupted, "stopped by HALT")?;
            out.push(PoolEvent::Resumed {
                task: task_id,
                retry,
            });
        }
        info!(replaced = out.len(), "pool resumed after HALT");
        Ok(out)
    }

    /// Stop the workers owning `tasks` without treating them as interrupted.
    pub fn cancel_tasks(&mut self, tasks: &[TaskId], reason: &str) -> EngineResult<usize> {
        let mut cancelled = 0;
        for slot in self.workers.values_mut() {
            if slot.state.is_active() && tasks.contains(&slot.handle.task) {
                slot.stop = Some(StopCause::Cancel);
                self.bus.send_stop(slot.handle.id.as_str(), reason)?;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Ask every worker to stop, wait briefly, then abort stragglers.
    pub async fn shutdown(&mut self, grace: Duration) {
        for slot in self.workers.values_mut() {
            if slot.state.is_active() {
                slot.stop.get_or_insert(StopCause::Cancel);
                if let Err(e) = self.bus.send_stop(slot.handle.id.as_str(), "shutdown") {
                    warn!(worker = %slot.handle.id, error = %e, "failed to deliver shutdown stop");
                }
            }
        }
        for (id, slot) in self.workers.drain() {
            let mut join = slot.join;
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                warn!(worker = %id, "worker did not stop in time; aborting");
                join.abort();
            }
            if let Err(e) = self.bus.unregister(id.as_str()) {
                warn!(worker = %id, error = %e, "failed to close worker inbox");
            }
        }
    }
}

fn lineage_root(task: &Task) -> TaskId {
    task.meta_u64("retry_of")
        .map(|id| TaskId(id as i64))
        .unwrap_or(task.id)
}

/// Summary of a retry chain used in escalation messages.
pub fn lineage_summary(task: &Task) -> Value {
    json!({
        "lineage": lineage_root(task).0,
        "task": task.id.0,
        "attempt": task.meta_u64("attempt").unwrap_or(1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::registry::ExecutionCapability;
    use crate::store::TaskFilter;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Never reports progress; exits only when stopped.
    struct Hang;

    #[async_trait]
    impl ExecutionCapability for Hang {
        async fn execute(&self, mut ctx: WorkerContext) -> anyhow::Result<Handoff> {
            ctx.stopped().await;
            anyhow::bail!("stopped")
        }
    }

    struct Quick;

    #[async_trait]
    impl ExecutionCapability for Quick {
        async fn execute(&self, ctx: WorkerContext) -> anyhow::Result<Handoff> {
            ctx.progress.output("<progress>100%</progress>");
            Ok(Handoff::new().artifact(format!("{}.out", ctx.task.subject)))
        }
    }

    /// Works until released.
    struct Gate(Arc<Notify>);

    #[async_trait]
    impl ExecutionCapability for Gate {
        async fn execute(&self, ctx: WorkerContext) -> anyhow::Result<Handoff> {
            ctx.progress.progress("started");
            self.0.notified().await;
            Ok(Handoff::new().decision("released"))
        }
    }

    /// Reports touching a file outside its declared scope, then hangs.
    struct Toucher;

    #[async_trait]
    impl ExecutionCapability for Toucher {
        async fn execute(&self, mut ctx: WorkerContext) -> anyhow::Result<Handoff> {
            ctx.progress.touched(vec!["src/b.rs".to_string()]);
            ctx.stopped().await;
            anyhow::bail!("stopped")
        }
    }

    fn pool_with(registry: CapabilityRegistry, config: PoolConfig) -> (TaskStore, WorkerPool) {
        let store = TaskStore::open_in_memory().unwrap();
        let pool = WorkerPool::new(
            store.clone(),
            registry,
            MessageBus::new(),
            WorkspaceHandle::root("/tmp/project"),
            config,
        );
        (store, pool)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_b_stall_retry_then_escalate() {
        let registry = CapabilityRegistry::new().with_default(Arc::new(Hang));
        let config = PoolConfig::default().with_stall_timeout(Duration::from_secs(10));
        let (store, mut pool) = pool_with(registry, config);

        let t1 = store
            .create(NewTask::work("T1", "build it").with_meta("notes", "half done"))
            .unwrap();
        let t2 = store
            .create(NewTask::work("T2", "").with_blocked_by([t1]))
            .unwrap();

        let first = pool.dispatch(t1).unwrap();
        assert_eq!(first.attempt, 1);
        settle().await;
        assert!(pool.poll().unwrap().is_empty());
        assert_eq!(pool.state(&first.id), Some(WorkerState::Working));

        // Inside the window nothing happens
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(pool.poll().unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let events = pool.poll().unwrap();
        let retry = match events.as_slice() {
            [PoolEvent::Stalled { task, attempt: 1, retry }] if *task == t1 => *retry,
            other => panic!("unexpected events: {:?}", other),
        };

        let stalled = store.get(t1).unwrap();
        assert!(stalled.is_completed());
        assert!(stalled.flag("stalled"));
        assert!(stalled.meta_str("reason").is_some());

        let fresh = store.get(retry).unwrap();
        assert_eq!(fresh.kind, TaskKind::Retry);
        assert_eq!(fresh.meta_u64("attempt"), Some(2));
        assert_eq!(fresh.meta_u64("retry_of"), Some(t1.0 as u64));
        assert_eq!(fresh.metadata["context"]["notes"], "half done");
        assert!(store.get(t2).unwrap().blocked_by.contains(&retry));

        let second = pool.dispatch(retry).unwrap();
        assert_eq!(second.attempt, 2);
        assert_ne!(second.id, first.id);
        settle().await;
        pool.poll().unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let events = pool.poll().unwrap();
        assert!(matches!(
            events.as_slice(),
            [PoolEvent::StallEscalated { task, lineage, attempts: 2 }] if *task == retry && *lineage == t1
        ));
        assert!(store.get(retry).unwrap().flag("stalled"));

        // No third dispatch: only one retry task ever exists
        settle().await;
        let later = pool.poll().unwrap();
        assert!(later.iter().all(|e| !matches!(e, PoolEvent::Stalled { .. } | PoolEvent::StallEscalated { .. })));
        let retries = store
            .list(&TaskFilter::all().kind(TaskKind::Retry))
            .unwrap();
        assert_eq!(retries.len(), 1);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_resets_stall_window() {
        let registry = CapabilityRegistry::new().with_default(Arc::new(Hang));
        let config = PoolConfig::default().with_stall_timeout(Duration::from_secs(10));
        let (store, mut pool) = pool_with(registry, config);
        let t1 = store.create(NewTask::work("T1", "")).unwrap();

        pool.dispatch(t1).unwrap();
        settle().await;
        pool.poll().unwrap();

        // A metadata write through the Task API counts as progress
        tokio::time::advance(Duration::from_secs(8)).await;
        store.update(t1, TaskPatch::new().meta("step", 1)).unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(pool.poll().unwrap().is_empty());
        assert!(!store.get(t1).unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_eager_dispatch_sequences_shared_files() {
        let registry = CapabilityRegistry::new().with_default(Arc::new(Quick));
        let (store, mut pool) = pool_with(registry, PoolConfig::default());

        let a = store
            .create(NewTask::work("a", "").with_file_scope(vec!["src/a.rs".into()]))
            .unwrap();
        let b = store
            .create(NewTask::work("b", "").with_file_scope(vec!["src/*.rs".into()]))
            .unwrap();
        let c = store
            .create(NewTask::work("c", "").with_file_scope(vec!["docs/c.md".into()]))
            .unwrap();

        let candidates = store.list(&TaskFilter::all()).unwrap();
        let dispatched: Vec<TaskId> = pool
            .fill(&candidates)
            .unwrap()
            .into_iter()
            .map(|h| h.task)
            .collect();
        assert_eq!(dispatched, vec![a, c]);

        settle().await;
        let events = pool.poll().unwrap();
        let completed: Vec<TaskId> = events
            .iter()
            .filter_map(|e| match e {
                PoolEvent::Completed { task, .. } => Some(*task),
                _ => None,
            })
            .collect();
        assert_eq!(completed.len(), 2);

        let done = store.get(a).unwrap();
        assert_eq!(Handoff::from_task(&done).unwrap().artifacts, vec!["a.out"]);

        let candidates = vec![store.get(b).unwrap()];
        assert_eq!(pool.fill(&candidates).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exited_workers_release_slot_and_inbox() {
        let registry = CapabilityRegistry::new().with_default(Arc::new(Quick));
        let (store, mut pool) = pool_with(registry, PoolConfig::default());
        for i in 0..3 {
            store.create(NewTask::work(format!("t{}", i), "")).unwrap();
        }

        pool.fill(&store.list(&TaskFilter::all()).unwrap()).unwrap();
        assert_eq!(pool.bus().recipients().unwrap().len(), 3);
        settle().await;
        let events = pool.poll().unwrap();
        assert_eq!(
            events.iter().filter(|e| matches!(e, PoolEvent::Completed { .. })).count(),
            3
        );
        assert!(pool.workers().is_empty());
        assert!(pool.bus().recipients().unwrap().is_empty());
        assert!(pool.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_worker_released_once_it_stops() {
        let registry = CapabilityRegistry::new().with_default(Arc::new(Hang));
        let config = PoolConfig::default().with_stall_timeout(Duration::from_secs(10));
        let (store, mut pool) = pool_with(registry, config);
        let t1 = store.create(NewTask::work("T1", "")).unwrap();

        let first = pool.dispatch(t1).unwrap();
        settle().await;
        pool.poll().unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        pool.poll().unwrap();

        // The stop has been sent; once the worker exits its slot goes
        settle().await;
        pool.poll().unwrap();
        assert_eq!(pool.state(&first.id), None);
        assert!(!pool.bus().recipients().unwrap().contains(&first.id.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_recovery_survives_undeliverable_stop() {
        let registry = CapabilityRegistry::new().with_default(Arc::new(Hang));
        let config = PoolConfig::default().with_stall_timeout(Duration::from_secs(10));
        let (store, mut pool) = pool_with(registry, config);
        let t1 = store.create(NewTask::work("T1", "")).unwrap();

        let first = pool.dispatch(t1).unwrap();
        settle().await;
        pool.poll().unwrap();
        pool.bus().unregister(first.id.as_str()).unwrap();
        assert!(pool.bus().send_stop(first.id.as_str(), "stalled").is_err());

        tokio::time::advance(Duration::from_secs(11)).await;
        let events = pool.poll().unwrap();
        assert!(matches!(events.as_slice(), [PoolEvent::Stalled { task, attempt: 1, .. }] if *task == t1));
        assert!(store.get(t1).unwrap().flag("stalled"));
    }

    #[tokio::test]
    async fn test_fill_respects_max_parallel() {
        let release = Arc::new(Notify::new());
        let registry = CapabilityRegistry::new().with_default(Arc::new(Gate(release.clone())));
        let (store, mut pool) = pool_with(registry, PoolConfig::default().with_max_parallel(2));
        for i in 0..4 {
            store.create(NewTask::work(format!("t{}", i), "")).unwrap();
        }
        let candidates = store.list(&TaskFilter::all()).unwrap();
        assert_eq!(pool.fill(&candidates).unwrap().len(), 2);
        assert_eq!(pool.active_count(), 2);
        release.notify_waiters();
    }

    #[tokio::test]
    async fn test_dispatch_rejects_non_pending_and_unknown_capability() {
        let registry = CapabilityRegistry::new().register("backend", Arc::new(Quick));
        let (store, mut pool) = pool_with(registry, PoolConfig::default());

        let unknown = store
            .create(NewTask::work("x", "").with_capability("frontend"))
            .unwrap();
        assert!(matches!(pool.dispatch(unknown), Err(EngineError::Other(_))));
        assert_eq!(store.get(unknown).unwrap().status, TaskStatus::Pending);

        let t = store
            .create(NewTask::work("y", "").with_capability("backend"))
            .unwrap();
        pool.dispatch(t).unwrap();
        assert!(matches!(
            pool.dispatch(t),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_retire_busy_then_retired() {
        let release = Arc::new(Notify::new());
        let registry = CapabilityRegistry::new().with_default(Arc::new(Gate(release.clone())));
        let (store, mut pool) = pool_with(registry, PoolConfig::default());
        let t = store.create(NewTask::work("t", "")).unwrap();

        let handle = pool.dispatch(t).unwrap();
        settle().await;
        pool.poll().unwrap();
        assert_eq!(pool.retire(&handle.id).unwrap(), RetireOutcome::Busy);

        release.notify_waiters();
        settle().await;
        let events = pool.poll().unwrap();
        assert!(events.contains(&PoolEvent::Retired {
            worker: handle.id.clone()
        }));
        assert!(store.get(t).unwrap().is_completed());
        assert_eq!(pool.state(&handle.id), None);
    }

    #[tokio::test]
    async fn test_halt_stops_every_worker_and_resume_replaces() {
        let registry = CapabilityRegistry::new().with_default(Arc::new(Hang));
        let (store, mut pool) = pool_with(registry, PoolConfig::default());
        let a = store.create(NewTask::work("a", "")).unwrap();
        let b = store.create(NewTask::work("b", "")).unwrap();
        let after = store
            .create(NewTask::work("after", "").with_blocked_by([a]))
            .unwrap();

        pool.fill(&store.list(&TaskFilter::all()).unwrap()).unwrap();
        settle().await;
        pool.poll().unwrap();

        assert_eq!(pool.halt_all("HALT(security): leaked token").unwrap(), 2);
        settle().await;
        pool.poll().unwrap();
        assert_eq!(pool.active_count(), 0);
        let mut interrupted = pool.interrupted().to_vec();
        interrupted.sort();
        assert_eq!(interrupted, vec![a, b]);
        assert!(store.get(a).unwrap().flag("interrupted"));
        assert!(!store.get(a).unwrap().is_completed());

        // Nothing new is dispatched while halted
        assert!(pool.fill(&store.list(&TaskFilter::all()).unwrap()).unwrap().is_empty());

        let events = pool.resume().unwrap();
        assert_eq!(events.len(), 2);
        let retry_a = events
            .iter()
            .find_map(|e| match e {
                PoolEvent::Resumed { task, retry } if *task == a => Some(*retry),
                _ => None,
            })
            .unwrap();
        assert_eq!(store.get(retry_a).unwrap().meta_u64("attempt"), Some(1));
        assert!(store.get(after).unwrap().blocked_by.contains(&retry_a));
    }

    #[tokio::test]
    async fn test_completion_deferred_while_signal_open() {
        let registry = CapabilityRegistry::new().with_default(Arc::new(Quick));
        let (store, mut pool) = pool_with(registry, PoolConfig::default());
        let phase = store
            .create(NewTask::new(TaskKind::Phase, "execute", ""))
            .unwrap();
        store
            .update(phase, TaskPatch::new().status(TaskStatus::InProgress))
            .unwrap();
        let work = store
            .create(NewTask::work("w", "").with_parent(phase))
            .unwrap();

        pool.dispatch(work).unwrap();
        let alert = store
            .create(NewTask::new(TaskKind::Signal, "ALERT quality", ""))
            .unwrap();
        store
            .update(phase, TaskPatch::new().add_blocked_by(alert))
            .unwrap();

        settle().await;
        let events = pool.poll().unwrap();
        assert!(events.contains(&PoolEvent::CompletionDeferred { task: work, by: alert }));
        assert!(!store.get(work).unwrap().is_completed());
        assert!(Handoff::from_task(&store.get(work).unwrap()).is_some());

        store
            .update(alert, TaskPatch::new().status(TaskStatus::Completed))
            .unwrap();
        let events = pool.poll().unwrap();
        assert!(matches!(events.as_slice(), [PoolEvent::Completed { task, .. }] if *task == work));
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn test_conflict_discovered_after_dispatch() {
        let registry = CapabilityRegistry::new()
            .register("hang", Arc::new(Hang))
            .register("toucher", Arc::new(Toucher));
        let (store, mut pool) = pool_with(registry, PoolConfig::default());

        let b = store
            .create(
                NewTask::work("b", "")
                    .with_capability("hang")
                    .with_file_scope(vec!["src/b.rs".into()]),
            )
            .unwrap();
        let a = store
            .create(
                NewTask::work("a", "")
                    .with_capability("toucher")
                    .with_file_scope(vec!["src/a.rs".into()]),
            )
            .unwrap();

        pool.fill(&store.list(&TaskFilter::all()).unwrap()).unwrap();
        assert_eq!(pool.active_count(), 2);
        settle().await;
        let events = pool.poll().unwrap();
        assert!(events.contains(&PoolEvent::Conflict {
            task: a,
            other: b,
            resources: vec!["src/b.rs".to_string()],
        }));
        pool.shutdown(Duration::from_millis(100)).await;
    }
}
