//! Phase State Machine.
//!
//! Phases are tasks of kind `phase` chained by `blocked_by`, so "no phase
//! starts before its predecessor completes" is the ordinary ready rule.
//! Entering a phase either skips it straight to `completed` or moves it to
//! `in_progress` and creates its work. A phase completes once all of its
//! children have; a feature once all of its phases have.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};
use crate::phase::checker::{CompletenessChecker, SkipDecision};
use crate::phase::template::{FeatureTemplate, PhaseSpec};
use crate::pool::Handoff;
use crate::store::{NewTask, Task, TaskFilter, TaskId, TaskKind, TaskPatch, TaskStatus, TaskStore};

/// Metadata key holding the phase name.
pub const PHASE_KEY: &str = "phase";
const SPEC_KEY: &str = "spec";
const INDEX_KEY: &str = "index";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureHandle {
    pub feature: TaskId,
    pub phases: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PhaseEntry {
    Skipped { reason: String },
    Entered { work: Vec<TaskId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseTransition {
    PhaseCompleted { phase: TaskId },
    FeatureCompleted { feature: TaskId },
}

#[derive(Clone)]
pub struct PhaseMachine {
    store: TaskStore,
}

impl PhaseMachine {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// Create a feature and its phase chain. The feature starts in progress;
    /// every phase starts pending.
    pub fn start_feature(
        &self,
        subject: &str,
        description: &str,
        template: &FeatureTemplate,
    ) -> EngineResult<FeatureHandle> {
        template.validate()?;
        let feature = self.store.create(
            NewTask::new(TaskKind::Feature, subject, description)
                .with_meta("template", serde_json::to_value(template)?),
        )?;
        self.store
            .update(feature, TaskPatch::new().status(TaskStatus::InProgress))?;
        let phases = self.instantiate(feature, template, None)?;
        info!(feature = %feature, phases = phases.len(), subject, "feature started");
        Ok(FeatureHandle { feature, phases })
    }

    /// Create `template`'s phases under `root` (a feature or a sub-scope).
    pub fn instantiate(
        &self,
        root: TaskId,
        template: &FeatureTemplate,
        scope: Option<&str>,
    ) -> EngineResult<Vec<TaskId>> {
        let mut phases = Vec::with_capacity(template.phases.len());
        for (index, spec) in template.phases.iter().enumerate() {
            let mut new = NewTask::new(TaskKind::Phase, spec.name.clone(), spec.description.clone())
                .with_parent(root)
                .with_blocked_by(phases.last().copied())
                .with_meta(PHASE_KEY, spec.name.as_str())
                .with_meta(INDEX_KEY, index)
                .with_meta(SPEC_KEY, serde_json::to_value(spec)?);
            if let Some(scope) = scope {
                new = new.with_scope(scope);
            }
            phases.push(self.store.create(new)?);
        }
        Ok(phases)
    }

    /// Phases under `root`, in creation order (re-entries last).
    pub fn phases(&self, root: TaskId) -> EngineResult<Vec<Task>> {
        self.store
            .list(&TaskFilter::all().parent(root).kind(TaskKind::Phase))
    }

    /// The first pending phase that may be entered now.
    pub fn next_ready(&self, root: TaskId) -> EngineResult<Option<Task>> {
        for phase in self.phases(root)? {
            if phase.status != TaskStatus::Pending {
                continue;
            }
            if self.waiting_on(&phase)?.is_empty() && self.store.held_by(phase.id)?.is_none() {
                return Ok(Some(phase));
            }
        }
        Ok(None)
    }

    fn waiting_on(&self, task: &Task) -> EngineResult<Vec<TaskId>> {
        let mut waiting = Vec::new();
        for blocker in &task.blocked_by {
            if !self.store.get(*blocker)?.is_completed() {
                waiting.push(*blocker);
            }
        }
        Ok(waiting)
    }

    fn require_phase(&self, id: TaskId) -> EngineResult<Task> {
        let task = self.store.get(id)?;
        if task.kind != TaskKind::Phase {
            return Err(EngineError::WrongKind {
                id,
                expected: "phase",
            });
        }
        Ok(task)
    }

    fn check_enterable(&self, phase: &Task) -> EngineResult<()> {
        if phase.status != TaskStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id: phase.id,
                from: phase.status,
                to: TaskStatus::InProgress,
            });
        }
        let waiting_on = self.waiting_on(phase)?;
        if !waiting_on.is_empty() {
            return Err(EngineError::PhaseOrder {
                phase: phase.id,
                waiting_on,
            });
        }
        if let Some(by) = self.store.held_by(phase.id)? {
            return Err(EngineError::Blocked { id: phase.id, by });
        }
        Ok(())
    }

    /// Enter a phase: consult the completeness checker, then either skip it
    /// or start it and create its work.
    pub async fn enter(
        &self,
        phase: TaskId,
        checker: &dyn CompletenessChecker,
    ) -> EngineResult<PhaseEntry> {
        let task = self.require_phase(phase)?;
        self.check_enterable(&task)?;

        let upstream = self.upstream_output(&task)?;
        match checker.check(&task, upstream.as_ref()).await? {
            SkipDecision::Skip { reason } => {
                self.skip(phase, &reason)?;
                Ok(PhaseEntry::Skipped { reason })
            }
            SkipDecision::Run => {
                let spec = phase_spec(&task);
                self.store
                    .update(phase, TaskPatch::new().status(TaskStatus::InProgress))?;
                let work = self.create_work(&task, &spec)?;
                info!(phase = %phase, name = %spec.name, work = work.len(), "phase entered");
                Ok(PhaseEntry::Entered { work })
            }
        }
    }

    /// Complete a phase without running it.
    pub fn skip(&self, phase: TaskId, reason: &str) -> EngineResult<()> {
        let task = self.require_phase(phase)?;
        if task.status != TaskStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id: phase,
                from: task.status,
                to: TaskStatus::Completed,
            });
        }
        self.store.update(
            phase,
            TaskPatch::new()
                .status(TaskStatus::Completed)
                .meta("skipped", true)
                .meta("skip_reason", reason),
        )?;
        info!(phase = %phase, name = %task.subject, reason, "phase skipped");
        Ok(())
    }

    /// Start a phase whose work will be supplied by decomposed sub-scopes.
    pub fn begin_decomposed(&self, phase: TaskId, scopes: usize) -> EngineResult<()> {
        let task = self.require_phase(phase)?;
        self.check_enterable(&task)?;
        self.store.update(
            phase,
            TaskPatch::new()
                .status(TaskStatus::InProgress)
                .meta("decomposed", true)
                .meta("scopes", scopes),
        )?;
        info!(phase = %phase, scopes, "phase entered with sub-scopes");
        Ok(())
    }

    fn create_work(&self, phase: &Task, spec: &PhaseSpec) -> EngineResult<Vec<TaskId>> {
        let mut by_subject: HashMap<String, TaskId> = HashMap::new();
        let mut created = Vec::new();
        for work in spec.entry_work() {
            let blockers: Vec<TaskId> = work
                .after
                .iter()
                .filter_map(|s| by_subject.get(s).copied())
                .collect();
            let mut new = NewTask::work(work.subject.clone(), work.description.clone())
                .with_parent(phase.id)
                .with_blocked_by(blockers)
                .with_file_scope(work.file_scope.clone());
            if let Some(capability) = work.capability {
                new = new.with_capability(capability);
            }
            if let Some(ref scope) = phase.scope_id {
                new = new.with_scope(scope.clone());
            }
            let id = self.store.create(new)?;
            by_subject.insert(work.subject, id);
            created.push(id);
        }
        Ok(created)
    }

    /// Merged handoff of every completed work item under `phase`.
    pub fn phase_output(&self, phase: TaskId) -> EngineResult<Handoff> {
        let mut merged = Handoff::new();
        for id in self.store.descendants(phase)? {
            let task = self.store.get(id)?;
            if task.is_completed()
                && let Some(handoff) = Handoff::from_task(&task)
            {
                merged.merge(handoff);
            }
        }
        Ok(merged)
    }

    fn upstream_output(&self, phase: &Task) -> EngineResult<Option<Handoff>> {
        let mut merged: Option<Handoff> = None;
        for blocker in &phase.blocked_by {
            let task = self.store.get(*blocker)?;
            if task.kind != TaskKind::Phase {
                continue;
            }
            merged
                .get_or_insert_with(Handoff::new)
                .merge(self.phase_output(task.id)?);
        }
        Ok(merged)
    }

    /// Complete in-progress phases whose work is done, and the feature once
    /// every phase is.
    pub fn advance(&self, root: TaskId) -> EngineResult<Vec<PhaseTransition>> {
        let mut transitions = Vec::new();
        let phases = self.phases(root)?;

        for phase in phases.iter().filter(|p| p.status == TaskStatus::InProgress) {
            let children = self.store.list(&TaskFilter::all().parent(phase.id))?;
            if children.is_empty() || children.iter().any(|c| !c.is_completed()) {
                continue;
            }
            if !self.waiting_on(phase)?.is_empty() {
                continue;
            }
            if let Some(by) = self.store.held_by(phase.id)? {
                debug!(phase = %phase.id, held_by = %by, "phase work done but held");
                continue;
            }
            self.store
                .update(phase.id, TaskPatch::new().status(TaskStatus::Completed))?;
            info!(phase = %phase.id, name = %phase.subject, "phase completed");
            transitions.push(PhaseTransition::PhaseCompleted { phase: phase.id });
        }

        let root_task = self.store.get(root)?;
        if root_task.kind == TaskKind::Feature
            && !root_task.is_completed()
            && self.is_finished(root)?
            && self.store.held_by(root)?.is_none()
        {
            self.store
                .update(root, TaskPatch::new().status(TaskStatus::Completed))?;
            info!(feature = %root, "feature completed");
            transitions.push(PhaseTransition::FeatureCompleted { feature: root });
        }
        Ok(transitions)
    }

    /// Every phase under `root` is completed.
    pub fn is_finished(&self, root: TaskId) -> EngineResult<bool> {
        let phases = self.phases(root)?;
        Ok(!phases.is_empty() && phases.iter().all(Task::is_completed))
    }

    /// Redo an earlier phase. The completed phase is left untouched: a new
    /// phase task is created and the current phase (and its pending work)
    /// waits on it.
    pub fn reenter(&self, current: TaskId, target: TaskId, reason: &str) -> EngineResult<TaskId> {
        let current_task = self.require_phase(current)?;
        let target_task = self.require_phase(target)?;
        let earlier = target_task.meta_u64(INDEX_KEY) < current_task.meta_u64(INDEX_KEY);
        if current_task.parent != target_task.parent || !target_task.is_completed() || !earlier {
            return Err(EngineError::WrongKind {
                id: target,
                expected: "completed earlier phase of the same feature",
            });
        }
        if current_task.is_completed() {
            return Err(EngineError::Closed { id: current });
        }

        let spec = phase_spec(&target_task);
        let mut new = NewTask::new(
            TaskKind::Phase,
            format!("{} (redo)", target_task.subject),
            target_task.description.clone(),
        )
        .with_meta(PHASE_KEY, spec.name.as_str())
        .with_meta(SPEC_KEY, serde_json::to_value(&spec)?)
        .with_meta("retry_of", target.0)
        .with_meta("reentry", true)
        .with_meta("reason", reason);
        if let Some(index) = target_task.meta_u64(INDEX_KEY) {
            new = new.with_meta(INDEX_KEY, index);
        }
        if let Some(parent) = target_task.parent {
            new = new.with_parent(parent);
        }
        if let Some(ref scope) = target_task.scope_id {
            new = new.with_scope(scope.clone());
        }
        let redo = self.store.create(new)?;

        self.store
            .update(current, TaskPatch::new().add_blocked_by(redo))?;
        for child in self.store.list(&TaskFilter::all().parent(current))? {
            if child.status == TaskStatus::Pending {
                self.store
                    .update(child.id, TaskPatch::new().add_blocked_by(redo))?;
            }
        }
        info!(current = %current, target = %target, redo = %redo, reason, "phase re-entry");
        Ok(redo)
    }

    /// End a feature early. Every open task under it is completed with
    /// `{stopped: true}` in one write, even where a signal still holds it;
    /// the ids of the closed tasks are returned so their workers can be
    /// cancelled.
    pub fn stop_feature(&self, feature: TaskId, reason: &str) -> EngineResult<Vec<TaskId>> {
        let task = self.store.get(feature)?;
        if task.kind != TaskKind::Feature {
            return Err(EngineError::WrongKind {
                id: feature,
                expected: "feature",
            });
        }
        let mut open: Vec<TaskId> = self.store.descendants(feature)?;
        // deepest first, so containers close after their contents
        open.reverse();
        open.push(feature);
        let closed = self.store.close_stopped(&open, reason)?;
        info!(feature = %feature, closed = closed.len(), reason, "feature stopped");
        Ok(closed)
    }

    /// Where a feature stands, for status displays.
    pub fn summary(&self, root: TaskId) -> EngineResult<serde_json::Value> {
        let phases = self.phases(root)?;
        Ok(json!(
            phases
                .iter()
                .map(|p| json!({
                    "id": p.id.0,
                    "name": p.subject,
                    "status": p.status.as_str(),
                    "skipped": p.flag("skipped"),
                    "reentry": p.flag("reentry"),
                }))
                .collect::<Vec<_>>()
        ))
    }
}

fn phase_spec(task: &Task) -> PhaseSpec {
    task.metadata
        .get(SPEC_KEY)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_else(|| PhaseSpec::new(&task.subject, &task.description))
}
