//! The engine facade and feature driver.
//!
//! [`Engine`] owns one worker pool and exposes the Task API, messaging and
//! the signal decisions an external authority makes. [`Engine::run_feature`]
//! drives a feature (or a decomposed sub-scope) until it completes, is
//! stopped, or waits on an open signal:
//!
//! 1. poll the pool and route its events to the signal router
//! 2. settle decomposed scope tasks
//! 3. advance finished phases
//! 4. enter ready phases, assessing decomposition before the second one
//! 5. dispatch ready work up to the concurrency bound
//!
//! Nothing in a step blocks on a worker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::decomposition::{
    Approval, Assessment, ContractFulfillment, DecompositionAuthority, DecompositionConfig, DeclineAll,
    MAX_DECOMPOSITION_DEPTH, ScopeAnalysis, ScopeExecutor, ScopeRun, ScopeRunner, Tier, assess,
    is_fulfilled,
};
use crate::errors::{EngineError, EngineResult};
use crate::messaging::{Message, MessageBus};
use crate::phase::{
    AlwaysRun, CompletenessChecker, FeatureHandle, FeatureTemplate, PhaseEntry, PhaseMachine,
};
use crate::pool::{CapabilityRegistry, Handoff, PoolConfig, PoolEvent, Replacement, WorkerPool, lineage_summary};
use crate::resolver::{DependencyResolver, ReadySet};
use crate::signals::{
    AlertDecision, Category, HaltOverride, ResolvedSignal, Severity, SignalKind, SignalRouter, TriageOutcome,
    TriageVerdict,
};
use crate::store::{NewTask, Task, TaskFilter, TaskId, TaskKind, TaskPatch, TaskStatus, TaskStore};
use crate::workspace::{GitWorktreeProvider, WorkspaceHandle, WorkspaceProvider};

/// Feature metadata recording the decomposition decision.
const DECOMPOSITION_KEY: &str = "decomposition";
const SUB_SCOPE_SKIP: &str = "executed within sub-scopes";

/// How long a nested engine waits for its workers when it winds down.
const NESTED_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub pool: PoolConfig,
    /// Driver loop sleep between steps that changed nothing
    pub poll_interval: Duration,
    pub decomposition: DecompositionConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            poll_interval: Duration::from_millis(250),
            decomposition: DecompositionConfig::default(),
        }
    }
}

/// Why `run_feature` returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FeatureOutcome {
    Completed,
    /// Ended early by an ALERT stop decision
    Stopped,
    /// Nothing can move until these signals are decided
    AwaitingAuthority { signals: Vec<TaskId> },
}

/// What one driver step did.
#[derive(Debug, Default)]
pub struct StepReport {
    pub events: Vec<PoolEvent>,
    pub entered: Vec<TaskId>,
    pub dispatched: usize,
    pub phases_completed: usize,
    pub scopes_settled: usize,
}

impl StepReport {
    pub fn progressed(&self) -> bool {
        !self.events.is_empty()
            || !self.entered.is_empty()
            || self.dispatched > 0
            || self.phases_completed > 0
            || self.scopes_settled > 0
    }
}

/// Parts every engine in one process tree shares, nested ones included.
#[derive(Clone)]
struct Shared {
    store: TaskStore,
    bus: MessageBus,
    registry: CapabilityRegistry,
    settings: EngineSettings,
    checker: Arc<dyn CompletenessChecker>,
    authority: Arc<dyn DecompositionAuthority>,
    provider: Arc<dyn WorkspaceProvider>,
}

pub struct Engine {
    shared: Shared,
    router: SignalRouter,
    machine: PhaseMachine,
    resolver: DependencyResolver,
    pool: WorkerPool,
    workspace: WorkspaceHandle,
    depth: u32,
    scope: Option<String>,
    runner: Option<Arc<dyn ScopeRunner>>,
}

impl Engine {
    /// A top-level engine working in `workspace`. Sub-scopes get git
    /// worktrees of the workspace's repository unless another provider is
    /// set; confirmed-tier decompositions are declined unless an authority
    /// is set.
    pub fn new(
        store: TaskStore,
        registry: CapabilityRegistry,
        workspace: WorkspaceHandle,
        settings: EngineSettings,
    ) -> Self {
        let shared = Shared {
            store,
            bus: MessageBus::new(),
            registry,
            settings,
            checker: Arc::new(AlwaysRun),
            authority: Arc::new(DeclineAll),
            provider: Arc::new(GitWorktreeProvider::new(workspace.path.clone())),
        };
        Self::from_shared(shared, workspace, 0, None)
    }

    fn from_shared(shared: Shared, workspace: WorkspaceHandle, depth: u32, scope: Option<String>) -> Self {
        let pool = WorkerPool::new(
            shared.store.clone(),
            shared.registry.clone(),
            shared.bus.clone(),
            workspace.clone(),
            shared.settings.pool.clone(),
        );
        Self {
            router: SignalRouter::new(shared.store.clone(), shared.bus.clone()),
            machine: PhaseMachine::new(shared.store.clone()),
            resolver: DependencyResolver::new(shared.store.clone()),
            pool,
            workspace,
            depth,
            scope,
            runner: None,
            shared,
        }
    }

    pub fn with_checker(mut self, checker: Arc<dyn CompletenessChecker>) -> Self {
        self.shared.checker = checker;
        self
    }

    pub fn with_authority(mut self, authority: Arc<dyn DecompositionAuthority>) -> Self {
        self.shared.authority = authority;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn WorkspaceProvider>) -> Self {
        self.shared.provider = provider;
        self
    }

    /// Replace the default runner, which drives a nested engine per scope.
    pub fn with_runner(mut self, runner: Arc<dyn ScopeRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.shared.store
    }

    pub fn bus(&self) -> &MessageBus {
        &self.shared.bus
    }

    pub fn router(&self) -> &SignalRouter {
        &self.router
    }

    pub fn machine(&self) -> &PhaseMachine {
        &self.machine
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn workspace(&self) -> &WorkspaceHandle {
        &self.workspace
    }

    // ===== Task API =====

    pub fn task_create(&self, new: NewTask) -> EngineResult<TaskId> {
        self.shared.store.create(new)
    }

    pub fn task_update(&self, id: TaskId, patch: TaskPatch) -> EngineResult<Task> {
        self.shared.store.update(id, patch)
    }

    pub fn task_list(&self, filter: &TaskFilter) -> EngineResult<Vec<Task>> {
        self.shared.store.list(filter)
    }

    pub fn task_get(&self, id: TaskId) -> EngineResult<Task> {
        self.shared.store.get(id)
    }

    pub fn ready_set(&self, scope: Option<&str>) -> EngineResult<ReadySet> {
        self.resolver.ready_set(scope)
    }

    pub fn send(&self, recipient: &str, content: &str, summary: &str) -> EngineResult<Message> {
        self.shared.bus.send(recipient, content, summary)
    }

    pub fn broadcast(&self, content: &str, summary: &str) -> EngineResult<Message> {
        self.shared.bus.broadcast(content, summary)
    }

    pub fn start_feature(
        &self,
        subject: &str,
        description: &str,
        template: &FeatureTemplate,
    ) -> EngineResult<FeatureHandle> {
        self.machine.start_feature(subject, description, template)
    }

    // ===== Signals =====

    pub fn report_blocker(&self, task: TaskId, description: &str) -> EngineResult<TaskId> {
        self.router.report_blocker(task, description)
    }

    pub fn raise_algedonic(
        &self,
        feature: TaskId,
        category: Category,
        description: &str,
        origin: Option<TaskId>,
    ) -> EngineResult<TaskId> {
        self.router.raise_algedonic(feature, category, description, origin)
    }

    pub fn open_signals(&self, feature: Option<TaskId>) -> EngineResult<Vec<Task>> {
        self.router.open_signals(feature)
    }

    /// Record a triage verdict and act on a resolution: redo the prior phase
    /// or replace the blocked task so it runs again.
    pub fn triage(&mut self, blocker: TaskId, verdict: TriageVerdict) -> EngineResult<TriageOutcome> {
        let signal = self.shared.store.get(blocker)?;
        let origin = signal
            .metadata
            .get("origin")
            .and_then(serde_json::Value::as_i64)
            .map(TaskId);
        let note = match &verdict {
            TriageVerdict::Resolved { note, .. } | TriageVerdict::Unresolved { note } => note.clone(),
        };
        let outcome = self.router.triage(blocker, verdict)?;

        let (Some(resolution), Some(origin)) = (outcome.resolution, origin) else {
            return Ok(outcome);
        };
        let task = self.shared.store.get(origin)?;
        if resolution.adds_workers() {
            info!(task = %origin, resolution = resolution.as_str(), "triage asked for more workers");
        }

        let mut redo_phase = None;
        if resolution.redoes_prior_phase()
            && let Some(current) = self.shared.store.enclosing(origin, TaskKind::Phase)?
        {
            match self.prior_phase(current)? {
                Some(prior) => {
                    let reason = if note.is_empty() { "triage: redo prior phase" } else { note.as_str() };
                    redo_phase = Some(self.machine.reenter(current, prior, reason)?);
                }
                None => warn!(task = %origin, "no earlier phase to redo; continuing in place"),
            }
        }

        // Scope tasks re-run through the executor, not the pool.
        if task.kind == TaskKind::Scope || task.is_completed() {
            return Ok(outcome);
        }
        let reason = format!("triage: {}", resolution.as_str());
        if let Some(retry) = self.pool.redo(origin, &reason)?
            && let Some(redo) = redo_phase
        {
            self.shared
                .store
                .update(retry, TaskPatch::new().add_blocked_by(redo))?;
        }
        Ok(outcome)
    }

    /// The latest completed phase before `current` in the same container.
    fn prior_phase(&self, current: TaskId) -> EngineResult<Option<TaskId>> {
        let current_task = self.shared.store.get(current)?;
        let Some(parent) = current_task.parent else {
            return Ok(None);
        };
        let index = current_task.meta_u64("index");
        Ok(self
            .machine
            .phases(parent)?
            .into_iter()
            .filter(|p| p.is_completed() && p.meta_u64("index") < index)
            .max_by_key(|p| (p.meta_u64("index"), p.id))
            .map(|p| p.id))
    }

    /// Resolve any signal. Lifting the last open HALT resumes the pool.
    pub fn resolve(&mut self, signal: TaskId, note: &str) -> EngineResult<ResolvedSignal> {
        let resolved = self.router.resolve(signal, note)?;
        if resolved.is_halt() {
            self.resume_if_clear()?;
        }
        Ok(resolved)
    }

    pub fn override_halt(&mut self, signal: TaskId, statement: HaltOverride) -> EngineResult<ResolvedSignal> {
        let resolved = self.router.override_halt(signal, statement)?;
        self.resume_if_clear()?;
        Ok(resolved)
    }

    fn resume_if_clear(&mut self) -> EngineResult<()> {
        let halts_open = self
            .router
            .open_signals(None)?
            .iter()
            .any(|s| SignalKind::of(s).and_then(SignalKind::severity) == Some(Severity::Halt));
        if halts_open {
            debug!("another HALT is still open; pool stays halted");
            return Ok(());
        }
        for event in self.pool.resume()? {
            debug!(event = ?event, "resumed after HALT");
        }
        Ok(())
    }

    /// Apply an ALERT decision. `Stop` ends the signal's feature, cancels
    /// its workers and withdraws its other open signals; the ALERT itself
    /// closes last, so a failed stop leaves it open for another decision.
    pub fn decide_alert(&mut self, signal: TaskId, decision: AlertDecision) -> EngineResult<Option<ResolvedSignal>> {
        let feature = self
            .shared
            .store
            .get(signal)?
            .metadata
            .get("feature")
            .and_then(serde_json::Value::as_i64)
            .map(TaskId);
        let (AlertDecision::Stop, Some(feature)) = (decision, feature) else {
            return self.router.decide_alert(signal, decision);
        };

        self.router.require_open_alert(signal)?;
        let reason = format!("stopped by decision on ALERT {}", signal);
        let closed = self.machine.stop_feature(feature, &reason)?;
        let cancelled = self.pool.cancel_tasks(&closed, &reason)?;
        let withdrawn = self.router.withdraw_open(feature, signal, &reason)?;
        let resolved = self.router.decide_alert(signal, decision)?;
        if self.pool.is_halted() {
            self.resume_if_clear()?;
        }
        info!(
            feature = %feature,
            closed = closed.len(),
            cancelled,
            withdrawn = withdrawn.len(),
            "feature stopped"
        );
        Ok(resolved)
    }

    // ===== Driver =====

    /// Replace in-progress work left behind by a previous process. Tasks
    /// held by a signal stay as they are until it is decided.
    pub fn recover(&mut self, root: TaskId) -> EngineResult<Vec<TaskId>> {
        let mut replaced = Vec::new();
        for id in self.shared.store.descendants(root)? {
            let task = self.shared.store.get(id)?;
            if task.status != TaskStatus::InProgress
                || !matches!(task.kind, TaskKind::Work | TaskKind::Retry)
                || task.scope_id != self.scope
                || self.pool.worker_for(id).is_some()
                || self.pool.interrupted().contains(&id)
                || self.shared.store.held_by(id)?.is_some()
            {
                continue;
            }
            let retry = self
                .pool
                .replace_task(&task, Replacement::Interrupted, "orphaned by restart")?;
            info!(task = %id, retry = %retry, "orphaned task replaced");
            replaced.push(retry);
        }
        Ok(replaced)
    }

    /// Drive `root` until it finishes or waits on the authority.
    pub async fn run_feature(&mut self, root: TaskId) -> EngineResult<FeatureOutcome> {
        let feature = self
            .shared
            .store
            .enclosing(root, TaskKind::Feature)?
            .ok_or(EngineError::WrongKind {
                id: root,
                expected: "feature or task under a feature",
            })?;
        self.recover(root)?;

        loop {
            if let Some(outcome) = self.finished(root)? {
                info!(root = %root, outcome = ?outcome, "run finished");
                return Ok(outcome);
            }
            let report = self.step(feature, root).await?;
            if report.progressed() {
                continue;
            }
            if self.pool.is_idle() {
                if let Some(outcome) = self.finished(root)? {
                    return Ok(outcome);
                }
                let signals: Vec<TaskId> = self
                    .router
                    .open_signals(Some(feature))?
                    .iter()
                    .map(|s| s.id)
                    .collect();
                if signals.is_empty() {
                    warn!(root = %root, "nothing runnable and no open signal");
                } else {
                    info!(root = %root, signals = ?signals, "waiting on authority");
                }
                return Ok(FeatureOutcome::AwaitingAuthority { signals });
            }
            tokio::time::sleep(self.shared.settings.poll_interval).await;
        }
    }

    fn finished(&self, root: TaskId) -> EngineResult<Option<FeatureOutcome>> {
        let task = self.shared.store.get(root)?;
        if task.flag("stopped") {
            return Ok(Some(FeatureOutcome::Stopped));
        }
        let done = match task.kind {
            TaskKind::Feature => task.is_completed(),
            _ => self.machine.is_finished(root)?,
        };
        Ok(done.then_some(FeatureOutcome::Completed))
    }

    /// One pass of the driver loop.
    pub async fn step(&mut self, feature: TaskId, root: TaskId) -> EngineResult<StepReport> {
        let mut report = StepReport {
            events: self.pool.poll()?,
            ..Default::default()
        };
        for event in &report.events {
            self.route_event(feature, event)?;
        }

        report.scopes_settled = self.settle_scopes(feature, root).await?;
        report.phases_completed = self.machine.advance(root)?.len();

        while let Some(phase) = self.machine.next_ready(root)? {
            if self.should_assess(root, &phase)?
                && self.decompose(feature, root, &phase).await?
            {
                report.entered.push(phase.id);
                continue;
            }
            if self.decomposed_before(root, &phase)? {
                self.machine.skip(phase.id, SUB_SCOPE_SKIP)?;
            } else {
                match self.machine.enter(phase.id, self.shared.checker.as_ref()).await? {
                    PhaseEntry::Skipped { reason } => debug!(phase = %phase.id, reason = %reason, "phase skipped"),
                    PhaseEntry::Entered { work } => debug!(phase = %phase.id, work = work.len(), "phase entered"),
                }
            }
            report.entered.push(phase.id);
        }
        if !report.entered.is_empty() {
            report.phases_completed += self.machine.advance(root)?.len();
        }

        let candidates = self.candidates(root)?;
        report.dispatched = self.pool.fill(&candidates)?.len();
        Ok(report)
    }

    fn route_event(&self, feature: TaskId, event: &PoolEvent) -> EngineResult<()> {
        match event {
            PoolEvent::Blocker { task, description, .. } => {
                self.route_blocker(*task, description)?;
            }
            PoolEvent::Algedonic {
                task,
                category,
                description,
                ..
            } => {
                self.router
                    .raise_algedonic(feature, *category, description, Some(*task))?;
            }
            PoolEvent::StallEscalated { task, lineage, attempts } => {
                let stalled = self.shared.store.get(*task)?;
                let description = format!(
                    "task {} stalled on {} dispatches (lineage {}); no further retry",
                    task, attempts, lineage
                );
                let alert = self.router.raise_algedonic(
                    feature,
                    Category::MetaBlock,
                    &description,
                    Some(*task),
                )?;
                self.shared
                    .store
                    .log_signal_event(alert, "lineage", lineage_summary(&stalled))?;
            }
            PoolEvent::Conflict { task, other, resources } => {
                self.route_blocker(
                    *task,
                    &format!(
                        "resource conflict with running task {} over {}",
                        other,
                        resources.join(", ")
                    ),
                )?;
            }
            other => debug!(event = ?other, "pool event"),
        }
        Ok(())
    }

    /// Report a worker's blocker. A worker may report one and finish within
    /// the same poll; its task is then already closed, so the blocker holds
    /// the nearest open container instead.
    fn route_blocker(&self, task: TaskId, description: &str) -> EngineResult<()> {
        match self.router.report_blocker(task, description) {
            Ok(_) => return Ok(()),
            Err(EngineError::Closed { id }) if id == task => {}
            Err(e) => return Err(e),
        }
        for container in self.shared.store.ancestors(task)? {
            if self.shared.store.get(container)?.is_completed() {
                continue;
            }
            let signal = self.router.report_blocker_on(container, task, description)?;
            warn!(task = %task, signal = %signal, held = %container, "blocker arrived after its task completed");
            return Ok(());
        }
        warn!(task = %task, description, "blocker arrived after its feature closed; dropped");
        Ok(())
    }

    /// Ready work and retry tasks under `root` in this engine's scope.
    fn candidates(&self, root: TaskId) -> EngineResult<Vec<Task>> {
        let under: HashSet<TaskId> = self.shared.store.descendants(root)?.into_iter().collect();
        Ok(self
            .resolver
            .dispatchable(self.scope.as_deref())?
            .into_iter()
            .filter(|t| t.scope_id == self.scope && under.contains(&t.id))
            .collect())
    }

    // ===== Decomposition =====

    fn should_assess(&self, root: TaskId, phase: &Task) -> EngineResult<bool> {
        if self.depth >= MAX_DECOMPOSITION_DEPTH
            || !self.shared.settings.decomposition.enabled
            || phase.meta_u64("index") != Some(1)
            || phase.flag("reentry")
        {
            return Ok(false);
        }
        let root_task = self.shared.store.get(root)?;
        Ok(root_task.kind == TaskKind::Feature && !root_task.metadata.contains_key(DECOMPOSITION_KEY))
    }

    fn decomposed_before(&self, root: TaskId, phase: &Task) -> EngineResult<bool> {
        let root_task = self.shared.store.get(root)?;
        let Some(record) = root_task.metadata.get(DECOMPOSITION_KEY) else {
            return Ok(false);
        };
        if record.get("outcome").and_then(|v| v.as_str()) != Some("decomposed") {
            return Ok(false);
        }
        let at = record.get("phase_index").and_then(|v| v.as_u64());
        Ok(!phase.flag("reentry") && phase.meta_u64("index") > at)
    }

    /// Assess decomposition before `phase` and, if it goes ahead, run the
    /// sub-scopes. Returns whether the phase was taken over by sub-scopes.
    async fn decompose(&mut self, feature: TaskId, root: TaskId, phase: &Task) -> EngineResult<bool> {
        let first = self
            .machine
            .phases(root)?
            .into_iter()
            .find(|p| p.meta_u64("index") == Some(0) && !p.flag("reentry"));
        let output = match first {
            Some(first) => self.machine.phase_output(first.id)?,
            None => Handoff::new(),
        };
        let analysis = ScopeAnalysis::from_handoff(&output);
        let assessment = assess(&analysis, &self.shared.settings.decomposition, self.depth, self.scope.as_deref())?;

        let proposal = match assessment {
            Assessment::Single { score, reason } => {
                info!(feature = %feature, score, reason = %reason, "proceeding single-scope");
                self.record_decomposition(root, json!({"outcome": "single", "score": score, "reason": reason}))?;
                return Ok(false);
            }
            Assessment::Propose(proposal) => proposal,
        };

        if proposal.tier == Tier::Confirmed {
            match self.shared.authority.approve(&proposal).await? {
                Approval::Approved => info!(feature = %feature, "decomposition approved"),
                Approval::Rejected { reason } => {
                    info!(feature = %feature, reason = %reason, "decomposition declined");
                    self.record_decomposition(
                        root,
                        json!({"outcome": "declined", "score": proposal.score, "reason": reason}),
                    )?;
                    return Ok(false);
                }
            }
        }

        let index = phase.meta_u64("index");
        self.record_decomposition(
            root,
            json!({
                "outcome": "decomposed",
                "score": proposal.score,
                "tier": proposal.tier,
                "scopes": proposal.scope_ids(),
                "phase": phase.id.0,
                "phase_index": index,
            }),
        )?;
        self.machine.begin_decomposed(phase.id, proposal.contracts.len())?;
        let executor = self.executor(root)?;
        let scopes = executor.create_scopes(phase.id, &proposal.contracts)?;
        let summary = executor
            .execute(feature, &self.workspace, &scopes, self.depth)
            .await?;
        info!(
            feature = %feature,
            completed = summary.completed.len(),
            clean = summary.is_clean(),
            "decomposed phase executed"
        );
        Ok(true)
    }

    fn record_decomposition(&self, root: TaskId, record: serde_json::Value) -> EngineResult<()> {
        self.shared
            .store
            .update(root, TaskPatch::new().meta(DECOMPOSITION_KEY, record))?;
        Ok(())
    }

    fn executor(&self, root: TaskId) -> EngineResult<ScopeExecutor> {
        let runner = match &self.runner {
            Some(runner) => runner.clone(),
            None => {
                let template = self
                    .shared
                    .store
                    .get(root)?
                    .metadata
                    .get("template")
                    .and_then(|v| serde_json::from_value::<FeatureTemplate>(v.clone()).ok())
                    .unwrap_or_default();
                Arc::new(NestedScopeRunner {
                    shared: self.shared.clone(),
                    template: template.tail(),
                }) as Arc<dyn ScopeRunner>
            }
        };
        Ok(ScopeExecutor::new(
            self.shared.store.clone(),
            self.router.clone(),
            self.shared.bus.clone(),
            self.shared.provider.clone(),
            runner,
        ))
    }

    /// Complete fulfilled scope tasks whose signals have cleared and re-run
    /// scopes that failed or were halted once nothing holds them.
    async fn settle_scopes(&mut self, feature: TaskId, root: TaskId) -> EngineResult<usize> {
        if self.depth >= MAX_DECOMPOSITION_DEPTH {
            return Ok(0);
        }
        let mut open = Vec::new();
        for id in self.shared.store.descendants(root)? {
            let task = self.shared.store.get(id)?;
            if task.kind == TaskKind::Scope && task.status == TaskStatus::InProgress {
                open.push(task);
            }
        }
        if open.is_empty() {
            return Ok(0);
        }

        let executor = self.executor(root)?;
        let mut settled = 0;
        let mut rerun = Vec::new();
        for task in open {
            if self.shared.store.held_by(task.id)?.is_some() {
                continue;
            }
            if is_fulfilled(&task) {
                if executor.complete_if_clear(task.id)? {
                    settled += 1;
                }
            } else {
                rerun.push(task.id);
            }
        }
        if !rerun.is_empty() {
            info!(scopes = rerun.len(), "re-running sub-scopes");
            executor
                .execute(feature, &self.workspace, &rerun, self.depth)
                .await?;
            settled += rerun.len();
        }
        Ok(settled)
    }

    /// Stop every worker, waiting up to `grace` before aborting.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.pool.shutdown(grace).await;
    }
}

/// Runs one sub-scope as a nested engine over the remaining phases.
struct NestedScopeRunner {
    shared: Shared,
    template: FeatureTemplate,
}

#[async_trait]
impl ScopeRunner for NestedScopeRunner {
    async fn run(&self, run: ScopeRun) -> anyhow::Result<ContractFulfillment> {
        let machine = PhaseMachine::new(self.shared.store.clone());
        if machine.phases(run.scope_task)?.is_empty() {
            machine.instantiate(run.scope_task, &self.template, Some(&run.contract.scope_id))?;
        }

        let mut engine = Engine::from_shared(
            self.shared.clone(),
            run.workspace.clone(),
            run.depth,
            Some(run.contract.scope_id.clone()),
        );
        let outcome = engine.run_feature(run.scope_task).await;
        engine.shutdown(NESTED_SHUTDOWN_GRACE).await;
        match outcome? {
            FeatureOutcome::Completed => {}
            other => anyhow::bail!("sub-scope '{}' did not finish: {:?}", run.contract.scope_id, other),
        }

        let mut handoff = Handoff::new();
        for phase in machine.phases(run.scope_task)? {
            handoff.merge(machine.phase_output(phase.id)?);
        }
        Ok(ContractFulfillment::from_handoff(&run.contract, &handoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposition::ApproveAll;
    use crate::phase::PhaseSpec;
    use crate::pool::{ExecutionCapability, WorkerContext};
    use crate::signals::Resolution;
    use crate::workspace::DirectoryProvider;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct Quick;

    #[async_trait]
    impl ExecutionCapability for Quick {
        async fn execute(&self, ctx: WorkerContext) -> anyhow::Result<Handoff> {
            Ok(Handoff::new().decision(format!("{} done", ctx.task.subject)))
        }
    }

    /// Raises HALT(security) on its first run, then behaves.
    struct HaltOnce(AtomicBool);

    #[async_trait]
    impl ExecutionCapability for HaltOnce {
        async fn execute(&self, mut ctx: WorkerContext) -> anyhow::Result<Handoff> {
            if !self.0.swap(true, Ordering::SeqCst) {
                ctx.progress.algedonic(Category::Security, "credentials in diff");
                ctx.stopped().await;
                anyhow::bail!("stopped");
            }
            Ok(Handoff::new().artifact("fix.rs"))
        }
    }

    /// Fails its first attempt.
    struct FailOnce(AtomicUsize);

    #[async_trait]
    impl ExecutionCapability for FailOnce {
        async fn execute(&self, _ctx: WorkerContext) -> anyhow::Result<Handoff> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("missing schema");
            }
            Ok(Handoff::new().decision("schema found"))
        }
    }

    /// Reports a blocker in its output, then finishes anyway.
    struct LateBlocker;

    #[async_trait]
    impl ExecutionCapability for LateBlocker {
        async fn execute(&self, ctx: WorkerContext) -> anyhow::Result<Handoff> {
            ctx.progress.output("<blocker>need API key</blocker>");
            Ok(Handoff::new().decision("shipped without the key"))
        }
    }

    struct Hang;

    #[async_trait]
    impl ExecutionCapability for Hang {
        async fn execute(&self, mut ctx: WorkerContext) -> anyhow::Result<Handoff> {
            ctx.stopped().await;
            anyhow::bail!("stopped")
        }
    }

    /// Prepare reports a two-domain deliverable set; scoped execute work
    /// delivers its contract.
    struct Split;

    #[async_trait]
    impl ExecutionCapability for Split {
        async fn execute(&self, ctx: WorkerContext) -> anyhow::Result<Handoff> {
            let handoff = match (ctx.task.scope_id.as_deref(), ctx.task.subject.as_str()) {
                (None, "prepare") => Handoff::new()
                    .artifact("api/routes.rs")
                    .artifact("api/db.rs")
                    .artifact("web/app.tsx")
                    .artifact("web/view.tsx")
                    .integration_point("web/app.tsx -> api/routes.rs (ApiClient)"),
                (Some("api"), "execute") => Handoff::new()
                    .artifact("api/routes.rs")
                    .artifact("api/db.rs")
                    .integration_point("exports: ApiClient"),
                (Some("web"), "execute") => Handoff::new()
                    .artifact("web/app.tsx")
                    .artifact("web/view.tsx")
                    .integration_point("imports: ApiClient"),
                _ => Handoff::new().decision(format!("{} done", ctx.task.subject)),
            };
            Ok(handoff)
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn engine(capability: Arc<dyn ExecutionCapability>, settings: EngineSettings) -> Engine {
        Engine::new(
            TaskStore::open_in_memory().unwrap(),
            CapabilityRegistry::new().with_default(capability),
            WorkspaceHandle::root("/tmp/phasegraph-test"),
            settings,
        )
    }

    fn single(name: &str) -> FeatureTemplate {
        FeatureTemplate::new(vec![PhaseSpec::new(name, "")])
    }

    fn work_under(engine: &Engine, root: TaskId) -> Vec<Task> {
        engine
            .store()
            .descendants(root)
            .unwrap()
            .into_iter()
            .map(|id| engine.task_get(id).unwrap())
            .filter(|t| matches!(t.kind, TaskKind::Work | TaskKind::Retry))
            .collect()
    }

    #[tokio::test]
    async fn test_feature_runs_to_completion() {
        let mut engine = engine(Arc::new(Quick), settings());
        let handle = engine
            .start_feature("add login", "", &FeatureTemplate::canonical())
            .unwrap();

        let outcome = engine.run_feature(handle.feature).await.unwrap();
        assert_eq!(outcome, FeatureOutcome::Completed);
        for phase in engine.machine().phases(handle.feature).unwrap() {
            assert!(phase.is_completed());
            assert!(engine.machine().phase_output(phase.id).unwrap().decisions[0].ends_with("done"));
        }
        // single-scope: nothing in prepare's output to split
        let record = engine.task_get(handle.feature).unwrap();
        assert_eq!(record.metadata[DECOMPOSITION_KEY]["outcome"], "single");
        // finished workers leave nothing behind
        assert!(engine.pool().workers().is_empty());
        assert!(engine.bus().recipients().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_halt_holds_feature_until_resolved() {
        let mut engine = engine(Arc::new(HaltOnce(AtomicBool::new(false))), settings());
        let handle = engine.start_feature("deploy", "", &single("execute")).unwrap();

        let outcome = engine.run_feature(handle.feature).await.unwrap();
        let FeatureOutcome::AwaitingAuthority { signals } = outcome else {
            panic!("expected to wait on the HALT, got {:?}", outcome);
        };
        assert_eq!(signals.len(), 1);
        let halt = engine.task_get(signals[0]).unwrap();
        assert_eq!(halt.meta_str("severity"), Some("halt"));
        assert!(!engine.task_get(handle.feature).unwrap().is_completed());
        assert!(work_under(&engine, handle.feature).iter().all(|t| !t.is_completed()));

        engine.resolve(halt.id, "credentials rotated").unwrap();
        assert!(!engine.pool().is_halted());
        let outcome = engine.run_feature(handle.feature).await.unwrap();
        assert_eq!(outcome, FeatureOutcome::Completed);

        let work = work_under(&engine, handle.feature);
        assert_eq!(work.len(), 2);
        assert!(work[0].flag("interrupted"));
        assert_eq!(work[1].kind, TaskKind::Retry);
    }

    #[tokio::test]
    async fn test_failed_worker_is_triaged_and_redone() {
        let mut engine = engine(Arc::new(FailOnce(AtomicUsize::new(0))), settings());
        let handle = engine.start_feature("migrate", "", &single("execute")).unwrap();

        let FeatureOutcome::AwaitingAuthority { signals } = engine.run_feature(handle.feature).await.unwrap() else {
            panic!("expected a blocker");
        };
        let blocker = engine.task_get(signals[0]).unwrap();
        assert_eq!(SignalKind::of(&blocker), Some(SignalKind::Blocker));
        assert!(blocker.description.contains("missing schema"));

        let outcome = engine
            .triage(blocker.id, TriageVerdict::resolved(Resolution::NotBlocked))
            .unwrap();
        assert_eq!(outcome.resolution, Some(Resolution::NotBlocked));

        assert_eq!(engine.run_feature(handle.feature).await.unwrap(), FeatureOutcome::Completed);
        let work = work_under(&engine, handle.feature);
        assert!(work[0].flag("superseded"));
        assert!(work[1].is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_escalates_once_then_stop_ends_feature() {
        let settings = EngineSettings {
            pool: PoolConfig::default().with_stall_timeout(Duration::from_secs(10)),
            ..Default::default()
        };
        let mut engine = engine(Arc::new(Hang), settings);
        let handle = engine.start_feature("index", "", &single("execute")).unwrap();

        let FeatureOutcome::AwaitingAuthority { signals } = engine.run_feature(handle.feature).await.unwrap() else {
            panic!("expected an escalation");
        };
        assert_eq!(signals.len(), 1);
        let alert = engine.task_get(signals[0]).unwrap();
        assert_eq!(alert.meta_str("category"), Some("meta-block"));

        // original dispatch plus one retry; no third
        let work = work_under(&engine, handle.feature);
        assert_eq!(work.len(), 2);
        assert!(work.iter().all(|t| t.flag("stalled")));
        let log = engine.store().signal_log(Some(alert.id)).unwrap();
        assert!(log.iter().any(|e| e.event == "lineage"));

        engine.decide_alert(alert.id, AlertDecision::Stop).unwrap();
        assert_eq!(engine.run_feature(handle.feature).await.unwrap(), FeatureOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_stop_on_meta_block_while_blocker_open() {
        let mut engine = engine(Arc::new(FailOnce(AtomicUsize::new(0))), settings());
        let handle = engine.start_feature("billing", "", &single("execute")).unwrap();

        let FeatureOutcome::AwaitingAuthority { signals } = engine.run_feature(handle.feature).await.unwrap() else {
            panic!("expected a blocker");
        };
        let blocker = signals[0];
        let mut alert = None;
        for _ in 0..3 {
            alert = engine
                .triage(blocker, TriageVerdict::unresolved("still stuck"))
                .unwrap()
                .escalated;
        }
        let alert = alert.expect("third unresolved cycle escalates");

        // Only an open ALERT can stop a feature; nothing changes otherwise
        assert!(matches!(
            engine.decide_alert(blocker, AlertDecision::Stop),
            Err(EngineError::WrongKind { .. })
        ));
        assert!(!engine.task_get(handle.feature).unwrap().is_completed());

        let resolved = engine.decide_alert(alert, AlertDecision::Stop).unwrap().unwrap();
        assert_eq!(resolved.signal, alert);

        let feature = engine.task_get(handle.feature).unwrap();
        assert!(feature.is_completed());
        assert!(feature.flag("stopped"));
        let work = work_under(&engine, handle.feature);
        assert!(work.iter().all(|t| t.is_completed() && t.flag("stopped")));
        assert!(engine.task_get(blocker).unwrap().flag("withdrawn"));
        assert_eq!(engine.task_get(alert).unwrap().meta_str("decision"), Some("stop"));
        assert!(engine.open_signals(Some(handle.feature)).unwrap().is_empty());
        assert_eq!(engine.run_feature(handle.feature).await.unwrap(), FeatureOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_blocker_reported_by_finished_worker_holds_phase() {
        let mut engine = engine(Arc::new(LateBlocker), settings());
        let handle = engine.start_feature("payments", "", &single("execute")).unwrap();

        let FeatureOutcome::AwaitingAuthority { signals } = engine.run_feature(handle.feature).await.unwrap() else {
            panic!("expected the late blocker to hold the feature");
        };
        assert_eq!(signals.len(), 1);
        let blocker = engine.task_get(signals[0]).unwrap();
        assert_eq!(SignalKind::of(&blocker), Some(SignalKind::Blocker));
        assert!(blocker.description.contains("need API key"));

        let work = work_under(&engine, handle.feature);
        assert_eq!(work.len(), 1);
        assert!(work[0].is_completed());
        assert_eq!(blocker.meta_u64("origin"), Some(work[0].id.0 as u64));
        let phase = engine.task_get(handle.phases[0]).unwrap();
        assert!(phase.blocked_by.contains(&blocker.id));
        assert!(!phase.is_completed());

        engine
            .triage(blocker.id, TriageVerdict::resolved(Resolution::NotBlocked))
            .unwrap();
        assert_eq!(engine.run_feature(handle.feature).await.unwrap(), FeatureOutcome::Completed);
        assert!(engine.open_signals(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decomposed_feature_runs_sub_scopes() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::new(
            TaskStore::open_in_memory().unwrap(),
            CapabilityRegistry::new().with_default(Arc::new(Split)),
            WorkspaceHandle::root(dir.path()),
            settings(),
        )
        .with_provider(Arc::new(DirectoryProvider::new(dir.path())))
        .with_authority(Arc::new(ApproveAll));
        let handle = engine
            .start_feature("dashboard", "", &FeatureTemplate::canonical())
            .unwrap();

        let outcome = engine.run_feature(handle.feature).await.unwrap();
        assert_eq!(outcome, FeatureOutcome::Completed);

        let feature = engine.task_get(handle.feature).unwrap();
        assert_eq!(feature.metadata[DECOMPOSITION_KEY]["outcome"], "decomposed");

        let phases = engine.machine().phases(handle.feature).unwrap();
        assert!(phases[1].flag("decomposed"));
        assert_eq!(phases[2].meta_str("skip_reason"), Some(SUB_SCOPE_SKIP));
        assert_eq!(phases[3].meta_str("skip_reason"), Some(SUB_SCOPE_SKIP));

        let scopes = engine
            .task_list(&TaskFilter::all().kind(TaskKind::Scope))
            .unwrap();
        assert_eq!(scopes.len(), 2);
        assert!(scopes.iter().all(|s| s.is_completed() && is_fulfilled(s)));
        // each scope ran the remaining three phases
        for scope in &scopes {
            assert_eq!(engine.machine().phases(scope.id).unwrap().len(), 3);
        }
        assert!(engine.open_signals(Some(handle.feature)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_declined_decomposition_runs_single_scope() {
        let dir = tempdir().unwrap();
        let mut engine = Engine::new(
            TaskStore::open_in_memory().unwrap(),
            CapabilityRegistry::new().with_default(Arc::new(Split)),
            WorkspaceHandle::root(dir.path()),
            settings(),
        )
        .with_provider(Arc::new(DirectoryProvider::new(dir.path())));
        let handle = engine
            .start_feature("dashboard", "", &FeatureTemplate::canonical())
            .unwrap();

        assert_eq!(engine.run_feature(handle.feature).await.unwrap(), FeatureOutcome::Completed);
        let feature = engine.task_get(handle.feature).unwrap();
        assert_eq!(feature.metadata[DECOMPOSITION_KEY]["outcome"], "declined");
        assert!(
            engine
                .task_list(&TaskFilter::all().kind(TaskKind::Scope))
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_recover_replaces_orphaned_work() {
        let mut engine = engine(Arc::new(Quick), settings());
        let handle = engine.start_feature("resume", "", &single("execute")).unwrap();
        engine.machine().enter(handle.phases[0], &AlwaysRun).await.unwrap();
        let work = work_under(&engine, handle.feature);
        // claimed by a worker of a process that no longer exists
        assert!(engine.store().claim(work[0].id, "gone").unwrap());

        let replaced = engine.recover(handle.feature).unwrap();
        assert_eq!(replaced.len(), 1);
        assert!(engine.task_get(work[0].id).unwrap().flag("interrupted"));
        assert_eq!(engine.run_feature(handle.feature).await.unwrap(), FeatureOutcome::Completed);
    }

    #[test]
    fn test_task_api_round_trip() {
        let engine = engine(Arc::new(Quick), settings());
        let a = engine.task_create(NewTask::work("a", "")).unwrap();
        let b = engine
            .task_create(NewTask::work("b", "").with_blocked_by([a]))
            .unwrap();
        assert_eq!(engine.ready_set(None).unwrap().ids, vec![a]);

        engine
            .task_update(a, TaskPatch::new().status(TaskStatus::Completed))
            .unwrap();
        assert_eq!(engine.ready_set(None).unwrap().ids, vec![b]);
        assert!(matches!(
            engine.task_update(b, TaskPatch::new().add_blocked_by(b)),
            Err(EngineError::Cycle { .. })
        ));
        assert_eq!(engine.task_list(&TaskFilter::all()).unwrap().len(), 2);
    }
}
