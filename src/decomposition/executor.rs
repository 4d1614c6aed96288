//! Decomposition assessment and sub-scope execution.
//!
//! `assess` turns the first phase's output into either a single-scope
//! verdict or a proposal. Once a proposal is accepted, `ScopeExecutor`
//! creates one scope task per contract, runs every scope concurrently in
//! its own workspace and checks the results against each other.
//!
//! Failure handling:
//! - a failed scope is reported as a blocker on its scope task; siblings
//!   keep running
//! - a HALT broadcast stops every scope at once; their workspaces are kept
//!   for review

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::decomposition::compat::{CompatibilityIssue, check_compatibility};
use crate::decomposition::config::{DecompositionConfig, MAX_DECOMPOSITION_DEPTH};
use crate::decomposition::contract::{ContractFulfillment, ScopeContract, generate_contracts};
use crate::decomposition::detector::{DecompositionSignal, Tier, detect, meets_threshold, score, tier};
use crate::decomposition::parser::ScopeAnalysis;
use crate::errors::{EngineError, EngineResult};
use crate::messaging::MessageBus;
use crate::signals::{Severity, SignalKind, SignalRouter};
use crate::store::{NewTask, Task, TaskId, TaskKind, TaskPatch, TaskStatus, TaskStore};
use crate::workspace::{MergeOutcome, WorkspaceHandle, WorkspaceProvider};

/// Owner recorded on scope tasks; they are never dispatched to workers.
pub const SCOPE_OWNER: &str = "decomposition";

const CONTRACT_KEY: &str = "contract";
const FULFILLMENT_KEY: &str = "fulfillment";
const WORKSPACE_KEY: &str = "workspace";

/// A decomposition awaiting (or not needing) approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionProposal {
    pub score: u32,
    pub signals: Vec<DecompositionSignal>,
    pub tier: Tier,
    pub contracts: Vec<ScopeContract>,
    /// Concrete options the authority can choose instead
    pub alternatives: Vec<String>,
    pub recommendation: String,
}

impl DecompositionProposal {
    pub fn scope_ids(&self) -> Vec<&str> {
        self.contracts.iter().map(|c| c.scope_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Assessment {
    Single { score: u32, reason: String },
    Propose(DecompositionProposal),
}

/// Score the first phase's output and, at or above threshold, draft
/// contracts. Fails at depth 1 or deeper.
pub fn assess(
    analysis: &ScopeAnalysis,
    config: &DecompositionConfig,
    depth: u32,
    parent_scope: Option<&str>,
) -> EngineResult<Assessment> {
    if depth >= MAX_DECOMPOSITION_DEPTH {
        return Err(EngineError::DecompositionDepth { depth });
    }
    if !config.enabled {
        return Ok(Assessment::Single {
            score: 0,
            reason: "decomposition disabled".to_string(),
        });
    }

    let fired: BTreeSet<DecompositionSignal> = detect(analysis, config);
    let total = score(&fired);
    debug!(score = total, signals = ?fired, "decomposition scored");
    if !meets_threshold(total) {
        return Ok(Assessment::Single {
            score: total,
            reason: format!("score {} below threshold", total),
        });
    }

    let contracts = generate_contracts(analysis, parent_scope);
    if contracts.len() <= 1 {
        return Ok(Assessment::Single {
            score: total,
            reason: "only one sub-scope".to_string(),
        });
    }

    let tier = tier(&fired, config.autonomous);
    let names: Vec<&str> = contracts.iter().map(|c| c.scope_id.as_str()).collect();
    let alternatives = vec![
        "proceed single-scope with the full deliverable set".to_string(),
        format!(
            "sequence the scopes ({}) inside one scope, ordered by interface dependencies",
            names.join(", ")
        ),
    ];
    let recommendation = format!(
        "decompose into {} sub-scopes ({}), score {}",
        contracts.len(),
        names.join(", "),
        total
    );
    info!(score = total, scopes = contracts.len(), tier = ?tier, "decomposition proposed");
    Ok(Assessment::Propose(DecompositionProposal {
        score: total,
        signals: fired.into_iter().collect(),
        tier,
        contracts,
        alternatives,
        recommendation,
    }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Approval {
    Approved,
    Rejected { reason: String },
}

/// The external party that confirms decomposition proposals.
#[async_trait]
pub trait DecompositionAuthority: Send + Sync {
    async fn approve(&self, proposal: &DecompositionProposal) -> anyhow::Result<Approval>;
}

pub struct ApproveAll;

#[async_trait]
impl DecompositionAuthority for ApproveAll {
    async fn approve(&self, _proposal: &DecompositionProposal) -> anyhow::Result<Approval> {
        Ok(Approval::Approved)
    }
}

/// Declines every confirmed-tier proposal. Used when nobody is available
/// to approve one.
pub struct DeclineAll;

#[async_trait]
impl DecompositionAuthority for DeclineAll {
    async fn approve(&self, _proposal: &DecompositionProposal) -> anyhow::Result<Approval> {
        Ok(Approval::Rejected {
            reason: "no decomposition authority configured".to_string(),
        })
    }
}

/// One sub-scope to execute.
#[derive(Debug, Clone)]
pub struct ScopeRun {
    pub feature: TaskId,
    pub scope_task: TaskId,
    pub contract: ScopeContract,
    pub workspace: WorkspaceHandle,
    /// Depth of the nested run; always 1
    pub depth: u32,
}

/// Executes one sub-scope to completion and reports what it delivered.
#[async_trait]
pub trait ScopeRunner: Send + Sync {
    async fn run(&self, run: ScopeRun) -> anyhow::Result<ContractFulfillment>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Stopped by HALT; workspaces preserved
    pub halted: Vec<String>,
    pub issues: Vec<CompatibilityIssue>,
    /// Blocker signals opened while executing
    pub blockers: Vec<TaskId>,
    pub fulfillments: Vec<ContractFulfillment>,
}

impl ExecutionSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.halted.is_empty() && self.issues.is_empty()
    }
}

struct ActiveScope {
    scope_id: String,
    scope_task: TaskId,
    workspace: WorkspaceHandle,
    handle: JoinHandle<()>,
}

pub struct ScopeExecutor {
    store: TaskStore,
    router: SignalRouter,
    bus: MessageBus,
    provider: Arc<dyn WorkspaceProvider>,
    runner: Arc<dyn ScopeRunner>,
}

impl ScopeExecutor {
    pub fn new(
        store: TaskStore,
        router: SignalRouter,
        bus: MessageBus,
        provider: Arc<dyn WorkspaceProvider>,
        runner: Arc<dyn ScopeRunner>,
    ) -> Self {
        Self {
            store,
            router,
            bus,
            provider,
            runner,
        }
    }

    /// One scope task per contract under the phase the scopes replace.
    /// Scope tasks are claimed immediately so the pool never picks them up.
    pub fn create_scopes(&self, phase: TaskId, contracts: &[ScopeContract]) -> EngineResult<Vec<TaskId>> {
        let mut created = Vec::with_capacity(contracts.len());
        for contract in contracts {
            let id = self.store.create(
                NewTask::new(TaskKind::Scope, format!("scope: {}", contract.scope_id), contract.describe())
                    .with_parent(phase)
                    .with_scope(contract.scope_id.clone())
                    .with_file_scope(contract.deliverables.clone())
                    .with_meta(CONTRACT_KEY, serde_json::to_value(contract)?),
            )?;
            self.store.claim(id, SCOPE_OWNER)?;
            created.push(id);
        }
        info!(phase = %phase, scopes = created.len(), "scope tasks created");
        Ok(created)
    }

    /// Run `scopes` concurrently and verify the results.
    pub async fn execute(
        &self,
        feature: TaskId,
        parent: &WorkspaceHandle,
        scopes: &[TaskId],
        depth: u32,
    ) -> EngineResult<ExecutionSummary> {
        if depth >= MAX_DECOMPOSITION_DEPTH {
            return Err(EngineError::DecompositionDepth { depth });
        }
        // Subscribe before anything runs so no HALT is missed.
        let mut halts = self.bus.observe();
        let (result_tx, mut result_rx) =
            mpsc::unbounded_channel::<(String, anyhow::Result<ContractFulfillment>)>();

        let mut summary = ExecutionSummary::default();
        let mut active: HashMap<String, ActiveScope> = HashMap::new();
        let mut tasks: HashMap<String, TaskId> = HashMap::new();

        for &scope_task in scopes {
            let task = self.store.get(scope_task)?;
            let contract = contract_of(&task)?;
            let workspace = self.workspace_for(&task, parent).await?;
            let scope_id = contract.scope_id.clone();

            let run = ScopeRun {
                feature,
                scope_task,
                contract,
                workspace: workspace.clone(),
                depth: depth + 1,
            };
            let runner = self.runner.clone();
            let tx = result_tx.clone();
            let handle = tokio::spawn(async move {
                let scope_id = run.contract.scope_id.clone();
                let result = runner.run(run).await;
                let _ = tx.send((scope_id, result));
            });
            info!(scope = %scope_id, task = %scope_task, path = %workspace.path.display(), "sub-scope started");
            tasks.insert(scope_id.clone(), scope_task);
            active.insert(
                scope_id.clone(),
                ActiveScope {
                    scope_id,
                    scope_task,
                    workspace,
                    handle,
                },
            );
        }
        drop(result_tx);

        let mut watching = true;
        while !active.is_empty() {
            tokio::select! {
                received = result_rx.recv() => {
                    let Some((scope_id, result)) = received else {
                        break;
                    };
                    let Some(mut scope) = active.remove(&scope_id) else {
                        continue;
                    };
                    (&mut scope.handle).await.ok();
                    self.settle(feature, parent, &scope, result, &mut summary).await?;
                }
                message = halts.recv(), if watching => match message {
                    Ok(m) if m.is_stop() && m.recipient.is_none() => {
                        error!(scopes = active.len(), reason = %m.content, "HALT received; stopping every sub-scope");
                        for (scope_id, scope) in active.drain() {
                            scope.handle.abort();
                            self.mark_halted(scope.scope_task, &scope.workspace)?;
                            summary.halted.push(scope_id);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "sub-scope executor lagged behind message bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => watching = false,
                },
            }
        }
        // A runner that panicked never reports back.
        for (scope_id, scope) in active.drain() {
            let blocker = self
                .router
                .report_blocker(scope.scope_task, "sub-scope runner exited without a result")?;
            summary.blockers.push(blocker);
            summary.failed.push(scope_id);
        }

        if summary.halted.is_empty() {
            self.verify(&tasks, &mut summary)?;
        }
        summary.completed.sort();
        summary.failed.sort();
        summary.halted.sort();
        info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            halted = summary.halted.len(),
            issues = summary.issues.len(),
            "sub-scope execution finished"
        );
        Ok(summary)
    }

    async fn workspace_for(&self, task: &Task, parent: &WorkspaceHandle) -> EngineResult<WorkspaceHandle> {
        if let Some(value) = task.metadata.get(WORKSPACE_KEY).filter(|v| !v.is_null()) {
            let workspace: WorkspaceHandle = serde_json::from_value(value.clone())?;
            debug!(task = %task.id, path = %workspace.path.display(), "reusing preserved workspace");
            return Ok(workspace);
        }
        let scope_id = task.scope_id.clone().unwrap_or_else(|| task.id.to_string());
        let workspace = self.provider.create(parent, &scope_id).await?;
        self.store.update(
            task.id,
            TaskPatch::new().meta(WORKSPACE_KEY, serde_json::to_value(&workspace)?),
        )?;
        Ok(workspace)
    }

    async fn settle(
        &self,
        feature: TaskId,
        parent: &WorkspaceHandle,
        scope: &ActiveScope,
        result: anyhow::Result<ContractFulfillment>,
        summary: &mut ExecutionSummary,
    ) -> EngineResult<()> {
        let (scope_id, scope_task, workspace) = (scope.scope_id.as_str(), scope.scope_task, &scope.workspace);
        match result {
            Ok(fulfillment) => {
                self.store.update(
                    scope_task,
                    TaskPatch::new().meta(FULFILLMENT_KEY, serde_json::to_value(&fulfillment)?),
                )?;
                match self.provider.merge(workspace, parent).await {
                    Ok(MergeOutcome::Conflict) => {
                        let blocker = self.router.report_blocker(
                            scope_task,
                            &format!("merging scope '{}' conflicts with the parent workspace", scope_id),
                        )?;
                        summary.blockers.push(blocker);
                    }
                    Ok(outcome) => {
                        debug!(scope = scope_id, outcome = ?outcome, "sub-scope merged");
                        if let Err(e) = self.provider.destroy(workspace).await {
                            warn!(scope = scope_id, error = %format!("{:#}", e), "failed to remove scope workspace");
                        }
                        self.store
                            .update(scope_task, TaskPatch::new().meta(WORKSPACE_KEY, serde_json::Value::Null))?;
                    }
                    Err(e) => {
                        let blocker = self
                            .router
                            .report_blocker(scope_task, &format!("merging scope '{}' failed: {:#}", scope_id, e))?;
                        summary.blockers.push(blocker);
                    }
                }
                info!(scope = scope_id, delivered = fulfillment.delivered.len(), "sub-scope finished");
                summary.completed.push(scope_id.to_string());
                summary.fulfillments.push(fulfillment);
            }
            Err(e) => {
                if self.halt_open(feature)? {
                    self.mark_halted(scope_task, workspace)?;
                    summary.halted.push(scope_id.to_string());
                    return Ok(());
                }
                warn!(scope = scope_id, error = %format!("{:#}", e), "sub-scope failed");
                if self.store.held_by(scope_task)?.is_none() {
                    let blocker = self
                        .router
                        .report_blocker(scope_task, &format!("sub-scope '{}' failed: {:#}", scope_id, e))?;
                    summary.blockers.push(blocker);
                }
                summary.failed.push(scope_id.to_string());
            }
        }
        Ok(())
    }

    fn halt_open(&self, feature: TaskId) -> EngineResult<bool> {
        Ok(self
            .router
            .open_signals(Some(feature))?
            .iter()
            .any(|s| SignalKind::of(s).and_then(SignalKind::severity) == Some(Severity::Halt)))
    }

    fn mark_halted(&self, scope_task: TaskId, workspace: &WorkspaceHandle) -> EngineResult<()> {
        self.store.update(
            scope_task,
            TaskPatch::new()
                .meta("halted", true)
                .meta(WORKSPACE_KEY, serde_json::to_value(workspace)?),
        )?;
        info!(task = %scope_task, path = %workspace.path.display(), "sub-scope halted; workspace preserved");
        Ok(())
    }

    /// Compatibility across every fulfilled scope; each issue is triaged as a
    /// blocker on the scope it concerns. Clean scopes are completed.
    fn verify(&self, tasks: &HashMap<String, TaskId>, summary: &mut ExecutionSummary) -> EngineResult<()> {
        let report = check_compatibility(&summary.fulfillments);
        for issue in &report.issues {
            let Some(&task) = tasks.get(issue.scope_id()) else {
                continue;
            };
            warn!(scope = issue.scope_id(), issue = %issue.describe(), "compatibility issue");
            summary.blockers.push(self.router.report_blocker(task, &issue.describe())?);
        }
        summary.issues = report.issues;

        for scope_id in &summary.completed {
            if let Some(&task) = tasks.get(scope_id) {
                self.complete_if_clear(task)?;
            }
        }
        Ok(())
    }

    /// Complete a fulfilled scope task unless a signal still holds it.
    pub fn complete_if_clear(&self, scope_task: TaskId) -> EngineResult<bool> {
        let task = self.store.get(scope_task)?;
        if task.is_completed() || !task.metadata.contains_key(FULFILLMENT_KEY) {
            return Ok(false);
        }
        match self
            .store
            .update(scope_task, TaskPatch::new().status(TaskStatus::Completed))
        {
            Ok(_) => {
                info!(task = %scope_task, "scope task completed");
                Ok(true)
            }
            Err(EngineError::Blocked { by, .. }) => {
                debug!(task = %scope_task, held_by = %by, "scope completion waits on signal");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// The contract stored on a scope task.
pub fn contract_of(task: &Task) -> EngineResult<ScopeContract> {
    let value = task.metadata.get(CONTRACT_KEY).ok_or(EngineError::WrongKind {
        id: task.id,
        expected: "scope task with a contract",
    })?;
    Ok(serde_json::from_value(value.clone())?)
}

/// Whether a scope task already reported a fulfillment.
pub fn is_fulfilled(task: &Task) -> bool {
    task.metadata
        .get(FULFILLMENT_KEY)
        .is_some_and(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{FeatureTemplate, PhaseMachine};
    use crate::pool::Handoff;
    use crate::signals::Category;
    use crate::workspace::DirectoryProvider;
    use std::time::Duration;
    use tempfile::tempdir;

    fn two_domain_analysis() -> ScopeAnalysis {
        ScopeAnalysis::from_handoff(
            &Handoff::new()
                .artifact("src/api/routes.rs")
                .artifact("src/api/tests/routes.rs")
                .artifact("src/web/app.tsx")
                .artifact("src/web/app.test.tsx")
                .integration_point("src/web/app.tsx -> src/api/routes.rs (ApiClient)"),
        )
    }

    #[test]
    fn test_assess_proposes_two_scopes() {
        let assessment = assess(&two_domain_analysis(), &DecompositionConfig::default(), 0, None).unwrap();
        let Assessment::Propose(proposal) = assessment else {
            panic!("expected a proposal");
        };
        assert_eq!(proposal.scope_ids(), vec!["api", "web"]);
        assert_eq!(proposal.tier, Tier::Confirmed);
        assert_eq!(proposal.alternatives.len(), 2);
        assert!(proposal.recommendation.contains("2 sub-scopes"));
    }

    #[test]
    fn test_single_scope_fallback_above_threshold() {
        // Large set in one domain: strong signal plus supporting, one scope
        let mut handoff = Handoff::new();
        for i in 0..8 {
            handoff = handoff.artifact(format!("src/api/file{}.rs", i));
        }
        handoff = handoff.decision("decomposition: separable-workstreams");
        let analysis = ScopeAnalysis::from_handoff(&handoff);
        let fired = detect(&analysis, &DecompositionConfig::default());
        assert!(meets_threshold(score(&fired)));

        let assessment = assess(&analysis, &DecompositionConfig::default(), 0, None).unwrap();
        assert_eq!(
            assessment,
            Assessment::Single {
                score: score(&fired),
                reason: "only one sub-scope".into()
            }
        );
    }

    #[test]
    fn test_nested_decomposition_rejected() {
        let err = assess(&two_domain_analysis(), &DecompositionConfig::default(), 1, Some("api")).unwrap_err();
        assert!(matches!(err, EngineError::DecompositionDepth { depth: 1 }));
    }

    #[test]
    fn test_disabled_config_stays_single() {
        let assessment = assess(&two_domain_analysis(), &DecompositionConfig::disabled(), 0, None).unwrap();
        assert!(matches!(assessment, Assessment::Single { .. }));
    }

    /// Delivers every contracted file, except for scopes named in `fail`.
    struct FakeRunner {
        fail: Vec<&'static str>,
    }

    #[async_trait]
    impl ScopeRunner for FakeRunner {
        async fn run(&self, run: ScopeRun) -> anyhow::Result<ContractFulfillment> {
            if self.fail.contains(&run.contract.scope_id.as_str()) {
                anyhow::bail!("tests failed in {}", run.contract.scope_id);
            }
            let mut handoff = Handoff::new();
            for d in &run.contract.deliverables {
                handoff = handoff.artifact(d.clone());
            }
            Ok(ContractFulfillment::from_handoff(&run.contract, &handoff))
        }
    }

    /// Hangs until aborted, after raising a HALT from the `api` scope.
    struct HaltingRunner {
        router: SignalRouter,
    }

    #[async_trait]
    impl ScopeRunner for HaltingRunner {
        async fn run(&self, run: ScopeRun) -> anyhow::Result<ContractFulfillment> {
            if run.contract.scope_id == "api" {
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.router
                    .raise_algedonic(run.feature, Category::Security, "secret committed", Some(run.scope_task))?;
            }
            std::future::pending::<anyhow::Result<ContractFulfillment>>().await
        }
    }

    struct Fixture {
        store: TaskStore,
        router: SignalRouter,
        bus: MessageBus,
        feature: TaskId,
        phase: TaskId,
        contracts: Vec<ScopeContract>,
    }

    fn fixture() -> Fixture {
        let store = TaskStore::open_in_memory().unwrap();
        let bus = MessageBus::new();
        let router = SignalRouter::new(store.clone(), bus.clone());
        let machine = PhaseMachine::new(store.clone());
        let handle = machine
            .start_feature("F", "two domains", &FeatureTemplate::canonical())
            .unwrap();
        machine.skip(handle.phases[0], "test").unwrap();
        machine.begin_decomposed(handle.phases[1], 2).unwrap();
        let contracts = generate_contracts(&two_domain_analysis(), None);
        Fixture {
            store,
            router,
            bus,
            feature: handle.feature,
            phase: handle.phases[1],
            contracts,
        }
    }

    #[tokio::test]
    async fn test_failing_scope_does_not_stop_siblings() {
        let fx = fixture();
        let dir = tempdir().unwrap();
        let executor = ScopeExecutor::new(
            fx.store.clone(),
            fx.router.clone(),
            fx.bus.clone(),
            Arc::new(DirectoryProvider::new(dir.path())),
            Arc::new(FakeRunner { fail: vec!["web"] }),
        );
        let scopes = executor.create_scopes(fx.phase, &fx.contracts).unwrap();
        for &s in &scopes {
            assert_eq!(fx.store.get(s).unwrap().status, TaskStatus::InProgress);
        }

        let summary = executor
            .execute(fx.feature, &WorkspaceHandle::root(dir.path()), &scopes, 0)
            .await
            .unwrap();

        assert_eq!(summary.completed, vec!["api".to_string()]);
        assert_eq!(summary.failed, vec!["web".to_string()]);
        // api imports nothing, so its completion is clean
        assert!(fx.store.get(scopes[0]).unwrap().is_completed());
        let web = fx.store.get(scopes[1]).unwrap();
        assert!(!web.is_completed());
        assert!(fx.store.held_by(web.id).unwrap().is_some());
        assert_eq!(summary.blockers.len(), 1);
    }

    #[tokio::test]
    async fn test_unsatisfied_import_routes_to_triage() {
        let fx = fixture();
        let dir = tempdir().unwrap();
        let executor = ScopeExecutor::new(
            fx.store.clone(),
            fx.router.clone(),
            fx.bus.clone(),
            Arc::new(DirectoryProvider::new(dir.path())),
            Arc::new(FakeRunner { fail: vec![] }),
        );
        // api no longer exports what web imports
        let mut contracts = fx.contracts.clone();
        contracts[0].exports.clear();
        let scopes = executor.create_scopes(fx.phase, &contracts).unwrap();

        let summary = executor
            .execute(fx.feature, &WorkspaceHandle::root(dir.path()), &scopes, 0)
            .await
            .unwrap();
        assert_eq!(summary.issues.len(), 1);
        assert_eq!(summary.issues[0].scope_id(), "web");
        assert!(fx.store.get(scopes[0]).unwrap().is_completed());
        assert!(!fx.store.get(scopes[1]).unwrap().is_completed());
        assert!(is_fulfilled(&fx.store.get(scopes[1]).unwrap()));

        // Resolving the blocker lets the scope complete
        fx.router.resolve(summary.blockers[0], "stub added").unwrap();
        assert!(executor.complete_if_clear(scopes[1]).unwrap());
    }

    #[tokio::test]
    async fn test_halt_stops_all_scopes_and_preserves_workspaces() {
        let fx = fixture();
        let dir = tempdir().unwrap();
        let executor = ScopeExecutor::new(
            fx.store.clone(),
            fx.router.clone(),
            fx.bus.clone(),
            Arc::new(DirectoryProvider::new(dir.path())),
            Arc::new(HaltingRunner {
                router: fx.router.clone(),
            }),
        );
        let scopes = executor.create_scopes(fx.phase, &fx.contracts).unwrap();

        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(fx.feature, &WorkspaceHandle::root(dir.path()), &scopes, 0),
        )
        .await
        .expect("executor should stop on HALT")
        .unwrap();

        assert_eq!(summary.halted, vec!["api".to_string(), "web".to_string()]);
        assert!(summary.completed.is_empty());
        for &s in &scopes {
            let task = fx.store.get(s).unwrap();
            assert!(task.flag("halted"));
            let ws: WorkspaceHandle = serde_json::from_value(task.metadata["workspace"].clone()).unwrap();
            assert!(ws.path.exists());
        }
    }

    #[tokio::test]
    async fn test_execute_rejects_nested_depth() {
        let fx = fixture();
        let dir = tempdir().unwrap();
        let executor = ScopeExecutor::new(
            fx.store.clone(),
            fx.router.clone(),
            fx.bus.clone(),
            Arc::new(DirectoryProvider::new(dir.path())),
            Arc::new(FakeRunner { fail: vec![] }),
        );
        let err = executor
            .execute(fx.feature, &WorkspaceHandle::root(dir.path()), &[], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DecompositionDepth { depth: 1 }));
    }
}
