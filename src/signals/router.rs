//! Signal Router.
//!
//! Two tiers. Blockers are operational: they block the reporting task and
//! go through triage, with a fixed escalation threshold. Algedonic signals
//! bypass triage: HALT blocks the whole feature and is broadcast to every
//! worker, ALERT blocks the current phase. Every signal is a task of kind
//! `signal`; resolving one means completing it, which unblocks exactly the
//! tasks that listed it in `blocked_by`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::messaging::MessageBus;
use crate::signals::triage::{
    AlertDecision, HaltOverride, TRIAGE_COUNTER_KEY, TRIAGE_ESCALATION_THRESHOLD, TriageOutcome,
    TriageVerdict,
};
use crate::signals::types::{Category, Severity, SignalKind};
use crate::store::{NewTask, Task, TaskFilter, TaskId, TaskKind, TaskPatch, TaskStatus, TaskStore};

/// A signal that has just been resolved and the tasks it was holding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSignal {
    pub signal: TaskId,
    pub kind: SignalKind,
    pub unblocked: Vec<TaskId>,
}

impl ResolvedSignal {
    pub fn is_halt(&self) -> bool {
        self.kind.severity() == Some(Severity::Halt)
    }
}

#[derive(Clone)]
pub struct SignalRouter {
    store: TaskStore,
    bus: MessageBus,
}

impl SignalRouter {
    pub fn new(store: TaskStore, bus: MessageBus) -> Self {
        Self { store, bus }
    }

    fn require_feature(&self, feature: TaskId) -> EngineResult<Task> {
        let task = self.store.get(feature)?;
        if task.kind != TaskKind::Feature {
            return Err(EngineError::WrongKind {
                id: feature,
                expected: "feature",
            });
        }
        Ok(task)
    }

    fn load_signal(&self, signal: TaskId) -> EngineResult<(Task, SignalKind)> {
        let task = self.store.get(signal)?;
        let kind = SignalKind::of(&task).ok_or(EngineError::WrongKind {
            id: signal,
            expected: "signal",
        })?;
        if task.is_completed() {
            return Err(EngineError::Closed { id: signal });
        }
        Ok((task, kind))
    }

    fn create_signal(
        &self,
        subject: String,
        description: &str,
        kind: SignalKind,
        feature: TaskId,
        origin: Option<TaskId>,
        targets: &[TaskId],
    ) -> EngineResult<TaskId> {
        let mut new = NewTask::new(TaskKind::Signal, subject, description)
            .with_meta("feature", feature.0)
            .with_meta("targets", targets.iter().map(|t| t.0).collect::<Vec<_>>());
        new = match kind {
            SignalKind::Blocker => new.with_meta("signal", "blocker"),
            SignalKind::Algedonic(category) => new
                .with_meta("signal", "algedonic")
                .with_meta("severity", category.severity().as_str())
                .with_meta("category", category.as_str()),
        };
        if let Some(origin) = origin {
            new = new.with_meta("origin", origin.0);
        }
        let signal = self.store.create_holding(new, targets)?;
        self.store.log_signal_event(
            signal,
            "raised",
            json!({
                "feature": feature.0,
                "origin": origin.map(|o| o.0),
                "targets": targets.iter().map(|t| t.0).collect::<Vec<_>>(),
                "description": description,
            }),
        )?;
        Ok(signal)
    }

    /// A worker cannot proceed: block its task and open a triage object.
    pub fn report_blocker(&self, task: TaskId, description: &str) -> EngineResult<TaskId> {
        self.report_blocker_on(task, task, description)
    }

    /// Open a blocker reported by `origin` that holds `target` instead,
    /// e.g. the phase of a task that completed before its blocker arrived.
    pub fn report_blocker_on(&self, target: TaskId, origin: TaskId, description: &str) -> EngineResult<TaskId> {
        let feature = self
            .store
            .enclosing(target, TaskKind::Feature)?
            .ok_or(EngineError::WrongKind {
                id: target,
                expected: "task under a feature",
            })?;
        let signal = self.create_signal(
            format!("BLOCKER: {}", truncate(description)),
            description,
            SignalKind::Blocker,
            feature,
            Some(origin),
            &[target],
        )?;
        info!(signal = %signal, task = %origin, target = %target, feature = %feature, "blocker reported");
        Ok(signal)
    }

    /// Run one triage cycle on an open blocker.
    pub fn triage(&self, blocker: TaskId, verdict: TriageVerdict) -> EngineResult<TriageOutcome> {
        let (signal, kind) = self.load_signal(blocker)?;
        if kind != SignalKind::Blocker {
            return Err(EngineError::WrongKind {
                id: blocker,
                expected: "blocker",
            });
        }
        let feature = meta_task_id(&signal, "feature").ok_or(EngineError::WrongKind {
            id: blocker,
            expected: "blocker with a feature",
        })?;

        match verdict {
            TriageVerdict::Resolved { resolution, note } => {
                self.store.update(
                    blocker,
                    TaskPatch::new()
                        .status(TaskStatus::Completed)
                        .meta("resolution", resolution.as_str())
                        .meta("note", note.as_str()),
                )?;
                self.set_counter(feature, 0)?;
                self.store.log_signal_event(
                    blocker,
                    "triaged",
                    json!({"verdict": "resolved", "resolution": resolution.as_str(), "note": note}),
                )?;
                info!(signal = %blocker, resolution = resolution.as_str(), "blocker resolved");
                Ok(TriageOutcome {
                    resolution: Some(resolution),
                    unresolved_cycles: 0,
                    escalated: None,
                })
            }
            TriageVerdict::Unresolved { note } => {
                let cycles = self.unresolved_cycles(feature)? + 1;
                self.store.log_signal_event(
                    blocker,
                    "triaged",
                    json!({"verdict": "unresolved", "cycle": cycles, "note": note}),
                )?;
                info!(signal = %blocker, cycles, "triage cycle unresolved");

                if cycles < TRIAGE_ESCALATION_THRESHOLD {
                    self.set_counter(feature, cycles)?;
                    return Ok(TriageOutcome {
                        resolution: None,
                        unresolved_cycles: cycles,
                        escalated: None,
                    });
                }

                let description = format!(
                    "{} consecutive unresolved triage cycles; last blocker: {}",
                    cycles, signal.description
                );
                let alert = self.raise_algedonic(
                    feature,
                    Category::MetaBlock,
                    &description,
                    meta_task_id(&signal, "origin"),
                )?;
                self.set_counter(feature, 0)?;
                self.store.log_signal_event(
                    blocker,
                    "escalated",
                    json!({"alert": alert.0, "cycles": cycles}),
                )?;
                Ok(TriageOutcome {
                    resolution: None,
                    unresolved_cycles: cycles,
                    escalated: Some(alert),
                })
            }
        }
    }

    pub fn unresolved_cycles(&self, feature: TaskId) -> EngineResult<u32> {
        let task = self.require_feature(feature)?;
        Ok(task.meta_u64(TRIAGE_COUNTER_KEY).unwrap_or(0) as u32)
    }

    fn set_counter(&self, feature: TaskId, value: u32) -> EngineResult<()> {
        match self
            .store
            .update(feature, TaskPatch::new().meta(TRIAGE_COUNTER_KEY, value))
        {
            Ok(_) | Err(EngineError::Closed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Raise a HALT or ALERT. Never deduplicated or suppressed: every call
    /// creates a new signal.
    pub fn raise_algedonic(
        &self,
        feature: TaskId,
        category: Category,
        description: &str,
        origin: Option<TaskId>,
    ) -> EngineResult<TaskId> {
        self.require_feature(feature)?;
        let targets = match category.severity() {
            Severity::Halt => vec![feature],
            Severity::Alert => {
                let phase = match origin {
                    Some(o) => self.store.enclosing(o, TaskKind::Phase)?,
                    None => None,
                };
                let phase = match phase {
                    Some(p) => Some(p),
                    None => self.store.current_phase(feature)?,
                };
                vec![phase.unwrap_or(feature)]
            }
        };
        self.raise_on(feature, category, description, origin, &targets)
    }

    /// Raise an algedonic signal against explicit targets, e.g. one
    /// decomposed scope group.
    pub fn raise_on(
        &self,
        feature: TaskId,
        category: Category,
        description: &str,
        origin: Option<TaskId>,
        targets: &[TaskId],
    ) -> EngineResult<TaskId> {
        let severity = category.severity();
        let signal = self.create_signal(
            format!("{}({}): {}", severity, category, truncate(description)),
            description,
            SignalKind::Algedonic(category),
            feature,
            origin,
            targets,
        )?;

        match severity {
            Severity::Halt => {
                let reason = format!("HALT({}): {}", category, description);
                self.bus.broadcast_stop(&reason)?;
                error!(signal = %signal, feature = %feature, category = %category, description, "HALT raised");
            }
            Severity::Alert => {
                warn!(signal = %signal, targets = ?targets, category = %category, description, "ALERT raised");
            }
        }
        Ok(signal)
    }

    /// Mark a signal completed, unblocking exactly what it was blocking.
    pub fn resolve(&self, signal: TaskId, note: &str) -> EngineResult<ResolvedSignal> {
        let (_, kind) = self.load_signal(signal)?;
        self.close(signal, kind, TaskPatch::new().meta("note", note), "resolved", json!({"note": note}))
    }

    fn close(
        &self,
        signal: TaskId,
        kind: SignalKind,
        patch: TaskPatch,
        event: &str,
        detail: Value,
    ) -> EngineResult<ResolvedSignal> {
        let unblocked = self.store.dependents(signal)?;
        self.store
            .update(signal, patch.status(TaskStatus::Completed))?;
        self.store.log_signal_event(signal, event, detail)?;
        info!(signal = %signal, unblocked = ?unblocked, event, "signal closed");
        Ok(ResolvedSignal {
            signal,
            kind,
            unblocked,
        })
    }

    /// Override a HALT with an explicit risk statement. The override applies
    /// to this signal only; a recurrence needs a new HALT.
    pub fn override_halt(&self, signal: TaskId, statement: HaltOverride) -> EngineResult<ResolvedSignal> {
        let (_, kind) = self.load_signal(signal)?;
        if kind.severity() != Some(Severity::Halt) {
            return Err(EngineError::InvalidOverride(format!(
                "signal {} is not a HALT",
                signal
            )));
        }
        if let Some(part) = statement.missing_part() {
            return Err(EngineError::InvalidOverride(format!(
                "override must state {}",
                part
            )));
        }
        let detail = serde_json::to_value(&statement)?;
        warn!(signal = %signal, accepted_by = %statement.accepted_by, risk = %statement.risk, "HALT overridden");
        self.close(
            signal,
            kind,
            TaskPatch::new().meta("overridden", true).meta("override", detail.clone()),
            "overridden",
            detail,
        )
    }

    /// Apply the authority's ALERT decision. `Investigate` keeps the signal
    /// open; `Continue` and `Stop` resolve it.
    pub fn decide_alert(
        &self,
        signal: TaskId,
        decision: AlertDecision,
    ) -> EngineResult<Option<ResolvedSignal>> {
        let kind = self.require_open_alert(signal)?;
        match decision {
            AlertDecision::Investigate => {
                self.store
                    .update(signal, TaskPatch::new().meta("investigating", true))?;
                self.store
                    .log_signal_event(signal, "investigating", json!({}))?;
                info!(signal = %signal, "ALERT under investigation");
                Ok(None)
            }
            AlertDecision::Continue | AlertDecision::Stop => {
                let label = if decision == AlertDecision::Stop { "stop" } else { "continue" };
                self.close(
                    signal,
                    kind,
                    TaskPatch::new().meta("decision", label),
                    "decided",
                    json!({"decision": label}),
                )
                .map(Some)
            }
        }
    }

    /// Fail unless `signal` is an ALERT that is still open.
    pub fn require_open_alert(&self, signal: TaskId) -> EngineResult<SignalKind> {
        let (_, kind) = self.load_signal(signal)?;
        if kind.severity() != Some(Severity::Alert) {
            return Err(EngineError::WrongKind {
                id: signal,
                expected: "ALERT",
            });
        }
        Ok(kind)
    }

    /// Close every open signal of a stopped feature except `keep`. Their
    /// targets are already closed, so nothing is left for them to hold.
    pub fn withdraw_open(&self, feature: TaskId, keep: TaskId, reason: &str) -> EngineResult<Vec<TaskId>> {
        let mut withdrawn = Vec::new();
        for signal in self.open_signals(Some(feature))? {
            if signal.id == keep {
                continue;
            }
            let Some(kind) = SignalKind::of(&signal) else {
                continue;
            };
            self.close(
                signal.id,
                kind,
                TaskPatch::new().meta("withdrawn", true).meta("reason", reason),
                "withdrawn",
                json!({"reason": reason}),
            )?;
            withdrawn.push(signal.id);
        }
        if !withdrawn.is_empty() {
            info!(feature = %feature, signals = ?withdrawn, reason, "open signals withdrawn");
        }
        Ok(withdrawn)
    }

    /// Open signals, optionally for one feature, oldest first.
    pub fn open_signals(&self, feature: Option<TaskId>) -> EngineResult<Vec<Task>> {
        let signals = self
            .store
            .list(&TaskFilter::all().kind(TaskKind::Signal))?;
        Ok(signals
            .into_iter()
            .filter(|s| !s.is_completed())
            .filter(|s| feature.is_none_or(|f| meta_task_id(s, "feature") == Some(f)))
            .collect())
    }
}

fn meta_task_id(task: &Task, key: &str) -> Option<TaskId> {
    task.metadata
        .get(key)
        .and_then(Value::as_i64)
        .map(TaskId)
}

fn truncate(text: &str) -> String {
    const MAX: usize = 60;
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= MAX {
        line.to_string()
    } else {
        let cut: String = line.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}
