//! Dependency Resolver.
//!
//! Computes the ready set from the Task Store on every call. Nothing is cached
//! across store mutations; a [`ReadySet`] remembers the store revision it was
//! computed at so callers can detect that it has gone stale.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::errors::EngineResult;
use crate::store::{Task, TaskFilter, TaskId, TaskKind, TaskStatus, TaskStore};

/// Pending tasks whose every blocker is completed, in ascending creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadySet {
    pub ids: Vec<TaskId>,
    /// Store revision observed before the graph was read
    pub revision: u64,
    pub scope: Option<String>,
}

impl ReadySet {
    pub fn contains(&self, id: TaskId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// True once any write has landed since this set was computed.
    pub fn is_stale(&self, store: &TaskStore) -> bool {
        store.revision() != self.revision
    }
}

#[derive(Clone)]
pub struct DependencyResolver {
    store: TaskStore,
}

impl DependencyResolver {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// All pending tasks (optionally within one scope) whose `blocked_by`
    /// entries are all completed.
    pub fn ready_set(&self, scope: Option<&str>) -> EngineResult<ReadySet> {
        let revision = self.store.revision();
        let all = self.store.list(&TaskFilter::all())?;
        let statuses = status_map(&all);

        let ids: Vec<TaskId> = all
            .iter()
            .filter(|t| scope.is_none_or(|s| t.scope_id.as_deref() == Some(s)))
            .filter(|t| is_ready(t, &statuses))
            .map(|t| t.id)
            .collect();

        trace!(revision, ready = ids.len(), ?scope, "ready set computed");
        Ok(ReadySet {
            ids,
            revision,
            scope: scope.map(str::to_string),
        })
    }

    /// Ready tasks a worker may pick up: work and retry tasks that are not
    /// held by an unresolved signal on themselves or an ancestor.
    pub fn dispatchable(&self, scope: Option<&str>) -> EngineResult<Vec<Task>> {
        let ready = self.ready_set(scope)?;
        let mut out = Vec::with_capacity(ready.len());
        for id in ready.ids {
            let task = self.store.get(id)?;
            if !matches!(task.kind, TaskKind::Work | TaskKind::Retry) {
                continue;
            }
            if self.store.held_by(id)?.is_some() {
                continue;
            }
            out.push(task);
        }
        Ok(out)
    }

    /// Blockers of `id` that are not yet completed.
    pub fn waiting_on(&self, id: TaskId) -> EngineResult<Vec<TaskId>> {
        let task = self.store.get(id)?;
        let mut waiting = Vec::new();
        for blocker in task.blocked_by {
            if !self.store.get(blocker)?.is_completed() {
                waiting.push(blocker);
            }
        }
        Ok(waiting)
    }

    /// Preview of the execution waves for the remaining (non-completed) tasks:
    /// wave N holds the tasks that become ready once waves 0..N complete.
    pub fn waves(&self, scope: Option<&str>) -> EngineResult<Vec<Vec<TaskId>>> {
        let all = self.store.list(&TaskFilter::all())?;
        let mut done: HashSet<TaskId> = all
            .iter()
            .filter(|t| t.is_completed())
            .map(|t| t.id)
            .collect();
        let remaining: Vec<&Task> = all
            .iter()
            .filter(|t| !t.is_completed())
            .filter(|t| scope.is_none_or(|s| t.scope_id.as_deref() == Some(s)))
            .collect();

        let mut waves = Vec::new();
        let mut placed: HashSet<TaskId> = HashSet::new();

        loop {
            let wave: Vec<TaskId> = remaining
                .iter()
                .filter(|t| !placed.contains(&t.id))
                .filter(|t| t.blocked_by.iter().all(|b| done.contains(b)))
                .map(|t| t.id)
                .collect();

            if wave.is_empty() {
                break;
            }

            for id in &wave {
                placed.insert(*id);
                done.insert(*id);
            }
            waves.push(wave);
        }

        Ok(waves)
    }
}

fn status_map(tasks: &[Task]) -> HashMap<TaskId, TaskStatus> {
    tasks.iter().map(|t| (t.id, t.status)).collect()
}

fn is_ready(task: &Task, statuses: &HashMap<TaskId, TaskStatus>) -> bool {
    task.status == TaskStatus::Pending
        && task
            .blocked_by
            .iter()
            .all(|b| statuses.get(b) == Some(&TaskStatus::Completed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewTask, TaskPatch};

    fn setup() -> (TaskStore, DependencyResolver) {
        let store = TaskStore::open_in_memory().unwrap();
        let resolver = DependencyResolver::new(store.clone());
        (store, resolver)
    }

    fn complete(store: &TaskStore, id: TaskId) {
        store
            .update(id, TaskPatch::new().status(TaskStatus::Completed))
            .unwrap();
    }

    #[test]
    fn test_scenario_a_phase_chain() {
        let (store, resolver) = setup();
        let feature = store.create(NewTask::new(TaskKind::Feature, "F", "")).unwrap();
        store
            .update(feature, TaskPatch::new().status(TaskStatus::InProgress))
            .unwrap();

        let mut phases = Vec::new();
        for name in ["P1", "P2", "P3", "P4"] {
            let mut new = NewTask::new(TaskKind::Phase, name, "").with_parent(feature);
            if let Some(prev) = phases.last() {
                new = new.with_blocked_by([*prev]);
            }
            phases.push(store.create(new).unwrap());
        }

        assert_eq!(resolver.ready_set(None).unwrap().ids, vec![phases[0]]);
        complete(&store, phases[0]);
        assert_eq!(resolver.ready_set(None).unwrap().ids, vec![phases[1]]);
    }

    #[test]
    fn test_ready_iff_pending_and_blockers_completed() {
        let (store, resolver) = setup();
        let a = store.create(NewTask::work("a", "")).unwrap();
        let b = store.create(NewTask::work("b", "")).unwrap();
        let c = store
            .create(NewTask::work("c", "").with_blocked_by([a, b]))
            .unwrap();

        let ready = resolver.ready_set(None).unwrap();
        assert_eq!(ready.ids, vec![a, b]);

        // In progress is not pending; c still waits on b
        store.claim(a, "w-1").unwrap();
        complete(&store, a);
        store.claim(b, "w-2").unwrap();
        let ready = resolver.ready_set(None).unwrap();
        assert!(ready.is_empty());
        assert_eq!(resolver.waiting_on(c).unwrap(), vec![b]);

        complete(&store, b);
        assert_eq!(resolver.ready_set(None).unwrap().ids, vec![c]);
    }

    #[test]
    fn test_ready_set_goes_stale_after_mutation() {
        let (store, resolver) = setup();
        let a = store.create(NewTask::work("a", "")).unwrap();
        let ready = resolver.ready_set(None).unwrap();
        assert!(!ready.is_stale(&store));

        complete(&store, a);
        assert!(ready.is_stale(&store));
        assert!(resolver.ready_set(None).unwrap().is_empty());
    }

    #[test]
    fn test_scope_filter() {
        let (store, resolver) = setup();
        let api = store.create(NewTask::work("api", "").with_scope("api")).unwrap();
        store.create(NewTask::work("web", "").with_scope("web")).unwrap();

        let ready = resolver.ready_set(Some("api")).unwrap();
        assert_eq!(ready.ids, vec![api]);
        assert_eq!(ready.scope.as_deref(), Some("api"));
    }

    #[test]
    fn test_dispatchable_skips_signals_and_held_tasks() {
        let (store, resolver) = setup();
        let feature = store.create(NewTask::new(TaskKind::Feature, "F", "")).unwrap();
        store
            .update(feature, TaskPatch::new().status(TaskStatus::InProgress))
            .unwrap();
        let work = store.create(NewTask::work("w", "").with_parent(feature)).unwrap();
        assert_eq!(
            resolver.dispatchable(None).unwrap().iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![work]
        );

        let halt = store.create(NewTask::new(TaskKind::Signal, "HALT", "")).unwrap();
        store
            .update(feature, TaskPatch::new().add_blocked_by(halt))
            .unwrap();

        // The signal itself is ready but never dispatchable; work is held.
        assert!(resolver.ready_set(None).unwrap().contains(halt));
        assert!(resolver.dispatchable(None).unwrap().is_empty());
    }

    #[test]
    fn test_waves_diamond() {
        let (store, resolver) = setup();
        let a = store.create(NewTask::work("a", "")).unwrap();
        let b = store.create(NewTask::work("b", "").with_blocked_by([a])).unwrap();
        let c = store.create(NewTask::work("c", "").with_blocked_by([a])).unwrap();
        let d = store
            .create(NewTask::work("d", "").with_blocked_by([b, c]))
            .unwrap();

        assert_eq!(
            resolver.waves(None).unwrap(),
            vec![vec![a], vec![b, c], vec![d]]
        );

        complete(&store, a);
        assert_eq!(resolver.waves(None).unwrap(), vec![vec![b, c], vec![d]]);
    }
}
