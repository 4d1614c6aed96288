use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info};

use super::graph::{EdgeMap, cycle_members, would_create_cycle};
use super::task::{NewTask, Task, TaskFilter, TaskId, TaskKind, TaskPatch, TaskStatus};
use crate::errors::{EngineError, EngineResult};

/// One row of the append-only signal log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalLogEntry {
    pub id: i64,
    pub signal_id: TaskId,
    pub event: String,
    pub detail: Value,
    pub at: DateTime<Utc>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    revision: watch::Sender<u64>,
}

/// Durable task graph.
///
/// Every write runs inside a single SQLite transaction behind one connection
/// mutex, so readers never observe a partially applied patch. Each committed
/// write bumps the store revision, which the resolver and driver loops use to
/// detect stale views.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<StoreInner>,
}

impl TaskStore {
    /// Open (or create) a store at the given path and run migrations.
    pub fn open(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn)?;
        store.verify_integrity()?;
        info!(path = %path.display(), "task store opened");
        Ok(store)
    }

    /// Create an in-memory store (for tests and nested dry runs).
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&conn)?;
        let (revision, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                revision,
            }),
        })
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.inner
            .conn
            .lock()
            .map_err(|e| EngineError::Storage(anyhow::anyhow!("store lock poisoned: {}", e)))
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> EngineResult<T>) -> EngineResult<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> EngineResult<T>) -> EngineResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        drop(conn);
        self.inner.revision.send_modify(|r| *r += 1);
        Ok(out)
    }

    /// Monotonic counter bumped by every committed write.
    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }

    /// Subscribe to revision changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Create a task. Fails with `NotFound` for unknown parents/blockers and
    /// with `Cycle` if the edges would make the graph cyclic. A task may
    /// start `pending` or `completed`; `in_progress` is only reachable
    /// through `claim` or a later update, so nothing skips the claim.
    pub fn create(&self, new: NewTask) -> EngineResult<TaskId> {
        let kind = new.kind;
        let subject = new.subject.clone();
        let id = self.write(|tx| insert_task(tx, new))?;

        debug!(task = %id, kind = %kind, subject = %subject, "task created");
        Ok(id)
    }

    /// Create a task and add it to the `blocked_by` of every target in the
    /// same transaction. Fails with `Closed` before writing anything if a
    /// target is already completed.
    pub fn create_holding(&self, new: NewTask, targets: &[TaskId]) -> EngineResult<TaskId> {
        let kind = new.kind;
        let id = self.write(|tx| {
            for target in targets {
                if load_task(tx, *target)?.is_completed() {
                    return Err(EngineError::Closed { id: *target });
                }
            }
            let id = insert_task(tx, new)?;
            let mut edges = load_edges(tx)?;
            for target in targets {
                insert_edge(tx, &mut edges, *target, id)?;
            }
            Ok(id)
        })?;

        debug!(task = %id, kind = %kind, targets = ?targets, "holding task created");
        Ok(id)
    }

    /// Apply a patch atomically and return the updated task.
    pub fn update(&self, id: TaskId, patch: TaskPatch) -> EngineResult<Task> {
        let status_change = patch.status;
        let task = self.write(|tx| {
            let current = load_task(tx, id)?;

            if current.is_completed() && !patch.is_empty() {
                return Err(EngineError::Closed { id });
            }
            if let Some(next) = patch.status
                && !current.status.can_advance_to(next)
            {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: current.status,
                    to: next,
                });
            }

            if !patch.add_blocked_by.is_empty() {
                let mut edges = load_edges(tx)?;
                for blocker in &patch.add_blocked_by {
                    ensure_exists(tx, *blocker)?;
                    if current.blocked_by.contains(blocker) {
                        continue;
                    }
                    insert_edge(tx, &mut edges, id, *blocker)?;
                }
            }

            if patch.status == Some(TaskStatus::Completed)
                && let Some(by) = held_by_signal(tx, id)?
            {
                return Err(EngineError::Blocked { id, by });
            }

            let mut metadata = current.metadata.clone();
            if let Some(changes) = patch.metadata {
                merge_metadata(&mut metadata, changes);
            }
            let owner = patch.owner.unwrap_or(current.owner);
            let status = patch.status.unwrap_or(current.status);

            tx.execute(
                "UPDATE tasks SET status = ?2, owner = ?3, metadata = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    id.0,
                    status.as_str(),
                    owner,
                    serde_json::to_string(&metadata)?,
                    Utc::now().to_rfc3339(),
                ],
            )?;

            load_task(tx, id)
        })?;

        if let Some(status) = status_change {
            debug!(task = %id, status = %status, "task updated");
        }
        Ok(task)
    }

    /// Compare-and-swap `pending -> in_progress` with a new owner.
    /// Returns `false` if the task was no longer pending.
    pub fn claim(&self, id: TaskId, owner: &str) -> EngineResult<bool> {
        self.write(|tx| {
            let changed = tx.execute(
                "UPDATE tasks SET status = 'in_progress', owner = ?2, updated_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id.0, owner, Utc::now().to_rfc3339()],
            )?;
            if changed == 0 {
                ensure_exists(tx, id)?;
            }
            Ok(changed > 0)
        })
    }

    /// Complete every open task in `ids` with `{stopped: true, reason}` in
    /// one transaction. Unlike `update`, this ignores unresolved signals
    /// holding the tasks: it is how an authority ends work early. Returns
    /// the ids that were still open.
    pub fn close_stopped(&self, ids: &[TaskId], reason: &str) -> EngineResult<Vec<TaskId>> {
        self.write(|tx| {
            let now = Utc::now().to_rfc3339();
            let mut closed = Vec::new();
            for id in ids {
                let task = load_task(tx, *id)?;
                if task.is_completed() {
                    continue;
                }
                let mut metadata = task.metadata;
                metadata.insert("stopped".to_string(), Value::Bool(true));
                metadata.insert("reason".to_string(), Value::String(reason.to_string()));
                tx.execute(
                    "UPDATE tasks SET status = 'completed', metadata = ?2, updated_at = ?3
                     WHERE id = ?1",
                    params![id.0, serde_json::to_string(&metadata)?, now],
                )?;
                closed.push(*id);
            }
            Ok(closed)
        })
    }

    pub fn get(&self, id: TaskId) -> EngineResult<Task> {
        self.read(|conn| load_task(conn, id))
    }

    /// List tasks matching a filter in ascending creation order.
    pub fn list(&self, filter: &TaskFilter) -> EngineResult<Vec<Task>> {
        self.read(|conn| {
            let mut clauses: Vec<&str> = Vec::new();
            let mut values: Vec<SqlValue> = Vec::new();

            if let Some(status) = filter.status {
                clauses.push("status = ?");
                values.push(SqlValue::Text(status.as_str().to_string()));
            }
            if let Some(kind) = filter.kind {
                clauses.push("kind = ?");
                values.push(SqlValue::Text(kind.as_str().to_string()));
            }
            if let Some(parent) = filter.parent {
                clauses.push("parent = ?");
                values.push(SqlValue::Integer(parent.0));
            }
            if let Some(ref scope) = filter.scope_id {
                clauses.push("scope_id = ?");
                values.push(SqlValue::Text(scope.clone()));
            }
            if let Some(ref owner) = filter.owner {
                clauses.push("owner = ?");
                values.push(SqlValue::Text(owner.clone()));
            }

            let mut sql = String::from("SELECT * FROM tasks");
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY id ASC");

            let mut stmt = conn.prepare(&sql)?;
            let mut tasks = stmt
                .query_map(params_from_iter(values), parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let edges = load_edges(conn)?;
            for task in &mut tasks {
                if let Some(blockers) = edges.get(&task.id) {
                    task.blocked_by = blockers.clone();
                }
            }
            Ok(tasks)
        })
    }

    /// Tasks that list `id` in their `blocked_by`.
    pub fn dependents(&self, id: TaskId) -> EngineResult<Vec<TaskId>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT task_id FROM task_edges WHERE blocker_id = ?1 ORDER BY task_id")?;
            let ids = stmt
                .query_map(params![id.0], |row| row.get::<_, i64>(0).map(TaskId))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Parent chain from the immediate parent up to the root.
    pub fn ancestors(&self, id: TaskId) -> EngineResult<Vec<TaskId>> {
        self.read(|conn| ancestors_of(conn, id))
    }

    /// Every task transitively contained by `id` (not including `id`).
    pub fn descendants(&self, id: TaskId) -> EngineResult<Vec<TaskId>> {
        self.read(|conn| {
            ensure_exists(conn, id)?;
            let mut out = Vec::new();
            let mut queue = VecDeque::from([id]);
            let mut stmt = conn.prepare("SELECT id FROM tasks WHERE parent = ?1 ORDER BY id")?;
            while let Some(node) = queue.pop_front() {
                let children = stmt
                    .query_map(params![node.0], |row| row.get::<_, i64>(0).map(TaskId))?
                    .collect::<Result<Vec<_>, _>>()?;
                for child in children {
                    out.push(child);
                    queue.push_back(child);
                }
            }
            Ok(out)
        })
    }

    /// Nearest task of `kind` among `id` itself and its ancestors.
    pub fn enclosing(&self, id: TaskId, kind: TaskKind) -> EngineResult<Option<TaskId>> {
        self.read(|conn| {
            for node in std::iter::once(id).chain(ancestors_of(conn, id)?) {
                let found: String =
                    conn.query_row("SELECT kind FROM tasks WHERE id = ?1", params![node.0], |row| row.get(0))?;
                if found == kind.as_str() {
                    return Ok(Some(node));
                }
            }
            Ok(None)
        })
    }

    /// The feature's active phase: the first in-progress phase, else the
    /// first pending one, in creation order.
    pub fn current_phase(&self, feature: TaskId) -> EngineResult<Option<TaskId>> {
        let phases = self.list(&TaskFilter::all().parent(feature).kind(TaskKind::Phase))?;
        Ok(phases
            .iter()
            .find(|p| p.status == TaskStatus::InProgress)
            .or_else(|| phases.iter().find(|p| p.status == TaskStatus::Pending))
            .map(|p| p.id))
    }

    /// The first unresolved signal holding `id` or one of its ancestors.
    pub fn held_by(&self, id: TaskId) -> EngineResult<Option<TaskId>> {
        self.read(|conn| {
            ensure_exists(conn, id)?;
            held_by_signal(conn, id)
        })
    }

    /// Mark every task under a completed feature as archived.
    /// This is the only write allowed on completed tasks.
    pub fn archive_feature(&self, feature: TaskId) -> EngineResult<usize> {
        let descendants = self.descendants(feature)?;
        let count = self.write(|tx| {
            let root = load_task(tx, feature)?;
            if root.kind != TaskKind::Feature {
                return Err(EngineError::WrongKind {
                    id: feature,
                    expected: "feature",
                });
            }
            if !root.is_completed() {
                return Err(EngineError::InvalidTransition {
                    id: feature,
                    from: root.status,
                    to: TaskStatus::Completed,
                });
            }

            let now = Utc::now().to_rfc3339();
            let mut count = 0;
            for id in std::iter::once(feature).chain(descendants) {
                let mut task = load_task(tx, id)?;
                task.metadata.insert("archived".to_string(), Value::Bool(true));
                tx.execute(
                    "UPDATE tasks SET metadata = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id.0, serde_json::to_string(&task.metadata)?, now],
                )?;
                count += 1;
            }
            Ok(count)
        })?;
        info!(feature = %feature, tasks = count, "feature archived");
        Ok(count)
    }

    /// Append an event to the durable signal log.
    pub fn log_signal_event(&self, signal: TaskId, event: &str, detail: Value) -> EngineResult<()> {
        self.write(|tx| {
            ensure_exists(tx, signal)?;
            tx.execute(
                "INSERT INTO signal_log (signal_id, event, detail, at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    signal.0,
                    event,
                    serde_json::to_string(&detail)?,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    /// Read the signal log, optionally restricted to one signal.
    pub fn signal_log(&self, signal: Option<TaskId>) -> EngineResult<Vec<SignalLogEntry>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, signal_id, event, detail, at FROM signal_log
                 WHERE (?1 IS NULL OR signal_id = ?1) ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![signal.map(|s| s.0)], |row| {
                    let detail: String = row.get(3)?;
                    let at: String = row.get(4)?;
                    Ok(SignalLogEntry {
                        id: row.get(0)?,
                        signal_id: TaskId(row.get(1)?),
                        event: row.get(2)?,
                        detail: serde_json::from_str(&detail).unwrap_or(Value::Null),
                        at: parse_timestamp(&at, 4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Reject a store whose persisted edges contain a cycle.
    pub fn verify_integrity(&self) -> EngineResult<()> {
        let members = self.read(|conn| Ok(cycle_members(&load_edges(conn)?)))?;
        if members.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Storage(anyhow::anyhow!(
                "persisted graph contains a cycle through {:?}",
                members
            )))
        }
    }
}

fn run_migrations(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            kind TEXT NOT NULL DEFAULT 'work',
            owner TEXT,
            parent INTEGER REFERENCES tasks(id),
            metadata TEXT NOT NULL DEFAULT '{}',
            scope_id TEXT,
            file_scope TEXT NOT NULL DEFAULT '[]',
            capability TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS task_edges (
            task_id INTEGER NOT NULL REFERENCES tasks(id),
            blocker_id INTEGER NOT NULL REFERENCES tasks(id),
            PRIMARY KEY (task_id, blocker_id)
        );

        CREATE TABLE IF NOT EXISTS signal_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            signal_id INTEGER NOT NULL REFERENCES tasks(id),
            event TEXT NOT NULL,
            detail TEXT NOT NULL DEFAULT '{}',
            at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_edges_blocker ON task_edges(blocker_id);
        CREATE INDEX IF NOT EXISTS idx_signal_log_signal ON signal_log(signal_id);
        ",
    )?;
    Ok(())
}

fn conversion_error(idx: usize, err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn parse_timestamp(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e.into()))
}

fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let kind: String = row.get("kind")?;
    let metadata: String = row.get("metadata")?;
    let file_scope: String = row.get("file_scope")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Task {
        id: TaskId(row.get("id")?),
        subject: row.get("subject")?,
        description: row.get("description")?,
        status: status.parse().map_err(|e| conversion_error(3, e))?,
        kind: kind.parse().map_err(|e| conversion_error(4, e))?,
        owner: row.get("owner")?,
        parent: row.get::<_, Option<i64>>("parent")?.map(TaskId),
        blocked_by: BTreeSet::new(),
        metadata: serde_json::from_str::<Map<String, Value>>(&metadata).unwrap_or_default(),
        scope_id: row.get("scope_id")?,
        file_scope: serde_json::from_str(&file_scope).unwrap_or_default(),
        capability: row.get("capability")?,
        created_at: parse_timestamp(&created_at, 11)?,
        updated_at: parse_timestamp(&updated_at, 12)?,
    })
}

fn insert_task(tx: &Transaction<'_>, new: NewTask) -> EngineResult<TaskId> {
    if new.status == TaskStatus::InProgress {
        return Err(EngineError::InitialStatus {
            subject: new.subject,
            status: new.status,
        });
    }
    if let Some(parent) = new.parent {
        ensure_exists(tx, parent)?;
    }
    for blocker in &new.blocked_by {
        ensure_exists(tx, *blocker)?;
    }

    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO tasks (subject, description, status, kind, parent, metadata,
                            scope_id, file_scope, capability, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            new.subject,
            new.description,
            new.status.as_str(),
            new.kind.as_str(),
            new.parent.map(|p| p.0),
            serde_json::to_string(&new.metadata)?,
            new.scope_id,
            serde_json::to_string(&new.file_scope)?,
            new.capability,
            now,
        ],
    )?;
    let id = TaskId(tx.last_insert_rowid());

    let mut edges = load_edges(tx)?;
    for blocker in new.blocked_by {
        insert_edge(tx, &mut edges, id, blocker)?;
    }
    if new.status == TaskStatus::Completed
        && let Some(by) = held_by_signal(tx, id)?
    {
        return Err(EngineError::Blocked { id, by });
    }
    Ok(id)
}

fn ensure_exists(conn: &Connection, id: TaskId) -> EngineResult<()> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM tasks WHERE id = ?1", params![id.0], |row| row.get(0))
        .optional()?;
    found.map(|_| ()).ok_or(EngineError::NotFound { id })
}

fn load_task(conn: &Connection, id: TaskId) -> EngineResult<Task> {
    let mut task = conn
        .query_row("SELECT * FROM tasks WHERE id = ?1", params![id.0], parse_task_row)
        .optional()?
        .ok_or(EngineError::NotFound { id })?;

    let mut stmt = conn.prepare("SELECT blocker_id FROM task_edges WHERE task_id = ?1")?;
    task.blocked_by = stmt
        .query_map(params![id.0], |row| row.get::<_, i64>(0).map(TaskId))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(task)
}

fn load_edges(conn: &Connection) -> EngineResult<EdgeMap> {
    let mut stmt = conn.prepare("SELECT task_id, blocker_id FROM task_edges")?;
    let mut edges = EdgeMap::new();
    let rows = stmt.query_map([], |row| {
        Ok((TaskId(row.get(0)?), TaskId(row.get(1)?)))
    })?;
    for row in rows {
        let (task, blocker) = row?;
        edges.entry(task).or_default().insert(blocker);
    }
    Ok(edges)
}

fn insert_edge(tx: &Transaction<'_>, edges: &mut EdgeMap, task: TaskId, blocker: TaskId) -> EngineResult<()> {
    if would_create_cycle(edges, task, blocker) {
        return Err(EngineError::Cycle { task, via: blocker });
    }
    tx.execute(
        "INSERT OR IGNORE INTO task_edges (task_id, blocker_id) VALUES (?1, ?2)",
        params![task.0, blocker.0],
    )?;
    edges.entry(task).or_default().insert(blocker);
    Ok(())
}

fn ancestors_of(conn: &Connection, id: TaskId) -> EngineResult<Vec<TaskId>> {
    let mut out = Vec::new();
    let mut seen = HashSet::from([id]);
    let mut current = id;
    loop {
        let parent: Option<i64> = conn
            .query_row("SELECT parent FROM tasks WHERE id = ?1", params![current.0], |row| row.get(0))
            .optional()?
            .ok_or(EngineError::NotFound { id: current })?;
        match parent.map(TaskId) {
            Some(p) if seen.insert(p) => {
                out.push(p);
                current = p;
            }
            _ => break,
        }
    }
    Ok(out)
}

fn held_by_signal(conn: &Connection, id: TaskId) -> EngineResult<Option<TaskId>> {
    let mut stmt = conn.prepare(
        "SELECT e.blocker_id FROM task_edges e
         JOIN tasks b ON b.id = e.blocker_id
         WHERE e.task_id = ?1 AND b.kind = 'signal' AND b.status != 'completed'
         ORDER BY e.blocker_id LIMIT 1",
    )?;
    for node in std::iter::once(id).chain(ancestors_of(conn, id)?) {
        let found: Option<i64> = stmt.query_row(params![node.0], |row| row.get(0)).optional()?;
        if let Some(signal) = found {
            return Ok(Some(TaskId(signal)));
        }
    }
    Ok(None)
}

fn merge_metadata(target: &mut Map<String, Value>, changes: Map<String, Value>) {
    for (key, value) in changes {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn store() -> TaskStore {
        TaskStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let store = store();
        let id = store
            .create(NewTask::work("Write parser", "details").with_meta("owner_hint", "backend"))
            .unwrap();

        let task = store.get(id).unwrap();
        assert_eq!(task.subject, "Write parser");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.kind, TaskKind::Work);
        assert_eq!(task.meta_str("owner_hint"), Some("backend"));
        assert!(task.blocked_by.is_empty());
    }

    #[test]
    fn test_ids_follow_creation_order() {
        let store = store();
        let a = store.create(NewTask::work("a", "")).unwrap();
        let b = store.create(NewTask::work("b", "")).unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_unknown_references_are_not_found() {
        let store = store();
        let err = store
            .create(NewTask::work("x", "").with_blocked_by([TaskId(99)]))
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { id } if id == TaskId(99)));

        let err = store.update(TaskId(5), TaskPatch::new().meta("k", 1)).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        assert!(matches!(store.get(TaskId(5)), Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let store = store();
        let a = store.create(NewTask::work("a", "")).unwrap();
        let b = store.create(NewTask::work("b", "").with_blocked_by([a])).unwrap();
        let c = store.create(NewTask::work("c", "").with_blocked_by([b])).unwrap();
        let before = store.revision();

        let err = store
            .update(a, TaskPatch::new().add_blocked_by(c).meta("touched", true))
            .unwrap_err();
        assert!(matches!(err, EngineError::Cycle { task, via } if task == a && via == c));

        let a_task = store.get(a).unwrap();
        assert!(a_task.blocked_by.is_empty());
        assert!(!a_task.metadata.contains_key("touched"));
        assert_eq!(store.revision(), before);
        assert!(store.verify_integrity().is_ok());
    }

    #[test]
    fn test_status_is_monotonic_and_completed_is_closed() {
        let store = store();
        let id = store.create(NewTask::work("a", "")).unwrap();
        store
            .update(id, TaskPatch::new().status(TaskStatus::InProgress))
            .unwrap();

        let err = store
            .update(id, TaskPatch::new().status(TaskStatus::Pending))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        store
            .update(id, TaskPatch::new().status(TaskStatus::Completed))
            .unwrap();
        let err = store
            .update(id, TaskPatch::new().status(TaskStatus::InProgress))
            .unwrap_err();
        assert!(matches!(err, EngineError::Closed { .. }));
        assert_eq!(store.get(id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_metadata_merge_and_removal() {
        let store = store();
        let id = store
            .create(NewTask::work("a", "").with_meta("keep", 1).with_meta("drop", 2))
            .unwrap();

        let task = store
            .update(
                id,
                TaskPatch::new().meta("drop", Value::Null).meta("added", json!({"x": 1})),
            )
            .unwrap();
        assert_eq!(task.metadata.get("keep"), Some(&json!(1)));
        assert!(!task.metadata.contains_key("drop"));
        assert_eq!(task.metadata.get("added"), Some(&json!({"x": 1})));
    }

    #[test]
    fn test_claim_is_compare_and_swap() {
        let store = store();
        let id = store.create(NewTask::work("a", "")).unwrap();

        assert!(store.claim(id, "w-1").unwrap());
        assert!(!store.claim(id, "w-2").unwrap());
        let task = store.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.owner.as_deref(), Some("w-1"));

        assert!(matches!(
            store.claim(TaskId(42), "w-3"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_create_cannot_start_in_progress() {
        let store = store();
        let before = store.revision();
        let err = store
            .create(NewTask::work("a", "").with_status(TaskStatus::InProgress))
            .unwrap_err();
        assert!(matches!(err, EngineError::InitialStatus { status: TaskStatus::InProgress, .. }));
        assert!(err.is_caller_error());
        assert!(store.list(&TaskFilter::all()).unwrap().is_empty());
        assert_eq!(store.revision(), before);

        let done = store
            .create(NewTask::work("b", "").with_status(TaskStatus::Completed))
            .unwrap();
        assert!(store.get(done).unwrap().is_completed());
    }

    #[test]
    fn test_completed_start_respects_open_signals() {
        let store = store();
        let phase = store.create(NewTask::new(TaskKind::Phase, "p", "")).unwrap();
        let signal = store
            .create_holding(NewTask::new(TaskKind::Signal, "BLOCKER", ""), &[phase])
            .unwrap();
        let err = store
            .create(
                NewTask::work("w", "")
                    .with_parent(phase)
                    .with_status(TaskStatus::Completed),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Blocked { by, .. } if by == signal));
        assert_eq!(store.list(&TaskFilter::all()).unwrap().len(), 2);
    }

    #[test]
    fn test_create_holding_links_targets_in_one_write() {
        let store = store();
        let open = store.create(NewTask::work("open", "")).unwrap();
        let done = store
            .create(NewTask::work("done", "").with_status(TaskStatus::Completed))
            .unwrap();

        let before = store.list(&TaskFilter::all()).unwrap().len();
        let err = store
            .create_holding(NewTask::new(TaskKind::Signal, "BLOCKER: late", ""), &[open, done])
            .unwrap_err();
        assert!(matches!(err, EngineError::Closed { id } if id == done));
        // Nothing was written: no orphan signal, no edge on the open target
        assert_eq!(store.list(&TaskFilter::all()).unwrap().len(), before);
        assert!(store.get(open).unwrap().blocked_by.is_empty());

        let signal = store
            .create_holding(NewTask::new(TaskKind::Signal, "BLOCKER: api key", ""), &[open])
            .unwrap();
        assert!(store.get(open).unwrap().blocked_by.contains(&signal));
        assert_eq!(store.held_by(open).unwrap(), Some(signal));
    }

    #[test]
    fn test_close_stopped_ignores_holding_signals() {
        let store = store();
        let feature = store.create(NewTask::new(TaskKind::Feature, "f", "")).unwrap();
        let work = store.create(NewTask::work("w", "").with_parent(feature)).unwrap();
        let finished = store
            .create(
                NewTask::work("finished", "")
                    .with_parent(feature)
                    .with_status(TaskStatus::Completed),
            )
            .unwrap();
        let blocker = store
            .create_holding(NewTask::new(TaskKind::Signal, "BLOCKER", ""), &[work])
            .unwrap();
        assert!(matches!(
            store.update(work, TaskPatch::new().status(TaskStatus::Completed)),
            Err(EngineError::Blocked { .. })
        ));

        let closed = store
            .close_stopped(&[work, finished, feature], "stopped by authority")
            .unwrap();
        assert_eq!(closed, vec![work, feature]);
        let work = store.get(work).unwrap();
        assert!(work.is_completed());
        assert!(work.flag("stopped"));
        assert_eq!(work.meta_str("reason"), Some("stopped by authority"));
        assert!(!store.get(finished).unwrap().flag("stopped"));
        // The signal itself is untouched
        assert!(!store.get(blocker).unwrap().is_completed());
    }

    #[test]
    fn test_signal_on_ancestor_guards_completion() {
        let store = store();
        let feature = store.create(NewTask::new(TaskKind::Feature, "f", "")).unwrap();
        let phase = store
            .create(NewTask::new(TaskKind::Phase, "p", "").with_parent(feature))
            .unwrap();
        let work = store.create(NewTask::work("w", "").with_parent(phase)).unwrap();
        let halt = store.create(NewTask::new(TaskKind::Signal, "HALT", "")).unwrap();
        store
            .update(feature, TaskPatch::new().add_blocked_by(halt))
            .unwrap();

        assert_eq!(store.held_by(work).unwrap(), Some(halt));
        let err = store
            .update(work, TaskPatch::new().status(TaskStatus::Completed))
            .unwrap_err();
        assert!(matches!(err, EngineError::Blocked { id, by } if id == work && by == halt));

        store
            .update(halt, TaskPatch::new().status(TaskStatus::Completed))
            .unwrap();
        assert_eq!(store.held_by(work).unwrap(), None);
        store
            .update(work, TaskPatch::new().status(TaskStatus::Completed))
            .unwrap();
    }

    #[test]
    fn test_list_filters_and_relations() {
        let store = store();
        let feature = store.create(NewTask::new(TaskKind::Feature, "f", "")).unwrap();
        let a = store
            .create(NewTask::work("a", "").with_parent(feature).with_scope("api"))
            .unwrap();
        let b = store
            .create(NewTask::work("b", "").with_parent(feature).with_blocked_by([a]))
            .unwrap();

        let children = store.list(&TaskFilter::all().parent(feature)).unwrap();
        assert_eq!(children.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(children[1].blocked_by, BTreeSet::from([a]));

        let scoped = store.list(&TaskFilter::all().scope("api")).unwrap();
        assert_eq!(scoped.len(), 1);

        assert_eq!(store.dependents(a).unwrap(), vec![b]);
        assert_eq!(store.descendants(feature).unwrap(), vec![a, b]);
        assert_eq!(store.ancestors(b).unwrap(), vec![feature]);
    }

    #[test]
    fn test_archive_requires_completed_feature() {
        let store = store();
        let feature = store.create(NewTask::new(TaskKind::Feature, "f", "")).unwrap();
        let child = store.create(NewTask::work("w", "").with_parent(feature)).unwrap();
        assert!(store.archive_feature(feature).is_err());

        store
            .update(child, TaskPatch::new().status(TaskStatus::Completed))
            .unwrap();
        store
            .update(feature, TaskPatch::new().status(TaskStatus::Completed))
            .unwrap();
        assert_eq!(store.archive_feature(feature).unwrap(), 2);
        assert!(store.get(child).unwrap().flag("archived"));
    }

    #[test]
    fn test_signal_log_is_append_only() {
        let store = store();
        let signal = store.create(NewTask::new(TaskKind::Signal, "s", "")).unwrap();
        store
            .log_signal_event(signal, "raised", json!({"severity": "halt"}))
            .unwrap();
        store.log_signal_event(signal, "resolved", json!({})).unwrap();

        let log = store.signal_log(Some(signal)).unwrap();
        assert_eq!(
            log.iter().map(|e| e.event.as_str()).collect::<Vec<_>>(),
            vec!["raised", "resolved"]
        );
        assert!(store.signal_log(Some(TaskId(999))).unwrap().is_empty());
    }

    #[test]
    fn test_revision_bumps_on_write() {
        let store = store();
        let mut rx = store.subscribe();
        let before = store.revision();
        store.create(NewTask::work("a", "")).unwrap();
        assert_eq!(store.revision(), before + 1);
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_recovery_after_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");

        let (a, signal) = {
            let store = TaskStore::open(&path).unwrap();
            let a = store.create(NewTask::work("a", "")).unwrap();
            store.create(NewTask::work("b", "").with_blocked_by([a])).unwrap();
            let signal = store.create(NewTask::new(TaskKind::Signal, "s", "")).unwrap();
            store.log_signal_event(signal, "raised", json!({})).unwrap();
            (a, signal)
        };

        let reopened = TaskStore::open(&path).unwrap();
        assert_eq!(reopened.list(&TaskFilter::all()).unwrap().len(), 3);
        assert_eq!(reopened.dependents(a).unwrap().len(), 1);
        assert_eq!(reopened.signal_log(Some(signal)).unwrap().len(), 1);
    }
}
