//! Task records and the patch/filter types used by the Task API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Opaque task identifier. Ids are allocated in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches('#');
        digits
            .parse::<i64>()
            .map(TaskId)
            .map_err(|_| anyhow::anyhow!("Invalid task id '{}': expected a number like #12", s))
    }
}

/// Lifecycle status. There is deliberately no `failed` state: abnormal
/// termination is `Completed` plus descriptive metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed => 2,
        }
    }

    /// Whether `next` is a legal successor (staying put is a no-op).
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        next.rank() >= self.rank()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            _ => anyhow::bail!(
                "Invalid task status '{}'. Valid values: pending, in_progress, completed",
                s
            ),
        }
    }
}

/// What a task node represents in the workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Root container for one workflow instance
    Feature,
    /// Ordered stage under a feature
    Phase,
    /// Unit of work executed by a worker
    #[default]
    Work,
    /// Re-run of an earlier phase created by triage
    Retry,
    /// Blocker or algedonic signal
    Signal,
    /// Decomposed sub-scope of a phase
    Scope,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Phase => "phase",
            Self::Work => "work",
            Self::Retry => "retry",
            Self::Signal => "signal",
            Self::Scope => "scope",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "feature" => Ok(Self::Feature),
            "phase" => Ok(Self::Phase),
            "work" => Ok(Self::Work),
            "retry" => Ok(Self::Retry),
            "signal" => Ok(Self::Signal),
            "scope" => Ok(Self::Scope),
            _ => anyhow::bail!(
                "Invalid task kind '{}'. Valid values: feature, phase, work, retry, signal, scope",
                s
            ),
        }
    }
}

/// A node in the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub subject: String,
    pub description: String,
    pub status: TaskStatus,
    pub kind: TaskKind,
    /// Worker handle that owns the task, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Containing task (feature for phases, phase for work)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
    #[serde(default)]
    pub blocked_by: BTreeSet<TaskId>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    /// Declared resources (glob patterns) this task mutates
    #[serde(default)]
    pub file_scope: Vec<String>,
    /// Capability tag used to pick an executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Read a boolean metadata flag, treating absence as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }
}

/// Input for `TaskStore::create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub subject: String,
    pub description: String,
    pub kind: TaskKind,
    pub parent: Option<TaskId>,
    pub blocked_by: Vec<TaskId>,
    pub metadata: Map<String, Value>,
    pub scope_id: Option<String>,
    pub file_scope: Vec<String>,
    pub capability: Option<String>,
    /// Initial status: `Pending` or `Completed`. `create` rejects `InProgress`.
    pub status: TaskStatus,
}

impl NewTask {
    pub fn new(kind: TaskKind, subject: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            description: description.into(),
            kind,
            ..Default::default()
        }
    }

    pub fn work(subject: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(TaskKind::Work, subject, description)
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_blocked_by(mut self, blockers: impl IntoIterator<Item = TaskId>) -> Self {
        self.blocked_by.extend(blockers);
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_file_scope(mut self, files: Vec<String>) -> Self {
        self.file_scope = files;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}

/// Partial update for `TaskStore::update`.
///
/// Metadata is merged key by key; a `null` value removes the key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub metadata: Option<Map<String, Value>>,
    /// `Some(None)` clears the owner
    pub owner: Option<Option<String>>,
    pub add_blocked_by: Vec<TaskId>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.get_or_insert_with(Map::new).extend(metadata);
        self
    }

    pub fn owner(mut self, owner: Option<String>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn add_blocked_by(mut self, blocker: TaskId) -> Self {
        self.add_blocked_by.push(blocker);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.metadata.as_ref().is_none_or(Map::is_empty)
            && self.owner.is_none()
            && self.add_blocked_by.is_empty()
    }
}

/// Query filter for `TaskStore::list`. Unset fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub kind: Option<TaskKind>,
    pub parent: Option<TaskId>,
    pub scope_id: Option<String>,
    pub owner: Option<String>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.kind.is_none_or(|k| task.kind == k)
            && self.parent.is_none_or(|p| task.parent == Some(p))
            && self
                .scope_id
                .as_ref()
                .is_none_or(|s| task.scope_id.as_ref() == Some(s))
            && self
                .owner
                .as_ref()
                .is_none_or(|o| task.owner.as_ref() == Some(o))
    }
}
