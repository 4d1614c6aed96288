//! Structured five-part handoff returned by every execution capability.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::Task;

/// Metadata key the handoff is stored under.
pub const HANDOFF_KEY: &str = "handoff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uncertainty {
    pub priority: Priority,
    pub description: String,
}

/// What a worker hands to whoever picks up next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    /// Produced artifacts (paths, identifiers)
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    /// Kept sorted high -> low
    #[serde(default)]
    pub uncertainties: Vec<Uncertainty>,
    #[serde(default)]
    pub integration_points: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
}

impl Handoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifacts.push(artifact.into());
        self
    }

    pub fn decision(mut self, decision: impl Into<String>) -> Self {
        self.decisions.push(decision.into());
        self
    }

    pub fn uncertainty(mut self, priority: Priority, description: impl Into<String>) -> Self {
        self.uncertainties.push(Uncertainty {
            priority,
            description: description.into(),
        });
        self.uncertainties.sort_by_key(|u| u.priority);
        self
    }

    pub fn integration_point(mut self, point: impl Into<String>) -> Self {
        self.integration_points.push(point.into());
        self
    }

    pub fn open_question(mut self, question: impl Into<String>) -> Self {
        self.open_questions.push(question.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
            && self.decisions.is_empty()
            && self.uncertainties.is_empty()
            && self.integration_points.is_empty()
            && self.open_questions.is_empty()
    }

    /// Fold another handoff into this one, e.g. all work of one phase.
    pub fn merge(&mut self, other: Handoff) {
        self.artifacts.extend(other.artifacts);
        self.decisions.extend(other.decisions);
        self.uncertainties.extend(other.uncertainties);
        self.uncertainties.sort_by_key(|u| u.priority);
        self.integration_points.extend(other.integration_points);
        self.open_questions.extend(other.open_questions);
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Read the handoff a completed task left behind, if any.
    pub fn from_task(task: &Task) -> Option<Self> {
        task.metadata
            .get(HANDOFF_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
