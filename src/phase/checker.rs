//! Skip decisions at phase entry.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::pool::Handoff;
use crate::store::Task;

/// Markers that make an artifact count as unfinished.
pub const INCOMPLETENESS_MARKERS: &[&str] = &["TODO", "TBD", "FIXME", "[INCOMPLETE]", "XXX"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipDecision {
    Run,
    Skip { reason: String },
}

impl SkipDecision {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            reason: reason.into(),
        }
    }
}

/// Decides whether a phase's required inputs are already satisfied.
#[async_trait]
pub trait CompletenessChecker: Send + Sync {
    /// `upstream` is the merged handoff of the preceding phase, if any.
    async fn check(&self, phase: &Task, upstream: Option<&Handoff>) -> Result<SkipDecision>;
}

/// Never skips.
pub struct AlwaysRun;

#[async_trait]
impl CompletenessChecker for AlwaysRun {
    async fn check(&self, _phase: &Task, _upstream: Option<&Handoff>) -> Result<SkipDecision> {
        Ok(SkipDecision::Run)
    }
}

/// Skips a phase when every artifact registered for it exists under `root`
/// and none carries an incompleteness marker.
pub struct ArtifactChecker {
    root: PathBuf,
    artifacts: HashMap<String, Vec<PathBuf>>,
}

impl ArtifactChecker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            artifacts: HashMap::new(),
        }
    }

    pub fn require(mut self, phase: &str, artifact: impl Into<PathBuf>) -> Self {
        self.artifacts
            .entry(phase.to_string())
            .or_default()
            .push(artifact.into());
        self
    }
}

#[async_trait]
impl CompletenessChecker for ArtifactChecker {
    async fn check(&self, phase: &Task, upstream: Option<&Handoff>) -> Result<SkipDecision> {
        let name = phase.meta_str("phase").unwrap_or(&phase.subject);
        let Some(required) = self.artifacts.get(name) else {
            return Ok(SkipDecision::Run);
        };
        if let Some(handoff) = upstream
            && !handoff.open_questions.is_empty()
        {
            return Ok(SkipDecision::Run);
        }

        for artifact in required {
            let path = self.root.join(artifact);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(SkipDecision::Run);
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read artifact {}", path.display()))?;
            if INCOMPLETENESS_MARKERS.iter().any(|m| content.contains(m)) {
                return Ok(SkipDecision::Run);
            }
        }
        Ok(SkipDecision::skip(format!(
            "artifacts already complete: {}",
            required
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewTask, TaskKind, TaskStore};

    fn phase_task(store: &TaskStore, name: &str) -> Task {
        let id = store
            .create(NewTask::new(TaskKind::Phase, name, "").with_meta("phase", name))
            .unwrap();
        store.get(id).unwrap()
    }

    #[tokio::test]
    async fn test_artifact_checker_skips_complete_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plan.md"), "# Plan\nAll settled.\n").unwrap();
        let store = TaskStore::open_in_memory().unwrap();
        let checker = ArtifactChecker::new(dir.path()).require("plan", "plan.md");

        let decision = checker.check(&phase_task(&store, "plan"), None).await.unwrap();
        assert!(matches!(decision, SkipDecision::Skip { reason } if reason.contains("plan.md")));
    }

    #[tokio::test]
    async fn test_artifact_checker_runs_on_marker_or_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plan.md"), "# Plan\nTBD: storage layout\n").unwrap();
        let store = TaskStore::open_in_memory().unwrap();

        let marked = ArtifactChecker::new(dir.path()).require("plan", "plan.md");
        assert_eq!(
            marked.check(&phase_task(&store, "plan"), None).await.unwrap(),
            SkipDecision::Run
        );

        let missing = ArtifactChecker::new(dir.path()).require("plan", "missing.md");
        assert_eq!(
            missing.check(&phase_task(&store, "plan"), None).await.unwrap(),
            SkipDecision::Run
        );
    }

    #[tokio::test]
    async fn test_open_questions_upstream_force_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plan.md"), "done").unwrap();
        let store = TaskStore::open_in_memory().unwrap();
        let checker = ArtifactChecker::new(dir.path()).require("plan", "plan.md");
        let upstream = Handoff::new().open_question("Which auth provider?");

        let decision = checker
            .check(&phase_task(&store, "plan"), Some(&upstream))
            .await
            .unwrap();
        assert_eq!(decision, SkipDecision::Run);
    }

    #[tokio::test]
    async fn test_unregistered_phase_runs() {
        let store = TaskStore::open_in_memory().unwrap();
        let checker = ArtifactChecker::new("/nonexistent");
        assert_eq!(
            checker.check(&phase_task(&store, "review"), None).await.unwrap(),
            SkipDecision::Run
        );
        assert_eq!(
            AlwaysRun.check(&phase_task(&store, "review"), None).await.unwrap(),
            SkipDecision::Run
        );
    }
}
