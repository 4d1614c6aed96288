//! Typed error hierarchy for the orchestration engine.
//!
//! `EngineError` covers every synchronous failure of the Task API and the
//! components built on it. Blockers and algedonic signals are *not* errors:
//! they are signal records handled by the [`crate::signals`] router.

use crate::store::{TaskId, TaskStatus};
use thiserror::Error;

/// Result alias used throughout the engine.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Adding the requested `blocked_by` edges would make the graph cyclic.
    #[error("Cycle detected: {task} cannot be blocked by {via}")]
    Cycle { task: TaskId, via: TaskId },

    #[error("Task {id} not found")]
    NotFound { id: TaskId },

    #[error("Worker on task {task} stalled (attempt {attempt})")]
    StallTimeout { task: TaskId, attempt: u32 },

    /// Status may only advance pending -> in_progress -> completed.
    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// New tasks start pending or completed; `in_progress` needs a claim.
    #[error("Task '{subject}' cannot be created {status}; create it pending and claim it")]
    InitialStatus { subject: String, status: TaskStatus },

    /// Completed tasks are immutable audit records.
    #[error("Task {id} is completed and cannot be modified")]
    Closed { id: TaskId },

    /// The task (or an ancestor) is held by an unresolved signal.
    #[error("Task {id} is blocked by unresolved signal {by}")]
    Blocked { id: TaskId, by: TaskId },

    #[error("Phase {phase} cannot start: waiting on {waiting_on:?}")]
    PhaseOrder {
        phase: TaskId,
        waiting_on: Vec<TaskId>,
    },

    #[error("Decomposition rejected at depth {depth}: sub-scopes may not decompose further")]
    DecompositionDepth { depth: u32 },

    #[error("Invalid HALT override: {0}")]
    InvalidOverride(String),

    #[error("Task {id} is not a {expected}")]
    WrongKind { id: TaskId, expected: &'static str },

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Storage(err.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(err.into())
    }
}

impl EngineError {
    /// Graph and reference errors are caller mistakes and must never be retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Cycle { .. }
                | Self::NotFound { .. }
                | Self::InvalidTransition { .. }
                | Self::InitialStatus { .. }
                | Self::Closed { .. }
                | Self::WrongKind { .. }
                | Self::InvalidOverride(_)
        )
    }
}
