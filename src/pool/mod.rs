//! Worker Pool Manager.
//!
//! Workers are tokio tasks running an [`ExecutionCapability`] chosen from a
//! [`CapabilityRegistry`] by the task's capability tag. The pool owns their
//! lifecycle; the engine drives it through `fill` and `poll`.

mod handoff;
mod manager;
mod registry;
mod resources;
mod worker;

pub use handoff::{HANDOFF_KEY, Handoff, Priority, Uncertainty};
pub use manager::{
    MAX_STALL_DISPATCHES, PoolConfig, PoolEvent, Replacement, RetireOutcome, WorkerPool,
    lineage_summary,
};
pub use registry::{CapabilityRegistry, ExecutionCapability};
pub use resources::{conflicts, overlapping};
pub use worker::{ProgressReporter, WorkerContext, WorkerHandle, WorkerId, WorkerState};
