//! Phase State Machine, feature templates and skip decisions.

mod checker;
mod machine;
mod template;

pub use checker::{AlwaysRun, ArtifactChecker, CompletenessChecker, INCOMPLETENESS_MARKERS, SkipDecision};
pub use machine::{FeatureHandle, PHASE_KEY, PhaseEntry, PhaseMachine, PhaseTransition};
pub use template::{FeatureTemplate, PhaseSpec, WorkSpec};
