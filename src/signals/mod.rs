//! Signal Router and the signal vocabulary.
//!
//! - `<progress>50%</progress>`, `<blocker>..</blocker>`, `<halt category=..>`
//!   and `<alert category=..>` tags in worker output are parsed by [`parser`].
//! - Blockers are triaged; algedonic HALT/ALERT signals bypass triage.

mod parser;
mod router;
mod triage;
mod types;

pub use parser::extract_signals;
pub use router::{ResolvedSignal, SignalRouter};
pub use triage::{
    AlertDecision, HaltOverride, Resolution, TRIAGE_ESCALATION_THRESHOLD, TriageOutcome,
    TriageVerdict,
};
pub use types::{
    AlgedonicSignal, BlockerSignal, Category, ProgressSignal, Severity, SignalKind, SignalOrigin,
    WorkerSignals,
};
