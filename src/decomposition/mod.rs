//! Scope Decomposition Engine.
//!
//! Runs once per feature, between the first phase and the second. It
//! provides:
//!
//! - **Parsing**: reads the first phase's handoff into deliverables and
//!   cross-file references
//! - **Scoring**: a fixed set of weighted signals against a threshold of 3
//! - **Contracts**: one [`ScopeContract`] per sub-scope, each contested file
//!   owned by exactly one scope
//! - **Execution**: sub-scopes run concurrently at depth 1 in isolated
//!   workspaces, then their fulfillments are checked for compatibility
//!
//! ## Example
//!
//! ```
//! use phasegraph::decomposition::{Assessment, DecompositionConfig, ScopeAnalysis, assess};
//! use phasegraph::pool::Handoff;
//!
//! let handoff = Handoff::new()
//!     .artifact("src/api/routes.rs")
//!     .artifact("src/web/app.tsx")
//!     .integration_point("src/web/app.tsx -> src/api/routes.rs (ApiClient)");
//! let analysis = ScopeAnalysis::from_handoff(&handoff);
//!
//! match assess(&analysis, &DecompositionConfig::default(), 0, None).unwrap() {
//!     Assessment::Single { reason, .. } => println!("single scope: {}", reason),
//!     Assessment::Propose(p) => println!("{}", p.recommendation),
//! }
//! ```

mod compat;
mod config;
mod contract;
mod detector;
mod executor;
mod parser;

pub use compat::{CompatibilityIssue, CompatibilityReport, check_compatibility};
pub use config::{DECOMPOSITION_THRESHOLD, DecompositionConfig, MAX_DECOMPOSITION_DEPTH};
pub use contract::{ContractFulfillment, Import, ScopeContract, generate_contracts};
pub use detector::{DecompositionSignal, Tier, Weight, detect, meets_threshold, score, tier};
pub use executor::{
    ApproveAll, Approval, Assessment, DeclineAll, DecompositionAuthority, DecompositionProposal,
    ExecutionSummary, SCOPE_OWNER, ScopeExecutor, ScopeRun, ScopeRunner, assess, contract_of,
    is_fulfilled,
};
pub use parser::{Deliverable, Reference, ScopeAnalysis, domain_of, is_test_path};
