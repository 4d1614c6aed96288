//! Reads the first phase's handoff into a [`ScopeAnalysis`].
//!
//! ## Expected Format
//!
//! Artifacts are deliverable paths, optionally claimed by a scope:
//!
//! ```text
//! src/api/routes.rs
//! frontend: src/shared/types.ts
//! ```
//!
//! Integration points describe cross-file references, optionally naming the
//! interface item:
//!
//! ```text
//! src/ui/app.tsx -> src/api/routes.rs (ApiClient)
//! ```
//!
//! Decisions may declare signals directly: `decomposition: tight-coupling`.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decomposition::detector::DecompositionSignal;
use crate::pool::Handoff;

static CLAIM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:([A-Za-z0-9_-]+):\s+)?(\S+)$").unwrap());

static REFERENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)\s*->\s*(\S+)(?:\s*\(([^)]+)\))?$").unwrap());

static DECLARED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^decomposition:\s*([a-z_-]+)$").unwrap());

/// Leading directories that group code rather than name a domain.
const CONTAINER_DIRS: &[&str] = &["src", "lib", "crates", "packages", "apps", "services"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliverable {
    pub path: String,
    /// Scope that explicitly claimed the file, if any
    pub claimed_by: Option<String>,
}

impl Deliverable {
    /// Scope the file belongs to: the explicit claim, else its domain.
    pub fn scope(&self) -> String {
        self.claimed_by
            .clone()
            .unwrap_or_else(|| domain_of(&self.path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub from: String,
    pub to: String,
    pub item: Option<String>,
}

impl Reference {
    /// Interface item name; the target path when none was given.
    pub fn item_name(&self) -> String {
        self.item.clone().unwrap_or_else(|| self.to.clone())
    }
}

/// Structured view of what the first phase found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeAnalysis {
    pub deliverables: Vec<Deliverable>,
    pub references: Vec<Reference>,
    /// Signals the worker declared from its own judgement
    pub declared: BTreeSet<DecompositionSignal>,
}

impl ScopeAnalysis {
    pub fn from_handoff(handoff: &Handoff) -> Self {
        let mut analysis = Self::default();

        for artifact in &handoff.artifacts {
            match CLAIM_RE.captures(artifact.trim()) {
                Some(caps) => analysis.deliverables.push(Deliverable {
                    path: caps[2].to_string(),
                    claimed_by: caps.get(1).map(|m| m.as_str().to_string()),
                }),
                None => debug!(artifact = %artifact, "ignoring unparseable artifact"),
            }
        }

        for point in &handoff.integration_points {
            if let Some(caps) = REFERENCE_RE.captures(point.trim()) {
                analysis.references.push(Reference {
                    from: caps[1].to_string(),
                    to: caps[2].to_string(),
                    item: caps.get(3).map(|m| m.as_str().trim().to_string()),
                });
            }
        }

        for decision in &handoff.decisions {
            if let Some(caps) = DECLARED_RE.captures(decision.trim()) {
                match caps[1].parse::<DecompositionSignal>() {
                    Ok(signal) => {
                        analysis.declared.insert(signal);
                    }
                    Err(e) => debug!(error = %e, "ignoring unknown declared signal"),
                }
            }
        }
        analysis
    }

    /// Distinct paths, first occurrence order.
    pub fn paths(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.deliverables
            .iter()
            .map(|d| d.path.as_str())
            .filter(|p| seen.insert(*p))
            .collect()
    }

    /// Scope owning `path` for reference purposes (first claim wins).
    pub fn scope_of(&self, path: &str) -> String {
        self.deliverables
            .iter()
            .find(|d| d.path == path)
            .map(Deliverable::scope)
            .unwrap_or_else(|| domain_of(path))
    }

    pub fn scopes(&self) -> BTreeSet<String> {
        self.deliverables.iter().map(Deliverable::scope).collect()
    }
}

/// Domain of a path: its first meaningful directory.
pub fn domain_of(path: &str) -> String {
    let parts: Vec<&str> = path
        .trim_start_matches("./")
        .split('/')
        .filter(|p| !p.is_empty())
        .collect();
    match parts.as_slice() {
        [container, domain, _, ..] if CONTAINER_DIRS.contains(container) => domain.to_string(),
        [dir, _, ..] => dir.to_string(),
        _ => "root".to_string(),
    }
}

pub fn is_test_path(path: &str) -> bool {
    path.split('/').any(|p| p == "tests" || p == "test" || p == "__tests__")
        || path.contains("_test.")
        || path.contains(".test.")
        || path.contains(".spec.")
}
