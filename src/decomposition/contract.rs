//! Scope contracts and contract fulfillment records.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::decomposition::parser::ScopeAnalysis;
use crate::pool::Handoff;

/// An interface item one scope takes from another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Import {
    pub item: String,
    /// Scope expected to export it
    pub from: String,
}

/// What one sub-scope agrees to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeContract {
    pub scope_id: String,
    #[serde(default)]
    pub parent_scope: Option<String>,
    /// Files this scope owns and must deliver
    pub deliverables: Vec<String>,
    pub exports: Vec<String>,
    pub imports: Vec<Import>,
    /// Files owned by a sibling; read-only here
    pub shared_files: Vec<String>,
}

impl ScopeContract {
    pub fn describe(&self) -> String {
        format!(
            "Scope '{}': deliver {}; export [{}]; import [{}]; read-only [{}]",
            self.scope_id,
            self.deliverables.join(", "),
            self.exports.join(", "),
            self.imports
                .iter()
                .map(|i| format!("{} from {}", i.item, i.from))
                .collect::<Vec<_>>()
                .join(", "),
            self.shared_files.join(", ")
        )
    }
}

/// Partition the analysed deliverables into one contract per scope.
///
/// A file claimed by several scopes goes to the scope with the most
/// references touching it (ties go to the first scope by name); the others
/// list it under `shared_files`.
pub fn generate_contracts(analysis: &ScopeAnalysis, parent_scope: Option<&str>) -> Vec<ScopeContract> {
    let mut claims: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for d in &analysis.deliverables {
        claims.entry(d.path.clone()).or_default().insert(d.scope());
    }

    let mut owner: BTreeMap<String, String> = BTreeMap::new();
    let mut shared: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (path, scopes) in &claims {
        let winner = scopes
            .iter()
            .max_by(|a, b| {
                reference_weight(analysis, path, a)
                    .cmp(&reference_weight(analysis, path, b))
                    .then_with(|| b.cmp(a))
            })
            .cloned()
            .unwrap_or_default();
        for scope in scopes.iter().filter(|s| **s != winner) {
            shared.entry(scope.clone()).or_default().insert(path.clone());
        }
        owner.insert(path.clone(), winner);
    }

    let scope_of = |path: &str| -> String {
        owner
            .get(path)
            .cloned()
            .unwrap_or_else(|| analysis.scope_of(path))
    };

    let mut exports: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut imports: BTreeMap<String, BTreeSet<Import>> = BTreeMap::new();
    for r in &analysis.references {
        let (from, to) = (scope_of(&r.from), scope_of(&r.to));
        if from == to {
            continue;
        }
        let item = r.item_name();
        exports.entry(to.clone()).or_default().insert(item.clone());
        imports
            .entry(from)
            .or_default()
            .insert(Import { item, from: to });
    }

    let mut deliverables: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for path in analysis.paths() {
        deliverables
            .entry(scope_of(path))
            .or_default()
            .push(path.to_string());
    }

    deliverables
        .into_iter()
        .map(|(scope_id, files)| ScopeContract {
            parent_scope: parent_scope.map(str::to_string),
            deliverables: files,
            exports: exports
                .remove(&scope_id)
                .map(|e| e.into_iter().collect())
                .unwrap_or_default(),
            imports: imports
                .remove(&scope_id)
                .map(|i| i.into_iter().collect())
                .unwrap_or_default(),
            shared_files: shared
                .remove(&scope_id)
                .map(|s| s.into_iter().collect())
                .unwrap_or_default(),
            scope_id,
        })
        .collect()
}

/// References from files of `scope` that touch `path`.
fn reference_weight(analysis: &ScopeAnalysis, path: &str, scope: &str) -> usize {
    analysis
        .references
        .iter()
        .filter(|r| r.to == path || r.from == path)
        .filter(|r| {
            let other = if r.to == path { &r.from } else { &r.to };
            analysis.scope_of(other) == scope
        })
        .count()
}

/// What a sub-scope actually delivered against its contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractFulfillment {
    pub scope_id: String,
    pub delivered: Vec<String>,
    pub undelivered: Vec<String>,
    pub exports: Vec<String>,
    pub imports: Vec<String>,
    pub deviations: Vec<String>,
}

impl ContractFulfillment {
    /// Compare a sub-scope's merged handoff with its contract.
    ///
    /// Integration points of the form `exports: A, B` and `imports: C`
    /// report the actual interface; when absent the contract's interface is
    /// assumed. Decisions prefixed `deviation:` are carried over, as is any
    /// artifact the contract did not ask for.
    pub fn from_handoff(contract: &ScopeContract, handoff: &Handoff) -> Self {
        let produced: BTreeSet<&str> = handoff.artifacts.iter().map(String::as_str).collect();
        let (delivered, undelivered): (Vec<String>, Vec<String>) = contract
            .deliverables
            .iter()
            .cloned()
            .partition(|d| produced.contains(d.as_str()));

        let listed = |prefix: &str| -> Option<Vec<String>> {
            let items: Vec<String> = handoff
                .integration_points
                .iter()
                .filter_map(|p| p.trim().strip_prefix(prefix))
                .flat_map(|rest| rest.split(','))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            (!items.is_empty()).then_some(items)
        };
        let exports = listed("exports:").unwrap_or_else(|| contract.exports.clone());
        let imports = listed("imports:")
            .unwrap_or_else(|| contract.imports.iter().map(|i| i.item.clone()).collect());

        let mut deviations: Vec<String> = handoff
            .decisions
            .iter()
            .filter_map(|d| d.trim().strip_prefix("deviation:"))
            .map(|d| d.trim().to_string())
            .collect();
        let planned: BTreeSet<&str> = contract
            .deliverables
            .iter()
            .chain(contract.shared_files.iter())
            .map(String::as_str)
            .collect();
        for artifact in &handoff.artifacts {
            if !planned.contains(artifact.as_str()) {
                deviations.push(format!("unplanned artifact {}", artifact));
            }
        }

        Self {
            scope_id: contract.scope_id.clone(),
            delivered,
            undelivered,
            exports,
            imports,
            deviations,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.undelivered.is_empty()
    }
}
