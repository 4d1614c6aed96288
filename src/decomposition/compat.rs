//! Cross-scope compatibility check over sibling fulfillments.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::decomposition::contract::ContractFulfillment;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompatibilityIssue {
    /// A contracted deliverable was not produced.
    Undelivered { scope_id: String, item: String },
    /// No sibling exports something this scope imports.
    UnsatisfiedImport { scope_id: String, item: String },
}

impl CompatibilityIssue {
    pub fn scope_id(&self) -> &str {
        match self {
            Self::Undelivered { scope_id, .. } | Self::UnsatisfiedImport { scope_id, .. } => scope_id,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Undelivered { scope_id, item } => {
                format!("scope '{}' did not deliver {}", scope_id, item)
            }
            Self::UnsatisfiedImport { scope_id, item } => {
                format!("scope '{}' imports {} but no sibling exports it", scope_id, item)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub issues: Vec<CompatibilityIssue>,
}

impl CompatibilityReport {
    pub fn is_compatible(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Every import must be exported by a different sibling and every
/// deliverable delivered.
pub fn check_compatibility(fulfillments: &[ContractFulfillment]) -> CompatibilityReport {
    let mut issues = Vec::new();
    for f in fulfillments {
        for item in &f.undelivered {
            issues.push(CompatibilityIssue::Undelivered {
                scope_id: f.scope_id.clone(),
                item: item.clone(),
            });
        }

        let available: BTreeSet<&str> = fulfillments
            .iter()
            .filter(|other| other.scope_id != f.scope_id)
            .flat_map(|other| other.exports.iter().map(String::as_str))
            .collect();
        for item in &f.imports {
            if !available.contains(item.as_str()) {
                issues.push(CompatibilityIssue::UnsatisfiedImport {
                    scope_id: f.scope_id.clone(),
                    item: item.clone(),
                });
            }
        }
    }
    CompatibilityReport { issues }
}
