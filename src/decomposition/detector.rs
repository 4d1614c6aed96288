//! Decomposition signals and scoring.
//!
//! Each strong signal adds 2, each supporting signal 1, each counter-signal
//! subtracts 1; the score never drops below 0. A decomposition is proposed
//! at or above [`DECOMPOSITION_THRESHOLD`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::decomposition::config::{DECOMPOSITION_THRESHOLD, DecompositionConfig};
use crate::decomposition::parser::{ScopeAnalysis, is_test_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weight {
    Strong,
    Supporting,
    Counter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecompositionSignal {
    DistinctDomains,
    LargeDeliverableSet,
    IndependentInterfaces,
    ParallelTestSuites,
    SeparableWorkstreams,
    TightCoupling,
    SmallChange,
}

impl DecompositionSignal {
    pub const ALL: [DecompositionSignal; 7] = [
        Self::DistinctDomains,
        Self::LargeDeliverableSet,
        Self::IndependentInterfaces,
        Self::ParallelTestSuites,
        Self::SeparableWorkstreams,
        Self::TightCoupling,
        Self::SmallChange,
    ];

    pub fn weight(self) -> Weight {
        match self {
            Self::DistinctDomains | Self::LargeDeliverableSet | Self::IndependentInterfaces => {
                Weight::Strong
            }
            Self::ParallelTestSuites | Self::SeparableWorkstreams => Weight::Supporting,
            Self::TightCoupling | Self::SmallChange => Weight::Counter,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DistinctDomains => "distinct-domains",
            Self::LargeDeliverableSet => "large-deliverable-set",
            Self::IndependentInterfaces => "independent-interfaces",
            Self::ParallelTestSuites => "parallel-test-suites",
            Self::SeparableWorkstreams => "separable-workstreams",
            Self::TightCoupling => "tight-coupling",
            Self::SmallChange => "small-change",
        }
    }

    pub fn strong() -> impl Iterator<Item = DecompositionSignal> {
        Self::ALL.into_iter().filter(|s| s.weight() == Weight::Strong)
    }
}

impl fmt::Display for DecompositionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecompositionSignal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|sig| sig.as_str() == normalized)
            .ok_or_else(|| anyhow::anyhow!("Unknown decomposition signal '{}'", s))
    }
}

/// Score a set of fired signals.
pub fn score(fired: &BTreeSet<DecompositionSignal>) -> u32 {
    let total: i32 = fired
        .iter()
        .map(|s| match s.weight() {
            Weight::Strong => 2,
            Weight::Supporting => 1,
            Weight::Counter => -1,
        })
        .sum();
    total.max(0) as u32
}

pub fn meets_threshold(score: u32) -> bool {
    score >= DECOMPOSITION_THRESHOLD
}

/// Whether a proposal needs external approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Confirmed,
    Autonomous,
}

/// Autonomous only when enabled, every strong signal fired and no
/// counter-signal is present.
pub fn tier(fired: &BTreeSet<DecompositionSignal>, autonomous_enabled: bool) -> Tier {
    let all_strong = DecompositionSignal::strong().all(|s| fired.contains(&s));
    let any_counter = fired.iter().any(|s| s.weight() == Weight::Counter);
    if autonomous_enabled && all_strong && !any_counter {
        Tier::Autonomous
    } else {
        Tier::Confirmed
    }
}

/// Evaluate the fixed signal set against the first phase's output.
pub fn detect(analysis: &ScopeAnalysis, config: &DecompositionConfig) -> BTreeSet<DecompositionSignal> {
    let mut fired = analysis.declared.clone();
    let paths = analysis.paths();

    let mut per_scope: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for d in &analysis.deliverables {
        per_scope.entry(d.scope()).or_default().push(d.path.as_str());
    }
    let scope_count = per_scope.len();

    if scope_count >= 2 {
        fired.insert(DecompositionSignal::DistinctDomains);
    }
    if paths.len() >= config.large_deliverable_count {
        fired.insert(DecompositionSignal::LargeDeliverableSet);
    }
    if paths.len() < config.small_change_max {
        fired.insert(DecompositionSignal::SmallChange);
    }

    // Cross-scope edges between distinct scopes, ignoring direction.
    let mut edges: BTreeSet<(String, String)> = BTreeSet::new();
    for r in &analysis.references {
        let (from, to) = (analysis.scope_of(&r.from), analysis.scope_of(&r.to));
        if from != to {
            edges.insert((from, to));
        }
    }
    let mutual = edges.iter().any(|(a, b)| edges.contains(&(b.clone(), a.clone())));
    if mutual {
        fired.insert(DecompositionSignal::TightCoupling);
    } else if scope_count >= 2 {
        fired.insert(DecompositionSignal::IndependentInterfaces);
    }

    let scopes_with_tests = per_scope
        .values()
        .filter(|files| files.iter().any(|p| is_test_path(p)))
        .count();
    if scopes_with_tests >= 2 {
        fired.insert(DecompositionSignal::ParallelTestSuites);
    }

    let substantial = per_scope.values().filter(|files| files.len() >= 2).count();
    if substantial >= 2 {
        fired.insert(DecompositionSignal::SeparableWorkstreams);
    }

    fired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Handoff;
    use super::DecompositionSignal::*;

    fn set(signals: &[DecompositionSignal]) -> BTreeSet<DecompositionSignal> {
        signals.iter().copied().collect()
    }

    #[test]
    fn test_two_strong_one_counter_meets_threshold_confirmed() {
        let fired = set(&[DistinctDomains, IndependentInterfaces, SmallChange]);
        assert_eq!(score(&fired), 3);
        assert!(meets_threshold(score(&fired)));
        assert_eq!(tier(&fired, true), Tier::Confirmed);
    }

    #[test]
    fn test_score_floor_is_zero() {
        assert_eq!(score(&set(&[TightCoupling, SmallChange])), 0);
        assert_eq!(score(&set(&[ParallelTestSuites, TightCoupling, SmallChange])), 0);
        assert_eq!(score(&BTreeSet::new()), 0);
    }

    #[test]
    fn test_supporting_signals_alone_below_threshold() {
        let fired = set(&[ParallelTestSuites, SeparableWorkstreams]);
        assert_eq!(score(&fired), 2);
        assert!(!meets_threshold(score(&fired)));
    }

    #[test]
    fn test_autonomous_requires_all_strong_and_opt_in() {
        let all_strong = set(&[DistinctDomains, LargeDeliverableSet, IndependentInterfaces]);
        assert_eq!(tier(&all_strong, true), Tier::Autonomous);
        assert_eq!(tier(&all_strong, false), Tier::Confirmed);

        let missing_one = set(&[DistinctDomains, LargeDeliverableSet, ParallelTestSuites]);
        assert_eq!(tier(&missing_one, true), Tier::Confirmed);
    }

    #[test]
    fn test_signal_parsing() {
        assert_eq!("tight_coupling".parse::<DecompositionSignal>().unwrap(), TightCoupling);
        assert_eq!("Distinct-Domains".parse::<DecompositionSignal>().unwrap(), DistinctDomains);
        assert!("vibes".parse::<DecompositionSignal>().is_err());
    }

    #[test]
    fn test_detect_independent_domains() {
        let handoff = Handoff::new()
            .artifact("src/api/routes.rs")
            .artifact("src/api/tests/routes.rs")
            .artifact("src/web/app.tsx")
            .artifact("src/web/app.test.tsx")
            .integration_point("src/web/app.tsx -> src/api/routes.rs (ApiClient)");
        let analysis = ScopeAnalysis::from_handoff(&handoff);
        let fired = detect(&analysis, &DecompositionConfig::default());

        assert!(fired.contains(&DistinctDomains));
        assert!(fired.contains(&IndependentInterfaces));
        assert!(fired.contains(&ParallelTestSuites));
        assert!(fired.contains(&SeparableWorkstreams));
        assert!(!fired.contains(&TightCoupling));
        assert!(!fired.contains(&SmallChange));
        assert_eq!(score(&fired), 6);
    }

    #[test]
    fn test_detect_mutual_references_as_coupling() {
        let handoff = Handoff::new()
            .artifact("api/a.rs")
            .artifact("web/b.ts")
            .integration_point("api/a.rs -> web/b.ts (Hook)")
            .integration_point("web/b.ts -> api/a.rs (Client)");
        let fired = detect(
            &ScopeAnalysis::from_handoff(&handoff),
            &DecompositionConfig::default(),
        );
        assert!(fired.contains(&TightCoupling));
        assert!(fired.contains(&SmallChange));
        assert!(!fired.contains(&IndependentInterfaces));
        // distinct domains (+2) minus coupling and small change
        assert_eq!(score(&fired), 0);
    }
}
