//! Blocker triage vocabulary.

use serde::{Deserialize, Serialize};

/// Consecutive unresolved triage cycles on one feature that force an
/// ALERT(meta-block). Not configurable.
pub const TRIAGE_ESCALATION_THRESHOLD: u32 = 3;

/// Metadata key on the feature task holding the unresolved-cycle counter.
pub const TRIAGE_COUNTER_KEY: &str = "triage_unresolved";

/// How a blocker was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Redo an earlier phase with the current workers
    RedoSolo,
    /// Redo an earlier phase and bring in more workers
    RedoWithHelp,
    /// Stay in the current phase with more workers
    ProceedWithHelp,
    /// Clarify and continue
    NotBlocked,
}

impl Resolution {
    /// Map the two triage questions onto a resolution:
    /// should an earlier phase be redone, and are more workers needed?
    pub fn from_answers(redo_prior_phase: bool, needs_help: bool) -> Self {
        match (redo_prior_phase, needs_help) {
            (true, false) => Self::RedoSolo,
            (true, true) => Self::RedoWithHelp,
            (false, true) => Self::ProceedWithHelp,
            (false, false) => Self::NotBlocked,
        }
    }

    pub fn redoes_prior_phase(self) -> bool {
        matches!(self, Self::RedoSolo | Self::RedoWithHelp)
    }

    pub fn adds_workers(self) -> bool {
        matches!(self, Self::RedoWithHelp | Self::ProceedWithHelp)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RedoSolo => "redo-solo",
            Self::RedoWithHelp => "redo-with-help",
            Self::ProceedWithHelp => "proceed-with-help",
            Self::NotBlocked => "not-blocked",
        }
    }
}

/// Result of one triage cycle, supplied by the decision authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum TriageVerdict {
    Resolved {
        resolution: Resolution,
        #[serde(default)]
        note: String,
    },
    Unresolved {
        #[serde(default)]
        note: String,
    },
}

impl TriageVerdict {
    pub fn resolved(resolution: Resolution) -> Self {
        Self::Resolved {
            resolution,
            note: String::new(),
        }
    }

    pub fn unresolved(note: impl Into<String>) -> Self {
        Self::Unresolved { note: note.into() }
    }
}

/// What a triage cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageOutcome {
    pub resolution: Option<Resolution>,
    /// Counter value after this cycle
    pub unresolved_cycles: u32,
    /// ALERT(meta-block) raised by this cycle, if the threshold was reached
    pub escalated: Option<crate::store::TaskId>,
}

/// ALERT decisions available to the external authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertDecision {
    Continue,
    Investigate,
    Stop,
}

impl std::str::FromStr for AlertDecision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "investigate" => Ok(Self::Investigate),
            "stop" => Ok(Self::Stop),
            _ => anyhow::bail!(
                "Invalid ALERT decision '{}'. Valid values: continue, investigate, stop",
                s
            ),
        }
    }
}

/// Affirmative statement required to override a HALT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltOverride {
    /// The specific risk being accepted
    pub risk: String,
    /// Why proceeding is acceptable
    pub justification: String,
    /// Who accepts responsibility
    pub accepted_by: String,
}

impl HaltOverride {
    /// Every part must be present; returns the first missing one.
    pub fn missing_part(&self) -> Option<&'static str> {
        if self.risk.trim().is_empty() {
            Some("the specific risk")
        } else if self.justification.trim().is_empty() {
            Some("why proceeding is acceptable")
        } else if self.accepted_by.trim().is_empty() {
            Some("who accepts responsibility")
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_from_answers() {
        assert_eq!(Resolution::from_answers(true, false), Resolution::RedoSolo);
        assert_eq!(Resolution::from_answers(true, true), Resolution::RedoWithHelp);
        assert_eq!(Resolution::from_answers(false, true), Resolution::ProceedWithHelp);
        assert_eq!(Resolution::from_answers(false, false), Resolution::NotBlocked);
        assert!(Resolution::RedoWithHelp.redoes_prior_phase());
        assert!(!Resolution::NotBlocked.adds_workers());
    }

    #[test]
    fn test_override_requires_every_part() {
        let mut o = HaltOverride {
            risk: "API key in fixture".into(),
            justification: "key is a revoked test key".into(),
            accepted_by: "alice".into(),
        };
        assert_eq!(o.missing_part(), None);
        o.justification = "  ".into();
        assert_eq!(o.missing_part(), Some("why proceeding is acceptable"));
    }

    #[test]
    fn test_verdict_serialization() {
        let json = serde_json::to_string(&TriageVerdict::resolved(Resolution::RedoSolo)).unwrap();
        assert!(json.contains("\"verdict\":\"resolved\""));
        assert!(json.contains("redo-solo"));
    }
}
