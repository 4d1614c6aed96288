//! Configuration for scope decomposition.

use serde::{Deserialize, Serialize};

/// Decomposition is proposed at or above this score.
pub const DECOMPOSITION_THRESHOLD: u32 = 3;

/// Sub-scopes run at depth 1 and may not decompose again.
pub const MAX_DECOMPOSITION_DEPTH: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionConfig {
    pub enabled: bool,
    /// Opt-in: proceed without confirmation when every strong signal fired
    /// and no counter-signal is present.
    pub autonomous: bool,
    /// Deliverable count at which the deliverable set counts as large.
    pub large_deliverable_count: usize,
    /// Deliverable count below which the change counts as small.
    pub small_change_max: usize,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            autonomous: false,
            large_deliverable_count: 8,
            small_change_max: 3,
        }
    }
}

impl DecompositionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn set_autonomous(mut self, autonomous: bool) -> Self {
        self.autonomous = autonomous;
        self
    }

    pub fn set_large_deliverable_count(mut self, count: usize) -> Self {
        self.large_deliverable_count = count;
        self
    }

    /// Problems with the configured values.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.large_deliverable_count == 0 {
            warnings.push("decomposition.large_deliverable_count must be at least 1".to_string());
        }
        if self.small_change_max >= self.large_deliverable_count {
            warnings.push(format!(
                "decomposition.small_change_max ({}) should be below large_deliverable_count ({})",
                self.small_change_max, self.large_deliverable_count
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DecompositionConfig::default();
        assert!(config.enabled);
        assert!(!config.autonomous);
        assert!(config.validate().is_empty());
        assert!(!DecompositionConfig::disabled().enabled);
    }

    #[test]
    fn test_validate_flags_inverted_bounds() {
        let config = DecompositionConfig::default().set_large_deliverable_count(2);
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("small_change_max"));
    }
}
