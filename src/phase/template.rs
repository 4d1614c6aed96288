//! Feature templates: the ordered phases a feature moves through and the
//! work each phase starts with.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One unit of work created when its phase is entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSpec {
    pub subject: String,
    #[serde(default)]
    pub description: String,
    /// Capability tag; falls back to the phase's capability
    #[serde(default)]
    pub capability: Option<String>,
    /// Declared resources (glob patterns)
    #[serde(default)]
    pub file_scope: Vec<String>,
    /// Subjects of sibling work items in the same phase that must finish first
    #[serde(default)]
    pub after: Vec<String>,
}

impl WorkSpec {
    pub fn new(subject: &str, description: &str) -> Self {
        Self {
            subject: subject.to_string(),
            description: description.to_string(),
            capability: None,
            file_scope: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.capability = Some(capability.to_string());
        self
    }

    pub fn with_file_scope(mut self, files: &[&str]) -> Self {
        self.file_scope = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn after(mut self, subject: &str) -> Self {
        self.after.push(subject.to_string());
        self
    }
}

/// One phase of a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Default capability for this phase's work
    #[serde(default)]
    pub capability: Option<String>,
    /// Work created at entry. Empty means a single task named after the phase.
    #[serde(default)]
    pub work: Vec<WorkSpec>,
}

impl PhaseSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            capability: Some(name.to_string()),
            work: Vec::new(),
        }
    }

    pub fn with_work(mut self, work: WorkSpec) -> Self {
        self.work.push(work);
        self
    }

    /// Work to create at entry, with capabilities resolved.
    pub fn entry_work(&self) -> Vec<WorkSpec> {
        if self.work.is_empty() {
            let mut spec = WorkSpec::new(&self.name, &self.description);
            spec.capability = self.capability.clone();
            return vec![spec];
        }
        self.work
            .iter()
            .cloned()
            .map(|mut w| {
                if w.capability.is_none() {
                    w.capability = self.capability.clone();
                }
                w
            })
            .collect()
    }
}

/// Ordered phase sequence for a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTemplate {
    pub phases: Vec<PhaseSpec>,
}

impl Default for FeatureTemplate {
    fn default() -> Self {
        Self::canonical()
    }
}

impl FeatureTemplate {
    /// `prepare -> plan -> execute -> review`
    pub fn canonical() -> Self {
        Self {
            phases: vec![
                PhaseSpec::new("prepare", "Gather context and identify deliverables"),
                PhaseSpec::new("plan", "Design the change and its interfaces"),
                PhaseSpec::new("execute", "Implement the planned change"),
                PhaseSpec::new("review", "Verify the change against the plan"),
            ],
        }
    }

    pub fn new(phases: Vec<PhaseSpec>) -> Self {
        Self { phases }
    }

    /// The phases after the first one; what a decomposed sub-scope runs.
    pub fn tail(&self) -> Self {
        Self {
            phases: self.phases.iter().skip(1).cloned().collect(),
        }
    }

    /// Load a template from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template file: {}", path.display()))?;
        let template: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse template file: {}", path.display()))?;
        template.validate()?;
        Ok(template)
    }

    /// Load `path` if it exists, otherwise the canonical template.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::canonical())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            anyhow::bail!("Template must declare at least one phase");
        }
        let mut names = HashSet::new();
        for phase in &self.phases {
            if !names.insert(phase.name.as_str()) {
                anyhow::bail!("Duplicate phase name '{}'", phase.name);
            }
            let subjects: HashSet<&str> = phase.work.iter().map(|w| w.subject.as_str()).collect();
            if subjects.len() != phase.work.len() {
                anyhow::bail!("Phase '{}' has duplicate work subjects", phase.name);
            }
            for work in &phase.work {
                for dep in &work.after {
                    if !subjects.contains(dep.as_str()) {
                        anyhow::bail!(
                            "Work '{}' in phase '{}' waits on unknown work '{}'",
                            work.subject,
                            phase.name,
                            dep
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
