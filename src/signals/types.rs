//! Signal types: severity/category tags for algedonic signals and the
//! structured tags workers can emit inline in their output.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Task, TaskId};

/// Algedonic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Blocks the entire feature and stops every worker
    Halt,
    /// Blocks the current phase
    Alert,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Halt => "halt",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "halt" => Ok(Self::Halt),
            "alert" => Ok(Self::Alert),
            _ => anyhow::bail!("Invalid severity '{}'. Valid values: halt, alert", s),
        }
    }
}

/// Algedonic category. Each category belongs to exactly one severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Security,
    DataIntegrity,
    Ethics,
    Quality,
    Scope,
    MetaBlock,
}

impl Category {
    pub fn severity(self) -> Severity {
        match self {
            Self::Security | Self::DataIntegrity | Self::Ethics => Severity::Halt,
            Self::Quality | Self::Scope | Self::MetaBlock => Severity::Alert,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::DataIntegrity => "data-integrity",
            Self::Ethics => "ethics",
            Self::Quality => "quality",
            Self::Scope => "scope",
            Self::MetaBlock => "meta-block",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "security" => Ok(Self::Security),
            "data-integrity" | "data" => Ok(Self::DataIntegrity),
            "ethics" => Ok(Self::Ethics),
            "quality" => Ok(Self::Quality),
            "scope" => Ok(Self::Scope),
            "meta-block" | "metablock" => Ok(Self::MetaBlock),
            _ => anyhow::bail!(
                "Invalid category '{}'. Valid values: security, data-integrity, ethics, quality, scope, meta-block",
                s
            ),
        }
    }
}

/// What a signal task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "signal", content = "category")]
pub enum SignalKind {
    Blocker,
    Algedonic(Category),
}

impl SignalKind {
    /// Read the signal kind back from a stored signal task.
    pub fn of(task: &Task) -> Option<Self> {
        match task.meta_str("signal")? {
            "blocker" => Some(Self::Blocker),
            "algedonic" => task
                .meta_str("category")
                .and_then(|c| c.parse().ok())
                .map(Self::Algedonic),
            _ => None,
        }
    }

    pub fn severity(self) -> Option<Severity> {
        match self {
            Self::Blocker => None,
            Self::Algedonic(c) => Some(c.severity()),
        }
    }
}

/// Where a signal was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalOrigin {
    pub feature: TaskId,
    /// Reporting task (worker task or phase), if any
    pub task: Option<TaskId>,
}

/// A `<progress>` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSignal {
    /// The percentage value (0-100)
    pub percentage: u8,
    pub timestamp: DateTime<Utc>,
    pub raw_value: String,
}

impl ProgressSignal {
    pub fn new(percentage: u8, raw_value: impl Into<String>) -> Self {
        Self {
            percentage,
            timestamp: Utc::now(),
            raw_value: raw_value.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.percentage >= 100
    }
}

/// A `<blocker>` tag: the worker cannot proceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockerSignal {
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl BlockerSignal {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A `<halt category=..>` or `<alert category=..>` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgedonicSignal {
    pub category: Category,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl AlgedonicSignal {
    pub fn new(category: Category, description: impl Into<String>) -> Self {
        Self {
            category,
            description: description.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn severity(&self) -> Severity {
        self.category.severity()
    }
}

/// Everything extracted from one chunk of worker output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSignals {
    pub progress: Vec<ProgressSignal>,
    pub blockers: Vec<BlockerSignal>,
    pub algedonic: Vec<AlgedonicSignal>,
    /// Paths from `<touched>` tags
    pub touched: Vec<String>,
}

impl WorkerSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_signals(&self) -> bool {
        !self.progress.is_empty()
            || !self.blockers.is_empty()
            || !self.algedonic.is_empty()
            || !self.touched.is_empty()
    }

    pub fn latest_progress(&self) -> Option<u8> {
        self.progress.last().map(|p| p.percentage)
    }

    pub fn has_halt(&self) -> bool {
        self.algedonic.iter().any(|a| a.severity() == Severity::Halt)
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(p) = self.latest_progress() {
            parts.push(format!("progress: {}%", p));
        }
        if !self.blockers.is_empty() {
            parts.push(format!("blockers: {}", self.blockers.len()));
        }
        if !self.algedonic.is_empty() {
            parts.push(format!("algedonic: {}", self.algedonic.len()));
        }
        if !self.touched.is_empty() {
            parts.push(format!("touched: {}", self.touched.len()));
        }
        if parts.is_empty() {
            "no signals".to_string()
        } else {
            parts.join(", ")
        }
    }
}
