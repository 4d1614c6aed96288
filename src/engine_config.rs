//! Configuration for phasegraph.
//!
//! Settings are read from `.phasegraph/phasegraph.toml` and layered
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! max_parallel = 4
//! stall_timeout_secs = 300
//! poll_interval_ms = 250
//!
//! [decomposition]
//! enabled = true
//! autonomous = false
//! large_deliverable_count = 8
//! small_change_max = 3
//!
//! [store]
//! path = "state.db"
//!
//! [logging]
//! format = "pretty"
//! file = false
//! ```
//!
//! Environment overrides: `PHASEGRAPH_MAX_PARALLEL`,
//! `PHASEGRAPH_STALL_TIMEOUT_SECS`, `PHASEGRAPH_POLL_INTERVAL_MS`,
//! `PHASEGRAPH_AUTONOMOUS`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::decomposition::DecompositionConfig;
use crate::engine::EngineSettings;
use crate::pool::PoolConfig;

/// Directory under the project root holding config, state and logs.
pub const STATE_DIR: &str = ".phasegraph";
pub const CONFIG_FILE: &str = "phasegraph.toml";

pub const ENV_MAX_PARALLEL: &str = "PHASEGRAPH_MAX_PARALLEL";
pub const ENV_STALL_TIMEOUT_SECS: &str = "PHASEGRAPH_STALL_TIMEOUT_SECS";
pub const ENV_POLL_INTERVAL_MS: &str = "PHASEGRAPH_POLL_INTERVAL_MS";
pub const ENV_AUTONOMOUS: &str = "PHASEGRAPH_AUTONOMOUS";

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Upper bound on concurrently running workers
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Seconds without progress before a worker counts as stalled
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// Driver loop poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_parallel() -> usize {
    4
}

fn default_stall_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            stall_timeout_secs: default_stall_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Decomposition configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionSection {
    #[serde(default = "default_decomposition_enabled")]
    pub enabled: bool,
    /// Opt-in autonomous tier
    #[serde(default)]
    pub autonomous: bool,
    #[serde(default = "default_large_deliverable_count")]
    pub large_deliverable_count: usize,
    #[serde(default = "default_small_change_max")]
    pub small_change_max: usize,
}

fn default_decomposition_enabled() -> bool {
    true
}

fn default_large_deliverable_count() -> usize {
    8
}

fn default_small_change_max() -> usize {
    3
}

impl Default for DecompositionSection {
    fn default() -> Self {
        Self {
            enabled: default_decomposition_enabled(),
            autonomous: false,
            large_deliverable_count: default_large_deliverable_count(),
            small_change_max: default_small_change_max(),
        }
    }
}

impl DecompositionSection {
    pub fn to_decomposition_config(&self) -> DecompositionConfig {
        DecompositionConfig {
            enabled: self.enabled,
            autonomous: self.autonomous,
            large_deliverable_count: self.large_deliverable_count,
            small_change_max: self.small_change_max,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Database file, relative to the state directory
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("state.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Also write a daily-rolling log file under `.phasegraph/logs`
    #[serde(default)]
    pub file: bool,
}

/// The complete phasegraph.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasegraphToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub decomposition: DecompositionSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl PhasegraphToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse phasegraph.toml")
    }

    /// Load `<state_dir>/phasegraph.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize phasegraph.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.engine.max_parallel == 0 {
            warnings.push("engine.max_parallel is 0; at least one worker always runs".to_string());
        }
        if self.engine.stall_timeout_secs == 0 {
            warnings.push("engine.stall_timeout_secs is 0; every worker would stall immediately".to_string());
        }
        if self.engine.poll_interval_ms == 0 {
            warnings.push("engine.poll_interval_ms is 0; the driver loop would spin".to_string());
        }
        warnings.extend(self.decomposition.to_decomposition_config().validate());
        if self.store.path.as_os_str().is_empty() {
            warnings.push("store.path is empty".to_string());
        }
        warnings
    }
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Resolved configuration: phasegraph.toml, environment, CLI.
#[derive(Debug, Clone)]
pub struct PhasegraphConfig {
    pub project_dir: PathBuf,
    /// `<project>/.phasegraph`
    pub state_dir: PathBuf,
    pub toml: PhasegraphToml,
    /// CLI override: verbose logging
    pub verbose: bool,
    /// CLI override: JSON logs regardless of the file setting
    pub json_logs: bool,
    /// CLI override for max_parallel
    pub cli_max_parallel: Option<usize>,
}

impl PhasegraphConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let toml = PhasegraphToml::load_or_default(&state_dir)?;
        Ok(Self {
            project_dir,
            state_dir,
            toml,
            verbose: false,
            json_logs: false,
            cli_max_parallel: None,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        json_logs: bool,
        max_parallel: Option<usize>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.json_logs = json_logs;
        config.cli_max_parallel = max_parallel;
        Ok(config)
    }

    /// CLI → env → file.
    pub fn max_parallel(&self) -> usize {
        self.cli_max_parallel
            .or_else(|| env_value(ENV_MAX_PARALLEL))
            .unwrap_or(self.toml.engine.max_parallel)
    }

    /// env → file.
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(env_value(ENV_STALL_TIMEOUT_SECS).unwrap_or(self.toml.engine.stall_timeout_secs))
    }

    /// env → file.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(env_value(ENV_POLL_INTERVAL_MS).unwrap_or(self.toml.engine.poll_interval_ms))
    }

    /// env → file.
    pub fn autonomous(&self) -> bool {
        env_value(ENV_AUTONOMOUS).unwrap_or(self.toml.decomposition.autonomous)
    }

    pub fn log_format(&self) -> LogFormat {
        if self.json_logs {
            LogFormat::Json
        } else {
            self.toml.logging.format
        }
    }

    pub fn decomposition_config(&self) -> DecompositionConfig {
        self.toml
            .decomposition
            .to_decomposition_config()
            .set_autonomous(self.autonomous())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_max_parallel(self.max_parallel())
            .with_stall_timeout(self.stall_timeout())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            pool: self.pool_config(),
            poll_interval: self.poll_interval(),
            decomposition: self.decomposition_config(),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn store_path(&self) -> PathBuf {
        self.state_dir.join(&self.toml.store.path)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Optional feature template (JSON); the canonical template otherwise.
    pub fn template_file(&self) -> PathBuf {
        self.state_dir.join("template.json")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
