use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use phasegraph::engine_config::PhasegraphConfig;
use phasegraph::signals::{AlertDecision, Category};
use phasegraph::store::{TaskId, TaskKind, TaskStatus};

mod cmd;

#[derive(Parser)]
#[command(name = "phasegraph")]
#[command(version, about = "Dependency-aware task orchestration with phases, signals and sub-scopes")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Worker pool bound. Overrides PHASEGRAPH_MAX_PARALLEL and phasegraph.toml.
    #[arg(long, global = true)]
    pub max_parallel: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize .phasegraph/ with a default config and an empty task store
    Init {
        /// Overwrite an existing phasegraph.toml
        #[arg(long)]
        force: bool,
    },
    /// Start and inspect features
    Feature {
        #[command(subcommand)]
        command: FeatureCommands,
    },
    /// The Task API
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Show tasks that are ready to run
    Ready {
        /// Only tasks in this sub-scope
        #[arg(long)]
        scope: Option<String>,
        /// Preview the remaining execution waves
        #[arg(long)]
        waves: bool,
    },
    /// Raise, triage and decide signals
    Signal {
        #[command(subcommand)]
        command: SignalCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum FeatureCommands {
    /// Create a feature and its phase chain
    Start {
        subject: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Feature template (JSON). Defaults to .phasegraph/template.json, then the canonical phases.
        #[arg(long)]
        template: Option<PathBuf>,
    },
    /// Show a feature's phases and open signals
    Status { id: TaskId },
    /// Mark every task under a completed feature archived
    Archive { id: TaskId },
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    /// Create a task and print its id
    Create {
        subject: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(long)]
        parent: Option<TaskId>,
        /// Tasks that must complete first (comma-separated)
        #[arg(long, value_delimiter = ',')]
        blocked_by: Vec<TaskId>,
        /// Metadata entries as key=value (value parsed as JSON when possible)
        #[arg(long = "meta")]
        meta: Vec<String>,
        #[arg(long)]
        scope: Option<String>,
        /// Declared file scope (comma-separated globs)
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
        #[arg(long)]
        capability: Option<String>,
    },
    /// Patch a task
    Update {
        id: TaskId,
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long = "meta")]
        meta: Vec<String>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, value_delimiter = ',')]
        add_blocked_by: Vec<TaskId>,
    },
    /// Print one task as JSON
    Get { id: TaskId },
    /// List tasks matching a filter
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        kind: Option<TaskKind>,
        #[arg(long)]
        parent: Option<TaskId>,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long)]
        owner: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum SignalCommands {
    /// Raise a HALT or ALERT on a feature
    Raise {
        feature: TaskId,
        /// security, data-integrity, ethics (HALT); quality, scope, meta-block (ALERT)
        #[arg(long)]
        category: Category,
        description: String,
        /// Task the signal originates from
        #[arg(long)]
        origin: Option<TaskId>,
    },
    /// Report a blocker on a task
    Blocker { task: TaskId, description: String },
    /// Record one triage cycle on a blocker
    Triage {
        blocker: TaskId,
        /// The blocker could not be resolved this cycle
        #[arg(long)]
        unresolved: bool,
        /// An earlier phase must be redone
        #[arg(long)]
        redo_prior_phase: bool,
        /// More workers are needed
        #[arg(long)]
        needs_help: bool,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Resolve a signal, unblocking what it holds
    Resolve {
        signal: TaskId,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Override a HALT with an explicit risk statement
    Override {
        signal: TaskId,
        #[arg(long)]
        risk: String,
        #[arg(long)]
        justification: String,
        #[arg(long)]
        accepted_by: String,
    },
    /// Decide an ALERT: continue, investigate or stop
    Decide { signal: TaskId, decision: AlertDecision },
    /// List open signals
    List {
        #[arg(long)]
        feature: Option<TaskId>,
    },
    /// Show the signal event log
    Log {
        #[arg(long)]
        signal: Option<TaskId>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    // A missing .env is fine.
    dotenvy::from_path(project_dir.join(".env")).ok();

    let config = PhasegraphConfig::with_cli_args(project_dir, cli.verbose, cli.json_logs, cli.max_parallel)?;
    let log_dir = config.toml.logging.file.then(|| config.log_dir());
    let _guard = phasegraph::logging::init(config.log_format(), log_dir.as_deref(), config.verbose)?;

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&config, *force)?,
        Commands::Feature { command } => cmd::cmd_feature(&config, command.clone())?,
        Commands::Task { command } => cmd::cmd_task(&config, command.clone())?,
        Commands::Ready { scope, waves } => cmd::cmd_ready(&config, scope.as_deref(), *waves)?,
        Commands::Signal { command } => cmd::cmd_signal(&config, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
