//! Project initialization.

use anyhow::{Context, Result};
use console::style;

use phasegraph::engine_config::{PhasegraphConfig, PhasegraphToml};
use phasegraph::store::TaskStore;

pub fn cmd_init(config: &PhasegraphConfig, force: bool) -> Result<()> {
    let state_dir = &config.state_dir;
    let was_initialized = config.store_path().exists();

    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;

    let config_path = config.config_file();
    let wrote_config = force || !config_path.exists();
    if wrote_config {
        PhasegraphToml::default().save(&config_path)?;
    }

    let store = TaskStore::open(&config.store_path())
        .with_context(|| format!("Failed to create task store: {}", config.store_path().display()))?;
    store.verify_integrity()?;

    if was_initialized {
        println!("Phasegraph project already initialized at {}", state_dir.display());
        if wrote_config {
            println!("Rewrote {}", config_path.display());
        }
        println!("Task store verified.");
        return Ok(());
    }

    println!("Initialized phasegraph project at {}", state_dir.display());
    println!();
    println!("  .phasegraph/");
    println!("  ├── phasegraph.toml  # Engine, decomposition, logging settings");
    println!("  └── {}{}", config.toml.store.path.display(), style("  # Task store").dim());
    println!();
    println!("Next steps:");
    println!("  1. Run `phasegraph feature start <subject>` to create a feature");
    println!("  2. Run `phasegraph ready` to see what can run");

    Ok(())
}
