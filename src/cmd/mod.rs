//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                 |
//! |-----------|----------------------------------|
//! | `project` | `Init`                           |
//! | `feature` | `Feature`                        |
//! | `task`    | `Task`, `Ready`                  |
//! | `signal`  | `Signal`                         |
//! | `config`  | `Config`                         |

pub mod config;
pub mod feature;
pub mod project;
pub mod signal;
pub mod task;

pub use config::cmd_config;
pub use feature::cmd_feature;
pub use project::cmd_init;
pub use signal::cmd_signal;
pub use task::{cmd_ready, cmd_task};

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};

use phasegraph::engine::Engine;
use phasegraph::engine_config::PhasegraphConfig;
use phasegraph::pool::CapabilityRegistry;
use phasegraph::store::TaskStore;
use phasegraph::workspace::WorkspaceHandle;

/// Open the project's task store, failing if `init` has not run.
pub(crate) fn open_store(config: &PhasegraphConfig) -> Result<TaskStore> {
    let path = config.store_path();
    if !path.exists() {
        bail!("Not initialized. Run 'phasegraph init' first.");
    }
    TaskStore::open(&path).with_context(|| format!("Failed to open task store: {}", path.display()))
}

/// An engine over the project store with no registered capabilities.
/// Enough for the Task API and signal decisions; nothing is dispatched.
pub(crate) fn open_engine(config: &PhasegraphConfig) -> Result<Engine> {
    let store = open_store(config)?;
    Ok(Engine::new(
        store,
        CapabilityRegistry::new(),
        WorkspaceHandle::root(config.project_dir.clone()),
        config.engine_settings(),
    ))
}

/// Parse repeated `key=value` arguments. Values are read as JSON when they
/// parse, otherwise kept as strings.
pub(crate) fn parse_meta(entries: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for entry in entries {
        let Some((key, raw)) = entry.split_once('=') else {
            bail!("Invalid metadata '{}'. Expected key=value", entry);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid metadata '{}'. Key is empty", entry);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_meta_reads_json_and_strings() {
        let meta = parse_meta(&[
            "priority=3".to_string(),
            "note=needs review".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
        ])
        .unwrap();
        assert_eq!(meta["priority"], json!(3));
        assert_eq!(meta["note"], json!("needs review"));
        assert_eq!(meta["tags"], json!(["a", "b"]));
    }

    #[test]
    fn test_parse_meta_rejects_missing_equals() {
        assert!(parse_meta(&["novalue".to_string()]).is_err());
        assert!(parse_meta(&["=3".to_string()]).is_err());
    }
}
