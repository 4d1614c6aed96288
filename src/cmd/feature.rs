//! Feature commands: start, status, archive.

use anyhow::{Context, Result, bail};
use console::style;

use phasegraph::engine_config::PhasegraphConfig;
use phasegraph::phase::FeatureTemplate;
use phasegraph::store::TaskKind;

use super::super::FeatureCommands;
use super::{open_engine, open_store};

pub fn cmd_feature(config: &PhasegraphConfig, command: FeatureCommands) -> Result<()> {
    match command {
        FeatureCommands::Start {
            subject,
            description,
            template,
        } => {
            let template = match template {
                Some(path) => FeatureTemplate::load(&path)?,
                None => FeatureTemplate::load_or_default(&config.template_file())?,
            };
            let engine = open_engine(config)?;
            let handle = engine
                .start_feature(&subject, &description, &template)
                .context("Failed to start feature")?;

            println!("Started feature {} {}", handle.feature, subject);
            for (phase, spec) in handle.phases.iter().zip(&template.phases) {
                println!("  {:<6} {}", phase.to_string(), spec.name);
            }
        }
        FeatureCommands::Status { id } => {
            let engine = open_engine(config)?;
            let feature = engine.task_get(id)?;
            if feature.kind != TaskKind::Feature {
                bail!("{} is a {} task, not a feature", id, feature.kind);
            }

            println!("{} {} [{}]", feature.id, feature.subject, feature.status);
            println!();
            println!("{:<6} {:<14} {:<12} Notes", "ID", "Phase", "Status");
            println!("{}", "-".repeat(46));
            for phase in engine.machine().phases(id)? {
                let mut notes = Vec::new();
                if phase.flag("skipped") {
                    notes.push("skipped");
                }
                if phase.flag("reentry") {
                    notes.push("reentry");
                }
                println!(
                    "{:<6} {:<14} {:<12} {}",
                    phase.id.to_string(),
                    phase.subject,
                    phase.status.as_str(),
                    style(notes.join(", ")).dim()
                );
            }

            if let Some(decision) = feature.metadata.get("decomposition") {
                println!();
                println!("Decomposition: {}", decision);
            }

            let signals = engine.open_signals(Some(id))?;
            if !signals.is_empty() {
                println!();
                println!("Open signals:");
                for signal in signals {
                    println!(
                        "  {:<6} {:<24} {}",
                        signal.id.to_string(),
                        signal.subject,
                        style(&signal.description).dim()
                    );
                }
            }
        }
        FeatureCommands::Archive { id } => {
            let store = open_store(config)?;
            let count = store.archive_feature(id)?;
            println!("Archived {} tasks under {}", count, id);
        }
    }

    Ok(())
}
