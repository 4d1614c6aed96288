//! Signal commands: the decisions an external authority makes.

use anyhow::Result;
use console::style;

use phasegraph::engine_config::PhasegraphConfig;
use phasegraph::signals::{HaltOverride, Resolution, ResolvedSignal, SignalKind, TriageVerdict};

use super::super::SignalCommands;
use super::{open_engine, open_store};

pub fn cmd_signal(config: &PhasegraphConfig, command: SignalCommands) -> Result<()> {
    match command {
        SignalCommands::Raise {
            feature,
            category,
            description,
            origin,
        } => {
            let engine = open_engine(config)?;
            let id = engine.raise_algedonic(feature, category, &description, origin)?;
            println!("Raised {} {} ({})", category.severity(), id, category.as_str());
        }
        SignalCommands::Blocker { task, description } => {
            let engine = open_engine(config)?;
            let id = engine.report_blocker(task, &description)?;
            println!("Reported blocker {} on {}", id, task);
        }
        SignalCommands::Triage {
            blocker,
            unresolved,
            redo_prior_phase,
            needs_help,
            note,
        } => {
            let mut engine = open_engine(config)?;
            let verdict = if unresolved {
                TriageVerdict::unresolved(note)
            } else {
                TriageVerdict::resolved(Resolution::from_answers(redo_prior_phase, needs_help))
            };
            let outcome = engine.triage(blocker, verdict)?;
            match outcome.resolution {
                Some(resolution) => println!("Resolved {}: {}", blocker, resolution.as_str()),
                None => println!(
                    "Unresolved triage cycles: {}",
                    outcome.unresolved_cycles
                ),
            }
            if let Some(alert) = outcome.escalated {
                println!("Escalated to ALERT {} (meta-block)", alert);
            }
        }
        SignalCommands::Resolve { signal, note } => {
            let mut engine = open_engine(config)?;
            let resolved = engine.resolve(signal, &note)?;
            print_resolved(&resolved);
        }
        SignalCommands::Override {
            signal,
            risk,
            justification,
            accepted_by,
        } => {
            let mut engine = open_engine(config)?;
            let resolved = engine.override_halt(
                signal,
                HaltOverride {
                    risk,
                    justification,
                    accepted_by,
                },
            )?;
            print_resolved(&resolved);
        }
        SignalCommands::Decide { signal, decision } => {
            let mut engine = open_engine(config)?;
            match engine.decide_alert(signal, decision)? {
                Some(resolved) => print_resolved(&resolved),
                None => println!("{} stays open for investigation", signal),
            }
        }
        SignalCommands::List { feature } => {
            let engine = open_engine(config)?;
            let signals = engine.open_signals(feature)?;
            if signals.is_empty() {
                println!("No open signals.");
                return Ok(());
            }
            println!("{:<6} {:<18} {:<8} Description", "ID", "Kind", "Status");
            println!("{}", "-".repeat(56));
            for signal in signals {
                let kind = match SignalKind::of(&signal) {
                    Some(SignalKind::Blocker) => "blocker".to_string(),
                    Some(SignalKind::Algedonic(category)) => category.as_str().to_string(),
                    None => "unknown".to_string(),
                };
                println!(
                    "{:<6} {:<18} {:<8} {}",
                    signal.id.to_string(),
                    kind,
                    signal.status.as_str(),
                    signal.description
                );
            }
        }
        SignalCommands::Log { signal } => {
            let store = open_store(config)?;
            let entries = store.signal_log(signal)?;
            if entries.is_empty() {
                println!("No signal events.");
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{} {:<6} {:<12} {}",
                    style(entry.at.format("%Y-%m-%d %H:%M:%S")).dim(),
                    entry.signal_id.to_string(),
                    entry.event,
                    entry.detail
                );
            }
        }
    }

    Ok(())
}

fn print_resolved(resolved: &ResolvedSignal) {
    println!("Resolved {}", resolved.signal);
    if !resolved.unblocked.is_empty() {
        let ids: Vec<String> = resolved.unblocked.iter().map(ToString::to_string).collect();
        println!("Unblocked: {}", ids.join(" "));
    }
}
