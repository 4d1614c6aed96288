//! Task API commands and the ready-set view.

use anyhow::Result;
use console::style;

use phasegraph::engine_config::PhasegraphConfig;
use phasegraph::resolver::DependencyResolver;
use phasegraph::store::{NewTask, Task, TaskFilter, TaskKind, TaskPatch};

use super::super::TaskCommands;
use super::{open_engine, open_store, parse_meta};

pub fn cmd_task(config: &PhasegraphConfig, command: TaskCommands) -> Result<()> {
    let engine = open_engine(config)?;

    match command {
        TaskCommands::Create {
            subject,
            description,
            parent,
            blocked_by,
            meta,
            scope,
            files,
            capability,
        } => {
            let mut new = NewTask::new(TaskKind::Work, subject, description)
                .with_blocked_by(blocked_by)
                .with_metadata(parse_meta(&meta)?)
                .with_file_scope(files);
            if let Some(parent) = parent {
                new = new.with_parent(parent);
            }
            if let Some(scope) = scope {
                new = new.with_scope(scope);
            }
            if let Some(capability) = capability {
                new = new.with_capability(capability);
            }
            let id = engine.task_create(new)?;
            println!("{}", id);
        }
        TaskCommands::Update {
            id,
            status,
            meta,
            owner,
            add_blocked_by,
        } => {
            let mut patch = TaskPatch::new();
            if let Some(status) = status {
                patch = patch.status(status);
            }
            if !meta.is_empty() {
                patch = patch.metadata(parse_meta(&meta)?);
            }
            if let Some(owner) = owner {
                patch = patch.owner(Some(owner));
            }
            for blocker in add_blocked_by {
                patch = patch.add_blocked_by(blocker);
            }
            let task = engine.task_update(id, patch)?;
            println!("Updated {} [{}]", task.id, task.status);
        }
        TaskCommands::Get { id } => {
            let task = engine.task_get(id)?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::List {
            status,
            kind,
            parent,
            scope,
            owner,
            json,
        } => {
            let mut filter = TaskFilter::all();
            if let Some(status) = status {
                filter = filter.status(status);
            }
            if let Some(kind) = kind {
                filter = filter.kind(kind);
            }
            if let Some(parent) = parent {
                filter = filter.parent(parent);
            }
            if let Some(scope) = scope {
                filter = filter.scope(scope);
            }
            if let Some(owner) = owner {
                filter = filter.owner(owner);
            }
            let tasks = engine.task_list(&filter)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("No tasks.");
            } else {
                print_table(&tasks);
            }
        }
    }

    Ok(())
}

pub fn cmd_ready(config: &PhasegraphConfig, scope: Option<&str>, waves: bool) -> Result<()> {
    let store = open_store(config)?;
    let resolver = DependencyResolver::new(store.clone());

    if waves {
        let waves = resolver.waves(scope)?;
        if waves.is_empty() {
            println!("Nothing remaining.");
        }
        for (index, wave) in waves.iter().enumerate() {
            let ids: Vec<String> = wave.iter().map(ToString::to_string).collect();
            println!("Wave {}: {}", index, ids.join(" "));
        }
        return Ok(());
    }

    let ready = resolver.ready_set(scope)?;
    if ready.is_empty() {
        println!("No ready tasks.");
        return Ok(());
    }
    let tasks = ready
        .ids
        .iter()
        .map(|id| store.get(*id))
        .collect::<Result<Vec<_>, _>>()?;
    print_table(&tasks);
    Ok(())
}

fn print_table(tasks: &[Task]) {
    println!(
        "{:<6} {:<8} {:<12} {:<12} Subject",
        "ID", "Kind", "Status", "Blocked by"
    );
    println!("{}", "-".repeat(60));
    for task in tasks {
        let blockers: Vec<String> = task.blocked_by.iter().map(ToString::to_string).collect();
        println!(
            "{:<6} {:<8} {:<12} {:<12} {}",
            task.id.to_string(),
            task.kind.as_str(),
            task.status.as_str(),
            blockers.join(","),
            task.subject
        );
        if let Some(scope) = &task.scope_id {
            println!("{:<6} {}", "", style(format!("scope: {}", scope)).dim());
        }
    }
}
