//! Task Store: the durable task graph shared by every other component.

pub mod db;
pub mod graph;
pub mod task;

pub use db::{SignalLogEntry, TaskStore};
pub use task::{NewTask, Task, TaskFilter, TaskId, TaskKind, TaskPatch, TaskStatus};
